use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::api::{
    ErrorResponse, GenerateCaptionRequest, GenerateCaptionResponse, NewJobRequest,
    VisionModelsResponse,
};
use crate::models::job::{CaptionJob, JobProgress};
use crate::models::result::PerFileResult;
use crate::services::job_state::JobError;

impl JobError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            JobError::NotFound(_) => StatusCode::NOT_FOUND,
            JobError::InvalidState(_) => StatusCode::CONFLICT,
            JobError::InvalidConfig(_) => StatusCode::UNPROCESSABLE_ENTITY,
            JobError::BackendUnavailable(_) | JobError::BackendError(_) => StatusCode::BAD_GATEWAY,
            JobError::Catalog(_) | JobError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for JobError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// POST /api/v1/caption-sets/{caption_set_id}/jobs: start auto-captioning a caption set.
///
/// The body is optional; an empty body uses the configured defaults.
pub async fn create_job(
    State(state): State<AppState>,
    Path(caption_set_id): Path<String>,
    body: Option<Json<NewJobRequest>>,
) -> Result<(StatusCode, Json<CaptionJob>), JobError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let job = state.engine.create_job(&caption_set_id, request).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /api/v1/jobs
pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<CaptionJob>> {
    Json(state.engine.list_jobs())
}

/// GET /api/v1/jobs/{job_id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<CaptionJob>, JobError> {
    Ok(Json(state.engine.get_job(job_id)?))
}

/// GET /api/v1/jobs/{job_id}/progress
pub async fn get_progress(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobProgress>, JobError> {
    Ok(Json(state.engine.job_progress(job_id)?))
}

/// GET /api/v1/jobs/{job_id}/results
pub async fn get_results(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Vec<PerFileResult>>, JobError> {
    Ok(Json(state.engine.job_results(job_id)?))
}

pub async fn pause_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<CaptionJob>, JobError> {
    Ok(Json(state.engine.pause(job_id).await?))
}

pub async fn resume_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<CaptionJob>, JobError> {
    Ok(Json(state.engine.resume(job_id).await?))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<CaptionJob>, JobError> {
    Ok(Json(state.engine.cancel(job_id).await?))
}

/// DELETE /api/v1/jobs/{job_id}: only finished jobs can be deleted.
pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<StatusCode, JobError> {
    state.engine.delete_job(job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/vision/models: models offered by the default backend.
pub async fn vision_models(
    State(state): State<AppState>,
) -> Result<Json<VisionModelsResponse>, JobError> {
    Ok(Json(state.engine.available_models().await?))
}

/// POST /api/v1/vision/generate: caption one file without starting a job.
pub async fn generate_caption(
    State(state): State<AppState>,
    Json(request): Json<GenerateCaptionRequest>,
) -> Result<Json<GenerateCaptionResponse>, JobError> {
    Ok(Json(state.engine.generate_caption(request).await?))
}
