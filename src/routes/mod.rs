pub mod health;
pub mod jobs;
pub mod metrics;

use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

/// API routes for caption jobs, vision models and health.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/api/v1/caption-sets/{caption_set_id}/jobs",
            post(jobs::create_job),
        )
        .route("/api/v1/jobs", get(jobs::list_jobs))
        .route(
            "/api/v1/jobs/{job_id}",
            get(jobs::get_job).delete(jobs::delete_job),
        )
        .route("/api/v1/jobs/{job_id}/progress", get(jobs::get_progress))
        .route("/api/v1/jobs/{job_id}/results", get(jobs::get_results))
        .route("/api/v1/jobs/{job_id}/pause", post(jobs::pause_job))
        .route("/api/v1/jobs/{job_id}/resume", post(jobs::resume_job))
        .route("/api/v1/jobs/{job_id}/cancel", post(jobs::cancel_job))
        .route("/api/v1/vision/models", get(jobs::vision_models))
        .route("/api/v1/vision/generate", post(jobs::generate_caption))
        .with_state(state)
}
