use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use garde::Validate;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::queries;
use crate::models::api::{
    GenerateCaptionRequest, GenerateCaptionResponse, NewJobRequest, VisionModelsResponse,
};
use crate::models::job::{CaptionJob, JobProgress, JobStatus};
use crate::models::result::PerFileResult;
use crate::models::settings::{
    JobSettings, PreprocessSettings, VisionBackendKind, VisionSettings,
};
use crate::services::catalog::CaptionCatalog;
use crate::services::job_state::{JobError, JobHandle, RunnerToken};
use crate::services::parser;
use crate::services::prompt::{build_prompt, finish_caption};
use crate::services::resize::{ResizeCache, ResizeError};
use crate::services::runner::JobRunner;
use crate::services::vision::{generate_with_retry, BackendProvider};

/// Vision and preprocessing defaults applied to new jobs.
#[derive(Debug, Clone)]
pub struct EngineDefaults {
    pub backend: VisionBackendKind,
    pub ollama_url: String,
    pub lmstudio_url: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub max_tokens: u32,
    pub max_retries: u32,
    pub preprocess: PreprocessSettings,
}

impl EngineDefaults {
    /// Vision settings for a request, applying its backend and model overrides.
    pub fn vision_for(&self, request: &NewJobRequest) -> VisionSettings {
        self.vision_with(request.vision_backend, request.vision_model.as_deref())
    }

    /// Vision settings with optional backend and model overrides; a blank model is ignored.
    pub fn vision_with(
        &self,
        backend: Option<VisionBackendKind>,
        model: Option<&str>,
    ) -> VisionSettings {
        let backend = backend.unwrap_or(self.backend);
        let model = model
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.model.as_str())
            .to_string();

        VisionSettings {
            backend,
            base_url: self.url_for(backend).to_string(),
            model,
            timeout_seconds: self.timeout_seconds,
            max_tokens: self.max_tokens,
            max_retries: self.max_retries,
        }
    }

    pub fn url_for(&self, backend: VisionBackendKind) -> &str {
        match backend {
            VisionBackendKind::Ollama => &self.ollama_url,
            VisionBackendKind::LmStudio => &self.lmstudio_url,
        }
    }
}

struct EngineInner {
    pool: SqlitePool,
    catalog: Arc<dyn CaptionCatalog>,
    backends: Arc<dyn BackendProvider>,
    defaults: EngineDefaults,
    jobs: RwLock<HashMap<Uuid, Arc<JobHandle>>>,
    create_lock: tokio::sync::Mutex<()>,
}

/// Registry of caption jobs and the operations callers use to control them.
#[derive(Clone)]
pub struct CaptionEngine {
    inner: Arc<EngineInner>,
}

impl CaptionEngine {
    pub fn new(
        pool: SqlitePool,
        catalog: Arc<dyn CaptionCatalog>,
        backends: Arc<dyn BackendProvider>,
        defaults: EngineDefaults,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                pool,
                catalog,
                backends,
                defaults,
                jobs: RwLock::new(HashMap::new()),
                create_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn defaults(&self) -> &EngineDefaults {
        &self.inner.defaults
    }

    fn handle(&self, job_id: Uuid) -> Result<Arc<JobHandle>, JobError> {
        self.inner
            .jobs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&job_id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(format!("job {}", job_id)))
    }

    fn handles(&self) -> Vec<Arc<JobHandle>> {
        self.inner
            .jobs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn register(&self, handle: Arc<JobHandle>) {
        self.inner
            .jobs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(handle.id(), handle);
    }

    fn spawn_runner(&self, handle: &Arc<JobHandle>) {
        if let Some(token) = handle.claim_runner() {
            self.launch(handle, token);
        }
    }

    fn launch(&self, handle: &Arc<JobHandle>, token: RunnerToken) {
        JobRunner::new(
            Arc::clone(handle),
            Arc::clone(&self.inner.catalog),
            Arc::clone(&self.inner.backends),
            token,
        )
        .spawn();
    }

    // ── Operations ───────────────────────────────────────────────────

    /// Create a job over every file of the caption set and start it in the background.
    pub async fn create_job(
        &self,
        caption_set_id: &str,
        request: NewJobRequest,
    ) -> Result<CaptionJob, JobError> {
        request
            .validate()
            .map_err(|e| JobError::InvalidConfig(e.to_string()))?;

        let _guard = self.inner.create_lock.lock().await;
        if let Some(active) = self.handles().into_iter().find(|h| {
            let job = h.snapshot();
            job.caption_set_id == caption_set_id && !job.status.is_terminal()
        }) {
            return Err(JobError::InvalidState(format!(
                "caption set {} already has an active job {}",
                caption_set_id,
                active.id()
            )));
        }

        let prompt = self.inner.catalog.prompt_config(caption_set_id).await?;
        let files = self.inner.catalog.list_files(caption_set_id).await?;
        let total_files = u32::try_from(files.len())
            .map_err(|_| JobError::InvalidConfig("too many files in caption set".to_string()))?;

        let settings = JobSettings {
            vision: self.inner.defaults.vision_for(&request),
            preprocess: self.inner.defaults.preprocess.clone(),
            prompt,
            overwrite_existing: request.overwrite_existing,
        };
        let job = CaptionJob::new(caption_set_id, total_files, settings);
        let handle = JobHandle::create(self.inner.pool.clone(), job, files).await?;
        let snapshot = handle.snapshot();

        tracing::info!(
            job_id = %snapshot.id,
            caption_set_id = %caption_set_id,
            total_files = total_files,
            model = %snapshot.settings.vision.model,
            "Caption job created"
        );
        metrics::counter!("caption_jobs_total", "status" => "created").increment(1);

        self.register(Arc::clone(&handle));
        self.spawn_runner(&handle);
        Ok(snapshot)
    }

    pub async fn pause(&self, job_id: Uuid) -> Result<CaptionJob, JobError> {
        let job = self.handle(job_id)?.pause().await?;
        tracing::info!(job_id = %job_id, "Caption job paused");
        Ok(job)
    }

    pub async fn resume(&self, job_id: Uuid) -> Result<CaptionJob, JobError> {
        let handle = self.handle(job_id)?;
        let (job, token) = handle.resume().await?;
        if let Some(token) = token {
            self.launch(&handle, token);
        }
        tracing::info!(job_id = %job_id, remaining = job.remaining_files(), "Caption job resumed");
        Ok(job)
    }

    pub async fn cancel(&self, job_id: Uuid) -> Result<CaptionJob, JobError> {
        let job = self.handle(job_id)?.cancel().await?;
        tracing::info!(
            job_id = %job_id,
            completed = job.completed_files,
            failed = job.failed_files,
            "Caption job cancelled"
        );
        Ok(job)
    }

    pub fn get_job(&self, job_id: Uuid) -> Result<CaptionJob, JobError> {
        Ok(self.handle(job_id)?.snapshot())
    }

    /// All jobs, newest first.
    pub fn list_jobs(&self) -> Vec<CaptionJob> {
        let mut jobs: Vec<CaptionJob> = self.handles().iter().map(|h| h.snapshot()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn job_results(&self, job_id: Uuid) -> Result<Vec<PerFileResult>, JobError> {
        let mut results = self.handle(job_id)?.results();
        results.sort_by_key(|r| r.position);
        Ok(results)
    }

    pub fn job_progress(&self, job_id: Uuid) -> Result<JobProgress, JobError> {
        Ok(self.handle(job_id)?.progress())
    }

    pub fn is_runner_active(&self, job_id: Uuid) -> Result<bool, JobError> {
        Ok(self.handle(job_id)?.runner_active())
    }

    /// Delete a finished job and its result history.
    pub async fn delete_job(&self, job_id: Uuid) -> Result<(), JobError> {
        let handle = self.handle(job_id)?;
        let status = handle.status();
        if !status.is_terminal() {
            return Err(JobError::InvalidState(format!(
                "cannot delete a job that is {}",
                status
            )));
        }

        queries::delete_job(&self.inner.pool, job_id).await?;
        self.inner
            .jobs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&job_id);
        tracing::info!(job_id = %job_id, "Caption job deleted");
        Ok(())
    }

    /// Models offered by the default backend.
    pub async fn available_models(&self) -> Result<VisionModelsResponse, JobError> {
        let vision = self.inner.defaults.vision_for(&NewJobRequest::default());
        let backend = self
            .inner
            .backends
            .backend(&vision)
            .map_err(|e| JobError::InvalidConfig(e.to_string()))?;
        let models = backend.list_models().await?;
        Ok(VisionModelsResponse {
            backend: vision.backend,
            default_model: vision.model,
            models,
        })
    }

    /// Caption one file with an ad hoc prompt configuration.
    ///
    /// Runs the same resize, backend, parse and post-processing steps as a job
    /// file, but returns the caption instead of writing it to the catalog.
    pub async fn generate_caption(
        &self,
        request: GenerateCaptionRequest,
    ) -> Result<GenerateCaptionResponse, JobError> {
        request
            .validate()
            .map_err(|e| JobError::InvalidConfig(e.to_string()))?;
        let started = Instant::now();

        let prompt_config = request.prompt_config();
        let prompt = build_prompt(&prompt_config)?;
        let vision = self
            .inner
            .defaults
            .vision_with(request.vision_backend, request.vision_model.as_deref());
        let backend = self
            .inner
            .backends
            .backend(&vision)
            .map_err(|e| JobError::InvalidConfig(e.to_string()))?;
        let file = self.inner.catalog.find_file(&request.file_id).await?;

        let catalog = &self.inner.catalog;
        let source = &file;
        let mut cache = ResizeCache::new(self.inner.defaults.preprocess.clone());
        let image = tokio::time::timeout(
            Duration::from_secs(vision.timeout_seconds),
            cache.get_or_prepare(&file.id, move || async move {
                catalog
                    .read_source(source)
                    .await
                    .map_err(|e| ResizeError::Source(e.to_string()))
            }),
        )
        .await
        .unwrap_or_else(|_| Err(ResizeError::Timeout(vision.timeout_seconds)))
        .map_err(|e| JobError::InvalidConfig(format!("file {}: {}", file.id, e)))?;

        let raw = generate_with_retry(
            backend.as_ref(),
            &prompt,
            &image,
            cache.mime_type(),
            vision.max_retries,
            &file.id,
        )
        .await?;
        let parsed =
            parser::parse_response(&raw).map_err(|e| JobError::BackendError(e.to_string()))?;

        let (caption, truncated) = finish_caption(&parsed.caption, &prompt_config);
        if caption.trim().is_empty() {
            return Err(JobError::BackendError("empty response".to_string()));
        }
        let mut flags = parsed.flags;
        if truncated {
            flags.insert("truncated".to_string());
        }
        let quality_flags = (parsed.quality.is_some() || !flags.is_empty())
            .then(|| flags.into_iter().collect());
        let processing_time_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            file_id = %file.id,
            model = %vision.model,
            backend = %vision.backend,
            duration_ms = processing_time_ms,
            "Single caption generated"
        );

        Ok(GenerateCaptionResponse {
            caption,
            quality_score: parsed.quality.map(|q| q.overall),
            quality_flags,
            processing_time_ms,
            vision_model: vision.model,
            backend: vision.backend,
        })
    }

    /// Load persisted jobs after a restart.
    ///
    /// Jobs that were running are paused and wait for an explicit resume;
    /// pending jobs are started again.
    pub async fn recover(&self) -> Result<usize, JobError> {
        let jobs = queries::list_jobs(&self.inner.pool).await?;
        let count = jobs.len();

        for mut job in jobs {
            let targets = queries::job_files(&self.inner.pool, job.id).await?;
            let results = queries::job_results(&self.inner.pool, job.id).await?;

            if job.status == JobStatus::Running {
                job.pause()?;
                job.current_file_id = None;
                queries::update_job(&self.inner.pool, &job).await?;
                tracing::info!(job_id = %job.id, "Interrupted job paused after restart");
            }

            let pending = job.status == JobStatus::Pending;
            let handle = Arc::new(JobHandle::restore(
                self.inner.pool.clone(),
                job,
                targets,
                results,
            ));
            self.register(Arc::clone(&handle));
            if pending {
                self.spawn_runner(&handle);
            }
        }

        tracing::info!(jobs = count, "Caption jobs recovered");
        Ok(count)
    }
}
