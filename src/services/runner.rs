use std::sync::Arc;
use std::time::{Duration, Instant};

use garde::Validate;
use tokio::task::JoinHandle;

use crate::models::job::{CaptionJob, JobStatus};
use crate::models::result::{FileRef, PerFileResult};
use crate::models::settings::{JobSettings, VisionSettings};
use crate::services::catalog::{CaptionCatalog, GeneratedCaption};
use crate::services::job_state::{JobError, JobHandle, NextFile, RunnerToken};
use crate::services::parser;
use crate::services::prompt::{build_prompt, finish_caption};
use crate::services::resize::{ResizeCache, ResizeError};
use crate::services::vision::{
    generate_with_retry, model_available, BackendProvider, VisionBackend,
};

/// Outcome of working on one file.
enum FileStep {
    Record(PerFileResult),
    /// A caption ready for the catalog, written and recorded together.
    Save(GeneratedCaption, u32),
    /// The job was cancelled while the file was in flight.
    Discard,
}

/// Sequential processing loop for a single job.
pub struct JobRunner {
    handle: Arc<JobHandle>,
    catalog: Arc<dyn CaptionCatalog>,
    backends: Arc<dyn BackendProvider>,
    token: RunnerToken,
}

impl JobRunner {
    pub fn new(
        handle: Arc<JobHandle>,
        catalog: Arc<dyn CaptionCatalog>,
        backends: Arc<dyn BackendProvider>,
        token: RunnerToken,
    ) -> Self {
        Self {
            handle,
            catalog,
            backends,
            token,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Drive the job until it pauses or ends. Never panics on job errors.
    pub async fn run(self) {
        let job_id = self.handle.id();
        tracing::info!(job_id = %job_id, "Runner started");

        match self.drive().await {
            Ok(status) => {
                tracing::info!(job_id = %job_id, status = %status, "Runner stopped");
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Runner failed");
                if let Err(fail_err) = self.handle.fail(&e.to_string()).await {
                    tracing::warn!(job_id = %job_id, error = %fail_err, "Could not mark job failed");
                }
            }
        }

        let job = self.handle.snapshot();
        if job.status.is_terminal() {
            metrics::counter!("caption_jobs_total", "status" => job.status.to_string())
                .increment(1);
        }
        self.handle.release_runner(self.token);
    }

    async fn drive(&self) -> Result<JobStatus, JobError> {
        let job = self.handle.snapshot();
        let settings = job.settings;

        let prompt = match prepare_prompt(&settings) {
            Ok(prompt) => prompt,
            Err(e) => return self.abort(e).await,
        };
        let backend = match self.backends.backend(&settings.vision) {
            Ok(backend) => backend,
            Err(e) => return self.abort(JobError::InvalidConfig(e.to_string())).await,
        };

        if job.status == JobStatus::Pending {
            if let Err(e) = preflight(backend.as_ref(), &settings.vision).await {
                return self.abort(e).await;
            }
            match self.handle.start().await {
                Ok(_) => {}
                // Cancelled before it got going.
                Err(JobError::InvalidState(_)) => return Ok(self.handle.status()),
                Err(e) => return Err(e),
            }
            tracing::info!(
                job_id = %job.id,
                total_files = job.total_files,
                model = %settings.vision.model,
                backend = %settings.vision.backend,
                "Job started"
            );
        }

        let mut cache = ResizeCache::new(settings.preprocess.clone());
        loop {
            match self.handle.next_file(self.token).await? {
                NextFile::Stop(status) => return Ok(status),
                NextFile::Process { file, position } => {
                    let started = Instant::now();
                    let step = self
                        .process_file(&mut cache, backend.as_ref(), &prompt, &settings, &file, position)
                        .await;
                    match step {
                        FileStep::Record(result) => {
                            self.record(result.with_duration(elapsed_ms(started))).await?;
                        }
                        FileStep::Save(caption, position) => {
                            self.save(&job.caption_set_id, caption, position, started)
                                .await?;
                        }
                        FileStep::Discard => {
                            tracing::info!(job_id = %job.id, file_id = %file.id, "In-flight result discarded after cancel");
                        }
                    }
                }
            }
        }
    }

    /// Fail the job before any file was attempted.
    async fn abort(&self, err: JobError) -> Result<JobStatus, JobError> {
        tracing::error!(job_id = %self.handle.id(), error = %err, "Job cannot start");
        match self.handle.fail(&err.to_string()).await {
            Ok(job) => Ok(job.status),
            Err(JobError::InvalidState(_)) => Ok(self.handle.status()),
            Err(e) => Err(e),
        }
    }

    async fn record(&self, result: PerFileResult) -> Result<(), JobError> {
        let file_id = result.file_id.clone();
        match self.handle.record_result(result.clone()).await {
            Ok(job) => {
                self.observe(&job, &result);
                Ok(())
            }
            Err(JobError::InvalidState(reason)) => {
                tracing::debug!(job_id = %self.handle.id(), file_id = %file_id, reason = %reason, "Result not recorded");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Write the caption to the catalog and record the file in one step.
    ///
    /// Nothing reaches the catalog once the job is cancelled.
    async fn save(
        &self,
        caption_set_id: &str,
        caption: GeneratedCaption,
        position: u32,
        started: Instant,
    ) -> Result<(), JobError> {
        let file_id = caption.file_id.clone();
        let catalog = &self.catalog;
        let committed = self
            .handle
            .commit_result(&file_id, || async move {
                let result = match catalog.write_caption(caption_set_id, &caption).await {
                    Ok(()) => PerFileResult::success(
                        &caption.file_id,
                        position,
                        caption.text,
                        caption.quality,
                        caption.flags,
                    ),
                    Err(e) => PerFileResult::failed(
                        &caption.file_id,
                        position,
                        format!("failed to save caption: {}", e),
                    ),
                };
                result.with_duration(elapsed_ms(started))
            })
            .await;

        match committed {
            Ok(Some((job, result))) => {
                self.observe(&job, &result);
                Ok(())
            }
            Ok(None) => {
                tracing::info!(job_id = %self.handle.id(), file_id = %file_id, "In-flight result discarded after cancel");
                Ok(())
            }
            Err(JobError::InvalidState(reason)) => {
                tracing::debug!(job_id = %self.handle.id(), file_id = %file_id, reason = %reason, "Result not recorded");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn observe(&self, job: &CaptionJob, result: &PerFileResult) {
        metrics::counter!("caption_files_total", "outcome" => result.outcome.to_string())
            .increment(1);
        tracing::info!(
            job_id = %job.id,
            file_id = %result.file_id,
            outcome = %result.outcome,
            duration_ms = result.processing_ms,
            completed = job.completed_files,
            failed = job.failed_files,
            total = job.total_files,
            "File processed"
        );
    }

    async fn process_file(
        &self,
        cache: &mut ResizeCache,
        backend: &dyn VisionBackend,
        prompt: &str,
        settings: &JobSettings,
        file: &FileRef,
        position: u32,
    ) -> FileStep {
        let job = self.handle.snapshot();
        let fail = |msg: String| FileStep::Record(PerFileResult::failed(&file.id, position, msg));

        if !settings.overwrite_existing {
            match self.catalog.has_caption(&job.caption_set_id, &file.id).await {
                Ok(true) => {
                    tracing::debug!(job_id = %job.id, file_id = %file.id, "Existing caption kept");
                    return FileStep::Record(PerFileResult::skipped(&file.id, position));
                }
                Ok(false) => {}
                Err(e) => return fail(e.to_string()),
            }
        }

        let catalog = &self.catalog;
        let limit = Duration::from_secs(settings.vision.timeout_seconds);
        let prepared = tokio::time::timeout(
            limit,
            cache.get_or_prepare(&file.id, move || async move {
                catalog
                    .read_source(file)
                    .await
                    .map_err(|e| ResizeError::Source(e.to_string()))
            }),
        )
        .await
        .unwrap_or_else(|_| Err(ResizeError::Timeout(settings.vision.timeout_seconds)));
        let image = match prepared {
            Ok(image) => image,
            Err(e) => return fail(e.to_string()),
        };

        let raw = match generate_with_retry(
            backend,
            prompt,
            &image,
            cache.mime_type(),
            settings.vision.max_retries,
            &file.id,
        )
        .await
        {
            Ok(raw) => raw,
            Err(e) => {
                if self.handle.status() == JobStatus::Cancelled {
                    return FileStep::Discard;
                }
                return fail(e.to_string());
            }
        };

        if self.handle.status() == JobStatus::Cancelled {
            return FileStep::Discard;
        }

        let parsed = match parser::parse_response(&raw) {
            Ok(parsed) => parsed,
            Err(e) => return fail(e.to_string()),
        };
        if parsed.degraded {
            tracing::debug!(job_id = %job.id, file_id = %file.id, "No quality data in model response");
        }

        let (text, truncated) = finish_caption(&parsed.caption, &settings.prompt);
        if text.trim().is_empty() {
            return fail("empty response".to_string());
        }
        let mut flags = parsed.flags;
        if truncated {
            flags.insert("truncated".to_string());
        }

        let caption = GeneratedCaption {
            file_id: file.id.clone(),
            text,
            vision_model: settings.vision.model.clone(),
            quality: parsed.quality,
            flags,
        };
        FileStep::Save(caption, position)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Validate the frozen prompt configuration and build the prompt once per run.
fn prepare_prompt(settings: &JobSettings) -> Result<String, JobError> {
    settings
        .prompt
        .validate()
        .map_err(|e| JobError::InvalidConfig(e.to_string()))?;
    Ok(build_prompt(&settings.prompt)?)
}

/// Confirm the backend answers and offers the configured model.
async fn preflight(backend: &dyn VisionBackend, vision: &VisionSettings) -> Result<(), JobError> {
    let models = backend.list_models().await.map_err(|e| match e {
        e if e.is_unavailable() => JobError::BackendUnavailable(format!(
            "{} backend at {} is unreachable: {}",
            vision.backend, vision.base_url, e
        )),
        e => JobError::from(e),
    })?;

    if !model_available(&models, &vision.model) {
        return Err(JobError::InvalidConfig(format!(
            "model '{}' is not available on {} backend at {}",
            vision.model, vision.backend, vision.base_url
        )));
    }
    Ok(())
}
