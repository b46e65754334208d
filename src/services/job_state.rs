//! Durable state of one caption job.
//!
//! Transitions are computed on a copy of the job, persisted, and only then
//! swapped into the snapshot readers see. Writers are serialized per job so
//! the copy is never stale; readers take a short synchronous read lock and
//! always observe status and counters from the same write.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::queries;
use crate::models::job::{CaptionJob, InvalidTransition, JobProgress, JobStatus};
use crate::models::result::{FileRef, PerFileResult};
use crate::services::catalog::CatalogError;
use crate::services::prompt::PromptError;
use crate::services::vision::VisionError;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("vision backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("vision backend error: {0}")]
    BackendError(String),

    #[error("catalog error: {0}")]
    Catalog(CatalogError),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl From<InvalidTransition> for JobError {
    fn from(err: InvalidTransition) -> Self {
        JobError::InvalidState(err.to_string())
    }
}

impl From<PromptError> for JobError {
    fn from(err: PromptError) -> Self {
        JobError::InvalidConfig(err.to_string())
    }
}

impl From<VisionError> for JobError {
    fn from(err: VisionError) -> Self {
        if err.is_unavailable() {
            JobError::BackendUnavailable(err.to_string())
        } else {
            JobError::BackendError(err.to_string())
        }
    }
}

impl From<CatalogError> for JobError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound(what) => JobError::NotFound(what),
            other => JobError::Catalog(other),
        }
    }
}

/// Proof of being the one runner allowed to drive a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerToken(u64);

/// What the runner should do at a file boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum NextFile {
    Process { file: FileRef, position: u32 },
    Stop(JobStatus),
}

struct JobState {
    job: CaptionJob,
    results: Vec<PerFileResult>,
    resolved: HashSet<String>,
    runner: Option<RunnerToken>,
    next_token: u64,
}

/// Shared handle to a live job: snapshot, result history and runner slot.
pub struct JobHandle {
    pool: SqlitePool,
    targets: Vec<FileRef>,
    state: RwLock<JobState>,
    writer: tokio::sync::Mutex<()>,
}

impl JobHandle {
    /// Persist a new job with its frozen target list.
    pub async fn create(
        pool: SqlitePool,
        job: CaptionJob,
        targets: Vec<FileRef>,
    ) -> Result<Arc<Self>, JobError> {
        queries::insert_job(&pool, &job, &targets).await?;
        Ok(Arc::new(Self::restore(pool, job, targets, Vec::new())))
    }

    /// Rebuild a handle from persisted rows.
    pub fn restore(
        pool: SqlitePool,
        job: CaptionJob,
        targets: Vec<FileRef>,
        results: Vec<PerFileResult>,
    ) -> Self {
        let resolved = results.iter().map(|r| r.file_id.clone()).collect();
        Self {
            pool,
            targets,
            state: RwLock::new(JobState {
                job,
                results,
                resolved,
                runner: None,
                next_token: 0,
            }),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, JobState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, JobState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn id(&self) -> Uuid {
        self.read().job.id
    }

    pub fn snapshot(&self) -> CaptionJob {
        self.read().job.clone()
    }

    pub fn status(&self) -> JobStatus {
        self.read().job.status
    }

    pub fn results(&self) -> Vec<PerFileResult> {
        self.read().results.clone()
    }

    /// Progress computed from the job and its results under one read lock.
    pub fn progress(&self) -> JobProgress {
        let state = self.read();
        JobProgress::from_job(&state.job, &state.results)
    }

    pub fn targets(&self) -> &[FileRef] {
        &self.targets
    }

    pub fn runner_active(&self) -> bool {
        self.read().runner.is_some()
    }

    // ── Runner slot ──────────────────────────────────────────────────

    /// Claim the runner slot. `None` when a runner already holds it or the job is over.
    pub fn claim_runner(&self) -> Option<RunnerToken> {
        let mut state = self.write();
        Self::claim(&mut state)
    }

    fn claim(state: &mut JobState) -> Option<RunnerToken> {
        if state.runner.is_some() || state.job.status.is_terminal() {
            return None;
        }
        state.next_token += 1;
        let token = RunnerToken(state.next_token);
        state.runner = Some(token);
        Some(token)
    }

    /// Give up the slot; a stale token is ignored.
    pub fn release_runner(&self, token: RunnerToken) {
        let mut state = self.write();
        if state.runner == Some(token) {
            state.runner = None;
            state.job.current_file_id = None;
        }
    }

    // ── Transitions ──────────────────────────────────────────────────

    pub async fn start(&self) -> Result<CaptionJob, JobError> {
        self.transition(|job| job.start(Utc::now())).await
    }

    pub async fn pause(&self) -> Result<CaptionJob, JobError> {
        self.transition(|job| job.pause()).await
    }

    /// Resume a paused job. Returns a token when no runner is left to pick it up.
    pub async fn resume(&self) -> Result<(CaptionJob, Option<RunnerToken>), JobError> {
        let _writer = self.writer.lock().await;
        let mut job = self.snapshot();
        job.resume()?;
        queries::update_job(&self.pool, &job).await?;

        let mut state = self.write();
        state.job = job.clone();
        let token = Self::claim(&mut state);
        Ok((job, token))
    }

    /// Cancel the job. Already cancelled jobs are returned unchanged.
    pub async fn cancel(&self) -> Result<CaptionJob, JobError> {
        let _writer = self.writer.lock().await;
        let mut job = self.snapshot();
        if !job.cancel(Utc::now())? {
            return Ok(job);
        }
        queries::update_job(&self.pool, &job).await?;
        self.write().job = job.clone();
        Ok(job)
    }

    /// Job-level failure; also frees the runner slot.
    pub async fn fail(&self, message: &str) -> Result<CaptionJob, JobError> {
        let _writer = self.writer.lock().await;
        let mut job = self.snapshot();
        job.fail(message, Utc::now())?;
        queries::update_job(&self.pool, &job).await?;

        let mut state = self.write();
        state.job = job.clone();
        state.runner = None;
        Ok(job)
    }

    async fn transition<F>(&self, apply: F) -> Result<CaptionJob, JobError>
    where
        F: FnOnce(&mut CaptionJob) -> Result<(), InvalidTransition>,
    {
        let _writer = self.writer.lock().await;
        let mut job = self.snapshot();
        apply(&mut job)?;
        queries::update_job(&self.pool, &job).await?;
        self.write().job = job.clone();
        Ok(job)
    }

    // ── Results ──────────────────────────────────────────────────────

    /// Record the outcome of one target file.
    ///
    /// Rejected once the job is cancelled or otherwise over, for files outside
    /// the target list, and for files that already have a result.
    pub async fn record_result(&self, result: PerFileResult) -> Result<CaptionJob, JobError> {
        self.check_target(&result.file_id)?;
        let _writer = self.writer.lock().await;
        self.check_unresolved(&result.file_id)?;
        self.apply_locked(result).await
    }

    /// Run `write` and record the result it produces as one step.
    ///
    /// The writer lock is held across `write`, so a cancel or pause issued
    /// meanwhile waits for the result to land. Returns `None` without calling
    /// `write` when the job no longer accepts results.
    pub async fn commit_result<F, Fut>(
        &self,
        file_id: &str,
        write: F,
    ) -> Result<Option<(CaptionJob, PerFileResult)>, JobError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PerFileResult>,
    {
        self.check_target(file_id)?;
        let _writer = self.writer.lock().await;
        if !self.status().accepts_results() {
            return Ok(None);
        }
        self.check_unresolved(file_id)?;

        let result = write().await;
        if result.file_id != file_id {
            return Err(JobError::InvalidState(format!(
                "result for {} committed as {}",
                result.file_id, file_id
            )));
        }
        let job = self.apply_locked(result.clone()).await?;
        Ok(Some((job, result)))
    }

    fn check_target(&self, file_id: &str) -> Result<(), JobError> {
        if self.targets.iter().any(|f| f.id == file_id) {
            Ok(())
        } else {
            Err(JobError::InvalidState(format!(
                "file {} is not part of this job",
                file_id
            )))
        }
    }

    fn check_unresolved(&self, file_id: &str) -> Result<(), JobError> {
        if self.read().resolved.contains(file_id) {
            return Err(JobError::InvalidState(format!(
                "file {} already has a result",
                file_id
            )));
        }
        Ok(())
    }

    /// Persist and publish a result. Callers hold the writer lock.
    async fn apply_locked(&self, result: PerFileResult) -> Result<CaptionJob, JobError> {
        if !result.is_well_formed() {
            return Err(JobError::InvalidState(format!(
                "malformed {} result for file {}",
                result.outcome, result.file_id
            )));
        }

        let mut job = self.snapshot();
        job.apply_result(&result, Utc::now())?;
        queries::record_result(&self.pool, &job, &result).await?;

        let mut state = self.write();
        state.job = job.clone();
        state.resolved.insert(result.file_id.clone());
        state.results.push(result);
        if job.status.is_terminal() {
            state.runner = None;
        }
        Ok(job)
    }

    /// Next file without a result, or why the runner must stop.
    ///
    /// A runner whose token is no longer current, or that finds the job not
    /// running, loses the slot here.
    pub async fn next_file(&self, token: RunnerToken) -> Result<NextFile, JobError> {
        let _writer = self.writer.lock().await;

        {
            let mut state = self.write();
            if state.runner != Some(token) {
                return Ok(NextFile::Stop(state.job.status));
            }
            if state.job.status != JobStatus::Running {
                state.runner = None;
                state.job.current_file_id = None;
                return Ok(NextFile::Stop(state.job.status));
            }

            let next = self
                .targets
                .iter()
                .enumerate()
                .find(|(_, f)| !state.resolved.contains(&f.id));
            if let Some((position, file)) = next {
                state.job.current_file_id = Some(file.id.clone());
                return Ok(NextFile::Process {
                    file: file.clone(),
                    position: position as u32,
                });
            }
        }

        // Every target resolved while running: only reachable for empty jobs.
        let mut job = self.snapshot();
        job.complete_if_exhausted(Utc::now());
        queries::update_job(&self.pool, &job).await?;

        let mut state = self.write();
        state.job = job.clone();
        state.runner = None;
        Ok(NextFile::Stop(job.status))
    }
}
