use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::result::{FileOutcome, PerFileResult};
use crate::models::settings::JobSettings;

/// Lifecycle status of a caption job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Cancelled,
    Failed,
    Completed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Cancelled | JobStatus::Failed | JobStatus::Completed
        )
    }

    /// An in-flight call may finish after a pause request, so paused jobs still take results.
    pub fn accepts_results(self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Paused)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {action} a job that is {from}")]
pub struct InvalidTransition {
    pub action: &'static str,
    pub from: JobStatus,
}

/// A batch auto-captioning job over one caption set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptionJob {
    pub id: Uuid,
    pub caption_set_id: String,
    pub status: JobStatus,
    pub total_files: u32,
    /// Successful and skipped files.
    pub completed_files: u32,
    pub failed_files: u32,
    pub skipped_files: u32,
    pub current_file_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub settings: JobSettings,
}

impl CaptionJob {
    pub fn new(caption_set_id: &str, total_files: u32, settings: JobSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            caption_set_id: caption_set_id.to_string(),
            status: JobStatus::Pending,
            total_files,
            completed_files: 0,
            failed_files: 0,
            skipped_files: 0,
            current_file_id: None,
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            settings,
        }
    }

    pub fn resolved_files(&self) -> u32 {
        self.completed_files + self.failed_files
    }

    pub fn remaining_files(&self) -> u32 {
        self.total_files.saturating_sub(self.resolved_files())
    }

    // ── Transitions ──────────────────────────────────────────────────

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.require(JobStatus::Pending, "start")?;
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), InvalidTransition> {
        self.require(JobStatus::Running, "pause")?;
        self.status = JobStatus::Paused;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), InvalidTransition> {
        self.require(JobStatus::Paused, "resume")?;
        self.status = JobStatus::Running;
        Ok(())
    }

    /// Returns `false` when the job was already cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<bool, InvalidTransition> {
        match self.status {
            JobStatus::Cancelled => Ok(false),
            JobStatus::Pending | JobStatus::Running | JobStatus::Paused => {
                self.status = JobStatus::Cancelled;
                self.current_file_id = None;
                self.finished_at = Some(now);
                Ok(true)
            }
            from => Err(InvalidTransition {
                action: "cancel",
                from,
            }),
        }
    }

    /// Job-level failure.
    pub fn fail(&mut self, message: &str, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if self.status.is_terminal() {
            return Err(InvalidTransition {
                action: "fail",
                from: self.status,
            });
        }
        self.status = JobStatus::Failed;
        self.last_error = Some(message.to_string());
        self.current_file_id = None;
        self.finished_at = Some(now);
        Ok(())
    }

    /// Counts a recorded file result and completes the job when it was the last one.
    pub fn apply_result(
        &mut self,
        result: &PerFileResult,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !self.status.accepts_results() || self.remaining_files() == 0 {
            return Err(InvalidTransition {
                action: "record a result for",
                from: self.status,
            });
        }
        match result.outcome {
            FileOutcome::Success => self.completed_files += 1,
            FileOutcome::Skipped => {
                self.completed_files += 1;
                self.skipped_files += 1;
            }
            FileOutcome::Failed => {
                self.failed_files += 1;
                self.last_error = result.error.clone();
            }
        }
        if self.current_file_id.as_deref() == Some(result.file_id.as_str()) {
            self.current_file_id = None;
        }
        self.complete_if_exhausted(now);
        Ok(())
    }

    /// Moves a live job to `completed` once every file is resolved.
    pub fn complete_if_exhausted(&mut self, now: DateTime<Utc>) -> bool {
        if self.status.accepts_results() && self.remaining_files() == 0 {
            self.status = JobStatus::Completed;
            self.current_file_id = None;
            self.finished_at = Some(now);
            return true;
        }
        false
    }

    fn require(&self, from: JobStatus, action: &'static str) -> Result<(), InvalidTransition> {
        if self.status == from {
            Ok(())
        } else {
            Err(InvalidTransition {
                action,
                from: self.status,
            })
        }
    }
}

/// Progress snapshot for polling clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobProgress {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub completed_files: u32,
    pub failed_files: u32,
    pub total_files: u32,
    pub percent_complete: f64,
    pub current_file: Option<String>,
    pub estimated_time_remaining_seconds: Option<u64>,
}

impl JobProgress {
    /// The time estimate is the mean recorded processing time per file times
    /// the files left, so time spent paused does not count.
    pub fn from_job(job: &CaptionJob, results: &[PerFileResult]) -> Self {
        let resolved = job.resolved_files();
        let percent_complete = if job.total_files == 0 {
            100.0
        } else {
            f64::from(resolved) * 100.0 / f64::from(job.total_files)
        };

        let estimated_time_remaining_seconds = match job.status {
            JobStatus::Running if !results.is_empty() => {
                let total_ms: u64 = results.iter().map(|r| r.processing_ms).sum();
                let mean_ms = total_ms as f64 / results.len() as f64;
                Some((mean_ms * f64::from(job.remaining_files()) / 1000.0).round() as u64)
            }
            _ => None,
        };

        Self {
            job_id: job.id,
            status: job.status,
            completed_files: job.completed_files,
            failed_files: job.failed_files,
            total_files: job.total_files,
            percent_complete,
            current_file: job.current_file_id.clone(),
            estimated_time_remaining_seconds,
        }
    }
}
