use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// A file targeted by a caption job, in discovery order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FileRef {
    pub id: String,
    pub filename: String,
}

/// Outcome of processing one file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FileOutcome {
    Success,
    Failed,
    Skipped,
}

/// Quality assessment returned by the model, each score in [0.0, 1.0].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct QualityScores {
    pub sharpness: f64,
    pub clarity: f64,
    pub composition: f64,
    pub exposure: f64,
    pub overall: f64,
}

impl QualityScores {
    pub fn clamped(self) -> Self {
        let clamp = |v: f64| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        Self {
            sharpness: clamp(self.sharpness),
            clarity: clamp(self.clarity),
            composition: clamp(self.composition),
            exposure: clamp(self.exposure),
            overall: clamp(self.overall),
        }
    }
}

/// Recorded result for one file of a job. Never mutated after it is written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerFileResult {
    pub file_id: String,
    pub position: u32,
    pub outcome: FileOutcome,
    pub caption: Option<String>,
    pub quality: Option<QualityScores>,
    #[serde(default)]
    pub flags: BTreeSet<String>,
    pub error: Option<String>,
    pub processing_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

impl PerFileResult {
    pub fn success(
        file_id: &str,
        position: u32,
        caption: String,
        quality: Option<QualityScores>,
        flags: BTreeSet<String>,
    ) -> Self {
        Self {
            file_id: file_id.to_string(),
            position,
            outcome: FileOutcome::Success,
            caption: Some(caption),
            quality,
            flags,
            error: None,
            processing_ms: 0,
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(file_id: &str, position: u32, error: impl Into<String>) -> Self {
        let mut error = error.into();
        if error.trim().is_empty() {
            error = "unknown error".to_string();
        }
        Self {
            file_id: file_id.to_string(),
            position,
            outcome: FileOutcome::Failed,
            caption: None,
            quality: None,
            flags: BTreeSet::new(),
            error: Some(error),
            processing_ms: 0,
            recorded_at: Utc::now(),
        }
    }

    pub fn skipped(file_id: &str, position: u32) -> Self {
        Self {
            file_id: file_id.to_string(),
            position,
            outcome: FileOutcome::Skipped,
            caption: None,
            quality: None,
            flags: BTreeSet::new(),
            error: None,
            processing_ms: 0,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_duration(mut self, processing_ms: u64) -> Self {
        self.processing_ms = processing_ms;
        self
    }

    /// Checks the outcome/payload pairing: success carries a caption, failure an error.
    pub fn is_well_formed(&self) -> bool {
        match self.outcome {
            FileOutcome::Success => self.caption.as_deref().is_some_and(|c| !c.trim().is_empty()),
            FileOutcome::Failed => self.error.as_deref().is_some_and(|e| !e.trim().is_empty()),
            FileOutcome::Skipped => true,
        }
    }
}
