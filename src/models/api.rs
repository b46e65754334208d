use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::models::prompt::{CaptionSetPromptConfig, CaptionStyle};
use crate::models::settings::VisionBackendKind;

/// Request to start auto-captioning a caption set.
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct NewJobRequest {
    #[garde(skip)]
    #[serde(default)]
    pub overwrite_existing: bool,

    /// Overrides the configured default model.
    #[garde(length(min = 1, max = 200))]
    #[serde(default)]
    pub vision_model: Option<String>,

    /// Overrides the configured default backend.
    #[garde(skip)]
    #[serde(default)]
    pub vision_backend: Option<VisionBackendKind>,
}

/// Request to caption one file outside of any job.
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct GenerateCaptionRequest {
    #[garde(length(min = 1))]
    pub file_id: String,

    #[garde(skip)]
    #[serde(default)]
    pub style: CaptionStyle,

    #[garde(range(min = 10, max = 10000))]
    #[serde(default)]
    pub max_length: Option<u32>,

    #[garde(length(min = 1, max = 200))]
    #[serde(default)]
    pub vision_model: Option<String>,

    #[garde(skip)]
    #[serde(default)]
    pub vision_backend: Option<VisionBackendKind>,

    #[garde(skip)]
    #[serde(default)]
    pub custom_prompt: Option<String>,

    /// The caption must start with this phrase.
    #[garde(length(max = 500))]
    #[serde(default)]
    pub trigger_phrase: Option<String>,
}

impl GenerateCaptionRequest {
    pub fn prompt_config(&self) -> CaptionSetPromptConfig {
        CaptionSetPromptConfig {
            style: self.style,
            custom_prompt: self.custom_prompt.clone(),
            trigger_phrase: self.trigger_phrase.clone(),
            max_length: self.max_length,
        }
    }
}

/// A single generated caption. Nothing is stored.
#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateCaptionResponse {
    pub caption: String,
    pub quality_score: Option<f64>,
    /// `None` when the model returned neither quality data nor flags.
    pub quality_flags: Option<Vec<String>>,
    pub processing_time_ms: u64,
    pub vision_model: String,
    pub backend: VisionBackendKind,
}

/// Error body returned by the HTTP API.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Models offered by the configured vision backend.
#[derive(Debug, Serialize, Deserialize)]
pub struct VisionModelsResponse {
    pub backend: VisionBackendKind,
    pub default_model: String,
    pub models: Vec<String>,
}
