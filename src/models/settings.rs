use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::models::prompt::CaptionSetPromptConfig;

/// Inference server protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
pub enum VisionBackendKind {
    #[serde(rename = "ollama")]
    #[strum(serialize = "ollama")]
    Ollama,
    #[serde(rename = "lmstudio")]
    #[strum(serialize = "lmstudio")]
    LmStudio,
}

/// Encoding used for inference-ready images.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OutputFormat {
    #[strum(to_string = "jpeg", serialize = "jpg")]
    Jpeg,
    Png,
    /// Lossless only; `PreprocessSettings::quality` has no effect.
    Webp,
}

impl OutputFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::Webp => "image/webp",
        }
    }
}

/// Backend endpoint settings frozen into a job at creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisionSettings {
    pub backend: VisionBackendKind,
    pub base_url: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub max_tokens: u32,
    /// Extra attempts after a timeout or refused connection.
    pub max_retries: u32,
}

/// Image preprocessing applied before inference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreprocessSettings {
    pub max_resolution: u32,
    pub maintain_aspect_ratio: bool,
    /// JPEG quality, 1 to 100. PNG and WebP output is lossless and ignores it.
    pub quality: u8,
    pub format: OutputFormat,
}

impl Default for PreprocessSettings {
    fn default() -> Self {
        Self {
            max_resolution: 1024,
            maintain_aspect_ratio: true,
            quality: 95,
            format: OutputFormat::Jpeg,
        }
    }
}

/// Everything a runner needs, captured once when the job is created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSettings {
    pub vision: VisionSettings,
    pub preprocess: PreprocessSettings,
    pub prompt: CaptionSetPromptConfig,
    pub overwrite_existing: bool,
}
