use garde::Validate;
use serde::Deserialize;

use crate::models::settings::{OutputFormat, PreprocessSettings, VisionBackendKind};
use crate::services::engine::EngineDefaults;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Env(#[from] envy::Error),

    #[error("invalid configuration: {0}")]
    Invalid(#[from] garde::Report),
}

#[derive(Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Server bind address (e.g., "127.0.0.1:8000")
    #[garde(length(min = 1))]
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// SQLite connection string
    #[garde(length(min = 1))]
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Backend used when a job does not pick one
    #[garde(skip)]
    #[serde(default = "default_vision_backend")]
    pub vision_backend: VisionBackendKind,

    #[garde(url)]
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    #[garde(url)]
    #[serde(default = "default_lmstudio_url")]
    pub lmstudio_url: String,

    #[garde(length(min = 1, max = 200))]
    #[serde(default = "default_vision_model")]
    pub vision_model: String,

    /// Per-call timeout for the vision backend
    #[garde(range(min = 1, max = 3600))]
    #[serde(default = "default_vision_timeout_seconds")]
    pub vision_timeout_seconds: u64,

    /// Extra attempts after a timeout or refused connection
    #[garde(range(max = 5))]
    #[serde(default = "default_vision_max_retries")]
    pub vision_max_retries: u32,

    #[garde(range(min = 16, max = 32768))]
    #[serde(default = "default_vision_max_tokens")]
    pub vision_max_tokens: u32,

    #[garde(range(min = 64, max = 8192))]
    #[serde(default = "default_preprocess_max_resolution")]
    pub preprocess_max_resolution: u32,

    #[garde(skip)]
    #[serde(default = "default_true")]
    pub preprocess_maintain_aspect_ratio: bool,

    #[garde(range(min = 1, max = 100))]
    #[serde(default = "default_preprocess_quality")]
    pub preprocess_quality: u8,

    #[garde(skip)]
    #[serde(default = "default_preprocess_format")]
    pub preprocess_format: OutputFormat,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_database_url() -> String {
    "sqlite://data/captions.db".to_string()
}

fn default_vision_backend() -> VisionBackendKind {
    VisionBackendKind::Ollama
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_lmstudio_url() -> String {
    "http://localhost:1234".to_string()
}

fn default_vision_model() -> String {
    "qwen2.5-vl:7b".to_string()
}

fn default_vision_timeout_seconds() -> u64 {
    120
}

fn default_vision_max_retries() -> u32 {
    1
}

fn default_vision_max_tokens() -> u32 {
    4096
}

fn default_preprocess_max_resolution() -> u32 {
    1024
}

fn default_true() -> bool {
    true
}

fn default_preprocess_quality() -> u8 {
    95
}

fn default_preprocess_format() -> OutputFormat {
    OutputFormat::Jpeg
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    /// Build from explicit key/value pairs (upper-case names, as in the environment).
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: AppConfig = envy::from_iter(vars)?;
        config.validate()?;
        Ok(config)
    }

    pub fn engine_defaults(&self) -> EngineDefaults {
        EngineDefaults {
            backend: self.vision_backend,
            ollama_url: self.ollama_url.clone(),
            lmstudio_url: self.lmstudio_url.clone(),
            model: self.vision_model.clone(),
            timeout_seconds: self.vision_timeout_seconds,
            max_tokens: self.vision_max_tokens,
            max_retries: self.vision_max_retries,
            preprocess: PreprocessSettings {
                max_resolution: self.preprocess_max_resolution,
                maintain_aspect_ratio: self.preprocess_maintain_aspect_ratio,
                quality: self.preprocess_quality,
                format: self.preprocess_format,
            },
        }
    }
}
