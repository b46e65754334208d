use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, Response};
use serde::Deserialize;

use crate::models::settings::{VisionBackendKind, VisionSettings};

/// Longest backend error body kept in an error message.
const MAX_ERROR_BODY: usize = 300;

/// Transport to a vision-language model server.
///
/// One call per invocation; retry policy belongs to the caller.
#[async_trait]
pub trait VisionBackend: Send + Sync {
    /// Send the prompt and an encoded image, returning the model's raw text output.
    async fn generate(
        &self,
        prompt: &str,
        image: &[u8],
        mime_type: &str,
    ) -> Result<String, VisionError>;

    /// Model identifiers the server currently offers.
    async fn list_models(&self) -> Result<Vec<String>, VisionError>;
}

/// Builds a backend for a job's frozen vision settings.
pub trait BackendProvider: Send + Sync {
    fn backend(&self, settings: &VisionSettings) -> Result<Arc<dyn VisionBackend>, VisionError>;
}

/// Provider for the real HTTP backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpBackendProvider;

impl BackendProvider for HttpBackendProvider {
    fn backend(&self, settings: &VisionSettings) -> Result<Arc<dyn VisionBackend>, VisionError> {
        Ok(match settings.backend {
            VisionBackendKind::Ollama => Arc::new(OllamaClient::new(settings)?),
            VisionBackendKind::LmStudio => Arc::new(LmStudioClient::new(settings)?),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("vision backend timed out")]
    Timeout,

    #[error("could not connect to vision backend: {0}")]
    Connection(String),

    #[error("vision backend returned HTTP {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("unexpected response from vision backend: {0}")]
    InvalidResponse(String),

    #[error("vision client configuration error: {0}")]
    Configuration(String),
}

impl VisionError {
    /// Timeouts and refused connections; the server may come back.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, VisionError::Timeout | VisionError::Connection(_))
    }
}

impl From<reqwest::Error> for VisionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            VisionError::Timeout
        } else if err.is_decode() {
            VisionError::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            VisionError::Backend {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            VisionError::Connection(err.to_string())
        }
    }
}

/// True when `wanted` names one of the `available` models. An untagged name
/// matches the `:latest` tag, as Ollama resolves it.
pub fn model_available(available: &[String], wanted: &str) -> bool {
    available.iter().any(|name| {
        name == wanted
            || (!wanted.contains(':') && name.strip_suffix(":latest") == Some(wanted))
    })
}

/// One `generate` call, repeated while the server is unreachable and retries remain.
pub async fn generate_with_retry(
    backend: &dyn VisionBackend,
    prompt: &str,
    image: &[u8],
    mime_type: &str,
    max_retries: u32,
    file_id: &str,
) -> Result<String, VisionError> {
    let mut attempt = 0;
    loop {
        let started = Instant::now();
        let outcome = backend.generate(prompt, image, mime_type).await;
        metrics::histogram!("caption_inference_seconds").record(started.elapsed().as_secs_f64());

        match outcome {
            Err(e) if e.is_unavailable() && attempt < max_retries => {
                attempt += 1;
                tracing::warn!(
                    file_id = %file_id,
                    attempt = attempt,
                    error = %e,
                    "Vision backend unavailable, retrying"
                );
            }
            other => return other,
        }
    }
}

fn http_client(settings: &VisionSettings) -> Result<Client, VisionError> {
    Client::builder()
        .timeout(Duration::from_secs(settings.timeout_seconds))
        .build()
        .map_err(|e| VisionError::Configuration(e.to_string()))
}

/// Turn a non-success response into `VisionError::Backend`.
async fn ensure_success(response: Response) -> Result<Response, VisionError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let cut = (0..=MAX_ERROR_BODY)
            .rev()
            .find(|i| body.is_char_boundary(*i))
            .unwrap_or(0);
        body.truncate(cut);
    }
    Err(VisionError::Backend {
        status: status.as_u16(),
        body,
    })
}

fn encode_image(image: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(image)
}

// ── Ollama ───────────────────────────────────────────────────────────

/// Client for the Ollama `/api/generate` endpoint.
pub struct OllamaClient {
    http: Client,
    base_url: String,
    model: String,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Deserialize)]
struct OllamaModel {
    name: String,
}

impl OllamaClient {
    pub fn new(settings: &VisionSettings) -> Result<Self, VisionError> {
        Ok(Self {
            http: http_client(settings)?,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
        })
    }
}

#[async_trait]
impl VisionBackend for OllamaClient {
    async fn generate(
        &self,
        prompt: &str,
        image: &[u8],
        _mime_type: &str,
    ) -> Result<String, VisionError> {
        let request_body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "images": [encode_image(image)],
            "stream": false,
            "options": { "num_predict": self.max_tokens }
        });

        let response = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&request_body)
            .send()
            .await?;

        let body: OllamaGenerateResponse = ensure_success(response).await?.json().await?;
        Ok(body.response)
    }

    async fn list_models(&self) -> Result<Vec<String>, VisionError> {
        let response = self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await?;
        let tags: OllamaTagsResponse = ensure_success(response).await?.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

// ── LM Studio (OpenAI-compatible) ────────────────────────────────────

/// Client for the LM Studio OpenAI-compatible chat completions endpoint.
pub struct LmStudioClient {
    http: Client,
    base_url: String,
    model: String,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

impl LmStudioClient {
    pub fn new(settings: &VisionSettings) -> Result<Self, VisionError> {
        Ok(Self {
            http: http_client(settings)?,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
        })
    }
}

#[async_trait]
impl VisionBackend for LmStudioClient {
    async fn generate(
        &self,
        prompt: &str,
        image: &[u8],
        mime_type: &str,
    ) -> Result<String, VisionError> {
        let data_url = format!("data:{};base64,{}", mime_type, encode_image(image));
        let request_body = serde_json::json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    { "type": "image_url", "image_url": { "url": data_url } }
                ]
            }],
            "max_tokens": self.max_tokens,
            "stream": false
        });

        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&request_body)
            .send()
            .await?;

        let completion: ChatCompletionResponse = ensure_success(response).await?.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.unwrap_or_default())
            .ok_or_else(|| VisionError::InvalidResponse("no choices in completion".to_string()))
    }

    async fn list_models(&self) -> Result<Vec<String>, VisionError> {
        let response = self
            .http
            .get(format!("{}/v1/models", self.base_url))
            .send()
            .await?;
        let models: ModelList = ensure_success(response).await?.json().await?;
        Ok(models.data.into_iter().map(|m| m.id).collect())
    }
}
