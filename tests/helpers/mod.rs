//! Shared fakes and polling helpers for engine and API tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use caption_engine::{
    db,
    models::{
        job::CaptionJob,
        prompt::CaptionSetPromptConfig,
        result::FileRef,
        settings::{PreprocessSettings, VisionBackendKind, VisionSettings},
    },
    services::{
        catalog::{CaptionCatalog, CatalogError, GeneratedCaption},
        engine::{CaptionEngine, EngineDefaults},
        vision::{BackendProvider, VisionBackend, VisionError},
    },
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use uuid::Uuid;

pub const MODEL: &str = "qwen2.5-vl:7b";
pub const SET_ID: &str = "set-1";

/// Small PNG used as every file's source image.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([120, 80, 40]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

/// JSON response in the shape the output directive asks for.
pub fn caption_json(caption: &str) -> String {
    serde_json::json!({
        "caption": caption,
        "quality": {
            "sharpness": 0.9,
            "clarity": 0.8,
            "composition": 0.7,
            "exposure": 0.6,
            "overall": 0.75
        },
        "flags": []
    })
    .to_string()
}

// ── Catalog ──────────────────────────────────────────────────────────

/// In-memory caption catalog with one caption set.
pub struct MemoryCatalog {
    pub prompt: Mutex<CaptionSetPromptConfig>,
    pub files: Mutex<Vec<FileRef>>,
    pub sources: Mutex<HashMap<String, Vec<u8>>>,
    pub existing: Mutex<HashSet<String>>,
    pub written: Mutex<Vec<GeneratedCaption>>,
    pub fail_writes: AtomicBool,
    stalled: Mutex<HashSet<String>>,
    write_gate: Mutex<Option<Arc<Semaphore>>>,
    writes_started: AtomicUsize,
}

impl MemoryCatalog {
    /// Caption set `set-1` with files `f0..f{n-1}`, each with a readable image.
    pub fn with_files(n: usize) -> Arc<Self> {
        let files: Vec<FileRef> = (0..n)
            .map(|i| FileRef {
                id: format!("f{}", i),
                filename: format!("img{}.png", i),
            })
            .collect();
        let image = png_bytes(64, 48);
        let sources = files
            .iter()
            .map(|f| (f.id.clone(), image.clone()))
            .collect();

        Arc::new(Self {
            prompt: Mutex::new(CaptionSetPromptConfig::default()),
            files: Mutex::new(files),
            sources: Mutex::new(sources),
            existing: Mutex::new(HashSet::new()),
            written: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            stalled: Mutex::new(HashSet::new()),
            write_gate: Mutex::new(None),
            writes_started: AtomicUsize::new(0),
        })
    }

    pub fn set_prompt(&self, prompt: CaptionSetPromptConfig) {
        *self.prompt.lock().unwrap() = prompt;
    }

    pub fn mark_captioned(&self, file_id: &str) {
        self.existing.lock().unwrap().insert(file_id.to_string());
    }

    pub fn remove_source(&self, file_id: &str) {
        self.sources.lock().unwrap().remove(file_id);
    }

    pub fn written(&self) -> Vec<GeneratedCaption> {
        self.written.lock().unwrap().clone()
    }

    /// Reading this file's source never finishes.
    pub fn stall_reads_of(&self, file_id: &str) {
        self.stalled.lock().unwrap().insert(file_id.to_string());
    }

    /// Every `write_caption` call waits for a permit from the returned semaphore.
    pub fn gate_writes(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.write_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn writes_started(&self) -> usize {
        self.writes_started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptionCatalog for MemoryCatalog {
    async fn prompt_config(
        &self,
        caption_set_id: &str,
    ) -> Result<CaptionSetPromptConfig, CatalogError> {
        if caption_set_id != SET_ID {
            return Err(CatalogError::NotFound(format!("caption set {}", caption_set_id)));
        }
        Ok(self.prompt.lock().unwrap().clone())
    }

    async fn list_files(&self, caption_set_id: &str) -> Result<Vec<FileRef>, CatalogError> {
        if caption_set_id != SET_ID {
            return Err(CatalogError::NotFound(format!("caption set {}", caption_set_id)));
        }
        Ok(self.files.lock().unwrap().clone())
    }

    async fn find_file(&self, file_id: &str) -> Result<FileRef, CatalogError> {
        self.files
            .lock()
            .unwrap()
            .iter()
            .find(|f| f.id == file_id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(format!("file {}", file_id)))
    }

    async fn read_source(&self, file: &FileRef) -> Result<Vec<u8>, CatalogError> {
        let stalled = self.stalled.lock().unwrap().contains(&file.id);
        if stalled {
            std::future::pending::<()>().await;
        }
        self.sources
            .lock()
            .unwrap()
            .get(&file.id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(format!("file {}", file.id)))
    }

    async fn has_caption(&self, _caption_set_id: &str, file_id: &str) -> Result<bool, CatalogError> {
        Ok(self.existing.lock().unwrap().contains(file_id))
    }

    async fn write_caption(
        &self,
        _caption_set_id: &str,
        caption: &GeneratedCaption,
    ) -> Result<(), CatalogError> {
        self.writes_started.fetch_add(1, Ordering::SeqCst);
        let gate = self.write_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CatalogError::Invalid("disk full".to_string()));
        }
        self.written.lock().unwrap().push(caption.clone());
        self.existing.lock().unwrap().insert(caption.file_id.clone());
        Ok(())
    }
}

// ── Vision backend ───────────────────────────────────────────────────

/// Scripted vision backend. Queued responses are used first, then the default.
pub struct FakeBackend {
    responses: Mutex<VecDeque<Result<String, VisionError>>>,
    default_response: Mutex<String>,
    models: Mutex<Vec<String>>,
    unreachable: AtomicBool,
    calls: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Every `generate` call waits for a permit from the returned semaphore.
    pub fn gated() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (Arc::new(Self::build(Some(Arc::clone(&gate)))), gate)
    }

    fn build(gate: Option<Arc<Semaphore>>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            default_response: Mutex::new(caption_json("a brown square on a plain background")),
            models: Mutex::new(vec![MODEL.to_string()]),
            unreachable: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            gate,
        }
    }

    pub fn push(&self, response: Result<String, VisionError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn set_default(&self, response: String) {
        *self.default_response.lock().unwrap() = response;
    }

    pub fn set_models(&self, models: &[&str]) {
        *self.models.lock().unwrap() = models.iter().map(|m| m.to_string()).collect();
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionBackend for FakeBackend {
    async fn generate(
        &self,
        _prompt: &str,
        image: &[u8],
        _mime_type: &str,
    ) -> Result<String, VisionError> {
        assert!(!image.is_empty());
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        let queued = self.responses.lock().unwrap().pop_front();
        match queued {
            Some(response) => response,
            None => Ok(self.default_response.lock().unwrap().clone()),
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, VisionError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(VisionError::Connection("connection refused".to_string()));
        }
        Ok(self.models.lock().unwrap().clone())
    }
}

/// Hands the same fake to every job and records the settings it was asked for.
pub struct FakeProvider {
    pub backend: Arc<FakeBackend>,
    pub requested: Mutex<Vec<VisionSettings>>,
}

impl FakeProvider {
    pub fn new(backend: Arc<FakeBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            requested: Mutex::new(Vec::new()),
        })
    }
}

impl BackendProvider for FakeProvider {
    fn backend(&self, settings: &VisionSettings) -> Result<Arc<dyn VisionBackend>, VisionError> {
        self.requested.lock().unwrap().push(settings.clone());
        Ok(self.backend.clone())
    }
}

// ── Engine ───────────────────────────────────────────────────────────

pub fn defaults() -> EngineDefaults {
    EngineDefaults {
        backend: VisionBackendKind::Ollama,
        ollama_url: "http://localhost:11434".to_string(),
        lmstudio_url: "http://localhost:1234".to_string(),
        model: MODEL.to_string(),
        timeout_seconds: 5,
        max_tokens: 512,
        max_retries: 1,
        preprocess: PreprocessSettings {
            max_resolution: 32,
            ..PreprocessSettings::default()
        },
    }
}

pub async fn memory_pool() -> SqlitePool {
    let pool = db::init_memory_pool().await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

pub fn engine_on(
    pool: SqlitePool,
    catalog: Arc<MemoryCatalog>,
    backend: Arc<FakeBackend>,
) -> CaptionEngine {
    CaptionEngine::new(pool, catalog, FakeProvider::new(backend), defaults())
}

pub async fn engine(catalog: Arc<MemoryCatalog>, backend: Arc<FakeBackend>) -> CaptionEngine {
    engine_on(memory_pool().await, catalog, backend)
}

// ── Catalog rows ─────────────────────────────────────────────────────

/// Number of snapshots in a caption's version history.
pub async fn caption_version_count(pool: &SqlitePool, caption_set_id: &str, file_id: &str) -> i64 {
    sqlx::query_scalar(
        "SELECT COUNT(v.id) FROM captions c \
         LEFT JOIN caption_versions v ON v.caption_id = c.id \
         WHERE c.caption_set_id = $1 AND c.file_id = $2",
    )
    .bind(caption_set_id)
    .bind(file_id)
    .fetch_one(pool)
    .await
    .unwrap()
}

/// Current caption text of a file, if any.
pub async fn caption_text(pool: &SqlitePool, caption_set_id: &str, file_id: &str) -> Option<String> {
    sqlx::query_scalar("SELECT text FROM captions WHERE caption_set_id = $1 AND file_id = $2")
        .bind(caption_set_id)
        .bind(file_id)
        .fetch_optional(pool)
        .await
        .unwrap()
}

// ── Polling ──────────────────────────────────────────────────────────

/// Poll until `check` holds (every 10ms, up to 5 seconds).
pub async fn wait_until<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Wait for the job's runner to exit, then return the final snapshot.
pub async fn wait_for_runner_exit(engine: &CaptionEngine, job_id: Uuid) -> CaptionJob {
    wait_until("runner to stop", || !engine.is_runner_active(job_id).unwrap()).await;
    engine.get_job(job_id).unwrap()
}

pub async fn wait_for_calls(backend: &FakeBackend, calls: usize) {
    wait_until(&format!("{} backend calls", calls), || backend.calls() >= calls).await;
}
