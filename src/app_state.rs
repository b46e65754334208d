use sqlx::SqlitePool;

use crate::services::engine::CaptionEngine;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub engine: CaptionEngine,
}

impl AppState {
    pub fn new(db: SqlitePool, engine: CaptionEngine) -> Self {
        Self { db, engine }
    }
}
