use std::collections::BTreeSet;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::db::catalog_queries::{self, NewCaption};
use crate::models::prompt::{CaptionSetPromptConfig, CaptionStyle};
use crate::models::result::{FileRef, QualityScores};

/// A caption produced by a job, ready to be written to the caption set.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedCaption {
    pub file_id: String,
    pub text: String,
    pub vision_model: String,
    pub quality: Option<QualityScores>,
    pub flags: BTreeSet<String>,
}

/// The dataset/caption store a job reads from and writes into.
#[async_trait]
pub trait CaptionCatalog: Send + Sync {
    async fn prompt_config(&self, caption_set_id: &str)
        -> Result<CaptionSetPromptConfig, CatalogError>;

    /// Files of the caption set in discovery order.
    async fn list_files(&self, caption_set_id: &str) -> Result<Vec<FileRef>, CatalogError>;

    /// A tracked file looked up by id, independent of any caption set.
    async fn find_file(&self, file_id: &str) -> Result<FileRef, CatalogError>;

    /// Raw bytes of a file's source image.
    async fn read_source(&self, file: &FileRef) -> Result<Vec<u8>, CatalogError>;

    async fn has_caption(&self, caption_set_id: &str, file_id: &str) -> Result<bool, CatalogError>;

    async fn write_caption(
        &self,
        caption_set_id: &str,
        caption: &GeneratedCaption,
    ) -> Result<(), CatalogError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("file read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid catalog data: {0}")]
    Invalid(String),
}

/// Catalog backed by the application's SQLite tables and the local filesystem.
#[derive(Clone)]
pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CaptionCatalog for SqliteCatalog {
    async fn prompt_config(
        &self,
        caption_set_id: &str,
    ) -> Result<CaptionSetPromptConfig, CatalogError> {
        let row = catalog_queries::get_caption_set(&self.pool, caption_set_id)
            .await?
            .ok_or_else(|| CatalogError::NotFound(format!("caption set {}", caption_set_id)))?;

        let style = CaptionStyle::from_str(&row.style)
            .map_err(|_| CatalogError::Invalid(format!("unknown caption style '{}'", row.style)))?;
        let max_length = row
            .max_length
            .map(u32::try_from)
            .transpose()
            .map_err(|_| CatalogError::Invalid("max_length out of range".to_string()))?;

        Ok(CaptionSetPromptConfig {
            style,
            custom_prompt: row.custom_prompt,
            trigger_phrase: row.trigger_phrase,
            max_length,
        })
    }

    async fn list_files(&self, caption_set_id: &str) -> Result<Vec<FileRef>, CatalogError> {
        if catalog_queries::get_caption_set(&self.pool, caption_set_id)
            .await?
            .is_none()
        {
            return Err(CatalogError::NotFound(format!(
                "caption set {}",
                caption_set_id
            )));
        }
        Ok(catalog_queries::list_caption_set_files(&self.pool, caption_set_id).await?)
    }

    async fn find_file(&self, file_id: &str) -> Result<FileRef, CatalogError> {
        catalog_queries::get_file(&self.pool, file_id)
            .await?
            .ok_or_else(|| CatalogError::NotFound(format!("file {}", file_id)))
    }

    async fn read_source(&self, file: &FileRef) -> Result<Vec<u8>, CatalogError> {
        let path = catalog_queries::file_path(&self.pool, &file.id)
            .await?
            .ok_or_else(|| CatalogError::NotFound(format!("file {}", file.id)))?;
        Ok(tokio::fs::read(&path).await?)
    }

    async fn has_caption(&self, caption_set_id: &str, file_id: &str) -> Result<bool, CatalogError> {
        Ok(catalog_queries::has_caption(&self.pool, caption_set_id, file_id).await?)
    }

    async fn write_caption(
        &self,
        caption_set_id: &str,
        caption: &GeneratedCaption,
    ) -> Result<(), CatalogError> {
        let quality_flags = if caption.quality.is_some() || !caption.flags.is_empty() {
            Some(
                serde_json::to_string(&caption.flags)
                    .map_err(|e| CatalogError::Invalid(e.to_string()))?,
            )
        } else {
            None
        };

        catalog_queries::upsert_generated_caption(
            &self.pool,
            &NewCaption {
                caption_set_id,
                file_id: &caption.file_id,
                text: &caption.text,
                vision_model: &caption.vision_model,
                quality_score: caption.quality.map(|q| q.overall),
                quality_flags,
            },
        )
        .await?;
        Ok(())
    }
}
