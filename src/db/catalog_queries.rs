use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::result::FileRef;

/// Caption set columns that shape the prompt.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CaptionSetRow {
    pub id: String,
    pub dataset_id: String,
    pub style: String,
    pub custom_prompt: Option<String>,
    pub trigger_phrase: Option<String>,
    pub max_length: Option<i64>,
}

/// Caption text and metadata written by an auto-caption job.
#[derive(Debug, Clone)]
pub struct NewCaption<'a> {
    pub caption_set_id: &'a str,
    pub file_id: &'a str,
    pub text: &'a str,
    pub vision_model: &'a str,
    pub quality_score: Option<f64>,
    pub quality_flags: Option<String>,
}

pub async fn get_caption_set(
    pool: &SqlitePool,
    caption_set_id: &str,
) -> Result<Option<CaptionSetRow>, sqlx::Error> {
    sqlx::query_as::<_, CaptionSetRow>(
        r#"
        SELECT id, dataset_id, style, custom_prompt, trigger_phrase, max_length
        FROM caption_sets
        WHERE id = $1
        "#,
    )
    .bind(caption_set_id)
    .fetch_optional(pool)
    .await
}

/// Files of the caption set's dataset, in discovery order.
pub async fn list_caption_set_files(
    pool: &SqlitePool,
    caption_set_id: &str,
) -> Result<Vec<FileRef>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT f.id, f.filename
        FROM caption_sets cs
        JOIN dataset_files df ON df.dataset_id = cs.dataset_id
        JOIN tracked_files f ON f.id = df.file_id
        WHERE cs.id = $1
        ORDER BY df.ordinal ASC, f.discovered_at ASC, f.id ASC
        "#,
    )
    .bind(caption_set_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|r| {
            Ok(FileRef {
                id: r.try_get("id")?,
                filename: r.try_get("filename")?,
            })
        })
        .collect()
}

pub async fn get_file(pool: &SqlitePool, file_id: &str) -> Result<Option<FileRef>, sqlx::Error> {
    let row = sqlx::query("SELECT id, filename FROM tracked_files WHERE id = $1")
        .bind(file_id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| {
        Ok(FileRef {
            id: r.try_get("id")?,
            filename: r.try_get("filename")?,
        })
    })
    .transpose()
}

pub async fn file_path(pool: &SqlitePool, file_id: &str) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query("SELECT path FROM tracked_files WHERE id = $1")
        .bind(file_id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| r.try_get("path")).transpose()
}

/// Whether the file already has a non-empty caption in the caption set.
pub async fn has_caption(
    pool: &SqlitePool,
    caption_set_id: &str,
    file_id: &str,
) -> Result<bool, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT 1 AS present
        FROM captions
        WHERE caption_set_id = $1 AND file_id = $2 AND length(trim(text)) > 0
        "#,
    )
    .bind(caption_set_id)
    .bind(file_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

/// Create or replace a generated caption.
///
/// An existing caption is first copied into `caption_versions`. The quality
/// score is mirrored onto the dataset file when present.
pub async fn upsert_generated_caption(
    pool: &SqlitePool,
    caption: &NewCaption<'_>,
) -> Result<(), sqlx::Error> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let existing = sqlx::query(
        r#"
        SELECT id, text, source, vision_model, quality_score, quality_flags
        FROM captions
        WHERE caption_set_id = $1 AND file_id = $2
        "#,
    )
    .bind(caption.caption_set_id)
    .bind(caption.file_id)
    .fetch_optional(&mut *tx)
    .await?;

    match existing {
        Some(row) => {
            let caption_id: String = row.try_get("id")?;
            let old_source: String = row.try_get("source")?;
            let version: i64 = sqlx::query(
                "SELECT COUNT(*) AS n FROM caption_versions WHERE caption_id = $1",
            )
            .bind(&caption_id)
            .fetch_one(&mut *tx)
            .await?
            .try_get("n")?;

            sqlx::query(
                r#"
                INSERT INTO caption_versions (
                    id, caption_id, version_number, text, operation, operation_description,
                    source, vision_model, quality_score, quality_flags, created_at
                )
                VALUES ($1, $2, $3, $4, 'auto_generate_generated', $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&caption_id)
            .bind(version + 1)
            .bind(row.try_get::<String, _>("text")?)
            .bind(format!("Updated caption from {} to generated", old_source))
            .bind(&old_source)
            .bind(row.try_get::<Option<String>, _>("vision_model")?)
            .bind(row.try_get::<Option<f64>, _>("quality_score")?)
            .bind(row.try_get::<Option<String>, _>("quality_flags")?)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                UPDATE captions
                SET text = $1,
                    source = 'generated',
                    vision_model = $2,
                    quality_score = COALESCE($3, quality_score),
                    quality_flags = COALESCE($4, quality_flags),
                    updated_at = $5
                WHERE id = $6
                "#,
            )
            .bind(caption.text)
            .bind(caption.vision_model)
            .bind(caption.quality_score)
            .bind(caption.quality_flags.as_deref())
            .bind(now)
            .bind(&caption_id)
            .execute(&mut *tx)
            .await?;
        }
        None => {
            sqlx::query(
                r#"
                INSERT INTO captions (
                    id, caption_set_id, file_id, text, source, vision_model,
                    quality_score, quality_flags, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, 'generated', $5, $6, $7, $8, $8)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(caption.caption_set_id)
            .bind(caption.file_id)
            .bind(caption.text)
            .bind(caption.vision_model)
            .bind(caption.quality_score)
            .bind(caption.quality_flags.as_deref())
            .bind(now)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                UPDATE caption_sets
                SET caption_count = (SELECT COUNT(*) FROM captions WHERE caption_set_id = $1)
                WHERE id = $1
                "#,
            )
            .bind(caption.caption_set_id)
            .execute(&mut *tx)
            .await?;
        }
    }

    if caption.quality_score.is_some() {
        sqlx::query(
            r#"
            UPDATE dataset_files
            SET quality_score = $1,
                quality_flags = COALESCE($2, quality_flags)
            WHERE file_id = $3
              AND dataset_id = (SELECT dataset_id FROM caption_sets WHERE id = $4)
            "#,
        )
        .bind(caption.quality_score)
        .bind(caption.quality_flags.as_deref())
        .bind(caption.file_id)
        .bind(caption.caption_set_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await
}
