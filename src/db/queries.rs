use std::collections::BTreeSet;
use std::str::FromStr;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::models::job::{CaptionJob, JobStatus};
use crate::models::result::{FileOutcome, FileRef, PerFileResult, QualityScores};
use crate::models::settings::JobSettings;

const JOB_COLUMNS: &str = r#"
    id, caption_set_id, status, total_files, completed_files, failed_files,
    skipped_files, current_file_id, last_error, settings, created_at, started_at,
    finished_at
"#;

fn decode_err<E>(err: E) -> sqlx::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    sqlx::Error::Decode(Box::new(err))
}

fn count(row: &SqliteRow, column: &str) -> Result<u32, sqlx::Error> {
    let value: i64 = row.try_get(column)?;
    u32::try_from(value).map_err(decode_err)
}

fn job_from_row(row: &SqliteRow) -> Result<CaptionJob, sqlx::Error> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let settings: String = row.try_get("settings")?;

    Ok(CaptionJob {
        id: Uuid::parse_str(&id).map_err(decode_err)?,
        caption_set_id: row.try_get("caption_set_id")?,
        status: JobStatus::from_str(&status).map_err(decode_err)?,
        total_files: count(row, "total_files")?,
        completed_files: count(row, "completed_files")?,
        failed_files: count(row, "failed_files")?,
        skipped_files: count(row, "skipped_files")?,
        current_file_id: row.try_get("current_file_id")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        settings: serde_json::from_str::<JobSettings>(&settings).map_err(decode_err)?,
    })
}

fn result_from_row(row: &SqliteRow) -> Result<PerFileResult, sqlx::Error> {
    let outcome: String = row.try_get("outcome")?;
    let quality: Option<String> = row.try_get("quality")?;
    let flags: String = row.try_get("flags")?;
    let processing_ms: i64 = row.try_get("processing_ms")?;

    Ok(PerFileResult {
        file_id: row.try_get("file_id")?,
        position: count(row, "position")?,
        outcome: FileOutcome::from_str(&outcome).map_err(decode_err)?,
        caption: row.try_get("caption")?,
        quality: quality
            .map(|q| serde_json::from_str::<QualityScores>(&q))
            .transpose()
            .map_err(decode_err)?,
        flags: serde_json::from_str::<BTreeSet<String>>(&flags).map_err(decode_err)?,
        error: row.try_get("error")?,
        processing_ms: u64::try_from(processing_ms).unwrap_or_default(),
        recorded_at: row.try_get("recorded_at")?,
    })
}

fn encode_err(err: serde_json::Error) -> sqlx::Error {
    sqlx::Error::Encode(Box::new(err))
}

/// Write every mutable column of a job row.
async fn write_job(conn: &mut SqliteConnection, job: &CaptionJob) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE caption_jobs
        SET status = $1,
            completed_files = $2,
            failed_files = $3,
            skipped_files = $4,
            current_file_id = $5,
            last_error = $6,
            started_at = $7,
            finished_at = $8
        WHERE id = $9
        "#,
    )
    .bind(job.status.to_string())
    .bind(i64::from(job.completed_files))
    .bind(i64::from(job.failed_files))
    .bind(i64::from(job.skipped_files))
    .bind(job.current_file_id.as_deref())
    .bind(job.last_error.as_deref())
    .bind(job.started_at)
    .bind(job.finished_at)
    .bind(job.id.to_string())
    .execute(conn)
    .await?;

    Ok(())
}

/// Insert a new job together with its frozen target list.
pub async fn insert_job(
    pool: &SqlitePool,
    job: &CaptionJob,
    targets: &[FileRef],
) -> Result<(), sqlx::Error> {
    let settings = serde_json::to_string(&job.settings).map_err(encode_err)?;
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO caption_jobs (
            id, caption_set_id, status, vision_backend, vision_model, overwrite_existing,
            total_files, completed_files, failed_files, skipped_files, current_file_id,
            last_error, settings, created_at, started_at, finished_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(job.id.to_string())
    .bind(&job.caption_set_id)
    .bind(job.status.to_string())
    .bind(job.settings.vision.backend.to_string())
    .bind(&job.settings.vision.model)
    .bind(job.settings.overwrite_existing)
    .bind(i64::from(job.total_files))
    .bind(i64::from(job.completed_files))
    .bind(i64::from(job.failed_files))
    .bind(i64::from(job.skipped_files))
    .bind(job.current_file_id.as_deref())
    .bind(job.last_error.as_deref())
    .bind(settings)
    .bind(job.created_at)
    .bind(job.started_at)
    .bind(job.finished_at)
    .execute(&mut *tx)
    .await?;

    for (position, file) in targets.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO caption_job_files (job_id, position, file_id, filename)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(job.id.to_string())
        .bind(position as i64)
        .bind(&file.id)
        .bind(&file.filename)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await
}

/// Persist job status, counters and timestamps.
pub async fn update_job(pool: &SqlitePool, job: &CaptionJob) -> Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    write_job(&mut conn, job).await
}

/// Insert a file result and the job counters it produced in one transaction.
pub async fn record_result(
    pool: &SqlitePool,
    job: &CaptionJob,
    result: &PerFileResult,
) -> Result<(), sqlx::Error> {
    let quality = result
        .quality
        .map(|q| serde_json::to_string(&q))
        .transpose()
        .map_err(encode_err)?;
    let flags = serde_json::to_string(&result.flags).map_err(encode_err)?;

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO caption_job_results (
            job_id, file_id, position, outcome, caption, quality, flags, error,
            processing_ms, recorded_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(job.id.to_string())
    .bind(&result.file_id)
    .bind(i64::from(result.position))
    .bind(result.outcome.to_string())
    .bind(result.caption.as_deref())
    .bind(quality)
    .bind(flags)
    .bind(result.error.as_deref())
    .bind(i64::try_from(result.processing_ms).unwrap_or(i64::MAX))
    .bind(result.recorded_at)
    .execute(&mut *tx)
    .await?;

    write_job(&mut tx, job).await?;

    tx.commit().await
}

/// Get a job by ID
pub async fn get_job(pool: &SqlitePool, job_id: Uuid) -> Result<Option<CaptionJob>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {} FROM caption_jobs WHERE id = $1", JOB_COLUMNS))
        .bind(job_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// All jobs, oldest first.
pub async fn list_jobs(pool: &SqlitePool) -> Result<Vec<CaptionJob>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM caption_jobs ORDER BY created_at ASC",
        JOB_COLUMNS
    ))
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}

/// Target files of a job in discovery order.
pub async fn job_files(pool: &SqlitePool, job_id: Uuid) -> Result<Vec<FileRef>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT file_id, filename
        FROM caption_job_files
        WHERE job_id = $1
        ORDER BY position ASC
        "#,
    )
    .bind(job_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|r| {
            Ok(FileRef {
                id: r.try_get("file_id")?,
                filename: r.try_get("filename")?,
            })
        })
        .collect()
}

/// Recorded results of a job in file order.
pub async fn job_results(
    pool: &SqlitePool,
    job_id: Uuid,
) -> Result<Vec<PerFileResult>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT file_id, position, outcome, caption, quality, flags, error,
               processing_ms, recorded_at
        FROM caption_job_results
        WHERE job_id = $1
        ORDER BY position ASC
        "#,
    )
    .bind(job_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(result_from_row).collect()
}

/// Delete a job and its history.
pub async fn delete_job(pool: &SqlitePool, job_id: Uuid) -> Result<bool, sqlx::Error> {
    let id = job_id.to_string();
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM caption_job_results WHERE job_id = $1")
        .bind(&id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM caption_job_files WHERE job_id = $1")
        .bind(&id)
        .execute(&mut *tx)
        .await?;
    let deleted = sqlx::query("DELETE FROM caption_jobs WHERE id = $1")
        .bind(&id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    tx.commit().await?;
    Ok(deleted > 0)
}
