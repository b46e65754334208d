//! Job lifecycle tests against an in-memory database, catalog and scripted backend

mod helpers;

use std::sync::atomic::Ordering;

use caption_engine::{
    db::queries,
    models::{
        api::NewJobRequest,
        job::{CaptionJob, JobStatus},
        prompt::{CaptionSetPromptConfig, CaptionStyle},
        result::{FileOutcome, FileRef, PerFileResult},
        settings::{JobSettings, VisionBackendKind},
    },
    services::{engine::CaptionEngine, job_state::JobError, vision::VisionError},
};
use chrono::Utc;
use helpers::*;

fn overwrite() -> NewJobRequest {
    NewJobRequest {
        overwrite_existing: true,
        ..Default::default()
    }
}

fn assert_counters_consistent(job: &CaptionJob) {
    assert!(job.completed_files + job.failed_files <= job.total_files);
    if job.status == JobStatus::Completed {
        assert_eq!(job.completed_files + job.failed_files, job.total_files);
    }
}

#[tokio::test]
async fn test_job_runs_to_completion() {
    let catalog = MemoryCatalog::with_files(3);
    let backend = FakeBackend::new();
    let engine = engine(catalog.clone(), backend.clone()).await;

    let job = engine.create_job(SET_ID, overwrite()).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.total_files, 3);

    let job = wait_for_runner_exit(&engine, job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.completed_files, 3);
    assert_eq!(job.failed_files, 0);
    assert!(job.started_at.is_some());
    assert!(job.finished_at.is_some());
    assert!(job.current_file_id.is_none());

    let results = engine.job_results(job.id).unwrap();
    let order: Vec<_> = results.iter().map(|r| r.file_id.as_str()).collect();
    assert_eq!(order, vec!["f0", "f1", "f2"]);
    assert!(results.iter().all(|r| r.outcome == FileOutcome::Success));
    assert_eq!(results[0].quality.map(|q| q.overall), Some(0.75));

    assert_eq!(backend.calls(), 3);
    assert_eq!(catalog.written().len(), 3);
    assert_eq!(catalog.written()[0].vision_model, MODEL);

    let progress = engine.job_progress(job.id).unwrap();
    assert_eq!(progress.percent_complete, 100.0);
}

#[tokio::test]
async fn test_file_failures_do_not_stop_the_job() {
    let catalog = MemoryCatalog::with_files(4);
    catalog.remove_source("f3");
    let backend = FakeBackend::new();
    backend.push(Err(VisionError::Backend {
        status: 500,
        body: "model crashed".to_string(),
    }));
    backend.push(Ok("   ".to_string()));
    let engine = engine(catalog.clone(), backend.clone()).await;

    let job = engine.create_job(SET_ID, overwrite()).await.unwrap();
    let job = wait_for_runner_exit(&engine, job.id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.completed_files, 1);
    assert_eq!(job.failed_files, 3);
    assert_counters_consistent(&job);

    let results = engine.job_results(job.id).unwrap();
    assert!(results[0].error.as_deref().unwrap().contains("HTTP 500"));
    assert_eq!(results[1].error.as_deref(), Some("empty response"));
    assert_eq!(results[2].outcome, FileOutcome::Success);
    assert!(results[3].error.as_deref().unwrap().contains("source image"));
    for r in results.iter().filter(|r| r.outcome == FileOutcome::Failed) {
        assert!(r.caption.is_none());
        assert!(!r.error.as_deref().unwrap().is_empty());
    }
    // Backend errors are not retried; the unreadable file never reaches the backend.
    assert_eq!(backend.calls(), 3);
}

#[tokio::test]
async fn test_existing_captions_skipped_without_overwrite() {
    let catalog = MemoryCatalog::with_files(3);
    catalog.mark_captioned("f1");
    let backend = FakeBackend::new();
    let engine = engine(catalog.clone(), backend.clone()).await;

    let job = engine
        .create_job(SET_ID, NewJobRequest::default())
        .await
        .unwrap();
    let job = wait_for_runner_exit(&engine, job.id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.completed_files, 3);
    assert_eq!(job.skipped_files, 1);
    assert_eq!(backend.calls(), 2);

    let results = engine.job_results(job.id).unwrap();
    assert_eq!(results[1].outcome, FileOutcome::Skipped);
    assert!(catalog.written().iter().all(|c| c.file_id != "f1"));
}

#[tokio::test]
async fn test_overwrite_recaptions_existing_files() {
    let catalog = MemoryCatalog::with_files(2);
    catalog.mark_captioned("f0");
    let backend = FakeBackend::new();
    let engine = engine(catalog.clone(), backend.clone()).await;

    let job = engine.create_job(SET_ID, overwrite()).await.unwrap();
    let job = wait_for_runner_exit(&engine, job.id).await;
    assert_eq!(job.skipped_files, 0);
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn test_pause_and_resume_match_uninterrupted_run() {
    // Uninterrupted reference run.
    let reference_catalog = MemoryCatalog::with_files(4);
    let reference_backend = FakeBackend::new();
    let reference = engine(reference_catalog.clone(), reference_backend.clone()).await;
    let job = reference.create_job(SET_ID, overwrite()).await.unwrap();
    wait_for_runner_exit(&reference, job.id).await;
    let expected: Vec<(String, Option<String>)> = reference
        .job_results(job.id)
        .unwrap()
        .into_iter()
        .map(|r| (r.file_id, r.caption))
        .collect();

    let catalog = MemoryCatalog::with_files(4);
    let (backend, gate) = FakeBackend::gated();
    let engine = engine(catalog.clone(), backend.clone()).await;
    let job = engine.create_job(SET_ID, overwrite()).await.unwrap();

    // Let the first file through, then pause while the second is in flight.
    gate.add_permits(1);
    wait_for_calls(&backend, 2).await;
    let paused = engine.pause(job.id).await.unwrap();
    assert_eq!(paused.status, JobStatus::Paused);

    // The in-flight file still lands; nothing further is started.
    gate.add_permits(1);
    let stopped = wait_for_runner_exit(&engine, job.id).await;
    assert_eq!(stopped.status, JobStatus::Paused);
    assert_eq!(stopped.completed_files, 2);
    assert_eq!(backend.calls(), 2);

    // Already paused.
    assert!(matches!(
        engine.pause(job.id).await,
        Err(JobError::InvalidState(_))
    ));

    gate.add_permits(10);
    let resumed = engine.resume(job.id).await.unwrap();
    assert_eq!(resumed.status, JobStatus::Running);
    let done = wait_for_runner_exit(&engine, job.id).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(backend.calls(), 4, "no file may be processed twice");
    let actual: Vec<(String, Option<String>)> = engine
        .job_results(job.id)
        .unwrap()
        .into_iter()
        .map(|r| (r.file_id, r.caption))
        .collect();
    assert_eq!(actual, expected);
}

#[tokio::test]
async fn test_resume_requires_paused() {
    let catalog = MemoryCatalog::with_files(1);
    let backend = FakeBackend::new();
    let engine = engine(catalog, backend).await;
    let job = engine.create_job(SET_ID, overwrite()).await.unwrap();
    wait_for_runner_exit(&engine, job.id).await;

    assert!(matches!(
        engine.resume(job.id).await,
        Err(JobError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_cancel_preserves_results_and_discards_in_flight() {
    let catalog = MemoryCatalog::with_files(3);
    let (backend, gate) = FakeBackend::gated();
    let engine = engine(catalog.clone(), backend.clone()).await;
    let job = engine.create_job(SET_ID, overwrite()).await.unwrap();

    gate.add_permits(1);
    wait_for_calls(&backend, 2).await;
    let cancelled = engine.cancel(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.finished_at.is_some());

    gate.add_permits(10);
    let job = wait_for_runner_exit(&engine, job.id).await;

    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.completed_files, 1);
    assert_eq!(engine.job_results(job.id).unwrap().len(), 1);
    assert_eq!(catalog.written().len(), 1);
    assert_eq!(backend.calls(), 2);

    // Idempotent, and counters stay frozen.
    let again = engine.cancel(job.id).await.unwrap();
    assert_eq!(again.status, JobStatus::Cancelled);
    assert_eq!(again.completed_files, 1);
    assert!(matches!(
        engine.resume(job.id).await,
        Err(JobError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_cancel_during_caption_write_waits_for_it() {
    let catalog = MemoryCatalog::with_files(3);
    let write_gate = catalog.gate_writes();
    let engine = engine(catalog.clone(), FakeBackend::new()).await;
    let job = engine.create_job(SET_ID, overwrite()).await.unwrap();

    wait_until("first caption write", || catalog.writes_started() == 1).await;
    let cancel = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.cancel(job.id).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!cancel.is_finished());
    assert_eq!(engine.get_job(job.id).unwrap().status, JobStatus::Running);

    write_gate.add_permits(10);
    let cancelled = cancel.await.unwrap().unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    let job = wait_for_runner_exit(&engine, job.id).await;

    // Every caption in the catalog has a recorded result, and nothing came after the cancel.
    let results = engine.job_results(job.id).unwrap();
    assert_eq!(catalog.written().len(), results.len());
    assert_eq!(results.len(), 1);
    assert_eq!(job.completed_files, 1);
    assert_eq!(catalog.writes_started(), 1);
}

#[tokio::test]
async fn test_stalled_source_read_fails_file_after_timeout() {
    let catalog = MemoryCatalog::with_files(2);
    catalog.stall_reads_of("f0");
    let backend = FakeBackend::new();
    let mut defaults = defaults();
    defaults.timeout_seconds = 1;
    let engine = CaptionEngine::new(
        memory_pool().await,
        catalog.clone(),
        FakeProvider::new(backend.clone()),
        defaults,
    );

    let job = engine.create_job(SET_ID, overwrite()).await.unwrap();
    let job = wait_for_runner_exit(&engine, job.id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.failed_files, 1);
    assert_eq!(job.completed_files, 1);
    let results = engine.job_results(job.id).unwrap();
    assert_eq!(results[0].outcome, FileOutcome::Failed);
    assert!(results[0].error.as_deref().unwrap().contains("longer than 1s"));
    assert_eq!(results[1].outcome, FileOutcome::Success);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_cancel_pending_job_before_start() {
    let catalog = MemoryCatalog::with_files(2);
    let (backend, _gate) = FakeBackend::gated();
    let engine = engine(catalog, backend.clone()).await;

    let job = engine.create_job(SET_ID, overwrite()).await.unwrap();
    engine.cancel(job.id).await.unwrap();
    let job = wait_for_runner_exit(&engine, job.id).await;

    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.completed_files + job.failed_files, 0);
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn test_unreachable_backend_fails_job() {
    let catalog = MemoryCatalog::with_files(2);
    let backend = FakeBackend::new();
    backend.set_unreachable(true);
    let engine = engine(catalog, backend.clone()).await;

    let job = engine.create_job(SET_ID, overwrite()).await.unwrap();
    let job = wait_for_runner_exit(&engine, job.id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.as_deref().unwrap().contains("unreachable"));
    assert!(job.finished_at.is_some());
    assert_eq!(backend.calls(), 0);
    assert!(engine.job_results(job.id).unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_model_fails_job() {
    let catalog = MemoryCatalog::with_files(2);
    let backend = FakeBackend::new();
    backend.set_models(&["llava:latest"]);
    let engine = engine(catalog, backend.clone()).await;

    let job = engine.create_job(SET_ID, overwrite()).await.unwrap();
    let job = wait_for_runner_exit(&engine, job.id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.as_deref().unwrap().contains(MODEL));
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn test_invalid_custom_prompt_fails_job() {
    let catalog = MemoryCatalog::with_files(2);
    catalog.set_prompt(CaptionSetPromptConfig {
        style: CaptionStyle::Custom,
        custom_prompt: Some("  ".to_string()),
        ..Default::default()
    });
    let backend = FakeBackend::new();
    let engine = engine(catalog, backend.clone()).await;

    let job = engine.create_job(SET_ID, overwrite()).await.unwrap();
    let job = wait_for_runner_exit(&engine, job.id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.as_deref().unwrap().contains("custom prompt"));
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn test_unavailable_backend_retried_once() {
    let catalog = MemoryCatalog::with_files(2);
    let backend = FakeBackend::new();
    backend.push(Err(VisionError::Timeout));
    backend.push(Ok(caption_json("a retried caption")));
    backend.push(Err(VisionError::Connection("refused".to_string())));
    backend.push(Err(VisionError::Timeout));
    let engine = engine(catalog, backend.clone()).await;

    let job = engine.create_job(SET_ID, overwrite()).await.unwrap();
    let job = wait_for_runner_exit(&engine, job.id).await;

    assert_eq!(backend.calls(), 4);
    assert_eq!(job.completed_files, 1);
    assert_eq!(job.failed_files, 1);
    let results = engine.job_results(job.id).unwrap();
    assert_eq!(results[0].caption.as_deref(), Some("a retried caption"));
    assert!(results[1].error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_trigger_phrase_and_length_applied() {
    let catalog = MemoryCatalog::with_files(1);
    catalog.set_prompt(CaptionSetPromptConfig {
        style: CaptionStyle::Natural,
        trigger_phrase: Some("ohwx woman".to_string()),
        max_length: Some(40),
        ..Default::default()
    });
    let backend = FakeBackend::new();
    backend.set_default(caption_json(
        "a woman standing in a sunlit field of tall grass at golden hour",
    ));
    let engine = engine(catalog.clone(), backend).await;

    let job = engine.create_job(SET_ID, overwrite()).await.unwrap();
    wait_for_runner_exit(&engine, job.id).await;

    let written = catalog.written();
    assert!(written[0].text.starts_with("ohwx woman, "));
    assert!(written[0].text.chars().count() <= 40);
    assert!(written[0].flags.contains("truncated"));

    let results = engine.job_results(job.id).unwrap();
    assert_eq!(results[0].caption.as_deref(), Some(written[0].text.as_str()));
}

#[tokio::test]
async fn test_raw_text_response_recorded_without_quality() {
    let catalog = MemoryCatalog::with_files(1);
    let backend = FakeBackend::new();
    backend.set_default("Caption: A red bicycle leaning on a wall".to_string());
    let engine = engine(catalog, backend).await;

    let job = engine.create_job(SET_ID, overwrite()).await.unwrap();
    wait_for_runner_exit(&engine, job.id).await;

    let results = engine.job_results(job.id).unwrap();
    assert_eq!(results[0].outcome, FileOutcome::Success);
    assert_eq!(
        results[0].caption.as_deref(),
        Some("A red bicycle leaning on a wall")
    );
    assert!(results[0].quality.is_none());
}

#[tokio::test]
async fn test_sink_failure_marks_file_failed() {
    let catalog = MemoryCatalog::with_files(1);
    catalog.fail_writes.store(true, Ordering::SeqCst);
    let backend = FakeBackend::new();
    let engine = engine(catalog, backend).await;

    let job = engine.create_job(SET_ID, overwrite()).await.unwrap();
    let job = wait_for_runner_exit(&engine, job.id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.failed_files, 1);
    assert!(job.last_error.as_deref().unwrap().contains("disk full"));
}

#[tokio::test]
async fn test_one_active_job_per_caption_set() {
    let catalog = MemoryCatalog::with_files(2);
    let (backend, gate) = FakeBackend::gated();
    let engine = engine(catalog, backend).await;

    let first = engine.create_job(SET_ID, overwrite()).await.unwrap();
    assert!(matches!(
        engine.create_job(SET_ID, overwrite()).await,
        Err(JobError::InvalidState(_))
    ));

    gate.add_permits(10);
    wait_for_runner_exit(&engine, first.id).await;
    let second = engine.create_job(SET_ID, overwrite()).await.unwrap();
    assert_ne!(first.id, second.id);

    // Newest first.
    let jobs = engine.list_jobs();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].id, second.id);
}

#[tokio::test]
async fn test_unknown_caption_set_and_job() {
    let engine = engine(MemoryCatalog::with_files(1), FakeBackend::new()).await;

    assert!(matches!(
        engine.create_job("nope", NewJobRequest::default()).await,
        Err(JobError::NotFound(_))
    ));
    let missing = uuid::Uuid::new_v4();
    assert!(matches!(engine.get_job(missing), Err(JobError::NotFound(_))));
    assert!(matches!(engine.pause(missing).await, Err(JobError::NotFound(_))));
    assert!(matches!(engine.cancel(missing).await, Err(JobError::NotFound(_))));
}

#[tokio::test]
async fn test_request_overrides_frozen_into_job() {
    let catalog = MemoryCatalog::with_files(1);
    let backend = FakeBackend::new();
    backend.set_models(&["llava:latest"]);
    let engine = engine(catalog, backend).await;

    let job = engine
        .create_job(
            SET_ID,
            NewJobRequest {
                overwrite_existing: true,
                vision_model: Some("llava".to_string()),
                vision_backend: Some(VisionBackendKind::LmStudio),
            },
        )
        .await
        .unwrap();
    assert_eq!(job.settings.vision.model, "llava");
    assert_eq!(job.settings.vision.backend, VisionBackendKind::LmStudio);
    assert_eq!(job.settings.vision.base_url, "http://localhost:1234");

    let job = wait_for_runner_exit(&engine, job.id).await;
    assert_eq!(job.status, JobStatus::Completed);

    let invalid = NewJobRequest {
        vision_model: Some(String::new()),
        ..Default::default()
    };
    assert!(matches!(
        engine.create_job(SET_ID, invalid).await,
        Err(JobError::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn test_empty_caption_set_completes() {
    let engine = engine(MemoryCatalog::with_files(0), FakeBackend::new()).await;
    let job = engine.create_job(SET_ID, overwrite()).await.unwrap();
    let job = wait_for_runner_exit(&engine, job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total_files, 0);
}

#[tokio::test]
async fn test_snapshots_never_show_torn_counters() {
    let catalog = MemoryCatalog::with_files(12);
    let backend = FakeBackend::new();
    backend.push(Err(VisionError::Backend {
        status: 503,
        body: String::new(),
    }));
    let engine = engine(catalog, backend).await;
    let job = engine.create_job(SET_ID, overwrite()).await.unwrap();

    let job_id = job.id;
    let readers = (0..3).map(|_| {
        let engine = engine.clone();
        tokio::spawn(async move {
            loop {
                let snapshot = engine.get_job(job_id).unwrap();
                assert_counters_consistent(&snapshot);
                let progress = engine.job_progress(job_id).unwrap();
                assert!(progress.percent_complete <= 100.0);
                if snapshot.status.is_terminal() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
    });

    for reader in futures::future::join_all(readers).await {
        reader.unwrap();
    }
    let job = wait_for_runner_exit(&engine, job.id).await;
    assert_eq!(job.completed_files + job.failed_files, 12);
}

#[tokio::test]
async fn test_delete_only_finished_jobs() {
    let catalog = MemoryCatalog::with_files(2);
    let (backend, gate) = FakeBackend::gated();
    let engine = engine(catalog, backend).await;
    let job = engine.create_job(SET_ID, overwrite()).await.unwrap();

    assert!(matches!(
        engine.delete_job(job.id).await,
        Err(JobError::InvalidState(_))
    ));

    gate.add_permits(10);
    wait_for_runner_exit(&engine, job.id).await;
    engine.delete_job(job.id).await.unwrap();
    assert!(matches!(engine.get_job(job.id), Err(JobError::NotFound(_))));
}

#[tokio::test]
async fn test_recover_pauses_interrupted_and_restarts_pending() {
    let pool = memory_pool().await;
    let catalog = MemoryCatalog::with_files(3);
    let files: Vec<FileRef> = catalog.files.lock().unwrap().clone();

    let defaults = defaults();
    let settings = JobSettings {
        vision: defaults.vision_for(&NewJobRequest::default()),
        preprocess: defaults.preprocess.clone(),
        prompt: CaptionSetPromptConfig::default(),
        overwrite_existing: true,
    };

    // A job that was mid-run when the process stopped.
    let mut interrupted = CaptionJob::new(SET_ID, 3, settings.clone());
    interrupted.start(Utc::now()).unwrap();
    interrupted.current_file_id = Some("f1".to_string());
    queries::insert_job(&pool, &interrupted, &files).await.unwrap();
    let first = PerFileResult::success("f0", 0, "already done".to_string(), None, Default::default());
    interrupted.apply_result(&first, Utc::now()).unwrap();
    queries::record_result(&pool, &interrupted, &first).await.unwrap();

    let pending = CaptionJob::new("set-2", 1, settings);
    queries::insert_job(&pool, &pending, &files[..1]).await.unwrap();

    let backend = FakeBackend::new();
    let engine = engine_on(pool.clone(), catalog.clone(), backend.clone());
    assert_eq!(engine.recover().await.unwrap(), 2);

    let restored = engine.get_job(interrupted.id).unwrap();
    assert_eq!(restored.status, JobStatus::Paused);
    assert_eq!(restored.completed_files, 1);
    assert!(restored.current_file_id.is_none());
    assert!(!engine.is_runner_active(interrupted.id).unwrap());
    let stored = queries::get_job(&pool, interrupted.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Paused);

    let pending_done = wait_for_runner_exit(&engine, pending.id).await;
    assert_eq!(pending_done.status, JobStatus::Completed);

    engine.resume(interrupted.id).await.unwrap();
    let done = wait_for_runner_exit(&engine, interrupted.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.completed_files, 3);
    // One call for the pending job, two for the remaining files.
    assert_eq!(backend.calls(), 3);

    let results = engine.job_results(interrupted.id).unwrap();
    assert_eq!(results[0].caption.as_deref(), Some("already done"));
}
