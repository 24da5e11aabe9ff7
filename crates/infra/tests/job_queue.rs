//! End-to-end behavior of the public `JobQueue` API.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use serde_json::{Value, json};

use jobqueue_core::{
    BuiltinJobKind, Clock, Job, JobError, JobFailure, JobFilter, JobOptions, JobStatus,
    ManualClock,
};
use jobqueue_events::JobEvent;
use jobqueue_infra::{
    InMemoryJobBackend, JobBackend, JobHandlers, JobQueue, JobStatusUpdate, Page, QueueConfig,
    RecoveryReport,
};

fn start_of_march() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
}

async fn queue_over(backend: Arc<InMemoryJobBackend>, clock: Arc<ManualClock>) -> JobQueue {
    jobqueue_observability::init();
    JobQueue::builder(QueueConfig::default())
        .with_backend(backend)
        .with_clock(clock)
        .build()
        .await
}

#[tokio::test]
async fn transcription_scenario_exhausts_retries() {
    let backend = InMemoryJobBackend::arc();
    let clock = Arc::new(ManualClock::new(start_of_march()));
    let queue = queue_over(backend.clone(), clock.clone()).await;
    let events = queue.subscribe();

    let job = queue
        .create_job("transcribe", json!({"audioRef": "a1"}), &JobOptions::default())
        .await
        .unwrap();
    assert_eq!(job.max_attempts, 3);

    for attempt in 1..=3u32 {
        clock.advance(Duration::seconds(1));
        queue
            .update_job_status(&job.job_id, JobStatusUpdate::Processing)
            .await
            .unwrap();
        let failed = queue
            .update_job_status(
                &job.job_id,
                JobStatusUpdate::Failed(JobFailure::new("boom", clock.now())),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.attempts, attempt);

        if attempt < 3 {
            let retried = queue.retry_job(&job.job_id).await.unwrap();
            assert_eq!(retried.status, JobStatus::Pending);
            assert_eq!(retried.attempts, attempt);
        }
    }

    let err = queue.retry_job(&job.job_id).await.unwrap_err();
    assert_eq!(err.to_string(), format!("job {} has exceeded maximum retry attempts (3)", job.job_id));

    let stored = backend.find_one(&job.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.attempts, 3);
    assert_eq!(stored.error.unwrap().message, "boom");

    let retried = events
        .drain()
        .into_iter()
        .filter(|e| matches!(e, JobEvent::Retried { .. }))
        .count();
    assert_eq!(retried, 2);
}

#[tokio::test]
async fn restart_demotes_orphans_exactly_once() {
    let backend = InMemoryJobBackend::arc();
    let clock = Arc::new(ManualClock::new(start_of_march()));

    let (orphan, waiting, finished) = {
        let before = queue_over(backend.clone(), clock.clone()).await;
        let orphan = before.create_job("ollama-chat", json!({"n": 1}), &JobOptions::default()).await.unwrap();
        let waiting = before.create_job("ollama-chat", json!({"n": 2}), &JobOptions::default()).await.unwrap();
        let finished = before.create_job("ollama-chat", json!({"n": 3}), &JobOptions::default()).await.unwrap();

        before.update_job_status(&orphan.job_id, JobStatusUpdate::Processing).await.unwrap();
        before.update_job_status(&finished.job_id, JobStatusUpdate::Processing).await.unwrap();
        before
            .update_job_status(&finished.job_id, JobStatusUpdate::Completed(json!("ok")))
            .await
            .unwrap();
        (orphan, waiting, finished)
    };

    // Same store, fresh process.
    let after = queue_over(backend.clone(), clock.clone()).await;
    let events = after.subscribe();
    assert_eq!(after.resume_pending_jobs().await, 2);

    let orphan_now = after.get_job(&orphan.job_id).await.unwrap();
    assert_eq!(orphan_now.status, JobStatus::Pending);
    assert_eq!(orphan_now.attempts, 0);
    assert!(orphan_now.result.is_none() && orphan_now.error.is_none());

    let waiting_now = after.get_job(&waiting.job_id).await.unwrap();
    assert_eq!(waiting_now.version, waiting.version);
    assert_eq!(after.get_job(&finished.job_id).await.unwrap().status, JobStatus::Completed);

    let demotions = events
        .drain()
        .into_iter()
        .filter(|e| matches!(e, JobEvent::Updated { job } if job.job_id == orphan.job_id))
        .count();
    assert_eq!(demotions, 1);

    // A second pass finds nothing left to demote.
    assert_eq!(after.resume_pending_jobs().await, 2);
    assert!(events.drain().iter().all(|e| !matches!(e, JobEvent::Updated { .. })));
}

struct LlmOnly;

#[async_trait]
impl JobHandlers for LlmOnly {
    type Kind = BuiltinJobKind;

    async fn handle(&self, kind: BuiltinJobKind, data: Value) -> anyhow::Result<Value> {
        match kind {
            BuiltinJobKind::OllamaChat | BuiltinJobKind::OllamaCompletion => {
                Ok(json!({"reply": data["prompt"]}))
            }
            BuiltinJobKind::WhisperTranscription => Err(anyhow!("whisper backend offline")),
        }
    }
}

#[tokio::test]
async fn resumed_jobs_are_redispatched() {
    let backend = InMemoryJobBackend::arc();
    let clock = Arc::new(ManualClock::new(start_of_march()));
    let queue = queue_over(backend, clock).await;

    let chat = queue
        .create_job("ollama-completion", json!({"prompt": "hello"}), &JobOptions::default())
        .await
        .unwrap();
    let audio = queue
        .create_job("whisper-transcription", json!({}), &JobOptions::default())
        .await
        .unwrap();
    let unknown = queue.create_job("pdf-render", json!({}), &JobOptions::default()).await.unwrap();

    queue.resume_pending_jobs().await;
    let report = queue.process_pending_jobs(&LlmOnly).await;
    assert_eq!(
        report,
        RecoveryReport {
            processed: 3,
            succeeded: 1,
            failed: 1,
            dead_lettered: 1,
        }
    );

    let chat = queue.get_job(&chat.job_id).await.unwrap();
    assert_eq!(chat.result, Some(json!({"reply": "hello"})));
    assert_eq!(queue.get_job(&audio.job_id).await.unwrap().attempts, 1);
    assert_eq!(queue.get_job(&unknown.job_id).await.unwrap().status, JobStatus::Failed);

    // Nothing pending is left behind.
    let pending = queue
        .get_all_jobs(&JobFilter::all().with_status(JobStatus::Pending), Page::all())
        .await;
    assert!(pending.is_empty());
}

#[tokio::test]
async fn wrap_reports_both_outcomes() {
    let queue = JobQueue::in_memory().await;

    let ok = queue
        .wrap("summarize", |_| async { Ok("short") }, json!({"doc": 1}), &JobOptions::default())
        .await
        .unwrap();
    let ok_wire = serde_json::to_value(&ok).unwrap();
    assert_eq!(ok_wire, json!({"success": true, "jobId": ok.job_id.as_str(), "result": "short"}));
    assert_eq!(queue.get_job(&ok.job_id).await.unwrap().status, JobStatus::Completed);

    let failed = queue
        .wrap::<_, _, Value>("summarize", |_| async { Err(anyhow!("boom")) }, json!({"doc": 2}), &JobOptions::default())
        .await
        .unwrap_err();
    let job_id = failed.job_id.clone().unwrap();
    assert_eq!(
        serde_json::to_value(&failed).unwrap(),
        json!({"success": false, "jobId": job_id.as_str(), "error": "boom", "canRetry": true})
    );
    let job: Job = queue.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);

    let chat = queue
        .wrap_kind(BuiltinJobKind::OllamaChat, |_| async { Ok(json!("hi")) }, json!({}), &JobOptions::default())
        .await
        .unwrap();
    assert_eq!(queue.get_job(&chat.job_id).await.unwrap().timeout_ms, 1_200_000);
}

#[tokio::test]
async fn cleanup_counts_cache_and_store_separately() {
    let backend = InMemoryJobBackend::arc();
    let clock = Arc::new(ManualClock::new(start_of_march()));
    let queue = queue_over(backend.clone(), clock.clone()).await;

    let mut old = Vec::new();
    for n in 0..3 {
        let job = queue.create_job("chat", json!({"n": n}), &JobOptions::default()).await.unwrap();
        queue.update_job_status(&job.job_id, JobStatusUpdate::Processing).await.unwrap();
        queue
            .update_job_status(&job.job_id, JobStatusUpdate::Completed(json!(n)))
            .await
            .unwrap();
        old.push(job);
    }
    let old_pending = queue.create_job("chat", json!({"n": 9}), &JobOptions::default()).await.unwrap();

    clock.advance(Duration::days(8));
    let recent = queue.create_job("chat", json!({"n": 10}), &JobOptions::default()).await.unwrap();
    queue.update_job_status(&recent.job_id, JobStatusUpdate::Processing).await.unwrap();
    queue
        .update_job_status(&recent.job_id, JobStatusUpdate::Completed(json!(10)))
        .await
        .unwrap();

    let report = queue.cleanup_expired().await;
    assert_eq!(report.memory_cleaned_count, 3);
    assert_eq!(report.database_cleaned_count, 3);
    assert_eq!(report.total_cleaned_count, 6);

    for job in &old {
        assert!(queue.get_job(&job.job_id).await.is_none());
    }
    assert!(queue.get_job(&old_pending.job_id).await.is_some());
    assert!(queue.get_job(&recent.job_id).await.is_some());
    assert_eq!(backend.len(), 2);

    let stats = queue.get_job_stats().await;
    assert_eq!(stats.total, 2);
    assert_eq!(stats.by_type.values().map(|c| c.total).sum::<u64>(), stats.total);
}

#[tokio::test]
async fn duplicate_ids_are_rejected() {
    let backend = InMemoryJobBackend::arc();
    let queue = queue_over(backend.clone(), Arc::new(ManualClock::new(start_of_march()))).await;
    let job = queue.create_job("chat", json!({}), &JobOptions::default()).await.unwrap();

    // A second writer inserting the same record hits the unique key.
    let err = backend.insert(&job).await.unwrap_err();
    assert!(matches!(err, jobqueue_infra::StoreError::DuplicateKey(id) if id == job.job_id));
    assert!(matches!(
        queue.retry_job(&job.job_id).await,
        Err(JobError::InvalidTransition { from: JobStatus::Pending, .. })
    ));
}
