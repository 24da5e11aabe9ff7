//! Job lifecycle operations.
//!
//! Each transition is applied to the cached record through
//! [`JobRegistry::apply`] and the resulting delta is then persisted with the
//! job's new version. Unknown ids are tolerated: they log a warning and yield
//! `Ok(None)`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use jobqueue_core::{
    Clock, Job, JobError, JobFailure, JobFilter, JobId, JobOptions, JobPatch, JobStats, JobStatus,
    LifecycleResult,
};
use jobqueue_events::JobEvent;

use crate::registry::JobRegistry;
use crate::store::{JobStore, Page, StoreError};

/// Target of a generic status update.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatusUpdate {
    /// Back to the queue; only legal from `failed` (a retry).
    Pending,
    Processing,
    Completed(Value),
    Failed(JobFailure),
}

impl JobStatusUpdate {
    pub fn status(&self) -> JobStatus {
        match self {
            JobStatusUpdate::Pending => JobStatus::Pending,
            JobStatusUpdate::Processing => JobStatus::Processing,
            JobStatusUpdate::Completed(_) => JobStatus::Completed,
            JobStatusUpdate::Failed(_) => JobStatus::Failed,
        }
    }
}

/// Outcome of [`JobLifecycle::cleanup`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub memory_cleaned_count: u64,
    pub database_cleaned_count: u64,
    /// Sum of both counts; a job present in cache and store counts twice.
    pub total_cleaned_count: u64,
}

/// State machine driver over the registry and the store.
pub struct JobLifecycle {
    registry: Arc<JobRegistry>,
    store: Arc<JobStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for JobLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLifecycle")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl JobLifecycle {
    pub fn new(registry: Arc<JobRegistry>, store: Arc<JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            store,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Create a pending job, persist it, cache it and announce it.
    pub async fn create(
        &self,
        job_type: &str,
        data: Value,
        options: &JobOptions,
    ) -> LifecycleResult<Job> {
        let job = Job::new(job_type, data, options, self.now())?;

        match self.store.insert(&job).await {
            Ok(()) => {}
            Err(StoreError::DuplicateKey(job_id)) => {
                warn!(job_id = %job_id, "job id collision");
                return Err(JobError::Duplicate(job_id));
            }
            // The store only surfaces duplicates.
            Err(err) => warn!(job_id = %job.job_id, error = %err, "unexpected store error"),
        }

        self.registry.put(job.clone());
        info!(
            job_id = %job.job_id,
            job_type = %job.job_type,
            priority = ?job.priority,
            "job created"
        );
        Ok(job)
    }

    /// pending → processing
    pub async fn start(&self, job_id: &JobId) -> LifecycleResult<Option<Job>> {
        self.transition(job_id, JobStatus::Processing, Job::mark_processing, updated)
            .await
    }

    /// processing → completed
    pub async fn succeed(&self, job_id: &JobId, result: Value) -> LifecycleResult<Option<Job>> {
        self.transition(
            job_id,
            JobStatus::Completed,
            move |job, now| job.mark_completed(result, now),
            updated,
        )
        .await
    }

    /// processing → failed, counting one attempt.
    pub async fn fail(&self, job_id: &JobId, failure: JobFailure) -> LifecycleResult<Option<Job>> {
        self.transition(
            job_id,
            JobStatus::Failed,
            move |job, now| job.mark_failed(failure, now),
            updated,
        )
        .await
    }

    /// failed → pending while attempts remain.
    pub async fn retry(&self, job_id: &JobId) -> LifecycleResult<Option<Job>> {
        let job = self
            .transition(job_id, JobStatus::Pending, Job::mark_retried, retried)
            .await?;
        if let Some(job) = &job {
            info!(
                job_id = %job.job_id,
                attempt = job.attempts + 1,
                max_attempts = job.max_attempts,
                "job queued for retry"
            );
        }
        Ok(job)
    }

    /// processing → pending after an interrupted run.
    pub async fn demote(&self, job_id: &JobId) -> LifecycleResult<Option<Job>> {
        self.transition(job_id, JobStatus::Pending, Job::demote_interrupted, updated)
            .await
    }

    /// Route a status change onto the matching transition.
    pub async fn update_status(
        &self,
        job_id: &JobId,
        update: JobStatusUpdate,
    ) -> LifecycleResult<Option<Job>> {
        match update {
            JobStatusUpdate::Pending => self.retry(job_id).await,
            JobStatusUpdate::Processing => self.start(job_id).await,
            JobStatusUpdate::Completed(result) => self.succeed(job_id, result).await,
            JobStatusUpdate::Failed(failure) => self.fail(job_id, failure).await,
        }
    }

    pub async fn get(&self, job_id: &JobId) -> Option<Job> {
        self.registry.get(job_id).await
    }

    pub async fn list(&self, filter: &JobFilter, page: Page) -> Vec<Job> {
        self.registry.list(filter, page).await
    }

    pub async fn stats(&self) -> JobStats {
        self.registry.stats().await
    }

    /// Hard-delete from cache and store. Returns whether anything was removed.
    pub async fn delete(&self, job_id: &JobId) -> bool {
        let cached = self.registry.remove(job_id).is_some();
        let stored = self.store.delete_many(&JobFilter::by_id(job_id)).await;
        info!(job_id = %job_id, "job deleted");
        cached || stored > 0
    }

    /// Remove completed jobs created more than `older_than_days` ago.
    pub async fn cleanup(&self, older_than_days: u32) -> CleanupReport {
        let cutoff = self.now() - Duration::days(i64::from(older_than_days));
        let filter = JobFilter::all()
            .with_status(JobStatus::Completed)
            .created_before(cutoff);

        let memory = self.registry.remove_matching(&filter).len() as u64;
        let database = self.store.delete_many(&filter).await;

        let report = CleanupReport {
            memory_cleaned_count: memory,
            database_cleaned_count: database,
            total_cleaned_count: memory + database,
        };
        info!(
            older_than_days,
            memory = report.memory_cleaned_count,
            database = report.database_cleaned_count,
            "job cleanup finished"
        );
        report
    }

    async fn transition<F>(
        &self,
        job_id: &JobId,
        to: JobStatus,
        mutate: F,
        event: fn(Job) -> JobEvent,
    ) -> LifecycleResult<Option<Job>>
    where
        F: FnOnce(&mut Job, DateTime<Utc>) -> LifecycleResult<()>,
    {
        if self.registry.get(job_id).await.is_none() {
            warn!(job_id = %job_id, to = %to, "job not found");
            return Ok(None);
        }

        let now = self.now();
        let job = match self.registry.apply(job_id, |job| mutate(job, now), event) {
            None => {
                warn!(job_id = %job_id, to = %to, "job vanished before update");
                return Ok(None);
            }
            Some(Err(err)) => {
                warn!(job_id = %job_id, error = %err, "transition rejected");
                return Err(err);
            }
            Some(Ok(job)) => job,
        };

        self.store.update(&job.job_id, &JobPatch::from(&job)).await;
        info!(job_id = %job.job_id, status = %job.status, "job status updated");
        Ok(Some(job))
    }
}

fn updated(job: Job) -> JobEvent {
    JobEvent::Updated { job }
}

fn retried(job: Job) -> JobEvent {
    JobEvent::Retried { job }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobBackend;
    use chrono::TimeZone;
    use jobqueue_core::ManualClock;
    use jobqueue_events::InMemoryEventBus;
    use proptest::prelude::*;
    use serde_json::json;

    struct Harness {
        lifecycle: JobLifecycle,
        backend: Arc<InMemoryJobBackend>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let backend = InMemoryJobBackend::arc();
        let store = Arc::new(JobStore::new(backend.clone()));
        let registry = Arc::new(JobRegistry::new(store.clone(), Arc::new(InMemoryEventBus::new())));
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
        ));
        Harness {
            lifecycle: JobLifecycle::new(registry, store, clock.clone()),
            backend,
            clock,
        }
    }

    fn boom(h: &Harness) -> JobFailure {
        JobFailure::new("boom", h.lifecycle.now())
    }

    #[tokio::test]
    async fn create_persists_and_caches() {
        let h = harness();
        let job = h
            .lifecycle
            .create("transcribe", json!({"ref": "a1"}), &JobOptions::default())
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(h.backend.len(), 1);
        assert_eq!(h.lifecycle.registry().cached(&job.job_id), Some(job));
    }

    #[tokio::test]
    async fn transitions_are_written_through() {
        let h = harness();
        let job = h
            .lifecycle
            .create("chat", json!({}), &JobOptions::default())
            .await
            .unwrap();

        h.clock.advance(Duration::seconds(3));
        h.lifecycle.start(&job.job_id).await.unwrap();
        let done = h
            .lifecycle
            .succeed(&job.job_id, json!({"text": "hi"}))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(done.updated_at, h.clock.now());
        let stored = h.lifecycle.store.find_one(&job.job_id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.result, Some(json!({"text": "hi"})));
        assert_eq!(stored.version, done.version);
    }

    #[tokio::test]
    async fn unknown_job_is_a_warning_not_an_error() {
        let h = harness();
        let missing = JobId::from("chat_0_0_missing");
        assert_eq!(h.lifecycle.start(&missing).await, Ok(None));
        assert_eq!(h.lifecycle.retry(&missing).await, Ok(None));
    }

    #[tokio::test]
    async fn retry_limit_is_enforced() {
        let h = harness();
        let job = h
            .lifecycle
            .create("chat", json!({}), &JobOptions::default().with_max_attempts(1))
            .await
            .unwrap();
        h.lifecycle.start(&job.job_id).await.unwrap();
        h.lifecycle.fail(&job.job_id, boom(&h)).await.unwrap();

        let err = h.lifecycle.retry(&job.job_id).await.unwrap_err();
        assert_eq!(
            err,
            JobError::RetryLimitExceeded {
                job_id: job.job_id.clone(),
                max_attempts: 1
            }
        );
        let job = h.lifecycle.get(&job.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn concurrent_retries_requeue_once() {
        let h = harness();
        let job = h
            .lifecycle
            .create("chat", json!({}), &JobOptions::default())
            .await
            .unwrap();
        h.lifecycle.start(&job.job_id).await.unwrap();
        h.lifecycle.fail(&job.job_id, boom(&h)).await.unwrap();
        let events = h.lifecycle.registry().subscribe();

        let (first, second) = tokio::join!(
            h.lifecycle.retry(&job.job_id),
            h.lifecycle.retry(&job.job_id)
        );
        let outcomes = [first, second];

        let requeued: Vec<&Job> = outcomes
            .iter()
            .filter_map(|o| o.as_ref().ok().and_then(Option::as_ref))
            .collect();
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].status, JobStatus::Pending);
        assert!(outcomes.iter().any(|o| matches!(
            o,
            Err(JobError::InvalidTransition { from: JobStatus::Pending, .. })
        )));

        let retried = events
            .drain()
            .into_iter()
            .filter(|e| matches!(e, JobEvent::Retried { .. }))
            .count();
        assert_eq!(retried, 1);
        let stored = h.lifecycle.store.find_one(&job.job_id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let h = harness();
        let job = h
            .lifecycle
            .create("chat", json!({}), &JobOptions::default())
            .await
            .unwrap();
        h.lifecycle.start(&job.job_id).await.unwrap();

        let err = h.lifecycle.start(&job.job_id).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { from: JobStatus::Processing, .. }));
    }

    #[tokio::test]
    async fn status_update_routes_to_transitions() {
        let h = harness();
        let job = h
            .lifecycle
            .create("chat", json!({}), &JobOptions::default())
            .await
            .unwrap();

        h.lifecycle
            .update_status(&job.job_id, JobStatusUpdate::Processing)
            .await
            .unwrap();
        h.lifecycle
            .update_status(&job.job_id, JobStatusUpdate::Failed(boom(&h)))
            .await
            .unwrap();
        let job = h
            .lifecycle
            .update_status(&job.job_id, JobStatusUpdate::Pending)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn cleanup_only_touches_old_completed_jobs() {
        let h = harness();
        let old_done = h.lifecycle.create("chat", json!({"n": 1}), &JobOptions::default()).await.unwrap();
        let old_failed = h.lifecycle.create("chat", json!({"n": 2}), &JobOptions::default()).await.unwrap();
        h.lifecycle.start(&old_done.job_id).await.unwrap();
        h.lifecycle.succeed(&old_done.job_id, json!(1)).await.unwrap();
        h.lifecycle.start(&old_failed.job_id).await.unwrap();
        h.lifecycle.fail(&old_failed.job_id, boom(&h)).await.unwrap();

        h.clock.advance(Duration::days(10));
        let fresh = h.lifecycle.create("chat", json!({"n": 3}), &JobOptions::default()).await.unwrap();
        h.lifecycle.start(&fresh.job_id).await.unwrap();
        h.lifecycle.succeed(&fresh.job_id, json!(3)).await.unwrap();

        let report = h.lifecycle.cleanup(7).await;
        assert_eq!(
            report,
            CleanupReport {
                memory_cleaned_count: 1,
                database_cleaned_count: 1,
                total_cleaned_count: 2,
            }
        );
        assert!(h.lifecycle.get(&old_done.job_id).await.is_none());
        assert!(h.lifecycle.get(&old_failed.job_id).await.is_some());
        assert!(h.lifecycle.get(&fresh.job_id).await.is_some());
        assert_eq!(h.backend.len(), 2);
    }

    #[tokio::test]
    async fn delete_removes_everywhere() {
        let h = harness();
        let job = h.lifecycle.create("chat", json!({}), &JobOptions::default()).await.unwrap();

        assert!(h.lifecycle.delete(&job.job_id).await);
        assert!(h.lifecycle.get(&job.job_id).await.is_none());
        assert!(h.backend.is_empty());
        assert!(!h.lifecycle.delete(&job.job_id).await);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Start,
        Succeed,
        Fail,
        Retry,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Start),
            Just(Step::Succeed),
            Just(Step::Fail),
            Just(Step::Retry),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: after any sequence of transitions the stored record
        /// matches the cached one and attempts never pass `max_attempts`.
        #[test]
        fn store_tracks_cache(steps in prop::collection::vec(step(), 1..25), max in 1u32..4) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let h = harness();
                let job = h
                    .lifecycle
                    .create("chat", json!({}), &JobOptions::default().with_max_attempts(max))
                    .await
                    .unwrap();

                for s in steps {
                    h.clock.advance(Duration::seconds(1));
                    let _ = match s {
                        Step::Start => h.lifecycle.start(&job.job_id).await,
                        Step::Succeed => h.lifecycle.succeed(&job.job_id, json!("ok")).await,
                        Step::Fail => h.lifecycle.fail(&job.job_id, boom(&h)).await,
                        Step::Retry => h.lifecycle.retry(&job.job_id).await,
                    };

                    let cached = h.lifecycle.registry().cached(&job.job_id).unwrap();
                    let stored = h.lifecycle.store.find_one(&job.job_id).await.unwrap();
                    prop_assert_eq!(&stored, &cached);
                    prop_assert!(cached.attempts <= max);
                }
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
