//! Startup recovery and re-execution of queued jobs.
//!
//! Delivery is at-least-once: a job that was `processing` when the previous
//! process died is demoted to `pending` and may run again.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use jobqueue_core::{Job, JobError, JobFailure, JobFilter, JobId, JobKind, JobStatus, LifecycleResult};
use jobqueue_events::JobEvent;

use crate::lifecycle::JobLifecycle;
use crate::store::{JobStore, Page};

/// Table of async operations keyed by a closed job kind.
///
/// Implementations match on `Self::Kind` exhaustively; a stored type tag that
/// does not parse into the kind has no handler and is dead-lettered.
#[async_trait]
pub trait JobHandlers: Send + Sync {
    type Kind: JobKind;

    async fn handle(&self, kind: Self::Kind, data: Value) -> anyhow::Result<Value>;
}

/// Tally of one [`RecoveryDispatcher::process_pending_jobs`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Failed,
    DeadLettered,
    /// Someone else moved the job first.
    Skipped,
}

#[derive(Debug)]
pub struct RecoveryDispatcher {
    lifecycle: Arc<JobLifecycle>,
    store: Arc<JobStore>,
    recovery_limit: usize,
}

impl RecoveryDispatcher {
    pub fn new(lifecycle: Arc<JobLifecycle>, store: Arc<JobStore>, recovery_limit: usize) -> Self {
        Self {
            lifecycle,
            store,
            recovery_limit,
        }
    }

    /// Demote every orphaned `processing` job, then reload up to
    /// `recovery_limit` pending jobs into the cache.
    ///
    /// Demotion is not capped. Returns the number of distinct jobs demoted or
    /// loaded. Without a connected store there is nothing to recover and no
    /// event is emitted.
    pub async fn resume_pending_jobs(&self) -> usize {
        if !self.store.is_connected() {
            debug!("store offline, nothing to resume");
            return 0;
        }

        let registry = self.lifecycle.registry();
        let mut resumed = HashSet::new();

        let orphans = self
            .store
            .find(&JobFilter::all().with_status(JobStatus::Processing), Page::all())
            .await;
        for job in orphans {
            let job_id = job.job_id.clone();
            registry.hydrate(job);
            match self.lifecycle.demote(&job_id).await {
                Ok(Some(_)) => info!(job_id = %job_id, "interrupted job reset to pending"),
                Ok(None) => {}
                Err(err) => warn!(job_id = %job_id, error = %err, "could not reset job"),
            }
            resumed.insert(job_id);
        }

        let pending = self
            .store
            .find(
                &JobFilter::all().with_status(JobStatus::Pending),
                Page::new(self.recovery_limit, 0),
            )
            .await;
        for job in pending {
            resumed.insert(job.job_id.clone());
            registry.hydrate(job);
        }

        let count = resumed.len();
        info!(count, "jobs resumed");
        registry.emit(JobEvent::JobsResumed { count });
        count
    }

    /// Run every pending job through `handlers`, oldest first.
    pub async fn process_pending_jobs<H: JobHandlers>(&self, handlers: &H) -> RecoveryReport {
        let mut pending = self
            .lifecycle
            .list(&JobFilter::all().with_status(JobStatus::Pending), Page::all())
            .await;
        pending.reverse();

        let mut report = RecoveryReport::default();
        for job in pending {
            report.processed += 1;
            match self.execute(handlers, &job).await {
                Outcome::Succeeded => report.succeeded += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::DeadLettered => report.dead_lettered += 1,
                Outcome::Skipped => {}
            }
        }

        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            "pending jobs processed"
        );
        report
    }

    /// Put a failed job back to pending and run it again.
    ///
    /// Returns the job as recorded after the run.
    pub async fn retry_job<H: JobHandlers>(&self, job_id: &JobId, handlers: &H) -> LifecycleResult<Job> {
        let job = self
            .lifecycle
            .get(job_id)
            .await
            .ok_or_else(|| JobError::NotFound(job_id.clone()))?;

        if !job.can_retry() {
            return Err(JobError::RetryLimitExceeded {
                job_id: job_id.clone(),
                max_attempts: job.max_attempts,
            });
        }

        let job = self
            .lifecycle
            .retry(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.clone()))?;
        self.execute(handlers, &job).await;

        self.lifecycle
            .get(job_id)
            .await
            .ok_or_else(|| JobError::NotFound(job_id.clone()))
    }

    async fn execute<H: JobHandlers>(&self, handlers: &H, job: &Job) -> Outcome {
        let Some(kind) = <H::Kind as JobKind>::parse(&job.job_type) else {
            return self.dead_letter(job).await;
        };

        match self.lifecycle.start(&job.job_id).await {
            Ok(Some(_)) => {}
            Ok(None) => return Outcome::Skipped,
            Err(err) => {
                debug!(job_id = %job.job_id, error = %err, "job not startable, skipping");
                return Outcome::Skipped;
            }
        }

        debug!(job_id = %job.job_id, kind = kind.as_str(), "dispatching job");
        match handlers.handle(kind, job.data.clone()).await {
            Ok(result) => match self.lifecycle.succeed(&job.job_id, result).await {
                Ok(_) => Outcome::Succeeded,
                Err(err) => {
                    error!(job_id = %job.job_id, error = %err, "failed to record job success");
                    Outcome::Skipped
                }
            },
            Err(err) => {
                let failure = JobFailure::new(err.to_string(), self.lifecycle.now())
                    .with_stack(format!("{err:?}"));
                match self.lifecycle.fail(&job.job_id, failure).await {
                    Ok(_) => {
                        warn!(job_id = %job.job_id, error = %err, "job handler failed");
                        Outcome::Failed
                    }
                    Err(record_err) => {
                        error!(job_id = %job.job_id, error = %record_err, "failed to record job failure");
                        Outcome::Skipped
                    }
                }
            }
        }
    }

    /// Park a job whose type has no handler as `failed`.
    async fn dead_letter(&self, job: &Job) -> Outcome {
        warn!(job_id = %job.job_id, job_type = %job.job_type, "no handler registered, dead-lettering job");

        if !matches!(self.lifecycle.start(&job.job_id).await, Ok(Some(_))) {
            return Outcome::Skipped;
        }
        let failure = JobFailure::new(
            format!("no handler registered for job type `{}`", job.job_type),
            self.lifecycle.now(),
        );
        match self.lifecycle.fail(&job.job_id, failure).await {
            Ok(Some(_)) => Outcome::DeadLettered,
            _ => Outcome::Skipped,
        }
    }
}
