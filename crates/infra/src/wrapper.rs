//! Turn an arbitrary async operation into a tracked job.
//!
//! Both entry points create the job from the payload, mark it processing, run
//! the operation on that same payload and record the outcome. They differ in
//! what the caller gets back:
//!
//! - [`ExecutionWrapper::wrap`] folds the outcome into
//!   `Result<WrapSuccess<T>, WrapFailure>`; the operation's error never escapes.
//! - [`ExecutionWrapper::intercept`] hands back the operation's own result
//!   untouched. If tracking itself fails the operation still runs.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{error, info, warn};

use jobqueue_core::{Job, JobFailure, JobId, JobKind, JobOptions, LifecycleResult};

use crate::lifecycle::JobLifecycle;

/// Successful wrapped execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrapSuccess<T> {
    pub success: bool,
    pub job_id: JobId,
    pub result: T,
}

/// Failed wrapped execution.
///
/// `job_id` is `None` only when the job could not be created at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{error}")]
pub struct WrapFailure {
    pub success: bool,
    pub job_id: Option<JobId>,
    pub error: String,
    pub can_retry: bool,
}

impl WrapFailure {
    fn untracked(error: impl fmt::Display) -> Self {
        Self {
            success: false,
            job_id: None,
            error: error.to_string(),
            can_retry: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionWrapper {
    lifecycle: Arc<JobLifecycle>,
}

impl ExecutionWrapper {
    pub fn new(lifecycle: Arc<JobLifecycle>) -> Self {
        Self { lifecycle }
    }

    pub async fn wrap<F, Fut, T>(
        &self,
        job_type: &str,
        operation: F,
        payload: Value,
        options: &JobOptions,
    ) -> Result<WrapSuccess<T>, WrapFailure>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        T: Serialize,
    {
        let job = self
            .begin(job_type, payload.clone(), options)
            .await
            .map_err(WrapFailure::untracked)?;

        let started = Instant::now();
        let outcome = operation(payload).await;
        warn_on_overrun(&job, started);

        match outcome {
            Ok(result) => {
                self.record_success(&job.job_id, to_value(&job.job_id, &result))
                    .await;
                Ok(WrapSuccess {
                    success: true,
                    job_id: job.job_id,
                    result,
                })
            }
            Err(err) => {
                let failure = JobFailure::new(err.to_string(), self.lifecycle.now())
                    .with_stack(format!("{err:?}"));
                let can_retry = self.record_failure(&job.job_id, failure).await;
                Err(WrapFailure {
                    success: false,
                    job_id: Some(job.job_id),
                    error: err.to_string(),
                    can_retry,
                })
            }
        }
    }

    /// [`wrap`](Self::wrap) with the kind's default timeout unless one is set.
    pub async fn wrap_kind<K, F, Fut, T>(
        &self,
        kind: K,
        operation: F,
        payload: Value,
        options: &JobOptions,
    ) -> Result<WrapSuccess<T>, WrapFailure>
    where
        K: JobKind,
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        T: Serialize,
    {
        let mut options = options.clone();
        options.timeout_ms = options.timeout_ms.or(Some(kind.default_timeout_ms()));
        self.wrap(kind.as_str(), operation, payload, &options).await
    }

    /// Track `operation` as a job and return its result unchanged.
    ///
    /// The recorded result is `{result, endpoint, completedAt}`; a failure
    /// carries `options.endpoint` as well.
    pub async fn intercept<F, Fut, T, E>(
        &self,
        job_type: &str,
        operation: F,
        payload: Value,
        options: &JobOptions,
    ) -> Result<T, E>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize,
        E: fmt::Display + fmt::Debug,
    {
        let job = match self.begin(job_type, payload.clone(), options).await {
            Ok(job) => Some(job),
            Err(err) => {
                warn!(job_type, error = %err, "job tracking unavailable, running untracked");
                None
            }
        };

        let started = Instant::now();
        let outcome = operation(payload).await;
        let Some(job) = job else {
            return outcome;
        };
        warn_on_overrun(&job, started);

        match &outcome {
            Ok(result) => {
                let recorded = json!({
                    "result": to_value(&job.job_id, result),
                    "endpoint": options.endpoint,
                    "completedAt": self.lifecycle.now(),
                });
                self.record_success(&job.job_id, recorded).await;
            }
            Err(err) => {
                let mut failure = JobFailure::new(err.to_string(), self.lifecycle.now())
                    .with_stack(format!("{err:?}"));
                if let Some(endpoint) = &options.endpoint {
                    failure = failure.with_endpoint(endpoint.clone());
                }
                self.record_failure(&job.job_id, failure).await;
            }
        }
        outcome
    }

    async fn begin(&self, job_type: &str, payload: Value, options: &JobOptions) -> LifecycleResult<Job> {
        let job = self.lifecycle.create(job_type, payload, options).await?;
        Ok(self.lifecycle.start(&job.job_id).await?.unwrap_or(job))
    }

    async fn record_success(&self, job_id: &JobId, result: Value) {
        match self.lifecycle.succeed(job_id, result).await {
            Ok(_) => info!(job_id = %job_id, "job completed"),
            Err(err) => error!(job_id = %job_id, error = %err, "failed to record job success"),
        }
    }

    /// Returns whether the job may be retried.
    async fn record_failure(&self, job_id: &JobId, failure: JobFailure) -> bool {
        let message = failure.message.clone();
        match self.lifecycle.fail(job_id, failure).await {
            Ok(Some(job)) => {
                warn!(
                    job_id = %job_id,
                    attempts = job.attempts,
                    max_attempts = job.max_attempts,
                    error = %message,
                    "job failed"
                );
                job.can_retry()
            }
            Ok(None) => false,
            Err(err) => {
                error!(job_id = %job_id, error = %err, "failed to record job failure");
                false
            }
        }
    }
}

fn to_value<T: Serialize>(job_id: &JobId, result: &T) -> Value {
    serde_json::to_value(result).unwrap_or_else(|err| {
        warn!(job_id = %job_id, error = %err, "job result is not serializable");
        Value::Null
    })
}

/// Timeouts are advisory: an overrun is only reported.
fn warn_on_overrun(job: &Job, started: Instant) {
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    if elapsed_ms > job.timeout_ms {
        warn!(
            job_id = %job.job_id,
            elapsed_ms,
            timeout_ms = job.timeout_ms,
            "job exceeded its advisory timeout"
        );
    }
}
