//! The job record and its state machine.
//!
//! ```text
//!            start             succeed
//! pending ──────────▶ processing ──────────▶ completed
//!    ▲                  │   │
//!    │     demote       │   │ fail (attempts += 1)
//!    └──────────────────┘   ▼
//!    ▲                    failed
//!    └──────── retry ───────┘   (only while attempts < max_attempts)
//! ```
//!
//! Every mutation bumps `updated_at` and `version`. The version orders persisted
//! writes: a store applies a patch only when it is newer than what it holds.

use core::fmt;

use chrono::{DateTime, Utc};
#[cfg(feature = "mongodb")]
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{JobError, LifecycleResult};
use crate::id::JobId;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Ten minutes. Recorded on the job, never enforced.
pub const DEFAULT_TIMEOUT_MS: u64 = 600_000;

/// Lifecycle status of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Pending,
    /// Currently being executed
    Processing,
    /// Finished successfully
    Completed,
    /// Finished with an error; may be retried
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory priority. Stored, never used for ordering.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// Structured failure recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
    /// Entry point the failing call came through, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl JobFailure {
    pub fn new(message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            endpoint: None,
            timestamp,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// Diagnostic context about who submitted a job. No behavioral effect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Options accepted when creating a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobOptions {
    pub priority: Priority,
    pub max_attempts: u32,
    /// Unset means the default for the job's kind.
    #[serde(rename = "timeout")]
    pub timeout_ms: Option<u64>,
    pub user_agent: Option<String>,
    pub client_ip: Option<String>,
    pub session_id: Option<String>,
    /// Entry point recorded alongside intercepted outcomes. Not stored on the job.
    pub endpoint: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Medium,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout_ms: None,
            user_agent: None,
            client_ip: None,
            session_id: None,
            endpoint: None,
        }
    }
}

impl JobOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_client(mut self, user_agent: impl Into<String>, client_ip: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self.client_ip = Some(client_ip.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    fn metadata(&self) -> JobMetadata {
        JobMetadata {
            user_agent: self.user_agent.clone(),
            client_ip: self.client_ip.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

/// A tracked unit of asynchronous work.
///
/// Serialized field names match the documents of the `job_queue` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    pub data: Value,
    pub status: JobStatus,
    #[serde(default)]
    pub priority: Priority,
    #[cfg_attr(feature = "mongodb", serde(with = "chrono_datetime_as_bson_datetime"))]
    pub created_at: DateTime<Utc>,
    #[cfg_attr(feature = "mongodb", serde(with = "chrono_datetime_as_bson_datetime"))]
    pub updated_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(rename = "timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JobFailure>,
    #[serde(default)]
    pub metadata: JobMetadata,
    /// Mutation counter; older documents without it read as 0.
    #[serde(default)]
    pub version: u64,
}

impl Job {
    /// Create a new pending job.
    pub fn new(
        job_type: impl Into<String>,
        data: Value,
        options: &JobOptions,
        now: DateTime<Utc>,
    ) -> LifecycleResult<Self> {
        let job_type = job_type.into();
        if job_type.is_empty() {
            return Err(JobError::validation("job type must not be empty"));
        }
        if options.max_attempts == 0 {
            return Err(JobError::validation("max_attempts must be at least 1"));
        }

        Ok(Self {
            job_id: JobId::generate(&job_type, &data, now.timestamp_millis()),
            job_type,
            data,
            status: JobStatus::Pending,
            priority: options.priority,
            created_at: now,
            updated_at: now,
            attempts: 0,
            max_attempts: options.max_attempts,
            timeout_ms: options.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            result: None,
            error: None,
            metadata: options.metadata(),
            version: 0,
        })
    }

    /// Whether another attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// pending → processing
    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> LifecycleResult<()> {
        self.expect_status(JobStatus::Pending, JobStatus::Processing)?;
        self.status = JobStatus::Processing;
        self.touch(now);
        Ok(())
    }

    /// processing → completed
    pub fn mark_completed(&mut self, result: Value, now: DateTime<Utc>) -> LifecycleResult<()> {
        self.expect_status(JobStatus::Processing, JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.touch(now);
        Ok(())
    }

    /// processing → failed, counting one attempt.
    pub fn mark_failed(&mut self, failure: JobFailure, now: DateTime<Utc>) -> LifecycleResult<()> {
        self.expect_status(JobStatus::Processing, JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.result = None;
        self.error = Some(failure);
        self.attempts = self.attempts.saturating_add(1);
        self.touch(now);
        Ok(())
    }

    /// failed → pending. Attempts are kept; the error is cleared.
    pub fn mark_retried(&mut self, now: DateTime<Utc>) -> LifecycleResult<()> {
        if !self.can_retry() {
            return Err(JobError::RetryLimitExceeded {
                job_id: self.job_id.clone(),
                max_attempts: self.max_attempts,
            });
        }
        self.expect_status(JobStatus::Failed, JobStatus::Pending)?;
        self.status = JobStatus::Pending;
        self.error = None;
        self.touch(now);
        Ok(())
    }

    /// processing → pending, for jobs interrupted by a restart.
    ///
    /// Leaves attempts, result and error untouched.
    pub fn demote_interrupted(&mut self, now: DateTime<Utc>) -> LifecycleResult<()> {
        self.expect_status(JobStatus::Processing, JobStatus::Pending)?;
        self.status = JobStatus::Pending;
        self.touch(now);
        Ok(())
    }

    fn expect_status(&self, expected: JobStatus, to: JobStatus) -> LifecycleResult<()> {
        if self.status == expected {
            Ok(())
        } else {
            Err(JobError::invalid_transition(&self.job_id, self.status, to))
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.version += 1;
    }
}

/// The mutable subset of a job, persisted after each transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPatch {
    pub status: JobStatus,
    #[cfg_attr(feature = "mongodb", serde(with = "chrono_datetime_as_bson_datetime"))]
    pub updated_at: DateTime<Utc>,
    pub attempts: u32,
    pub result: Option<Value>,
    pub error: Option<JobFailure>,
    pub version: u64,
}

impl From<&Job> for JobPatch {
    fn from(job: &Job) -> Self {
        Self {
            status: job.status,
            updated_at: job.updated_at,
            attempts: job.attempts,
            result: job.result.clone(),
            error: job.error.clone(),
            version: job.version,
        }
    }
}

impl JobPatch {
    /// Apply onto a stored record. Returns `false` for stale patches.
    pub fn apply_to(&self, job: &mut Job) -> bool {
        if self.version <= job.version {
            return false;
        }
        job.status = self.status;
        job.updated_at = self.updated_at;
        job.attempts = self.attempts;
        job.result = self.result.clone();
        job.error = self.error.clone();
        job.version = self.version;
        true
    }
}

/// Predicate over job records, shared by the store and the in-memory fallback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub job_id: Option<JobId>,
    /// Any of these statuses; empty means any status.
    pub statuses: Vec<JobStatus>,
    pub job_type: Option<String>,
    /// Strictly older than this instant.
    pub created_before: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(job_id: &JobId) -> Self {
        Self {
            job_id: Some(job_id.clone()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses = vec![status];
        self
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn created_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.created_before = Some(cutoff);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.job_id.as_ref().is_none_or(|id| &job.job_id == id)
            && (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self.job_type.as_ref().is_none_or(|t| &job.job_type == t)
            && self.created_before.is_none_or(|cutoff| job.created_at < cutoff)
    }
}
