//! Job lifecycle error model.

use thiserror::Error;

use crate::id::JobId;
use crate::job::JobStatus;

/// Result type used by lifecycle operations.
pub type LifecycleResult<T> = Result<T, JobError>;

/// Usage error raised by the job state machine.
///
/// Keep this focused on deterministic failures (illegal transitions, exhausted
/// retries). Backend unavailability is never surfaced through this type; see
/// the degraded-mode store in `jobqueue-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// `retry` was requested on a job that already used all of its attempts.
    #[error("job {job_id} has exceeded maximum retry attempts ({max_attempts})")]
    RetryLimitExceeded { job_id: JobId, max_attempts: u32 },

    /// The requested transition is not an edge of the state machine.
    #[error("job {job_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// The job does not exist in the registry nor in the store.
    #[error("job {0} not found")]
    NotFound(JobId),

    /// A job with the same identifier is already persisted.
    #[error("job {0} already exists")]
    Duplicate(JobId),

    /// A value failed validation (e.g. `max_attempts == 0`).
    #[error("validation failed: {0}")]
    Validation(String),
}

impl JobError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_transition(job_id: &JobId, from: JobStatus, to: JobStatus) -> Self {
        Self::InvalidTransition {
            job_id: job_id.clone(),
            from,
            to,
        }
    }
}
