use jobqueue_core::{Job, JobId};
use serde::{Deserialize, Serialize};

/// Notification emitted by the job registry.
///
/// Variants carrying a [`Job`] hold a snapshot taken right after the mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum JobEvent {
    /// A job entered the registry for the first time.
    Created { job: Job },
    /// A cached job changed status or outcome.
    Updated { job: Job },
    /// A failed job was put back to pending.
    Retried { job: Job },
    /// A job was hard-deleted.
    Deleted {
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
    /// Startup recovery loaded `count` unfinished jobs.
    JobsResumed { count: usize },
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Created { .. } => "created",
            JobEvent::Updated { .. } => "updated",
            JobEvent::Retried { .. } => "retried",
            JobEvent::Deleted { .. } => "deleted",
            JobEvent::JobsResumed { .. } => "jobsResumed",
        }
    }

    /// The job this event is about, if any.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            JobEvent::Created { job } | JobEvent::Updated { job } | JobEvent::Retried { job } => {
                Some(&job.job_id)
            }
            JobEvent::Deleted { job_id } => Some(job_id),
            JobEvent::JobsResumed { .. } => None,
        }
    }
}
