//! `jobqueue-core`: job model and lifecycle rules.
//!
//! This crate holds the **pure** parts of the job queue: the job record, its
//! state machine, identifiers, statistics and the time source. Persistence,
//! caching and dispatch live in `jobqueue-infra`.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod kind;
pub mod stats;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{JobError, LifecycleResult};
pub use id::JobId;
pub use job::{
    Job, JobFailure, JobFilter, JobMetadata, JobOptions, JobPatch, JobStatus, Priority,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT_MS,
};
pub use kind::{BuiltinJobKind, JobKind};
pub use stats::{JobStats, StatusCounts, StatusTypeCount};
