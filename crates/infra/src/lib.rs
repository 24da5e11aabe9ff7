//! `jobqueue-infra`: persistence, caching, execution and recovery for jobs.
//!
//! ```text
//! JobQueue ── ExecutionWrapper ─┐
//!          └─ RecoveryDispatcher ┴─ JobLifecycle ── JobRegistry ── JobStore ── JobBackend
//!                                                      │                      (memory | MongoDB)
//!                                                      └─ event bus
//! ```

pub mod config;
pub mod context;
pub mod lifecycle;
pub mod recovery;
pub mod registry;
pub mod store;
pub mod wrapper;

pub use config::QueueConfig;
pub use context::{JobQueue, JobQueueBuilder};
pub use lifecycle::{CleanupReport, JobLifecycle, JobStatusUpdate};
pub use recovery::{JobHandlers, RecoveryDispatcher, RecoveryReport};
pub use registry::JobRegistry;
pub use store::{InMemoryJobBackend, JobBackend, JobStore, Page, StoreError};
#[cfg(feature = "mongodb")]
pub use store::MongoJobBackend;
pub use wrapper::{ExecutionWrapper, WrapFailure, WrapSuccess};
