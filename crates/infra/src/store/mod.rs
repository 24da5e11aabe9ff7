//! Durable job ledger.
//!
//! [`JobBackend`] is the raw persistence contract: every method may fail.
//! [`JobStore`] wraps an optional backend and runs in *degraded mode* when the
//! backend is missing, closed, or failing: errors are logged and read/write
//! paths return empty or no-op results. The only error a caller ever sees is
//! [`StoreError::DuplicateKey`] from [`JobStore::insert`].

pub mod in_memory;
#[cfg(feature = "mongodb")]
pub mod mongo;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use jobqueue_core::{Job, JobFilter, JobId, JobPatch, StatusTypeCount};

pub use in_memory::InMemoryJobBackend;
#[cfg(feature = "mongodb")]
pub use mongo::MongoJobBackend;

/// Backend failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job already exists: {0}")]
    DuplicateKey(JobId),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Offset/limit window over a `createdAt`-descending listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Page {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self {
            limit: Some(limit),
            offset,
        }
    }

    pub fn all() -> Self {
        Self::default()
    }

    /// Apply the window to an already sorted listing.
    pub fn slice<T>(&self, items: Vec<T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

/// Sort newest first; ties broken by id so listings are stable.
pub fn sort_newest_first(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.job_id.cmp(&b.job_id))
    });
}

/// Persistence contract for job records.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Persist a new record. Fails with `DuplicateKey` if the id exists.
    async fn insert(&self, job: &Job) -> Result<(), StoreError>;

    /// Apply a patch if it is newer than the stored record.
    ///
    /// Returns whether anything changed. An absent id is not an error.
    async fn update(&self, job_id: &JobId, patch: &JobPatch) -> Result<bool, StoreError>;

    async fn find_one(&self, job_id: &JobId) -> Result<Option<Job>, StoreError>;

    /// Matching records, `createdAt` descending, windowed by `page`.
    async fn find(&self, filter: &JobFilter, page: Page) -> Result<Vec<Job>, StoreError>;

    /// Counts grouped by `(status, type)`.
    async fn aggregate_stats(&self) -> Result<Vec<StatusTypeCount>, StoreError>;

    /// Returns the number of records removed.
    async fn delete_many(&self, filter: &JobFilter) -> Result<u64, StoreError>;

    /// Health check.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Degraded-mode wrapper around an optional [`JobBackend`].
pub struct JobStore {
    backend: Option<Arc<dyn JobBackend>>,
    connected: AtomicBool,
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("has_backend", &self.backend.is_some())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl JobStore {
    /// Wrap a backend that is known to be reachable.
    pub fn new(backend: Arc<dyn JobBackend>) -> Self {
        Self {
            backend: Some(backend),
            connected: AtomicBool::new(true),
        }
    }

    /// A store with no backend at all: memory-only operation.
    pub fn disconnected() -> Self {
        Self {
            backend: None,
            connected: AtomicBool::new(false),
        }
    }

    /// Wrap a backend after a health check. A failed ping yields a degraded store.
    pub async fn connect(backend: Arc<dyn JobBackend>) -> Self {
        match backend.ping().await {
            Ok(()) => {
                info!("job store connected");
                Self::new(backend)
            }
            Err(err) => {
                error!(error = %err, "job store unreachable, continuing memory-only");
                Self {
                    backend: Some(backend),
                    connected: AtomicBool::new(false),
                }
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn backend(&self) -> Option<&Arc<dyn JobBackend>> {
        if self.is_connected() {
            self.backend.as_ref()
        } else {
            None
        }
    }

    pub async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let Some(backend) = self.backend() else {
            debug!(job_id = %job.job_id, "store offline, insert skipped");
            return Ok(());
        };
        match backend.insert(job).await {
            Ok(()) => Ok(()),
            Err(err @ StoreError::DuplicateKey(_)) => Err(err),
            Err(err) => {
                error!(job_id = %job.job_id, error = %err, "failed to persist job");
                Ok(())
            }
        }
    }

    pub async fn update(&self, job_id: &JobId, patch: &JobPatch) {
        let Some(backend) = self.backend() else {
            return;
        };
        match backend.update(job_id, patch).await {
            Ok(true) => {}
            Ok(false) => debug!(job_id = %job_id, version = patch.version, "update not applied"),
            Err(err) => error!(job_id = %job_id, error = %err, "failed to update job"),
        }
    }

    pub async fn find_one(&self, job_id: &JobId) -> Option<Job> {
        let backend = self.backend()?;
        backend.find_one(job_id).await.unwrap_or_else(|err| {
            error!(job_id = %job_id, error = %err, "failed to load job");
            None
        })
    }

    pub async fn find(&self, filter: &JobFilter, page: Page) -> Vec<Job> {
        let Some(backend) = self.backend() else {
            return Vec::new();
        };
        backend.find(filter, page).await.unwrap_or_else(|err| {
            error!(error = %err, "failed to query jobs");
            Vec::new()
        })
    }

    pub async fn aggregate_stats(&self) -> Vec<StatusTypeCount> {
        let Some(backend) = self.backend() else {
            return Vec::new();
        };
        backend.aggregate_stats().await.unwrap_or_else(|err| {
            error!(error = %err, "failed to aggregate job stats");
            Vec::new()
        })
    }

    pub async fn delete_many(&self, filter: &JobFilter) -> u64 {
        let Some(backend) = self.backend() else {
            return 0;
        };
        backend.delete_many(filter).await.unwrap_or_else(|err| {
            error!(error = %err, "failed to delete jobs");
            0
        })
    }

    /// Release the backend, reachable or not. Later calls run in degraded mode.
    pub async fn close(&self) {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        let Some(backend) = &self.backend else {
            return;
        };
        if let Err(err) = backend.close().await {
            warn!(error = %err, "error while closing job store");
        }
        info!(was_connected, "job store closed");
    }
}
