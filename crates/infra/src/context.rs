//! The `JobQueue` context: one object owning the store, registry, lifecycle,
//! wrapper and recovery dispatcher, built once at startup and shared by handle.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::info;

use jobqueue_core::{
    Clock, Job, JobError, JobFilter, JobId, JobKind, JobOptions, JobStats, LifecycleResult,
    SystemClock,
};
use jobqueue_events::{InMemoryEventBus, JobEvent, Subscription};

use crate::config::QueueConfig;
use crate::lifecycle::{CleanupReport, JobLifecycle, JobStatusUpdate};
use crate::recovery::{JobHandlers, RecoveryDispatcher, RecoveryReport};
use crate::registry::JobRegistry;
use crate::store::{InMemoryJobBackend, JobBackend, JobStore, Page};
use crate::wrapper::{ExecutionWrapper, WrapFailure, WrapSuccess};

/// Assemble a [`JobQueue`] from parts.
pub struct JobQueueBuilder {
    config: QueueConfig,
    backend: Option<Arc<dyn JobBackend>>,
    clock: Arc<dyn Clock>,
}

impl JobQueueBuilder {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            backend: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn JobBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Health-check the backend (if any) and wire everything together.
    ///
    /// Without a backend, or with an unreachable one, the queue runs memory-only.
    pub async fn build(self) -> JobQueue {
        let store = Arc::new(match self.backend {
            Some(backend) => JobStore::connect(backend).await,
            None => JobStore::disconnected(),
        });
        let registry = Arc::new(JobRegistry::new(store.clone(), Arc::new(InMemoryEventBus::new())));
        let lifecycle = Arc::new(JobLifecycle::new(registry.clone(), store.clone(), self.clock));
        let wrapper = ExecutionWrapper::new(lifecycle.clone());
        let recovery = RecoveryDispatcher::new(lifecycle.clone(), store.clone(), self.config.recovery_limit);

        info!(
            collection = %self.config.collection,
            connected = store.is_connected(),
            "job queue ready"
        );
        JobQueue {
            config: self.config,
            store,
            registry,
            lifecycle,
            wrapper,
            recovery,
        }
    }
}

/// Persistent job queue.
#[derive(Debug)]
pub struct JobQueue {
    config: QueueConfig,
    store: Arc<JobStore>,
    registry: Arc<JobRegistry>,
    lifecycle: Arc<JobLifecycle>,
    wrapper: ExecutionWrapper,
    recovery: RecoveryDispatcher,
}

impl JobQueue {
    pub fn builder(config: QueueConfig) -> JobQueueBuilder {
        JobQueueBuilder::new(config)
    }

    /// Queue backed by an in-process map. Nothing survives a restart.
    pub async fn in_memory() -> Self {
        Self::builder(QueueConfig::default())
            .with_backend(InMemoryJobBackend::arc())
            .build()
            .await
    }

    /// Connect to MongoDB per `config`, ensuring indexes. Falls back to
    /// memory-only operation when the server cannot be reached.
    #[cfg(feature = "mongodb")]
    pub async fn connect(config: QueueConfig) -> Self {
        use crate::store::MongoJobBackend;

        let backend =
            match MongoJobBackend::connect(&config.mongo_uri, &config.database, &config.collection).await {
                Ok(backend) => Some(Arc::new(backend)),
                Err(err) => {
                    tracing::error!(error = %err, "invalid MongoDB configuration, continuing memory-only");
                    None
                }
            };

        let mut builder = Self::builder(config);
        if let Some(backend) = &backend {
            builder = builder.with_backend(backend.clone());
        }
        let queue = builder.build().await;

        if let Some(backend) = backend.filter(|_| queue.is_connected()) {
            if let Err(err) = backend.ensure_indexes().await {
                tracing::error!(error = %err, "failed to create job indexes");
            }
        }
        queue
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.store.is_connected()
    }

    pub fn lifecycle(&self) -> &Arc<JobLifecycle> {
        &self.lifecycle
    }

    pub fn wrapper(&self) -> &ExecutionWrapper {
        &self.wrapper
    }

    pub async fn create_job(&self, job_type: &str, data: Value, options: &JobOptions) -> LifecycleResult<Job> {
        self.lifecycle.create(job_type, data, options).await
    }

    pub async fn update_job_status(
        &self,
        job_id: &JobId,
        update: JobStatusUpdate,
    ) -> LifecycleResult<Option<Job>> {
        self.lifecycle.update_status(job_id, update).await
    }

    pub async fn get_job(&self, job_id: &JobId) -> Option<Job> {
        self.lifecycle.get(job_id).await
    }

    pub async fn get_all_jobs(&self, filter: &JobFilter, page: Page) -> Vec<Job> {
        self.lifecycle.list(filter, page).await
    }

    pub async fn get_job_stats(&self) -> JobStats {
        self.lifecycle.stats().await
    }

    /// Put a failed job back to pending without running it.
    pub async fn retry_job(&self, job_id: &JobId) -> LifecycleResult<Job> {
        self.lifecycle
            .retry(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.clone()))
    }

    /// Put a failed job back to pending and run it through `handlers`.
    pub async fn retry_job_with<H: JobHandlers>(&self, job_id: &JobId, handlers: &H) -> LifecycleResult<Job> {
        self.recovery.retry_job(job_id, handlers).await
    }

    pub async fn delete_job(&self, job_id: &JobId) -> bool {
        self.lifecycle.delete(job_id).await
    }

    pub async fn cleanup(&self, older_than_days: u32) -> CleanupReport {
        self.lifecycle.cleanup(older_than_days).await
    }

    /// Cleanup with the configured retention.
    pub async fn cleanup_expired(&self) -> CleanupReport {
        self.cleanup(self.config.cleanup_days).await
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
        self.wrapper.wrap(job_type, operation, payload, options).await
    }

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
        self.wrapper.wrap_kind(kind, operation, payload, options).await
    }

    pub async fn resume_pending_jobs(&self) -> usize {
        self.recovery.resume_pending_jobs().await
    }

    pub async fn process_pending_jobs<H: JobHandlers>(&self, handlers: &H) -> RecoveryReport {
        self.recovery.process_pending_jobs(handlers).await
    }

    pub fn subscribe(&self) -> Subscription<JobEvent> {
        self.registry.subscribe()
    }

    /// Release the store connection. The queue keeps working memory-only.
    pub async fn close(&self) {
        self.store.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::FailingBackend;
    use jobqueue_core::JobStatus;
    use serde_json::json;

    #[tokio::test]
    async fn retry_of_unknown_job_is_not_found() {
        let queue = JobQueue::in_memory().await;
        let err = queue.retry_job(&JobId::from("nope")).await.unwrap_err();
        assert_eq!(err, JobError::NotFound(JobId::from("nope")));
    }

    #[tokio::test]
    async fn unreachable_backend_runs_memory_only() {
        let queue = JobQueue::builder(QueueConfig::default())
            .with_backend(Arc::new(FailingBackend))
            .build()
            .await;
        assert!(!queue.is_connected());

        let job = queue.create_job("chat", json!({}), &JobOptions::default()).await.unwrap();
        queue
            .update_job_status(&job.job_id, JobStatusUpdate::Processing)
            .await
            .unwrap();

        let got = queue.get_job(&job.job_id).await.unwrap();
        assert_eq!(got.status, JobStatus::Processing);
        assert_eq!(queue.get_job_stats().await.processing, 1);
        assert_eq!(queue.resume_pending_jobs().await, 0);
    }

    #[tokio::test]
    async fn close_keeps_cache_serving() {
        let queue = JobQueue::in_memory().await;
        let job = queue.create_job("chat", json!({}), &JobOptions::default()).await.unwrap();
        queue.close().await;

        assert!(!queue.is_connected());
        assert!(queue.get_job(&job.job_id).await.is_some());
        assert_eq!(queue.get_all_jobs(&JobFilter::all(), Page::all()).await.len(), 1);
    }
}
