//! Write-through job cache plus lifecycle event feed.
//!
//! The registry is the authoritative in-process view of job records and the
//! fallback data source whenever the store has nothing to say. Every mutation
//! happens as a read-modify-write on a clone under the cache lock, so two
//! transitions on one job can never interleave; the lock is never held across
//! an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use jobqueue_core::{Job, JobFilter, JobId, JobStats, LifecycleResult};
use jobqueue_events::{EventBus, InMemoryEventBus, JobEvent, Subscription};

use crate::store::{JobStore, Page, sort_newest_first};

pub struct JobRegistry {
    cache: RwLock<HashMap<JobId, Job>>,
    store: Arc<JobStore>,
    bus: Arc<InMemoryEventBus<JobEvent>>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("cached", &self.len())
            .field("store", &self.store)
            .finish()
    }
}

impl JobRegistry {
    pub fn new(store: Arc<JobStore>, bus: Arc<InMemoryEventBus<JobEvent>>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            store,
            bus,
        }
    }

    pub fn len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cache-only lookup.
    pub fn cached(&self, job_id: &JobId) -> Option<Job> {
        self.read_cache(|cache| cache.get(job_id).cloned()).flatten()
    }

    /// Cache first, then a cold read from the store that populates the cache.
    pub async fn get(&self, job_id: &JobId) -> Option<Job> {
        if let Some(job) = self.cached(job_id) {
            return Some(job);
        }
        let job = self.store.find_one(job_id).await?;
        debug!(job_id = %job_id, "job loaded from store");
        self.hydrate(job.clone());
        self.cached(job_id).or(Some(job))
    }

    /// Insert or replace a record, emitting `created` or `updated`.
    pub fn put(&self, job: Job) {
        let existed = self.write_cache(|cache| cache.insert(job.job_id.clone(), job.clone()).is_some());
        match existed {
            Some(true) => self.emit(JobEvent::Updated { job }),
            Some(false) => self.emit(JobEvent::Created { job }),
            None => {}
        }
    }

    /// Load a record read from the store without emitting events.
    ///
    /// Keeps whichever copy has the higher version. Returns whether the cache changed.
    pub fn hydrate(&self, job: Job) -> bool {
        self.write_cache(|cache| match cache.get(&job.job_id) {
            Some(current) if current.version >= job.version => false,
            _ => {
                cache.insert(job.job_id.clone(), job);
                true
            }
        })
        .unwrap_or(false)
    }

    /// Run `mutate` on a copy of the cached job and commit it if it succeeds.
    ///
    /// Returns `None` when the job is not cached. On error the cached record is
    /// left untouched. A committed change is announced with `event`.
    pub fn apply<F>(
        &self,
        job_id: &JobId,
        mutate: F,
        event: fn(Job) -> JobEvent,
    ) -> Option<LifecycleResult<Job>>
    where
        F: FnOnce(&mut Job) -> LifecycleResult<()>,
    {
        let outcome = self.write_cache(|cache| {
            let current = cache.get(job_id)?;
            let mut next = current.clone();
            Some(mutate(&mut next).map(|()| {
                cache.insert(job_id.clone(), next.clone());
                next
            }))
        })??;

        if let Ok(job) = &outcome {
            self.emit(event(job.clone()));
        }
        Some(outcome)
    }

    /// Store rows when there are any, otherwise the matching cached records.
    pub async fn list(&self, filter: &JobFilter, page: Page) -> Vec<Job> {
        let rows = self.store.find(filter, page).await;
        if !rows.is_empty() {
            return rows;
        }

        let mut jobs = self
            .read_cache(|cache| {
                cache
                    .values()
                    .filter(|job| filter.matches(job))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        sort_newest_first(&mut jobs);
        page.slice(jobs)
    }

    /// Store aggregate when it counts anything, otherwise counts over the cache.
    pub async fn stats(&self) -> JobStats {
        let stats = JobStats::from_counts(self.store.aggregate_stats().await);
        if stats.total > 0 {
            return stats;
        }
        self.read_cache(|cache| JobStats::from_jobs(cache.values()))
            .unwrap_or_default()
    }

    pub fn remove(&self, job_id: &JobId) -> Option<Job> {
        let removed = self.write_cache(|cache| cache.remove(job_id)).flatten();
        if removed.is_some() {
            self.emit(JobEvent::Deleted {
                job_id: job_id.clone(),
            });
        }
        removed
    }

    /// Drop every cached record matching `filter`. Returns the removed ids.
    pub fn remove_matching(&self, filter: &JobFilter) -> Vec<JobId> {
        let removed = self
            .write_cache(|cache| {
                let ids: Vec<JobId> = cache
                    .values()
                    .filter(|job| filter.matches(job))
                    .map(|job| job.job_id.clone())
                    .collect();
                for id in &ids {
                    cache.remove(id);
                }
                ids
            })
            .unwrap_or_default();

        for job_id in &removed {
            self.emit(JobEvent::Deleted {
                job_id: job_id.clone(),
            });
        }
        removed
    }

    pub fn emit(&self, event: JobEvent) {
        let name = event.name();
        if let Err(err) = self.bus.publish(event) {
            warn!(event = name, error = %err, "failed to publish job event");
        }
    }

    pub fn subscribe(&self) -> Subscription<JobEvent> {
        self.bus.subscribe()
    }

    fn read_cache<R>(&self, f: impl FnOnce(&HashMap<JobId, Job>) -> R) -> Option<R> {
        match self.cache.read() {
            Ok(cache) => Some(f(&cache)),
            Err(_) => {
                warn!("job cache lock poisoned");
                None
            }
        }
    }

    fn write_cache<R>(&self, f: impl FnOnce(&mut HashMap<JobId, Job>) -> R) -> Option<R> {
        match self.cache.write() {
            Ok(mut cache) => Some(f(&mut cache)),
            Err(_) => {
                warn!("job cache lock poisoned");
                None
            }
        }
    }
}
