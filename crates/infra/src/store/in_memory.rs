//! In-memory job backend for tests/dev and single-process deployments.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use jobqueue_core::{Job, JobFilter, JobId, JobPatch, JobStats, JobStatus, StatusTypeCount};

use super::{JobBackend, Page, StoreError, sort_newest_first};

/// `HashMap`-backed [`JobBackend`].
#[derive(Debug, Default)]
pub struct InMemoryJobBackend {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seed a record as-is, bypassing duplicate checks. Used to stage
    /// documents left behind by a previous process.
    pub fn seed(&self, job: Job) {
        if let Ok(mut jobs) = self.write() {
            jobs.insert(job.job_id.clone(), job);
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, StoreError> {
        self.jobs
            .read()
            .map_err(|_| StoreError::Unavailable("job map lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, StoreError> {
        self.jobs
            .write()
            .map_err(|_| StoreError::Unavailable("job map lock poisoned".into()))
    }
}

#[async_trait]
impl JobBackend for InMemoryJobBackend {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.job_id) {
            return Err(StoreError::DuplicateKey(job.job_id.clone()));
        }
        jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn update(&self, job_id: &JobId, patch: &JobPatch) -> Result<bool, StoreError> {
        let mut jobs = self.write()?;
        Ok(jobs.get_mut(job_id).is_some_and(|job| patch.apply_to(job)))
    }

    async fn find_one(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.get(job_id).cloned())
    }

    async fn find(&self, filter: &JobFilter, page: Page) -> Result<Vec<Job>, StoreError> {
        let mut result: Vec<Job> = self
            .read()?
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        sort_newest_first(&mut result);
        Ok(page.slice(result))
    }

    async fn aggregate_stats(&self) -> Result<Vec<StatusTypeCount>, StoreError> {
        let jobs = self.read()?;
        let stats = JobStats::from_jobs(jobs.values());
        Ok(stats
            .by_type
            .into_iter()
            .flat_map(|(job_type, counts)| {
                [
                    (JobStatus::Pending, counts.pending),
                    (JobStatus::Processing, counts.processing),
                    (JobStatus::Completed, counts.completed),
                    (JobStatus::Failed, counts.failed),
                ]
                .into_iter()
                .filter(|(_, count)| *count > 0)
                .map(move |(status, count)| StatusTypeCount {
                    status,
                    job_type: job_type.clone(),
                    count,
                })
            })
            .collect())
    }

    async fn delete_many(&self, filter: &JobFilter) -> Result<u64, StoreError> {
        let mut jobs = self.write()?;
        let before = jobs.len();
        jobs.retain(|_, job| !filter.matches(job));
        Ok((before - jobs.len()) as u64)
    }
}
