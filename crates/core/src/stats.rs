//! Aggregated job counts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::job::{Job, JobStatus};

/// One row of a `(status, type)` grouping, as produced by a backend aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTypeCount {
    pub status: JobStatus,
    pub job_type: String,
    pub count: u64,
}

/// Per-status counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    fn add(&mut self, status: JobStatus, count: u64) {
        self.total += count;
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }
}

/// Queue-wide statistics with a per-type breakdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub by_type: BTreeMap<String, StatusCounts>,
}

impl JobStats {
    pub fn from_counts<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = StatusTypeCount>,
    {
        let mut totals = StatusCounts::default();
        let mut by_type: BTreeMap<String, StatusCounts> = BTreeMap::new();

        for row in rows {
            totals.add(row.status, row.count);
            by_type.entry(row.job_type).or_default().add(row.status, row.count);
        }

        Self {
            total: totals.total,
            pending: totals.pending,
            processing: totals.processing,
            completed: totals.completed,
            failed: totals.failed,
            by_type,
        }
    }

    /// Count a set of in-memory records.
    pub fn from_jobs<'a, I>(jobs: I) -> Self
    where
        I: IntoIterator<Item = &'a Job>,
    {
        Self::from_counts(jobs.into_iter().map(|job| StatusTypeCount {
            status: job.status,
            job_type: job.job_type.clone(),
            count: 1,
        }))
    }
}
