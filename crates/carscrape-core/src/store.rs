//! In-memory job store with an optional JSON snapshot on disk.
//!
//! The store is the only owner of [`Job`] records. Readers get cloned
//! snapshots; every write goes through [`JobStore::transition`], a
//! compare-and-set on the job's status performed under the write lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, JobStatus};

/// Criteria for [`JobStore::list`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub source: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self
                .source
                .as_deref()
                .is_none_or(|src| job.target.source == src)
    }
}

/// Job counts per status plus the number of records scraped so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct JobStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_records: usize,
    /// Mean `success_rate` of succeeded jobs that found at least one page.
    pub average_success_rate: f64,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    saved_at: DateTime<Utc>,
    jobs: Vec<Job>,
}

#[derive(Clone, Default)]
pub struct JobStore {
    jobs: Arc<RwLock<HashMap<Uuid, Job>>>,
    snapshot_path: Option<PathBuf>,
}

impl JobStore {
    /// Memory-only store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store backed by a snapshot file, restoring it if it exists.
    ///
    /// Jobs that were mid-flight when the snapshot was written are put back
    /// to `pending`; their attempt counters are kept.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AppError> {
        let path = path.into();
        let mut jobs = HashMap::new();

        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let snapshot: Snapshot = serde_json::from_str(&raw)?;
            let mut recovered = 0usize;
            for mut job in snapshot.jobs {
                if matches!(job.status, JobStatus::Running | JobStatus::Retrying) {
                    job.status = JobStatus::Pending;
                    job.next_attempt_at = None;
                    job.updated_at = Utc::now();
                    recovered += 1;
                }
                jobs.insert(job.id, job);
            }
            tracing::info!(
                path = %path.display(),
                jobs = jobs.len(),
                recovered,
                saved_at = %snapshot.saved_at,
                "Restored job snapshot"
            );
        }

        Ok(Self {
            jobs: Arc::new(RwLock::new(jobs)),
            snapshot_path: Some(path),
        })
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned job store lock");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned job store lock");
            poisoned.into_inner()
        })
    }

    pub fn create(&self, job: Job) -> Result<Uuid, AppError> {
        let mut jobs = self.write();
        if let Some(existing) = jobs.get(&job.id) {
            return Err(AppError::Conflict {
                id: job.id,
                expected: job.status,
                actual: existing.status,
            });
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    pub fn get(&self, id: Uuid) -> Result<Job, AppError> {
        self.read().get(&id).cloned().ok_or(AppError::NotFound(id))
    }

    /// Atomically move job `id` from `from` to `to`, applying `mutate` first.
    ///
    /// Fails with [`AppError::Conflict`] if the job is not currently in
    /// `from`. `from == to` is allowed for bookkeeping updates that must not
    /// change the status. Entering a terminal status stamps `completed_at`.
    pub fn transition<F>(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        mutate: F,
    ) -> Result<Job, AppError>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.write();
        let job = jobs.get_mut(&id).ok_or(AppError::NotFound(id))?;
        if job.status != from {
            return Err(AppError::Conflict {
                id,
                expected: from,
                actual: job.status,
            });
        }

        mutate(job);
        let now = Utc::now();
        job.status = to;
        job.updated_at = now;
        if to.is_terminal() && from != to {
            job.completed_at = Some(now);
            job.next_attempt_at = None;
            debug_assert!(
                job.result.is_some() != job.error.is_some(),
                "terminal job {id} must carry exactly one of result/error"
            );
        }

        Ok(job.clone())
    }

    /// Matching jobs, newest first.
    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let jobs = self.read();
        let mut matched: Vec<Job> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        matched
    }

    /// `(id, source)` of every pending job, oldest first.
    pub fn pending_oldest_first(&self) -> Vec<(Uuid, String)> {
        let jobs = self.read();
        let mut pending: Vec<&Job> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pending
            .into_iter()
            .map(|j| (j.id, j.target.source.clone()))
            .collect()
    }

    pub fn count_by_status(&self, status: JobStatus) -> usize {
        self.read().values().filter(|j| j.status == status).count()
    }

    pub fn stats(&self) -> JobStats {
        let jobs = self.read();
        let mut stats = JobStats {
            total: jobs.len(),
            ..JobStats::default()
        };
        let mut rates = Vec::new();
        for job in jobs.values() {
            if let Some(scrape) = job.stats.as_ref().filter(|s| s.total_found > 0) {
                rates.push(scrape.success_rate);
            }
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Retrying => stats.retrying += 1,
                JobStatus::Succeeded => stats.succeeded += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
            stats.total_records += job.record_count();
        }
        if !rates.is_empty() {
            let mean = rates.iter().sum::<f64>() / rates.len() as f64;
            stats.average_success_rate = (mean * 100.0).round() / 100.0;
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove terminal jobs that completed more than `age` ago.
    pub fn delete_older_than(&self, age: Duration) -> usize {
        let age = TimeDelta::from_std(age).unwrap_or(TimeDelta::MAX);
        let cutoff = Utc::now().checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut jobs = self.write();
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.completed_at.is_some_and(|done| done < cutoff))
        });
        before - jobs.len()
    }

    /// Write all jobs to the snapshot file, if one is configured.
    pub fn save_snapshot(&self) -> Result<(), AppError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let snapshot = Snapshot {
            saved_at: Utc::now(),
            jobs: self.read().values().cloned().collect(),
        };
        let body = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, path)?;

        tracing::debug!(path = %path.display(), jobs = snapshot.jobs.len(), "Saved job snapshot");
        Ok(())
    }
}
