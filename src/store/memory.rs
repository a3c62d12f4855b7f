use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::job::Job;
use crate::store::{JobPatch, JobPredicate, JobStore};

#[derive(Debug)]
struct StoredJob {
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<Uuid, StoredJob>,
    next_seq: u64,
}

impl Inner {
    fn name_taken(&self, name: &str, except: Option<Uuid>) -> bool {
        self.jobs
            .values()
            .any(|stored| stored.job.name == name && Some(stored.job.id) != except)
    }
}

/// Keeps jobs in memory behind a lock. Bounded by `max_jobs`.
#[derive(Debug)]
pub struct MemoryJobStore {
    inner: RwLock<Inner>,
    max_jobs: usize,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::with_capacity(SchedulerConfig::default().max_jobs)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_jobs,
        }
    }

    /// Returns the current number of jobs in the store
    pub async fn len(&self) -> usize {
        self.inner.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.jobs.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: Job) -> Result<Job> {
        let mut inner = self.inner.write().await;
        if inner.jobs.len() >= self.max_jobs {
            return Err(SchedulerError::StoreFull(self.max_jobs));
        }
        if inner.name_taken(&job.name, None) {
            return Err(SchedulerError::DuplicateName(job.name));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(
            job.id,
            StoredJob {
                seq,
                job: job.clone(),
            },
        );
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self
            .inner
            .read()
            .await
            .jobs
            .get(&id)
            .map(|stored| stored.job.clone()))
    }

    async fn find(&self, predicate: JobPredicate<'_>) -> Result<Vec<Job>> {
        let inner = self.inner.read().await;
        let mut matches: Vec<&StoredJob> = inner
            .jobs
            .values()
            .filter(|stored| predicate(&stored.job))
            .collect();
        matches.sort_by_key(|stored| stored.seq);
        Ok(matches.into_iter().map(|stored| stored.job.clone()).collect())
    }

    async fn update(&self, id: Uuid, patch: JobPatch) -> Result<Job> {
        let mut inner = self.inner.write().await;
        let mut updated = match inner.jobs.get(&id) {
            Some(stored) => stored.job.clone(),
            None => return Err(SchedulerError::JobNotFound(id)),
        };
        patch(&mut updated)?;
        updated.id = id;
        if inner.name_taken(&updated.name, Some(id)) {
            return Err(SchedulerError::DuplicateName(updated.name));
        }
        if let Some(stored) = inner.jobs.get_mut(&id) {
            stored.job = updated.clone();
        }
        Ok(updated)
    }

    async fn delete(&self, id: Uuid) -> Result<Job> {
        self.inner
            .write()
            .await
            .jobs
            .remove(&id)
            .map(|stored| stored.job)
            .ok_or(SchedulerError::JobNotFound(id))
    }
}
