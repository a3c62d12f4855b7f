//! Job persistence contract.
//!
//! The scheduler only needs create, get, query by predicate, atomic update and
//! delete. [`MemoryJobStore`] is the in-process implementation; a durable
//! backend plugs in by implementing [`JobStore`].

pub mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::job::Job;

pub use memory::MemoryJobStore;

/// In-place change applied atomically by [`JobStore::update`]. An error
/// leaves the stored job untouched.
pub type JobPatch = Box<dyn FnOnce(&mut Job) -> Result<()> + Send>;

/// Box a closure as a [`JobPatch`].
pub fn patch<F>(f: F) -> JobPatch
where
    F: FnOnce(&mut Job) -> Result<()> + Send + 'static,
{
    Box::new(f)
}

/// Filter passed to [`JobStore::find`].
pub type JobPredicate<'a> = &'a (dyn Fn(&Job) -> bool + Send + Sync);

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Names are unique.
    async fn create(&self, job: Job) -> Result<Job>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>>;

    /// Jobs matching `predicate`, in insertion order.
    async fn find(&self, predicate: JobPredicate<'_>) -> Result<Vec<Job>>;

    /// Apply `patch` to the job and return the updated record.
    async fn update(&self, id: Uuid, patch: JobPatch) -> Result<Job>;

    async fn delete(&self, id: Uuid) -> Result<Job>;

    async fn find_by_name(&self, name: &str) -> Result<Option<Job>> {
        let name = name.to_string();
        Ok(self.find(&move |job: &Job| job.name == name).await?.into_iter().next())
    }
}
