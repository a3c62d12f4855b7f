use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::{Capability, JobStatus};
use crate::worker::registry::AssignError;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Invalid cron expression: {0}")]
    InvalidSchedule(String),

    #[error("Job already exists with name: {0}")]
    DuplicateName(String),

    #[error("Job cannot depend on itself")]
    SelfDependency,

    #[error("One or more dependencies not found: {0:?}")]
    MissingDependencies(Vec<Uuid>),

    #[error("Circular dependency detected: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    #[error("Cannot delete job {job} while other jobs depend on it: {dependents:?}")]
    HasDependents {
        job: String,
        dependents: Vec<String>,
    },

    #[error("Job is already running: {0}")]
    AlreadyRunning(String),

    #[error("Job {job} now needs '{capability}' commands, not supported by reserved worker {worker_id}")]
    CommandChanged {
        job: String,
        worker_id: String,
        capability: Capability,
    },

    #[error("Job {job} is {status}, expected pending")]
    NotPending { job: String, status: JobStatus },

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Worker {0} is not busy")]
    WorkerNotBusy(String),

    #[error("Job store at capacity ({0} jobs)")]
    StoreFull(usize),

    #[error(transparent)]
    Assignment(#[from] AssignError),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchedulerError {
    /// Validation errors are rejected at the request boundary with no state change.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SchedulerError::MissingField(_)
                | SchedulerError::InvalidField { .. }
                | SchedulerError::InvalidSchedule(_)
                | SchedulerError::DuplicateName(_)
                | SchedulerError::SelfDependency
                | SchedulerError::MissingDependencies(_)
                | SchedulerError::CircularDependency(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
