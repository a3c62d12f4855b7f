//! Workers and the machinery that runs commands on them.
//!
//! - [`WorkerRegistry`]: in-memory catalog tracking status, capabilities,
//!   health and load; selects and reserves workers for jobs
//! - [`CommandExecutor`]: runs a classified [`JobCommand`](crate::scheduler::JobCommand)
//!   and returns its output; [`ProcessExecutor`] is the local-process implementation
//! - [`heartbeat`]: keeps the process-local pool marked alive
//!
//! # Worker lifecycle
//!
//! 1. Registered idle at startup from the configured pool
//! 2. `idle -> busy` when the dispatcher reserves it for a job
//! 3. `busy -> idle` when the execution runner releases it, success or not
//! 4. `idle -> offline` when pings stop for longer than the worker timeout;
//!    back to idle once pings resume within the recovery grace window

pub mod executor;
pub mod heartbeat;
pub mod registry;

pub use executor::{CommandExecutor, ExecutionError, ProcessExecutor};
pub use registry::{AssignError, Worker, WorkerHealth, WorkerRegistry, WorkerStatus};
