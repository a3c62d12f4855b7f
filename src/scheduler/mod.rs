//! The scheduling and dispatch engine.
//!
//! - [`cron`]: next-run computation for the supported recurrence patterns
//! - [`dependency`]: readiness checks and cycle detection between jobs
//! - [`job`]: the job record and its execution state machine
//! - [`dispatcher`]: the per-tick dispatch pass and its timers
//! - [`runner`]: executes one dispatched job and applies the retry policy

pub mod command;
pub mod cron;
pub mod dependency;
pub mod dispatcher;
pub mod job;
pub mod runner;

pub use command::{Capability, JobCommand};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use job::{ExecutionRecord, Job, JobStatus, Priority};
pub use runner::ExecutionRunner;
