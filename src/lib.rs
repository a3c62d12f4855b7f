pub mod config;
pub mod error;
pub mod node;
pub mod scheduler;
pub mod service;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use error::{Result, SchedulerError};
