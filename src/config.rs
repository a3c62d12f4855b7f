use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::scheduler::command::Capability;
use crate::scheduler::job::Priority;
use crate::worker::registry::Worker;

pub const DEFAULT_JOB_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_MAX_JOBS: usize = 10_000;
/// Upper bound for every millisecond setting (one year).
const MAX_DURATION_MS: u64 = 365 * 24 * 3_600_000;
/// How stale a worker seeded as offline looks at startup.
const SEEDED_OFFLINE_AGE_MS: i64 = 3_600_000;

/// Timers, timeouts and limits for the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often due jobs are dispatched
    pub dispatch_interval_ms: u64,
    /// How often worker health is swept, independent of dispatch
    pub health_interval_ms: u64,
    /// How often the local pool pings the registry
    pub heartbeat_interval_ms: u64,
    /// Idle workers silent for longer than this go offline
    pub worker_timeout_ms: u64,
    /// An offline worker recovers once it has pinged within this window
    pub recovery_grace_ms: u64,
    /// Delay before a failed job is retried
    pub retry_backoff_ms: u64,
    /// Execution timeout for jobs that don't set their own
    pub default_job_timeout_ms: u64,
    /// Execution output is cut to this many characters
    pub max_output_len: usize,
    /// Maximum number of jobs kept by the in-memory store
    pub max_jobs: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_ms: 60_000,
            health_interval_ms: 30_000,
            heartbeat_interval_ms: 60_000,
            worker_timeout_ms: 300_000,
            recovery_grace_ms: 30_000,
            retry_backoff_ms: 60_000,
            default_job_timeout_ms: DEFAULT_JOB_TIMEOUT_MS,
            max_output_len: 5_000,
            max_jobs: DEFAULT_MAX_JOBS,
        }
    }
}

impl SchedulerConfig {
    /// Reject settings the timers can't run with.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("dispatch_interval_ms", self.dispatch_interval_ms),
            ("health_interval_ms", self.health_interval_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
        ] {
            if value == 0 {
                return Err(SchedulerError::Config(format!("{field} must be greater than 0")));
            }
        }
        for (field, value) in [
            ("dispatch_interval_ms", self.dispatch_interval_ms),
            ("health_interval_ms", self.health_interval_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("worker_timeout_ms", self.worker_timeout_ms),
            ("recovery_grace_ms", self.recovery_grace_ms),
            ("retry_backoff_ms", self.retry_backoff_ms),
            ("default_job_timeout_ms", self.default_job_timeout_ms),
        ] {
            if value > MAX_DURATION_MS {
                return Err(SchedulerError::Config(format!(
                    "{field} must be at most {MAX_DURATION_MS}"
                )));
            }
        }
        if self.max_jobs == 0 {
            return Err(SchedulerError::Config("max_jobs must be greater than 0".to_string()));
        }
        Ok(())
    }
}

/// One worker of the static pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    pub capabilities: Vec<Capability>,
    /// Seed the worker as offline with a stale last ping. The local
    /// heartbeat does not ping it, so it stays offline.
    #[serde(default)]
    pub offline: bool,
}

fn default_host() -> String {
    "localhost".to_string()
}

impl WorkerSpec {
    pub fn new(id: &str, port: u16, capabilities: &[Capability]) -> Self {
        Self {
            id: id.to_string(),
            host: format!("{id}.cluster.local"),
            port,
            capabilities: capabilities.to_vec(),
            offline: false,
        }
    }

    pub fn offline(mut self) -> Self {
        self.offline = true;
        self
    }

    pub fn into_worker(self, now: DateTime<Utc>) -> Result<Worker> {
        if self.offline {
            let seen = now - Duration::milliseconds(SEEDED_OFFLINE_AGE_MS);
            return Ok(Worker::new(self.id, self.capabilities, seen)?
                .with_address(self.host, self.port)
                .offline());
        }
        Ok(Worker::new(self.id, self.capabilities, now)?.with_address(self.host, self.port))
    }
}

/// The process-local worker pool, seeded at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPool {
    #[serde(rename = "worker", default)]
    pub workers: Vec<WorkerSpec>,
}

impl Default for WorkerPool {
    fn default() -> Self {
        use Capability::{Api, Script, Shell};
        Self {
            workers: vec![
                WorkerSpec::new("worker-1", 8001, &[Script, Api, Shell]),
                WorkerSpec::new("worker-2", 8002, &[Script, Api, Shell]),
                WorkerSpec::new("worker-3", 8003, &[Script]),
                WorkerSpec::new("worker-4", 8004, &[Script]),
                WorkerSpec::new("worker-5", 8005, &[Api]),
                WorkerSpec::new("worker-6", 8006, &[Api]),
                WorkerSpec::new("worker-7", 8007, &[Shell]),
                WorkerSpec::new("worker-8", 8008, &[Shell]),
                WorkerSpec::new("worker-9", 8009, &[Script, Api]),
                WorkerSpec::new("worker-10", 8010, &[Api, Shell]),
                WorkerSpec {
                    host: "offline-1.cluster.local".to_string(),
                    ..WorkerSpec::new("worker-11", 8011, &[Script, Api, Shell]).offline()
                },
            ],
        }
    }
}

impl WorkerPool {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| SchedulerError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }
}

/// A job declared in a manifest file. Dependencies are given by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub schedule: String,
    pub command: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub retry_policy: u32,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Jobs to create at startup, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobManifest {
    #[serde(rename = "job", default)]
    pub jobs: Vec<JobSpec>,
}

impl JobManifest {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| SchedulerError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }
}
