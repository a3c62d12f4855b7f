use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::command::{Capability, JobCommand};

/// A worker is reported unresponsive after this long without a ping.
const UNRESPONSIVE_AFTER_MS: i64 = 120_000;
/// Consecutive failures at which a worker is reported degraded.
const DEGRADED_AFTER_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerHealth {
    Healthy,
    Unresponsive,
    Degraded,
    Offline,
}

/// Worker state tracking.
///
/// Status and current job only change through [`WorkerRegistry`], which keeps
/// `current_job` set exactly while the worker is busy.
#[derive(Debug, Clone, Serialize)]
pub struct Worker {
    pub id: String,
    pub host: String,
    pub port: u16,
    capabilities: BTreeSet<Capability>,
    status: WorkerStatus,
    current_job: Option<Uuid>,
    pub last_ping: DateTime<Utc>,
    pub last_online: DateTime<Utc>,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub consecutive_failures: u32,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let id = id.into();
        let capabilities: BTreeSet<Capability> = capabilities.into_iter().collect();
        if capabilities.is_empty() {
            return Err(SchedulerError::InvalidField {
                field: "capabilities",
                reason: format!("worker {id} needs at least one capability"),
            });
        }
        Ok(Self {
            id,
            host: "localhost".to_string(),
            port: 0,
            capabilities,
            status: WorkerStatus::Idle,
            current_job: None,
            last_ping: now,
            last_online: now,
            jobs_completed: 0,
            jobs_failed: 0,
            consecutive_failures: 0,
        })
    }

    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Register the worker as already offline, e.g. when seeding a stale pool.
    pub fn offline(mut self) -> Self {
        self.status = WorkerStatus::Offline;
        self
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn current_job(&self) -> Option<Uuid> {
        self.current_job
    }

    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn is_idle(&self) -> bool {
        self.status == WorkerStatus::Idle
    }

    pub fn health(&self, now: DateTime<Utc>) -> WorkerHealth {
        if self.status == WorkerStatus::Offline {
            WorkerHealth::Offline
        } else if (now - self.last_ping).num_milliseconds() > UNRESPONSIVE_AFTER_MS {
            WorkerHealth::Unresponsive
        } else if self.consecutive_failures >= DEGRADED_AFTER_FAILURES {
            WorkerHealth::Degraded
        } else {
            WorkerHealth::Healthy
        }
    }

    pub fn load_percentage(&self) -> u8 {
        match self.status {
            WorkerStatus::Busy => 100,
            WorkerStatus::Offline => 0,
            WorkerStatus::Idle => {
                let finished = self.jobs_completed + self.jobs_failed;
                let base = ((finished / 10) * 10).min(80);
                let penalty = u64::from(self.consecutive_failures) * 5;
                (base + penalty).min(90) as u8
            }
        }
    }
}

/// Reasons an assignment is refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssignError {
    #[error("Worker {0} not found")]
    UnknownWorker(String),

    #[error("Worker {worker_id} is not available (status: {status})")]
    Unavailable {
        worker_id: String,
        status: WorkerStatus,
    },

    #[error("Worker {worker_id} doesn't support '{capability}' commands")]
    MissingCapability {
        worker_id: String,
        capability: Capability,
        /// Idle workers that do support the capability.
        available: Vec<String>,
        /// Workers that support the capability but are not idle.
        busy: Vec<String>,
    },
}

/// Transitions applied by one health sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSweep {
    pub went_offline: Vec<String>,
    pub recovered: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterStats {
    pub total_workers: usize,
    pub active_workers: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub offline_workers: usize,
    pub capability_counts: BTreeMap<Capability, usize>,
}

/// In-memory catalog of workers.
///
/// Workers keep their registration order, which is also the final tie-break
/// when selecting a worker.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: Vec<Worker>,
    worker_timeout_ms: i64,
    recovery_grace_ms: i64,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

impl WorkerRegistry {
    pub fn new(worker_timeout_ms: u64, recovery_grace_ms: u64) -> Self {
        Self {
            workers: Vec::new(),
            worker_timeout_ms: worker_timeout_ms as i64,
            recovery_grace_ms: recovery_grace_ms as i64,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.worker_timeout_ms, config.recovery_grace_ms)
    }

    /// Register a new worker
    pub fn register(&mut self, worker: Worker) -> Result<()> {
        if self.get(&worker.id).is_some() {
            return Err(SchedulerError::InvalidField {
                field: "id",
                reason: format!("worker {} is already registered", worker.id),
            });
        }
        tracing::info!(
            worker_id = %worker.id,
            capabilities = ?worker.capabilities,
            status = %worker.status,
            "Worker registered"
        );
        self.workers.push(worker);
        Ok(())
    }

    pub fn get(&self, worker_id: &str) -> Option<&Worker> {
        self.workers.iter().find(|w| w.id == worker_id)
    }

    fn get_mut(&mut self, worker_id: &str) -> Option<&mut Worker> {
        self.workers.iter_mut().find(|w| w.id == worker_id)
    }

    pub fn all(&self) -> &[Worker] {
        &self.workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Record a liveness ping. Returns false for an unknown worker.
    pub fn heartbeat(&mut self, worker_id: &str, now: DateTime<Utc>) -> bool {
        match self.get_mut(worker_id) {
            Some(worker) => {
                worker.last_ping = now;
                true
            }
            None => false,
        }
    }

    /// Pick the idle worker with `capability` that has the fewest consecutive
    /// failures, then the fewest completed jobs.
    pub fn select_for_capability(&self, capability: Capability) -> Option<&Worker> {
        let selected = self
            .workers
            .iter()
            .filter(|w| w.is_idle() && w.supports(capability))
            .min_by_key(|w| (w.consecutive_failures, w.jobs_completed));

        match selected {
            Some(worker) => {
                tracing::debug!(worker_id = %worker.id, %capability, "Selected worker");
            }
            None => {
                tracing::debug!(%capability, "No available workers with capability");
            }
        }
        selected
    }

    /// Mark `worker_id` busy with `job_id`.
    pub fn assign(
        &mut self,
        worker_id: &str,
        job_id: Uuid,
        command: &JobCommand,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), AssignError> {
        let capability = command.capability();
        let (status, supports) = match self.get(worker_id) {
            Some(worker) => (worker.status, worker.supports(capability)),
            None => return Err(AssignError::UnknownWorker(worker_id.to_string())),
        };

        if status != WorkerStatus::Idle {
            return Err(AssignError::Unavailable {
                worker_id: worker_id.to_string(),
                status,
            });
        }

        if !supports {
            let (available, busy) = self.partition_compatible(capability);
            return Err(AssignError::MissingCapability {
                worker_id: worker_id.to_string(),
                capability,
                available,
                busy,
            });
        }

        if let Some(worker) = self.get_mut(worker_id) {
            worker.status = WorkerStatus::Busy;
            worker.current_job = Some(job_id);
            worker.last_ping = now;
            worker.last_online = now;
        }
        tracing::info!(job_id = %job_id, worker_id, %capability, "Job assigned");
        Ok(())
    }

    /// Select and assign in one step. Returns the chosen worker id, or `None`
    /// when no idle worker has the capability the command needs.
    pub fn reserve(
        &mut self,
        job_id: Uuid,
        command: &JobCommand,
        now: DateTime<Utc>,
    ) -> std::result::Result<Option<String>, AssignError> {
        let Some(worker_id) = self
            .select_for_capability(command.capability())
            .map(|w| w.id.clone())
        else {
            return Ok(None);
        };
        self.assign(&worker_id, job_id, command, now)?;
        Ok(Some(worker_id))
    }

    /// Undo an assignment that never started running. Counters are untouched.
    pub fn cancel_assignment(&mut self, worker_id: &str, job_id: Uuid) -> bool {
        match self.get_mut(worker_id) {
            Some(worker) if worker.current_job == Some(job_id) => {
                worker.status = WorkerStatus::Idle;
                worker.current_job = None;
                tracing::debug!(job_id = %job_id, worker_id, "Assignment cancelled");
                true
            }
            _ => false,
        }
    }

    /// Return a busy worker to idle and update its counters.
    ///
    /// Returns false for an unknown worker or one that is not busy, so a
    /// repeated release never counts the same job twice.
    pub fn release(&mut self, worker_id: &str, success: bool, now: DateTime<Utc>) -> bool {
        let Some(worker) = self.get_mut(worker_id) else {
            tracing::warn!(worker_id, "Release for unknown worker");
            return false;
        };
        if worker.status != WorkerStatus::Busy {
            tracing::warn!(worker_id, status = %worker.status, "Release for worker that is not busy");
            return false;
        }

        worker.status = WorkerStatus::Idle;
        worker.current_job = None;
        worker.last_ping = now;
        worker.last_online = now;
        if success {
            worker.jobs_completed += 1;
            worker.consecutive_failures = 0;
        } else {
            worker.jobs_failed += 1;
            worker.consecutive_failures += 1;
        }
        tracing::info!(
            worker_id,
            success,
            consecutive_failures = worker.consecutive_failures,
            "Worker released"
        );
        true
    }

    /// Apply offline and recovery transitions to every worker.
    ///
    /// Idle workers whose last ping is older than the timeout go offline; busy
    /// workers are left alone until their job finishes. An offline worker
    /// comes back as idle once it has pinged within the recovery grace window.
    pub fn sweep_health(&mut self, now: DateTime<Utc>) -> HealthSweep {
        let timeout = Duration::milliseconds(self.worker_timeout_ms);
        let grace = Duration::milliseconds(self.recovery_grace_ms);
        let mut sweep = HealthSweep::default();

        for worker in &mut self.workers {
            let since_ping = now - worker.last_ping;
            if since_ping > timeout && worker.status != WorkerStatus::Busy {
                if worker.status != WorkerStatus::Offline {
                    tracing::warn!(worker_id = %worker.id, "Marking worker as offline");
                    worker.status = WorkerStatus::Offline;
                    sweep.went_offline.push(worker.id.clone());
                }
            } else if worker.status == WorkerStatus::Offline && since_ping < grace {
                tracing::info!(worker_id = %worker.id, "Worker back online");
                worker.status = WorkerStatus::Idle;
                worker.last_online = now;
                sweep.recovered.push(worker.id.clone());
            }
        }
        sweep
    }

    /// Ids of all workers supporting `capability`, whatever their status.
    pub fn compatible_worker_ids(&self, capability: Capability) -> Vec<String> {
        self.workers
            .iter()
            .filter(|w| w.supports(capability))
            .map(|w| w.id.clone())
            .collect()
    }

    /// Compatible workers split into idle ones and the rest.
    pub fn partition_compatible(&self, capability: Capability) -> (Vec<String>, Vec<String>) {
        let (available, busy): (Vec<&Worker>, Vec<&Worker>) = self
            .workers
            .iter()
            .filter(|w| w.supports(capability))
            .partition(|w| w.is_idle());
        (
            available.into_iter().map(|w| w.id.clone()).collect(),
            busy.into_iter().map(|w| w.id.clone()).collect(),
        )
    }

    pub fn stats(&self) -> ClusterStats {
        let total_workers = self.workers.len();
        let offline_workers = self
            .workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Offline)
            .count();
        let busy_workers = self
            .workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Busy)
            .count();
        let active_workers = total_workers - offline_workers;
        let capability_counts = Capability::ALL
            .iter()
            .map(|cap| (*cap, self.workers.iter().filter(|w| w.supports(*cap)).count()))
            .collect();

        ClusterStats {
            total_workers,
            active_workers,
            idle_workers: active_workers - busy_workers,
            busy_workers,
            offline_workers,
            capability_counts,
        }
    }
}
