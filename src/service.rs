//! Operations offered to a request layer (HTTP, CLI, ...).
//!
//! Every mutating call validates its input first and leaves stored state
//! untouched when validation fails.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::{JobManifest, SchedulerConfig};
use crate::error::{Result, SchedulerError};
use crate::scheduler::command::{Capability, JobCommand};
use crate::scheduler::cron;
use crate::scheduler::dependency::DependencyGraph;
use crate::scheduler::job::{ExecutionRecord, Job, JobStatus, Priority};
use crate::store::{self, JobStore};
use crate::worker::registry::{ClusterStats, Worker, WorkerHealth, WorkerRegistry, WorkerStatus};

const MAX_NAME_LEN: usize = 200;
const MAX_COMMAND_LEN: usize = 1000;
const MAX_RETRY_POLICY: u32 = 10;

/// Input for [`JobService::create_job`].
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub name: String,
    pub schedule: String,
    pub command: String,
    pub priority: Option<Priority>,
    pub dependencies: Vec<Uuid>,
    pub retry_policy: Option<u32>,
    pub timeout_ms: Option<u64>,
}

/// Fields to change in [`JobService::update_job`]; `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub name: Option<String>,
    pub schedule: Option<String>,
    pub command: Option<String>,
    pub priority: Option<Priority>,
    pub dependencies: Option<Vec<Uuid>>,
    pub retry_policy: Option<u32>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub priority: Option<Priority>,
}

impl JobFilter {
    fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |status| job.status == status)
            && self.priority.map_or(true, |priority| job.priority == priority)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub id: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
    pub retries_left: u32,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobHistory {
    pub job_id: Uuid,
    pub name: String,
    pub executions: Vec<ExecutionRecord>,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub success_rate: f64,
    pub average_duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub status: WorkerStatus,
    pub current_job: Option<Uuid>,
    pub capabilities: Vec<Capability>,
    pub health: WorkerHealth,
    pub load_percentage: u8,
    pub last_ping: DateTime<Utc>,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub consecutive_failures: u32,
}

pub struct JobService {
    store: Arc<dyn JobStore>,
    registry: Arc<RwLock<WorkerRegistry>>,
    config: SchedulerConfig,
    /// Held from validation through the store write of create, update and
    /// delete, so the dependency graph they check is the one they change.
    write_lock: Mutex<()>,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<RwLock<WorkerRegistry>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn create_job(&self, input: NewJob, now: DateTime<Utc>) -> Result<Job> {
        let name = validate_name(&input.name)?;
        let schedule = validate_schedule(&input.schedule)?;
        let command = validate_command(&input.command)?;
        let retry_policy = validate_retry_policy(input.retry_policy.unwrap_or(0))?;
        let dependencies = dedup(input.dependencies);

        let _guard = self.write_lock.lock().await;
        self.validate_dependencies(None, &name, &dependencies).await?;

        let next_run = cron::next_run(&schedule, now).at();
        let job = Job::new(name, schedule, command, next_run)
            .with_priority(input.priority.unwrap_or_default())
            .with_dependencies(dependencies)
            .with_retry_policy(retry_policy)
            .with_timeout_ms(
                input
                    .timeout_ms
                    .unwrap_or(self.config.default_job_timeout_ms),
            );

        let job = self.store.create(job).await?;
        tracing::info!(
            job_id = %job.id,
            job = %job.name,
            schedule = %job.schedule,
            priority = %job.priority,
            next_run = %job.next_run,
            "Job created"
        );
        Ok(job)
    }

    pub async fn update_job(&self, id: Uuid, update: JobUpdate, now: DateTime<Utc>) -> Result<Job> {
        let _guard = self.write_lock.lock().await;
        let existing = self.require_job(id).await?;

        let name = update.name.as_deref().map(validate_name).transpose()?;
        let schedule = update
            .schedule
            .as_deref()
            .map(validate_schedule)
            .transpose()?;
        let command = update
            .command
            .as_deref()
            .map(validate_command)
            .transpose()?;
        let retry_policy = update.retry_policy.map(validate_retry_policy).transpose()?;
        let dependencies = update.dependencies.map(dedup);

        if let Some(deps) = &dependencies {
            let effective_name = name.as_deref().unwrap_or(&existing.name);
            self.validate_dependencies(Some(id), effective_name, deps).await?;
        }

        let next_run = schedule.as_deref().map(|s| cron::next_run(s, now).at());
        let priority = update.priority;
        let timeout_ms = update.timeout_ms;

        let job = self
            .store
            .update(
                id,
                store::patch(move |job| {
                    if let Some(name) = name {
                        job.name = name;
                    }
                    if let (Some(schedule), Some(next_run)) = (schedule, next_run) {
                        job.schedule = schedule;
                        job.next_run = next_run;
                    }
                    if let Some(command) = command {
                        job.command = command;
                    }
                    if let Some(priority) = priority {
                        job.priority = priority;
                    }
                    if let Some(dependencies) = dependencies {
                        job.dependencies = dependencies;
                    }
                    if let Some(retry_policy) = retry_policy {
                        job.set_retry_policy(retry_policy);
                    }
                    if let Some(timeout_ms) = timeout_ms {
                        job.timeout_ms = timeout_ms;
                    }
                    job.updated_at = now;
                    Ok(())
                }),
            )
            .await?;
        tracing::info!(job_id = %job.id, job = %job.name, "Job updated");
        Ok(job)
    }

    /// Delete a job no other job depends on.
    pub async fn delete_job(&self, id: Uuid) -> Result<Job> {
        let _guard = self.write_lock.lock().await;
        let job = self.require_job(id).await?;

        let dependents = self
            .store
            .find(&|other: &Job| other.dependencies.contains(&id))
            .await?;
        if !dependents.is_empty() {
            return Err(SchedulerError::HasDependents {
                job: job.name,
                dependents: dependents.into_iter().map(|j| j.name).collect(),
            });
        }
        if job.status == JobStatus::Running {
            return Err(SchedulerError::AlreadyRunning(job.name));
        }

        let deleted = self.store.delete(id).await?;
        tracing::info!(job_id = %id, job = %deleted.name, "Job deleted");
        Ok(deleted)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job> {
        self.require_job(id).await
    }

    pub async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>> {
        self.store.find(&move |job: &Job| filter.matches(job)).await
    }

    pub async fn job_status(&self, id: Uuid) -> Result<JobStatusView> {
        let job = self.require_job(id).await?;
        Ok(JobStatusView {
            id: job.id,
            retries_left: job.retries_left(),
            name: job.name,
            status: job.status,
            last_run: job.last_run,
            next_run: job.next_run,
            total_runs: job.total_runs,
            successful_runs: job.successful_runs,
            failed_runs: job.failed_runs,
        })
    }

    pub async fn job_history(&self, id: Uuid) -> Result<JobHistory> {
        let job = self.require_job(id).await?;
        Ok(JobHistory {
            job_id: job.id,
            success_rate: job.success_rate(),
            average_duration_ms: job.average_duration_ms(),
            name: job.name,
            executions: job.executions,
            total_runs: job.total_runs,
            successful_runs: job.successful_runs,
            failed_runs: job.failed_runs,
        })
    }

    /// Queue a job for the next dispatch tick. Rejected while it is running.
    pub async fn execute_now(&self, id: Uuid, now: DateTime<Utc>) -> Result<Job> {
        let job = self
            .store
            .update(id, store::patch(move |job| job.requeue(now)))
            .await?;
        tracing::info!(job_id = %id, job = %job.name, "Job queued for execution");
        Ok(job)
    }

    /// Create every job of a manifest in order, resolving dependency names
    /// against jobs that already exist.
    pub async fn load_manifest(&self, manifest: JobManifest, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut created = Vec::with_capacity(manifest.jobs.len());
        for spec in manifest.jobs {
            let mut dependencies = Vec::with_capacity(spec.dependencies.len());
            for dep_name in &spec.dependencies {
                match self.store.find_by_name(dep_name).await? {
                    Some(dep) => dependencies.push(dep.id),
                    None => {
                        return Err(SchedulerError::InvalidField {
                            field: "dependencies",
                            reason: format!("job {} depends on unknown job {dep_name}", spec.name),
                        })
                    }
                }
            }
            let job = self
                .create_job(
                    NewJob {
                        name: spec.name,
                        schedule: spec.schedule,
                        command: spec.command,
                        priority: Some(spec.priority),
                        dependencies,
                        retry_policy: Some(spec.retry_policy),
                        timeout_ms: spec.timeout_ms,
                    },
                    now,
                )
                .await?;
            created.push(job);
        }
        Ok(created)
    }

    pub async fn workers(&self, now: DateTime<Utc>) -> Vec<WorkerView> {
        let mut registry = self.registry.write().await;
        registry.sweep_health(now);
        registry
            .all()
            .iter()
            .map(|w| worker_view(w, now))
            .collect()
    }

    pub async fn worker(&self, worker_id: &str, now: DateTime<Utc>) -> Result<WorkerView> {
        self.registry
            .read()
            .await
            .get(worker_id)
            .map(|w| worker_view(w, now))
            .ok_or_else(|| SchedulerError::WorkerNotFound(worker_id.to_string()))
    }

    pub async fn workers_by_capability(
        &self,
        capability: Capability,
        now: DateTime<Utc>,
    ) -> Vec<WorkerView> {
        self.workers(now)
            .await
            .into_iter()
            .filter(|w| w.capabilities.contains(&capability))
            .collect()
    }

    pub async fn cluster_stats(&self, now: DateTime<Utc>) -> ClusterStats {
        let mut registry = self.registry.write().await;
        registry.sweep_health(now);
        registry.stats()
    }

    /// Manually reserve a worker for a job, subject to the same checks as
    /// dispatch.
    pub async fn assign_job_to_worker(
        &self,
        worker_id: &str,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let job = self.require_job(job_id).await?;
        let mut registry = self.registry.write().await;
        registry.sweep_health(now);
        registry.assign(worker_id, job.id, &job.command, now)?;
        Ok(())
    }

    pub async fn release_worker(
        &self,
        worker_id: &str,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut registry = self.registry.write().await;
        if registry.get(worker_id).is_none() {
            return Err(SchedulerError::WorkerNotFound(worker_id.to_string()));
        }
        if !registry.release(worker_id, success, now) {
            return Err(SchedulerError::WorkerNotBusy(worker_id.to_string()));
        }
        Ok(())
    }

    async fn require_job(&self, id: Uuid) -> Result<Job> {
        self.store
            .get(id)
            .await?
            .ok_or(SchedulerError::JobNotFound(id))
    }

    async fn validate_dependencies(
        &self,
        job_id: Option<Uuid>,
        name: &str,
        dependencies: &[Uuid],
    ) -> Result<()> {
        if dependencies.is_empty() {
            return Ok(());
        }
        if let Some(id) = job_id {
            if dependencies.contains(&id) {
                return Err(SchedulerError::SelfDependency);
            }
        }

        let jobs = self.store.find(&|_: &Job| true).await?;
        let mut graph = DependencyGraph::from_jobs(&jobs);
        let missing = graph.missing(dependencies);
        if !missing.is_empty() {
            return Err(SchedulerError::MissingDependencies(missing));
        }
        if let Some(id) = job_id {
            graph.set_job(id, name, dependencies.to_vec());
        }

        let check = graph.check_cycle(name, dependencies);
        if check.cyclic {
            tracing::warn!(job = name, path = %check.path.join(" -> "), "Circular dependency rejected");
            return Err(SchedulerError::CircularDependency(check.path));
        }
        Ok(())
    }
}

fn worker_view(worker: &Worker, now: DateTime<Utc>) -> WorkerView {
    WorkerView {
        id: worker.id.clone(),
        host: worker.host.clone(),
        port: worker.port,
        status: worker.status(),
        current_job: worker.current_job(),
        capabilities: worker.capabilities().iter().copied().collect(),
        health: worker.health(now),
        load_percentage: worker.load_percentage(),
        last_ping: worker.last_ping,
        jobs_completed: worker.jobs_completed,
        jobs_failed: worker.jobs_failed,
        consecutive_failures: worker.consecutive_failures,
    }
}

fn validate_name(raw: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(SchedulerError::MissingField("name"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(SchedulerError::InvalidField {
            field: "name",
            reason: format!("longer than {MAX_NAME_LEN} characters"),
        });
    }
    Ok(name.to_string())
}

fn validate_schedule(raw: &str) -> Result<String> {
    let schedule = raw.trim();
    if schedule.is_empty() {
        return Err(SchedulerError::MissingField("schedule"));
    }
    if !cron::is_valid(schedule) {
        return Err(SchedulerError::InvalidSchedule(schedule.to_string()));
    }
    Ok(schedule.to_string())
}

fn validate_command(raw: &str) -> Result<JobCommand> {
    let command = raw.trim();
    if command.is_empty() {
        return Err(SchedulerError::MissingField("command"));
    }
    if command.chars().count() > MAX_COMMAND_LEN {
        return Err(SchedulerError::InvalidField {
            field: "command",
            reason: format!("longer than {MAX_COMMAND_LEN} characters"),
        });
    }
    Ok(JobCommand::parse(command))
}

fn validate_retry_policy(retry_policy: u32) -> Result<u32> {
    if retry_policy > MAX_RETRY_POLICY {
        return Err(SchedulerError::InvalidField {
            field: "retry_policy",
            reason: format!("must be between 0 and {MAX_RETRY_POLICY}"),
        });
    }
    Ok(retry_policy)
}

fn dedup(ids: Vec<Uuid>) -> Vec<Uuid> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}
