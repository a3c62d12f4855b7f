use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::command::Capability;
use crate::scheduler::dependency::{self, DependencyState};
use crate::scheduler::job::Job;
use crate::scheduler::runner::ExecutionRunner;
use crate::store::{self, JobStore};
use crate::worker::registry::WorkerRegistry;

/// A job handed to a worker during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub job_id: Uuid,
    pub worker_id: String,
}

/// What a single dispatch tick decided, job by job.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Due jobs in the order they were considered
    pub considered: Vec<Uuid>,
    pub dispatched: Vec<Dispatched>,
    /// Jobs held back by dependencies, with the reason
    pub blocked: Vec<(Uuid, String)>,
    /// Jobs with no idle worker for their capability
    pub no_worker: Vec<(Uuid, Capability)>,
    /// Jobs whose evaluation or assignment failed
    pub errors: Vec<(Uuid, String)>,
    /// Running executions started by this tick
    pub handles: Vec<JoinHandle<bool>>,
}

impl DispatchReport {
    /// Wait for every execution started by this tick.
    pub async fn join(self) -> Vec<bool> {
        let mut outcomes = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            outcomes.push(handle.await.unwrap_or(false));
        }
        outcomes
    }
}

/// Order due jobs by priority (High first), then by `next_run`. Stable, so
/// remaining ties keep fetch order.
pub fn order_for_dispatch(mut jobs: Vec<Job>) -> Vec<Job> {
    jobs.sort_by_key(|job| (job.priority, job.next_run));
    jobs
}

/// The dispatch loop: picks due jobs, gates them on dependencies, reserves a
/// worker and hands the pair to the execution runner.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    registry: Arc<RwLock<WorkerRegistry>>,
    runner: ExecutionRunner,
    config: SchedulerConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<RwLock<WorkerRegistry>>,
        runner: ExecutionRunner,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            runner,
            config,
        }
    }

    /// Run dispatch and health sweeps on their own timers until `shutdown`.
    ///
    /// Both timers are served by this single task, so a tick never overlaps
    /// the previous one; ticks missed while one is running are skipped.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut dispatch_interval =
            tokio::time::interval(Duration::from_millis(self.config.dispatch_interval_ms));
        dispatch_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut health_interval =
            tokio::time::interval(Duration::from_millis(self.config.health_interval_ms));
        health_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            dispatch_interval_ms = self.config.dispatch_interval_ms,
            health_interval_ms = self.config.health_interval_ms,
            "Job scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    tracing::info!("Job scheduler stopping");
                    break;
                }

                _ = health_interval.tick() => {
                    self.registry.write().await.sweep_health(Utc::now());
                }

                _ = dispatch_interval.tick() => {
                    let report = self.tick(Utc::now()).await;
                    tracing::debug!(
                        considered = report.considered.len(),
                        dispatched = report.dispatched.len(),
                        blocked = report.blocked.len(),
                        no_worker = report.no_worker.len(),
                        errors = report.errors.len(),
                        "Dispatch tick finished"
                    );
                }
            }
        }
    }

    /// One dispatch pass. Executions are started but not awaited.
    pub async fn tick(&self, now: DateTime<Utc>) -> DispatchReport {
        let mut report = DispatchReport::default();

        self.registry.write().await.sweep_health(now);

        let due = match self.store.find(&|job: &Job| job.is_due(now)).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(error = %e, "Failed to fetch due jobs");
                return report;
            }
        };

        for job in order_for_dispatch(due) {
            let job_id = job.id;
            let name = job.name.clone();
            report.considered.push(job_id);
            if let Err(e) = self.dispatch_one(job, now, &mut report).await {
                tracing::error!(job_id = %job_id, job = %name, error = %e, "Failed to dispatch job");
                report.errors.push((job_id, e.to_string()));
            }
        }
        report
    }

    async fn dependency_snapshot(&self, job: &Job) -> Result<HashMap<Uuid, DependencyState>> {
        let mut snapshot = HashMap::with_capacity(job.dependencies.len());
        for dep_id in &job.dependencies {
            if let Some(dep) = self.store.get(*dep_id).await? {
                snapshot.insert(
                    *dep_id,
                    DependencyState {
                        name: dep.name,
                        status: dep.status,
                    },
                );
            }
        }
        Ok(snapshot)
    }

    async fn dispatch_one(
        &self,
        job: Job,
        now: DateTime<Utc>,
        report: &mut DispatchReport,
    ) -> Result<()> {
        let snapshot = self.dependency_snapshot(&job).await?;
        let readiness = dependency::is_ready(&job, &snapshot);
        if !readiness.ready {
            let reason = readiness.reason();
            tracing::info!(job_id = %job.id, job = %job.name, %reason, "Job not ready");
            report.blocked.push((job.id, reason));
            return Ok(());
        }

        let capability = job.command.capability();
        let worker_id = {
            let mut registry = self.registry.write().await;
            match registry.reserve(job.id, &job.command, now)? {
                Some(worker_id) => worker_id,
                None => {
                    let (_, busy) = registry.partition_compatible(capability);
                    if busy.is_empty() {
                        tracing::info!(job = %job.name, %capability, "No workers support capability");
                    } else {
                        tracing::info!(
                            job = %job.name,
                            %capability,
                            workers = ?busy,
                            "No available workers, all compatible workers busy or offline"
                        );
                    }
                    report.no_worker.push((job.id, capability));
                    return Ok(());
                }
            }
        };

        // The reservation was made for the fetched command; a concurrent edit
        // may have changed it to one the worker can't run.
        let job_id = job.id;
        let reserved_worker = worker_id.clone();
        let running = match self
            .store
            .update(
                job_id,
                store::patch(move |job| {
                    let current = job.command.capability();
                    if current != capability {
                        return Err(SchedulerError::CommandChanged {
                            job: job.name.clone(),
                            worker_id: reserved_worker,
                            capability: current,
                        });
                    }
                    job.start(now)
                }),
            )
            .await
        {
            Ok(job) => job,
            Err(e) => {
                self.registry
                    .write()
                    .await
                    .cancel_assignment(&worker_id, job_id);
                return Err(e);
            }
        };

        tracing::info!(
            job_id = %job_id,
            job = %running.name,
            worker_id = %worker_id,
            %capability,
            "Job dispatched"
        );
        report.dispatched.push(Dispatched {
            job_id,
            worker_id: worker_id.clone(),
        });
        report.handles.push(self.runner.spawn(running, worker_id));
        Ok(())
    }
}
