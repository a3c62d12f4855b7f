use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::scheduler::cron;
use crate::scheduler::job::{truncate_output, Attempt, Job, JobStatus};
use crate::store::{self, JobStore};
use crate::worker::executor::{CommandExecutor, ExecutionError};
use crate::worker::registry::WorkerRegistry;

/// Runs one dispatched job on its reserved worker and records the outcome.
///
/// The job is expected to be `running` and the worker `busy` with it. The
/// worker is released on every path, including a panic inside the executor.
#[derive(Clone)]
pub struct ExecutionRunner {
    store: Arc<dyn JobStore>,
    registry: Arc<RwLock<WorkerRegistry>>,
    executor: Arc<dyn CommandExecutor>,
    retry_backoff: chrono::Duration,
    max_output_len: usize,
}

impl ExecutionRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<RwLock<WorkerRegistry>>,
        executor: Arc<dyn CommandExecutor>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            executor,
            retry_backoff: chrono::Duration::milliseconds(config.retry_backoff_ms as i64),
            max_output_len: config.max_output_len,
        }
    }

    /// Start the job in its own task. Resolves to true when the command succeeded.
    pub fn spawn(&self, job: Job, worker_id: String) -> JoinHandle<bool> {
        let runner = self.clone();
        tokio::spawn(async move { runner.run(job, worker_id).await })
    }

    async fn run(self, job: Job, worker_id: String) -> bool {
        let job_id = job.id;
        let started_at = Utc::now();
        tracing::info!(job_id = %job_id, job = %job.name, worker_id = %worker_id, "Starting job");

        // The command runs in a separate task so a panic surfaces here as a
        // JoinError instead of unwinding past the release below.
        let executor = self.executor.clone();
        let command = job.command.clone();
        let timeout_ms = job.timeout_ms;
        let execution = tokio::spawn(async move {
            match tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                executor.execute(&command),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ExecutionError::TimedOut(timeout_ms)),
            }
        });
        let result = match execution.await {
            Ok(result) => result,
            Err(e) => Err(ExecutionError::Aborted(e.to_string())),
        };

        let success = result.is_ok();
        let attempt = Attempt {
            worker_id: worker_id.clone(),
            started_at,
            finished_at: Utc::now(),
        };
        self.record(job_id, attempt, result).await;

        let released = self
            .registry
            .write()
            .await
            .release(&worker_id, success, Utc::now());
        if !released {
            tracing::warn!(job_id = %job_id, worker_id = %worker_id, "Worker was not busy at release");
        }
        success
    }

    async fn record(
        &self,
        job_id: Uuid,
        attempt: Attempt,
        result: Result<String, ExecutionError>,
    ) {
        let finished_at = attempt.finished_at;
        let max_output_len = self.max_output_len;

        match result {
            Ok(output) => {
                let output = truncate_output(output, max_output_len);
                let updated = self
                    .store
                    .update(
                        job_id,
                        store::patch(move |job| {
                            let next_run = cron::next_run(&job.schedule, finished_at).at();
                            job.record_success(attempt, output, next_run);
                            Ok(())
                        }),
                    )
                    .await;
                match updated {
                    Ok(job) => tracing::info!(
                        job_id = %job_id,
                        job = %job.name,
                        next_run = %job.next_run,
                        "Job completed successfully"
                    ),
                    Err(e) => tracing::error!(job_id = %job_id, error = %e, "Failed to record job success"),
                }
            }
            Err(err) => {
                let message = truncate_output(err.to_string(), max_output_len);
                tracing::warn!(job_id = %job_id, error = %message, "Job failed");
                let retry_at = finished_at + self.retry_backoff;
                let updated = self
                    .store
                    .update(
                        job_id,
                        store::patch(move |job| {
                            job.record_failure(attempt, message, retry_at);
                            Ok(())
                        }),
                    )
                    .await;
                match updated {
                    Ok(job) => log_failure_outcome(&job),
                    Err(e) => tracing::error!(job_id = %job_id, error = %e, "Failed to record job failure"),
                }
            }
        }
    }
}

fn log_failure_outcome(job: &Job) {
    if job.status == JobStatus::Failed {
        tracing::warn!(
            job_id = %job.id,
            job = %job.name,
            failed_runs = job.failed_runs,
            "Job failed permanently after all retries"
        );
    } else {
        tracing::info!(
            job_id = %job.id,
            job = %job.name,
            retries_left = job.retries_left(),
            next_run = %job.next_run,
            "Job will retry"
        );
    }
}
