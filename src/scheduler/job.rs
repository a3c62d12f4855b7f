use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::scheduler::command::JobCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Dispatch priority. The derived order is the dispatch order: High first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "High"),
            Priority::Medium => write!(f, "Medium"),
            Priority::Low => write!(f, "Low"),
        }
    }
}

impl FromStr for Priority {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "High" | "high" => Ok(Priority::High),
            "Medium" | "medium" => Ok(Priority::Medium),
            "Low" | "low" => Ok(Priority::Low),
            other => Err(SchedulerError::InvalidField {
                field: "priority",
                reason: format!("must be High, Medium, or Low, got {other:?}"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

/// One entry of a job's execution log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub output: String,
    pub worker_id: String,
    pub duration_ms: u64,
}

/// Who ran an attempt and when.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Attempt {
    fn record(self, status: ExecutionStatus, output: String) -> ExecutionRecord {
        let duration_ms = (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
        ExecutionRecord {
            start_time: self.started_at,
            end_time: self.finished_at,
            status,
            output,
            worker_id: self.worker_id,
            duration_ms,
        }
    }
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to pending, to be picked up again at the given time.
    Retrying {
        retries_left: u32,
        next_run: DateTime<Utc>,
    },
    /// No retries left; the job stays failed until re-queued by hand.
    Exhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub schedule: String,
    pub command: JobCommand,
    pub priority: Priority,
    pub dependencies: Vec<Uuid>,
    retry_policy: u32,
    retries_left: u32,
    pub status: JobStatus,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub executions: Vec<ExecutionRecord>,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        schedule: impl Into<String>,
        command: JobCommand,
        next_run: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            schedule: schedule.into(),
            command,
            priority: Priority::default(),
            dependencies: Vec::new(),
            retry_policy: 0,
            retries_left: 0,
            status: JobStatus::Pending,
            next_run,
            last_run: None,
            total_runs: 0,
            successful_runs: 0,
            failed_runs: 0,
            executions: Vec::new(),
            timeout_ms: crate::config::DEFAULT_JOB_TIMEOUT_MS,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Uuid>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: u32) -> Self {
        self.set_retry_policy(retry_policy);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn retry_policy(&self) -> u32 {
        self.retry_policy
    }

    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }

    /// Changing the policy refills the retry budget.
    pub fn set_retry_policy(&mut self, retry_policy: u32) {
        self.retry_policy = retry_policy;
        self.retries_left = retry_policy;
    }

    /// `pending -> running`, taken by the dispatcher.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != JobStatus::Pending {
            return Err(SchedulerError::NotPending {
                job: self.name.clone(),
                status: self.status,
            });
        }
        self.status = JobStatus::Running;
        self.last_run = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// `running -> success`.
    pub fn record_success(&mut self, attempt: Attempt, output: String, next_run: DateTime<Utc>) {
        self.updated_at = attempt.finished_at;
        self.status = JobStatus::Success;
        self.next_run = next_run;
        self.total_runs += 1;
        self.successful_runs += 1;
        self.executions
            .push(attempt.record(ExecutionStatus::Success, output));
    }

    /// `running -> failed`, then back to `pending` while retries remain.
    ///
    /// The policy counts retries after the first attempt, so a job with
    /// `retry_policy = n` runs at most `n + 1` times before staying failed.
    pub fn record_failure(
        &mut self,
        attempt: Attempt,
        error: String,
        retry_at: DateTime<Utc>,
    ) -> FailureOutcome {
        self.updated_at = attempt.finished_at;
        self.total_runs += 1;
        self.failed_runs += 1;
        self.executions
            .push(attempt.record(ExecutionStatus::Failed, error));

        if self.retries_left == 0 {
            self.status = JobStatus::Failed;
            return FailureOutcome::Exhausted;
        }

        self.retries_left -= 1;
        self.status = JobStatus::Pending;
        self.next_run = retry_at;
        FailureOutcome::Retrying {
            retries_left: self.retries_left,
            next_run: retry_at,
        }
    }

    /// Manual re-execution: due now, whatever the current state, unless running.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status == JobStatus::Running {
            return Err(SchedulerError::AlreadyRunning(self.name.clone()));
        }
        self.status = JobStatus::Pending;
        self.next_run = now;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_run <= now
    }

    /// Percentage of runs that succeeded, 0 when the job never ran.
    pub fn success_rate(&self) -> f64 {
        if self.total_runs == 0 {
            return 0.0;
        }
        self.successful_runs as f64 / self.total_runs as f64 * 100.0
    }

    pub fn average_duration_ms(&self) -> u64 {
        if self.executions.is_empty() {
            return 0;
        }
        let total: u64 = self.executions.iter().map(|e| e.duration_ms).sum();
        total / self.executions.len() as u64
    }
}

/// Cut `output` down to at most `max_chars` characters.
pub fn truncate_output(mut output: String, max_chars: usize) -> String {
    if let Some((idx, _)) = output.char_indices().nth(max_chars) {
        output.truncate(idx);
    }
    output
}
