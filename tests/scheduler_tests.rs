use chrono::{Duration, Utc};

use cronlite::scheduler::dispatcher::order_for_dispatch;
use cronlite::scheduler::job::{Attempt, ExecutionStatus, FailureOutcome};
use cronlite::scheduler::{Job, JobCommand, JobStatus, Priority};
use cronlite::SchedulerError;

fn test_job(name: &str) -> Job {
    Job::new(name, "0 * * * *", JobCommand::parse("echo hi"), Utc::now())
}

fn attempt(worker: &str) -> Attempt {
    let started_at = Utc::now();
    Attempt {
        worker_id: worker.to_string(),
        started_at,
        finished_at: started_at + Duration::milliseconds(250),
    }
}

#[test]
fn test_job_creation() {
    let job = test_job("backup").with_retry_policy(3);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.priority, Priority::Medium);
    assert_eq!(job.retry_policy(), 3);
    assert_eq!(job.retries_left(), 3);
    assert_eq!(job.total_runs, 0);
    assert!(job.last_run.is_none());
    assert!(job.executions.is_empty());
}

#[test]
fn test_start_only_from_pending() {
    let mut job = test_job("backup");
    let now = Utc::now();
    job.start(now).unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.last_run, Some(now));

    let err = job.start(now).unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::NotPending {
            status: JobStatus::Running,
            ..
        }
    ));
}

#[test]
fn test_success_records_execution() {
    let mut job = test_job("backup");
    job.start(Utc::now()).unwrap();
    let next = Utc::now() + Duration::hours(1);
    job.record_success(attempt("w1"), "done".to_string(), next);

    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.next_run, next);
    assert_eq!(job.total_runs, 1);
    assert_eq!(job.successful_runs, 1);
    let record = &job.executions[0];
    assert_eq!(record.status, ExecutionStatus::Success);
    assert_eq!(record.output, "done");
    assert_eq!(record.worker_id, "w1");
    assert_eq!(record.duration_ms, 250);
}

#[test]
fn test_retry_policy_two_with_three_failures() {
    let mut job = test_job("flaky").with_retry_policy(2);
    let mut observed = Vec::new();

    for _ in 0..3 {
        assert_eq!(job.status, JobStatus::Pending);
        job.start(Utc::now()).unwrap();
        let retry_at = Utc::now() + Duration::minutes(1);
        let outcome = job.record_failure(attempt("w1"), "boom".to_string(), retry_at);
        observed.push((outcome, job.status, job.retries_left()));
        if let FailureOutcome::Retrying { next_run, .. } = outcome {
            assert_eq!(job.next_run, next_run);
        }
    }

    assert!(matches!(
        observed[0],
        (FailureOutcome::Retrying { retries_left: 1, .. }, JobStatus::Pending, 1)
    ));
    assert!(matches!(
        observed[1],
        (FailureOutcome::Retrying { retries_left: 0, .. }, JobStatus::Pending, 0)
    ));
    assert_eq!(observed[2], (FailureOutcome::Exhausted, JobStatus::Failed, 0));

    assert_eq!(job.failed_runs, 3);
    assert_eq!(job.total_runs, 3);
    assert!(job
        .executions
        .iter()
        .all(|e| e.status == ExecutionStatus::Failed && e.output == "boom"));
}

#[test]
fn test_no_retry_policy_fails_immediately() {
    let mut job = test_job("once");
    job.start(Utc::now()).unwrap();
    let outcome = job.record_failure(attempt("w1"), "nope".to_string(), Utc::now());
    assert_eq!(outcome, FailureOutcome::Exhausted);
    assert_eq!(job.status, JobStatus::Failed);
    assert!(!job.is_due(Utc::now() + Duration::days(1)));
}

#[test]
fn test_requeue() {
    let mut job = test_job("manual");
    let now = Utc::now();
    job.start(now).unwrap();
    assert!(matches!(
        job.requeue(now),
        Err(SchedulerError::AlreadyRunning(_))
    ));

    job.record_failure(attempt("w1"), "x".to_string(), now);
    assert_eq!(job.status, JobStatus::Failed);

    let later = now + Duration::minutes(5);
    job.requeue(later).unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.next_run, later);
    assert!(job.is_due(later));
}

#[test]
fn test_is_due() {
    let now = Utc::now();
    let job = Job::new("later", "0 * * * *", JobCommand::parse("true"), now + Duration::minutes(5));
    assert!(!job.is_due(now));
    assert!(job.is_due(now + Duration::minutes(5)));
}

#[test]
fn test_success_rate_and_average_duration() {
    let mut job = test_job("stats").with_retry_policy(1);
    assert_eq!(job.success_rate(), 0.0);
    assert_eq!(job.average_duration_ms(), 0);

    job.start(Utc::now()).unwrap();
    job.record_failure(attempt("w1"), "x".to_string(), Utc::now());
    job.start(Utc::now()).unwrap();
    let started_at = Utc::now();
    job.record_success(
        Attempt {
            worker_id: "w2".to_string(),
            started_at,
            finished_at: started_at + Duration::milliseconds(750),
        },
        String::new(),
        Utc::now(),
    );

    assert_eq!(job.success_rate(), 50.0);
    assert_eq!(job.average_duration_ms(), 500);
}

#[test]
fn test_dispatch_order_high_medium_low() {
    let due = Utc::now();
    let a = Job::new("A", "0 * * * *", JobCommand::parse("true"), due).with_priority(Priority::Low);
    let b = Job::new("B", "0 * * * *", JobCommand::parse("true"), due).with_priority(Priority::High);
    let c =
        Job::new("C", "0 * * * *", JobCommand::parse("true"), due).with_priority(Priority::Medium);

    let names: Vec<String> = order_for_dispatch(vec![a, b, c])
        .into_iter()
        .map(|j| j.name)
        .collect();
    assert_eq!(names, vec!["B", "C", "A"]);
}

#[test]
fn test_dispatch_order_within_priority() {
    let now = Utc::now();
    let late = Job::new("late", "0 * * * *", JobCommand::parse("true"), now);
    let early = Job::new(
        "early",
        "0 * * * *",
        JobCommand::parse("true"),
        now - Duration::minutes(3),
    );
    let tie = Job::new("tie", "0 * * * *", JobCommand::parse("true"), now);

    let names: Vec<String> = order_for_dispatch(vec![late, early, tie])
        .into_iter()
        .map(|j| j.name)
        .collect();
    assert_eq!(names, vec!["early", "late", "tie"]);
}

#[test]
fn test_priority_parsing() {
    assert_eq!("High".parse::<Priority>().unwrap(), Priority::High);
    assert_eq!("low".parse::<Priority>().unwrap(), Priority::Low);
    assert!("urgent".parse::<Priority>().is_err());
}
