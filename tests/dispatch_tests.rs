
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cronlite::config::SchedulerConfig;
use cronlite::node::Node;
use cronlite::scheduler::{Capability, Job, JobCommand, JobStatus, Priority};
use cronlite::scheduler::job::ExecutionStatus;
use cronlite::service::NewJob;
use cronlite::store::{self, JobPatch, JobPredicate, JobStore, MemoryJobStore};
use cronlite::worker::WorkerStatus;
use cronlite::SchedulerError;
use test_harness::{
    assert_eventually, job, new_job, past, pool, single_worker_pool, test_config, test_node,
    FakeExecutor, Outcome,
};

#[tokio::test]
async fn test_dispatch_considers_high_then_medium_then_low() {
    let executor = FakeExecutor::new();
    let node = test_node(
        pool(&[
            ("w1", &[Capability::Shell]),
            ("w2", &[Capability::Shell]),
            ("w3", &[Capability::Shell]),
        ]),
        executor.clone(),
    );
    let now = past();
    let mut ids = Vec::new();
    for (name, priority) in [("A", Priority::Low), ("B", Priority::High), ("C", Priority::Medium)] {
        let created = node
            .service
            .create_job(
                NewJob {
                    priority: Some(priority),
                    ..new_job(name, &format!("echo {name}"))
                },
                now,
            )
            .await
            .unwrap();
        ids.push(created.id);
    }
    let (a, b, c) = (ids[0], ids[1], ids[2]);

    let report = node.dispatcher().tick(Utc::now()).await;
    assert_eq!(report.considered, vec![b, c, a]);
    let dispatched: Vec<_> = report.dispatched.iter().map(|d| d.job_id).collect();
    assert_eq!(dispatched, vec![b, c, a]);

    let outcomes = report.join().await;
    assert_eq!(outcomes, vec![true, true, true]);
    for id in [a, b, c] {
        assert_eq!(job(&node, id).await.status, JobStatus::Success);
    }
}

#[tokio::test]
async fn test_job_waits_for_idle_worker() {
    let executor = FakeExecutor::new();
    let node = test_node(single_worker_pool(), executor.clone());
    let now = past();
    let first = node.service.create_job(new_job("first", "echo 1"), now).await.unwrap();
    let second = node.service.create_job(new_job("second", "echo 2"), now).await.unwrap();

    let report = node.dispatcher().tick(Utc::now()).await;
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.dispatched[0].job_id, first.id);
    assert_eq!(report.dispatched[0].worker_id, "shell-1");
    assert_eq!(report.no_worker, vec![(second.id, Capability::Shell)]);
    report.join().await;

    assert_eq!(job(&node, second.id).await.status, JobStatus::Pending);

    let report = node.dispatcher().tick(Utc::now()).await;
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.dispatched[0].job_id, second.id);
    report.join().await;
    assert_eq!(job(&node, second.id).await.status, JobStatus::Success);
}

#[tokio::test]
async fn test_no_worker_with_capability() {
    let executor = FakeExecutor::new();
    let node = test_node(pool(&[("w1", &[Capability::Shell])]), executor.clone());
    let api = node
        .service
        .create_job(new_job("ping", "https://svc.internal/health"), past())
        .await
        .unwrap();

    let report = node.dispatcher().tick(Utc::now()).await;
    assert!(report.dispatched.is_empty());
    assert_eq!(report.no_worker, vec![(api.id, Capability::Api)]);
    assert!(executor.calls().is_empty());
    assert_eq!(job(&node, api.id).await.status, JobStatus::Pending);
}

#[tokio::test]
async fn test_dependent_runs_after_dependency_succeeds() {
    let executor = FakeExecutor::new();
    let node = test_node(
        pool(&[("w1", &[Capability::Shell]), ("w2", &[Capability::Shell])]),
        executor.clone(),
    );
    let now = past();
    let extract = node.service.create_job(new_job("extract", "echo extract"), now).await.unwrap();
    let load = node
        .service
        .create_job(
            NewJob {
                dependencies: vec![extract.id],
                ..new_job("load", "echo load")
            },
            now,
        )
        .await
        .unwrap();

    let report = node.dispatcher().tick(Utc::now()).await;
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.dispatched[0].job_id, extract.id);
    assert_eq!(report.blocked.len(), 1);
    assert_eq!(report.blocked[0].0, load.id);
    assert_eq!(report.blocked[0].1, "Waiting for dependencies: extract (running)");
    report.join().await;

    let report = node.dispatcher().tick(Utc::now()).await;
    assert_eq!(report.considered, vec![load.id]);
    assert_eq!(report.dispatched.len(), 1);
    report.join().await;

    assert_eq!(executor.calls(), vec!["echo extract", "echo load"]);
    assert_eq!(job(&node, load.id).await.status, JobStatus::Success);
}

#[tokio::test]
async fn test_failed_dependency_keeps_dependent_blocked() {
    let executor = FakeExecutor::new();
    executor.script("false", vec![Outcome::Fail("exit 1".to_string())]);
    let node = test_node(single_worker_pool(), executor.clone());
    let now = past();
    let upstream = node.service.create_job(new_job("upstream", "false"), now).await.unwrap();
    let downstream = node
        .service
        .create_job(
            NewJob {
                dependencies: vec![upstream.id],
                ..new_job("downstream", "echo down")
            },
            now,
        )
        .await
        .unwrap();

    node.dispatcher().tick(Utc::now()).await.join().await;
    assert_eq!(job(&node, upstream.id).await.status, JobStatus::Failed);

    let report = node.dispatcher().tick(Utc::now()).await;
    assert!(report.dispatched.is_empty());
    assert_eq!(
        report.blocked,
        vec![(downstream.id, "Waiting for dependencies: upstream (failed)".to_string())]
    );
}

#[tokio::test]
async fn test_retry_until_exhausted() {
    let executor = FakeExecutor::new();
    executor.script("./flaky.sh", vec![Outcome::Fail("boom".to_string())]);
    let node = test_node(single_worker_pool(), executor.clone());
    let flaky = node
        .service
        .create_job(
            NewJob {
                retry_policy: Some(2),
                ..new_job("flaky", "./flaky.sh")
            },
            past(),
        )
        .await
        .unwrap();

    let mut retries_seen = Vec::new();
    for _ in 0..3 {
        let report = node.dispatcher().tick(Utc::now()).await;
        assert_eq!(report.dispatched.len(), 1);
        assert_eq!(report.join().await, vec![false]);
        let current = job(&node, flaky.id).await;
        retries_seen.push((current.status, current.retries_left()));
    }
    assert_eq!(
        retries_seen,
        vec![
            (JobStatus::Pending, 1),
            (JobStatus::Pending, 0),
            (JobStatus::Failed, 0),
        ]
    );

    let report = node.dispatcher().tick(Utc::now()).await;
    assert!(report.considered.is_empty());

    let status = node.service.job_status(flaky.id).await.unwrap();
    assert_eq!(status.failed_runs, 3);
    assert_eq!(status.total_runs, 3);

    let worker = node.service.worker("shell-1", Utc::now()).await.unwrap();
    assert_eq!(worker.status, WorkerStatus::Idle);
    assert_eq!(worker.jobs_failed, 3);
    assert_eq!(worker.consecutive_failures, 3);
}

#[tokio::test]
async fn test_retry_then_success() {
    let executor = FakeExecutor::new();
    executor.script(
        "echo eventually",
        vec![
            Outcome::Fail("first".to_string()),
            Outcome::Succeed("second".to_string()),
        ],
    );
    let node = test_node(single_worker_pool(), executor.clone());
    let created = node
        .service
        .create_job(
            NewJob {
                retry_policy: Some(3),
                ..new_job("eventually", "echo eventually")
            },
            past(),
        )
        .await
        .unwrap();

    node.dispatcher().tick(Utc::now()).await.join().await;
    node.dispatcher().tick(Utc::now()).await.join().await;

    let history = node.service.job_history(created.id).await.unwrap();
    assert_eq!(history.executions.len(), 2);
    assert_eq!(history.executions[0].status, ExecutionStatus::Failed);
    assert_eq!(history.executions[0].output, "first");
    assert_eq!(history.executions[1].status, ExecutionStatus::Success);
    assert_eq!(history.executions[1].output, "second");
    assert_eq!(history.success_rate, 50.0);

    let current = job(&node, created.id).await;
    assert_eq!(current.status, JobStatus::Success);
    assert_eq!(current.retries_left(), 2);
    assert!(current.next_run > Utc::now());
}

#[tokio::test]
async fn test_worker_released_when_executor_panics() {
    let executor = FakeExecutor::new();
    executor.script("crash", vec![Outcome::Panic]);
    let node = test_node(single_worker_pool(), executor.clone());
    let created = node.service.create_job(new_job("crash", "crash"), past()).await.unwrap();

    let report = node.dispatcher().tick(Utc::now()).await;
    assert_eq!(report.join().await, vec![false]);

    let worker = node.service.worker("shell-1", Utc::now()).await.unwrap();
    assert_eq!(worker.status, WorkerStatus::Idle);
    assert!(worker.current_job.is_none());
    assert_eq!(worker.jobs_failed, 1);

    let failed = job(&node, created.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.executions[0].output.starts_with("Execution aborted"));
}

#[tokio::test]
async fn test_timeout_counts_as_failure_and_releases() {
    let executor = FakeExecutor::new();
    executor.script(
        "sleep 10",
        vec![Outcome::Delay(Duration::from_secs(10), "late".to_string())],
    );
    let node = test_node(single_worker_pool(), executor.clone());
    let created = node
        .service
        .create_job(
            NewJob {
                timeout_ms: Some(50),
                ..new_job("slow", "sleep 10")
            },
            past(),
        )
        .await
        .unwrap();

    let report = node.dispatcher().tick(Utc::now()).await;
    assert_eq!(report.join().await, vec![false]);

    let failed = job(&node, created.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.executions[0].output, "Execution timed out after 50 ms");
    let worker = node.service.worker("shell-1", Utc::now()).await.unwrap();
    assert_eq!(worker.status, WorkerStatus::Idle);
}

#[tokio::test]
async fn test_running_job_is_not_dispatched_twice() {
    let executor = FakeExecutor::new();
    executor.script(
        "echo slow",
        vec![Outcome::Delay(Duration::from_millis(200), "done".to_string())],
    );
    let node = test_node(
        pool(&[("w1", &[Capability::Shell]), ("w2", &[Capability::Shell])]),
        executor.clone(),
    );
    let created = node.service.create_job(new_job("slow", "echo slow"), past()).await.unwrap();

    let first = node.dispatcher().tick(Utc::now()).await;
    assert_eq!(first.dispatched.len(), 1);
    assert_eq!(job(&node, created.id).await.status, JobStatus::Running);

    let second = node.dispatcher().tick(Utc::now()).await;
    assert!(second.considered.is_empty());

    first.join().await;
    assert_eq!(executor.calls().len(), 1);
    assert_eq!(node.registry.read().await.stats().busy_workers, 0);
}

#[tokio::test]
async fn test_tick_does_not_wait_for_execution() {
    let executor = FakeExecutor::new();
    for cmd in ["echo one", "echo two"] {
        executor.script(
            cmd,
            vec![Outcome::Delay(Duration::from_millis(500), "ok".to_string())],
        );
    }
    let node = test_node(
        pool(&[("w1", &[Capability::Shell]), ("w2", &[Capability::Shell])]),
        executor.clone(),
    );
    let now = past();
    node.service.create_job(new_job("one", "echo one"), now).await.unwrap();
    node.service.create_job(new_job("two", "echo two"), now).await.unwrap();

    let started = tokio::time::Instant::now();
    let report = node.dispatcher().tick(Utc::now()).await;
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(report.dispatched.len(), 2);
    assert_eq!(node.registry.read().await.stats().busy_workers, 2);

    assert_eq!(report.join().await, vec![true, true]);
}

#[tokio::test]
async fn test_output_is_truncated() {
    let executor = FakeExecutor::new();
    executor.script("echo big", vec![Outcome::Succeed("x".repeat(6_000))]);
    let node = test_node(single_worker_pool(), executor.clone());
    let created = node.service.create_job(new_job("big", "echo big"), past()).await.unwrap();

    node.dispatcher().tick(Utc::now()).await.join().await;
    let done = job(&node, created.id).await;
    assert_eq!(done.executions[0].output.len(), 5_000);
}

#[tokio::test]
async fn test_node_runs_queued_job_on_timer() {
    let executor = FakeExecutor::new();
    let node = test_node(single_worker_pool(), executor.clone());
    let service = node.service.clone();
    let created = service
        .create_job(new_job("nightly", "script:/opt/nightly.sh"), Utc::now())
        .await
        .unwrap();
    service.execute_now(created.id, Utc::now()).await.unwrap();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(node.run(shutdown.clone()));

    assert_eventually(
        || {
            let service = service.clone();
            async move {
                service
                    .get_job(created.id)
                    .await
                    .map(|j| j.status == JobStatus::Success)
                    .unwrap_or(false)
            }
        },
        Duration::from_secs(5),
        "queued job should run on the dispatch timer",
    )
    .await;
    assert_eq!(executor.calls(), vec!["script:/opt/nightly.sh"]);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("node should stop on shutdown")
        .unwrap();
}

/// Store that rewrites one job's command the first time a given dependency
/// is read, landing an edit between dependency gating and `start`.
struct EditOnDependencyRead {
    inner: MemoryJobStore,
    edit: Mutex<Option<(Uuid, Uuid, JobCommand)>>,
}

#[async_trait]
impl JobStore for EditOnDependencyRead {
    async fn create(&self, job: Job) -> cronlite::Result<Job> {
        self.inner.create(job).await
    }

    async fn get(&self, id: Uuid) -> cronlite::Result<Option<Job>> {
        let armed = {
            let mut edit = self.edit.lock().unwrap();
            match edit.as_ref() {
                Some((dependency, _, _)) if *dependency == id => edit.take(),
                _ => None,
            }
        };
        if let Some((_, target, command)) = armed {
            self.inner
                .update(
                    target,
                    store::patch(move |job| {
                        job.command = command;
                        Ok(())
                    }),
                )
                .await?;
        }
        self.inner.get(id).await
    }

    async fn find(&self, predicate: JobPredicate<'_>) -> cronlite::Result<Vec<Job>> {
        self.inner.find(predicate).await
    }

    async fn update(&self, id: Uuid, patch: JobPatch) -> cronlite::Result<Job> {
        self.inner.update(id, patch).await
    }

    async fn delete(&self, id: Uuid) -> cronlite::Result<Job> {
        self.inner.delete(id).await
    }
}

#[tokio::test]
async fn test_command_changed_after_reservation_is_rolled_back() {
    let executor = FakeExecutor::new();
    let store = Arc::new(EditOnDependencyRead {
        inner: MemoryJobStore::new(),
        edit: Mutex::new(None),
    });
    let node = Node::with_store(
        test_config(),
        pool(&[("shell-only", &[Capability::Shell]), ("api-1", &[Capability::Api])]),
        store.clone(),
        executor.clone(),
    )
    .unwrap();
    let now = past();
    let upstream = node.service.create_job(new_job("upstream", "echo up"), now).await.unwrap();
    let edited = node
        .service
        .create_job(
            NewJob {
                dependencies: vec![upstream.id],
                ..new_job("edited", "echo before")
            },
            now,
        )
        .await
        .unwrap();

    node.dispatcher().tick(Utc::now()).await.join().await;
    assert_eq!(job(&node, upstream.id).await.status, JobStatus::Success);

    *store.edit.lock().unwrap() = Some((
        upstream.id,
        edited.id,
        JobCommand::parse("https://svc.internal/x"),
    ));
    let report = node.dispatcher().tick(Utc::now()).await;
    assert_eq!(report.considered, vec![edited.id]);
    assert!(report.dispatched.is_empty());
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].0, edited.id);
    assert!(report.errors[0].1.contains("shell-only"));

    assert_eq!(executor.calls(), vec!["echo up"]);
    let shell = node.service.worker("shell-only", Utc::now()).await.unwrap();
    assert_eq!(shell.status, WorkerStatus::Idle);
    assert!(shell.current_job.is_none());
    assert_eq!(shell.jobs_completed, 1);
    assert_eq!(job(&node, edited.id).await.status, JobStatus::Pending);

    let report = node.dispatcher().tick(Utc::now()).await;
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.dispatched[0].worker_id, "api-1");
    report.join().await;
    assert_eq!(executor.calls(), vec!["echo up", "https://svc.internal/x"]);
}

#[tokio::test]
async fn test_node_rejects_zero_intervals() {
    let config = SchedulerConfig {
        dispatch_interval_ms: 0,
        ..test_config()
    };
    let result = Node::new(config, single_worker_pool(), FakeExecutor::new());
    assert!(matches!(result, Err(SchedulerError::Config(_))));
}

#[tokio::test]
async fn test_offline_seeded_worker_stays_offline() {
    let mut workers = pool(&[("w1", &[Capability::Shell])]);
    workers.workers.push(
        cronlite::config::WorkerSpec::new("stale", 9100, &[Capability::Shell]).offline(),
    );
    let node = test_node(workers, FakeExecutor::new());
    let shutdown = CancellationToken::new();
    let service = node.service.clone();
    let handle = tokio::spawn(node.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let stale = service.worker("stale", Utc::now()).await.unwrap();
    assert_eq!(stale.status, WorkerStatus::Offline);
    assert_eq!(service.worker("w1", Utc::now()).await.unwrap().status, WorkerStatus::Idle);

    shutdown.cancel();
    handle.await.unwrap();
}
