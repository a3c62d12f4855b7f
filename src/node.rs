use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::{SchedulerConfig, WorkerPool};
use crate::error::Result;
use crate::scheduler::{Dispatcher, ExecutionRunner};
use crate::service::JobService;
use crate::store::{JobStore, MemoryJobStore};
use crate::worker::heartbeat::HeartbeatSender;
use crate::worker::{CommandExecutor, WorkerRegistry};

/// Main node that wires the store, worker registry, executor and scheduler.
pub struct Node {
    pub config: SchedulerConfig,
    pub store: Arc<dyn JobStore>,
    pub registry: Arc<RwLock<WorkerRegistry>>,
    pub service: Arc<JobService>,
    dispatcher: Dispatcher,
    heartbeat: HeartbeatSender,
}

impl Node {
    /// Build a node backed by the in-memory job store.
    pub fn new(
        config: SchedulerConfig,
        pool: WorkerPool,
        executor: Arc<dyn CommandExecutor>,
    ) -> Result<Self> {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::with_capacity(config.max_jobs));
        Self::with_store(config, pool, store, executor)
    }

    pub fn with_store(
        config: SchedulerConfig,
        pool: WorkerPool,
        store: Arc<dyn JobStore>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        let now = Utc::now();
        let mut registry = WorkerRegistry::from_config(&config);
        let mut worker_ids = Vec::with_capacity(pool.workers.len());
        for spec in pool.workers {
            if !spec.offline {
                worker_ids.push(spec.id.clone());
            }
            registry.register(spec.into_worker(now)?)?;
        }
        let registry = Arc::new(RwLock::new(registry));

        let runner = ExecutionRunner::new(store.clone(), registry.clone(), executor, &config);
        let dispatcher = Dispatcher::new(store.clone(), registry.clone(), runner, config.clone());
        let service = Arc::new(JobService::new(
            store.clone(),
            registry.clone(),
            config.clone(),
        ));
        let heartbeat = HeartbeatSender::new(config.heartbeat_interval_ms, worker_ids);

        Ok(Self {
            config,
            store,
            registry,
            service,
            dispatcher,
            heartbeat,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run the node until `shutdown` is cancelled.
    ///
    /// 1. Spawns the heartbeat task for the local worker pool
    /// 2. Runs the dispatch and health timers on the current task
    ///
    /// Executions already in flight at shutdown are left to finish on the runtime.
    pub async fn run(self, shutdown: CancellationToken) {
        let Node {
            registry,
            dispatcher,
            heartbeat,
            ..
        } = self;

        let heartbeat_registry = registry.clone();
        let heartbeat_shutdown = shutdown.clone();
        let heartbeat_handle = tokio::spawn(async move {
            heartbeat.run(heartbeat_registry, heartbeat_shutdown).await;
        });

        dispatcher.run(shutdown).await;

        if let Err(e) = heartbeat_handle.await {
            tracing::warn!(error = %e, "Heartbeat task ended abnormally");
        }
    }
}
