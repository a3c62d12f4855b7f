use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::worker::registry::WorkerRegistry;

/// Periodically pings the registry on behalf of workers hosted in this process.
pub struct HeartbeatSender {
    interval: Duration,
    worker_ids: Vec<String>,
}

impl HeartbeatSender {
    pub fn new(interval_ms: u64, worker_ids: Vec<String>) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            worker_ids,
        }
    }

    /// Ping every `interval` until `shutdown` is cancelled.
    pub async fn run(&self, registry: Arc<RwLock<WorkerRegistry>>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let now = Utc::now();
                    let mut registry = registry.write().await;
                    for worker_id in &self.worker_ids {
                        if !registry.heartbeat(worker_id, now) {
                            tracing::warn!(worker_id = %worker_id, "Heartbeat for unknown worker");
                        }
                    }
                }
            }
        }
    }
}
