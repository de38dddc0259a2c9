//! Worker pool sizing.
//!
//! The only writer of a pipeline pool's desired replica count.

use sediment_core::Result;
use sediment_core::config::RetryPolicy;
use sediment_core::pipeline::{ParallelismSpec, PipelineInfo};
use sediment_core::ports::{Orchestrator, PodStatus};
use sediment_core::retry::retry_with_backoff;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Target replicas for a parallelism policy on a cluster of `capacity` slots.
pub fn expected_replicas(spec: Option<&ParallelismSpec>, capacity: u64) -> u64 {
    match spec {
        Some(ParallelismSpec::Constant(n)) => (*n).max(1),
        Some(ParallelismSpec::Coefficient(c)) if *c > 0.0 => {
            let target = (c * capacity as f64).round();
            if target.is_finite() && target >= 1.0 {
                target as u64
            } else {
                1
            }
        }
        _ => 1,
    }
}

struct Pool {
    target: u64,
    idle_since: Option<Instant>,
    watcher: Option<JoinHandle<()>>,
}

impl Drop for Pool {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

pub struct WorkerPoolSizer {
    orchestrator: Arc<dyn Orchestrator>,
    retry: RetryPolicy,
    pools: Mutex<HashMap<String, Pool>>,
}

impl WorkerPoolSizer {
    pub fn new(orchestrator: Arc<dyn Orchestrator>, retry: RetryPolicy) -> Self {
        Self {
            orchestrator,
            retry,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Bring the pipeline's pool to its computed size. Returns the target.
    pub async fn scale_up(&self, pipeline: &PipelineInfo) -> Result<u64> {
        let pool_id = pipeline.pool_id();
        let orchestrator = self.orchestrator.clone();
        let capacity =
            retry_with_backoff(&self.retry, "orchestrator_capacity", || orchestrator.capacity())
                .await?;
        let target = expected_replicas(pipeline.spec.parallelism.as_ref(), capacity);

        let mut pools = self.pools.lock().await;
        let current = pools.get(&pool_id).map(|p| p.target);
        if current != Some(target) {
            self.set_replicas(&pool_id, target).await?;
            info!(pool = %pool_id, replicas = target, capacity, "Scaled worker pool");
        }

        let pool = pools.entry(pool_id.clone()).or_insert(Pool {
            target,
            idle_since: None,
            watcher: None,
        });
        pool.target = target;
        pool.idle_since = None;
        if pool.watcher.is_none() {
            pool.watcher = self.watch(&pool_id).await;
        }
        Ok(target)
    }

    /// Record whether a pool has work. Once idle longer than `threshold` the
    /// pool is scaled to zero; returns true when that happened.
    pub async fn observe(
        &self,
        pool_id: &str,
        active: bool,
        threshold: Option<Duration>,
    ) -> Result<bool> {
        let mut pools = self.pools.lock().await;
        let Some(pool) = pools.get_mut(pool_id) else {
            return Ok(false);
        };
        if active {
            pool.idle_since = None;
            return Ok(false);
        }
        let idle_since = *pool.idle_since.get_or_insert_with(Instant::now);
        let Some(threshold) = threshold else {
            return Ok(false);
        };
        if pool.target == 0 || idle_since.elapsed() < threshold {
            return Ok(false);
        }

        self.set_replicas(pool_id, 0).await?;
        pool.target = 0;
        info!(
            pool = %pool_id,
            idle_ms = idle_since.elapsed().as_millis() as u64,
            "Scaled idle worker pool to zero"
        );
        Ok(true)
    }

    /// Forget a pool and scale it to zero.
    pub async fn remove(&self, pool_id: &str) -> Result<()> {
        let removed = self.pools.lock().await.remove(pool_id);
        if removed.is_some_and(|p| p.target > 0) {
            self.set_replicas(pool_id, 0).await?;
        }
        Ok(())
    }

    /// Last replica count requested for a pool.
    pub async fn target(&self, pool_id: &str) -> Option<u64> {
        self.pools.lock().await.get(pool_id).map(|p| p.target)
    }

    async fn set_replicas(&self, pool_id: &str, replicas: u64) -> Result<()> {
        let orchestrator = self.orchestrator.clone();
        retry_with_backoff(&self.retry, "orchestrator_set_replicas", || {
            orchestrator.set_replicas(pool_id, replicas)
        })
        .await
    }

    async fn watch(&self, pool_id: &str) -> Option<JoinHandle<()>> {
        let mut stream = match self.orchestrator.watch_pod_status(pool_id).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(pool = %pool_id, error = %e, "Could not watch worker pods");
                return None;
            }
        };
        let pool_id = pool_id.to_string();
        Some(tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                match event {
                    Ok(event) => match event.status {
                        PodStatus::Ready => {
                            debug!(pool = %pool_id, pod = %event.pod, "Worker pod ready")
                        }
                        PodStatus::Failed { reason } => {
                            warn!(pool = %pool_id, pod = %event.pod, reason = %reason, "Worker pod failed")
                        }
                    },
                    Err(e) => warn!(pool = %pool_id, error = %e, "Pod status stream error"),
                }
            }
        }))
    }
}
