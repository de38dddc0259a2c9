//! Test cluster wiring in-memory stores to one or more schedulers.

use crate::fixtures::{RecordingOrchestrator, ScriptedRunner};
use sediment_core::config::{RetryPolicy, SchedulerConfig};
use sediment_core::ports::{BlobStore, ClaimStore, EventBus, JobRepository, PipelineRepository};
use sediment_pfs::{CommitGraph, MemoryBlobStore, MemoryEventBus};
use sediment_scheduler::{
    MemoryClaimStore, MemoryJobRepository, MemoryPipelineRepository, Scheduler, SchedulerDeps,
    SchedulerHandle,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Retry policy short enough to keep tests fast.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5))
}

pub struct TestClusterBuilder {
    runner: Arc<ScriptedRunner>,
    orchestrator: Arc<RecordingOrchestrator>,
    blobs: Arc<dyn BlobStore>,
    jobs: Arc<dyn JobRepository>,
    config: SchedulerConfig,
    spawn: bool,
}

impl Default for TestClusterBuilder {
    fn default() -> Self {
        Self {
            runner: Arc::new(ScriptedRunner::copy()),
            orchestrator: Arc::new(RecordingOrchestrator::new(4)),
            blobs: Arc::new(MemoryBlobStore::new()),
            jobs: Arc::new(MemoryJobRepository::new()),
            config: SchedulerConfig::default()
                .with_instance_id("scheduler-0")
                .with_scale_down_check_interval(Duration::from_millis(10))
                .with_recovery_interval(Duration::from_millis(10))
                .with_retry(fast_retry()),
            spawn: true,
        }
    }
}

impl TestClusterBuilder {
    pub fn runner(mut self, runner: ScriptedRunner) -> Self {
        self.runner = Arc::new(runner);
        self
    }

    pub fn orchestrator(mut self, orchestrator: RecordingOrchestrator) -> Self {
        self.orchestrator = Arc::new(orchestrator);
        self
    }

    pub fn blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = blobs;
        self
    }

    pub fn jobs(mut self, jobs: Arc<dyn JobRepository>) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn config(mut self, f: impl FnOnce(SchedulerConfig) -> SchedulerConfig) -> Self {
        self.config = f(self.config);
        self
    }

    /// Do not start the event loop; tests drive the scheduler directly.
    pub fn without_event_loop(mut self) -> Self {
        self.spawn = false;
        self
    }

    pub async fn build(self) -> anyhow::Result<TestCluster> {
        crate::init_test_logging();

        let bus = Arc::new(MemoryEventBus::new(self.config.event_buffer));
        let event_bus: Arc<dyn EventBus> = bus.clone();
        let graph = CommitGraph::with_retry(self.blobs, event_bus.clone(), self.config.retry.clone());
        let pipelines: Arc<dyn PipelineRepository> = Arc::new(MemoryPipelineRepository::new());
        let claims: Arc<dyn ClaimStore> = Arc::new(MemoryClaimStore::new());

        let deps = SchedulerDeps {
            graph: graph.clone(),
            event_bus,
            pipelines,
            jobs: self.jobs,
            claims,
            runner: self.runner.clone(),
            orchestrator: self.orchestrator.clone(),
        };
        let scheduler = Scheduler::new(self.config.clone(), deps.clone());
        let mut handles = Vec::new();
        if self.spawn {
            handles.push(scheduler.spawn().await?);
        }

        Ok(TestCluster {
            graph,
            bus,
            runner: self.runner,
            orchestrator: self.orchestrator,
            scheduler,
            deps,
            config: self.config,
            handles: Mutex::new(handles),
        })
    }
}

/// In-process Sediment cluster.
///
/// Call [`TestCluster::shutdown`] to stop the event loops; dropping the
/// cluster leaves them to be torn down with the runtime.
pub struct TestCluster {
    pub graph: CommitGraph,
    pub bus: Arc<MemoryEventBus>,
    pub runner: Arc<ScriptedRunner>,
    pub orchestrator: Arc<RecordingOrchestrator>,
    pub scheduler: Scheduler,
    deps: SchedulerDeps,
    config: SchedulerConfig,
    handles: Mutex<Vec<SchedulerHandle>>,
}

impl TestCluster {
    /// Cluster with a copying runner and a 4-slot orchestrator.
    pub async fn new() -> anyhow::Result<Self> {
        Self::builder().build().await
    }

    pub fn builder() -> TestClusterBuilder {
        TestClusterBuilder::default()
    }

    pub fn deps(&self) -> &SchedulerDeps {
        &self.deps
    }

    /// Start another scheduler instance sharing every store with the first.
    pub async fn add_instance(&self, instance_id: &str) -> anyhow::Result<Scheduler> {
        let config = self.config.clone().with_instance_id(instance_id);
        let scheduler = Scheduler::new(config, self.deps.clone());
        self.handles.lock().await.push(scheduler.spawn().await?);
        Ok(scheduler)
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        for handle in self.handles.into_inner() {
            handle.shutdown().await?;
        }
        Ok(())
    }
}
