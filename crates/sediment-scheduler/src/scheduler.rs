//! Main scheduler service.
//!
//! Consumes commit events, decides which pipelines must run against which
//! input commits, and creates their jobs. Job execution lives in
//! [`crate::jobs`], the pipeline API in [`crate::pipelines`].

use crate::dag::DagBuilder;
use crate::jobs::JobRun;
use crate::metrics::SchedulerMetrics;
use crate::queue::{JobQueue, QueuedJob};
use crate::triggers::{TriggerEvent, TriggerMatcher, check_consistency};
use crate::workers::WorkerPoolSizer;

use chrono::Utc;
use futures::StreamExt;
use sediment_core::config::SchedulerConfig;
use sediment_core::events::{Event, JobStateChangedPayload};
use sediment_core::ids::{CommitId, JobId};
use sediment_core::job::{DatumCounts, InputCommit, JobInfo, JobState};
use sediment_core::pipeline::PipelineInfo;
use sediment_core::ports::{
    ClaimKey, ClaimStore, DatumRunner, EventBus, EventStream, JobRepository, Orchestrator,
    PipelineRepository, Reservation,
};
use sediment_core::repo::{Branch, Commit, CommitInfo};
use sediment_core::retry::retry_with_backoff;
use sediment_core::{Error, Result};
use sediment_pfs::{CommitGraph, StartCommitOptions};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, MutexGuard, PoisonError};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Collaborators a scheduler instance works against. Several instances may
/// share all of them.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub graph: CommitGraph,
    pub event_bus: Arc<dyn EventBus>,
    pub pipelines: Arc<dyn PipelineRepository>,
    pub jobs: Arc<dyn JobRepository>,
    pub claims: Arc<dyn ClaimStore>,
    pub runner: Arc<dyn DatumRunner>,
    pub orchestrator: Arc<dyn Orchestrator>,
}

pub(crate) struct SchedulerInner {
    pub(crate) config: SchedulerConfig,
    pub(crate) graph: CommitGraph,
    pub(crate) event_bus: Arc<dyn EventBus>,
    pub(crate) pipelines: Arc<dyn PipelineRepository>,
    pub(crate) jobs: Arc<dyn JobRepository>,
    pub(crate) claims: Arc<dyn ClaimStore>,
    pub(crate) runner: Arc<dyn DatumRunner>,
    pub(crate) workers: WorkerPoolSizer,
    pub(crate) metrics: Arc<SchedulerMetrics>,
    pub(crate) trigger_matcher: TriggerMatcher,
    queue: std::sync::Mutex<JobQueue>,
    pub(crate) active_jobs: RwLock<HashMap<JobId, Arc<JobRun>>>,
    /// Jobs whose execution lease this instance holds: queued or running here.
    local_jobs: std::sync::Mutex<HashSet<JobId>>,
    /// Serializes pipeline create, update, start, stop and delete.
    pub(crate) pipeline_lock: Mutex<()>,
}

/// The scheduler service. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) inner: Arc<SchedulerInner>,
}

/// A scheduler event loop running in the background.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl SchedulerHandle {
    /// Stop consuming events and wait for the loop to exit. Running jobs
    /// keep executing.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| Error::Internal(format!("scheduler loop panicked: {}", e)))?
    }
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, deps: SchedulerDeps) -> Self {
        let workers = WorkerPoolSizer::new(deps.orchestrator, config.retry.clone());
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                graph: deps.graph,
                event_bus: deps.event_bus,
                pipelines: deps.pipelines,
                jobs: deps.jobs,
                claims: deps.claims,
                runner: deps.runner,
                workers,
                metrics: SchedulerMetrics::new(),
                trigger_matcher: TriggerMatcher::new(),
                queue: std::sync::Mutex::new(JobQueue::new()),
                active_jobs: RwLock::new(HashMap::new()),
                local_jobs: std::sync::Mutex::new(HashSet::new()),
                pipeline_lock: Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn graph(&self) -> &CommitGraph {
        &self.inner.graph
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        self.inner.metrics.clone()
    }

    /// Replica count last requested for a pipeline's pool.
    pub async fn target_replicas(&self, pipeline: &str) -> Option<u64> {
        self.inner
            .workers
            .target(&format!("pipeline-{}", pipeline))
            .await
    }

    /// Subscribe to the event bus and run the event loop on a background task.
    pub async fn spawn(&self) -> Result<SchedulerHandle> {
        let events = self.subscribe().await?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let scheduler = self.clone();
        let task = tokio::spawn(async move { scheduler.run_with(events, shutdown_rx).await });
        Ok(SchedulerHandle { shutdown, task })
    }

    /// Run the event loop until `shutdown` turns true.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let events = self.subscribe().await?;
        self.run_with(events, shutdown).await
    }

    async fn subscribe(&self) -> Result<EventStream> {
        let commits = self.inner.event_bus.subscribe("commit.finished.>").await?;
        let jobs = self.inner.event_bus.subscribe("job.>").await?;
        Ok(Box::pin(futures::stream::select(commits, jobs)))
    }

    async fn run_with(
        &self,
        mut events: EventStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(instance = %self.inner.config.instance_id, "Scheduler started");
        let mut ticker = tokio::time::interval(self.inner.config.scale_down_check_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires at once and picks up jobs left by a dead executor.
        let mut recovery = tokio::time::interval(self.inner.config.recovery_interval());
        recovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.scale_down_idle().await {
                        warn!(error = %e, "Idle pool check failed");
                    }
                }
                _ = recovery.tick() => {
                    self.renew_leases().await;
                    if let Err(e) = self.resume_orphaned_jobs().await {
                        warn!(error = %e, "Orphaned job scan failed");
                    }
                }
                event = events.next() => match event {
                    Some(Ok(event)) => self.handle_event(event).await,
                    Some(Err(Error::EventsLagged(skipped))) => {
                        warn!(skipped, "Missed events, reconciling every pipeline");
                        self.handle_trigger(TriggerEvent::Reconcile).await;
                    }
                    Some(Err(e)) => warn!(error = %e, "Event stream error"),
                    None => {
                        warn!("Event stream closed");
                        break;
                    }
                },
            }
        }

        info!(instance = %self.inner.config.instance_id, "Scheduler stopped");
        Ok(())
    }

    async fn handle_event(&self, event: Event) {
        match event {
            Event::CommitFinished(payload) => {
                let Some(branch) = payload.branch else {
                    return;
                };
                self.handle_trigger(TriggerEvent::CommitFinished {
                    commit: payload.commit,
                    branch,
                })
                .await;
            }
            Event::JobStateChanged(payload) if payload.state == JobState::Stopped => {
                self.stop_local(payload.job_id).await;
            }
            _ => {}
        }
    }

    /// Trigger every pipeline the event concerns, upstream pipelines first.
    /// A reconcile also takes over jobs nobody executes. Failures are logged
    /// per pipeline.
    pub async fn handle_trigger(&self, event: TriggerEvent) -> Vec<JobId> {
        if matches!(event, TriggerEvent::Reconcile)
            && let Err(e) = self.resume_orphaned_jobs().await
        {
            warn!(error = %e, "Orphaned job scan failed");
        }
        let pipelines = match self.inner.pipelines.list().await {
            Ok(pipelines) => pipelines,
            Err(e) => {
                error!(error = %e, "Could not list pipelines");
                return Vec::new();
            }
        };

        let ordered = topological(&pipelines);
        let mut created = Vec::new();
        for info in ordered {
            if !self.inner.trigger_matcher.matches(info, &event) {
                continue;
            }
            if !info.is_running() {
                self.inner.metrics.record_stopped_pipeline_event();
                debug!(pipeline = %info.name, event = ?event, "Pipeline is stopped, not triggering");
                continue;
            }
            let triggered = match &event {
                TriggerEvent::CommitFinished { commit, branch } => self
                    .trigger_pipeline(info, Some((commit, branch.as_str())))
                    .await
                    .map(Vec::from_iter),
                TriggerEvent::Manual { .. } => {
                    self.trigger_pipeline(info, None).await.map(Vec::from_iter)
                }
                TriggerEvent::Reconcile => self.catch_up(info).await,
            };
            match triggered {
                Ok(jobs) => created.extend(jobs),
                Err(e) => warn!(pipeline = %info.name, error = %e, "Trigger failed"),
            }
        }
        created
    }

    /// Trigger a pipeline for each commit finished on its input branches after
    /// the newest one its jobs read, oldest first, then for the current heads.
    async fn catch_up(&self, info: &PipelineInfo) -> Result<Vec<JobId>> {
        let inner = &self.inner;
        let jobs: Vec<JobInfo> = inner
            .jobs
            .list(Some(&info.name))
            .await?
            .into_iter()
            .filter(|j| j.pipeline_id == info.id && j.pipeline_version == info.version)
            .collect();

        let mut created = Vec::new();
        for atom in info.spec.input.atoms() {
            let seen: HashSet<CommitId> = jobs
                .iter()
                .flat_map(|j| &j.input_commits)
                .filter(|c| c.name == atom.leaf_name())
                .map(|c| c.commit.id)
                .collect();
            if seen.is_empty() {
                continue;
            }
            let commits = match inner
                .graph
                .list_commit(&atom.repo, Some(&atom.branch), 0)
                .await
            {
                Ok(commits) => commits,
                Err(Error::BranchNotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            let missed: Vec<CommitInfo> = commits
                .into_iter()
                .filter(CommitInfo::is_finished)
                .take_while(|c| !seen.contains(&c.commit.id))
                .collect();
            if !missed.is_empty() {
                debug!(pipeline = %info.name, input = %atom.leaf_name(), missed = missed.len(), "Catching up on missed commits");
            }
            for commit in missed.iter().rev() {
                if let Some(job_id) = self
                    .trigger_pipeline(info, Some((&commit.commit, atom.branch.as_str())))
                    .await?
                {
                    created.push(job_id);
                }
            }
        }
        if let Some(job_id) = self.trigger_pipeline(info, None).await? {
            created.push(job_id);
        }
        Ok(created)
    }

    /// Create a job for one set of input commits, unless one already exists
    /// for it or the commits are not consistent yet.
    ///
    /// With `pinned`, leaves reading that branch take the given commit and
    /// leaves upstream of them take the commits it was computed from. Without,
    /// leaves no other leaf derives from take their branch heads and leaves
    /// upstream of them follow the same way. Any other leaf reads its head.
    pub(crate) async fn trigger_pipeline(
        &self,
        info: &PipelineInfo,
        pinned: Option<(&Commit, &str)>,
    ) -> Result<Option<JobId>> {
        let inner = &self.inner;
        if !info.is_running() {
            inner.metrics.record_stopped_pipeline_event();
            return Ok(None);
        }

        let atoms = info.spec.input.atoms();
        let branches: Vec<Branch> = atoms
            .iter()
            .map(|a| Branch::new(&a.repo, &a.branch))
            .collect();
        let mut heads = Vec::with_capacity(atoms.len());
        let mut bound = vec![false; atoms.len()];
        for (i, branch) in branches.iter().enumerate() {
            let head = match pinned {
                Some((commit, name)) if commit.repo == branch.repo && name == branch.name => {
                    bound[i] = true;
                    Some(inner.graph.inspect_commit(commit).await?)
                }
                _ => inner.graph.branch_head(&branch.repo, &branch.name).await?,
            };
            let Some(head) = head else {
                debug!(
                    pipeline = %info.name,
                    branch = %branch,
                    "Input branch has no finished commit yet"
                );
                return Ok(None);
            };
            heads.push(head);
        }

        let mut upstream = HashSet::new();
        for (i, a) in branches.iter().enumerate() {
            for (j, b) in branches.iter().enumerate() {
                if a != b && inner.graph.is_upstream(a, b).await {
                    upstream.insert((i, j));
                }
            }
        }
        if pinned.is_none() {
            for (i, slot) in bound.iter_mut().enumerate() {
                *slot = !(0..branches.len()).any(|j| upstream.contains(&(i, j)));
            }
        }
        loop {
            let mut progressed = false;
            for i in 0..branches.len() {
                if bound[i] {
                    continue;
                }
                let Some(j) = (0..branches.len()).find(|&j| bound[j] && upstream.contains(&(i, j)))
                else {
                    continue;
                };
                if let Some(source) = inner
                    .graph
                    .provenance_on_branch(&heads[j].commit, &branches[i].repo, &branches[i].name)
                    .await?
                {
                    heads[i] = source;
                }
                bound[i] = true;
                progressed = true;
            }
            if !progressed {
                break;
            }
        }

        if let Err(pending) = check_consistency(&heads, |i, j| upstream.contains(&(i, j))) {
            debug!(
                pipeline = %info.name,
                upstream = %pending.upstream,
                downstream = %pending.downstream,
                "Waiting for downstream input to catch up"
            );
            return Ok(None);
        }

        let inputs: Vec<InputCommit> = atoms
            .iter()
            .zip(&heads)
            .map(|(atom, head)| InputCommit {
                name: atom.leaf_name().to_string(),
                branch: atom.branch.clone(),
                commit: head.commit.clone(),
            })
            .collect();

        let key = ClaimKey::new(
            info.id,
            info.version,
            inputs.iter().map(|i| i.commit.id).collect(),
        );
        let owner = inner.config.instance_id.as_str();
        let claims = inner.claims.clone();
        let lease = inner.config.claim_lease();
        let reservation =
            retry_with_backoff(&inner.config.retry, "claim_reserve", || claims.reserve(&key, owner, lease))
                .await?;
        match reservation {
            Reservation::Acquired => {}
            Reservation::Held { owner: holder } => {
                inner.metrics.record_duplicate_trigger();
                debug!(pipeline = %info.name, key = %key, holder = %holder, "Input set is being claimed");
                return Ok(None);
            }
            Reservation::Committed { job_id } => {
                inner.metrics.record_duplicate_trigger();
                debug!(pipeline = %info.name, job_id = %job_id, "Input set already has a job");
                return Ok(None);
            }
        }

        match self.create_job(info, inputs, &heads).await {
            Ok(job) => {
                if let Err(e) = claims.commit(&key, owner, job.id).await {
                    warn!(job_id = %job.id, error = %e, "Could not commit claim");
                }
                self.enqueue(job.id, &job.pipeline);
                Ok(Some(job.id))
            }
            Err(e) => {
                if let Err(release) = claims.release(&key, owner).await {
                    warn!(key = %key, error = %release, "Could not release claim");
                }
                Err(e)
            }
        }
    }

    async fn create_job(
        &self,
        info: &PipelineInfo,
        inputs: Vec<InputCommit>,
        heads: &[CommitInfo],
    ) -> Result<JobInfo> {
        let job_id = JobId::new();
        self.adopt(job_id).await?;
        let created = self.record_job(job_id, info, inputs, heads).await;
        if created.is_err() {
            self.release(job_id).await;
        }
        created
    }

    async fn record_job(
        &self,
        job_id: JobId,
        info: &PipelineInfo,
        inputs: Vec<InputCommit>,
        heads: &[CommitInfo],
    ) -> Result<JobInfo> {
        let inner = &self.inner;
        let output_commit = inner
            .graph
            .start_commit_with(
                &info.output_repo,
                StartCommitOptions {
                    branch: Some(info.spec.output_branch.clone()),
                    provenance: heads.iter().map(|h| h.commit.clone()).collect(),
                    empty: true,
                },
            )
            .await?;

        let job = JobInfo {
            id: job_id,
            pipeline: info.name.clone(),
            pipeline_id: info.id,
            pipeline_version: info.version,
            input: info.spec.input.clone(),
            input_commits: inputs,
            output_commit: output_commit.clone(),
            state: JobState::Starting,
            reason: None,
            datums: DatumCounts::default(),
            worker_status: Vec::new(),
            parallelism: inner.workers.target(&info.pool_id()).await.unwrap_or(1),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        if let Err(e) = inner.jobs.create(&job).await {
            // Leave no open commit behind for a job that does not exist.
            if let Err(finish) = inner.graph.finish_commit(&output_commit).await {
                warn!(
                    commit = %output_commit,
                    error = %finish,
                    "Could not finish output commit of a job that was not created"
                );
            }
            return Err(e);
        }
        inner.metrics.record_job_created();
        info!(
            job_id = %job.id,
            pipeline = %job.pipeline,
            version = job.pipeline_version,
            output_commit = %job.output_commit,
            inputs = ?job.input_commits.iter().map(|c| c.commit.to_string()).collect::<Vec<_>>(),
            "Created job"
        );
        self.publish_job_state(&job).await;
        Ok(job)
    }

    fn local(&self) -> MutexGuard<'_, HashSet<JobId>> {
        self.inner
            .local_jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the execution lease of a job and track it as ours. False if the
    /// job is already ours or another live instance holds it.
    async fn adopt(&self, job_id: JobId) -> Result<bool> {
        let inner = &self.inner;
        if self.local().contains(&job_id) {
            return Ok(false);
        }
        let owner = inner.config.instance_id.as_str();
        if !inner
            .claims
            .lease_job(job_id, owner, inner.config.job_lease())
            .await?
        {
            return Ok(false);
        }
        Ok(self.local().insert(job_id))
    }

    /// Stop tracking a job and hand back its lease.
    pub(crate) async fn release(&self, job_id: JobId) {
        self.local().remove(&job_id);
        let owner = self.inner.config.instance_id.as_str();
        if let Err(e) = self.inner.claims.release_job(job_id, owner).await {
            warn!(job_id = %job_id, error = %e, "Could not release execution lease");
        }
    }

    async fn renew_leases(&self) {
        let inner = &self.inner;
        let owner = inner.config.instance_id.as_str();
        let jobs: Vec<JobId> = self.local().iter().copied().collect();
        for job_id in jobs {
            match inner
                .claims
                .lease_job(job_id, owner, inner.config.job_lease())
                .await
            {
                Ok(true) => {}
                Ok(false) => warn!(job_id = %job_id, "Execution lease was taken over"),
                Err(e) => warn!(job_id = %job_id, error = %e, "Could not renew execution lease"),
            }
        }
    }

    /// Queue every unfinished job whose executor's lease has lapsed, for
    /// example because its instance died. Returns the jobs taken over.
    pub async fn resume_orphaned_jobs(&self) -> Result<Vec<JobId>> {
        let inner = &self.inner;
        let mut resumed = Vec::new();
        // Oldest first keeps each pipeline's jobs in creation order
        for job in inner.jobs.list(None).await?.into_iter().rev() {
            if job.state.is_terminal() || !self.adopt(job.id).await? {
                continue;
            }
            inner.metrics.record_job_resumed();
            info!(
                job_id = %job.id,
                pipeline = %job.pipeline,
                state = %job.state,
                "Resuming job without a live executor"
            );
            self.enqueue(job.id, &job.pipeline);
            resumed.push(job.id);
        }
        Ok(resumed)
    }

    fn queue(&self) -> MutexGuard<'_, JobQueue> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn enqueue(&self, job_id: JobId, pipeline: &str) {
        self.queue().enqueue(job_id, pipeline);
        self.pump();
    }

    /// Remove a job that has not started executing.
    pub(crate) fn dequeue_pending(&self, job_id: JobId) -> bool {
        self.queue().remove(job_id)
    }

    /// Start every queued job whose pipeline has a free slot.
    fn pump(&self) {
        loop {
            let Some(queued) = self.queue().dequeue() else {
                break;
            };
            self.spawn_job(queued);
        }
    }

    fn spawn_job(&self, queued: QueuedJob) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let job_id = queued.job_id;
            debug!(
                job_id = %job_id,
                pipeline = %queued.pipeline,
                waited_ms = (Utc::now() - queued.queued_at).num_milliseconds(),
                "Starting queued job"
            );
            if let Err(e) = scheduler.execute_job(job_id).await {
                error!(job_id = %job_id, error = %e, "Job execution failed");
                scheduler.fail_job(job_id, e.to_string()).await;
            }
            scheduler.release(job_id).await;
            scheduler.queue().complete(&queued);
            scheduler.pump();
        });
    }

    pub(crate) async fn publish_job_state(&self, job: &JobInfo) {
        let event = Event::JobStateChanged(JobStateChangedPayload {
            job_id: job.id,
            pipeline: job.pipeline.clone(),
            state: job.state,
            reason: job.reason.clone(),
            changed_at: Utc::now(),
        });
        let bus = self.inner.event_bus.clone();
        let published = retry_with_backoff(&self.inner.config.retry, "event_publish", || {
            bus.publish(event.clone())
        })
        .await;
        if let Err(e) = published {
            warn!(job_id = %job.id, error = %e, "Could not publish job state");
        }
    }

    pub(crate) async fn publish(&self, event: Event) -> Result<()> {
        let bus = self.inner.event_bus.clone();
        retry_with_backoff(&self.inner.config.retry, "event_publish", || {
            bus.publish(event.clone())
        })
        .await
    }

    /// Scale pools of pipelines without live jobs to zero once their idle
    /// threshold has passed.
    pub async fn scale_down_idle(&self) -> Result<()> {
        let inner = &self.inner;
        let jobs = inner.jobs.list(None).await?;
        for info in inner.pipelines.list().await? {
            let active = jobs
                .iter()
                .any(|j| j.pipeline_id == info.id && !j.state.is_terminal());
            let threshold = info
                .spec
                .scale_down_threshold_ms
                .or(inner.config.default_scale_down_threshold_ms)
                .map(std::time::Duration::from_millis);
            if inner
                .workers
                .observe(&info.pool_id(), active, threshold)
                .await?
            {
                inner.metrics.record_scale_down();
            }
        }
        Ok(())
    }
}

/// Pipelines with upstream pipelines first. Falls back to listing order if
/// the recorded specs do not form a DAG.
fn topological(pipelines: &[PipelineInfo]) -> Vec<&PipelineInfo> {
    let by_name: HashMap<&str, &PipelineInfo> =
        pipelines.iter().map(|p| (p.name.as_str(), p)).collect();
    match DagBuilder::new().build(pipelines.iter().map(|p| &p.spec)) {
        Ok(dag) => match dag.topological_order() {
            Ok(order) => order
                .into_iter()
                .filter_map(|node| by_name.get(node.name.as_str()).copied())
                .collect(),
            Err(_) => pipelines.iter().collect(),
        },
        Err(e) => {
            warn!(error = %e, "Pipeline graph is inconsistent");
            pipelines.iter().collect()
        }
    }
}
