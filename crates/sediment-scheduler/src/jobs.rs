//! Job execution and the job API.
//!
//! A job expands its datums, reuses the outputs of datums a previous
//! successful job of the same pipeline version already processed, and
//! dispatches the rest to the pipeline's workers. Outputs are written to the
//! output commit in datum order once every datum has succeeded.

use crate::datum::DatumSet;
use crate::metrics::LatencyTimer;
use crate::scheduler::Scheduler;

use futures::StreamExt;
use sediment_core::datum::{
    Datum, DatumInput, DatumRequest, EntryKind, InputFile, LogMessage, StoredOutput,
};
use sediment_core::ids::{DatumHash, JobId};
use sediment_core::job::{DatumCounts, JobInfo, JobState, WorkerStatus};
use sediment_core::pipeline::PipelineInfo;
use sediment_core::repo::{Commit, clean_path};
use sediment_core::retry::retry_with_backoff;
use sediment_core::{Error, Result};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

struct InFlight {
    attempt: u32,
    handle: AbortHandle,
}

struct DatumReport {
    index: usize,
    attempt: u32,
    outcome: std::result::Result<Vec<StoredOutput>, String>,
}

enum Outcome {
    Success(BTreeMap<usize, Vec<StoredOutput>>),
    Failure(String),
    Stopped,
}

/// A job executing on this instance.
pub(crate) struct JobRun {
    scheduler: Scheduler,
    job: Mutex<JobInfo>,
    pipeline: PipelineInfo,
    datums: DatumSet,
    replicas: usize,
    inflight: std::sync::Mutex<HashMap<usize, InFlight>>,
    reports: mpsc::UnboundedSender<DatumReport>,
    stop: watch::Sender<bool>,
}

impl JobRun {
    fn inflight(&self) -> std::sync::MutexGuard<'_, HashMap<usize, InFlight>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn one attempt of a datum. The caller holds the in-flight map.
    fn launch(
        self: &Arc<Self>,
        inflight: &mut HashMap<usize, InFlight>,
        index: usize,
        attempt: u32,
    ) {
        let run = self.clone();
        let task = tokio::spawn(async move {
            let outcome = run.process_datum(index, attempt).await;
            let _ = run.reports.send(DatumReport {
                index,
                attempt,
                outcome,
            });
        });
        inflight.insert(
            index,
            InFlight {
                attempt,
                handle: task.abort_handle(),
            },
        );
    }

    fn abort_all(&self) {
        for (_, flight) in self.inflight().drain() {
            flight.handle.abort();
        }
    }

    /// Run one datum attempt: report status, present inputs, run the
    /// transform and store its regular output files.
    async fn process_datum(
        &self,
        index: usize,
        attempt: u32,
    ) -> std::result::Result<Vec<StoredOutput>, String> {
        let datum = self
            .datums
            .get(index)
            .ok_or_else(|| format!("datum {} is out of range", index))?;
        let inner = &self.scheduler.inner;
        let worker_id = self.record_start(&datum, attempt).await.map_err(|e| e.to_string())?;

        let inputs = self.build_inputs(&datum).await.map_err(|e| e.to_string())?;
        let request = DatumRequest {
            job_id: self.job_id().await,
            pipeline: self.pipeline.name.clone(),
            worker_id,
            datum_hash: datum.hash.clone(),
            attempt,
            transform: self.pipeline.spec.transform.clone(),
            inputs,
        };

        let runner = inner.runner.clone();
        let result = retry_with_backoff(&inner.config.retry, "datum_run", || {
            runner.run(request.clone())
        })
        .await
        .map_err(|e| e.to_string())?;

        for line in &result.logs {
            debug!(datum = %datum.hash.short(), attempt, "{}", line);
        }
        if !result.logs.is_empty() {
            let ts = chrono::Utc::now();
            let lines = result
                .logs
                .iter()
                .map(|message| LogMessage {
                    pipeline: request.pipeline.clone(),
                    job_id: request.job_id,
                    worker_id: request.worker_id.clone(),
                    datum_hash: datum.hash.clone(),
                    data: datum.bindings.clone(),
                    attempt,
                    ts,
                    message: message.clone(),
                })
                .collect();
            if let Err(e) = inner.jobs.append_logs(request.job_id, lines).await {
                warn!(job_id = %request.job_id, datum = %datum.hash.short(), error = %e, "Could not store datum logs");
            }
        }
        if !self.pipeline.spec.transform.accepts(result.exit_code) {
            return Err(Error::DatumFailed {
                datum: datum.hash.short().to_string(),
                reason: format!("exit code {}", result.exit_code),
            }
            .to_string());
        }

        let blobs = inner.graph.blobs();
        let mut stored = Vec::new();
        for entry in result.outputs {
            match entry.kind {
                EntryKind::Regular => {
                    let content = entry.content;
                    let object = retry_with_backoff(&inner.config.retry, "blob_put", || {
                        blobs.put(content.clone())
                    })
                    .await
                    .map_err(|e| e.to_string())?;
                    stored.push(StoredOutput {
                        path: clean_path(&entry.path),
                        objects: vec![object],
                    });
                }
                EntryKind::Directory => {}
                EntryKind::Symlink | EntryKind::NamedPipe | EntryKind::Other => {
                    return Err(Error::DatumFailed {
                        datum: datum.hash.short().to_string(),
                        reason: format!(
                            "output contains non-regular file {}",
                            clean_path(&entry.path)
                        ),
                    }
                    .to_string());
                }
            }
        }
        Ok(stored)
    }

    async fn job_id(&self) -> JobId {
        self.job.lock().await.id
    }

    /// Replace the worker status of this datum. The start time is strictly
    /// later than that of any previous attempt.
    async fn record_start(&self, datum: &Datum, attempt: u32) -> Result<String> {
        let mut job = self.job.lock().await;
        if job.state.is_terminal() {
            return Err(Error::Cancelled(format!("job {} is {}", job.id, job.state)));
        }

        let mut started = chrono::Utc::now();
        if let Some(previous) = job.worker_status.iter().find(|w| w.datum_hash == datum.hash)
            && started <= previous.started
        {
            started = previous.started + chrono::Duration::microseconds(1);
        }
        job.worker_status.retain(|w| w.datum_hash != datum.hash);

        let worker_id = format!(
            "{}-{}",
            self.pipeline.pool_id(),
            datum.index % self.replicas.max(1)
        );
        let job_id = job.id;
        job.worker_status.push(WorkerStatus {
            worker_id: worker_id.clone(),
            job_id,
            datum_hash: datum.hash.clone(),
            data: datum.data_paths(),
            started,
            attempt,
        });

        let became_running = job.state == JobState::Starting;
        if became_running {
            job.transition(JobState::Running)?;
        }
        self.persist(&job).await;
        if became_running {
            info!(job_id = %job.id, pipeline = %job.pipeline, "Job running");
            self.scheduler.publish_job_state(&job).await;
        }
        Ok(worker_id)
    }

    async fn build_inputs(&self, datum: &Datum) -> Result<Vec<DatumInput>> {
        let graph = &self.scheduler.inner.graph;
        let mut inputs = Vec::with_capacity(datum.bindings.len());
        for binding in &datum.bindings {
            let tree = graph
                .tree(&Commit::new(&binding.repo, binding.commit))
                .await?;
            let mut files = Vec::new();
            for (path, objects) in tree.files_under(&binding.path) {
                let content = if binding.lazy {
                    None
                } else {
                    Some(graph.read_objects(&objects).await?)
                };
                files.push(InputFile {
                    path,
                    objects,
                    content,
                });
            }
            inputs.push(DatumInput {
                binding: binding.clone(),
                files,
            });
        }
        Ok(inputs)
    }

    /// Write the job record. A record that turned terminal elsewhere stops
    /// this run.
    async fn persist(&self, job: &JobInfo) {
        match self.scheduler.inner.jobs.update(job).await {
            Ok(()) => {}
            Err(Error::InvalidJobTransition { .. }) => {
                debug!(job_id = %job.id, "Job record is terminal, stopping run");
                let _ = self.stop.send(true);
            }
            Err(e) => warn!(job_id = %job.id, error = %e, "Could not persist job"),
        }
    }

    /// Dispatch pending datums with at most `replicas` in flight and collect
    /// their reports. The first failure halts further dispatch; datums
    /// already dispatched are allowed to finish.
    async fn drive(
        self: &Arc<Self>,
        pending: Vec<usize>,
        mut reports: mpsc::UnboundedReceiver<DatumReport>,
    ) -> Outcome {
        let mut stop = self.stop.subscribe();
        let mut queue: VecDeque<usize> = pending.into();
        let mut results = BTreeMap::new();
        let mut failure: Option<String> = None;

        loop {
            if *stop.borrow_and_update() {
                self.abort_all();
                return Outcome::Stopped;
            }
            {
                let mut inflight = self.inflight();
                if failure.is_none() {
                    while inflight.len() < self.replicas.max(1) {
                        let Some(index) = queue.pop_front() else {
                            break;
                        };
                        self.launch(&mut inflight, index, 1);
                    }
                }
                if inflight.is_empty() {
                    break;
                }
            }

            tokio::select! {
                biased;
                _ = stop.changed() => continue,
                report = reports.recv() => {
                    let Some(report) = report else { break };
                    {
                        let mut inflight = self.inflight();
                        match inflight.get(&report.index) {
                            Some(current) if current.attempt == report.attempt => {
                                inflight.remove(&report.index);
                            }
                            // Superseded by a restart
                            _ => continue,
                        }
                    }
                    self.record_report(&report).await;
                    match report.outcome {
                        Ok(outputs) => {
                            results.insert(report.index, outputs);
                        }
                        Err(reason) => {
                            warn!(
                                datum = report.index,
                                attempt = report.attempt,
                                reason = %reason,
                                "Datum failed"
                            );
                            failure.get_or_insert(reason);
                        }
                    }
                }
            }
        }

        match failure {
            Some(reason) => Outcome::Failure(reason),
            None => Outcome::Success(results),
        }
    }

    async fn record_report(&self, report: &DatumReport) {
        let metrics = &self.scheduler.inner.metrics;
        let mut job = self.job.lock().await;
        if job.state.is_terminal() {
            return;
        }
        if let Some(datum) = self.datums.get(report.index) {
            job.worker_status.retain(|w| w.datum_hash != datum.hash);
        }
        match report.outcome {
            Ok(_) => {
                job.datums.processed += 1;
                metrics.record_datum_processed();
            }
            Err(_) => {
                job.datums.failed += 1;
                metrics.record_datum_failed();
            }
        }
        self.persist(&job).await;
    }
}

impl Scheduler {
    /// Execute a created job to a terminal state.
    pub(crate) async fn execute_job(&self, job_id: JobId) -> Result<()> {
        let inner = &self.inner;
        let Some(job) = inner.jobs.get(job_id).await? else {
            return Err(Error::JobNotFound(job_id.to_string()));
        };
        if job.state.is_terminal() {
            return Ok(());
        }

        let Some(pipeline) = inner
            .pipelines
            .history(&job.pipeline)
            .await?
            .into_iter()
            .rev()
            .find(|p| p.id == job.pipeline_id && p.version == job.pipeline_version)
        else {
            info!(job_id = %job_id, pipeline = %job.pipeline, "Pipeline version is gone, stopping job");
            self.stop_job(job_id).await?;
            return Ok(());
        };

        let timer = LatencyTimer::start();
        let datums = DatumSet::expand(
            &inner.graph,
            &pipeline.name,
            pipeline.version,
            &job.input,
            &job.input_commits,
        )
        .await?;
        let prior = self.prior_outputs(&job).await?;

        let mut skipped: BTreeMap<usize, Vec<StoredOutput>> = BTreeMap::new();
        let mut pending = Vec::new();
        for datum in datums.iter() {
            match prior.get(&datum.hash) {
                Some(outputs) => {
                    skipped.insert(datum.index, outputs.clone());
                }
                None => pending.push(datum.index),
            }
        }

        // Restore the pool before anything is dispatched.
        let replicas = if pending.is_empty() {
            inner.workers.target(&pipeline.pool_id()).await.unwrap_or(1)
        } else {
            inner.workers.scale_up(&pipeline).await?
        };

        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);
        let mut job = job;
        // A resumed job counts its datums again from scratch.
        job.datums = DatumCounts {
            total: datums.len() as u64,
            skipped: skipped.len() as u64,
            ..DatumCounts::default()
        };
        job.worker_status.clear();
        job.parallelism = replicas;
        let run = Arc::new(JobRun {
            scheduler: self.clone(),
            job: Mutex::new(job.clone()),
            pipeline,
            datums,
            replicas: replicas as usize,
            inflight: std::sync::Mutex::new(HashMap::new()),
            reports: reports_tx,
            stop,
        });
        inner.active_jobs.write().await.insert(job_id, run.clone());
        run.persist(&job).await;
        inner.metrics.record_datums_skipped(skipped.len() as u64);
        info!(
            job_id = %job_id,
            pipeline = %job.pipeline,
            total = job.datums.total,
            skipped = job.datums.skipped,
            replicas,
            "Executing job"
        );

        let outcome = run.drive(pending, reports_rx).await;
        let result = self.finalize(&run, outcome, skipped).await;
        inner.active_jobs.write().await.remove(&job_id);
        info!(job_id = %job_id, elapsed_ms = timer.elapsed_ms(), "Job execution finished");
        result
    }

    /// Outputs of the newest successful job of the same pipeline version.
    async fn prior_outputs(&self, job: &JobInfo) -> Result<BTreeMap<DatumHash, Vec<StoredOutput>>> {
        let inner = &self.inner;
        let previous = inner
            .jobs
            .list(Some(&job.pipeline))
            .await?
            .into_iter()
            .find(|j| {
                j.id != job.id
                    && j.pipeline_id == job.pipeline_id
                    && j.pipeline_version == job.pipeline_version
                    && j.state == JobState::Success
            });
        match previous {
            Some(previous) => Ok(inner.jobs.datum_outputs(previous.id).await?.unwrap_or_default()),
            None => Ok(BTreeMap::new()),
        }
    }

    async fn finalize(
        &self,
        run: &Arc<JobRun>,
        outcome: Outcome,
        skipped: BTreeMap<usize, Vec<StoredOutput>>,
    ) -> Result<()> {
        let inner = &self.inner;
        let output_commit = {
            let mut job = run.job.lock().await;
            if job.state.is_terminal() {
                // Stopped while running
                job.output_commit.clone()
            } else {
                match outcome {
                    Outcome::Success(mut results) => {
                        results.extend(skipped);
                        let mut by_hash = BTreeMap::new();
                        for (index, outputs) in &results {
                            for output in outputs {
                                inner
                                    .graph
                                    .put_file_objects(
                                        &job.output_commit,
                                        &output.path,
                                        output.objects.clone(),
                                    )
                                    .await?;
                            }
                            if let Some(datum) = run.datums.get(*index) {
                                by_hash.insert(datum.hash, outputs.clone());
                            }
                        }
                        inner.jobs.put_datum_outputs(job.id, by_hash).await?;
                        job.transition(JobState::Success)?;
                        inner.metrics.record_job_succeeded();
                        info!(
                            job_id = %job.id,
                            pipeline = %job.pipeline,
                            duration_ms = job.duration_ms().unwrap_or(0),
                            "Job succeeded"
                        );
                    }
                    Outcome::Failure(reason) => {
                        job.reason = Some(reason);
                        job.transition(JobState::Failure)?;
                        inner.metrics.record_job_failed();
                        warn!(
                            job_id = %job.id,
                            pipeline = %job.pipeline,
                            reason = ?job.reason,
                            "Job failed"
                        );
                    }
                    Outcome::Stopped => {
                        // The record turned terminal elsewhere.
                        job.transition(JobState::Stopped)?;
                    }
                }
                run.persist(&job).await;
                self.publish_job_state(&job).await;
                job.output_commit.clone()
            }
        };
        self.close_output_commit(&output_commit).await
    }

    async fn close_output_commit(&self, commit: &Commit) -> Result<()> {
        match self.inner.graph.finish_commit(commit).await {
            Ok(_) | Err(Error::CommitAlreadyFinished(_)) | Err(Error::CommitNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Mark a job failed after an infrastructure error outside its datums.
    pub(crate) async fn fail_job(&self, job_id: JobId, reason: String) {
        let inner = &self.inner;
        let job = match inner.jobs.get(job_id).await {
            Ok(Some(job)) => job,
            _ => return,
        };
        if job.state.is_terminal() {
            return;
        }
        let mut job = job;
        job.reason = Some(reason);
        if job.transition(JobState::Failure).is_err() {
            return;
        }
        if let Err(e) = inner.jobs.update(&job).await {
            warn!(job_id = %job_id, error = %e, "Could not record job failure");
            return;
        }
        inner.metrics.record_job_failed();
        self.publish_job_state(&job).await;
        if let Err(e) = self.close_output_commit(&job.output_commit).await {
            warn!(job_id = %job_id, error = %e, "Could not finish output commit");
        }
    }

    /// Stop a job. Outstanding datums are cancelled and the output commit is
    /// finished. Stopping a terminal job does nothing.
    pub async fn stop_job(&self, job_id: JobId) -> Result<()> {
        let inner = &self.inner;
        let run = inner.active_jobs.read().await.get(&job_id).cloned();
        let job = match run {
            Some(run) => {
                let mut job = run.job.lock().await;
                if job.state.is_terminal() {
                    return Ok(());
                }
                job.transition(JobState::Stopped)?;
                run.persist(&job).await;
                let _ = run.stop.send(true);
                job.clone()
            }
            None => {
                let removed = self.dequeue_pending(job_id);
                if removed {
                    self.release(job_id).await;
                }
                let mut job = inner
                    .jobs
                    .get(job_id)
                    .await?
                    .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
                if job.state.is_terminal() {
                    return Ok(());
                }
                job.transition(JobState::Stopped)?;
                inner.jobs.update(&job).await?;
                debug!(job_id = %job_id, dequeued = removed, "Stopped job that was not running here");
                job
            }
        };
        inner.metrics.record_job_stopped();
        info!(job_id = %job_id, pipeline = %job.pipeline, "Stopped job");
        self.publish_job_state(&job).await;
        self.close_output_commit(&job.output_commit).await
    }

    /// React to a job stopped by another instance.
    pub(crate) async fn stop_local(&self, job_id: JobId) {
        let run = self.inner.active_jobs.read().await.get(&job_id).cloned();
        if let Some(run) = run {
            let mut job = run.job.lock().await;
            if !job.state.is_terminal() && job.transition(JobState::Stopped).is_ok() {
                let _ = run.stop.send(true);
            }
        }
    }

    /// Stop a job if needed and delete its record.
    pub async fn delete_job(&self, job_id: JobId) -> Result<()> {
        self.stop_job(job_id).await?;
        self.inner.jobs.delete(job_id).await?;
        info!(job_id = %job_id, "Deleted job");
        Ok(())
    }

    /// Current job record. With `block`, wait until the job is terminal;
    /// dropping the future only stops the wait.
    pub async fn inspect_job(&self, job_id: JobId, block: bool) -> Result<JobInfo> {
        let inner = &self.inner;
        if !block {
            return inner
                .jobs
                .get(job_id)
                .await?
                .ok_or_else(|| Error::JobNotFound(job_id.to_string()));
        }

        let mut events = inner
            .event_bus
            .subscribe(&format!("job.*.{}", job_id))
            .await?;
        loop {
            let job = inner
                .jobs
                .get(job_id)
                .await?
                .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
            if job.state.is_terminal() {
                return Ok(job);
            }
            if events.next().await.is_none() {
                return Err(Error::Cancelled("event bus closed".into()));
            }
        }
    }

    /// Jobs newest first. With input commits, only jobs that read all of
    /// them directly or through provenance.
    pub async fn list_job(
        &self,
        pipeline: Option<&str>,
        input_commits: &[Commit],
    ) -> Result<Vec<JobInfo>> {
        let inner = &self.inner;
        let jobs = inner.jobs.list(pipeline).await?;
        if input_commits.is_empty() {
            return Ok(jobs);
        }
        let mut matched = Vec::new();
        for job in jobs {
            let provenance = match inner.graph.inspect_commit(&job.output_commit).await {
                Ok(info) => info.provenance,
                Err(_) => Vec::new(),
            };
            if input_commits
                .iter()
                .all(|c| job.reads_commit(c) || provenance.contains(c))
            {
                matched.push(job);
            }
        }
        Ok(matched)
    }

    /// Stored datum logs, oldest job first and in the order they were
    /// written. `job` narrows to one job, `pipeline` to one pipeline's jobs;
    /// every line must match all `data_filters`.
    pub async fn get_logs(
        &self,
        pipeline: Option<&str>,
        job: Option<JobId>,
        data_filters: &[String],
    ) -> Result<Vec<LogMessage>> {
        let inner = &self.inner;
        let jobs = match job {
            Some(job_id) => {
                let job = inner
                    .jobs
                    .get(job_id)
                    .await?
                    .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
                if pipeline.is_some_and(|p| p != job.pipeline) {
                    return Ok(Vec::new());
                }
                vec![job.id]
            }
            None => {
                if let Some(name) = pipeline {
                    inner
                        .pipelines
                        .get(name)
                        .await?
                        .ok_or_else(|| Error::PipelineNotFound(name.to_string()))?;
                }
                let jobs = inner.jobs.list(pipeline).await?;
                jobs.iter().rev().map(|j| j.id).collect()
            }
        };

        let mut lines = Vec::new();
        for job_id in jobs {
            lines.extend(
                inner
                    .jobs
                    .logs(job_id)
                    .await?
                    .into_iter()
                    .filter(|line| line.matches_filters(data_filters)),
            );
        }
        Ok(lines)
    }

    /// Cancel and re-dispatch the in-flight datums of a job whose bound
    /// paths match every filter. Returns how many were restarted.
    pub async fn restart_datum(&self, job_id: JobId, filters: &[String]) -> Result<usize> {
        let inner = &self.inner;
        let run = inner.active_jobs.read().await.get(&job_id).cloned();
        let Some(run) = run else {
            inner
                .jobs
                .get(job_id)
                .await?
                .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
            return Ok(0);
        };

        let mut inflight = run.inflight();
        let targets: Vec<usize> = inflight
            .keys()
            .copied()
            .filter(|&i| run.datums.get(i).is_some_and(|d| d.matches_filters(filters)))
            .collect();
        for index in &targets {
            let Some(previous) = inflight.remove(index) else {
                continue;
            };
            previous.handle.abort();
            run.launch(&mut inflight, *index, previous.attempt + 1);
            inner.metrics.record_datum_restarted();
            info!(
                job_id = %job_id,
                datum = *index,
                attempt = previous.attempt + 1,
                "Restarted datum"
            );
        }
        Ok(targets.len())
    }
}
