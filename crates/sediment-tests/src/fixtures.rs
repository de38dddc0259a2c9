//! Test fixtures: scripted workers, a recording orchestrator, flaky blob
//! and job stores and pipeline spec builders.

use async_trait::async_trait;
use sediment_core::datum::{DatumRequest, DatumResult, EntryKind, LogMessage, OutputEntry, StoredOutput};
use sediment_core::ids::{DatumHash, JobId, ObjectHash};
use sediment_core::job::JobInfo;
use sediment_core::pipeline::{AtomInput, InputSpec, ParallelismSpec, PipelineSpec};
use sediment_core::ports::{BlobStore, DatumRunner, JobRepository, Orchestrator, PodStatusStream};
use sediment_core::repo::ObjectRef;
use sediment_core::{Error, Result};
use sediment_pfs::MemoryBlobStore;
use sediment_scheduler::MemoryJobRepository;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

type Script = dyn Fn(&DatumRequest) -> DatumResult + Send + Sync;

/// Datum runner whose behavior is a closure over the request.
///
/// Records every request, tracks how many datums run at once and can hold
/// datums behind a gate until the test opens it.
pub struct ScriptedRunner {
    script: Box<Script>,
    delay: Duration,
    gate: watch::Sender<bool>,
    calls: Mutex<Vec<DatumRequest>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new(script: impl Fn(&DatumRequest) -> DatumResult + Send + Sync + 'static) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            script: Box::new(script),
            delay: Duration::ZERO,
            gate,
            calls: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    /// Copies every materialized input file to the output under its own
    /// path, like `cp -r /pfs/<input>/* /pfs/out/`.
    pub fn copy() -> Self {
        Self::new(|request| DatumResult {
            exit_code: 0,
            outputs: copy_outputs(request),
            logs: Vec::new(),
        })
    }

    /// Like [`Self::copy`], and logs one line per input file.
    pub fn copy_logging() -> Self {
        Self::new(|request| DatumResult {
            exit_code: 0,
            outputs: copy_outputs(request),
            logs: request
                .inputs
                .iter()
                .flat_map(|input| input.files.iter())
                .map(|file| format!("copying {}", file.path))
                .collect(),
        })
    }

    /// Exits with `code` without output.
    pub fn exit(code: i32) -> Self {
        Self::new(move |_| DatumResult {
            exit_code: code,
            ..Default::default()
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Start with the gate closed: datums wait until [`Self::open`].
    pub fn gated(self) -> Self {
        let _ = self.gate.send(false);
        self
    }

    pub fn open(&self) {
        let _ = self.gate.send(true);
    }

    pub fn calls(&self) -> Vec<DatumRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Largest number of datums that ran at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatumRunner for ScriptedRunner {
    async fn run(&self, request: DatumRequest) -> Result<DatumResult> {
        self.calls.lock().unwrap().push(request.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = (self.script)(&request);

        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(result)
    }
}

/// Output entries copying each materialized input file.
pub fn copy_outputs(request: &DatumRequest) -> Vec<OutputEntry> {
    request
        .inputs
        .iter()
        .flat_map(|input| input.files.iter())
        .filter_map(|file| {
            file.content
                .as_ref()
                .map(|content| OutputEntry::file(file.path.clone(), content.clone()))
        })
        .collect()
}

/// Output entry of a given kind, e.g. the named pipe a lazy input is
/// backed by.
pub fn entry(path: &str, kind: EntryKind) -> OutputEntry {
    OutputEntry {
        path: path.to_string(),
        kind,
        content: Vec::new(),
    }
}

/// Orchestrator with a fixed capacity that records replica requests.
pub struct RecordingOrchestrator {
    capacity: AtomicU64,
    replicas: Mutex<HashMap<String, u64>>,
    history: Mutex<Vec<(String, u64)>>,
    failures: AtomicU32,
}

impl RecordingOrchestrator {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity: AtomicU64::new(capacity),
            replicas: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            failures: AtomicU32::new(0),
        }
    }

    /// Make the next `n` calls fail as if the orchestrator were unreachable.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn set_capacity(&self, capacity: u64) {
        self.capacity.store(capacity, Ordering::SeqCst);
    }

    /// Current desired replicas of a pool.
    pub fn replicas(&self, pool_id: &str) -> Option<u64> {
        self.replicas.lock().unwrap().get(pool_id).copied()
    }

    /// Every `set_replicas` call in order.
    pub fn history(&self) -> Vec<(String, u64)> {
        self.history.lock().unwrap().clone()
    }

    fn maybe_fail(&self) -> Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Orchestration("orchestrator unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Orchestrator for RecordingOrchestrator {
    async fn capacity(&self) -> Result<u64> {
        self.maybe_fail()?;
        Ok(self.capacity.load(Ordering::SeqCst))
    }

    async fn set_replicas(&self, pool_id: &str, replicas: u64) -> Result<()> {
        self.maybe_fail()?;
        self.replicas
            .lock()
            .unwrap()
            .insert(pool_id.to_string(), replicas);
        self.history
            .lock()
            .unwrap()
            .push((pool_id.to_string(), replicas));
        Ok(())
    }

    async fn watch_pod_status(&self, _pool_id: &str) -> Result<PodStatusStream> {
        Ok(Box::pin(futures::stream::pending()))
    }
}

/// Blob store that fails a number of writes before recovering.
#[derive(Default)]
pub struct FlakyBlobStore {
    inner: MemoryBlobStore,
    failures: AtomicU32,
    attempts: AtomicU32,
}

impl FlakyBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Number of `put` calls, failed ones included.
    pub fn put_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for FlakyBlobStore {
    async fn put(&self, content: Vec<u8>) -> Result<ObjectRef> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::BlobStore("object store unavailable".into()));
        }
        self.inner.put(content).await
    }

    async fn get(&self, hash: &ObjectHash) -> Result<Vec<u8>> {
        self.inner.get(hash).await
    }

    async fn delete(&self, hash: &ObjectHash) -> Result<()> {
        self.inner.delete(hash).await
    }

    async fn exists(&self, hash: &ObjectHash) -> Result<bool> {
        self.inner.exists(hash).await
    }
}

/// Job repository that rejects a number of creates before recovering.
#[derive(Default)]
pub struct FlakyJobRepository {
    inner: MemoryJobRepository,
    failures: AtomicU32,
}

impl FlakyJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_creates(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobRepository for FlakyJobRepository {
    async fn create(&self, job: &JobInfo) -> Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Other("job store unavailable".into()));
        }
        self.inner.create(job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<JobInfo>> {
        self.inner.get(id).await
    }

    async fn update(&self, job: &JobInfo) -> Result<()> {
        self.inner.update(job).await
    }

    async fn list(&self, pipeline: Option<&str>) -> Result<Vec<JobInfo>> {
        self.inner.list(pipeline).await
    }

    async fn delete(&self, id: JobId) -> Result<()> {
        self.inner.delete(id).await
    }

    async fn put_datum_outputs(
        &self,
        id: JobId,
        outputs: BTreeMap<DatumHash, Vec<StoredOutput>>,
    ) -> Result<()> {
        self.inner.put_datum_outputs(id, outputs).await
    }

    async fn datum_outputs(
        &self,
        id: JobId,
    ) -> Result<Option<BTreeMap<DatumHash, Vec<StoredOutput>>>> {
        self.inner.datum_outputs(id).await
    }

    async fn append_logs(&self, id: JobId, lines: Vec<LogMessage>) -> Result<()> {
        self.inner.append_logs(id, lines).await
    }

    async fn logs(&self, id: JobId) -> Result<Vec<LogMessage>> {
        self.inner.logs(id).await
    }
}

/// Factory for pipeline specs.
pub struct PipelineFixture;

impl PipelineFixture {
    /// One atom input over `repo` matching `glob`.
    pub fn simple(name: &str, repo: &str, glob: &str) -> PipelineSpec {
        PipelineSpec::new(name, copy_cmd(), InputSpec::atom(repo, glob))
    }

    pub fn with_input(name: &str, input: InputSpec) -> PipelineSpec {
        PipelineSpec::new(name, copy_cmd(), input)
    }

    pub fn cross(name: &str, inputs: &[(&str, &str)]) -> PipelineSpec {
        Self::with_input(name, InputSpec::Cross(atoms(inputs)))
    }

    pub fn union(name: &str, inputs: &[(&str, &str)]) -> PipelineSpec {
        Self::with_input(name, InputSpec::Union(atoms(inputs)))
    }

    pub fn with_parallelism(mut spec: PipelineSpec, parallelism: ParallelismSpec) -> PipelineSpec {
        spec.parallelism = Some(parallelism);
        spec
    }

    pub fn with_scale_down(mut spec: PipelineSpec, threshold: Duration) -> PipelineSpec {
        spec.scale_down_threshold_ms = Some(threshold.as_millis() as u64);
        spec
    }

    pub fn lazy(name: &str, repo: &str, glob: &str) -> PipelineSpec {
        Self::with_input(
            name,
            InputSpec::Atom(AtomInput::new(repo, glob).lazy(true)),
        )
    }
}

fn atoms(inputs: &[(&str, &str)]) -> Vec<InputSpec> {
    inputs
        .iter()
        .map(|(repo, glob)| InputSpec::atom(*repo, *glob))
        .collect()
}

fn copy_cmd() -> Vec<String> {
    vec!["sh".into(), "-c".into(), "cp -r /pfs/*/* /pfs/out/".into()]
}
