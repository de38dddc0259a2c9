//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the core domain and external
//! adapters: the event bus, the content-addressed blob store, the container
//! orchestrator, the workers that run datums, and the metadata stores.

use crate::datum::{DatumRequest, DatumResult, LogMessage, StoredOutput};
use crate::events::Event;
use crate::ids::*;
use crate::job::JobInfo;
use crate::pipeline::PipelineInfo;
use crate::repo::ObjectRef;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Stream of pod status changes for one worker pool.
pub type PodStatusStream = Pin<Box<dyn Stream<Item = Result<PodEvent>> + Send>>;

/// Event bus for publishing and subscribing to events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to events matching a pattern.
    /// Pattern supports wildcards: `commit.finished.*.master`, `job.>`
    async fn subscribe(&self, pattern: &str) -> Result<EventStream>;
}

/// Content-addressed storage for file bytes.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes and return their address. Identical bytes share storage.
    async fn put(&self, content: Vec<u8>) -> Result<ObjectRef>;

    /// Fetch the bytes stored under a hash.
    async fn get(&self, hash: &ObjectHash) -> Result<Vec<u8>>;

    /// Delete the bytes stored under a hash.
    async fn delete(&self, hash: &ObjectHash) -> Result<()>;

    /// Check whether a hash is stored.
    async fn exists(&self, hash: &ObjectHash) -> Result<bool>;
}

/// Container orchestration platform running the worker pools.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Number of schedulable worker slots in the cluster.
    async fn capacity(&self) -> Result<u64>;

    /// Set the desired replica count of a worker pool.
    async fn set_replicas(&self, pool_id: &str, replicas: u64) -> Result<()>;

    /// Watch readiness and failure of the pods in a pool.
    async fn watch_pod_status(&self, pool_id: &str) -> Result<PodStatusStream>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PodStatus {
    Ready,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodEvent {
    pub pool_id: String,
    pub pod: String,
    pub status: PodStatus,
    pub at: DateTime<Utc>,
}

/// Executes one datum on a worker of the pipeline's pool.
#[async_trait]
pub trait DatumRunner: Send + Sync {
    /// Run the transform over the datum's inputs. Infrastructure failures are
    /// returned as errors; a command that ran and exited is always `Ok`.
    async fn run(&self, request: DatumRequest) -> Result<DatumResult>;
}

/// Idempotency key of a job: pipeline incarnation, version and the sorted
/// input commit ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClaimKey {
    pub pipeline_id: PipelineId,
    pub version: u64,
    pub inputs: Vec<CommitId>,
}

impl ClaimKey {
    pub fn new(pipeline_id: PipelineId, version: u64, mut inputs: Vec<CommitId>) -> Self {
        inputs.sort();
        inputs.dedup();
        Self {
            pipeline_id,
            version,
            inputs,
        }
    }
}

impl fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/v{}", self.pipeline_id, self.version)?;
        for input in &self.inputs {
            write!(f, "/{}", input)?;
        }
        Ok(())
    }
}

/// Outcome of trying to reserve a claim key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// The caller holds the lease and must create the job.
    Acquired,
    /// Another owner holds a live lease.
    Held { owner: String },
    /// A job was already created for this key.
    Committed { job_id: JobId },
}

/// Single-writer claims guarding job creation across scheduler instances.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Try to take a lease on `key` for `owner`.
    async fn reserve(&self, key: &ClaimKey, owner: &str, lease: Duration) -> Result<Reservation>;

    /// Record that `owner` created `job_id` for `key`. The claim becomes permanent.
    async fn commit(&self, key: &ClaimKey, owner: &str, job_id: JobId) -> Result<()>;

    /// Drop a lease that did not lead to a job.
    async fn release(&self, key: &ClaimKey, owner: &str) -> Result<()>;

    /// Drop every claim of a pipeline incarnation.
    async fn release_pipeline(&self, pipeline_id: PipelineId) -> Result<usize>;

    /// Take or renew the execution lease of a job. Returns false while
    /// another owner holds a live lease.
    async fn lease_job(&self, job_id: JobId, owner: &str, lease: Duration) -> Result<bool>;

    /// Give up the execution lease of a job.
    async fn release_job(&self, job_id: JobId, owner: &str) -> Result<()>;
}

/// Repository for versioned pipeline records.
#[async_trait]
pub trait PipelineRepository: Send + Sync {
    /// Create the first version of a pipeline. Fails if the name is taken.
    async fn create(&self, info: &PipelineInfo) -> Result<()>;

    /// Get the current version of a pipeline by name.
    async fn get(&self, name: &str) -> Result<Option<PipelineInfo>>;

    /// List the current version of every pipeline.
    async fn list(&self) -> Result<Vec<PipelineInfo>>;

    /// Append a new record for an existing pipeline.
    async fn update(&self, info: &PipelineInfo) -> Result<()>;

    /// All records of a pipeline, oldest first.
    async fn history(&self, name: &str) -> Result<Vec<PipelineInfo>>;

    /// Delete a pipeline and its history.
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Repository for job records and their datum outputs.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Create a job record.
    async fn create(&self, job: &JobInfo) -> Result<()>;

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<JobInfo>>;

    /// Replace a job record. Rejects changes to a terminal job.
    async fn update(&self, job: &JobInfo) -> Result<()>;

    /// Jobs newest first, optionally restricted to one pipeline.
    async fn list(&self, pipeline: Option<&str>) -> Result<Vec<JobInfo>>;

    /// Delete a job and its datum outputs.
    async fn delete(&self, id: JobId) -> Result<()>;

    /// Store the outputs of every datum of a successful job, keyed by datum hash.
    async fn put_datum_outputs(
        &self,
        id: JobId,
        outputs: BTreeMap<DatumHash, Vec<StoredOutput>>,
    ) -> Result<()>;

    /// Datum outputs recorded for a job.
    async fn datum_outputs(&self, id: JobId)
    -> Result<Option<BTreeMap<DatumHash, Vec<StoredOutput>>>>;

    /// Append log lines written while processing a job's datums.
    async fn append_logs(&self, id: JobId, lines: Vec<LogMessage>) -> Result<()>;

    /// Log lines of a job in append order.
    async fn logs(&self, id: JobId) -> Result<Vec<LogMessage>>;
}
