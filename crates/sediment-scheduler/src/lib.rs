//! Pipeline triggering, datum expansion and job execution for Sediment.

pub mod claims;
pub mod dag;
pub mod datum;
pub mod glob;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod pipelines;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod triggers;
pub mod workers;

pub use claims::MemoryClaimStore;
pub use datum::{DatumSet, datum_hash};
pub use logging::init_logging;
pub use metrics::{MetricsSnapshot, SchedulerMetrics};
pub use pipelines::PipelineStatus;
pub use scheduler::{Scheduler, SchedulerDeps, SchedulerHandle};
pub use store::{MemoryJobRepository, MemoryPipelineRepository};
pub use triggers::TriggerEvent;
pub use workers::expected_replicas;
