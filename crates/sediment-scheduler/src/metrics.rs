//! Metrics for scheduler observability.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters of one scheduler instance.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    pub jobs_created: AtomicU64,
    pub jobs_succeeded: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_stopped: AtomicU64,
    /// Jobs taken over after their executor's lease lapsed.
    pub jobs_resumed: AtomicU64,
    pub datums_processed: AtomicU64,
    pub datums_skipped: AtomicU64,
    pub datums_failed: AtomicU64,
    pub datums_restarted: AtomicU64,
    /// Triggers dropped because their input set already had a job.
    pub duplicate_triggers: AtomicU64,
    /// Commit events that matched a stopped pipeline.
    pub stopped_pipeline_events: AtomicU64,
    pub scale_downs: AtomicU64,
}

impl SchedulerMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_job_created(&self) {
        self.jobs_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_succeeded(&self) {
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_stopped(&self) {
        self.jobs_stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_resumed(&self) {
        self.jobs_resumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_datum_processed(&self) {
        self.datums_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_datums_skipped(&self, count: u64) {
        self.datums_skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_datum_failed(&self) {
        self.datums_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_datum_restarted(&self) {
        self.datums_restarted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_trigger(&self) {
        self.duplicate_triggers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stopped_pipeline_event(&self) {
        self.stopped_pipeline_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scale_down(&self) {
        self.scale_downs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_created: self.jobs_created.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_stopped: self.jobs_stopped.load(Ordering::Relaxed),
            jobs_resumed: self.jobs_resumed.load(Ordering::Relaxed),
            datums_processed: self.datums_processed.load(Ordering::Relaxed),
            datums_skipped: self.datums_skipped.load(Ordering::Relaxed),
            datums_failed: self.datums_failed.load(Ordering::Relaxed),
            datums_restarted: self.datums_restarted.load(Ordering::Relaxed),
            duplicate_triggers: self.duplicate_triggers.load(Ordering::Relaxed),
            stopped_pipeline_events: self.stopped_pipeline_events.load(Ordering::Relaxed),
            scale_downs: self.scale_downs.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub jobs_created: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_stopped: u64,
    pub jobs_resumed: u64,
    pub datums_processed: u64,
    pub datums_skipped: u64,
    pub datums_failed: u64,
    pub datums_restarted: u64,
    pub duplicate_triggers: u64,
    pub stopped_pipeline_events: u64,
    pub scale_downs: u64,
}

/// Timer for measuring job durations.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = SchedulerMetrics::new();
        metrics.record_job_created();
        metrics.record_datums_skipped(3);
        metrics.record_duplicate_trigger();
        let snap = metrics.snapshot();
        assert_eq!(snap.jobs_created, 1);
        assert_eq!(snap.datums_skipped, 3);
        assert_eq!(snap.duplicate_triggers, 1);
        assert_eq!(snap.jobs_failed, 0);
    }
}
