//! Queue of jobs waiting for execution.
//!
//! Each pipeline is a concurrency group: its jobs run one at a time in the
//! order they were created, while jobs of different pipelines run side by
//! side.

use chrono::{DateTime, Utc};
use sediment_core::ids::JobId;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// A job waiting for its pipeline's slot.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub pipeline: String,
    pub queued_at: DateTime<Utc>,
    seq: u64,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.job_id == other.job_id
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earlier enqueue first
        other.seq.cmp(&self.seq)
    }
}

pub struct JobQueue {
    queue: BinaryHeap<QueuedJob>,
    running: HashMap<String, usize>,
    limits: HashMap<String, usize>,
    next_seq: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            running: HashMap::new(),
            limits: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Add a job behind every job already queued.
    pub fn enqueue(&mut self, job_id: JobId, pipeline: impl Into<String>) {
        self.next_seq += 1;
        self.queue.push(QueuedJob {
            job_id,
            pipeline: pipeline.into(),
            queued_at: Utc::now(),
            seq: self.next_seq,
        });
    }

    /// Get the next job whose pipeline has a free slot.
    pub fn dequeue(&mut self) -> Option<QueuedJob> {
        let mut temp = Vec::new();
        let mut result = None;

        while let Some(job) = self.queue.pop() {
            if self.can_execute(&job) {
                *self.running.entry(job.pipeline.clone()).or_insert(0) += 1;
                result = Some(job);
                break;
            }
            temp.push(job);
        }

        for job in temp {
            self.queue.push(job);
        }

        result
    }

    /// Free the slot held by a dequeued job.
    pub fn complete(&mut self, job: &QueuedJob) {
        if let Some(count) = self.running.get_mut(&job.pipeline) {
            *count = count.saturating_sub(1);
        }
    }

    /// Drop a job that has not been dequeued yet.
    pub fn remove(&mut self, job_id: JobId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|j| j.job_id != job_id);
        self.queue.len() != before
    }

    /// Allow more than one concurrent job for a pipeline.
    pub fn set_limit(&mut self, pipeline: impl Into<String>, limit: usize) {
        self.limits.insert(pipeline.into(), limit.max(1));
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of queued jobs of a pipeline.
    pub fn pending(&self, pipeline: &str) -> usize {
        self.queue.iter().filter(|j| j.pipeline == pipeline).count()
    }

    /// Position of a job among the waiting jobs, 0 being next.
    pub fn position(&self, job_id: JobId) -> Option<usize> {
        let mut sorted: Vec<&QueuedJob> = self.queue.iter().collect();
        sorted.sort_by(|a, b| b.cmp(a));
        sorted.iter().position(|j| j.job_id == job_id)
    }

    fn can_execute(&self, job: &QueuedJob) -> bool {
        let current = self.running.get(&job.pipeline).copied().unwrap_or(0);
        let limit = self.limits.get(&job.pipeline).copied().unwrap_or(1);
        current < limit
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_within_pipeline() {
        let mut queue = JobQueue::new();
        let first = JobId::new();
        let second = JobId::new();
        queue.enqueue(first, "edges");
        queue.enqueue(second, "edges");
        assert_eq!(queue.position(second), Some(1));

        let job = queue.dequeue().unwrap();
        assert_eq!(job.job_id, first);

        // Second waits for the first to complete
        assert!(queue.dequeue().is_none());
        queue.complete(&job);
        assert_eq!(queue.dequeue().unwrap().job_id, second);
    }

    #[test]
    fn test_pipelines_run_side_by_side() {
        let mut queue = JobQueue::new();
        queue.enqueue(JobId::new(), "a");
        queue.enqueue(JobId::new(), "a");
        queue.enqueue(JobId::new(), "b");

        assert_eq!(queue.dequeue().unwrap().pipeline, "a");
        assert_eq!(queue.dequeue().unwrap().pipeline, "b");
        assert!(queue.dequeue().is_none());
        assert_eq!(queue.pending("a"), 1);
    }

    #[test]
    fn test_remove_and_limit() {
        let mut queue = JobQueue::new();
        let id = JobId::new();
        queue.enqueue(id, "a");
        assert!(queue.remove(id));
        assert!(!queue.remove(id));
        assert!(queue.is_empty());

        queue.set_limit("a", 2);
        queue.enqueue(JobId::new(), "a");
        queue.enqueue(JobId::new(), "a");
        assert!(queue.dequeue().is_some());
        assert!(queue.dequeue().is_some());
    }
}
