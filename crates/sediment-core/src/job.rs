//! Job and worker status types.

use crate::ids::{CommitId, DatumHash, JobId, PipelineId};
use crate::pipeline::InputSpec;
use crate::repo::Commit;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Starting,
    Running,
    Success,
    Failure,
    Stopped,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failure | JobState::Stopped
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobState::Success)
    }

    /// Allowed edges of the lifecycle. Terminal states have none.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match self {
            JobState::Starting => next != JobState::Starting,
            JobState::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Starting => "starting",
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::Failure => "failure",
            JobState::Stopped => "stopped",
        }
    }

    pub fn all() -> [JobState; 5] {
        [
            JobState::Starting,
            JobState::Running,
            JobState::Success,
            JobState::Failure,
            JobState::Stopped,
        ]
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The commit bound to one input leaf for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct InputCommit {
    pub name: String,
    pub branch: String,
    pub commit: Commit,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DatumCounts {
    pub total: u64,
    pub processed: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Path bound to an input leaf, as reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DataPath {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub job_id: JobId,
    pub datum_hash: DatumHash,
    pub data: Vec<DataPath>,
    pub started: DateTime<Utc>,
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobInfo {
    pub id: JobId,
    pub pipeline: String,
    pub pipeline_id: PipelineId,
    pub pipeline_version: u64,
    /// Input tree of the pipeline version this job runs under.
    pub input: InputSpec,
    pub input_commits: Vec<InputCommit>,
    pub output_commit: Commit,
    pub state: JobState,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub datums: DatumCounts,
    #[serde(default)]
    pub worker_status: Vec<WorkerStatus>,
    pub parallelism: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobInfo {
    /// Move to `next`, refusing transitions out of terminal states.
    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidJobTransition {
                job: self.id.to_string(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        if next == JobState::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
            self.worker_status.clear();
        }
        self.state = next;
        Ok(())
    }

    /// Input commit ids, sorted. Together with the pipeline incarnation and
    /// version this identifies the job's input set.
    pub fn sorted_input_ids(&self) -> Vec<CommitId> {
        let mut ids: Vec<CommitId> = self.input_commits.iter().map(|c| c.commit.id).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn reads_commit(&self, commit: &Commit) -> bool {
        self.input_commits.iter().any(|c| &c.commit == commit)
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at.unwrap_or(self.created_at);
        self.finished_at
            .map(|f| (f - started).num_milliseconds().max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::InputSpec;

    fn make_job() -> JobInfo {
        JobInfo {
            id: JobId::new(),
            pipeline: "edges".to_string(),
            pipeline_id: PipelineId::new(),
            pipeline_version: 1,
            input: InputSpec::atom("images", "/*"),
            input_commits: vec![],
            output_commit: Commit::new("edges", CommitId::new()),
            state: JobState::Starting,
            reason: None,
            datums: DatumCounts::default(),
            worker_status: vec![],
            parallelism: 1,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn test_lifecycle() {
        let mut job = make_job();
        job.transition(JobState::Running).unwrap();
        assert!(job.started_at.is_some());
        job.transition(JobState::Success).unwrap();
        assert!(job.finished_at.is_some());
        assert!(job.state.is_terminal());
    }

    #[test]
    fn test_starting_can_finish_directly() {
        let mut job = make_job();
        job.transition(JobState::Success).unwrap();
        assert_eq!(job.state, JobState::Success);
    }

    #[test]
    fn test_no_resurrection() {
        for terminal in [JobState::Success, JobState::Failure, JobState::Stopped] {
            let mut job = make_job();
            job.transition(terminal).unwrap();
            for next in JobState::all() {
                assert!(job.transition(next).is_err());
            }
        }
    }

    #[test]
    fn test_running_cannot_go_back() {
        let mut job = make_job();
        job.transition(JobState::Running).unwrap();
        assert!(job.transition(JobState::Starting).is_err());
        assert!(job.transition(JobState::Running).is_err());
    }
}
