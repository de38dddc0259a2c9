//! Events published on the event bus.

use crate::ids::{JobId, PipelineId};
use crate::job::JobState;
use crate::pipeline::PipelineState;
use crate::repo::Commit;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// All events in the Sediment system.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Commit lifecycle
    CommitStarted(CommitStartedPayload),
    CommitFinished(CommitFinishedPayload),

    // Pipeline lifecycle
    PipelineStateChanged(PipelineStateChangedPayload),
    PipelineDeleted(PipelineDeletedPayload),

    // Job lifecycle
    JobStateChanged(JobStateChangedPayload),
}

impl Event {
    /// Returns the subject for this event. Tokens are dot separated so
    /// subscribers can filter with `*` and `>` wildcards.
    pub fn subject(&self) -> String {
        match self {
            Event::CommitStarted(p) => format!(
                "commit.started.{}.{}",
                p.commit.repo,
                p.branch.as_deref().unwrap_or("_")
            ),
            Event::CommitFinished(p) => format!(
                "commit.finished.{}.{}",
                p.commit.repo,
                p.branch.as_deref().unwrap_or("_")
            ),
            Event::PipelineStateChanged(p) => format!("pipeline.{}.state", p.pipeline),
            Event::PipelineDeleted(p) => format!("pipeline.{}.deleted", p.pipeline),
            Event::JobStateChanged(p) => format!("job.{}.{}", p.pipeline, p.job_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CommitStartedPayload {
    pub commit: Commit,
    pub branch: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// A branch head moved to a finished commit, either by finishing the commit
/// or by pointing the branch at it.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CommitFinishedPayload {
    pub commit: Commit,
    pub branch: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineStateChangedPayload {
    pub pipeline: String,
    pub pipeline_id: PipelineId,
    pub version: u64,
    pub state: PipelineState,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineDeletedPayload {
    pub pipeline: String,
    pub pipeline_id: PipelineId,
    pub force: bool,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobStateChangedPayload {
    pub job_id: JobId,
    pub pipeline: String,
    pub state: JobState,
    pub reason: Option<String>,
    pub changed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::CommitId;

    #[test]
    fn test_commit_finished_subject() {
        let event = Event::CommitFinished(CommitFinishedPayload {
            commit: Commit::new("images", CommitId::new()),
            branch: Some("master".to_string()),
            finished_at: Utc::now(),
        });
        assert_eq!(event.subject(), "commit.finished.images.master");
    }

    #[test]
    fn test_branchless_subject() {
        let event = Event::CommitFinished(CommitFinishedPayload {
            commit: Commit::new("images", CommitId::new()),
            branch: None,
            finished_at: Utc::now(),
        });
        assert_eq!(event.subject(), "commit.finished.images._");
    }

    #[test]
    fn test_event_tagging() {
        let job_id = JobId::new();
        let event = Event::JobStateChanged(JobStateChangedPayload {
            job_id,
            pipeline: "edges".to_string(),
            state: JobState::Failure,
            reason: Some("exit 1".to_string()),
            changed_at: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_state_changed");
        assert_eq!(json["state"], "failure");
        assert_eq!(event.subject(), format!("job.edges.{}", job_id));
    }
}
