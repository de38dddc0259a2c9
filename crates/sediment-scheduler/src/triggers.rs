//! Trigger matching and input consistency.

use sediment_core::pipeline::PipelineInfo;
use sediment_core::repo::{Commit, CommitInfo};

/// Event that can trigger a pipeline.
#[derive(Debug, Clone)]
pub enum TriggerEvent {
    /// A commit finished on a branch, or a branch was moved to it. Leaves
    /// reading that branch are bound to this commit, not to whatever the
    /// branch head is by the time the event is handled.
    CommitFinished { commit: Commit, branch: String },
    /// Explicit request to run one pipeline.
    Manual { pipeline: String },
    /// Re-check every pipeline, e.g. after missed events.
    Reconcile,
}

/// Decides which pipelines an event concerns.
pub struct TriggerMatcher;

impl TriggerMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Running state is not considered here; stopped pipelines still match.
    pub fn matches(&self, pipeline: &PipelineInfo, event: &TriggerEvent) -> bool {
        match event {
            TriggerEvent::CommitFinished { commit, branch } => {
                pipeline.spec.input.references(&commit.repo, branch)
            }
            TriggerEvent::Manual { pipeline: name } => &pipeline.name == name,
            TriggerEvent::Reconcile => true,
        }
    }
}

impl Default for TriggerMatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// A pair of heads that do not yet agree: `downstream` was computed from an
/// older commit of `upstream`'s repo than the current head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInput {
    pub upstream: String,
    pub downstream: String,
}

/// Check that input commits descend from the same changes. When leaf `i`
/// reads a branch upstream of leaf `j`'s, then `j`'s commit must have been
/// computed from `i`'s. Otherwise the downstream commit is still being
/// recomputed and triggering now would run the pipeline twice for one change.
pub fn check_consistency<F>(heads: &[CommitInfo], is_upstream: F) -> Result<(), PendingInput>
where
    F: Fn(usize, usize) -> bool,
{
    for (i, upstream) in heads.iter().enumerate() {
        for (j, downstream) in heads.iter().enumerate() {
            if i == j || !is_upstream(i, j) {
                continue;
            }
            if !downstream.has_provenance(&upstream.commit) {
                return Err(PendingInput {
                    upstream: upstream.commit.to_string(),
                    downstream: downstream.commit.to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sediment_core::ids::{CommitId, PipelineId};
    use sediment_core::pipeline::{AtomInput, InputSpec, PipelineSpec, PipelineState};

    fn info(spec: PipelineSpec) -> PipelineInfo {
        PipelineInfo {
            id: PipelineId::new(),
            name: spec.name.clone(),
            version: 1,
            output_repo: spec.name.clone(),
            spec,
            state: PipelineState::Running,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn head(repo: &str, provenance: Vec<Commit>) -> CommitInfo {
        CommitInfo {
            commit: Commit::new(repo, CommitId::new()),
            branch: Some("master".into()),
            parent: None,
            provenance,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            size_bytes: 0,
        }
    }

    #[test]
    fn test_commit_event_matches_branch() {
        let matcher = TriggerMatcher::new();
        let p = info(PipelineSpec::new(
            "p",
            vec!["true".into()],
            InputSpec::Atom(AtomInput::new("data", "/*").on_branch("dev")),
        ));
        let on = |repo: &str, branch: &str| TriggerEvent::CommitFinished {
            commit: Commit::new(repo, CommitId::new()),
            branch: branch.into(),
        };
        assert!(matcher.matches(&p, &on("data", "dev")));
        assert!(!matcher.matches(&p, &on("data", "master")));
        assert!(!matcher.matches(&p, &on("other", "dev")));
        assert!(matcher.matches(&p, &TriggerEvent::Manual { pipeline: "p".into() }));
        assert!(!matcher.matches(&p, &TriggerEvent::Manual { pipeline: "q".into() }));
        assert!(matcher.matches(&p, &TriggerEvent::Reconcile));
    }

    #[test]
    fn test_diamond_waits_for_stale_downstream() {
        let a0 = head("a", vec![]);
        let a1 = head("a", vec![]);
        let b0 = head("b", vec![a0.commit.clone()]);
        let b1 = head("b", vec![a1.commit.clone()]);
        // Leaf 0 reads a, leaf 1 reads b computed from a
        let upstream = |i: usize, j: usize| i == 0 && j == 1;

        let pending = check_consistency(&[a1.clone(), b0], upstream).unwrap_err();
        assert_eq!(pending.upstream, a1.commit.to_string());
        assert!(check_consistency(&[a1, b1], upstream).is_ok());
    }

    #[test]
    fn test_unrelated_inputs_are_consistent() {
        let x = head("x", vec![]);
        let y = head("y", vec![]);
        assert!(check_consistency(&[x, y], |_, _| false).is_ok());
    }
}
