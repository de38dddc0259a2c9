//! Pipeline API: create, update, start, stop, delete and inspect.

use crate::dag::DagBuilder;
use crate::scheduler::Scheduler;
use crate::triggers::TriggerEvent;

use chrono::Utc;
use sediment_core::events::{Event, PipelineDeletedPayload, PipelineStateChangedPayload};
use sediment_core::ids::{JobId, PipelineId};
use sediment_core::job::JobState;
use sediment_core::pipeline::{PipelineInfo, PipelineSpec, PipelineState};
use sediment_core::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// A pipeline as reported by inspection.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub info: PipelineInfo,
    /// Replica count last requested for the pipeline's worker pool.
    pub target_replicas: Option<u64>,
    pub job_counts: BTreeMap<JobState, u64>,
}

impl PipelineStatus {
    pub fn jobs_in(&self, state: JobState) -> u64 {
        self.job_counts.get(&state).copied().unwrap_or(0)
    }
}

impl Scheduler {
    /// Create a pipeline and its output repo, then trigger it against the
    /// current heads of its inputs. Re-creating with an identical spec is a
    /// no-op; a different spec needs `update`.
    pub async fn create_pipeline(&self, spec: PipelineSpec, update: bool) -> Result<PipelineInfo> {
        let info = {
            let _guard = self.inner.pipeline_lock.lock().await;
            self.validate(&spec).await?;

            if let Some(existing) = self.inner.pipelines.get(&spec.name).await? {
                if existing.spec == spec {
                    debug!(pipeline = %spec.name, "Pipeline already exists with this spec");
                    return Ok(existing);
                }
                if !update {
                    return Err(Error::PipelineAlreadyExists(spec.name));
                }
                drop(_guard);
                return self.update_pipeline(spec).await;
            }

            self.inner
                .graph
                .ensure_output_repo(&spec.name, &spec.input.branches(), &spec.output_branch)
                .await?;

            let now = Utc::now();
            let info = PipelineInfo {
                id: PipelineId::new(),
                name: spec.name.clone(),
                version: 1,
                output_repo: spec.name.clone(),
                spec,
                state: PipelineState::Running,
                created_at: now,
                updated_at: now,
            };
            self.inner.pipelines.create(&info).await?;
            info!(
                pipeline = %info.name,
                pipeline_id = %info.id,
                inputs = ?info.spec.input.repos(),
                "Created pipeline"
            );
            self.publish_pipeline_state(&info).await;
            info
        };

        self.trigger_logged(&info).await;
        Ok(info)
    }

    /// Append a new version of a pipeline. Jobs of older versions that have
    /// not finished are stopped, then the new version is triggered.
    pub async fn update_pipeline(&self, spec: PipelineSpec) -> Result<PipelineInfo> {
        let info = {
            let _guard = self.inner.pipeline_lock.lock().await;
            self.validate(&spec).await?;
            let existing = self
                .inner
                .pipelines
                .get(&spec.name)
                .await?
                .ok_or_else(|| Error::PipelineNotFound(spec.name.clone()))?;
            if existing.spec == spec {
                return Ok(existing);
            }

            self.inner
                .graph
                .ensure_output_repo(
                    &existing.output_repo,
                    &spec.input.branches(),
                    &spec.output_branch,
                )
                .await?;

            let info = PipelineInfo {
                version: existing.version + 1,
                spec,
                updated_at: Utc::now(),
                ..existing
            };
            self.inner.pipelines.update(&info).await?;
            info!(pipeline = %info.name, version = info.version, "Updated pipeline");
            self.publish_pipeline_state(&info).await;

            for job in self.inner.jobs.list(Some(&info.name)).await? {
                if job.pipeline_id == info.id
                    && job.pipeline_version < info.version
                    && !job.state.is_terminal()
                {
                    self.stop_job(job.id).await?;
                }
            }
            info
        };

        self.trigger_logged(&info).await;
        Ok(info)
    }

    /// Resume triggering. Input changes made while stopped are not
    /// backfilled; the next qualifying commit or `run_pipeline` creates a job.
    pub async fn start_pipeline(&self, name: &str) -> Result<PipelineInfo> {
        self.set_pipeline_state(name, PipelineState::Running).await
    }

    /// Stop triggering new jobs. Jobs already created keep running.
    pub async fn stop_pipeline(&self, name: &str) -> Result<PipelineInfo> {
        self.set_pipeline_state(name, PipelineState::Stopped).await
    }

    async fn set_pipeline_state(&self, name: &str, state: PipelineState) -> Result<PipelineInfo> {
        let _guard = self.inner.pipeline_lock.lock().await;
        let existing = self
            .inner
            .pipelines
            .get(name)
            .await?
            .ok_or_else(|| Error::PipelineNotFound(name.to_string()))?;
        if existing.state == state {
            return Ok(existing);
        }
        let info = PipelineInfo {
            state,
            updated_at: Utc::now(),
            ..existing
        };
        self.inner.pipelines.update(&info).await?;
        info!(pipeline = %name, state = ?state, "Pipeline state changed");
        self.publish_pipeline_state(&info).await;
        Ok(info)
    }

    /// Delete a pipeline. Its unfinished jobs are stopped; with `force` its
    /// job records and input-set claims are discarded as well. The output
    /// repo is kept.
    pub async fn delete_pipeline(&self, name: &str, force: bool) -> Result<()> {
        let _guard = self.inner.pipeline_lock.lock().await;
        let inner = &self.inner;
        let existing = inner
            .pipelines
            .get(name)
            .await?
            .ok_or_else(|| Error::PipelineNotFound(name.to_string()))?;

        let jobs: Vec<_> = inner
            .jobs
            .list(Some(name))
            .await?
            .into_iter()
            .filter(|j| j.pipeline_id == existing.id)
            .collect();
        for job in &jobs {
            if !job.state.is_terminal() {
                self.stop_job(job.id).await?;
            }
        }
        if force {
            for job in &jobs {
                inner.jobs.delete(job.id).await?;
            }
            let released = inner.claims.release_pipeline(existing.id).await?;
            debug!(pipeline = %name, released, "Released input-set claims");
        }

        inner.pipelines.delete(name).await?;
        if let Err(e) = inner.workers.remove(&existing.pool_id()).await {
            warn!(pipeline = %name, error = %e, "Could not scale down deleted pipeline's pool");
        }
        info!(pipeline = %name, force, jobs = jobs.len(), "Deleted pipeline");

        self.publish(Event::PipelineDeleted(PipelineDeletedPayload {
            pipeline: name.to_string(),
            pipeline_id: existing.id,
            force,
            deleted_at: Utc::now(),
        }))
        .await
    }

    pub async fn inspect_pipeline(&self, name: &str) -> Result<PipelineStatus> {
        let inner = &self.inner;
        let info = inner
            .pipelines
            .get(name)
            .await?
            .ok_or_else(|| Error::PipelineNotFound(name.to_string()))?;
        let mut job_counts = BTreeMap::new();
        for job in inner.jobs.list(Some(name)).await? {
            if job.pipeline_id == info.id {
                *job_counts.entry(job.state).or_insert(0) += 1;
            }
        }
        let target_replicas = inner.workers.target(&info.pool_id()).await;
        Ok(PipelineStatus {
            info,
            target_replicas,
            job_counts,
        })
    }

    pub async fn list_pipeline(&self) -> Result<Vec<PipelineInfo>> {
        self.inner.pipelines.list().await
    }

    /// Version history of a pipeline, oldest first.
    pub async fn pipeline_history(&self, name: &str) -> Result<Vec<PipelineInfo>> {
        let history = self.inner.pipelines.history(name).await?;
        if history.is_empty() {
            return Err(Error::PipelineNotFound(name.to_string()));
        }
        Ok(history)
    }

    /// Trigger a pipeline against the current heads of its inputs. Returns
    /// `None` if those heads already have a job, are not consistent yet, or
    /// the pipeline is stopped.
    pub async fn run_pipeline(&self, name: &str) -> Result<Option<JobId>> {
        let info = self
            .inner
            .pipelines
            .get(name)
            .await?
            .ok_or_else(|| Error::PipelineNotFound(name.to_string()))?;
        let event = TriggerEvent::Manual {
            pipeline: name.to_string(),
        };
        if !self.inner.trigger_matcher.matches(&info, &event) {
            return Ok(None);
        }
        self.trigger_pipeline(&info, None).await
    }

    /// Checks that need the stores: input repos exist and the pipeline graph
    /// stays acyclic.
    async fn validate(&self, spec: &PipelineSpec) -> Result<()> {
        spec.validate()?;
        for repo in spec.input.repos() {
            self.inner.graph.inspect_repo(&repo).await?;
        }

        let others = self.inner.pipelines.list().await?;
        let specs = others
            .iter()
            .map(|p| &p.spec)
            .filter(|s| s.name != spec.name)
            .chain(std::iter::once(spec));
        DagBuilder::new().build(specs)?;
        Ok(())
    }

    async fn trigger_logged(&self, info: &PipelineInfo) {
        match self.trigger_pipeline(info, None).await {
            Ok(Some(job_id)) => debug!(pipeline = %info.name, job_id = %job_id, "Triggered pipeline"),
            Ok(None) => {}
            Err(e) => warn!(pipeline = %info.name, error = %e, "Could not trigger pipeline"),
        }
    }

    async fn publish_pipeline_state(&self, info: &PipelineInfo) {
        let event = Event::PipelineStateChanged(PipelineStateChangedPayload {
            pipeline: info.name.clone(),
            pipeline_id: info.id,
            version: info.version,
            state: info.state,
            changed_at: info.updated_at,
        });
        if let Err(e) = self.publish(event).await {
            warn!(pipeline = %info.name, error = %e, "Could not publish pipeline state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sediment_core::pipeline::InputSpec;

    #[test]
    fn test_status_serializes_counts_by_state() {
        let now = Utc::now();
        let spec = PipelineSpec::new("edges", vec!["detect".into()], InputSpec::atom("images", "/*"));
        let mut job_counts = BTreeMap::new();
        job_counts.insert(JobState::Success, 3);
        job_counts.insert(JobState::Failure, 1);
        let status = PipelineStatus {
            info: PipelineInfo {
                id: PipelineId::new(),
                name: "edges".into(),
                version: 2,
                output_repo: "edges".into(),
                spec,
                state: PipelineState::Running,
                created_at: now,
                updated_at: now,
            },
            target_replicas: Some(2),
            job_counts,
        };

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["job_counts"]["success"], 3);
        assert_eq!(json["job_counts"]["failure"], 1);
        assert_eq!(json["target_replicas"], 2);
        assert_eq!(status.jobs_in(JobState::Running), 0);
    }
}
