//! In-memory pipeline and job repositories.

use async_trait::async_trait;
use sediment_core::datum::{LogMessage, StoredOutput};
use sediment_core::ids::{DatumHash, JobId};
use sediment_core::job::JobInfo;
use sediment_core::pipeline::PipelineInfo;
use sediment_core::ports::{JobRepository, PipelineRepository};
use sediment_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Pipeline records with full version history.
#[derive(Debug, Default)]
pub struct MemoryPipelineRepository {
    records: RwLock<BTreeMap<String, Vec<PipelineInfo>>>,
}

impl MemoryPipelineRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineRepository for MemoryPipelineRepository {
    async fn create(&self, info: &PipelineInfo) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&info.name) {
            return Err(Error::PipelineAlreadyExists(info.name.clone()));
        }
        records.insert(info.name.clone(), vec![info.clone()]);
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<PipelineInfo>> {
        Ok(self
            .records
            .read()
            .await
            .get(name)
            .and_then(|history| history.last().cloned()))
    }

    async fn list(&self) -> Result<Vec<PipelineInfo>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter_map(|history| history.last().cloned())
            .collect())
    }

    async fn update(&self, info: &PipelineInfo) -> Result<()> {
        let mut records = self.records.write().await;
        let history = records
            .get_mut(&info.name)
            .ok_or_else(|| Error::PipelineNotFound(info.name.clone()))?;
        if history.last().map(|h| h.id) != Some(info.id) {
            return Err(Error::PipelineNotFound(format!("{} ({})", info.name, info.id)));
        }
        history.push(info.clone());
        Ok(())
    }

    async fn history(&self, name: &str) -> Result<Vec<PipelineInfo>> {
        Ok(self
            .records
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.records
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::PipelineNotFound(name.to_string()))
    }
}

/// Job records, the per-datum outputs of successful jobs and datum logs.
#[derive(Debug, Default)]
pub struct MemoryJobRepository {
    jobs: RwLock<HashMap<JobId, JobInfo>>,
    outputs: RwLock<HashMap<JobId, BTreeMap<DatumHash, Vec<StoredOutput>>>>,
    logs: RwLock<HashMap<JobId, Vec<LogMessage>>>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn create(&self, job: &JobInfo) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(Error::Internal(format!("job {} already exists", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobInfo>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn update(&self, job: &JobInfo) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let current = jobs
            .get_mut(&job.id)
            .ok_or_else(|| Error::JobNotFound(job.id.to_string()))?;
        if current.state.is_terminal() && current.state != job.state {
            return Err(Error::InvalidJobTransition {
                job: job.id.to_string(),
                from: current.state.to_string(),
                to: job.state.to_string(),
            });
        }
        if current.state.is_terminal() {
            // Terminal records only accept identical state; keep the original.
            return Ok(());
        }
        *current = job.clone();
        Ok(())
    }

    async fn list(&self, pipeline: Option<&str>) -> Result<Vec<JobInfo>> {
        let mut jobs: Vec<JobInfo> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| pipeline.is_none_or(|p| j.pipeline == p))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(jobs)
    }

    async fn delete(&self, id: JobId) -> Result<()> {
        self.outputs.write().await.remove(&id);
        self.logs.write().await.remove(&id);
        self.jobs
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::JobNotFound(id.to_string()))
    }

    async fn put_datum_outputs(
        &self,
        id: JobId,
        outputs: BTreeMap<DatumHash, Vec<StoredOutput>>,
    ) -> Result<()> {
        if !self.jobs.read().await.contains_key(&id) {
            return Err(Error::JobNotFound(id.to_string()));
        }
        self.outputs.write().await.insert(id, outputs);
        Ok(())
    }

    async fn datum_outputs(
        &self,
        id: JobId,
    ) -> Result<Option<BTreeMap<DatumHash, Vec<StoredOutput>>>> {
        Ok(self.outputs.read().await.get(&id).cloned())
    }

    async fn append_logs(&self, id: JobId, lines: Vec<LogMessage>) -> Result<()> {
        if !self.jobs.read().await.contains_key(&id) {
            return Err(Error::JobNotFound(id.to_string()));
        }
        self.logs.write().await.entry(id).or_default().extend(lines);
        Ok(())
    }

    async fn logs(&self, id: JobId) -> Result<Vec<LogMessage>> {
        Ok(self.logs.read().await.get(&id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sediment_core::ids::{CommitId, PipelineId};
    use sediment_core::job::{DatumCounts, JobState};
    use sediment_core::pipeline::{InputSpec, PipelineSpec, PipelineState};
    use sediment_core::repo::Commit;

    fn pipeline(name: &str) -> PipelineInfo {
        let spec = PipelineSpec::new(name, vec!["true".into()], InputSpec::atom("data", "/*"));
        PipelineInfo {
            id: PipelineId::new(),
            name: name.into(),
            version: 1,
            output_repo: name.into(),
            spec,
            state: PipelineState::Running,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn job(pipeline: &PipelineInfo) -> JobInfo {
        JobInfo {
            id: JobId::new(),
            pipeline: pipeline.name.clone(),
            pipeline_id: pipeline.id,
            pipeline_version: pipeline.version,
            input: pipeline.spec.input.clone(),
            input_commits: vec![],
            output_commit: Commit::new(&pipeline.name, CommitId::new()),
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

    #[tokio::test]
    async fn test_pipeline_history() {
        let repo = MemoryPipelineRepository::new();
        let mut info = pipeline("edges");
        repo.create(&info).await.unwrap();
        assert!(matches!(
            repo.create(&info).await,
            Err(Error::PipelineAlreadyExists(_))
        ));

        info.version = 2;
        repo.update(&info).await.unwrap();
        assert_eq!(repo.get("edges").await.unwrap().unwrap().version, 2);
        assert_eq!(repo.history("edges").await.unwrap().len(), 2);

        // A stale incarnation cannot append
        let other = pipeline("edges");
        assert!(repo.update(&other).await.is_err());

        repo.delete("edges").await.unwrap();
        assert!(repo.get("edges").await.unwrap().is_none());
        assert!(repo.history("edges").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_jobs_are_frozen() {
        let repo = MemoryJobRepository::new();
        let p = pipeline("edges");
        let mut j = job(&p);
        repo.create(&j).await.unwrap();

        j.transition(JobState::Stopped).unwrap();
        repo.update(&j).await.unwrap();

        let mut late = j.clone();
        late.state = JobState::Success;
        assert!(repo.update(&late).await.is_err());
        assert_eq!(
            repo.get(j.id).await.unwrap().unwrap().state,
            JobState::Stopped
        );
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let repo = MemoryJobRepository::new();
        let a = pipeline("a");
        let b = pipeline("b");
        let first = job(&a);
        let second = job(&b);
        let third = job(&a);
        for j in [&first, &second, &third] {
            repo.create(j).await.unwrap();
        }
        let ids: Vec<JobId> = repo.list(None).await.unwrap().iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![third.id, second.id, first.id]);
        let only_a: Vec<JobId> = repo.list(Some("a")).await.unwrap().iter().map(|j| j.id).collect();
        assert_eq!(only_a, vec![third.id, first.id]);

        repo.put_datum_outputs(first.id, BTreeMap::new()).await.unwrap();
        assert!(repo.datum_outputs(first.id).await.unwrap().is_some());
        repo.delete(first.id).await.unwrap();
        assert!(repo.datum_outputs(first.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_logs_append_in_order_and_go_with_the_job() {
        let repo = MemoryJobRepository::new();
        let p = pipeline("edges");
        let j = job(&p);
        let line = |message: &str| LogMessage {
            pipeline: p.name.clone(),
            job_id: j.id,
            worker_id: "pipeline-edges-0".into(),
            datum_hash: DatumHash::new("abc"),
            data: vec![],
            attempt: 1,
            ts: Utc::now(),
            message: message.into(),
        };
        assert!(matches!(
            repo.append_logs(j.id, vec![line("early")]).await,
            Err(Error::JobNotFound(_))
        ));

        repo.create(&j).await.unwrap();
        repo.append_logs(j.id, vec![line("one")]).await.unwrap();
        repo.append_logs(j.id, vec![line("two"), line("three")]).await.unwrap();
        let messages: Vec<String> = repo
            .logs(j.id)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.message)
            .collect();
        assert_eq!(messages, vec!["one", "two", "three"]);

        repo.delete(j.id).await.unwrap();
        assert!(repo.logs(j.id).await.unwrap().is_empty());
    }
}
