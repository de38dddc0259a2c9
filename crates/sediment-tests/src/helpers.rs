//! Helpers for driving commits and waiting on asynchronous outcomes.

use futures::StreamExt;
use sediment_core::ids::JobId;
use sediment_core::job::JobInfo;
use sediment_core::repo::{Commit, CommitInfo};
use sediment_pfs::CommitGraph;
use sediment_scheduler::Scheduler;
use std::future::Future;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `check` until it returns `Some` or the timeout elapses.
pub async fn wait_for<T, F, Fut>(timeout: Duration, mut check: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Ok(value);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Start a commit on `branch`, write `files` and finish it.
pub async fn commit_files(
    graph: &CommitGraph,
    repo: &str,
    branch: &str,
    files: &[(&str, &str)],
) -> anyhow::Result<Commit> {
    let commit = graph.start_commit(repo, branch).await?;
    let id = commit.id.to_string();
    for (path, content) in files {
        graph.put_file(repo, &id, path, content.as_bytes().to_vec()).await?;
    }
    graph.finish_commit(&commit).await?;
    Ok(commit)
}

/// Block on a job until it is terminal.
pub async fn wait_for_job(scheduler: &Scheduler, job_id: JobId) -> anyhow::Result<JobInfo> {
    let job = tokio::time::timeout(DEFAULT_TIMEOUT, scheduler.inspect_job(job_id, true)).await??;
    Ok(job)
}

/// Wait until a pipeline has `count` jobs and return them newest first.
pub async fn wait_for_jobs(
    scheduler: &Scheduler,
    pipeline: &str,
    count: usize,
) -> anyhow::Result<Vec<JobInfo>> {
    wait_for(DEFAULT_TIMEOUT, || async {
        let jobs = scheduler.list_job(Some(pipeline), &[]).await.ok()?;
        (jobs.len() >= count).then_some(jobs)
    })
    .await
}

/// Flush `sources` and collect every downstream commit.
pub async fn flush_all(
    graph: &CommitGraph,
    sources: &[(&str, &str)],
    to_repos: Option<&[String]>,
) -> anyhow::Result<Vec<CommitInfo>> {
    let sources: Vec<(String, String)> = sources
        .iter()
        .map(|(repo, reference)| (repo.to_string(), reference.to_string()))
        .collect();
    let stream = graph.flush_commit(&sources, to_repos).await?;
    let infos = tokio::time::timeout(DEFAULT_TIMEOUT, stream.collect::<Vec<_>>()).await?;
    Ok(infos.into_iter().collect::<Result<Vec<_>, _>>()?)
}

/// File content of `path` at the head of `repo`'s master branch.
pub async fn read_file(graph: &CommitGraph, repo: &str, path: &str) -> anyhow::Result<String> {
    let bytes = graph.get_file(repo, "master", path).await?;
    Ok(String::from_utf8(bytes)?)
}
