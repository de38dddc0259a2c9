//! Waiting for downstream commits.
//!
//! Flushing a set of source commits yields, for every repo downstream of the
//! branches of all of them, the newest commit computed from all of them once
//! it finishes.

use crate::graph::CommitGraph;
use futures::Stream;
use sediment_core::ids::CommitId;
use sediment_core::repo::{Commit, CommitInfo};
use sediment_core::{Error, Result};
use std::pin::Pin;
use tracing::debug;

/// Stream of finished downstream commits, upstream repos first. Dropping it
/// stops waiting without touching any commit or job.
pub type CommitInfoStream = Pin<Box<dyn Stream<Item = Result<CommitInfo>> + Send>>;

impl CommitGraph {
    /// Flush `sources`, given as `(repo, commit id or branch)` pairs. A
    /// branch resolves to its head. Targets are the repos whose output is
    /// computed from the sources' branches; `to_repos` restricts them.
    pub async fn flush_commit(
        &self,
        sources: &[(String, String)],
        to_repos: Option<&[String]>,
    ) -> Result<CommitInfoStream> {
        let mut commits = Vec::with_capacity(sources.len());
        let mut branches = Vec::with_capacity(sources.len());
        for (repo, reference) in sources {
            let commit = self.resolve_head(repo, reference).await?;
            let branch = if reference.parse::<CommitId>().is_ok() {
                self.inspect_commit(&commit).await?.branch
            } else {
                Some(reference.clone())
            };
            branches.push((repo.clone(), branch));
            commits.push(commit);
        }
        let mut targets = self.downstream_repos(&branches).await?;
        if let Some(filter) = to_repos {
            for repo in filter {
                self.inspect_repo(repo).await?;
            }
            targets.retain(|t| filter.contains(t));
        }
        debug!(sources = ?commits, targets = ?targets, "Flushing commits");

        let graph = self.clone();
        let stream = async_stream::stream! {
            let mut changes = graph.changes();
            for repo in targets {
                match graph.wait_for_downstream(&repo, &commits, &mut changes).await {
                    Ok(info) => yield Ok(info),
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn wait_for_downstream(
        &self,
        repo: &str,
        sources: &[Commit],
        changes: &mut tokio::sync::watch::Receiver<u64>,
    ) -> Result<CommitInfo> {
        loop {
            changes.borrow_and_update();
            if let Some(info) = self.find_downstream_commit(repo, sources).await?
                && info.is_finished()
            {
                return Ok(info);
            }
            changes
                .changed()
                .await
                .map_err(|_| Error::Cancelled("commit graph was dropped".into()))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::blob::MemoryBlobStore;
    use crate::bus::MemoryEventBus;
    use crate::graph::{CommitGraph, StartCommitOptions};
    use futures::StreamExt;
    use sediment_core::repo::Commit;
    use std::sync::Arc;
    use std::time::Duration;

    fn graph() -> CommitGraph {
        CommitGraph::new(
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemoryEventBus::new(64)),
        )
    }

    async fn derive(g: &CommitGraph, repo: &str, from: &[Commit]) -> Commit {
        g.start_commit_with(
            repo,
            StartCommitOptions {
                branch: Some("master".into()),
                provenance: from.to_vec(),
                empty: true,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_flush_waits_for_downstream() {
        let g = graph();
        g.create_repo("a").await.unwrap();
        g.create_repo_with("b", &["a".into()], true, None).await.unwrap();
        let a = g.start_commit("a", "master").await.unwrap();
        g.finish_commit(&a).await.unwrap();

        let mut stream = g
            .flush_commit(&[("a".into(), a.id.to_string())], None)
            .await
            .unwrap();

        let g2 = g.clone();
        let a2 = a.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let b = derive(&g2, "b", &[a2]).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            g2.finish_commit(&b).await.unwrap();
        });

        let info = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(info.commit.repo, "b");
        assert!(info.is_finished());
        assert!(info.has_provenance(&a));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_flush_filters_targets() {
        let g = graph();
        g.create_repo("a").await.unwrap();
        g.create_repo_with("b", &["a".into()], true, None).await.unwrap();
        g.create_repo_with("c", &["b".into()], true, None).await.unwrap();
        let a = g.start_commit("a", "master").await.unwrap();
        g.finish_commit(&a).await.unwrap();
        let b = derive(&g, "b", std::slice::from_ref(&a)).await;
        g.finish_commit(&b).await.unwrap();
        let c = derive(&g, "c", std::slice::from_ref(&b)).await;
        g.finish_commit(&c).await.unwrap();

        let all: Vec<String> = g
            .flush_commit(&[("a".into(), "master".into())], None)
            .await
            .unwrap()
            .map(|r| r.unwrap().commit.repo)
            .collect()
            .await;
        assert_eq!(all, vec!["b".to_string(), "c".to_string()]);

        let only_c: Vec<String> = g
            .flush_commit(&[("a".into(), "master".into())], Some(&["c".to_string()]))
            .await
            .unwrap()
            .map(|r| r.unwrap().commit.repo)
            .collect()
            .await;
        assert_eq!(only_c, vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn test_flush_with_no_downstream_is_empty() {
        let g = graph();
        g.create_repo("a").await.unwrap();
        let a = g.start_commit("a", "master").await.unwrap();
        g.finish_commit(&a).await.unwrap();
        let mut stream = g
            .flush_commit(&[("a".into(), "master".into())], None)
            .await
            .unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_flush_does_not_block() {
        let g = graph();
        g.create_repo("a").await.unwrap();
        g.create_repo_with("b", &["a".into()], true, None).await.unwrap();
        let a = g.start_commit("a", "master").await.unwrap();
        g.finish_commit(&a).await.unwrap();
        let mut stream = g
            .flush_commit(&[("a".into(), "master".into())], None)
            .await
            .unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(waited.is_err());
        drop(stream);

        let b = derive(&g, "b", &[a]).await;
        g.finish_commit(&b).await.unwrap();
    }
}
