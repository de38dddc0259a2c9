//! Commit and provenance graph.
//!
//! Commits live in an arena indexed by commit id. Provenance is an
//! append-only edge list between arena slots; closures are computed by
//! traversal when a commit is created and never change afterwards. All
//! writes go through one lock, so two finishes of the same commit are
//! serialized while readers see either the state before or after a finish,
//! never a finished commit without its branch head.

use crate::tree::FileTree;
use chrono::{DateTime, Utc};
use sediment_core::config::RetryPolicy;
use sediment_core::events::{CommitFinishedPayload, CommitStartedPayload, Event};
use sediment_core::ids::CommitId;
use sediment_core::ports::{BlobStore, EventBus};
use sediment_core::repo::{
    Branch, BranchInfo, Commit, CommitInfo, FileInfo, ObjectRef, RepoInfo, clean_path,
    is_valid_name,
};
use sediment_core::retry::retry_with_backoff;
use sediment_core::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

/// Options for starting a commit.
#[derive(Debug, Clone, Default)]
pub struct StartCommitOptions {
    pub branch: Option<String>,
    /// Commits this commit is computed from. Their closures are added too.
    pub provenance: Vec<Commit>,
    /// Start from an empty tree instead of the parent's.
    pub empty: bool,
}

impl StartCommitOptions {
    pub fn on_branch(branch: impl Into<String>) -> Self {
        Self {
            branch: Some(branch.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug)]
struct RepoRecord {
    info: RepoInfo,
    branches: BTreeMap<String, BranchState>,
    commits: Vec<usize>,
}

#[derive(Debug, Default, Clone, Copy)]
struct BranchState {
    head: Option<usize>,
    open: Option<usize>,
}

#[derive(Debug)]
struct CommitNode {
    commit: Commit,
    branch: Option<String>,
    parent: Option<CommitId>,
    /// Slice of `GraphState::edges` holding the direct provenance.
    edges: Range<usize>,
    /// Transitive provenance, sorted arena slots.
    closure: Vec<usize>,
    started_at: DateTime<Utc>,
    start_seq: u64,
    finished_at: Option<DateTime<Utc>>,
    finish_seq: Option<u64>,
    tree: Arc<FileTree>,
    deleted: bool,
}

#[derive(Debug, Default)]
struct GraphState {
    repos: BTreeMap<String, RepoRecord>,
    nodes: Vec<CommitNode>,
    index: HashMap<CommitId, usize>,
    /// (dependent, dependency) pairs in creation order.
    edges: Vec<(usize, usize)>,
    seq: u64,
}

struct Inner {
    state: RwLock<GraphState>,
    blobs: Arc<dyn BlobStore>,
    event_bus: Arc<dyn EventBus>,
    retry: RetryPolicy,
    changes: watch::Sender<u64>,
}

/// The versioned file system: repos, commits, branches and provenance.
#[derive(Clone)]
pub struct CommitGraph {
    inner: Arc<Inner>,
}

impl CommitGraph {
    pub fn new(blobs: Arc<dyn BlobStore>, event_bus: Arc<dyn EventBus>) -> Self {
        Self::with_retry(blobs, event_bus, RetryPolicy::default())
    }

    pub fn with_retry(
        blobs: Arc<dyn BlobStore>,
        event_bus: Arc<dyn EventBus>,
        retry: RetryPolicy,
    ) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(GraphState::default()),
                blobs,
                event_bus,
                retry,
                changes,
            }),
        }
    }

    pub fn blobs(&self) -> Arc<dyn BlobStore> {
        self.inner.blobs.clone()
    }

    /// Receiver that ticks on every commit start, finish, branch move and
    /// repo deletion.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    fn notify(&self) {
        self.inner.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    // Repos

    /// Create a user repo.
    pub async fn create_repo(&self, name: &str) -> Result<RepoInfo> {
        self.create_repo_with(name, &[], false, None).await
    }

    /// Create a repo with repo-level provenance.
    pub async fn create_repo_with(
        &self,
        name: &str,
        provenance: &[String],
        pipeline_output: bool,
        description: Option<String>,
    ) -> Result<RepoInfo> {
        if !is_valid_name(name) {
            return Err(Error::Other(format!(
                "invalid repo name {:?}: use letters, digits, '-' or '_'",
                name
            )));
        }
        let mut guard = self.inner.state.write().await;
        let state = &mut *guard;
        if state.repos.contains_key(name) {
            return Err(Error::RepoAlreadyExists(name.to_string()));
        }
        check_repo_provenance(&state, name, provenance)?;
        let info = RepoInfo {
            name: name.to_string(),
            provenance: provenance.to_vec(),
            is_pipeline_output: pipeline_output,
            input_branches: Vec::new(),
            output_branch: None,
            description,
            created_at: Utc::now(),
            size_bytes: 0,
        };
        state.repos.insert(
            name.to_string(),
            RepoRecord {
                info: info.clone(),
                branches: BTreeMap::new(),
                commits: Vec::new(),
            },
        );
        info!(repo = %name, provenance = ?provenance, "Created repo");
        Ok(info)
    }

    /// Create the output repo of a pipeline, or adopt an existing one left
    /// by an earlier pipeline of the same name. A user repo with that name
    /// is a conflict.
    pub async fn ensure_output_repo(
        &self,
        name: &str,
        inputs: &[Branch],
        output_branch: &str,
    ) -> Result<RepoInfo> {
        let mut provenance: Vec<String> = Vec::new();
        for input in inputs {
            if !provenance.contains(&input.repo) {
                provenance.push(input.repo.clone());
            }
        }
        let exists = self.inner.state.read().await.repos.contains_key(name);
        if !exists {
            self.create_repo_with(name, &provenance, true, None).await?;
        }

        let mut guard = self.inner.state.write().await;
        let state = &mut *guard;
        check_repo_provenance(&state, name, &provenance)?;
        let record = state
            .repos
            .get_mut(name)
            .ok_or_else(|| Error::RepoNotFound(name.to_string()))?;
        if !record.info.is_pipeline_output {
            return Err(Error::RepoAlreadyExists(name.to_string()));
        }
        record.info.provenance = provenance;
        record.info.input_branches = inputs.to_vec();
        record.info.output_branch = Some(output_branch.to_string());
        if exists {
            debug!(repo = %name, "Adopted existing output repo");
        }
        Ok(record.info.clone())
    }

    pub async fn inspect_repo(&self, name: &str) -> Result<RepoInfo> {
        let state = self.inner.state.read().await;
        let record = repo_record(&state, name)?;
        Ok(repo_info(&state, record))
    }

    pub async fn list_repo(&self) -> Vec<RepoInfo> {
        let state = self.inner.state.read().await;
        state
            .repos
            .values()
            .map(|record| repo_info(&state, record))
            .collect()
    }

    /// Delete a repo and its commits. Without `force`, repos that list it as
    /// provenance block the delete.
    pub async fn delete_repo(&self, name: &str, force: bool) -> Result<()> {
        {
            let mut guard = self.inner.state.write().await;
            let state = &mut *guard;
            repo_record(&state, name)?;
            let dependents: Vec<String> = state
                .repos
                .values()
                .filter(|r| r.info.provenance.iter().any(|p| p == name))
                .map(|r| r.info.name.clone())
                .collect();
            if !dependents.is_empty() && !force {
                return Err(Error::RepoHasDependents {
                    repo: name.to_string(),
                    dependents,
                });
            }
            if let Some(record) = state.repos.remove(name) {
                for slot in record.commits {
                    let id = state.nodes[slot].commit.id;
                    state.nodes[slot].deleted = true;
                    state.index.remove(&id);
                }
            }
            for record in state.repos.values_mut() {
                record.info.provenance.retain(|p| p != name);
                record.info.input_branches.retain(|b| b.repo != name);
            }
        }
        self.notify();
        info!(repo = %name, force, "Deleted repo");
        Ok(())
    }

    /// Repos whose output is computed, directly or through other pipelines,
    /// from every source, ordered so that upstream repos come first. A source
    /// without a branch matches any branch of its repo.
    pub async fn downstream_repos(&self, sources: &[(String, Option<String>)]) -> Result<Vec<String>> {
        let state = self.inner.state.read().await;
        for (source, _) in sources {
            repo_record(&state, source)?;
        }
        if sources.is_empty() {
            return Ok(Vec::new());
        }
        let mut found: Vec<(usize, String)> = Vec::new();
        for name in state.repos.keys() {
            if sources
                .iter()
                .all(|(repo, branch)| derives_from(&state, name, repo, branch.as_deref()))
            {
                let depth = repo_upstream(&state, name).values().copied().max().unwrap_or(0);
                found.push((depth, name.clone()));
            }
        }
        found.sort();
        Ok(found.into_iter().map(|(_, name)| name).collect())
    }

    /// Whether commits on `downstream` are computed from commits on
    /// `upstream`, directly or through other pipelines.
    pub async fn is_upstream(&self, upstream: &Branch, downstream: &Branch) -> bool {
        let state = self.inner.state.read().await;
        let Some(record) = state.repos.get(&downstream.repo) else {
            return false;
        };
        if record
            .info
            .output_branch
            .as_ref()
            .is_some_and(|b| b != &downstream.name)
        {
            return false;
        }
        derives_from(&state, &downstream.repo, &upstream.repo, Some(&upstream.name))
    }

    // Commits

    /// Open a commit on `branch`, parented on the branch head.
    pub async fn start_commit(&self, repo: &str, branch: &str) -> Result<Commit> {
        self.start_commit_with(repo, StartCommitOptions::on_branch(branch))
            .await
    }

    pub async fn start_commit_with(&self, repo: &str, options: StartCommitOptions) -> Result<Commit> {
        let (commit, started_at) = {
            let mut guard = self.inner.state.write().await;
            let state = &mut *guard;
            let record = repo_record(&state, repo)?;

            if let Some(branch) = &options.branch
                && !is_valid_name(branch)
            {
                return Err(Error::Other(format!("invalid branch name {:?}", branch)));
            }

            let parent_slot = options
                .branch
                .as_ref()
                .and_then(|b| record.branches.get(b))
                .and_then(|b| b.head);

            let mut direct = Vec::new();
            for p in &options.provenance {
                let slot = *state
                    .index
                    .get(&p.id)
                    .ok_or_else(|| Error::CommitNotFound(p.to_string()))?;
                if state.nodes[slot].commit.repo != p.repo {
                    return Err(Error::CommitNotFound(p.to_string()));
                }
                if p.repo == repo {
                    return Err(Error::ProvenanceCycle(format!(
                        "{} cannot be computed from its own repo",
                        repo
                    )));
                }
                if !direct.contains(&slot) {
                    direct.push(slot);
                }
            }

            let mut closure = BTreeSet::new();
            for &slot in &direct {
                closure.insert(slot);
                closure.extend(state.nodes[slot].closure.iter().copied());
            }
            if closure
                .iter()
                .any(|&slot| state.nodes[slot].commit.repo == repo)
            {
                return Err(Error::ProvenanceCycle(format!(
                    "provenance of a new commit in {} leads back to {}",
                    repo, repo
                )));
            }

            let slot = state.nodes.len();
            let edge_start = state.edges.len();
            for &dep in &direct {
                state.edges.push((slot, dep));
            }
            let edges = edge_start..state.edges.len();

            let parent = parent_slot.map(|p| state.nodes[p].commit.id);
            let tree = match parent_slot {
                Some(p) if !options.empty => state.nodes[p].tree.clone(),
                _ => Arc::new(FileTree::new()),
            };
            let id = CommitId::new();
            let commit = Commit::new(repo, id);
            let started_at = Utc::now();
            state.seq += 1;
            let start_seq = state.seq;
            state.nodes.push(CommitNode {
                commit: commit.clone(),
                branch: options.branch.clone(),
                parent,
                edges,
                closure: closure.into_iter().collect(),
                started_at,
                start_seq,
                finished_at: None,
                finish_seq: None,
                tree,
                deleted: false,
            });
            state.index.insert(id, slot);
            let record = state
                .repos
                .get_mut(repo)
                .ok_or_else(|| Error::RepoNotFound(repo.to_string()))?;
            record.commits.push(slot);
            if let Some(branch) = &options.branch {
                record.branches.entry(branch.clone()).or_default().open = Some(slot);
            }
            (commit, started_at)
        };
        self.notify();
        debug!(commit = %commit, branch = ?options.branch, "Started commit");

        self.publish(Event::CommitStarted(CommitStartedPayload {
            commit: commit.clone(),
            branch: options.branch,
            started_at,
        }))
        .await?;
        Ok(commit)
    }

    /// Seal an open commit and move its branch head to it.
    pub async fn finish_commit(&self, commit: &Commit) -> Result<CommitInfo> {
        let info = {
            let mut guard = self.inner.state.write().await;
            let state = &mut *guard;
            let slot = commit_slot(&state, commit)?;
            if state.nodes[slot].finished_at.is_some() {
                return Err(Error::CommitAlreadyFinished(commit.to_string()));
            }
            let edges = state.nodes[slot].edges.clone();
            for &(_, dep) in &state.edges[edges] {
                if state.nodes[dep].finished_at.is_none() {
                    return Err(Error::ProvenanceUnfinished {
                        commit: commit.to_string(),
                        provenance: state.nodes[dep].commit.to_string(),
                    });
                }
            }

            state.seq += 1;
            let seq = state.seq;
            let node = &mut state.nodes[slot];
            node.finished_at = Some(Utc::now());
            node.finish_seq = Some(seq);
            let branch = node.branch.clone();

            if let Some(branch) = &branch {
                let open_on_branch = latest_open(&state, &commit.repo, branch, slot);
                if let Some(record) = state.repos.get_mut(&commit.repo) {
                    let b = record.branches.entry(branch.clone()).or_default();
                    b.head = Some(slot);
                    b.open = open_on_branch;
                }
            }
            commit_info(&state, slot)
        };
        self.notify();
        info!(
            commit = %commit,
            branch = ?info.branch,
            size_bytes = info.size_bytes,
            "Finished commit"
        );

        self.publish(Event::CommitFinished(CommitFinishedPayload {
            commit: commit.clone(),
            branch: info.branch.clone(),
            finished_at: info.finished_at.unwrap_or_else(Utc::now),
        }))
        .await?;
        Ok(info)
    }

    pub async fn inspect_commit(&self, commit: &Commit) -> Result<CommitInfo> {
        let state = self.inner.state.read().await;
        let slot = commit_slot(&state, commit)?;
        Ok(commit_info(&state, slot))
    }

    /// Resolve a commit id or branch name. A branch resolves to its open
    /// commit if it has one, otherwise to its head.
    pub async fn resolve_commit(&self, repo: &str, reference: &str) -> Result<Commit> {
        let state = self.inner.state.read().await;
        let slot = resolve(&state, repo, reference, true)?;
        Ok(state.nodes[slot].commit.clone())
    }

    /// Resolve a commit id or branch name, preferring the finished head for
    /// branches.
    pub async fn resolve_head(&self, repo: &str, reference: &str) -> Result<Commit> {
        let state = self.inner.state.read().await;
        let slot = resolve(&state, repo, reference, false)?;
        Ok(state.nodes[slot].commit.clone())
    }

    /// Commits newest first: open commits by start order, then finished
    /// commits by finish order. `count == 0` returns all.
    pub async fn list_commit(
        &self,
        repo: &str,
        branch: Option<&str>,
        count: usize,
    ) -> Result<Vec<CommitInfo>> {
        let state = self.inner.state.read().await;
        let record = repo_record(&state, repo)?;
        if let Some(b) = branch
            && !record.branches.contains_key(b)
        {
            return Err(Error::BranchNotFound {
                repo: repo.to_string(),
                branch: b.to_string(),
            });
        }
        let mut slots: Vec<usize> = record
            .commits
            .iter()
            .copied()
            .filter(|&s| branch.is_none() || state.nodes[s].branch.as_deref() == branch)
            .collect();
        slots.sort_by_key(|&s| {
            let node = &state.nodes[s];
            match node.finish_seq {
                None => (1, std::cmp::Reverse(node.start_seq)),
                Some(seq) => (2, std::cmp::Reverse(seq)),
            }
        });
        if count > 0 {
            slots.truncate(count);
        }
        Ok(slots.into_iter().map(|s| commit_info(&state, s)).collect())
    }

    // Branches

    /// Point `branch` at a finished commit. Publishes the same event as a
    /// finish so dependent pipelines see the new head.
    pub async fn set_branch(&self, repo: &str, reference: &str, branch: &str) -> Result<()> {
        let commit = {
            let mut guard = self.inner.state.write().await;
            let state = &mut *guard;
            if !is_valid_name(branch) {
                return Err(Error::Other(format!("invalid branch name {:?}", branch)));
            }
            let slot = resolve(&state, repo, reference, false)?;
            if state.nodes[slot].finished_at.is_none() {
                return Err(Error::CommitNotFinished(state.nodes[slot].commit.to_string()));
            }
            let record = state
                .repos
                .get_mut(repo)
                .ok_or_else(|| Error::RepoNotFound(repo.to_string()))?;
            record.branches.entry(branch.to_string()).or_default().head = Some(slot);
            state.nodes[slot].commit.clone()
        };
        self.notify();
        info!(commit = %commit, branch = %branch, "Moved branch");

        self.publish(Event::CommitFinished(CommitFinishedPayload {
            commit,
            branch: Some(branch.to_string()),
            finished_at: Utc::now(),
        }))
        .await
    }

    pub async fn inspect_branch(&self, repo: &str, branch: &str) -> Result<BranchInfo> {
        let state = self.inner.state.read().await;
        let record = repo_record(&state, repo)?;
        let b = record.branches.get(branch).ok_or_else(|| Error::BranchNotFound {
            repo: repo.to_string(),
            branch: branch.to_string(),
        })?;
        Ok(branch_info(&state, repo, branch, b))
    }

    pub async fn list_branch(&self, repo: &str) -> Result<Vec<BranchInfo>> {
        let state = self.inner.state.read().await;
        let record = repo_record(&state, repo)?;
        Ok(record
            .branches
            .iter()
            .map(|(name, b)| branch_info(&state, repo, name, b))
            .collect())
    }

    /// Newest finished commit of a branch, if any.
    pub async fn branch_head(&self, repo: &str, branch: &str) -> Result<Option<CommitInfo>> {
        let state = self.inner.state.read().await;
        let record = repo_record(&state, repo)?;
        Ok(record
            .branches
            .get(branch)
            .and_then(|b| b.head)
            .map(|slot| commit_info(&state, slot)))
    }

    // Files

    /// Append bytes to a file in an open commit.
    pub async fn put_file(
        &self,
        repo: &str,
        reference: &str,
        path: &str,
        content: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let commit = self.resolve_commit(repo, reference).await?;
        self.ensure_open(&commit).await?;
        let content = content.into();
        let blobs = self.inner.blobs.clone();
        let object = retry_with_backoff(&self.inner.retry, "blob_put", || {
            let content = content.clone();
            let blobs = blobs.clone();
            async move { blobs.put(content).await }
        })
        .await?;
        self.put_file_objects(&commit, path, vec![object]).await
    }

    /// Append already stored objects to a file in an open commit.
    pub async fn put_file_objects(
        &self,
        commit: &Commit,
        path: &str,
        objects: Vec<ObjectRef>,
    ) -> Result<()> {
        let mut guard = self.inner.state.write().await;
        let state = &mut *guard;
        let slot = commit_slot(&state, commit)?;
        let node = &mut state.nodes[slot];
        if node.finished_at.is_some() {
            return Err(Error::CommitAlreadyFinished(commit.to_string()));
        }
        Arc::make_mut(&mut node.tree).append(path, objects)
    }

    pub async fn delete_file(&self, repo: &str, reference: &str, path: &str) -> Result<()> {
        let commit = self.resolve_commit(repo, reference).await?;
        let mut guard = self.inner.state.write().await;
        let state = &mut *guard;
        let slot = commit_slot(&state, &commit)?;
        let node = &mut state.nodes[slot];
        if node.finished_at.is_some() {
            return Err(Error::CommitAlreadyFinished(commit.to_string()));
        }
        if Arc::make_mut(&mut node.tree).delete(path) == 0 {
            return Err(Error::FileNotFound {
                commit: commit.to_string(),
                path: clean_path(path),
            });
        }
        Ok(())
    }

    /// Read a whole file.
    pub async fn get_file(&self, repo: &str, reference: &str, path: &str) -> Result<Vec<u8>> {
        let info = self.inspect_file(repo, reference, path).await?;
        if info.file_type == sediment_core::repo::FileType::Dir {
            return Err(Error::Other(format!("{} is a directory", info.path)));
        }
        self.read_objects(&info.objects).await
    }

    /// Concatenate the bytes of a sequence of objects.
    pub async fn read_objects(&self, objects: &[ObjectRef]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(objects.iter().map(|o| o.size_bytes as usize).sum());
        for object in objects {
            let blobs = self.inner.blobs.clone();
            let bytes = retry_with_backoff(&self.inner.retry, "blob_get", || {
                let blobs = blobs.clone();
                let hash = object.hash.clone();
                async move { blobs.get(&hash).await }
            })
            .await?;
            out.extend_from_slice(&bytes);
        }
        Ok(out)
    }

    pub async fn inspect_file(&self, repo: &str, reference: &str, path: &str) -> Result<FileInfo> {
        let commit = self.resolve_commit(repo, reference).await?;
        let tree = self.tree(&commit).await?;
        tree.inspect(path).ok_or_else(|| Error::FileNotFound {
            commit: commit.to_string(),
            path: clean_path(path),
        })
    }

    pub async fn list_file(&self, repo: &str, reference: &str, dir: &str) -> Result<Vec<FileInfo>> {
        let commit = self.resolve_commit(repo, reference).await?;
        let tree = self.tree(&commit).await?;
        tree.list(dir).map_err(|_| Error::FileNotFound {
            commit: commit.to_string(),
            path: clean_path(dir),
        })
    }

    /// Snapshot of a commit's tree. Cheap: trees are shared until written.
    pub async fn tree(&self, commit: &Commit) -> Result<Arc<FileTree>> {
        let state = self.inner.state.read().await;
        let slot = commit_slot(&state, commit)?;
        Ok(state.nodes[slot].tree.clone())
    }

    async fn ensure_open(&self, commit: &Commit) -> Result<()> {
        let state = self.inner.state.read().await;
        let slot = commit_slot(&state, commit)?;
        if state.nodes[slot].finished_at.is_some() {
            return Err(Error::CommitAlreadyFinished(commit.to_string()));
        }
        Ok(())
    }

    // Provenance queries

    /// Newest commit in `repo` whose provenance contains every commit in
    /// `sources`, with whether it is finished.
    pub async fn find_downstream_commit(
        &self,
        repo: &str,
        sources: &[Commit],
    ) -> Result<Option<CommitInfo>> {
        let state = self.inner.state.read().await;
        let record = repo_record(&state, repo)?;
        let mut source_slots = Vec::with_capacity(sources.len());
        for source in sources {
            source_slots.push(commit_slot(&state, source)?);
        }
        let best = record
            .commits
            .iter()
            .copied()
            .filter(|&s| {
                source_slots
                    .iter()
                    .all(|src| state.nodes[s].closure.binary_search(src).is_ok())
            })
            .max_by_key(|&s| state.nodes[s].start_seq);
        Ok(best.map(|s| commit_info(&state, s)))
    }

    /// The commit on `branch` of `repo` that `commit` was computed from. With
    /// several, the newest one.
    pub async fn provenance_on_branch(
        &self,
        commit: &Commit,
        repo: &str,
        branch: &str,
    ) -> Result<Option<CommitInfo>> {
        let state = self.inner.state.read().await;
        let slot = commit_slot(&state, commit)?;
        let best = state.nodes[slot]
            .closure
            .iter()
            .copied()
            .filter(|&s| {
                let node = &state.nodes[s];
                node.commit.repo == repo && node.branch.as_deref() == Some(branch)
            })
            .max_by_key(|&s| state.nodes[s].start_seq);
        Ok(best.map(|s| commit_info(&state, s)))
    }

    async fn publish(&self, event: Event) -> Result<()> {
        let bus = self.inner.event_bus.clone();
        let subject = event.subject();
        retry_with_backoff(&self.inner.retry, "event_publish", || {
            let bus = bus.clone();
            let event = event.clone();
            async move { bus.publish(event).await }
        })
        .await
        .inspect_err(|e| warn!(subject = %subject, error = %e, "Failed to publish event"))
    }
}

fn repo_record<'a>(state: &'a GraphState, name: &str) -> Result<&'a RepoRecord> {
    state
        .repos
        .get(name)
        .ok_or_else(|| Error::RepoNotFound(name.to_string()))
}

fn commit_slot(state: &GraphState, commit: &Commit) -> Result<usize> {
    state
        .index
        .get(&commit.id)
        .copied()
        .filter(|&s| state.nodes[s].commit.repo == commit.repo && !state.nodes[s].deleted)
        .ok_or_else(|| Error::CommitNotFound(commit.to_string()))
}

fn resolve(state: &GraphState, repo: &str, reference: &str, prefer_open: bool) -> Result<usize> {
    let record = repo_record(state, repo)?;
    if let Ok(id) = reference.parse::<CommitId>() {
        return commit_slot(state, &Commit::new(repo, id));
    }
    let branch = record
        .branches
        .get(reference)
        .ok_or_else(|| Error::BranchNotFound {
            repo: repo.to_string(),
            branch: reference.to_string(),
        })?;
    let slot = if prefer_open {
        branch.open.or(branch.head)
    } else {
        branch.head
    };
    slot.ok_or_else(|| Error::CommitNotFound(format!("{}@{}", repo, reference)))
}

/// Newest open commit on a branch other than `except`.
fn latest_open(state: &GraphState, repo: &str, branch: &str, except: usize) -> Option<usize> {
    state.repos.get(repo).and_then(|record| {
        record
            .commits
            .iter()
            .copied()
            .filter(|&s| {
                s != except
                    && state.nodes[s].finished_at.is_none()
                    && state.nodes[s].branch.as_deref() == Some(branch)
            })
            .max_by_key(|&s| state.nodes[s].start_seq)
    })
}

fn check_repo_provenance(state: &GraphState, name: &str, provenance: &[String]) -> Result<()> {
    for p in provenance {
        if p == name {
            return Err(Error::ProvenanceCycle(format!("repo {} lists itself", name)));
        }
        repo_record(state, p)?;
        if repo_upstream(state, p).contains_key(name) {
            return Err(Error::ProvenanceCycle(format!(
                "repo {} is already upstream of {}",
                name, p
            )));
        }
    }
    Ok(())
}

/// Whether the output of `repo` is computed from `source` on `branch`.
/// Pipeline repos follow their input branches, continuing upstream only
/// through the branch a pipeline writes to. Repos created with repo-level
/// provenance alone match any branch.
fn derives_from(state: &GraphState, repo: &str, source: &str, branch: Option<&str>) -> bool {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([repo]);
    while let Some(name) = queue.pop_front() {
        if !seen.insert(name) {
            continue;
        }
        let Some(record) = state.repos.get(name) else {
            continue;
        };
        if record.info.input_branches.is_empty() {
            for p in &record.info.provenance {
                if p == source {
                    return true;
                }
                queue.push_back(p.as_str());
            }
            continue;
        }
        for input in &record.info.input_branches {
            if input.repo == source && branch.is_none_or(|b| b == input.name) {
                return true;
            }
            let feeds = state.repos.get(&input.repo).is_some_and(|up| {
                up.info
                    .output_branch
                    .as_ref()
                    .is_none_or(|out| out == &input.name)
            });
            if feeds {
                queue.push_back(input.repo.as_str());
            }
        }
    }
    false
}

/// Transitive repo provenance of `repo` with the longest distance to each.
fn repo_upstream<'a>(state: &'a GraphState, repo: &str) -> HashMap<&'a str, usize> {
    let mut depth: HashMap<&'a str, usize> = HashMap::new();
    let mut queue: VecDeque<(&str, usize)> = VecDeque::new();
    queue.push_back((repo, 0));
    while let Some((name, d)) = queue.pop_front() {
        let Some(record) = state.repos.get(name) else {
            continue;
        };
        for p in &record.info.provenance {
            let entry = depth.entry(p.as_str()).or_insert(0);
            if *entry == 0 || d + 1 > *entry {
                *entry = d + 1;
                queue.push_back((p.as_str(), d + 1));
            }
        }
    }
    depth
}

fn commit_info(state: &GraphState, slot: usize) -> CommitInfo {
    let node = &state.nodes[slot];
    CommitInfo {
        commit: node.commit.clone(),
        branch: node.branch.clone(),
        parent: node.parent,
        provenance: node
            .closure
            .iter()
            .map(|&s| state.nodes[s].commit.clone())
            .collect(),
        started_at: node.started_at,
        finished_at: node.finished_at,
        size_bytes: node.tree.size_bytes(),
    }
}

fn repo_info(state: &GraphState, record: &RepoRecord) -> RepoInfo {
    let newest = record
        .commits
        .iter()
        .copied()
        .filter(|&s| state.nodes[s].finish_seq.is_some())
        .max_by_key(|&s| state.nodes[s].finish_seq);
    RepoInfo {
        size_bytes: newest.map(|s| state.nodes[s].tree.size_bytes()).unwrap_or(0),
        ..record.info.clone()
    }
}

fn branch_info(state: &GraphState, repo: &str, name: &str, b: &BranchState) -> BranchInfo {
    BranchInfo {
        repo: repo.to_string(),
        name: name.to_string(),
        head: b.head.map(|s| state.nodes[s].commit.id),
        open: b.open.map(|s| state.nodes[s].commit.id),
    }
}
