//! Versioned repository types: repos, commits, branches and files.

use crate::ids::{CommitId, ObjectHash};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_BRANCH: &str = "master";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RepoInfo {
    pub name: String,
    /// Repos whose commits this repo's commits are computed from.
    #[serde(default)]
    pub provenance: Vec<String>,
    #[serde(default)]
    pub is_pipeline_output: bool,
    /// Branches a pipeline output repo reads. Empty for user repos.
    #[serde(default)]
    pub input_branches: Vec<Branch>,
    /// Branch a pipeline writes its output commits to.
    #[serde(default)]
    pub output_branch: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Total size of the newest finished commit on any branch.
    #[serde(default)]
    pub size_bytes: u64,
}

/// Reference to a commit within a repo.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct Commit {
    pub repo: String,
    pub id: CommitId,
}

impl Commit {
    pub fn new(repo: impl Into<String>, id: CommitId) -> Self {
        Self {
            repo: repo.into(),
            id,
        }
    }
}

impl fmt::Display for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repo, self.id)
    }
}

/// A named branch of a repo.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct Branch {
    pub repo: String,
    pub name: String,
}

impl Branch {
    pub fn new(repo: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repo, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CommitInfo {
    pub commit: Commit,
    pub branch: Option<String>,
    pub parent: Option<CommitId>,
    /// Transitive closure of the commits this commit was computed from.
    pub provenance: Vec<Commit>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub size_bytes: u64,
}

impl CommitInfo {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn has_provenance(&self, commit: &Commit) -> bool {
        self.provenance.contains(commit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BranchInfo {
    pub repo: String,
    pub name: String,
    /// Newest finished commit on the branch.
    pub head: Option<CommitId>,
    /// Newest commit started on the branch that is not finished yet.
    pub open: Option<CommitId>,
}

/// One stored chunk of file content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct ObjectRef {
    pub hash: ObjectHash,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FileInfo {
    pub path: String,
    pub file_type: FileType,
    pub size_bytes: u64,
    /// Content identity: the object hash chain for files, a digest of the
    /// children for directories.
    pub hash: ObjectHash,
    /// Content objects in append order. Empty for directories.
    #[serde(default)]
    pub objects: Vec<ObjectRef>,
}

/// Repo and pipeline names are single subject tokens: letters, digits,
/// `-` and `_`.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Normalize a user supplied path to the absolute, slash separated form
/// used as tree keys: `/dir/file`.
pub fn clean_path(path: &str) -> String {
    let parts: Vec<&str> = path
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    format!("/{}", parts.join("/"))
}
