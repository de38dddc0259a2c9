//! Error types for Sediment.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Repo and commit errors
    #[error("Repo not found: {0}")]
    RepoNotFound(String),

    #[error("repo {0} already exists")]
    RepoAlreadyExists(String),

    #[error("Repo {repo} is provenance for {dependents:?}")]
    RepoHasDependents {
        repo: String,
        dependents: Vec<String>,
    },

    #[error("Commit not found: {0}")]
    CommitNotFound(String),

    #[error("Branch {branch} not found in repo {repo}")]
    BranchNotFound { repo: String, branch: String },

    #[error("commit {0} has already been finished")]
    CommitAlreadyFinished(String),

    #[error("Commit {0} is not finished")]
    CommitNotFinished(String),

    #[error("File {path} not found in commit {commit}")]
    FileNotFound { commit: String, path: String },

    // Provenance errors
    #[error("cannot finish commit {commit}: provenance commit {provenance} is not finished")]
    ProvenanceUnfinished { commit: String, provenance: String },

    #[error("Provenance of commit {0} would form a cycle")]
    ProvenanceCycle(String),

    // Pipeline errors
    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("pipeline {0} already exists")]
    PipelineAlreadyExists(String),

    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    // Job errors
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {job} cannot move from {from} to {to}")]
    InvalidJobTransition {
        job: String,
        from: String,
        to: String,
    },

    #[error("Datum {datum} failed: {reason}")]
    DatumFailed { datum: String, reason: String },

    // Infrastructure errors
    #[error("Blob store error: {0}")]
    BlobStore(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Orchestration error: {0}")]
    Orchestration(String),

    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("Event subscription lagged, {0} events dropped")]
    EventsLagged(u64),

    #[error("Claim store error: {0}")]
    Claim(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // Generic
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Infrastructure failures that are worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::BlobStore(_)
                | Error::Orchestration(_)
                | Error::EventBus(_)
                | Error::Claim(_)
                | Error::Io(_)
        )
    }

    /// Errors raised before any state is mutated.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::RepoNotFound(_)
                | Error::RepoAlreadyExists(_)
                | Error::BranchNotFound { .. }
                | Error::PipelineAlreadyExists(_)
                | Error::InvalidPipeline(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_pipeline_message() {
        let err = Error::PipelineAlreadyExists("edges".to_string());
        assert_eq!(err.to_string(), "pipeline edges already exists");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Orchestration("unreachable".into()).is_retryable());
        assert!(Error::BlobStore("timeout".into()).is_retryable());
        assert!(!Error::ObjectNotFound("abc".into()).is_retryable());
        assert!(!Error::InvalidPipeline("empty".into()).is_retryable());
    }
}
