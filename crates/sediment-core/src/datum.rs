//! Datum types exchanged between the scheduler and workers.

use crate::ids::{CommitId, DatumHash, JobId, ObjectHash};
use crate::job::DataPath;
use crate::pipeline::Transform;
use crate::repo::ObjectRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Binding of one input leaf to one matched path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatumBinding {
    pub name: String,
    pub repo: String,
    pub commit: CommitId,
    pub path: String,
    /// Content identity of the matched file or directory.
    pub content_hash: ObjectHash,
    pub lazy: bool,
}

/// One unit of work: a binding per leaf on the path from the root to the
/// leaves that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datum {
    pub index: usize,
    pub hash: DatumHash,
    pub bindings: Vec<DatumBinding>,
}

impl Datum {
    pub fn data_paths(&self) -> Vec<DataPath> {
        self.bindings
            .iter()
            .map(|b| DataPath {
                name: b.name.clone(),
                path: b.path.clone(),
            })
            .collect()
    }

    pub fn matches_filters(&self, filters: &[String]) -> bool {
        matches_filters(&self.hash, &self.bindings, filters)
    }
}

/// True when every filter equals a bound path, a leaf name, the content hash
/// of a bound file, or a prefix of the datum hash.
fn matches_filters(hash: &DatumHash, bindings: &[DatumBinding], filters: &[String]) -> bool {
    filters.iter().all(|f| {
        hash.as_str().starts_with(f.as_str())
            || bindings
                .iter()
                .any(|b| &b.path == f || &b.name == f || b.content_hash.as_str() == f)
    })
}

/// A line a transform wrote while processing one datum attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub pipeline: String,
    pub job_id: JobId,
    pub worker_id: String,
    pub datum_hash: DatumHash,
    pub data: Vec<DatumBinding>,
    pub attempt: u32,
    pub ts: DateTime<Utc>,
    pub message: String,
}

impl LogMessage {
    pub fn matches_filters(&self, filters: &[String]) -> bool {
        matches_filters(&self.datum_hash, &self.data, filters)
    }
}

/// A file presented to the worker under an input leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFile {
    pub path: String,
    pub objects: Vec<ObjectRef>,
    /// Materialized bytes. `None` for lazy inputs, which the worker streams
    /// from the blob store on demand.
    pub content: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatumInput {
    pub binding: DatumBinding,
    pub files: Vec<InputFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatumRequest {
    pub job_id: JobId,
    pub pipeline: String,
    pub worker_id: String,
    pub datum_hash: DatumHash,
    pub attempt: u32,
    pub transform: Transform,
    pub inputs: Vec<DatumInput>,
}

impl DatumRequest {
    pub fn input(&self, name: &str) -> Option<&DatumInput> {
        self.inputs.iter().find(|i| i.binding.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    NamedPipe,
    Other,
}

/// An entry a transform left in its output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEntry {
    pub path: String,
    pub kind: EntryKind,
    #[serde(default)]
    pub content: Vec<u8>,
}

impl OutputEntry {
    pub fn file(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Regular,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatumResult {
    pub exit_code: i32,
    #[serde(default)]
    pub outputs: Vec<OutputEntry>,
    #[serde(default)]
    pub logs: Vec<String>,
}

/// Output of a finished datum as stored for reuse by later jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOutput {
    pub path: String,
    pub objects: Vec<ObjectRef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(name: &str, path: &str) -> DatumBinding {
        DatumBinding {
            name: name.to_string(),
            repo: name.to_string(),
            commit: CommitId::new(),
            path: path.to_string(),
            content_hash: ObjectHash::new("00"),
            lazy: false,
        }
    }

    #[test]
    fn test_filters() {
        let datum = Datum {
            index: 0,
            hash: DatumHash::new("abcdef"),
            bindings: vec![binding("a", "/a1"), binding("b", "/b2")],
        };
        assert!(datum.matches_filters(&[]));
        assert!(datum.matches_filters(&["/a1".to_string()]));
        assert!(datum.matches_filters(&["/a1".to_string(), "/b2".to_string()]));
        assert!(datum.matches_filters(&["abc".to_string()]));
        assert!(!datum.matches_filters(&["/a1".to_string(), "/b1".to_string()]));
    }

    #[test]
    fn test_log_filters_match_file_hash() {
        let mut bound = binding("a", "/a1");
        bound.content_hash = ObjectHash::new("f00d");
        let line = LogMessage {
            pipeline: "p".into(),
            job_id: JobId::new(),
            worker_id: "pipeline-p-0".into(),
            datum_hash: DatumHash::new("abcdef"),
            data: vec![bound],
            attempt: 1,
            ts: Utc::now(),
            message: "hello".into(),
        };
        assert!(line.matches_filters(&["f00d".to_string()]));
        assert!(line.matches_filters(&["/a1".to_string()]));
        assert!(!line.matches_filters(&["beef".to_string()]));
    }
}
