//! Datum expansion.
//!
//! An input tree plus one commit per leaf describes a sequence of datums.
//! The sequence is random-access and computed on demand, so a cross of large
//! inputs is never materialized as a whole.

use crate::glob::Glob;
use futures::FutureExt;
use futures::future::BoxFuture;
use sediment_core::datum::{Datum, DatumBinding};
use sediment_core::ids::DatumHash;
use sediment_core::job::InputCommit;
use sediment_core::pipeline::InputSpec;
use sediment_core::{Error, Result};
use sediment_pfs::CommitGraph;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
enum Node {
    Atom(Vec<DatumBinding>),
    Cross(Vec<Node>),
    Union(Vec<Node>),
}

impl Node {
    fn len(&self) -> usize {
        match self {
            Node::Atom(matches) => matches.len(),
            Node::Cross(children) => children
                .iter()
                .try_fold(1usize, |acc, c| acc.checked_mul(c.len()))
                .unwrap_or(usize::MAX),
            Node::Union(children) => children.iter().map(Node::len).sum(),
        }
    }

    fn collect(&self, index: usize, out: &mut Vec<DatumBinding>) -> bool {
        match self {
            Node::Atom(matches) => match matches.get(index) {
                Some(binding) => {
                    out.push(binding.clone());
                    true
                }
                None => false,
            },
            Node::Cross(children) => {
                // Mixed radix with the first child as the most significant digit.
                let mut digits = vec![0; children.len()];
                let mut rest = index;
                for (slot, child) in children.iter().enumerate().rev() {
                    let len = child.len();
                    if len == 0 {
                        return false;
                    }
                    digits[slot] = rest % len;
                    rest /= len;
                }
                if rest != 0 {
                    return false;
                }
                children
                    .iter()
                    .zip(digits)
                    .all(|(child, digit)| child.collect(digit, out))
            }
            Node::Union(children) => {
                let mut rest = index;
                for child in children {
                    let len = child.len();
                    if rest < len {
                        return child.collect(rest, out);
                    }
                    rest -= len;
                }
                false
            }
        }
    }
}

/// The datums of one job in deterministic order.
#[derive(Debug, Clone)]
pub struct DatumSet {
    root: Node,
    pipeline: String,
    version: u64,
}

impl DatumSet {
    /// Match every leaf's glob against the tree of its bound commit.
    pub async fn expand(
        graph: &CommitGraph,
        pipeline: &str,
        version: u64,
        input: &InputSpec,
        commits: &[InputCommit],
    ) -> Result<Self> {
        let root = expand_node(graph, input, commits).await?;
        Ok(Self {
            root,
            pipeline: pipeline.to_string(),
            version,
        })
    }

    pub fn len(&self) -> usize {
        self.root.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Datum> {
        let mut bindings = Vec::new();
        if !self.root.collect(index, &mut bindings) {
            return None;
        }
        Some(Datum {
            index,
            hash: datum_hash(&self.pipeline, self.version, &bindings),
            bindings,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Datum> + '_ {
        (0..self.len()).map_while(move |i| self.get(i))
    }
}

fn expand_node<'a>(
    graph: &'a CommitGraph,
    input: &'a InputSpec,
    commits: &'a [InputCommit],
) -> BoxFuture<'a, Result<Node>> {
    async move {
        match input {
            InputSpec::Atom(atom) => {
                let name = atom.leaf_name();
                let bound = commits
                    .iter()
                    .find(|c| c.name == name)
                    .ok_or_else(|| Error::Internal(format!("no commit bound to input {}", name)))?;
                let glob = Glob::new(&atom.glob)?;
                let tree = graph.tree(&bound.commit).await?;
                let bindings = tree
                    .walk()
                    .into_iter()
                    .filter(|f| glob.matches(&f.path))
                    .map(|f| DatumBinding {
                        name: name.to_string(),
                        repo: atom.repo.clone(),
                        commit: bound.commit.id,
                        path: f.path,
                        content_hash: f.hash,
                        lazy: atom.lazy,
                    })
                    .collect();
                Ok(Node::Atom(bindings))
            }
            InputSpec::Cross(children) => Ok(Node::Cross(expand_all(graph, children, commits).await?)),
            InputSpec::Union(children) => Ok(Node::Union(expand_all(graph, children, commits).await?)),
        }
    }
    .boxed()
}

async fn expand_all(
    graph: &CommitGraph,
    children: &[InputSpec],
    commits: &[InputCommit],
) -> Result<Vec<Node>> {
    let mut nodes = Vec::with_capacity(children.len());
    for child in children {
        nodes.push(expand_node(graph, child, commits).await?);
    }
    Ok(nodes)
}

/// Identity of a datum: pipeline name and version plus, for every binding,
/// the leaf name, path and content hash. Timing and commit ids do not
/// contribute, so unchanged content hashes the same across commits.
pub fn datum_hash(pipeline: &str, version: u64, bindings: &[DatumBinding]) -> DatumHash {
    let mut hasher = Sha256::new();
    hasher.update(pipeline.as_bytes());
    hasher.update([0u8]);
    hasher.update(version.to_be_bytes());
    for binding in bindings {
        hasher.update(binding.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(binding.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(binding.content_hash.as_str().as_bytes());
        hasher.update([0u8]);
    }
    DatumHash::new(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sediment_core::ids::{CommitId, ObjectHash};
    use sediment_core::pipeline::AtomInput;
    use pretty_assertions::assert_eq;
    use sediment_pfs::{MemoryBlobStore, MemoryEventBus};
    use std::sync::Arc;

    fn binding(name: &str, path: &str) -> DatumBinding {
        DatumBinding {
            name: name.to_string(),
            repo: name.to_string(),
            commit: CommitId::new(),
            path: path.to_string(),
            content_hash: ObjectHash::new(format!("hash-of-{}", path)),
            lazy: false,
        }
    }

    fn atom(name: &str, paths: &[&str]) -> Node {
        Node::Atom(paths.iter().map(|p| binding(name, p)).collect())
    }

    fn paths(node: &Node) -> Vec<Vec<String>> {
        (0..node.len())
            .map(|i| {
                let mut out = Vec::new();
                assert!(node.collect(i, &mut out));
                out.into_iter().map(|b| b.path).collect()
            })
            .collect()
    }

    #[test]
    fn test_cross_is_cartesian_product() {
        let node = Node::Cross(vec![atom("a", &["/a1", "/a2"]), atom("b", &["/b1", "/b2"])]);
        assert_eq!(node.len(), 4);
        assert_eq!(
            paths(&node),
            vec![
                vec!["/a1", "/b1"],
                vec!["/a1", "/b2"],
                vec!["/a2", "/b1"],
                vec!["/a2", "/b2"],
            ]
        );
    }

    #[test]
    fn test_union_concatenates() {
        let node = Node::Union(vec![atom("a", &["/a1", "/a2"]), atom("b", &["/b1", "/b2"])]);
        assert_eq!(node.len(), 4);
        assert_eq!(
            paths(&node),
            vec![vec!["/a1"], vec!["/a2"], vec!["/b1"], vec!["/b2"]]
        );
    }

    #[test]
    fn test_cross_with_empty_child_is_empty() {
        let node = Node::Cross(vec![atom("a", &["/a1"]), atom("b", &[])]);
        assert_eq!(node.len(), 0);
        let mut out = Vec::new();
        assert!(!node.collect(0, &mut out));
    }

    #[test]
    fn test_nested_union_in_cross() {
        let node = Node::Cross(vec![
            atom("a", &["/a1"]),
            Node::Union(vec![atom("b", &["/b1"]), atom("c", &["/c1", "/c2"])]),
        ]);
        assert_eq!(node.len(), 3);
        assert_eq!(paths(&node)[2], vec!["/a1", "/c2"]);
    }

    #[test]
    fn test_hash_ignores_commit_but_not_content() {
        let mut a = binding("in", "/x");
        let mut b = a.clone();
        b.commit = CommitId::new();
        assert_eq!(datum_hash("p", 1, &[a.clone()]), datum_hash("p", 1, &[b.clone()]));
        assert_ne!(datum_hash("p", 1, &[a.clone()]), datum_hash("p", 2, &[b.clone()]));
        a.content_hash = ObjectHash::new("other");
        assert_ne!(datum_hash("p", 1, &[a]), datum_hash("p", 1, &[b]));
    }

    #[tokio::test]
    async fn test_expand_against_commit() {
        let graph = CommitGraph::new(
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemoryEventBus::new(16)),
        );
        graph.create_repo("data").await.unwrap();
        let commit = graph.start_commit("data", "master").await.unwrap();
        for name in ["b", "a", "c"] {
            graph
                .put_file("data", "master", &format!("/{}", name), name)
                .await
                .unwrap();
        }
        graph.finish_commit(&commit).await.unwrap();

        let input = InputSpec::Atom(AtomInput::new("data", "/*"));
        let commits = vec![InputCommit {
            name: "data".into(),
            branch: "master".into(),
            commit: commit.clone(),
        }];
        let set = DatumSet::expand(&graph, "p", 1, &input, &commits).await.unwrap();
        let found: Vec<String> = set.iter().map(|d| d.bindings[0].path.clone()).collect();
        assert_eq!(found, vec!["/a", "/b", "/c"]);

        let root = InputSpec::Atom(AtomInput::new("data", "/"));
        let set = DatumSet::expand(&graph, "p", 1, &root, &commits).await.unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(0).unwrap().bindings[0].path, "/");
        assert!(set.get(1).is_none());
    }
}
