//! DAG of pipelines.
//!
//! A pipeline depends on another when one of its inputs reads the other's
//! output repo.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use sediment_core::pipeline::PipelineSpec;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DagError {
    #[error("Cycle detected in pipeline dependencies")]
    CycleDetected,
    #[error("Duplicate pipeline: {0}")]
    DuplicatePipeline(String),
}

impl From<DagError> for sediment_core::Error {
    fn from(err: DagError) -> Self {
        sediment_core::Error::InvalidPipeline(err.to_string())
    }
}

/// A node in the pipeline DAG.
#[derive(Debug, Clone)]
pub struct DagNode {
    pub name: String,
    pub spec: PipelineSpec,
}

#[derive(Debug)]
pub struct PipelineDag {
    graph: DiGraph<DagNode, ()>,
    name_to_index: HashMap<String, NodeIndex>,
}

impl PipelineDag {
    /// Pipelines reading only user repos.
    pub fn roots(&self) -> Vec<&DagNode> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, petgraph::Direction::Incoming)
                    .count()
                    == 0
            })
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    /// Pipelines reading the output of `name`.
    pub fn successors(&self, name: &str) -> Vec<&DagNode> {
        self.name_to_index
            .get(name)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, petgraph::Direction::Outgoing)
                    .filter_map(|n| self.graph.node_weight(n))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Pipelines whose output `name` reads.
    pub fn predecessors(&self, name: &str) -> Vec<&DagNode> {
        self.name_to_index
            .get(name)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, petgraph::Direction::Incoming)
                    .filter_map(|n| self.graph.node_weight(n))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Pipelines with every upstream pipeline before its dependents.
    pub fn topological_order(&self) -> Result<Vec<&DagNode>, DagError> {
        toposort(&self.graph, None)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|&idx| self.graph.node_weight(idx))
                    .collect()
            })
            .map_err(|_| DagError::CycleDetected)
    }

    pub fn pipelines(&self) -> Vec<&DagNode> {
        self.graph
            .node_indices()
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.name_to_index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}

/// Builder for constructing pipeline DAGs.
pub struct DagBuilder;

impl DagBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build a DAG from pipeline specs. Inputs on repos that are not the
    /// output of a listed pipeline add no edge.
    pub fn build<'a>(
        &self,
        specs: impl IntoIterator<Item = &'a PipelineSpec>,
    ) -> Result<PipelineDag, DagError> {
        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();

        let specs: Vec<&PipelineSpec> = specs.into_iter().collect();
        for spec in &specs {
            if name_to_index.contains_key(&spec.name) {
                return Err(DagError::DuplicatePipeline(spec.name.clone()));
            }
            let idx = graph.add_node(DagNode {
                name: spec.name.clone(),
                spec: (*spec).clone(),
            });
            name_to_index.insert(spec.name.clone(), idx);
        }

        for spec in &specs {
            let idx = name_to_index[&spec.name];
            for repo in spec.input.repos() {
                if let Some(&upstream) = name_to_index.get(&repo) {
                    graph.update_edge(upstream, idx, ());
                }
            }
        }

        let dag = PipelineDag {
            graph,
            name_to_index,
        };

        dag.topological_order()?;

        Ok(dag)
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sediment_core::pipeline::{AtomInput, InputSpec};

    fn spec(name: &str, inputs: &[&str]) -> PipelineSpec {
        let input = if inputs.len() == 1 {
            InputSpec::atom(inputs[0], "/*")
        } else {
            InputSpec::Cross(
                inputs
                    .iter()
                    .map(|r| InputSpec::Atom(AtomInput::new(*r, "/*")))
                    .collect(),
            )
        };
        PipelineSpec::new(name, vec!["true".into()], input)
    }

    #[test]
    fn test_diamond_order() {
        let specs = vec![
            spec("c", &["a", "b"]),
            spec("b", &["a"]),
        ];
        let dag = DagBuilder::new().build(&specs).unwrap();

        let order: Vec<&str> = dag
            .topological_order()
            .unwrap()
            .iter()
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(order, vec!["b", "c"]);

        let roots = dag.roots();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].name, "b");
        assert_eq!(dag.successors("b").len(), 1);
        assert_eq!(dag.predecessors("c")[0].name, "b");
    }

    #[test]
    fn test_cycle_rejected() {
        let specs = vec![spec("x", &["y"]), spec("y", &["x"])];
        assert!(matches!(
            DagBuilder::new().build(&specs),
            Err(DagError::CycleDetected)
        ));
    }

    #[test]
    fn test_duplicate_rejected() {
        let specs = vec![spec("x", &["a"]), spec("x", &["b"])];
        assert!(matches!(
            DagBuilder::new().build(&specs),
            Err(DagError::DuplicatePipeline(_))
        ));
    }
}
