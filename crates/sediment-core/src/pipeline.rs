//! Pipeline definition types.
//!
//! A pipeline binds a transform to an input-spec tree and an output repo.
//! These types are what users author (usually as YAML) and what the
//! scheduler stores as versioned records.

use crate::ids::PipelineId;
use crate::repo::{Branch, DEFAULT_BRANCH, is_valid_name};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineSpec {
    pub name: String,
    pub transform: Transform,
    #[serde(default)]
    pub parallelism: Option<ParallelismSpec>,
    pub input: InputSpec,
    #[serde(default = "default_output_branch")]
    pub output_branch: String,
    /// Idle time after which the worker pool is scaled to zero.
    #[serde(default)]
    pub scale_down_threshold_ms: Option<u64>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_output_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Transform {
    #[serde(default)]
    pub image: Option<String>,
    pub cmd: Vec<String>,
    #[serde(default)]
    pub stdin: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Exit codes other than 0 that still count as success.
    #[serde(default)]
    pub accept_return_code: Vec<i32>,
}

impl Transform {
    pub fn accepts(&self, exit_code: i32) -> bool {
        exit_code == 0 || self.accept_return_code.contains(&exit_code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ParallelismSpec {
    Constant(u64),
    Coefficient(f64),
}

/// Input-spec tree. Leaves match files, inner nodes combine datum streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InputSpec {
    Atom(AtomInput),
    Cross(Vec<InputSpec>),
    Union(Vec<InputSpec>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AtomInput {
    /// Logical name the worker sees. Defaults to the repo name.
    #[serde(default)]
    pub name: Option<String>,
    pub repo: String,
    #[serde(default = "default_input_branch")]
    pub branch: String,
    pub glob: String,
    #[serde(default)]
    pub lazy: bool,
}

fn default_input_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

impl AtomInput {
    pub fn new(repo: impl Into<String>, glob: impl Into<String>) -> Self {
        Self {
            name: None,
            repo: repo.into(),
            branch: default_input_branch(),
            glob: glob.into(),
            lazy: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn on_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn leaf_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.repo)
    }
}

impl InputSpec {
    pub fn atom(repo: impl Into<String>, glob: impl Into<String>) -> Self {
        InputSpec::Atom(AtomInput::new(repo, glob))
    }

    /// All leaves in depth-first, left-to-right order.
    pub fn atoms(&self) -> Vec<&AtomInput> {
        let mut out = Vec::new();
        self.collect_atoms(&mut out);
        out
    }

    fn collect_atoms<'a>(&'a self, out: &mut Vec<&'a AtomInput>) {
        match self {
            InputSpec::Atom(atom) => out.push(atom),
            InputSpec::Cross(children) | InputSpec::Union(children) => {
                for child in children {
                    child.collect_atoms(out);
                }
            }
        }
    }

    /// Whether any leaf reads `repo` on `branch`.
    pub fn references(&self, repo: &str, branch: &str) -> bool {
        self.atoms()
            .iter()
            .any(|a| a.repo == repo && a.branch == branch)
    }

    /// Distinct branches read by this input, in leaf order.
    pub fn branches(&self) -> Vec<Branch> {
        let mut branches: Vec<Branch> = Vec::new();
        for atom in self.atoms() {
            let branch = Branch::new(&atom.repo, &atom.branch);
            if !branches.contains(&branch) {
                branches.push(branch);
            }
        }
        branches
    }

    /// Distinct repos read by this input, in leaf order.
    pub fn repos(&self) -> Vec<String> {
        let mut repos: Vec<String> = Vec::new();
        for atom in self.atoms() {
            if !repos.contains(&atom.repo) {
                repos.push(atom.repo.clone());
            }
        }
        repos
    }

    /// Check the shape of the tree without consulting any store.
    pub fn validate(&self) -> Result<()> {
        self.validate_node()?;

        let atoms = self.atoms();
        let mut seen: HashMap<&str, &AtomInput> = HashMap::new();
        for atom in &atoms {
            if let Some(previous) = seen.insert(atom.leaf_name(), atom) {
                return Err(Error::InvalidPipeline(format!(
                    "ambiguous input name {}: used by inputs on {}@{} and {}@{}",
                    atom.leaf_name(),
                    previous.repo,
                    previous.branch,
                    atom.repo,
                    atom.branch
                )));
            }
        }

        for (i, a) in atoms.iter().enumerate() {
            for b in &atoms[i + 1..] {
                if a.repo == b.repo && (a.name.is_none() || b.name.is_none()) {
                    return Err(Error::InvalidPipeline(format!(
                        "inputs from the same repo {} must be explicitly named",
                        a.repo
                    )));
                }
            }
        }

        Ok(())
    }

    fn validate_node(&self) -> Result<()> {
        match self {
            InputSpec::Atom(atom) => {
                if atom.repo.is_empty() {
                    return Err(Error::InvalidPipeline("input repo must be set".into()));
                }
                if atom.glob.is_empty() {
                    return Err(Error::InvalidPipeline(format!(
                        "input {} has an empty glob",
                        atom.leaf_name()
                    )));
                }
                if atom.branch.is_empty() {
                    return Err(Error::InvalidPipeline(format!(
                        "input {} has an empty branch",
                        atom.leaf_name()
                    )));
                }
                Ok(())
            }
            InputSpec::Cross(children) | InputSpec::Union(children) => {
                if children.is_empty() {
                    return Err(Error::InvalidPipeline(
                        "cross and union inputs need at least one child".into(),
                    ));
                }
                children.iter().try_for_each(InputSpec::validate_node)
            }
        }
    }
}

impl PipelineSpec {
    pub fn new(name: impl Into<String>, cmd: Vec<String>, input: InputSpec) -> Self {
        Self {
            name: name.into(),
            transform: Transform {
                cmd,
                ..Default::default()
            },
            parallelism: None,
            input,
            output_branch: default_output_branch(),
            scale_down_threshold_ms: None,
            description: None,
        }
    }

    /// Structural validation. Repo existence and DAG checks happen in the
    /// scheduler, which owns the stores.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_name(&self.name) {
            return Err(Error::InvalidPipeline(format!(
                "pipeline name {:?} must be letters, digits, '-' or '_'",
                self.name
            )));
        }
        if self.transform.cmd.is_empty() {
            return Err(Error::InvalidPipeline(format!(
                "pipeline {} has no command",
                self.name
            )));
        }
        if let Some(ParallelismSpec::Coefficient(c)) = self.parallelism
            && (c.is_nan() || c < 0.0)
        {
            return Err(Error::InvalidPipeline(format!(
                "parallelism coefficient {} must be a non-negative number",
                c
            )));
        }
        self.input.validate()?;
        if self.input.repos().iter().any(|r| r == &self.name) {
            return Err(Error::InvalidPipeline(format!(
                "pipeline {} cannot read its own output repo",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Running,
    Stopped,
}

/// One version of a pipeline. Updates append a new record rather than
/// mutating this one.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineInfo {
    pub id: PipelineId,
    pub name: String,
    pub version: u64,
    pub spec: PipelineSpec,
    pub state: PipelineState,
    pub output_repo: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineInfo {
    pub fn is_running(&self) -> bool {
        self.state == PipelineState::Running
    }

    /// Name of the worker pool owned by this pipeline.
    pub fn pool_id(&self) -> String {
        format!("pipeline-{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_pipeline_yaml() {
        let yaml = r#"
name: wordcount
transform:
  cmd: ["sh"]
  stdin: ["wc -w /pfs/words/* > /pfs/out/count"]
  accept_return_code: [1]
parallelism:
  coefficient: 0.5
input:
  cross:
    - atom:
        repo: words
        glob: "/*"
    - atom:
        repo: stopwords
        glob: "/"
        lazy: true
"#;
        let spec: PipelineSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.name, "wordcount");
        assert_eq!(spec.output_branch, "master");
        assert_eq!(spec.parallelism, Some(ParallelismSpec::Coefficient(0.5)));
        assert!(spec.transform.accepts(1));
        assert!(!spec.transform.accepts(2));

        let atoms = spec.input.atoms();
        assert_eq!(atoms.len(), 2);
        assert_eq!(atoms[0].leaf_name(), "words");
        assert_eq!(atoms[0].branch, "master");
        assert!(atoms[1].lazy);
        spec.validate().unwrap();
    }

    #[test]
    fn test_same_repo_requires_names() {
        let input = InputSpec::Cross(vec![
            InputSpec::atom("data", "/a*"),
            InputSpec::atom("data", "/b*"),
        ]);
        assert!(input.validate().is_err());

        let input = InputSpec::Cross(vec![
            InputSpec::Atom(AtomInput::new("data", "/a*").named("a")),
            InputSpec::atom("data", "/b*"),
        ]);
        assert!(input.validate().is_err());

        let input = InputSpec::Cross(vec![
            InputSpec::Atom(AtomInput::new("data", "/a*").named("a")),
            InputSpec::Atom(AtomInput::new("data", "/b*").named("b")),
        ]);
        input.validate().unwrap();
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let input = InputSpec::Union(vec![
            InputSpec::Atom(AtomInput::new("left", "/*").named("in")),
            InputSpec::Atom(AtomInput::new("right", "/*").named("in")),
        ]);
        let err = input.validate().unwrap_err();
        assert!(err.to_string().contains("ambiguous input name in"));
    }

    #[test]
    fn test_empty_combinator_rejected() {
        assert!(InputSpec::Cross(vec![]).validate().is_err());
        assert!(InputSpec::Union(vec![InputSpec::Cross(vec![])]).validate().is_err());
    }

    #[test]
    fn test_pipeline_cannot_read_itself() {
        let spec = PipelineSpec::new("loop", vec!["true".into()], InputSpec::atom("loop", "/"));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_references() {
        let input = InputSpec::Union(vec![
            InputSpec::atom("a", "/*"),
            InputSpec::Atom(AtomInput::new("b", "/*").on_branch("dev")),
        ]);
        assert!(input.references("a", "master"));
        assert!(input.references("b", "dev"));
        assert!(!input.references("b", "master"));
        assert_eq!(input.repos(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_branches_are_distinct_per_repo_and_name() {
        let input = InputSpec::Cross(vec![
            InputSpec::Atom(AtomInput::new("a", "/*").named("left")),
            InputSpec::Atom(AtomInput::new("a", "/").named("right")),
            InputSpec::Atom(AtomInput::new("a", "/*").named("dev").on_branch("dev")),
        ]);
        assert_eq!(
            input.branches(),
            vec![Branch::new("a", "master"), Branch::new("a", "dev")]
        );
        assert_eq!(input.repos(), vec!["a".to_string()]);
    }
}
