//! Workflow definitions: stages, action specs and load-time validation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::actions::ActionRegistry;
use crate::{Error, Result};

/// Context keys owned by the engine; stage ids may not shadow them.
const RESERVED_NAMESPACES: &[&str] = &["run", "stage", "loop"];

/// What happens when an action fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the chain and fail the stage.
    #[default]
    Abort,
    /// Log the failure and run the next action.
    Continue,
    /// Run the action once more, then abort. Permission, not-found and
    /// conflict errors are not retried.
    RetryOnce,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Abort => write!(f, "abort"),
            FailurePolicy::Continue => write!(f, "continue"),
            FailurePolicy::RetryOnce => write!(f, "retry_once"),
        }
    }
}

/// One entry of an action chain. `kind` selects the handler; every other
/// key is handed to it as a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(rename = "type")]
    pub kind: String,
    /// Overrides the workflow's default failure policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<FailurePolicy>,
    /// Store the action's result at `<stage>.<output>` in the run context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl ActionSpec {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            on_error: None,
            output: None,
            params: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    #[serde(alias = "prompt_template")]
    pub prompt: String,
    pub completion_marker: String,
    pub timeout_seconds: f64,
    /// Stage entered after a success chain that does not transition.
    /// Defaults to the following stage in declaration order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Worker that receives this stage's prompt (interpolated). Defaults
    /// to the run's worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_timeout_retries: Option<u32>,
    #[serde(default)]
    pub on_success: Vec<ActionSpec>,
    #[serde(default)]
    pub on_failure: Vec<ActionSpec>,
    #[serde(default)]
    pub on_timeout: Vec<ActionSpec>,
}

impl Stage {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.timeout_seconds)
    }

    fn chains(&self) -> [&[ActionSpec]; 3] {
        [&self.on_success, &self.on_failure, &self.on_timeout]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Entry stage; defaults to the first declared stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    /// Initial run context.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    pub stages: Vec<Stage>,
}

impl WorkflowDefinition {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load by extension: `.json` is JSON, anything else TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text),
            _ => Self::from_toml(&text),
        }
    }

    pub fn entry_stage(&self) -> Option<&str> {
        self.entry
            .as_deref()
            .or_else(|| self.stages.first().map(|s| s.id.as_str()))
    }

    pub fn stage(&self, id: &str) -> Result<&Stage> {
        self.stages
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::not_found("stage", id))
    }

    /// The stage entered after `id` succeeds without an explicit transition.
    pub fn successor(&self, id: &str) -> Option<&str> {
        let pos = self.stages.iter().position(|s| s.id == id)?;
        match &self.stages[pos].next {
            Some(next) => Some(next.as_str()),
            None => self.stages.get(pos + 1).map(|s| s.id.as_str()),
        }
    }

    /// Check the definition against `actions`. Called before any run starts.
    pub fn validate(&self, actions: &ActionRegistry) -> Result<()> {
        if self.stages.is_empty() {
            return Err(invalid(&self.name, "has no stages"));
        }

        let mut ids = HashSet::new();
        for stage in &self.stages {
            if stage.id.is_empty() || stage.id.contains('.') {
                return Err(invalid(
                    &self.name,
                    format!("stage id {:?} must be non-empty and contain no '.'", stage.id),
                ));
            }
            if RESERVED_NAMESPACES.contains(&stage.id.as_str()) {
                return Err(invalid(
                    &self.name,
                    format!("stage id {:?} is reserved", stage.id),
                ));
            }
            if !ids.insert(stage.id.as_str()) {
                return Err(invalid(&self.name, format!("duplicate stage id {:?}", stage.id)));
            }
            if stage.completion_marker.trim().is_empty() {
                return Err(invalid(
                    &self.name,
                    format!("stage {:?} has an empty completion marker", stage.id),
                ));
            }
            if !(stage.timeout_seconds.is_finite() && stage.timeout_seconds > 0.0) {
                return Err(invalid(
                    &self.name,
                    format!("stage {:?} needs a positive timeout", stage.id),
                ));
            }
        }

        let entry = self
            .entry_stage()
            .ok_or_else(|| invalid(&self.name, "has no entry stage"))?;
        if !ids.contains(entry) {
            return Err(invalid(&self.name, format!("entry stage {:?} does not exist", entry)));
        }

        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let nodes: HashMap<&str, NodeIndex> = self
            .stages
            .iter()
            .map(|s| (s.id.as_str(), graph.add_node(s.id.as_str())))
            .collect();

        let mut completes = false;
        for stage in &self.stages {
            let mut targets = Vec::new();
            for chain in stage.chains() {
                let summary = actions.inspect_chain(chain)?;
                completes |= summary.completes;
                targets.extend(summary.transitions);
            }
            if let Some(next) = self.successor(&stage.id) {
                targets.push(next.to_string());
            }
            for target in targets {
                // Interpolated targets can only be checked at run time
                if target.contains("{{") {
                    continue;
                }
                let to = nodes.get(target.as_str()).ok_or_else(|| {
                    invalid(
                        &self.name,
                        format!("stage {:?} transitions to unknown stage {:?}", stage.id, target),
                    )
                })?;
                graph.add_edge(nodes[stage.id.as_str()], *to, ());
            }
        }

        if !completes {
            return Err(invalid(&self.name, "no stage runs complete_workflow"));
        }

        let mut reachable = HashSet::new();
        let mut dfs = Dfs::new(&graph, nodes[entry]);
        while let Some(node) = dfs.next(&graph) {
            reachable.insert(graph[node]);
        }
        if let Some(orphan) = self.stages.iter().find(|s| !reachable.contains(s.id.as_str())) {
            return Err(invalid(
                &self.name,
                format!("stage {:?} is unreachable from {:?}", orphan.id, entry),
            ));
        }
        Ok(())
    }
}

fn invalid(workflow: &str, msg: impl fmt::Display) -> Error {
    Error::Validation(format!("workflow {:?} {}", workflow, msg))
}
