//! Workflow run state and its durable store.
//!
//! A `WorkflowRun` carries its own copy of the definition, so a run can be
//! resumed after a restart without the original file.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::context::RunContext;
use super::types::WorkflowDefinition;
use crate::core::WorkerId;
use crate::error::ErrorKind;
use crate::state::{JsonStore, Quarantined};
use crate::{Error, Result};

/// Unique identifier for a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| Error::Validation(format!("invalid run id {:?}: {}", s, e)))
    }
}

/// Status of a run in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but not yet started
    #[default]
    Pending,
    /// A stage is in progress
    Running,
    /// A chain ran `complete_workflow`
    Completed,
    /// A stage failed with no recovery
    Failed,
    /// The run's worker was terminated
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Aborted
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// One link of a failed run's cause chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

impl FailureCause {
    pub fn from_error(stage: &str, error: &Error) -> Self {
        let action = match error {
            Error::ActionFailed { action, .. } => Some(action.clone()),
            _ => None,
        };
        Self {
            stage: stage.to_string(),
            action,
            kind: error.kind(),
            message: error.root_cause().to_string(),
        }
    }
}

/// A record of a stage entry with timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEntry {
    pub stage: String,
    pub entered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub definition: WorkflowDefinition,
    /// Worker that receives stage prompts by default.
    pub worker_id: WorkerId,
    /// Identity the run acts as when it calls the coordinator.
    pub owner: WorkerId,
    pub current_stage: String,
    pub context: RunContext,
    pub status: RunStatus,
    /// Timeouts seen per stage.
    #[serde(default)]
    pub timeout_retries: BTreeMap<String, u32>,
    #[serde(default)]
    pub history: Vec<StageEntry>,
    #[serde(default)]
    pub failure: Vec<FailureCause>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// A pending run at the definition's entry stage. Built-in `run.*`
    /// variables are seeded on top of the definition's variables and
    /// `overrides`.
    pub fn new(
        definition: WorkflowDefinition,
        worker_id: WorkerId,
        owner: WorkerId,
        overrides: BTreeMap<String, Value>,
    ) -> Result<Self> {
        let entry = definition
            .entry_stage()
            .ok_or_else(|| Error::Validation(format!("workflow {:?} has no stages", definition.name)))?
            .to_string();
        let id = RunId::new();
        let mut context = RunContext::new();
        for (key, value) in definition.variables.iter().chain(overrides.iter()) {
            context.set(key, value.clone())?;
        }
        context.set("run.id", Value::String(id.to_string()))?;
        context.set("run.worker", Value::String(worker_id.to_string()))?;
        context.set("run.workflow", Value::String(definition.name.clone()))?;

        let now = Utc::now();
        Ok(Self {
            id,
            definition,
            worker_id,
            owner,
            current_stage: entry,
            context,
            status: RunStatus::Pending,
            timeout_retries: BTreeMap::new(),
            history: Vec::new(),
            failure: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn retries(&self, stage: &str) -> u32 {
        self.timeout_retries.get(stage).copied().unwrap_or(0)
    }

    /// Record a timeout on `stage`, returning the new count.
    pub fn bump_timeout(&mut self, stage: &str) -> u32 {
        let count = self.timeout_retries.entry(stage.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Move to `stage` and refresh the `stage.*` built-ins.
    pub fn enter(&mut self, stage: &str) -> Result<()> {
        self.definition.stage(stage)?;
        self.current_stage = stage.to_string();
        self.history.push(StageEntry {
            stage: stage.to_string(),
            entered_at: Utc::now(),
        });
        self.refresh_stage_vars()
    }

    pub fn refresh_stage_vars(&mut self) -> Result<()> {
        let attempt = self.retries(&self.current_stage) + 1;
        self.context
            .set("stage.id", Value::String(self.current_stage.clone()))?;
        self.context.set("stage.attempt", Value::from(attempt))
    }
}

/// Summary row for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub id: RunId,
    pub workflow: String,
    pub worker_id: WorkerId,
    pub current_stage: String,
    pub status: RunStatus,
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkflowRun> for RunSummary {
    fn from(run: &WorkflowRun) -> Self {
        Self {
            id: run.id,
            workflow: run.definition.name.clone(),
            worker_id: run.worker_id.clone(),
            current_stage: run.current_stage.clone(),
            status: run.status,
            updated_at: run.updated_at,
        }
    }
}

/// Runs loaded from disk, plus the records that failed to decode.
#[derive(Debug, Clone, Default)]
pub struct RunListing {
    pub runs: Vec<WorkflowRun>,
    pub quarantined: Vec<Quarantined>,
}

/// Durable table of workflow runs. Runs are independent records, so each
/// save is a read-modify-write of one key under the store's lock file.
#[derive(Debug, Clone)]
pub struct RunStore {
    store: JsonStore,
}

impl RunStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path, "workflow runs"),
        }
    }

    pub fn save(&self, run: &WorkflowRun) -> Result<()> {
        let value = serde_json::to_value(run)?;
        let key = run.id.to_string();
        self.store.update(move |records| {
            records.insert(key, value);
            Ok(())
        })
    }

    pub fn load(&self, id: &RunId) -> Result<WorkflowRun> {
        let raw = self.store.load_raw()?;
        let value = raw
            .records
            .get(&id.to_string())
            .ok_or_else(|| Error::not_found("workflow run", id.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|e| Error::Corruption {
            what: format!("workflow run {}", id),
            reason: e.to_string(),
        })
    }

    pub fn list(&self) -> Result<RunListing> {
        let report = self.store.load::<WorkflowRun>()?;
        let mut runs: Vec<WorkflowRun> = report.records.into_values().collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(RunListing {
            runs,
            quarantined: report.quarantined,
        })
    }
}
