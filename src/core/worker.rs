//! Worker identity, roles and status.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Worker roles, from the top of the hierarchy down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Top-level coordinator acting for the human operator.
    Delegate,
    /// Breaks work down and supervises specialists.
    Manager,
    /// Does the actual editing; never has children.
    Specialist,
}

/// Operations checked against a caller's role at the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Spawn(Role),
    Dispatch,
    Peek,
    Enumerate,
    Terminate,
    Merge,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Spawn(role) => write!(f, "spawn a {}", role),
            Operation::Dispatch => write!(f, "dispatch"),
            Operation::Peek => write!(f, "peek"),
            Operation::Enumerate => write!(f, "enumerate"),
            Operation::Terminate => write!(f, "terminate"),
            Operation::Merge => write!(f, "merge"),
        }
    }
}

impl Role {
    /// Short prefix used in hierarchical worker ids.
    pub fn prefix(&self) -> &'static str {
        match self {
            Role::Delegate => "del",
            Role::Manager => "mgr",
            Role::Specialist => "spec",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "del" => Some(Role::Delegate),
            "mgr" => Some(Role::Manager),
            "spec" => Some(Role::Specialist),
            _ => None,
        }
    }

    /// The role → allowed operations table.
    pub fn permits(&self, op: Operation) -> bool {
        match (self, op) {
            (Role::Delegate, Operation::Spawn(child)) => child != Role::Delegate,
            (Role::Manager, Operation::Spawn(child)) => child == Role::Specialist,
            (Role::Specialist, Operation::Spawn(_)) => false,
            (Role::Delegate | Role::Manager, _) => true,
            (Role::Specialist, Operation::Peek | Operation::Enumerate) => true,
            (Role::Specialist, _) => false,
        }
    }

    pub fn check(&self, op: Operation) -> Result<()> {
        if self.permits(op) {
            Ok(())
        } else {
            Err(Error::PermissionDenied {
                role: self.to_string(),
                operation: op.to_string(),
            })
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Delegate => write!(f, "delegate"),
            Role::Manager => write!(f, "manager"),
            Role::Specialist => write!(f, "specialist"),
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delegate" => Ok(Role::Delegate),
            "manager" => Ok(Role::Manager),
            "specialist" => Ok(Role::Specialist),
            other => Err(Error::Validation(format!("unknown role: {}", other))),
        }
    }
}

/// Hierarchical worker id: role prefix plus lineage, e.g. `spec_1_2` is the
/// second child of `mgr_1`, itself the first child of `root`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

pub const ROOT_ID: &str = "root";

impl WorkerId {
    pub fn root() -> Self {
        Self(ROOT_ID.to_string())
    }

    /// Id for a worker of `role` at `lineage` (sequence numbers from the root down).
    pub fn for_child(role: Role, lineage: &[u32]) -> Self {
        let path = lineage
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join("_");
        Self(format!("{}_{}", role.prefix(), path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT_ID
    }

    /// Role and lineage encoded in the id.
    pub fn decode(&self) -> Option<(Role, Vec<u32>)> {
        if self.is_root() {
            return Some((Role::Delegate, Vec::new()));
        }
        let mut parts = self.0.split('_');
        let role = Role::from_prefix(parts.next()?)?;
        let lineage: Option<Vec<u32>> = parts.map(|p| p.parse().ok()).collect();
        let lineage = lineage?;
        if lineage.is_empty() || lineage.contains(&0) {
            return None;
        }
        Some((role, lineage))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WorkerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let id = WorkerId(s.trim().to_string());
        match id.decode() {
            Some(_) => Ok(id),
            None => Err(Error::Validation(format!("malformed worker id: {}", s))),
        }
    }
}

impl AsRef<str> for WorkerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Spawning,
    Active,
    Blocked,
    Completed,
    Terminated,
    Error,
}

impl WorkerStatus {
    /// Whether the worker may still run (has or may get a live session).
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            WorkerStatus::Spawning | WorkerStatus::Active | WorkerStatus::Blocked
        )
    }

    pub fn can_transition_to(&self, next: WorkerStatus) -> bool {
        match self {
            WorkerStatus::Terminated => false,
            WorkerStatus::Completed | WorkerStatus::Error => next == WorkerStatus::Terminated,
            _ => true,
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerStatus::Spawning => "spawning",
            WorkerStatus::Active => "active",
            WorkerStatus::Blocked => "blocked",
            WorkerStatus::Completed => "completed",
            WorkerStatus::Terminated => "terminated",
            WorkerStatus::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkerStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spawning" => Ok(WorkerStatus::Spawning),
            "active" => Ok(WorkerStatus::Active),
            "blocked" => Ok(WorkerStatus::Blocked),
            "completed" => Ok(WorkerStatus::Completed),
            "terminated" => Ok(WorkerStatus::Terminated),
            "error" => Ok(WorkerStatus::Error),
            other => Err(Error::Validation(format!("unknown status: {}", other))),
        }
    }
}

/// One registry record. Records outlive their sessions: terminating a
/// worker destroys its session but keeps the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub role: Role,
    pub parent_id: Option<WorkerId>,
    #[serde(default)]
    pub children: Vec<WorkerId>,
    #[serde(default)]
    pub lineage: Vec<u32>,
    pub depth: u32,
    pub status: WorkerStatus,
    pub working_directory: Option<PathBuf>,
    pub branch_name: Option<String>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Optimistic-lock stamp, bumped by every guarded mutation.
    pub version: u64,
    /// Last sequence number handed to a child of this worker.
    #[serde(default)]
    pub next_child_seq: u32,
    /// Context text sent when the session starts (re-sent on restart).
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Worker {
    pub fn new(id: WorkerId, role: Role, parent_id: Option<WorkerId>, lineage: Vec<u32>) -> Self {
        let now = Utc::now();
        let depth = lineage.len() as u32;
        Self {
            id,
            role,
            parent_id,
            children: Vec::new(),
            lineage,
            depth,
            status: WorkerStatus::Spawning,
            working_directory: None,
            branch_name: None,
            session_id: None,
            created_at: now,
            last_activity_at: now,
            version: 1,
            next_child_seq: 0,
            context: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn idle_for(&self) -> std::time::Duration {
        (Utc::now() - self.last_activity_at)
            .to_std()
            .unwrap_or_default()
    }
}
