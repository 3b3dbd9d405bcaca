use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification every error reports, used by retry policy,
/// the CLI envelope and workflow failure causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PermissionDenied,
    NotFound,
    Conflict,
    Timeout,
    #[serde(rename = "transient_io")]
    TransientIo,
    Corruption,
    Validation,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Timeout => "timeout",
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::Corruption => "corruption",
            ErrorKind::Validation => "validation",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Only transient subprocess/transport failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientIo)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The different ways a guarded mutation can collide with existing state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    VersionMismatch { id: String, expected: u64, actual: u64 },
    RevisionMismatch { what: String, expected: u64, actual: u64 },
    BranchExists(String),
    WorktreeExists(PathBuf),
    MergeConflicts { files: Vec<String> },
    LockHeld { key: String, holder: String },
    CapacityReached { parent: String, limit: usize },
    InvalidState(String),
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::VersionMismatch {
                id,
                expected,
                actual,
            } => write!(
                f,
                "{} changed since read (expected version {}, found {})",
                id, expected, actual
            ),
            ConflictKind::RevisionMismatch {
                what,
                expected,
                actual,
            } => write!(
                f,
                "{} was rewritten concurrently (expected revision {}, found {})",
                what, expected, actual
            ),
            ConflictKind::BranchExists(branch) => write!(f, "branch already exists: {}", branch),
            ConflictKind::WorktreeExists(path) => {
                write!(f, "worktree already exists: {}", path.display())
            }
            ConflictKind::MergeConflicts { files } => {
                write!(f, "conflicting files: {}", files.join(", "))
            }
            ConflictKind::LockHeld { key, holder } => {
                write!(f, "{} is held by {}", key, holder)
            }
            ConflictKind::CapacityReached { parent, limit } => {
                write!(f, "{} already has {} specialists", parent, limit)
            }
            ConflictKind::InvalidState(msg) => f.write_str(msg),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Tmux error: {0}")]
    Tmux(String),

    #[error("Permission denied: {role} may not {operation}")]
    PermissionDenied { role: String, operation: String },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(ConflictKind),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    #[error("Corrupt {what}: {reason}")]
    Corruption { what: String, reason: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Operation '{operation}' rolled back: {source}")]
    RolledBack {
        operation: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Action '{action}' failed in stage '{stage}': {source}")]
    ActionFailed {
        stage: String,
        action: String,
        #[source]
        source: Box<Error>,
    },

    /// One failure handed to several waiters (a cache fill they all joined).
    #[error(transparent)]
    Shared(std::sync::Arc<Error>),
}

impl Error {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            what,
            id: id.into(),
        }
    }

    pub fn conflict(kind: ConflictKind) -> Self {
        Error::Conflict(kind)
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::Conflict(ConflictKind::InvalidState(msg.into()))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::Tmux(_) | Error::TransientIo(_) => ErrorKind::TransientIo,
            Error::Git(e) => match e.code() {
                git2::ErrorCode::NotFound => ErrorKind::NotFound,
                git2::ErrorCode::Exists
                | git2::ErrorCode::Conflict
                | git2::ErrorCode::MergeConflict
                | git2::ErrorCode::Uncommitted => ErrorKind::Conflict,
                git2::ErrorCode::Locked => ErrorKind::TransientIo,
                _ => ErrorKind::Internal,
            },
            Error::Json(_) | Error::TomlParse(_) | Error::TomlSerialize(_) => {
                ErrorKind::Validation
            }
            Error::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Corruption { .. } => ErrorKind::Corruption,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::NoHomeDir | Error::TaskJoin(_) => ErrorKind::Internal,
            Error::RolledBack { source, .. } | Error::ActionFailed { source, .. } => source.kind(),
            Error::Shared(source) => source.kind(),
        }
    }

    /// The innermost error once rollback and action wrappers are peeled off.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::RolledBack { source, .. } | Error::ActionFailed { source, .. } => {
                source.root_cause()
            }
            Error::Shared(source) => source.root_cause(),
            other => other,
        }
    }

    /// Take back an error shared through an `Arc`, wrapping it only when
    /// other holders still have it.
    pub fn unshare(shared: std::sync::Arc<Error>) -> Self {
        std::sync::Arc::try_unwrap(shared).unwrap_or_else(Error::Shared)
    }

    pub fn is_version_mismatch(&self) -> bool {
        matches!(
            self,
            Error::Conflict(ConflictKind::VersionMismatch { .. })
        )
    }

    pub fn is_revision_mismatch(&self) -> bool {
        matches!(
            self,
            Error::Conflict(ConflictKind::RevisionMismatch { .. })
        )
    }

    /// Files reported by a refused merge, if this is one.
    pub fn conflicting_files(&self) -> Option<&[String]> {
        match self.root_cause() {
            Error::Conflict(ConflictKind::MergeConflicts { files }) => Some(files),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
