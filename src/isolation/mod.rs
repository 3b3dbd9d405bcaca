//! Per-worker isolated working trees, file claims, conflict analysis and
//! all-or-nothing repository mutations.

pub mod atomic;
mod conflict;
mod lease;
mod manager;

pub use atomic::{atomic_operation, AtomicStep};
pub use conflict::{analyze_conflicts, is_auto_resolvable, ConflictReport};
pub use lease::{branch_name, lease_key, worktree_path, LeaseTable, WorkTreeLease};
pub use manager::{file_lock_key, IsolationManager, MergeOutcome, ReleaseOptions, ReleaseOutcome};
