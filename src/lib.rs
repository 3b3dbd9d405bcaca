//! Conductor: a hierarchical coordinator for terminal-hosted AI workers.
//!
//! Workers form a tree (one root Delegate, Managers under it, Specialists
//! under Managers). Each lives in its own terminal session, optionally in
//! its own git worktree, and is driven through five operations on
//! [`coordinator::Coordinator`]: spawn, dispatch, peek, enumerate and
//! terminate. Declarative workflows in [`workflow`] sequence prompts and
//! completion markers on top of those operations.

pub mod config;
pub mod coordinator;
pub mod core;
pub mod error;
pub mod git;
pub mod isolation;
pub mod log;
pub mod orchestration;
pub mod registry;
pub mod state;
pub mod tmux;
pub mod transport;
pub mod util;
pub mod workflow;

pub use coordinator::{Coordinator, Envelope, SpawnRequest};
pub use error::{Error, ErrorKind, Result};
