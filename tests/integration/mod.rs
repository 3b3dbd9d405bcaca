//! Integration test suite for conductor.
//!
//! These tests drive a real coordinator, registry and worktree manager
//! against temporary state directories and git repositories. Worker
//! sessions are simulated by the in-memory transport.
//!
//! # Test Categories
//!
//! - `registry`: Worker tree lifecycle and role enforcement
//! - `isolation`: Worktree leases, claims, conflicts and merge-back
//! - `locks`: TTL locks and Specialist slots
//! - `workflow`: Workflow runs against simulated workers
//! - `health`: Probing and session recovery
//!
//! # CI Compatibility
//!
//! No tmux server or AI CLI is needed, making them safe to run in CI
//! environments.

mod fixtures;

mod registry;
mod isolation;
mod locks;
mod workflow;
mod health;
