//! Orchestration layer: completion detection, scheduling and health.
//!
//! The pieces here are independent of one another and are composed by the
//! `Coordinator`: the detector decides when a worker has answered, the
//! governor, lock manager and batcher keep concurrent work in bounds, and
//! the health monitor restarts workers that stop responding.

pub mod batch;
pub mod cache;
pub mod detector;
pub mod governor;
pub mod health;
pub mod locks;
pub mod retry;

pub use batch::DispatchBatcher;
pub use cache::QueryCache;
pub use detector::{Cues, Cursor, Detection, Detector, WatchOutcome};
pub use governor::{Governor, Priority, SlotPermit};
pub use health::{
    HealthConfig, HealthEvent, HealthMonitor, ProbeResult, RecoveryAction, RestartTracker,
};
pub use locks::{LockInfo, TtlLockManager};
pub use retry::{retry_transient, RetryPolicy};
