//! Declarative workflows: stages with completion markers, action chains
//! for each outcome, and an engine that persists runs as it drives them.

pub mod actions;
pub mod context;
pub mod engine;
pub mod state;
pub mod types;

pub use actions::{
    run_chain, ActionHandler, ActionOutcome, ActionRegistry, ActionScope, ChainSummary, Condition,
    Flow,
};
pub use context::RunContext;
pub use engine::{ResumeError, ResumeReport, WorkflowEngine};
pub use state::{
    FailureCause, RunId, RunListing, RunStatus, RunStore, RunSummary, StageEntry, WorkflowRun,
};
pub use types::{ActionSpec, FailurePolicy, Stage, WorkflowDefinition};
