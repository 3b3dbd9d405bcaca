//! Drives workflow runs through their stages.
//!
//! A stage is: interpolate the prompt, dispatch it, watch for the
//! completion marker, then run the chain matching the outcome. Runs are
//! committed on every stage entry and on terminal status, so a restarted
//! coordinator picks them up with [`WorkflowEngine::resume_all`].

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::actions::{run_chain, ActionRegistry, ActionScope, Flow};
use super::state::{FailureCause, RunId, RunListing, RunStatus, RunSummary, WorkflowRun};
use super::types::{Stage, WorkflowDefinition};
use crate::config::WorkflowConfig;
use crate::coordinator::Coordinator;
use crate::core::WorkerId;
use crate::error::ErrorKind;
use crate::orchestration::detector::WatchOutcome;
use crate::state::Quarantined;
use crate::util::blocking;
use crate::workflow::state::RunStore;
use crate::{clog, clog_debug, clog_warn, Error, Result};

/// How a stage left the run.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StageEnd {
    Enter(String),
    Complete,
    Failed,
    Aborted(String),
    /// The engine is shutting down; the run stays `running`.
    Suspended,
}

/// Outcome of [`WorkflowEngine::resume_all`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResumeReport {
    pub resumed: Vec<RunSummary>,
    pub errors: Vec<ResumeError>,
    pub quarantined: Vec<Quarantined>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResumeError {
    pub run: RunId,
    pub kind: ErrorKind,
    pub message: String,
}

pub struct WorkflowEngine {
    coordinator: Arc<Coordinator>,
    actions: Arc<ActionRegistry>,
    store: RunStore,
    config: WorkflowConfig,
    cancel: CancellationToken,
}

impl WorkflowEngine {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self::with_actions(coordinator, ActionRegistry::with_builtins())
    }

    /// An engine with a custom action vocabulary.
    pub fn with_actions(coordinator: Arc<Coordinator>, actions: ActionRegistry) -> Self {
        let store = RunStore::new(coordinator.paths().runs());
        let config = coordinator.config().workflow.clone();
        Self {
            coordinator,
            actions: Arc::new(actions),
            store,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    /// Stop driving runs. In-flight runs are left `running` so a later
    /// `resume` continues them.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Validate `definition` and commit a pending run for it.
    pub async fn create_run(
        &self,
        definition: WorkflowDefinition,
        worker: WorkerId,
        owner: WorkerId,
        overrides: BTreeMap<String, Value>,
    ) -> Result<WorkflowRun> {
        definition.validate(&self.actions)?;
        let record = self.coordinator.registry().get(&worker).await?;
        if !record.status.is_live() {
            return Err(Error::invalid_state(format!(
                "cannot run a workflow on {} ({})",
                worker, record.status
            )));
        }
        let run = WorkflowRun::new(definition, worker, owner, overrides)?;
        self.commit(&run).await?;
        clog!(
            "Created run {} of {} on {}",
            run.id.short(),
            run.definition.name,
            run.worker_id
        );
        Ok(run)
    }

    /// Create a run and drive it until it ends.
    pub async fn start(
        &self,
        definition: WorkflowDefinition,
        worker: WorkerId,
        owner: WorkerId,
        overrides: BTreeMap<String, Value>,
    ) -> Result<WorkflowRun> {
        let run = self.create_run(definition, worker, owner, overrides).await?;
        self.drive(run).await
    }

    pub async fn get(&self, id: &RunId) -> Result<WorkflowRun> {
        let store = self.store.clone();
        let id = *id;
        blocking(move || store.load(&id)).await
    }

    pub async fn list(&self) -> Result<RunListing> {
        let store = self.store.clone();
        blocking(move || store.list()).await
    }

    /// Continue a run from its committed stage, re-sending that stage's
    /// prompt. Terminal runs are returned unchanged.
    pub async fn resume(&self, id: &RunId) -> Result<WorkflowRun> {
        let run = self.get(id).await?;
        if run.status.is_terminal() {
            clog_debug!("Run {} is already {}", id.short(), run.status);
            return Ok(run);
        }
        clog!("Resuming run {} at stage {}", id.short(), run.current_stage);
        self.drive(run).await
    }

    /// Resume every non-terminal run concurrently.
    pub async fn resume_all(&self) -> Result<ResumeReport> {
        let listing = self.list().await?;
        for q in &listing.quarantined {
            clog_warn!("Skipping unreadable run {}: {}", q.key, q.reason);
        }
        let pending: Vec<RunId> = listing
            .runs
            .iter()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.id)
            .collect();

        let results = join_all(pending.iter().map(|id| self.resume(id))).await;

        let mut report = ResumeReport {
            quarantined: listing.quarantined,
            ..Default::default()
        };
        for (id, result) in pending.into_iter().zip(results) {
            match result {
                Ok(run) => report.resumed.push(RunSummary::from(&run)),
                Err(e) => {
                    clog_warn!("Resuming run {} failed: {}", id.short(), e);
                    report.errors.push(ResumeError {
                        run: id,
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    async fn commit(&self, run: &WorkflowRun) -> Result<()> {
        let store = self.store.clone();
        let snapshot = run.clone();
        blocking(move || store.save(&snapshot)).await
    }

    async fn drive(&self, mut run: WorkflowRun) -> Result<WorkflowRun> {
        run.status = RunStatus::Running;
        let current = run.current_stage.clone();
        run.enter(&current)?;

        loop {
            run.updated_at = chrono::Utc::now();
            self.commit(&run).await?;

            let stage = run.definition.stage(&run.current_stage)?.clone();
            clog_debug!("Run {} entering stage {}", run.id.short(), stage.id);

            match self.execute_stage(&mut run, &stage).await? {
                StageEnd::Enter(next) => {
                    if let Err(e) = run.enter(&next) {
                        run.failure.push(FailureCause::from_error(&stage.id, &e));
                        return self.finish(run, RunStatus::Failed).await;
                    }
                }
                StageEnd::Complete => return self.finish(run, RunStatus::Completed).await,
                StageEnd::Failed => return self.finish(run, RunStatus::Failed).await,
                StageEnd::Aborted(reason) => {
                    clog_warn!("Run {} aborted: {}", run.id.short(), reason);
                    return self.finish(run, RunStatus::Aborted).await;
                }
                StageEnd::Suspended => {
                    clog!(
                        "Run {} suspended at stage {}",
                        run.id.short(),
                        run.current_stage
                    );
                    self.commit(&run).await?;
                    return Ok(run);
                }
            }
        }
    }

    async fn finish(&self, mut run: WorkflowRun, status: RunStatus) -> Result<WorkflowRun> {
        run.status = status;
        run.updated_at = chrono::Utc::now();
        self.commit(&run).await?;
        clog!(
            "Run {} of {} {} at stage {}",
            run.id.short(),
            run.definition.name,
            status,
            run.current_stage
        );
        Ok(run)
    }

    fn scope(&self, run: &WorkflowRun, stage: &Stage, worker: WorkerId) -> ActionScope {
        ActionScope {
            coordinator: self.coordinator.clone(),
            actions: self.actions.clone(),
            run_id: run.id,
            stage: stage.id.clone(),
            worker,
            owner: run.owner.clone(),
            default_policy: self.config.default_failure_policy,
            cancel: self.cancel.child_token(),
        }
    }

    async fn execute_stage(&self, run: &mut WorkflowRun, stage: &Stage) -> Result<StageEnd> {
        let worker = match &stage.worker {
            Some(template) => match run.context.interpolate(template).parse::<WorkerId>() {
                Ok(id) => id,
                Err(e) => {
                    run.failure.push(FailureCause::from_error(&stage.id, &e));
                    return Ok(StageEnd::Failed);
                }
            },
            None => run.worker_id.clone(),
        };
        let scope = self.scope(run, stage, worker);

        let error = match self.attempt_stage(run, stage, &scope).await {
            Ok(end) => return Ok(end),
            Err(e) => e,
        };
        if self.cancel.is_cancelled() {
            return Ok(StageEnd::Suspended);
        }
        if let Some(reason) = self.worker_gone(&scope.worker).await {
            return Ok(StageEnd::Aborted(reason));
        }
        self.handle_failure(run, stage, &scope, error).await
    }

    async fn attempt_stage(
        &self,
        run: &mut WorkflowRun,
        stage: &Stage,
        scope: &ActionScope,
    ) -> Result<StageEnd> {
        let prompt = run.context.interpolate(&stage.prompt);
        let cursor = self.coordinator.cursor(&scope.worker).await?;
        self.coordinator
            .dispatch(&scope.owner, &scope.worker, &prompt)
            .await?;

        loop {
            let outcome = self
                .coordinator
                .watch(
                    &scope.worker,
                    &stage.completion_marker,
                    stage.timeout(),
                    &cursor,
                    &self.cancel,
                )
                .await?;

            match outcome {
                WatchOutcome::Detected { block, .. } => {
                    clog_debug!("Run {}: stage {} answered", run.id.short(), stage.id);
                    run.context
                        .set(&format!("{}.response", stage.id), Value::String(block))?;
                    let flow = run_chain(scope, &mut run.context, &stage.on_success).await?;
                    return self.follow(run, stage, flow);
                }
                WatchOutcome::Timeout { tail } => {
                    let count = run.bump_timeout(&stage.id);
                    run.refresh_stage_vars()?;
                    run.context
                        .set(&format!("{}.last_output", stage.id), Value::String(tail))?;
                    run.updated_at = chrono::Utc::now();
                    self.commit(run).await?;

                    let ceiling = stage
                        .max_timeout_retries
                        .unwrap_or(self.config.max_timeout_retries);
                    clog_warn!(
                        "Run {}: stage {} timed out ({}/{})",
                        run.id.short(),
                        stage.id,
                        count,
                        ceiling
                    );
                    if count > ceiling {
                        run.failure.push(FailureCause {
                            stage: stage.id.clone(),
                            action: None,
                            kind: ErrorKind::Timeout,
                            message: format!(
                                "no {:?} after {} timeouts",
                                stage.completion_marker, count
                            ),
                        });
                        return Ok(StageEnd::Failed);
                    }
                    if stage.on_timeout.is_empty() {
                        return Err(Error::Timeout(stage.timeout()));
                    }
                    match run_chain(scope, &mut run.context, &stage.on_timeout).await? {
                        Flow::Continue => continue,
                        flow => return self.follow(run, stage, flow),
                    }
                }
                WatchOutcome::Cancelled => {
                    if self.cancel.is_cancelled() {
                        return Ok(StageEnd::Suspended);
                    }
                    return Ok(StageEnd::Aborted(format!(
                        "watch on {} was cancelled",
                        scope.worker
                    )));
                }
            }
        }
    }

    /// Where a chain that finished with `flow` sends the run.
    fn follow(&self, run: &WorkflowRun, stage: &Stage, flow: Flow) -> Result<StageEnd> {
        match flow {
            Flow::Advance(next) => Ok(StageEnd::Enter(next)),
            Flow::Complete => Ok(StageEnd::Complete),
            Flow::Continue => match run.definition.successor(&stage.id) {
                Some(next) => Ok(StageEnd::Enter(next.to_string())),
                None => Err(Error::invalid_state(format!(
                    "stage {} has no successor",
                    stage.id
                ))),
            },
        }
    }

    async fn handle_failure(
        &self,
        run: &mut WorkflowRun,
        stage: &Stage,
        scope: &ActionScope,
        error: Error,
    ) -> Result<StageEnd> {
        clog_warn!("Run {}: stage {} failed: {}", run.id.short(), stage.id, error);
        run.failure.push(FailureCause::from_error(&stage.id, &error));
        run.context.set(
            &format!("{}.error", stage.id),
            Value::String(error.root_cause().to_string()),
        )?;

        if stage.on_failure.is_empty() {
            return Ok(StageEnd::Failed);
        }
        match run_chain(scope, &mut run.context, &stage.on_failure).await {
            Ok(Flow::Advance(next)) => Ok(StageEnd::Enter(next)),
            Ok(Flow::Complete) => Ok(StageEnd::Complete),
            Ok(Flow::Continue) => Ok(StageEnd::Failed),
            Err(e) => {
                run.failure.push(FailureCause::from_error(&stage.id, &e));
                Ok(StageEnd::Failed)
            }
        }
    }

    /// Why the stage's worker can no longer take prompts, if it can't.
    async fn worker_gone(&self, worker: &WorkerId) -> Option<String> {
        match self.coordinator.registry().get(worker).await {
            Ok(record) if record.status.is_live() => None,
            Ok(record) => Some(format!("{} is {}", worker, record.status)),
            Err(e) if e.kind() == ErrorKind::NotFound => Some(format!("{} no longer exists", worker)),
            Err(_) => None,
        }
    }
}
