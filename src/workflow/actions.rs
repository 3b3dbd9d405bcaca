//! Action chains: the open tag → handler registry and the built-in kinds.
//!
//! Every stage outcome runs a chain of [`ActionSpec`]s in declaration
//! order. The `type` of each spec picks an [`ActionHandler`] from the
//! [`ActionRegistry`]; adding a kind is one `register` call.
//!
//! Built-in kinds:
//!
//! | kind | parameters |
//! |------|------------|
//! | `log` | `message`, `level` |
//! | `dispatch_prompt` | `prompt`, `worker`, `wait_for`, `timeout_seconds` |
//! | `invoke_subsystem` | `subsystem` plus its own parameters |
//! | `branch` | `condition`, `then`, `else` |
//! | `parallel_group` | `chains`, `continue_on_failure`, `wait` |
//! | `for_each` | `items`, `as`, `actions` |
//! | `set_variable` | `name`, `value` |
//! | `advance_stage` | `stage` |
//! | `complete_workflow` | `result` |

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, try_join_all, BoxFuture};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use super::context::{value_to_text, RunContext};
use super::state::RunId;
use super::types::{ActionSpec, FailurePolicy};
use crate::coordinator::{Coordinator, SpawnRequest};
use crate::core::{Role, WorkerId};
use crate::error::ErrorKind;
use crate::isolation::{lease_key, ReleaseOptions};
use crate::orchestration::detector::WatchOutcome;
use crate::orchestration::governor::Priority;
use crate::util::blocking;
use crate::{clog, clog_debug, clog_error, clog_trace, clog_warn, Error, Result};

/// Where a chain leaves the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Keep going: run the next action, or let the engine pick the
    /// stage's default successor.
    Continue,
    /// Enter the named stage.
    Advance(String),
    /// The run is complete.
    Complete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    /// Stored under the spec's `output` key, if it declares one.
    pub output: Option<Value>,
    pub flow: Flow,
}

impl ActionOutcome {
    pub fn done() -> Self {
        Self {
            output: None,
            flow: Flow::Continue,
        }
    }

    pub fn value(output: Value) -> Self {
        Self {
            output: Some(output),
            flow: Flow::Continue,
        }
    }

    pub fn flow(flow: Flow) -> Self {
        Self { output: None, flow }
    }
}

/// Everything an action may touch besides the run context.
#[derive(Clone)]
pub struct ActionScope {
    pub coordinator: Arc<Coordinator>,
    pub actions: Arc<ActionRegistry>,
    pub run_id: RunId,
    pub stage: String,
    /// Worker the current stage talks to.
    pub worker: WorkerId,
    /// Identity used for coordinator calls.
    pub owner: WorkerId,
    pub default_policy: FailurePolicy,
    pub cancel: CancellationToken,
}

pub trait ActionHandler: Send + Sync {
    /// Check parameters when a workflow is loaded.
    fn validate(&self, params: &Map<String, Value>) -> Result<()>;

    /// Chains nested in the parameters, checked recursively at load.
    fn nested_chains(&self, _params: &Map<String, Value>) -> Vec<Vec<ActionSpec>> {
        Vec::new()
    }

    /// Stages this action can transition to.
    fn transitions(&self, _params: &Map<String, Value>) -> Vec<String> {
        Vec::new()
    }

    /// Whether this action completes the run.
    fn completes(&self) -> bool {
        false
    }

    fn execute<'a>(
        &'a self,
        scope: &'a ActionScope,
        ctx: &'a mut RunContext,
        params: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<ActionOutcome>>;
}

/// What load-time inspection learned about a chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainSummary {
    pub transitions: Vec<String>,
    pub completes: bool,
}

#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("log", LogAction);
        registry.register("dispatch_prompt", DispatchPromptAction);
        registry.register("invoke_subsystem", InvokeSubsystemAction);
        registry.register("branch", BranchAction);
        registry.register("parallel_group", ParallelGroupAction);
        registry.register("for_each", ForEachAction);
        registry.register("set_variable", SetVariableAction);
        registry.register("advance_stage", AdvanceStageAction);
        registry.register("complete_workflow", CompleteWorkflowAction);
        registry
    }

    /// Add or replace the handler for `kind`.
    pub fn register(&mut self, kind: &str, handler: impl ActionHandler + 'static) {
        self.handlers.insert(kind.to_string(), Arc::new(handler));
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn ActionHandler>> {
        self.handlers
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("unknown action kind: {}", kind)))
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Validate a chain and everything nested in it.
    pub fn inspect_chain(&self, chain: &[ActionSpec]) -> Result<ChainSummary> {
        let mut summary = ChainSummary::default();
        for spec in chain {
            let handler = self.get(&spec.kind)?;
            handler.validate(&spec.params).map_err(|e| {
                Error::Validation(format!("{} action: {}", spec.kind, e.root_cause()))
            })?;
            summary.completes |= handler.completes();
            summary.transitions.extend(handler.transitions(&spec.params));
            for nested in handler.nested_chains(&spec.params) {
                let inner = self.inspect_chain(&nested)?;
                summary.completes |= inner.completes;
                summary.transitions.extend(inner.transitions);
            }
        }
        Ok(summary)
    }
}

/// Run `chain` in order. An action that transitions ends the chain. A
/// failing action is handled per its policy; an abort surfaces as
/// `Error::ActionFailed`.
pub fn run_chain<'a>(
    scope: &'a ActionScope,
    ctx: &'a mut RunContext,
    chain: &'a [ActionSpec],
) -> BoxFuture<'a, Result<Flow>> {
    Box::pin(async move {
        for spec in chain {
            if scope.cancel.is_cancelled() {
                return Err(Error::Cancelled(format!("chain in stage {}", scope.stage)));
            }
            let handler = scope.actions.get(&spec.kind)?;
            let policy = spec.on_error.unwrap_or(scope.default_policy);
            clog_trace!("Stage {}: running {}", scope.stage, spec.kind);

            let mut result = handler.execute(scope, ctx, &spec.params).await;
            let retry = policy == FailurePolicy::RetryOnce
                && matches!(&result, Err(e) if worth_retrying(e));
            if retry {
                clog_warn!(
                    "Stage {}: {} failed, retrying once",
                    scope.stage,
                    spec.kind
                );
                result = handler.execute(scope, ctx, &spec.params).await;
            }

            match result {
                Ok(outcome) => {
                    if let (Some(key), Some(value)) = (&spec.output, outcome.output) {
                        ctx.set(&format!("{}.{}", scope.stage, key), value)?;
                    }
                    if outcome.flow != Flow::Continue {
                        return Ok(outcome.flow);
                    }
                }
                Err(e) if policy == FailurePolicy::Continue => {
                    clog_warn!(
                        "Stage {}: {} failed, continuing: {}",
                        scope.stage,
                        spec.kind,
                        e
                    );
                }
                Err(e @ Error::ActionFailed { .. }) => return Err(e),
                Err(e) => {
                    return Err(Error::ActionFailed {
                        stage: scope.stage.clone(),
                        action: spec.kind.clone(),
                        source: Box::new(e),
                    })
                }
            }
        }
        Ok(Flow::Continue)
    })
}

fn worth_retrying(e: &Error) -> bool {
    !matches!(
        e.kind(),
        ErrorKind::PermissionDenied
            | ErrorKind::NotFound
            | ErrorKind::Conflict
            | ErrorKind::Validation
            | ErrorKind::Cancelled
    )
}

fn decode<T: DeserializeOwned>(params: &Map<String, Value>) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(params.clone()))?)
}

/// Interpolate every string parameter, then decode.
fn decode_rendered<T: DeserializeOwned>(ctx: &RunContext, params: &Map<String, Value>) -> Result<T> {
    Ok(serde_json::from_value(ctx.render(&Value::Object(params.clone())))?)
}

fn yes() -> bool {
    true
}

fn parse_worker(raw: Option<&str>, default: &WorkerId) -> Result<WorkerId> {
    match raw {
        Some(s) if !s.trim().is_empty() => s.parse(),
        _ => Ok(default.clone()),
    }
}

// ----------------------------------------------------------------------
// log
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LogParams {
    message: String,
    #[serde(default)]
    level: Option<String>,
}

pub struct LogAction;

impl ActionHandler for LogAction {
    fn validate(&self, params: &Map<String, Value>) -> Result<()> {
        decode::<LogParams>(params).map(|_| ())
    }

    fn execute<'a>(
        &'a self,
        scope: &'a ActionScope,
        ctx: &'a mut RunContext,
        params: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<ActionOutcome>> {
        Box::pin(async move {
            let p: LogParams = decode_rendered(ctx, params)?;
            let line = format!("[run {} / {}] {}", scope.run_id.short(), scope.stage, p.message);
            match p.level.as_deref() {
                Some("error") => clog_error!("{}", line),
                Some("warn") => clog_warn!("{}", line),
                Some("debug") => clog_debug!("{}", line),
                _ => clog!("{}", line),
            }
            Ok(ActionOutcome::value(Value::String(p.message)))
        })
    }
}

// ----------------------------------------------------------------------
// dispatch_prompt
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DispatchParams {
    prompt: String,
    #[serde(default)]
    worker: Option<String>,
    /// Wait for this marker after sending, and output the response block.
    #[serde(default)]
    wait_for: Option<String>,
    #[serde(default)]
    timeout_seconds: Option<f64>,
}

const DEFAULT_WAIT_SECS: f64 = 60.0;

pub struct DispatchPromptAction;

impl ActionHandler for DispatchPromptAction {
    fn validate(&self, params: &Map<String, Value>) -> Result<()> {
        let p = decode::<DispatchParams>(params)?;
        if let Some(t) = p.timeout_seconds {
            if !(t.is_finite() && t > 0.0) {
                return Err(Error::Validation("timeout_seconds must be positive".into()));
            }
        }
        Ok(())
    }

    fn execute<'a>(
        &'a self,
        scope: &'a ActionScope,
        ctx: &'a mut RunContext,
        params: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<ActionOutcome>> {
        Box::pin(async move {
            let p: DispatchParams = decode_rendered(ctx, params)?;
            let worker = parse_worker(p.worker.as_deref(), &scope.worker)?;
            let coordinator = &scope.coordinator;

            let Some(marker) = p.wait_for else {
                coordinator.dispatch(&scope.owner, &worker, &p.prompt).await?;
                return Ok(ActionOutcome::done());
            };

            let cursor = coordinator.cursor(&worker).await?;
            coordinator.dispatch(&scope.owner, &worker, &p.prompt).await?;
            let timeout =
                Duration::from_secs_f64(p.timeout_seconds.unwrap_or(DEFAULT_WAIT_SECS));
            match coordinator
                .watch(&worker, &marker, timeout, &cursor, &scope.cancel)
                .await?
            {
                WatchOutcome::Detected { block, .. } => Ok(ActionOutcome::value(Value::String(block))),
                WatchOutcome::Timeout { .. } => Err(Error::Timeout(timeout)),
                WatchOutcome::Cancelled => Err(Error::Cancelled(format!("watch on {}", worker))),
            }
        })
    }
}

// ----------------------------------------------------------------------
// invoke_subsystem
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "subsystem", rename_all = "snake_case")]
enum Subsystem {
    Spawn {
        role: String,
        #[serde(default)]
        parent: Option<String>,
        #[serde(default)]
        work_dir: Option<String>,
        #[serde(default)]
        context: Option<String>,
        #[serde(default)]
        task: Option<String>,
        #[serde(default)]
        base_branch: Option<String>,
        #[serde(default)]
        priority: Option<String>,
        #[serde(default)]
        metadata: Map<String, Value>,
    },
    Terminate {
        worker: String,
        #[serde(default = "yes")]
        cascade: bool,
    },
    Merge {
        #[serde(default)]
        lease: Option<String>,
        #[serde(default)]
        worker: Option<String>,
        #[serde(default)]
        task: Option<String>,
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        auto_resolve: bool,
        #[serde(default = "yes")]
        delete_branch: bool,
    },
    AcquireWorktree {
        #[serde(default)]
        worker: Option<String>,
        task: String,
        #[serde(default)]
        base_branch: Option<String>,
    },
    ReleaseWorktree {
        #[serde(default)]
        lease: Option<String>,
        #[serde(default)]
        worker: Option<String>,
        #[serde(default)]
        task: Option<String>,
        #[serde(default)]
        merge: bool,
        #[serde(default)]
        delete_branch: bool,
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        auto_resolve: bool,
    },
    Claim {
        #[serde(default)]
        lease: Option<String>,
        #[serde(default)]
        worker: Option<String>,
        #[serde(default)]
        task: Option<String>,
        #[serde(default)]
        files: Option<Vec<String>>,
        #[serde(default)]
        resource: Option<String>,
        #[serde(default)]
        holder: Option<String>,
        #[serde(default)]
        ttl_seconds: Option<u64>,
        #[serde(default)]
        wait_seconds: Option<u64>,
    },
    ReleaseClaim {
        #[serde(default)]
        lease: Option<String>,
        #[serde(default)]
        worker: Option<String>,
        #[serde(default)]
        task: Option<String>,
        #[serde(default)]
        files: Option<Vec<String>>,
        #[serde(default)]
        resource: Option<String>,
        #[serde(default)]
        holder: Option<String>,
    },
    Peek {
        #[serde(default)]
        worker: Option<String>,
        #[serde(default)]
        lines: Option<usize>,
    },
    AnalyzeConflicts {
        source: String,
        target: String,
    },
}

/// A lease named directly, or by worker and task.
fn resolve_lease(
    lease: Option<String>,
    worker: Option<String>,
    task: Option<String>,
    default_worker: &WorkerId,
) -> Result<String> {
    if let Some(key) = lease {
        return Ok(key);
    }
    let task = task.ok_or_else(|| Error::Validation("name a lease, or a task".into()))?;
    let worker = parse_worker(worker.as_deref(), default_worker)?;
    Ok(lease_key(&worker, &task))
}

pub struct InvokeSubsystemAction;

impl InvokeSubsystemAction {
    async fn invoke(&self, scope: &ActionScope, call: Subsystem) -> Result<Value> {
        let coordinator = &scope.coordinator;
        match call {
            Subsystem::Spawn {
                role,
                parent,
                work_dir,
                context,
                task,
                base_branch,
                priority,
                metadata,
            } => {
                let role: Role = role.parse()?;
                let parent = parse_worker(parent.as_deref(), &scope.worker)?;
                let mut req = SpawnRequest::new(role, parent);
                req.work_dir = work_dir.map(PathBuf::from);
                req.context = context;
                req.task = task;
                req.base_branch = base_branch;
                req.priority = match priority {
                    Some(p) => p.parse::<Priority>()?,
                    None => Priority::default(),
                };
                req.metadata = metadata.into_iter().collect();
                let worker = coordinator.spawn(&scope.owner, req).await?;
                Ok(serde_json::to_value(worker)?)
            }
            Subsystem::Terminate { worker, cascade } => {
                let worker: WorkerId = worker.parse()?;
                let ids = coordinator.terminate(&scope.owner, &worker, cascade).await?;
                Ok(serde_json::to_value(ids)?)
            }
            Subsystem::Merge {
                lease,
                worker,
                task,
                target,
                auto_resolve,
                delete_branch,
            } => {
                let isolation = coordinator.isolation()?;
                let key = resolve_lease(lease, worker, task, &scope.worker)?;
                let lease = isolation.lease(&key).await?;
                let opts = ReleaseOptions {
                    merge: true,
                    delete_branch,
                    target,
                    auto_resolve,
                };
                Ok(serde_json::to_value(isolation.release_worktree(&lease, opts).await?)?)
            }
            Subsystem::AcquireWorktree {
                worker,
                task,
                base_branch,
            } => {
                let worker = parse_worker(worker.as_deref(), &scope.worker)?;
                let lease = coordinator
                    .isolation()?
                    .acquire_worktree(&worker, base_branch.as_deref(), &task)
                    .await?;
                Ok(serde_json::to_value(lease)?)
            }
            Subsystem::ReleaseWorktree {
                lease,
                worker,
                task,
                merge,
                delete_branch,
                target,
                auto_resolve,
            } => {
                let isolation = coordinator.isolation()?;
                let key = resolve_lease(lease, worker, task, &scope.worker)?;
                let lease = isolation.lease(&key).await?;
                let opts = ReleaseOptions {
                    merge,
                    delete_branch,
                    target,
                    auto_resolve,
                };
                Ok(serde_json::to_value(isolation.release_worktree(&lease, opts).await?)?)
            }
            Subsystem::Claim {
                lease,
                worker,
                task,
                files,
                resource,
                holder,
                ttl_seconds,
                wait_seconds,
            } => {
                if let Some(files) = files {
                    let key = resolve_lease(lease, worker, task, &scope.worker)?;
                    let lease = coordinator.isolation()?.claim_files(&key, &files).await?;
                    return Ok(serde_json::to_value(lease)?);
                }
                let resource = resource
                    .ok_or_else(|| Error::Validation("claim needs files or a resource".into()))?;
                let holder = holder.unwrap_or_else(|| scope.worker.to_string());
                let scheduler = &coordinator.config().scheduler;
                let ttl = ttl_seconds
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| scheduler.claim_ttl());
                let wait = wait_seconds
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| scheduler.lock_wait());
                let info = coordinator
                    .locks()
                    .claim_with_wait(&resource, &holder, ttl, wait)
                    .await?;
                Ok(serde_json::to_value(info)?)
            }
            Subsystem::ReleaseClaim {
                lease,
                worker,
                task,
                files,
                resource,
                holder,
            } => {
                if let Some(resource) = resource {
                    let holder = holder.unwrap_or_else(|| scope.worker.to_string());
                    let locks = coordinator.locks().clone();
                    let key = resource.clone();
                    blocking(move || locks.release(&key, &holder)).await?;
                    return Ok(json!({ "released": resource }));
                }
                let key = resolve_lease(lease, worker, task, &scope.worker)?;
                let lease = coordinator
                    .isolation()?
                    .release_claims(&key, files.as_deref())
                    .await?;
                Ok(serde_json::to_value(lease)?)
            }
            Subsystem::Peek { worker, lines } => {
                let worker = parse_worker(worker.as_deref(), &scope.worker)?;
                let text = coordinator
                    .peek(&scope.owner, &worker, lines.unwrap_or(50))
                    .await?;
                Ok(Value::String(text))
            }
            Subsystem::AnalyzeConflicts { source, target } => {
                let report = coordinator
                    .isolation()?
                    .analyze_conflicts(&source, &target)
                    .await?;
                Ok(serde_json::to_value(report)?)
            }
        }
    }
}

impl ActionHandler for InvokeSubsystemAction {
    fn validate(&self, params: &Map<String, Value>) -> Result<()> {
        decode::<Subsystem>(params).map(|_| ())
    }

    fn execute<'a>(
        &'a self,
        scope: &'a ActionScope,
        ctx: &'a mut RunContext,
        params: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<ActionOutcome>> {
        Box::pin(async move {
            let call: Subsystem = decode_rendered(ctx, params)?;
            clog_debug!("Stage {}: invoking {:?}", scope.stage, call);
            let output = self.invoke(scope, call).await?;
            Ok(ActionOutcome::value(output))
        })
    }
}

// ----------------------------------------------------------------------
// branch
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// The context path holds a non-null value.
    Exists(String),
    Equals { left: Value, right: Value },
    /// Substring test, or membership when `haystack` renders to an array.
    Contains { haystack: Value, needle: Value },
    Not(Box<Condition>),
}

impl Condition {
    pub fn evaluate(&self, ctx: &RunContext) -> bool {
        match self {
            Condition::Exists(path) => {
                let path = path
                    .trim()
                    .trim_start_matches("{{")
                    .trim_end_matches("}}")
                    .trim();
                ctx.get(path).is_some_and(|v| !v.is_null())
            }
            Condition::Equals { left, right } => {
                let (left, right) = (ctx.render(left), ctx.render(right));
                left == right || value_to_text(&left) == value_to_text(&right)
            }
            Condition::Contains { haystack, needle } => {
                let needle = value_to_text(&ctx.render(needle));
                match ctx.render(haystack) {
                    Value::Array(items) => items.iter().any(|i| value_to_text(i) == needle),
                    other => value_to_text(&other).contains(&needle),
                }
            }
            Condition::Not(inner) => !inner.evaluate(ctx),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BranchParams {
    condition: Condition,
    #[serde(default)]
    then: Vec<ActionSpec>,
    #[serde(default, rename = "else")]
    otherwise: Vec<ActionSpec>,
}

pub struct BranchAction;

impl ActionHandler for BranchAction {
    fn validate(&self, params: &Map<String, Value>) -> Result<()> {
        decode::<BranchParams>(params).map(|_| ())
    }

    fn nested_chains(&self, params: &Map<String, Value>) -> Vec<Vec<ActionSpec>> {
        decode::<BranchParams>(params)
            .map(|p| vec![p.then, p.otherwise])
            .unwrap_or_default()
    }

    fn execute<'a>(
        &'a self,
        scope: &'a ActionScope,
        ctx: &'a mut RunContext,
        params: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<ActionOutcome>> {
        Box::pin(async move {
            let p: BranchParams = decode(params)?;
            let taken = p.condition.evaluate(ctx);
            clog_debug!("Stage {}: branch condition is {}", scope.stage, taken);
            let chain = if taken { &p.then } else { &p.otherwise };
            let flow = run_chain(scope, ctx, chain).await?;
            Ok(ActionOutcome {
                output: Some(Value::Bool(taken)),
                flow,
            })
        })
    }
}

// ----------------------------------------------------------------------
// parallel_group
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ParallelParams {
    chains: Vec<Vec<ActionSpec>>,
    #[serde(default = "yes")]
    continue_on_failure: bool,
    #[serde(default = "yes")]
    wait: bool,
}

pub struct ParallelGroupAction;

impl ActionHandler for ParallelGroupAction {
    fn validate(&self, params: &Map<String, Value>) -> Result<()> {
        decode::<ParallelParams>(params).map(|_| ())
    }

    fn nested_chains(&self, params: &Map<String, Value>) -> Vec<Vec<ActionSpec>> {
        decode::<ParallelParams>(params)
            .map(|p| p.chains)
            .unwrap_or_default()
    }

    fn execute<'a>(
        &'a self,
        scope: &'a ActionScope,
        ctx: &'a mut RunContext,
        params: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<ActionOutcome>> {
        Box::pin(async move {
            let p: ParallelParams = decode(params)?;

            if !p.wait {
                let count = p.chains.len();
                for (index, chain) in p.chains.into_iter().enumerate() {
                    let scope = scope.clone();
                    let mut copy = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = run_chain(&scope, &mut copy, &chain).await {
                            clog_warn!(
                                "Detached chain {} of stage {} failed: {}",
                                index,
                                scope.stage,
                                e
                            );
                        }
                    });
                }
                return Ok(ActionOutcome::value(json!({ "detached": count })));
            }

            let base = ctx.clone();
            let mut copies = vec![base.clone(); p.chains.len()];
            let results: Vec<Result<Flow>> = if p.continue_on_failure {
                join_all(
                    copies
                        .iter_mut()
                        .zip(&p.chains)
                        .map(|(copy, chain)| run_chain(scope, copy, chain)),
                )
                .await
            } else {
                // First failure drops the sibling futures
                try_join_all(
                    copies
                        .iter_mut()
                        .zip(&p.chains)
                        .map(|(copy, chain)| run_chain(scope, copy, chain)),
                )
                .await?
                .into_iter()
                .map(Ok)
                .collect()
            };

            for copy in &copies {
                ctx.merge_changes(&base, copy);
            }

            let mut flow = Flow::Continue;
            let mut failed = Vec::new();
            for (index, result) in results.into_iter().enumerate() {
                match result {
                    Ok(Flow::Continue) => {}
                    Ok(other) => {
                        if flow == Flow::Continue {
                            flow = other;
                        } else {
                            clog_warn!(
                                "Stage {}: chain {} also transitioned, ignoring {:?}",
                                scope.stage,
                                index,
                                other
                            );
                        }
                    }
                    Err(e) => {
                        clog_warn!("Stage {}: parallel chain {} failed: {}", scope.stage, index, e);
                        failed.push(json!({
                            "chain": index,
                            "kind": e.kind(),
                            "message": e.root_cause().to_string(),
                        }));
                    }
                }
            }
            Ok(ActionOutcome {
                output: Some(json!({
                    "chains": copies.len(),
                    "failed": failed,
                })),
                flow,
            })
        })
    }
}

// ----------------------------------------------------------------------
// for_each
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ForEachParams {
    /// An array, or a context path (optionally in `{{ }}`) to one.
    items: Value,
    #[serde(default = "default_loop_var", rename = "as")]
    var: String,
    actions: Vec<ActionSpec>,
}

fn default_loop_var() -> String {
    "item".to_string()
}

pub struct ForEachAction;

impl ActionHandler for ForEachAction {
    fn validate(&self, params: &Map<String, Value>) -> Result<()> {
        let p = decode::<ForEachParams>(params)?;
        if !(p.items.is_array() || p.items.is_string()) {
            return Err(Error::Validation(
                "items must be an array or a variable path".into(),
            ));
        }
        Ok(())
    }

    fn nested_chains(&self, params: &Map<String, Value>) -> Vec<Vec<ActionSpec>> {
        decode::<ForEachParams>(params)
            .map(|p| vec![p.actions])
            .unwrap_or_default()
    }

    fn execute<'a>(
        &'a self,
        scope: &'a ActionScope,
        ctx: &'a mut RunContext,
        params: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<ActionOutcome>> {
        Box::pin(async move {
            let p: ForEachParams = decode(params)?;
            let items = match ctx.render(&p.items) {
                Value::Array(items) => items,
                Value::String(path) => {
                    let path = path.trim();
                    match ctx.get(path) {
                        Some(Value::Array(items)) => items.clone(),
                        Some(other) => {
                            return Err(Error::Validation(format!(
                                "for_each over {}: not an array ({})",
                                path, other
                            )))
                        }
                        None => {
                            return Err(Error::Validation(format!(
                                "for_each over {}: no such variable",
                                path
                            )))
                        }
                    }
                }
                other => {
                    return Err(Error::Validation(format!(
                        "for_each items must be an array, got {}",
                        other
                    )))
                }
            };

            let count = items.len();
            for (index, item) in items.into_iter().enumerate() {
                ctx.set(&p.var, item)?;
                ctx.set("loop.index", Value::from(index))?;
                let flow = run_chain(scope, ctx, &p.actions).await?;
                if flow != Flow::Continue {
                    return Ok(ActionOutcome::flow(flow));
                }
            }
            Ok(ActionOutcome::value(Value::from(count)))
        })
    }
}

// ----------------------------------------------------------------------
// set_variable / advance_stage / complete_workflow
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SetVariableParams {
    name: String,
    value: Value,
}

pub struct SetVariableAction;

impl ActionHandler for SetVariableAction {
    fn validate(&self, params: &Map<String, Value>) -> Result<()> {
        let p = decode::<SetVariableParams>(params)?;
        RunContext::new().set(&p.name, Value::Null)
    }

    fn execute<'a>(
        &'a self,
        _scope: &'a ActionScope,
        ctx: &'a mut RunContext,
        params: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<ActionOutcome>> {
        Box::pin(async move {
            let p: SetVariableParams = decode(params)?;
            let value = ctx.render(&p.value);
            let name = ctx.interpolate(&p.name);
            ctx.set(&name, value.clone())?;
            Ok(ActionOutcome::value(value))
        })
    }
}

#[derive(Debug, Deserialize)]
struct AdvanceParams {
    stage: String,
}

pub struct AdvanceStageAction;

impl ActionHandler for AdvanceStageAction {
    fn validate(&self, params: &Map<String, Value>) -> Result<()> {
        decode::<AdvanceParams>(params).map(|_| ())
    }

    fn transitions(&self, params: &Map<String, Value>) -> Vec<String> {
        decode::<AdvanceParams>(params)
            .map(|p| vec![p.stage])
            .unwrap_or_default()
    }

    fn execute<'a>(
        &'a self,
        _scope: &'a ActionScope,
        ctx: &'a mut RunContext,
        params: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<ActionOutcome>> {
        Box::pin(async move {
            let p: AdvanceParams = decode(params)?;
            Ok(ActionOutcome::flow(Flow::Advance(ctx.interpolate(&p.stage))))
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct CompleteParams {
    #[serde(default)]
    result: Option<Value>,
}

pub struct CompleteWorkflowAction;

impl ActionHandler for CompleteWorkflowAction {
    fn validate(&self, params: &Map<String, Value>) -> Result<()> {
        decode::<CompleteParams>(params).map(|_| ())
    }

    fn completes(&self) -> bool {
        true
    }

    fn execute<'a>(
        &'a self,
        _scope: &'a ActionScope,
        ctx: &'a mut RunContext,
        params: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<ActionOutcome>> {
        Box::pin(async move {
            let p: CompleteParams = decode(params)?;
            Ok(ActionOutcome {
                output: p.result.map(|r| ctx.render(&r)),
                flow: Flow::Complete,
            })
        })
    }
}
