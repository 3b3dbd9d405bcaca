//! The orchestration control surface.
//!
//! `Coordinator` composes the registry, the session transport, the
//! isolation manager, the governor and the detector into the five
//! operations workers and the CLI use: spawn, dispatch, peek, enumerate
//! and terminate. The workflow engine and the health monitor drive workers
//! through it as well, so every session write passes the same permission
//! checks and batching.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, StatePaths, STATE_DIR_ENV};
use crate::core::{Operation, Role, Worker, WorkerId, WorkerStatus};
use crate::error::{ConflictKind, ErrorKind};
use crate::git::GitOps;
use crate::isolation::IsolationManager;
use crate::orchestration::batch::DispatchBatcher;
use crate::orchestration::detector::{strip_ansi, Cursor, Detector, WatchOutcome};
use crate::orchestration::governor::{Governor, Priority, SlotPermit};
use crate::orchestration::locks::TtlLockManager;
use crate::orchestration::retry::{retry_transient, RetryPolicy};
use crate::registry::{Registry, WorkerFilter};
use crate::tmux::Tmux;
use crate::transport::{SessionSpec, SessionTransport};
use crate::util::blocking;
use crate::{clog, clog_debug, clog_warn, Error, Result};

/// Exported into every worker session; the CLI uses it as the caller id.
pub const WORKER_ID_ENV: &str = "CONDUCTOR_WORKER_ID";

const CAPACITY_POLL: Duration = Duration::from_millis(200);

/// Arguments for [`Coordinator::spawn`].
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub role: Role,
    pub parent: WorkerId,
    /// Session working directory when no worktree is requested.
    pub work_dir: Option<PathBuf>,
    /// Sent to the worker once its session is up, and again after restarts.
    pub context: Option<String>,
    /// Request an isolated worktree for this task.
    pub task: Option<String>,
    pub base_branch: Option<String>,
    pub priority: Priority,
    pub metadata: BTreeMap<String, Value>,
}

impl SpawnRequest {
    pub fn new(role: Role, parent: WorkerId) -> Self {
        Self {
            role,
            parent,
            work_dir: None,
            context: None,
            task: None,
            base_branch: None,
            priority: Priority::default(),
            metadata: BTreeMap::new(),
        }
    }
}

pub struct Coordinator {
    config: Config,
    paths: StatePaths,
    registry: Arc<Registry>,
    transport: Arc<dyn SessionTransport>,
    isolation: Option<Arc<IsolationManager>>,
    governor: Governor,
    locks: Arc<TtlLockManager>,
    batcher: DispatchBatcher,
    detector: Detector,
    retry: RetryPolicy,
    /// Per-worker parent token; watches on a worker are its children.
    watches: Mutex<HashMap<WorkerId, CancellationToken>>,
    permits: Mutex<HashMap<WorkerId, SlotPermit>>,
}

impl Coordinator {
    /// Open the state under `paths`. With `repo`, spawns that name a task
    /// get isolated worktrees of that repository. Must be called inside a
    /// tokio runtime.
    pub fn open(
        config: Config,
        paths: StatePaths,
        transport: Arc<dyn SessionTransport>,
        repo: Option<&Path>,
    ) -> Result<Self> {
        paths.ensure()?;
        let registry = Arc::new(Registry::open(paths.registry())?);
        let locks = Arc::new(TtlLockManager::open(paths.locks()));
        let isolation = match repo {
            Some(repo) => Some(Arc::new(IsolationManager::new(
                GitOps::new(repo)?,
                config.isolation.clone(),
                config.worktrees_dir(&paths),
                paths.leases(),
                locks.clone(),
                config.scheduler.claim_ttl(),
                config.scheduler.cache_ttl(),
            )?)),
            None => None,
        };
        Ok(Self::from_parts(
            config, paths, registry, transport, isolation, locks,
        ))
    }

    pub fn from_parts(
        config: Config,
        paths: StatePaths,
        registry: Arc<Registry>,
        transport: Arc<dyn SessionTransport>,
        isolation: Option<Arc<IsolationManager>>,
        locks: Arc<TtlLockManager>,
    ) -> Self {
        let batcher = DispatchBatcher::spawn(
            transport.clone(),
            config.transport.batch_window(),
            config.transport.max_batch,
        );
        let detector = Detector::new(transport.clone(), &config.detector);
        Self {
            governor: Governor::new(config.scheduler.max_specialists_per_manager),
            retry: RetryPolicy::from(&config.scheduler),
            config,
            paths,
            registry,
            transport,
            isolation,
            locks,
            batcher,
            detector,
            watches: Mutex::new(HashMap::new()),
            permits: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<dyn SessionTransport> {
        &self.transport
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    pub fn locks(&self) -> &Arc<TtlLockManager> {
        &self.locks
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// The isolation manager, or a validation error when no repository is
    /// configured.
    pub fn isolation(&self) -> Result<&Arc<IsolationManager>> {
        self.isolation.as_ref().ok_or_else(|| {
            Error::Validation("no repository configured for worktree isolation".into())
        })
    }

    /// Create the root Delegate if it does not exist yet.
    pub async fn init_root(&self, metadata: BTreeMap<String, Value>) -> Result<Worker> {
        match self.registry.get(&WorkerId::root()).await {
            Ok(root) => Ok(root),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.registry.create_root(metadata).await?;
                self.registry
                    .update_status_with_retry(&WorkerId::root(), WorkerStatus::Active)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Rebuild in-memory bookkeeping after a restart: running Specialists
    /// count against their Manager's slots again.
    pub async fn rehydrate(&self) -> Result<()> {
        let specialists = self
            .registry
            .list(&WorkerFilter {
                role: Some(Role::Specialist),
                live_only: true,
                ..Default::default()
            })
            .await;
        let mut permits = self.lock_permits()?;
        for worker in specialists {
            if permits.contains_key(&worker.id) {
                continue;
            }
            if let Some(parent) = &worker.parent_id {
                permits.insert(worker.id.clone(), self.governor.adopt(parent)?);
            }
        }
        drop(permits);
        if let Some(isolation) = &self.isolation {
            let pruned = isolation.prune_stale().await?;
            if !pruned.is_empty() {
                clog_warn!("Pruned {} lease(s) whose worktree is gone", pruned.len());
            }
        }
        Ok(())
    }

    fn lock_permits(&self) -> Result<std::sync::MutexGuard<'_, HashMap<WorkerId, SlotPermit>>> {
        self.permits
            .lock()
            .map_err(|_| Error::invalid_state("permit table poisoned"))
    }

    fn lock_watches(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<WorkerId, CancellationToken>>> {
        self.watches
            .lock()
            .map_err(|_| Error::invalid_state("watch table poisoned"))
    }

    /// `caller` may act on `target` only if it is the target or one of its
    /// ancestors.
    async fn authorize_target(&self, caller: &Worker, target: &WorkerId, op: &str) -> Result<()> {
        if &caller.id == target || self.registry.is_ancestor(&caller.id, target).await {
            return Ok(());
        }
        Err(Error::PermissionDenied {
            role: caller.role.to_string(),
            operation: format!("{} {}", op, target),
        })
    }

    // ------------------------------------------------------------------
    // spawn
    // ------------------------------------------------------------------

    /// Create a worker under `req.parent`, give it a session (and a
    /// worktree when `req.task` is set) and send it its context.
    ///
    /// Specialists wait for a slot under their Manager first. On any
    /// failure after the record exists, the worker is terminated and its
    /// resources are released before the error is returned.
    pub async fn spawn(&self, caller: &WorkerId, req: SpawnRequest) -> Result<Worker> {
        let caller_worker = self.registry.get(caller).await?;
        caller_worker.role.check(Operation::Spawn(req.role))?;

        let permit = if req.role == Role::Specialist {
            Some(
                self.governor
                    .acquire(&req.parent, req.priority, self.config.scheduler.spawn_wait())
                    .await?,
            )
        } else {
            None
        };

        let worker = self.create_worker(caller, &req).await?;

        match self.provision(&worker, &req).await {
            Ok(worker) => {
                if let Some(permit) = permit {
                    self.lock_permits()?.insert(worker.id.clone(), permit);
                }
                clog!("Spawned {} {} under {}", worker.role, worker.id, req.parent);
                Ok(worker)
            }
            Err(e) => {
                clog_warn!("Spawning {} failed, cleaning up: {}", worker.id, e);
                if let Err(cleanup) = self.registry.terminate(&worker.id, true).await {
                    clog_warn!("Could not mark {} terminated: {}", worker.id, cleanup);
                }
                self.release_worker(&worker.id).await;
                Err(e)
            }
        }
    }

    /// Insert the registry record. Specialists are also counted against the
    /// ceiling in the registry itself, which covers slots held by other
    /// processes on the same state directory; a full Manager is polled
    /// until the spawn wait runs out.
    async fn create_worker(&self, caller: &WorkerId, req: &SpawnRequest) -> Result<Worker> {
        let ceiling = (req.role == Role::Specialist)
            .then_some(self.config.scheduler.max_specialists_per_manager);
        let wait = self.config.scheduler.spawn_wait();
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if ceiling.is_some() {
                self.registry.refresh().await?;
            }
            let created = self
                .registry
                .create_bounded(
                    caller,
                    req.role,
                    &req.parent,
                    req.metadata.clone(),
                    req.context.clone(),
                    ceiling,
                )
                .await;
            match created {
                Err(Error::Conflict(ConflictKind::CapacityReached { .. })) => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        clog_warn!("{} has no free specialist slot", req.parent);
                        return Err(Error::Timeout(wait));
                    }
                    clog_debug!("{} is full in another process, waiting", req.parent);
                    tokio::time::sleep(CAPACITY_POLL.min(deadline - now)).await;
                }
                other => return other,
            }
        }
    }

    async fn provision(&self, worker: &Worker, req: &SpawnRequest) -> Result<Worker> {
        let mut work_dir = req.work_dir.clone();
        let mut branch = None;
        if let Some(task) = &req.task {
            let lease = self
                .isolation()?
                .acquire_worktree(&worker.id, req.base_branch.as_deref(), task)
                .await?;
            work_dir = Some(lease.path.clone());
            branch = Some(lease.branch.clone());
        }
        let cwd = match work_dir {
            Some(dir) => dir,
            None => self.default_work_dir()?,
        };
        self.registry
            .bind_workspace(&worker.id, Some(cwd.clone()), branch)
            .await?;

        let session = self.open_session(&worker.id, &cwd).await?;
        self.registry
            .bind_session(&worker.id, Some(session.clone()))
            .await?;
        let worker = self
            .registry
            .update_status_with_retry(&worker.id, WorkerStatus::Active)
            .await?;

        if let Some(context) = &req.context {
            self.send(&session, context).await?;
        }
        Ok(worker)
    }

    fn default_work_dir(&self) -> Result<PathBuf> {
        match &self.isolation {
            Some(isolation) => Ok(isolation.git().repo_path().to_path_buf()),
            None => Ok(std::env::current_dir()?),
        }
    }

    async fn open_session(&self, id: &WorkerId, cwd: &Path) -> Result<String> {
        let spec = SessionSpec {
            name: Tmux::session_name(&self.config.transport.session_prefix, id.as_str()),
            cwd: cwd.to_path_buf(),
            command: self.config.worker_argv(),
            env: vec![
                (WORKER_ID_ENV.to_string(), id.to_string()),
                (
                    STATE_DIR_ENV.to_string(),
                    self.paths.root.display().to_string(),
                ),
            ],
        };
        let batcher = &self.batcher;
        let spec = &spec;
        retry_transient(&self.retry, "open session", move || batcher.open(spec.clone())).await
    }

    async fn send(&self, session: &str, text: &str) -> Result<()> {
        let batcher = &self.batcher;
        retry_transient(&self.retry, "dispatch", move || {
            batcher.dispatch(session, text, true)
        })
        .await
    }

    // ------------------------------------------------------------------
    // dispatch / peek / enumerate
    // ------------------------------------------------------------------

    /// Type `text` into `worker`'s session.
    pub async fn dispatch(&self, caller: &WorkerId, worker: &WorkerId, text: &str) -> Result<()> {
        let caller_worker = self.registry.get(caller).await?;
        caller_worker.role.check(Operation::Dispatch)?;
        self.authorize_target(&caller_worker, worker, "dispatch to")
            .await?;

        let session = self.live_session(worker).await?;
        self.send(&session, text).await?;
        self.registry.touch(worker).await?;
        clog_debug!("{} dispatched {} bytes to {}", caller, text.len(), worker);
        Ok(())
    }

    /// Session of a worker that can still receive input.
    async fn live_session(&self, worker: &WorkerId) -> Result<String> {
        let target = self.registry.get(worker).await?;
        if target.status == WorkerStatus::Terminated {
            return Err(Error::invalid_state(format!("{} is terminated", worker)));
        }
        target
            .session_id
            .ok_or_else(|| Error::not_found("session", worker.as_str()))
    }

    /// The last `lines` lines of `worker`'s session, ANSI stripped.
    pub async fn peek(&self, caller: &WorkerId, worker: &WorkerId, lines: usize) -> Result<String> {
        let caller_worker = self.registry.get(caller).await?;
        caller_worker.role.check(Operation::Peek)?;
        let target = self.registry.get(worker).await?;
        let session = target
            .session_id
            .ok_or_else(|| Error::not_found("session", worker.as_str()))?;

        let transport = &self.transport;
        let session = session.as_str();
        let raw = retry_transient(&self.retry, "peek", move || {
            let transport = transport.clone();
            let session = session.to_string();
            async move { blocking(move || transport.read(&session, Some(lines))).await }
        })
        .await?;
        Ok(strip_ansi(&raw))
    }

    pub async fn enumerate(&self, caller: &WorkerId, filter: &WorkerFilter) -> Result<Vec<Worker>> {
        self.registry.refresh().await?;
        let caller_worker = self.registry.get(caller).await?;
        caller_worker.role.check(Operation::Enumerate)?;
        Ok(self.registry.list(filter).await)
    }

    // ------------------------------------------------------------------
    // terminate
    // ------------------------------------------------------------------

    /// Terminate `worker` (and with `cascade` its whole subtree). Already
    /// terminated workers are a no-op, but their leftovers are still
    /// cleaned up.
    pub async fn terminate(
        &self,
        caller: &WorkerId,
        worker: &WorkerId,
        cascade: bool,
    ) -> Result<Vec<WorkerId>> {
        let caller_worker = self.registry.get(caller).await?;
        caller_worker.role.check(Operation::Terminate)?;
        self.authorize_target(&caller_worker, worker, "terminate")
            .await?;

        let terminated = self.registry.terminate(worker, cascade).await?;
        let mut cleanup = self.registry.descendants(worker).await?;
        cleanup.push(worker.clone());
        for id in &cleanup {
            self.release_worker(id).await;
        }
        if !terminated.is_empty() {
            clog!("{} terminated {:?}", caller, terminated);
        }
        Ok(terminated)
    }

    /// Drop everything a worker holds outside the registry. Failures are
    /// logged; the record is already terminal.
    async fn release_worker(&self, id: &WorkerId) {
        if let Ok(mut watches) = self.lock_watches() {
            if let Some(token) = watches.remove(id) {
                token.cancel();
            }
        }
        if let Ok(mut permits) = self.lock_permits() {
            permits.remove(id);
        }

        match self.registry.get(id).await {
            Ok(record) if record.status == WorkerStatus::Terminated => {
                if let Some(session) = record.session_id {
                    let transport = self.transport.clone();
                    if let Err(e) = blocking(move || transport.destroy(&session)).await {
                        clog_warn!("Could not destroy session of {}: {}", id, e);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => clog_warn!("Cleanup of {} could not read its record: {}", id, e),
        }

        if let Some(isolation) = &self.isolation {
            if let Err(e) = isolation.abandon(id).await {
                clog_warn!("Could not release worktrees of {}: {}", id, e);
            }
        }
        let locks = self.locks.clone();
        let holder = id.to_string();
        let released = blocking(move || Ok(locks.release_all(&holder)))
            .await
            .unwrap_or(0);
        if released > 0 {
            clog_debug!("Released {} lock(s) held by {}", released, id);
        }
    }

    // ------------------------------------------------------------------
    // engine and health support
    // ------------------------------------------------------------------

    fn worker_token(&self, id: &WorkerId) -> Result<CancellationToken> {
        Ok(self
            .lock_watches()?
            .entry(id.clone())
            .or_default()
            .clone())
    }

    /// Response cursor for `worker`; take it before dispatching the prompt
    /// whose answer will be watched for.
    pub async fn cursor(&self, worker: &WorkerId) -> Result<Cursor> {
        let session = self.live_session(worker).await?;
        self.detector.cursor(&session).await
    }

    /// Watch `worker` for `marker`. Ends early with `Cancelled` when the
    /// worker is terminated or `cancel` fires.
    pub async fn watch(
        &self,
        worker: &WorkerId,
        marker: &str,
        timeout: Duration,
        cursor: &Cursor,
        cancel: &CancellationToken,
    ) -> Result<WatchOutcome> {
        let session = self.live_session(worker).await?;
        let token = self.worker_token(worker)?.child_token();
        let outcome = tokio::select! {
            outcome = self.detector.watch(&session, marker, timeout, cursor, &token) => outcome,
            _ = cancel.cancelled() => {
                token.cancel();
                WatchOutcome::Cancelled
            }
        };
        if matches!(outcome, WatchOutcome::Detected { .. }) {
            self.registry.touch(worker).await?;
        }
        Ok(outcome)
    }

    /// Press Enter in `worker`'s session without typing anything.
    pub async fn nudge(&self, worker: &WorkerId) -> Result<()> {
        let session = self.live_session(worker).await?;
        let transport = self.transport.clone();
        blocking(move || transport.nudge(&session)).await?;
        clog_debug!("Nudged {}", worker);
        Ok(())
    }

    /// Replace `worker`'s session with a fresh one in the same working
    /// directory and re-send its context.
    pub async fn restart_session(&self, worker: &WorkerId) -> Result<Worker> {
        let record = self.registry.get(worker).await?;
        if !record.status.is_live() {
            return Err(Error::invalid_state(format!(
                "{} is {}, not restarting",
                worker, record.status
            )));
        }
        if let Some(old) = record.session_id.clone() {
            let transport = self.transport.clone();
            if let Err(e) = blocking(move || transport.destroy(&old)).await {
                clog_warn!("Destroying old session of {} failed: {}", worker, e);
            }
        }
        let cwd = match &record.working_directory {
            Some(dir) => dir.clone(),
            None => self.default_work_dir()?,
        };
        let session = self.open_session(worker, &cwd).await?;
        let updated = self
            .registry
            .bind_session(worker, Some(session.clone()))
            .await?;
        if let Some(context) = &record.context {
            self.send(&session, context).await?;
        }
        self.registry.touch(worker).await?;
        clog!("Restarted session of {}", worker);
        Ok(updated)
    }
}

/// Structured result printed by every CLI command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EnvelopeError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl Envelope {
    pub fn from_result<T: Serialize>(result: Result<T>) -> Self {
        match result.and_then(|data| Ok(serde_json::to_value(data)?)) {
            Ok(data) => Self {
                ok: true,
                data: Some(data),
                error: None,
            },
            Err(e) => Self {
                ok: false,
                data: None,
                error: Some(EnvelopeError {
                    kind: e.kind(),
                    message: e.to_string(),
                }),
            },
        }
    }
}
