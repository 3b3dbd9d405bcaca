//! Worker registry: the arena of worker records and every guarded
//! mutation on it.
//!
//! Mutations run against a copy of the arena, are committed to the
//! snapshot store and only then swapped in, so a failed write leaves both
//! memory and disk at the last committed version. When another process
//! committed first, the registry reloads and replays the mutation; version
//! checks inside the mutation then see the other writer's changes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::{Operation, Role, Worker, WorkerId, WorkerStatus};
use crate::error::ConflictKind;
use crate::state::{JsonStore, Quarantined};
use crate::util::blocking;
use crate::{clog, clog_debug, clog_warn, Error, Result};

/// How often a mutation is replayed after losing a race to another process.
const STALE_RELOAD_ATTEMPTS: u32 = 3;

/// How often `update_status_with_retry` re-reads after a version conflict.
const STATUS_RETRY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Default)]
struct Arena {
    revision: u64,
    workers: BTreeMap<WorkerId, Worker>,
}

impl Arena {
    fn get(&self, id: &WorkerId) -> Result<&Worker> {
        self.workers
            .get(id)
            .ok_or_else(|| Error::not_found("worker", id.as_str()))
    }

    fn get_mut(&mut self, id: &WorkerId) -> Result<&mut Worker> {
        self.workers
            .get_mut(id)
            .ok_or_else(|| Error::not_found("worker", id.as_str()))
    }

    /// Descendants of `id`, every node listed after all of its own descendants.
    fn descendants(&self, id: &WorkerId) -> Vec<WorkerId> {
        let mut out = Vec::new();
        self.collect_post_order(id, &mut out);
        out
    }

    fn collect_post_order(&self, id: &WorkerId, out: &mut Vec<WorkerId>) {
        if let Some(worker) = self.workers.get(id) {
            for child in &worker.children {
                self.collect_post_order(child, out);
                out.push(child.clone());
            }
        }
    }

    fn is_ancestor(&self, ancestor: &WorkerId, id: &WorkerId) -> bool {
        let mut current = self.workers.get(id).and_then(|w| w.parent_id.clone());
        while let Some(parent) = current {
            if &parent == ancestor {
                return true;
            }
            current = self.workers.get(&parent).and_then(|w| w.parent_id.clone());
        }
        false
    }
}

/// Selects workers for `Registry::list`. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerFilter {
    pub role: Option<Role>,
    pub status: Option<WorkerStatus>,
    pub parent: Option<WorkerId>,
    /// The worker itself and all of its descendants.
    pub subtree_of: Option<WorkerId>,
    pub live_only: bool,
}

impl WorkerFilter {
    pub fn live() -> Self {
        Self {
            live_only: true,
            ..Default::default()
        }
    }

    fn matches(&self, worker: &Worker) -> bool {
        self.role.is_none_or(|r| worker.role == r)
            && self.status.is_none_or(|s| worker.status == s)
            && self
                .parent
                .as_ref()
                .is_none_or(|p| worker.parent_id.as_ref() == Some(p))
            && (!self.live_only || worker.status.is_live())
    }
}

/// Structural checks a record must pass to be loaded.
fn validate_record(
    worker: &Worker,
    all: &BTreeMap<WorkerId, Worker>,
) -> std::result::Result<(), String> {
    let (role, lineage) = worker
        .id
        .decode()
        .ok_or_else(|| "malformed id".to_string())?;
    if role != worker.role {
        return Err(format!("role {} does not match id", worker.role));
    }
    if lineage != worker.lineage {
        return Err(format!("lineage {:?} does not match id", worker.lineage));
    }
    if worker.depth as usize != lineage.len() {
        return Err(format!(
            "depth {} inconsistent with lineage of length {}",
            worker.depth,
            lineage.len()
        ));
    }
    match (&worker.parent_id, lineage.split_last()) {
        (None, None) => {}
        (Some(parent_id), Some((_, parent_lineage))) => {
            let parent = all
                .get(parent_id)
                .ok_or_else(|| format!("parent {} missing", parent_id))?;
            if parent.lineage != parent_lineage {
                return Err(format!("parent {} lineage mismatch", parent_id));
            }
        }
        (None, Some(_)) => return Err("non-root worker without parent".to_string()),
        (Some(_), None) => return Err("root worker with a parent".to_string()),
    }
    if worker.role == Role::Specialist && !worker.children.is_empty() {
        return Err("specialist has children".to_string());
    }
    Ok(())
}

fn decode_arena(
    revision: u64,
    raw: BTreeMap<String, Value>,
) -> (Arena, Vec<(Quarantined, Option<Value>)>) {
    let mut quarantined = Vec::new();
    let mut workers = BTreeMap::new();

    for (key, value) in raw {
        match serde_json::from_value::<Worker>(value.clone()) {
            Ok(worker) if worker.id.as_str() == key => {
                workers.insert(worker.id.clone(), worker);
            }
            Ok(worker) => quarantined.push((
                Quarantined {
                    key,
                    reason: format!("stored under a different id ({})", worker.id),
                },
                Some(value),
            )),
            Err(e) => quarantined.push((
                Quarantined {
                    key,
                    reason: e.to_string(),
                },
                Some(value),
            )),
        }
    }

    // Dropping a record can orphan its children, so repeat until stable
    loop {
        let bad: Vec<(WorkerId, String)> = workers
            .values()
            .filter_map(|w| {
                validate_record(w, &workers)
                    .err()
                    .map(|reason| (w.id.clone(), reason))
            })
            .collect();
        if bad.is_empty() {
            break;
        }
        for (id, reason) in bad {
            let value = workers
                .remove(&id)
                .and_then(|w| serde_json::to_value(w).ok());
            quarantined.push((
                Quarantined {
                    key: id.to_string(),
                    reason,
                },
                value,
            ));
        }
    }

    let ids: BTreeSet<WorkerId> = workers.keys().cloned().collect();
    for worker in workers.values_mut() {
        worker.children.retain(|c| ids.contains(c));
    }

    (Arena { revision, workers }, quarantined)
}

pub struct Registry {
    store: JsonStore,
    quarantine: JsonStore,
    arena: RwLock<Arena>,
    quarantined: std::sync::Mutex<Vec<Quarantined>>,
}

impl Registry {
    /// Open the registry stored at `path`, quarantining invalid records into
    /// a sidecar file next to it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let store = JsonStore::new(&path, "registry");
        let quarantine = JsonStore::new(path.with_extension("quarantine.json"), "quarantine");
        let (arena, quarantined) = Self::load_arena(&store, &quarantine)?;
        clog_debug!(
            "Registry opened: {} workers, {} quarantined",
            arena.workers.len(),
            quarantined.len()
        );
        Ok(Self {
            store,
            quarantine,
            arena: RwLock::new(arena),
            quarantined: std::sync::Mutex::new(quarantined),
        })
    }

    fn load_arena(store: &JsonStore, quarantine: &JsonStore) -> Result<(Arena, Vec<Quarantined>)> {
        let raw = store.load_raw()?;
        let mut reported = raw.quarantined;
        let (arena, bad) = decode_arena(raw.revision, raw.records);
        if !bad.is_empty() {
            quarantine.update(|records| {
                for (q, value) in &bad {
                    if let Some(value) = value {
                        records.insert(q.key.clone(), value.clone());
                    }
                }
                Ok(())
            })?;
        }
        for (q, _) in bad {
            clog_warn!("{}", q.clone().into_error("registry"));
            reported.push(q);
        }
        Ok((arena, reported))
    }

    /// Records set aside by the last load.
    pub fn quarantined(&self) -> Vec<Quarantined> {
        self.quarantined
            .lock()
            .map(|q| q.clone())
            .unwrap_or_default()
    }

    /// Reload from disk if another process committed since our last read.
    pub async fn refresh(&self) -> Result<bool> {
        let mut arena = self.arena.write().await;
        let store = self.store.clone();
        let on_disk = blocking(move || Ok(store.load_raw()?.revision)).await?;
        if on_disk == arena.revision {
            return Ok(false);
        }
        *arena = self.reload_arena().await?;
        Ok(true)
    }

    async fn reload_arena(&self) -> Result<Arena> {
        let store = self.store.clone();
        let quarantine = self.quarantine.clone();
        let (arena, quarantined) = blocking(move || Self::load_arena(&store, &quarantine)).await?;
        if let Ok(mut q) = self.quarantined.lock() {
            *q = quarantined;
        }
        Ok(arena)
    }

    async fn persist(&self, arena: &Arena) -> Result<u64> {
        let records: BTreeMap<String, Worker> = arena
            .workers
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        let store = self.store.clone();
        let base = arena.revision;
        blocking(move || store.commit(base, &records)).await
    }

    async fn mutate<R, F>(&self, op: &str, f: F) -> Result<R>
    where
        F: Fn(&mut Arena) -> Result<R> + Send + Sync,
        R: Send,
    {
        let mut arena = self.arena.write().await;
        let mut attempt = 0;
        loop {
            let mut next = arena.clone();
            let out = f(&mut next)?;
            match self.persist(&next).await {
                Ok(revision) => {
                    next.revision = revision;
                    *arena = next;
                    return Ok(out);
                }
                Err(e) if e.is_revision_mismatch() && attempt < STALE_RELOAD_ATTEMPTS => {
                    attempt += 1;
                    clog_debug!("Registry {} raced another writer, reloading (attempt {})", op, attempt);
                    *arena = self.reload_arena().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Create the single root Delegate.
    pub async fn create_root(&self, metadata: BTreeMap<String, Value>) -> Result<Worker> {
        let worker = self
            .mutate("create_root", |arena| {
                if arena.workers.values().any(|w| w.parent_id.is_none()) {
                    return Err(Error::invalid_state("root worker already exists"));
                }
                let mut root = Worker::new(WorkerId::root(), Role::Delegate, None, Vec::new());
                root.metadata = metadata.clone();
                arena.workers.insert(root.id.clone(), root.clone());
                Ok(root)
            })
            .await?;
        clog!("Registry: created root delegate");
        Ok(worker)
    }

    /// Create a child of `parent` on behalf of `caller`.
    ///
    /// The caller's role must allow spawning `role`, and the caller must be
    /// the parent or one of its ancestors. Ids are allocated from the
    /// parent's own sequence counter, so they are deterministic per parent.
    pub async fn create(
        &self,
        caller: &WorkerId,
        role: Role,
        parent: &WorkerId,
        metadata: BTreeMap<String, Value>,
        context: Option<String>,
    ) -> Result<Worker> {
        self.create_bounded(caller, role, parent, metadata, context, None)
            .await
    }

    /// [`create`](Self::create), refused with `CapacityReached` when
    /// `parent` already has `ceiling` non-terminated children of `role`.
    /// The count is taken inside the same commit as the insert, so writers
    /// in other processes cannot both slip under the ceiling.
    pub async fn create_bounded(
        &self,
        caller: &WorkerId,
        role: Role,
        parent: &WorkerId,
        metadata: BTreeMap<String, Value>,
        context: Option<String>,
        ceiling: Option<usize>,
    ) -> Result<Worker> {
        let worker = self
            .mutate("create", |arena| {
                let caller_worker = arena.get(caller)?;
                caller_worker.role.check(Operation::Spawn(role))?;
                if caller != parent && !arena.is_ancestor(caller, parent) {
                    return Err(Error::PermissionDenied {
                        role: caller_worker.role.to_string(),
                        operation: format!("spawn under {}", parent),
                    });
                }

                let parent_worker = arena.get(parent)?;
                parent_worker.role.check(Operation::Spawn(role))?;
                if !parent_worker.status.is_live() {
                    return Err(Error::invalid_state(format!(
                        "parent {} is {}",
                        parent, parent_worker.status
                    )));
                }
                if let Some(limit) = ceiling {
                    let held = parent_worker
                        .children
                        .iter()
                        .filter_map(|c| arena.workers.get(c))
                        .filter(|c| c.role == role && c.status != WorkerStatus::Terminated)
                        .count();
                    if held >= limit {
                        return Err(Error::conflict(ConflictKind::CapacityReached {
                            parent: parent.to_string(),
                            limit,
                        }));
                    }
                }

                let seq = parent_worker.next_child_seq + 1;
                let mut lineage = parent_worker.lineage.clone();
                lineage.push(seq);
                let id = WorkerId::for_child(role, &lineage);
                if arena.workers.contains_key(&id) {
                    return Err(Error::invalid_state(format!("worker {} already exists", id)));
                }

                let mut worker = Worker::new(id.clone(), role, Some(parent.clone()), lineage);
                worker.metadata = metadata.clone();
                worker.context = context.clone();

                let parent_worker = arena.get_mut(parent)?;
                parent_worker.next_child_seq = seq;
                parent_worker.children.push(id.clone());
                parent_worker.version += 1;

                arena.workers.insert(id, worker.clone());
                Ok(worker)
            })
            .await?;
        clog!("Registry: {} created {} {}", caller, worker.role, worker.id);
        Ok(worker)
    }

    pub async fn get(&self, id: &WorkerId) -> Result<Worker> {
        self.arena.read().await.get(id).cloned()
    }

    pub async fn list(&self, filter: &WorkerFilter) -> Vec<Worker> {
        let arena = self.arena.read().await;
        let subtree: Option<BTreeSet<WorkerId>> = filter.subtree_of.as_ref().map(|root| {
            let mut ids: BTreeSet<WorkerId> = arena.descendants(root).into_iter().collect();
            if arena.workers.contains_key(root) {
                ids.insert(root.clone());
            }
            ids
        });
        arena
            .workers
            .values()
            .filter(|w| subtree.as_ref().is_none_or(|s| s.contains(&w.id)))
            .filter(|w| filter.matches(w))
            .cloned()
            .collect()
    }

    /// Descendants of `id`, leaves first.
    pub async fn descendants(&self, id: &WorkerId) -> Result<Vec<WorkerId>> {
        let arena = self.arena.read().await;
        arena.get(id)?;
        Ok(arena.descendants(id))
    }

    pub async fn is_ancestor(&self, ancestor: &WorkerId, id: &WorkerId) -> bool {
        self.arena.read().await.is_ancestor(ancestor, id)
    }

    /// Change a worker's status, provided its record is still at
    /// `expected_version`.
    pub async fn update_status(
        &self,
        id: &WorkerId,
        status: WorkerStatus,
        expected_version: u64,
    ) -> Result<Worker> {
        let worker = self
            .mutate("update_status", |arena| {
                let worker = arena.get_mut(id)?;
                if worker.version != expected_version {
                    return Err(Error::conflict(ConflictKind::VersionMismatch {
                        id: id.to_string(),
                        expected: expected_version,
                        actual: worker.version,
                    }));
                }
                if worker.status != status && !worker.status.can_transition_to(status) {
                    return Err(Error::invalid_state(format!(
                        "{} cannot move from {} to {}",
                        id, worker.status, status
                    )));
                }
                worker.status = status;
                worker.version += 1;
                worker.last_activity_at = Utc::now();
                Ok(worker.clone())
            })
            .await?;
        clog_debug!("Registry: {} -> {}", id, status);
        Ok(worker)
    }

    /// Read the current version and update, re-reading on version conflicts.
    pub async fn update_status_with_retry(
        &self,
        id: &WorkerId,
        status: WorkerStatus,
    ) -> Result<Worker> {
        let mut attempt = 0;
        loop {
            let current = self.get(id).await?;
            match self.update_status(id, status, current.version).await {
                Err(e) if e.is_version_mismatch() && attempt < STATUS_RETRY_ATTEMPTS => {
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Record activity without bumping the version.
    pub async fn touch(&self, id: &WorkerId) -> Result<()> {
        self.mutate("touch", |arena| {
            arena.get_mut(id)?.last_activity_at = Utc::now();
            Ok(())
        })
        .await
    }

    pub async fn bind_session(&self, id: &WorkerId, session: Option<String>) -> Result<Worker> {
        self.mutate("bind_session", |arena| {
            let worker = arena.get_mut(id)?;
            worker.session_id = session.clone();
            worker.version += 1;
            Ok(worker.clone())
        })
        .await
    }

    pub async fn bind_workspace(
        &self,
        id: &WorkerId,
        working_directory: Option<PathBuf>,
        branch_name: Option<String>,
    ) -> Result<Worker> {
        self.mutate("bind_workspace", |arena| {
            let worker = arena.get_mut(id)?;
            worker.working_directory = working_directory.clone();
            worker.branch_name = branch_name.clone();
            worker.version += 1;
            Ok(worker.clone())
        })
        .await
    }

    /// Terminate `id`, and with `cascade` every descendant first (leaves
    /// before their parents). Returns the workers that changed, in the
    /// order they were terminated. Terminated workers are skipped, but a
    /// cascade still reaches the descendants of a terminated `id`. Without
    /// `cascade`, live descendants are a conflict.
    pub async fn terminate(&self, id: &WorkerId, cascade: bool) -> Result<Vec<WorkerId>> {
        let order = self
            .mutate("terminate", |arena| {
                let already = arena.get(id)?.status == WorkerStatus::Terminated;
                if already && !cascade {
                    return Ok(Vec::new());
                }
                let pending: Vec<WorkerId> = arena
                    .descendants(id)
                    .into_iter()
                    .filter(|d| {
                        arena
                            .workers
                            .get(d)
                            .is_some_and(|w| w.status != WorkerStatus::Terminated)
                    })
                    .collect();
                if !cascade {
                    let live = pending
                        .iter()
                        .filter(|d| arena.workers.get(*d).is_some_and(|w| w.status.is_live()))
                        .count();
                    if live > 0 {
                        return Err(Error::invalid_state(format!(
                            "{} has {} live descendants; terminate with cascade",
                            id, live
                        )));
                    }
                }

                let mut order = if cascade { pending } else { Vec::new() };
                if !already {
                    order.push(id.clone());
                }
                let now = Utc::now();
                for target in &order {
                    let worker = arena.get_mut(target)?;
                    worker.status = WorkerStatus::Terminated;
                    worker.version += 1;
                    worker.last_activity_at = now;
                }
                Ok(order)
            })
            .await?;
        if !order.is_empty() {
            clog!(
                "Registry: terminated {}",
                order.iter().map(|w| w.as_str()).collect::<Vec<_>>().join(", ")
            );
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Registry {
        Registry::open(dir.path().join("registry.json")).unwrap()
    }

    async fn seeded(dir: &TempDir) -> Registry {
        let registry = open(dir);
        registry.create_root(BTreeMap::new()).await.unwrap();
        registry
    }

    #[tokio::test]
    async fn test_hierarchical_ids() {
        let dir = TempDir::new().unwrap();
        let registry = seeded(&dir).await;
        let root = WorkerId::root();

        let mgr = registry
            .create(&root, Role::Manager, &root, BTreeMap::new(), None)
            .await
            .unwrap();
        assert_eq!(mgr.id.as_str(), "mgr_1");
        assert_eq!(mgr.depth, 1);

        let spec = registry
            .create(&mgr.id, Role::Specialist, &mgr.id, BTreeMap::new(), None)
            .await
            .unwrap();
        assert_eq!(spec.id.as_str(), "spec_1_1");
        assert_eq!(spec.depth, 2);

        let spec2 = registry
            .create(&root, Role::Specialist, &mgr.id, BTreeMap::new(), None)
            .await
            .unwrap();
        assert_eq!(spec2.id.as_str(), "spec_1_2");

        let mgr2 = registry
            .create(&root, Role::Manager, &root, BTreeMap::new(), None)
            .await
            .unwrap();
        assert_eq!(mgr2.id.as_str(), "mgr_2");

        let parent = registry.get(&mgr.id).await.unwrap();
        assert_eq!(parent.children, vec![spec.id, spec2.id]);
    }

    #[tokio::test]
    async fn test_specialist_cannot_spawn() {
        let dir = TempDir::new().unwrap();
        let registry = seeded(&dir).await;
        let root = WorkerId::root();
        let mgr = registry
            .create(&root, Role::Manager, &root, BTreeMap::new(), None)
            .await
            .unwrap();
        let spec = registry
            .create(&mgr.id, Role::Specialist, &mgr.id, BTreeMap::new(), None)
            .await
            .unwrap();

        let err = registry
            .create(&spec.id, Role::Specialist, &spec.id, BTreeMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { .. }));

        // A manager may not spawn managers, nor spawn outside its subtree
        let err = registry
            .create(&mgr.id, Role::Manager, &mgr.id, BTreeMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { .. }));
        let other = registry
            .create(&root, Role::Manager, &root, BTreeMap::new(), None)
            .await
            .unwrap();
        let err = registry
            .create(&mgr.id, Role::Specialist, &other.id, BTreeMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = seeded(&dir).await;
        let root = WorkerId::root();
        let mgr = registry
            .create(&root, Role::Manager, &root, BTreeMap::new(), None)
            .await
            .unwrap();

        let updated = registry
            .update_status(&mgr.id, WorkerStatus::Active, mgr.version)
            .await
            .unwrap();
        assert_eq!(updated.version, mgr.version + 1);

        // Second writer still holding the old read
        let err = registry
            .update_status(&mgr.id, WorkerStatus::Blocked, mgr.version)
            .await
            .unwrap_err();
        assert!(err.is_version_mismatch());

        let retried = registry
            .update_status_with_retry(&mgr.id, WorkerStatus::Blocked)
            .await
            .unwrap();
        assert_eq!(retried.status, WorkerStatus::Blocked);
    }

    #[tokio::test]
    async fn test_terminate_cascades_leaves_first() {
        let dir = TempDir::new().unwrap();
        let registry = seeded(&dir).await;
        let root = WorkerId::root();
        let mgr = registry
            .create(&root, Role::Manager, &root, BTreeMap::new(), None)
            .await
            .unwrap();
        let s1 = registry
            .create(&mgr.id, Role::Specialist, &mgr.id, BTreeMap::new(), None)
            .await
            .unwrap();
        let s2 = registry
            .create(&mgr.id, Role::Specialist, &mgr.id, BTreeMap::new(), None)
            .await
            .unwrap();

        let order = registry.terminate(&mgr.id, true).await.unwrap();
        assert_eq!(order, vec![s1.id.clone(), s2.id.clone(), mgr.id.clone()]);
        for id in [&s1.id, &s2.id, &mgr.id] {
            assert_eq!(
                registry.get(id).await.unwrap().status,
                WorkerStatus::Terminated
            );
        }
        assert_eq!(
            registry.get(&root).await.unwrap().status,
            WorkerStatus::Spawning
        );

        // Idempotent
        assert!(registry.terminate(&mgr.id, true).await.unwrap().is_empty());
    }

    /// Given a Manager terminated on its own while its child was completed
    /// When it is terminated again with cascade
    /// Then the child is terminated too
    #[tokio::test]
    async fn test_cascade_reaches_children_of_terminated_parent() {
        let dir = TempDir::new().unwrap();
        let registry = seeded(&dir).await;
        let root = WorkerId::root();
        let mgr = registry
            .create(&root, Role::Manager, &root, BTreeMap::new(), None)
            .await
            .unwrap();
        let spec = registry
            .create(&mgr.id, Role::Specialist, &mgr.id, BTreeMap::new(), None)
            .await
            .unwrap();
        registry
            .update_status_with_retry(&spec.id, WorkerStatus::Completed)
            .await
            .unwrap();

        assert_eq!(registry.terminate(&mgr.id, false).await.unwrap(), vec![mgr.id.clone()]);
        assert_eq!(
            registry.get(&spec.id).await.unwrap().status,
            WorkerStatus::Completed
        );

        let order = registry.terminate(&mgr.id, true).await.unwrap();
        assert_eq!(order, vec![spec.id.clone()]);
        assert_eq!(
            registry.get(&spec.id).await.unwrap().status,
            WorkerStatus::Terminated
        );
        assert!(registry.terminate(&mgr.id, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bounded_create_counts_other_writers() {
        let dir = TempDir::new().unwrap();
        let root = WorkerId::root();
        let first = seeded(&dir).await;
        let mgr = first
            .create(&root, Role::Manager, &root, BTreeMap::new(), None)
            .await
            .unwrap();
        let second = open(&dir);

        let spec = first
            .create_bounded(&mgr.id, Role::Specialist, &mgr.id, BTreeMap::new(), None, Some(1))
            .await
            .unwrap();
        // `second` loaded before spec_1_1 existed; the replayed commit sees it
        let err = second
            .create_bounded(&mgr.id, Role::Specialist, &mgr.id, BTreeMap::new(), None, Some(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Conflict(ConflictKind::CapacityReached { limit: 1, .. })
        ));

        first.terminate(&spec.id, false).await.unwrap();
        second.refresh().await.unwrap();
        let next = second
            .create_bounded(&mgr.id, Role::Specialist, &mgr.id, BTreeMap::new(), None, Some(1))
            .await
            .unwrap();
        assert_eq!(next.id.as_str(), "spec_1_2");
    }

    #[tokio::test]
    async fn test_terminate_without_cascade_refuses_live_children() {
        let dir = TempDir::new().unwrap();
        let registry = seeded(&dir).await;
        let root = WorkerId::root();
        let mgr = registry
            .create(&root, Role::Manager, &root, BTreeMap::new(), None)
            .await
            .unwrap();
        registry
            .create(&mgr.id, Role::Specialist, &mgr.id, BTreeMap::new(), None)
            .await
            .unwrap();

        let err = registry.terminate(&mgr.id, false).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Conflict);
        assert_eq!(
            registry.get(&mgr.id).await.unwrap().status,
            WorkerStatus::Spawning
        );
    }

    #[tokio::test]
    async fn test_cannot_spawn_under_terminated_parent() {
        let dir = TempDir::new().unwrap();
        let registry = seeded(&dir).await;
        let root = WorkerId::root();
        let mgr = registry
            .create(&root, Role::Manager, &root, BTreeMap::new(), None)
            .await
            .unwrap();
        registry.terminate(&mgr.id, true).await.unwrap();
        let err = registry
            .create(&root, Role::Specialist, &mgr.id, BTreeMap::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let root = WorkerId::root();
        {
            let registry = seeded(&dir).await;
            let mgr = registry
                .create(&root, Role::Manager, &root, BTreeMap::new(), None)
                .await
                .unwrap();
            registry
                .update_status(&mgr.id, WorkerStatus::Active, mgr.version)
                .await
                .unwrap();
        }
        let registry = open(&dir);
        let mgr = registry.get(&"mgr_1".parse().unwrap()).await.unwrap();
        assert_eq!(mgr.status, WorkerStatus::Active);
        // Sequence counter survives too
        let next = registry
            .create(&root, Role::Manager, &root, BTreeMap::new(), None)
            .await
            .unwrap();
        assert_eq!(next.id.as_str(), "mgr_2");
    }

    #[tokio::test]
    async fn test_concurrent_process_writes_are_replayed() {
        let dir = TempDir::new().unwrap();
        let root = WorkerId::root();
        let first = seeded(&dir).await;
        let second = open(&dir);

        let a = first
            .create(&root, Role::Manager, &root, BTreeMap::new(), None)
            .await
            .unwrap();
        // `second` still holds the pre-mgr_1 arena; its commit must not clobber mgr_1
        let b = second
            .create(&root, Role::Manager, &root, BTreeMap::new(), None)
            .await
            .unwrap();
        assert_eq!(a.id.as_str(), "mgr_1");
        assert_eq!(b.id.as_str(), "mgr_2");

        assert!(first.refresh().await.unwrap());
        let managers = first
            .list(&WorkerFilter {
                role: Some(Role::Manager),
                ..Default::default()
            })
            .await;
        assert_eq!(managers.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_records_are_quarantined() {
        let dir = TempDir::new().unwrap();
        let root = WorkerId::root();
        {
            let registry = seeded(&dir).await;
            registry
                .create(&root, Role::Manager, &root, BTreeMap::new(), None)
                .await
                .unwrap();
        }

        // Corrupt mgr_1's lineage on disk
        let path = dir.path().join("registry.json");
        let mut doc: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        doc["records"]["mgr_1"]["lineage"] = serde_json::json!([7]);
        std::fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();

        let registry = open(&dir);
        assert!(registry.get(&root).await.is_ok());
        assert!(registry.get(&"mgr_1".parse().unwrap()).await.is_err());
        let quarantined = registry.quarantined();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].key, "mgr_1");
        assert!(dir.path().join("registry.quarantine.json").exists());
        assert!(registry.get(&root).await.unwrap().children.is_empty());
    }

    #[tokio::test]
    async fn test_list_filters() {
        let dir = TempDir::new().unwrap();
        let registry = seeded(&dir).await;
        let root = WorkerId::root();
        let mgr = registry
            .create(&root, Role::Manager, &root, BTreeMap::new(), None)
            .await
            .unwrap();
        registry
            .create(&mgr.id, Role::Specialist, &mgr.id, BTreeMap::new(), None)
            .await
            .unwrap();
        registry
            .create(&root, Role::Specialist, &root, BTreeMap::new(), None)
            .await
            .unwrap();

        let subtree = registry
            .list(&WorkerFilter {
                subtree_of: Some(mgr.id.clone()),
                ..Default::default()
            })
            .await;
        assert_eq!(subtree.len(), 2);

        let specialists = registry
            .list(&WorkerFilter {
                role: Some(Role::Specialist),
                ..Default::default()
            })
            .await;
        assert_eq!(specialists.len(), 2);

        let children_of_root = registry
            .list(&WorkerFilter {
                parent: Some(root),
                ..Default::default()
            })
            .await;
        assert_eq!(children_of_root.len(), 2);
    }
}
