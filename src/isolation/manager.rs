use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use git2::{BranchType, FileFavor, MergeOptions, Oid, Repository};
use serde::Serialize;

use super::atomic::{atomic_operation, AtomicStep};
use super::conflict::{analyze_conflicts, ConflictReport};
use super::lease::{branch_name, lease_key, worktree_path, LeaseTable, WorkTreeLease};
use crate::config::IsolationConfig;
use crate::core::WorkerId;
use crate::error::ConflictKind;
use crate::git::{signature, GitOps};
use crate::orchestration::cache::QueryCache;
use crate::orchestration::locks::TtlLockManager;
use crate::util::blocking;
use crate::{clog, clog_debug, clog_warn, Error, Result};

pub fn file_lock_key(path: &str) -> String {
    format!("file:{}", path)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseOptions {
    pub merge: bool,
    pub delete_branch: bool,
    /// Branch to merge into; defaults to the lease's base branch.
    pub target: Option<String>,
    /// Union-merge conflicts when every conflicting path is on the safelist.
    pub auto_resolve: bool,
}

impl ReleaseOptions {
    pub fn merge() -> Self {
        Self {
            merge: true,
            delete_branch: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeOutcome {
    UpToDate,
    FastForward { commit: String },
    Merged { commit: String, auto_resolved: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseOutcome {
    pub lease: String,
    /// Commit made from pending worktree changes, if any.
    pub committed: Option<String>,
    pub merged: Option<MergeOutcome>,
    pub branch_deleted: bool,
}

/// Merge `source` into `target` without touching the main working tree
/// unless `target` is what HEAD points at.
fn merge_into(
    repo: &Repository,
    source: &str,
    target: &str,
    union: bool,
    auto_resolved: &[String],
) -> Result<MergeOutcome> {
    let target_ref = format!("refs/heads/{}", target);
    let ours = repo.find_reference(&target_ref)?.peel_to_commit()?;
    let theirs = repo
        .find_branch(source, BranchType::Local)?
        .get()
        .peel_to_commit()?;
    let base = repo.merge_base(ours.id(), theirs.id())?;
    if base == theirs.id() {
        return Ok(MergeOutcome::UpToDate);
    }

    let fast_forward = base == ours.id();
    let new_commit = if fast_forward {
        theirs.id()
    } else {
        let mut opts = MergeOptions::new();
        if union {
            opts.file_favor(FileFavor::Union);
        }
        let mut index = repo.merge_commits(&ours, &theirs, Some(&opts))?;
        if index.has_conflicts() {
            let mut files = BTreeSet::new();
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                if let Some(entry) = conflict
                    .our
                    .as_ref()
                    .or(conflict.their.as_ref())
                    .or(conflict.ancestor.as_ref())
                {
                    files.insert(String::from_utf8_lossy(&entry.path).into_owned());
                }
            }
            return Err(Error::conflict(ConflictKind::MergeConflicts {
                files: files.into_iter().collect(),
            }));
        }
        let tree_id = index.write_tree_to(repo)?;
        let tree = repo.find_tree(tree_id)?;
        let sig = signature(repo)?;
        repo.commit(
            None,
            &sig,
            &sig,
            &format!("Merge {} into {}", source, target),
            &tree,
            &[&ours, &theirs],
        )?
    };

    let head_is_target = repo
        .head()
        .ok()
        .and_then(|h| h.name().map(String::from))
        .is_some_and(|name| name == target_ref);
    if head_is_target {
        // Checkout first so the baseline is still the old tip
        let object = repo.find_object(new_commit, None)?;
        let mut checkout = git2::build::CheckoutBuilder::new();
        checkout.safe();
        repo.checkout_tree(&object, Some(&mut checkout))?;
    }
    repo.reference(
        &target_ref,
        new_commit,
        true,
        &format!("conductor: merge {}", source),
    )?;

    let commit = new_commit.to_string();
    Ok(if fast_forward {
        MergeOutcome::FastForward { commit }
    } else {
        MergeOutcome::Merged {
            commit,
            auto_resolved: auto_resolved.to_vec(),
        }
    })
}

/// Grants isolated worktrees, arbitrates file claims between them and
/// merges finished work back.
pub struct IsolationManager {
    git: GitOps,
    config: IsolationConfig,
    worktrees_dir: PathBuf,
    leases: LeaseTable,
    locks: Arc<TtlLockManager>,
    claim_ttl: Duration,
    tips: QueryCache<String, Oid>,
    worktrees: QueryCache<(), Vec<(String, PathBuf)>>,
}

impl IsolationManager {
    pub fn new(
        git: GitOps,
        config: IsolationConfig,
        worktrees_dir: PathBuf,
        leases_path: PathBuf,
        locks: Arc<TtlLockManager>,
        claim_ttl: Duration,
        cache_ttl: Duration,
    ) -> Result<Self> {
        let leases = LeaseTable::new(leases_path);
        let known = leases.all()?.len();
        clog_debug!("Isolation manager opened with {} lease(s)", known);
        Ok(Self {
            git,
            config,
            worktrees_dir,
            leases,
            locks,
            claim_ttl,
            tips: QueryCache::new(cache_ttl),
            worktrees: QueryCache::new(cache_ttl),
        })
    }

    pub fn git(&self) -> &GitOps {
        &self.git
    }

    pub fn config(&self) -> &IsolationConfig {
        &self.config
    }

    pub async fn leases(&self) -> Result<Vec<WorkTreeLease>> {
        let table = self.leases.clone();
        blocking(move || table.all()).await
    }

    pub async fn lease(&self, key: &str) -> Result<WorkTreeLease> {
        let table = self.leases.clone();
        let key = key.to_string();
        blocking(move || table.get(&key)).await
    }

    pub async fn leases_for(&self, worker: &WorkerId) -> Result<Vec<WorkTreeLease>> {
        let table = self.leases.clone();
        let worker = worker.clone();
        blocking(move || table.for_worker(&worker)).await
    }

    async fn branch_tip(&self, branch: &str) -> Result<Oid> {
        let git = self.git.clone();
        let b = branch.to_string();
        self.tips
            .get_or_try_insert_with(branch.to_string(), blocking(move || git.branch_tip(&b)))
            .await
    }

    /// Registered worktrees (name, path), cached briefly.
    pub async fn list_worktrees(&self) -> Result<Vec<(String, PathBuf)>> {
        let git = self.git.clone();
        self.worktrees
            .get_or_try_insert_with((), blocking(move || git.list_worktrees()))
            .await
    }

    /// Branch `conductor/<worker>/<task>` off `base_branch` and check it out
    /// in its own worktree.
    pub async fn acquire_worktree(
        &self,
        worker: &WorkerId,
        base_branch: Option<&str>,
        task_id: &str,
    ) -> Result<WorkTreeLease> {
        let base = base_branch.unwrap_or(&self.config.base_branch).to_string();
        let branch = branch_name(worker, task_id);
        let path = worktree_path(&self.worktrees_dir, worker, task_id);
        let base_commit = self.branch_tip(&base).await?;

        let git = self.git.clone();
        let (b, p) = (branch.clone(), path.clone());
        blocking(move || git.create_branch_worktree(&b, base_commit, &p)).await?;

        let lease = WorkTreeLease {
            worker_id: worker.clone(),
            task_id: task_id.to_string(),
            path: path.clone(),
            branch: branch.clone(),
            base_branch: base.clone(),
            base_commit: base_commit.to_string(),
            claimed_files: BTreeSet::new(),
            created_at: Utc::now(),
        };
        let table = self.leases.clone();
        let record = lease.clone();
        if let Err(e) = blocking(move || table.insert(&record)).await {
            clog_warn!("Recording lease for {} failed, removing worktree: {}", branch, e);
            let git = self.git.clone();
            let _ = blocking(move || {
                git.remove_worktree(&path)?;
                git.delete_branch(&branch)
            })
            .await;
            return Err(e);
        }
        self.worktrees.invalidate(&()).await;
        clog!(
            "Isolation: {} acquired {} from {} at {}",
            worker,
            lease.branch,
            base,
            lease.path.display()
        );
        Ok(lease)
    }

    /// Claim files for the lease under `key`. A path held by another live
    /// lease is a conflict; a claim whose ttl lapsed moves to this lease.
    pub async fn claim_files(&self, key: &str, paths: &[String]) -> Result<WorkTreeLease> {
        let lease = self.lease(key).await?;
        let locks = self.locks.clone();
        let (holder, wanted, ttl) = (key.to_string(), paths.to_vec(), self.claim_ttl);
        blocking(move || {
            let mut fresh = Vec::new();
            for path in &wanted {
                match locks.claim(&file_lock_key(path), &holder, ttl) {
                    Ok(_) => {
                        if !lease.claimed_files.contains(path) {
                            fresh.push(path.clone());
                        }
                    }
                    Err(e) => {
                        for p in &fresh {
                            let _ = locks.release(&file_lock_key(p), &holder);
                        }
                        return Err(e);
                    }
                }
            }
            Ok(())
        })
        .await?;

        let table = self.leases.clone();
        let key_owned = key.to_string();
        let paths = paths.to_vec();
        let updated = blocking(move || {
            for p in &paths {
                table.drop_claim_elsewhere(p, &key_owned)?;
            }
            table.modify(&key_owned, |l| {
                l.claimed_files.extend(paths.iter().cloned());
                Ok(())
            })
        })
        .await?;
        clog_debug!("Lease {} now claims {:?}", key, updated.claimed_files);
        Ok(updated)
    }

    /// Release claims; `None` releases every claim of the lease.
    pub async fn release_claims(&self, key: &str, paths: Option<&[String]>) -> Result<WorkTreeLease> {
        let lease = self.lease(key).await?;
        let targets: Vec<String> = match paths {
            Some(p) => p.to_vec(),
            None => lease.claimed_files.iter().cloned().collect(),
        };
        let table = self.leases.clone();
        let locks = self.locks.clone();
        let key = key.to_string();
        blocking(move || {
            for path in &targets {
                if locks.validate(&file_lock_key(path), &key) {
                    locks.release(&file_lock_key(path), &key)?;
                }
            }
            table.modify(&key, |l| {
                for p in &targets {
                    l.claimed_files.remove(p);
                }
                Ok(())
            })
        })
        .await
    }

    pub async fn analyze_conflicts(&self, source: &str, target: &str) -> Result<ConflictReport> {
        let git = self.git.clone();
        let (s, t) = (source.to_string(), target.to_string());
        blocking(move || analyze_conflicts(&git, &s, &t)).await
    }

    /// Commit pending work, optionally merge it into the target, then remove
    /// the worktree. On merge conflicts the lease is kept and the target is
    /// untouched.
    pub async fn release_worktree(
        &self,
        lease: &WorkTreeLease,
        opts: ReleaseOptions,
    ) -> Result<ReleaseOutcome> {
        let key = lease.key();
        let current = self.lease(&key).await?;
        let target = opts
            .target
            .clone()
            .unwrap_or_else(|| current.base_branch.clone());

        let committed = if current.path.exists() {
            let path = current.path.clone();
            let message = format!("conductor: {} work on {}", current.worker_id, current.task_id);
            blocking(move || GitOps::commit_all(&path, &message)).await?
        } else {
            None
        };

        let mut merged = None;
        if opts.merge {
            let locks = self.locks.clone();
            let (claimed, holder) = (current.claimed_files.clone(), key.clone());
            blocking(move || {
                match claimed
                    .iter()
                    .find(|p| !locks.validate(&file_lock_key(p), &holder))
                {
                    Some(path) => Err(Error::conflict(ConflictKind::LockHeld {
                        key: file_lock_key(path),
                        holder: locks
                            .holder(&file_lock_key(path))
                            .unwrap_or_else(|| "nobody".to_string()),
                    })),
                    None => Ok(()),
                }
            })
            .await?;

            let report = self.analyze_conflicts(&current.branch, &target).await?;
            let union = if report.is_clean() {
                false
            } else if opts.auto_resolve && report.all_auto_resolvable(&self.config.auto_resolvable) {
                clog!(
                    "Isolation: auto-resolving {:?} for {}",
                    report.conflicts,
                    current.branch
                );
                true
            } else {
                clog_warn!(
                    "Isolation: {} conflicts with {} on {:?}",
                    current.branch,
                    target,
                    report.conflicts
                );
                return Err(Error::conflict(ConflictKind::MergeConflicts {
                    files: report.conflicts,
                }));
            };

            let repo_path = self.git.repo_path().to_path_buf();
            let (source, tgt) = (current.branch.clone(), target.clone());
            let auto_resolved = if union { report.conflicts.clone() } else { Vec::new() };
            let outcome = blocking(move || {
                let slot: Arc<Mutex<Option<MergeOutcome>>> = Arc::new(Mutex::new(None));
                let out = slot.clone();
                let (s, t) = (source.clone(), tgt.clone());
                atomic_operation(
                    &repo_path,
                    &format!("merge {} into {}", source, tgt),
                    &[format!("refs/heads/{}", tgt)],
                    vec![AtomicStep::new("merge", move |repo| {
                        let outcome = merge_into(repo, &s, &t, union, &auto_resolved)?;
                        if let Ok(mut slot) = out.lock() {
                            *slot = Some(outcome);
                        }
                        Ok(())
                    })],
                )?;
                let outcome = slot.lock().ok().and_then(|mut s| s.take());
                outcome.ok_or_else(|| Error::invalid_state("merge finished without an outcome"))
            })
            .await?;
            self.tips.invalidate(&target).await;
            clog!("Isolation: merged {} into {} ({:?})", current.branch, target, outcome);
            merged = Some(outcome);
        }

        let branch_deleted = self.teardown(&current, opts.delete_branch).await?;
        Ok(ReleaseOutcome {
            lease: key,
            committed: committed.map(|c| c.to_string()),
            merged,
            branch_deleted,
        })
    }

    async fn teardown(&self, lease: &WorkTreeLease, delete_branch: bool) -> Result<bool> {
        let key = lease.key();
        let git = self.git.clone();
        let (path, branch) = (lease.path.clone(), lease.branch.clone());
        blocking(move || {
            git.remove_worktree(&path)?;
            if delete_branch {
                git.delete_branch(&branch)?;
            }
            Ok(())
        })
        .await?;
        let table = self.leases.clone();
        let locks = self.locks.clone();
        let (claimed, k) = (lease.claimed_files.clone(), key.clone());
        blocking(move || {
            for path in &claimed {
                if locks.validate(&file_lock_key(path), &k) {
                    let _ = locks.release(&file_lock_key(path), &k);
                }
            }
            table.remove(&k)
        })
        .await?;
        self.worktrees.invalidate(&()).await;
        clog_debug!("Lease {} released", key);
        Ok(delete_branch)
    }

    /// Drop every lease of `worker` without merging. Branches are kept so
    /// the work can still be inspected. Returns the released lease keys.
    pub async fn abandon(&self, worker: &WorkerId) -> Result<Vec<String>> {
        let mut released = Vec::new();
        for lease in self.leases_for(worker).await? {
            let key = lease.key();
            if let Err(e) = self.teardown(&lease, false).await {
                clog_warn!("Could not tear down {}, dropping its record: {}", key, e);
                let table = self.leases.clone();
                let locks = self.locks.clone();
                let k = key.clone();
                blocking(move || {
                    locks.release_all(&k);
                    table.remove(&k)
                })
                .await?;
            }
            released.push(key);
        }
        if !released.is_empty() {
            clog!("Isolation: abandoned {} lease(s) of {}", released.len(), worker);
        }
        Ok(released)
    }

    /// Remove leases whose worktree directory is gone and prune git's
    /// matching admin entries.
    pub async fn prune_stale(&self) -> Result<Vec<String>> {
        let mut pruned = Vec::new();
        for lease in self.leases().await? {
            if !lease.path.exists() {
                let key = lease.key();
                let table = self.leases.clone();
                let locks = self.locks.clone();
                let k = key.clone();
                blocking(move || {
                    locks.release_all(&k);
                    table.remove(&k)
                })
                .await?;
                pruned.push(key);
            }
        }
        let git = self.git.clone();
        blocking(move || git.prune_worktrees()).await?;
        self.worktrees.invalidate(&()).await;
        Ok(pruned)
    }

    pub fn lease_key(worker: &WorkerId, task_id: &str) -> String {
        lease_key(worker, task_id)
    }
}
