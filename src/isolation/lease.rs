use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::WorkerId;
use crate::state::JsonStore;
use crate::util::sanitize_component;
use crate::{clog_warn, Error, Result};

/// A worker's grant of an isolated working tree on its own branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkTreeLease {
    pub worker_id: WorkerId,
    pub task_id: String,
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
    /// Tip of `base_branch` when the lease was granted.
    pub base_commit: String,
    #[serde(default)]
    pub claimed_files: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl WorkTreeLease {
    pub fn key(&self) -> String {
        lease_key(&self.worker_id, &self.task_id)
    }
}

pub fn lease_key(worker: &WorkerId, task_id: &str) -> String {
    format!("{}/{}", worker, sanitize_component(task_id))
}

pub fn branch_name(worker: &WorkerId, task_id: &str) -> String {
    format!("conductor/{}/{}", worker, sanitize_component(task_id))
}

pub fn worktree_path(root: &Path, worker: &WorkerId, task_id: &str) -> PathBuf {
    root.join(format!("{}-{}", worker, sanitize_component(task_id)))
}

/// Lease table, persisted as one snapshot keyed by `<worker>/<task>`.
#[derive(Debug, Clone)]
pub struct LeaseTable {
    store: JsonStore,
}

impl LeaseTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path, "lease table"),
        }
    }

    pub fn all(&self) -> Result<Vec<WorkTreeLease>> {
        let report = self.store.load::<WorkTreeLease>()?;
        for q in report.quarantined {
            clog_warn!("{}", q.into_error("lease"));
        }
        Ok(report.records.into_values().collect())
    }

    pub fn get(&self, key: &str) -> Result<WorkTreeLease> {
        let report = self.store.load::<WorkTreeLease>()?;
        report
            .records
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found("lease", key))
    }

    pub fn for_worker(&self, worker: &WorkerId) -> Result<Vec<WorkTreeLease>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|l| &l.worker_id == worker)
            .collect())
    }

    /// Insert a new lease. An existing lease under the same key is a conflict.
    pub fn insert(&self, lease: &WorkTreeLease) -> Result<()> {
        let key = lease.key();
        let value = serde_json::to_value(lease)?;
        self.store.update(|records| {
            if records.contains_key(&key) {
                return Err(Error::invalid_state(format!("lease {} already exists", key)));
            }
            records.insert(key.clone(), value);
            Ok(())
        })
    }

    /// Apply `f` to the stored lease under `key` and persist the result.
    pub fn modify<F>(&self, key: &str, f: F) -> Result<WorkTreeLease>
    where
        F: FnOnce(&mut WorkTreeLease) -> Result<()>,
    {
        self.store.update(|records| {
            let raw = records
                .get(key)
                .cloned()
                .ok_or_else(|| Error::not_found("lease", key))?;
            let mut lease: WorkTreeLease = serde_json::from_value(raw)?;
            f(&mut lease)?;
            records.insert(key.to_string(), serde_json::to_value(&lease)?);
            Ok(lease)
        })
    }

    /// Remove a path from every lease except `keep` (used when an expired
    /// claim moves to a new holder).
    pub fn drop_claim_elsewhere(&self, path: &str, keep: &str) -> Result<()> {
        self.store.update(|records| {
            for (key, raw) in records.iter_mut() {
                if key == keep {
                    continue;
                }
                if let Ok(mut lease) = serde_json::from_value::<WorkTreeLease>(raw.clone()) {
                    if lease.claimed_files.remove(path) {
                        *raw = serde_json::to_value(&lease)?;
                    }
                }
            }
            Ok(())
        })
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        self.store.update(|records| Ok(records.remove(key).is_some()))
    }
}
