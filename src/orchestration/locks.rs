//! Time-limited exclusive claims on named resources.
//!
//! A claim is set-if-absent against unexpired locks. A lock whose ttl has
//! elapsed without renewal counts as abandoned and is handed to the next
//! claimant, so holders must `validate` before anything destructive.
//!
//! The table is a `JsonStore` file (`locks.json`) shared by every process
//! working out of the same state directory. Claims, renewals and releases
//! are read-check-write sequences under the store's lock file, and expiry
//! is wall-clock time, so a claim left by an exited process still lapses
//! when it was due to.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::ConflictKind;
use crate::state::JsonStore;
use crate::util::blocking;
use crate::{clog_debug, clog_warn, Error, Result};

const WAIT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    holder: String,
    ttl_ms: u64,
    expires_at: DateTime<Utc>,
}

impl Entry {
    fn new(holder: &str, ttl: Duration, now: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            holder: holder.to_string(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            expires_at: expiry(now, ttl)?,
        })
    }

    fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn info(&self, key: &str, now: DateTime<Utc>) -> LockInfo {
        LockInfo {
            key: key.to_string(),
            holder: self.holder.clone(),
            ttl: self.ttl(),
            expires_at: self.expires_at,
            remaining: (self.expires_at - now).to_std().unwrap_or(Duration::ZERO),
        }
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| Error::Validation(format!("lock ttl out of range: {:?}", ttl)))
}

fn held(key: &str, entry: &Entry) -> Error {
    Error::conflict(ConflictKind::LockHeld {
        key: key.to_string(),
        holder: entry.holder.clone(),
    })
}

/// Snapshot of a held lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockInfo {
    pub key: String,
    pub holder: String,
    pub ttl: Duration,
    pub expires_at: DateTime<Utc>,
    pub remaining: Duration,
}

#[derive(Debug, Clone)]
pub struct TtlLockManager {
    store: JsonStore,
}

impl TtlLockManager {
    /// Lock table stored at `path` (normally `StatePaths::locks`).
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path, "lock table"),
        }
    }

    /// Undecodable entries are dropped from reads; the next write under
    /// that key replaces them.
    fn decode(key: &str, value: &Value) -> Option<Entry> {
        match serde_json::from_value(value.clone()) {
            Ok(entry) => Some(entry),
            Err(e) => {
                clog_warn!("Ignoring unreadable lock entry {}: {}", key, e);
                None
            }
        }
    }

    fn entries(&self) -> Result<BTreeMap<String, Entry>> {
        Ok(self
            .store
            .load_raw()?
            .records
            .iter()
            .filter_map(|(k, v)| Self::decode(k, v).map(|e| (k.clone(), e)))
            .collect())
    }

    /// Claim `key` for `holder`. Re-claiming a lock you already hold renews it.
    pub fn claim(&self, key: &str, holder: &str, ttl: Duration) -> Result<LockInfo> {
        self.store.update(|records| {
            let now = Utc::now();
            if let Some(existing) = records.get(key).and_then(|v| Self::decode(key, v)) {
                if existing.holder != holder {
                    if !existing.is_expired(now) {
                        return Err(held(key, &existing));
                    }
                    clog_warn!(
                        "Lock {} expired for {}, reassigning to {}",
                        key,
                        existing.holder,
                        holder
                    );
                }
            }
            let entry = Entry::new(holder, ttl, now)?;
            records.insert(key.to_string(), serde_json::to_value(&entry)?);
            clog_debug!("Lock {} claimed by {} for {:?}", key, holder, ttl);
            Ok(entry.info(key, now))
        })
    }

    /// Claim, polling until `wait` elapses while another holder has it.
    pub async fn claim_with_wait(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<LockInfo> {
        let deadline = Instant::now() + wait;
        loop {
            let locks = self.clone();
            let (k, h) = (key.to_string(), holder.to_string());
            match blocking(move || locks.claim(&k, &h, ttl)).await {
                Err(Error::Conflict(ConflictKind::LockHeld { .. })) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout(wait));
                    }
                    tokio::time::sleep(WAIT_POLL.min(deadline - now)).await;
                }
                other => return other,
            }
        }
    }

    /// Extend a lock held by `holder` by its original ttl. A lapsed lock can
    /// still be renewed as long as nobody else has claimed it since.
    pub fn renew(&self, key: &str, holder: &str) -> Result<LockInfo> {
        self.store.update(|records| {
            let now = Utc::now();
            let mut entry = records
                .get(key)
                .and_then(|v| Self::decode(key, v))
                .ok_or_else(|| Error::not_found("lock", key))?;
            if entry.holder != holder {
                return Err(held(key, &entry));
            }
            entry.expires_at = expiry(now, entry.ttl())?;
            records.insert(key.to_string(), serde_json::to_value(&entry)?);
            Ok(entry.info(key, now))
        })
    }

    pub fn release(&self, key: &str, holder: &str) -> Result<()> {
        self.store.update(|records| {
            match records.get(key).and_then(|v| Self::decode(key, v)) {
                None => Err(Error::not_found("lock", key)),
                Some(entry) if entry.holder != holder => Err(held(key, &entry)),
                Some(_) => {
                    records.remove(key);
                    clog_debug!("Lock {} released by {}", key, holder);
                    Ok(())
                }
            }
        })
    }

    /// Whether `holder` still owns an unexpired claim on `key`.
    pub fn validate(&self, key: &str, holder: &str) -> bool {
        let now = Utc::now();
        match self.entries() {
            Ok(entries) => entries
                .get(key)
                .is_some_and(|e| e.holder == holder && !e.is_expired(now)),
            Err(e) => {
                clog_warn!("Could not read lock table: {}", e);
                false
            }
        }
    }

    /// Current unexpired holder of `key`.
    pub fn holder(&self, key: &str) -> Option<String> {
        let now = Utc::now();
        self.entries()
            .ok()?
            .remove(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.holder)
    }

    /// Drop every lock `holder` owns. Returns how many were released.
    pub fn release_all(&self, holder: &str) -> usize {
        let released = self.store.update(|records| {
            let before = records.len();
            records.retain(|k, v| Self::decode(k, v).is_none_or(|e| e.holder != holder));
            Ok(before - records.len())
        });
        released.unwrap_or_else(|e| {
            clog_warn!("Could not release locks of {}: {}", holder, e);
            0
        })
    }

    /// Unexpired locks whose key starts with `prefix`, sorted by key.
    pub fn list(&self, prefix: &str) -> Vec<LockInfo> {
        let now = Utc::now();
        let Ok(entries) = self.entries() else {
            return Vec::new();
        };
        entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.is_expired(now))
            .map(|(k, e)| e.info(k, now))
            .collect()
    }
}
