//! Journaled JSON snapshot files.
//!
//! Each store is one file holding `{version, revision, saved_at, records}`.
//! A commit writes a temp file, fsyncs it, copies the previous file to
//! `.bak` and renames the temp file over the original, so a crash leaves
//! either the old or the new snapshot, never a torn one.
//!
//! Several processes share these files (the long-running coordinator plus
//! one CLI process per nested worker call). Writers hold a lock file for the
//! read-check-write sequence, and `revision` catches a writer whose
//! in-memory copy is older than the file.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConflictKind;
use crate::{clog_debug, clog_warn, Error, Result};

pub const SNAPSHOT_VERSION: u32 = 1;

const LOCK_WAIT: Duration = Duration::from_secs(5);
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);
const LOCK_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    revision: u64,
    saved_at: DateTime<Utc>,
    #[serde(default)]
    records: BTreeMap<String, Value>,
}

/// A record that failed to load and was set aside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quarantined {
    pub key: String,
    pub reason: String,
}

impl Quarantined {
    pub fn into_error(self, what: &str) -> Error {
        Error::Corruption {
            what: format!("{} record {}", what, self.key),
            reason: self.reason,
        }
    }
}

/// Typed result of loading a store.
#[derive(Debug)]
pub struct LoadReport<T> {
    pub revision: u64,
    pub records: BTreeMap<String, T>,
    pub quarantined: Vec<Quarantined>,
}

/// Raw contents: records the caller could not decode stay untouched here,
/// so rewriting the file does not drop them.
#[derive(Debug, Default, Clone)]
pub struct RawSnapshot {
    pub revision: u64,
    pub records: BTreeMap<String, Value>,
    pub quarantined: Vec<Quarantined>,
}

#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
    what: &'static str,
}

/// Exclusive lock file held across a read-check-write.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(target: &Path) -> Result<Self> {
        let path = target.with_extension("lock");
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_stale(&path) {
                        clog_warn!("Removing stale lock file {}", path.display());
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if started.elapsed() > LOCK_WAIT {
                        return Err(Error::Timeout(LOCK_WAIT));
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .map(|age| age > LOCK_STALE_AFTER)
        .unwrap_or(false)
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl JsonStore {
    /// `what` names the store in errors and logs ("registry", "runs", ...).
    pub fn new(path: impl Into<PathBuf>, what: &'static str) -> Self {
        Self {
            path: path.into(),
            what,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn what(&self) -> &'static str {
        self.what
    }

    fn read_snapshot(&self) -> Result<Option<Snapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)?;
        match serde_json::from_str::<Snapshot>(&contents) {
            Ok(snapshot) if snapshot.version <= SNAPSHOT_VERSION => Ok(Some(snapshot)),
            Ok(snapshot) => Err(Error::Validation(format!(
                "{} snapshot was written by a newer format (version {}, supported {})",
                self.what, snapshot.version, SNAPSHOT_VERSION
            ))),
            Err(e) => Err(Error::Corruption {
                what: format!("{} snapshot", self.what),
                reason: e.to_string(),
            }),
        }
    }

    /// Move an unreadable snapshot aside so the next commit starts fresh.
    fn set_aside(&self, reason: &str) -> Result<PathBuf> {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let aside = self.path.with_extension(format!("json.corrupt-{}", stamp));
        clog_warn!(
            "{} snapshot {} is unreadable ({}); moved to {}",
            self.what,
            self.path.display(),
            reason,
            aside.display()
        );
        fs::rename(&self.path, &aside)?;
        Ok(aside)
    }

    /// Load every record as JSON. A file that cannot be parsed at all is
    /// moved aside and reported as one quarantined entry; the store then
    /// starts empty.
    pub fn load_raw(&self) -> Result<RawSnapshot> {
        match self.read_snapshot() {
            Ok(Some(snapshot)) => {
                clog_debug!(
                    "{} loaded: {} records at revision {}",
                    self.what,
                    snapshot.records.len(),
                    snapshot.revision
                );
                Ok(RawSnapshot {
                    revision: snapshot.revision,
                    records: snapshot.records,
                    quarantined: Vec::new(),
                })
            }
            Ok(None) => Ok(RawSnapshot::default()),
            Err(Error::Corruption { reason, .. }) => {
                let aside = self.set_aside(&reason)?;
                Ok(RawSnapshot {
                    revision: 0,
                    records: BTreeMap::new(),
                    quarantined: vec![Quarantined {
                        key: "*".to_string(),
                        reason: format!("{} (moved to {})", reason, aside.display()),
                    }],
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Load and decode records, quarantining the ones that do not decode.
    pub fn load<T: DeserializeOwned>(&self) -> Result<LoadReport<T>> {
        let raw = self.load_raw()?;
        let mut records = BTreeMap::new();
        let mut quarantined = raw.quarantined;
        for (key, value) in raw.records {
            match serde_json::from_value::<T>(value) {
                Ok(record) => {
                    records.insert(key, record);
                }
                Err(e) => {
                    clog_warn!("Quarantining {} record {}: {}", self.what, key, e);
                    quarantined.push(Quarantined {
                        key,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(LoadReport {
            revision: raw.revision,
            records,
            quarantined,
        })
    }

    fn write_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let contents = serde_json::to_string_pretty(snapshot)?;
        let temp_path = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
        }
        if self.path.exists() {
            let backup_path = self.path.with_extension("json.bak");
            fs::copy(&self.path, &backup_path)?;
        }
        fs::rename(&temp_path, &self.path)?;
        clog_debug!(
            "{} saved: {} records at revision {}",
            self.what,
            snapshot.records.len(),
            snapshot.revision
        );
        Ok(())
    }

    fn on_disk_revision(&self) -> u64 {
        self.read_snapshot()
            .ok()
            .flatten()
            .map(|s| s.revision)
            .unwrap_or(0)
    }

    /// Replace the whole snapshot, provided nobody committed since
    /// `base_revision`. Returns the new revision.
    pub fn commit<T: Serialize>(
        &self,
        base_revision: u64,
        records: &BTreeMap<String, T>,
    ) -> Result<u64> {
        let _lock = LockFile::acquire(&self.path)?;
        let actual = self.on_disk_revision();
        if actual != base_revision {
            return Err(Error::conflict(ConflictKind::RevisionMismatch {
                what: self.what.to_string(),
                expected: base_revision,
                actual,
            }));
        }
        let records = records
            .iter()
            .map(|(k, v)| -> Result<(String, Value)> { Ok((k.clone(), serde_json::to_value(v)?)) })
            .collect::<Result<BTreeMap<String, Value>>>()?;
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            revision: base_revision + 1,
            saved_at: Utc::now(),
            records,
        };
        self.write_snapshot(&snapshot)?;
        Ok(snapshot.revision)
    }

    /// Read-modify-write of the raw records under the lock file. Used by
    /// stores whose records are independent of each other.
    pub fn update<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, Value>) -> Result<R>,
    ) -> Result<R> {
        let _lock = LockFile::acquire(&self.path)?;
        let (revision, mut records) = match self.read_snapshot() {
            Ok(Some(s)) => (s.revision, s.records),
            Ok(None) => (0, BTreeMap::new()),
            Err(e) => return Err(e),
        };
        let out = f(&mut records)?;
        self.write_snapshot(&Snapshot {
            version: SNAPSHOT_VERSION,
            revision: revision + 1,
            saved_at: Utc::now(),
            records,
        })?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        name: String,
        count: u32,
    }

    fn item(name: &str, count: u32) -> Item {
        Item {
            name: name.to_string(),
            count,
        }
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::new(dir.path().join("items.json"), "items");
        let report = store.load::<Item>().unwrap();
        assert_eq!(report.revision, 0);
        assert!(report.records.is_empty());
        assert!(report.quarantined.is_empty());
    }

    #[test]
    fn test_commit_advances_revision_and_keeps_backup() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::new(dir.path().join("items.json"), "items");

        let mut records = BTreeMap::new();
        records.insert("a".to_string(), item("a", 1));
        assert_eq!(store.commit(0, &records).unwrap(), 1);

        records.insert("b".to_string(), item("b", 2));
        assert_eq!(store.commit(1, &records).unwrap(), 2);

        let report = store.load::<Item>().unwrap();
        assert_eq!(report.revision, 2);
        assert_eq!(report.records.len(), 2);
        assert!(dir.path().join("items.json.bak").exists());
        assert!(!dir.path().join("items.json.tmp").exists());
        assert!(!dir.path().join("items.lock").exists());
    }

    #[test]
    fn test_stale_base_revision_is_a_conflict() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::new(dir.path().join("items.json"), "items");
        let mut records = BTreeMap::new();
        records.insert("a".to_string(), item("a", 1));
        store.commit(0, &records).unwrap();

        let err = store.commit(0, &records).unwrap_err();
        assert!(err.is_revision_mismatch());
    }

    #[test]
    fn test_bad_record_is_quarantined_others_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("items.json");
        fs::write(
            &path,
            r#"{
                "version": 1,
                "revision": 4,
                "saved_at": "2026-01-01T00:00:00Z",
                "records": {
                    "good": {"name": "good", "count": 3},
                    "bad": {"name": "bad", "count": "three"}
                }
            }"#,
        )
        .unwrap();

        let store = JsonStore::new(&path, "items");
        let report = store.load::<Item>().unwrap();
        assert_eq!(report.revision, 4);
        assert_eq!(report.records.get("good"), Some(&item("good", 3)));
        assert_eq!(report.quarantined.len(), 1);
        assert_eq!(report.quarantined[0].key, "bad");
    }

    #[test]
    fn test_unparseable_file_is_moved_aside() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("items.json");
        fs::write(&path, "{ not json").unwrap();

        let store = JsonStore::new(&path, "items");
        let report = store.load::<Item>().unwrap();
        assert!(report.records.is_empty());
        assert_eq!(report.quarantined.len(), 1);
        assert!(!path.exists());

        let aside = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains("corrupt"));
        assert!(aside);

        // The store is usable again from revision 0
        let mut records = BTreeMap::new();
        records.insert("a".to_string(), item("a", 1));
        assert_eq!(store.commit(0, &records).unwrap(), 1);
    }

    #[test]
    fn test_update_preserves_undecodable_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("items.json");
        fs::write(
            &path,
            r#"{"version":1,"revision":1,"saved_at":"2026-01-01T00:00:00Z",
                "records":{"bad":{"name":7}}}"#,
        )
        .unwrap();
        let store = JsonStore::new(&path, "items");
        store
            .update(|records| {
                records.insert("new".to_string(), serde_json::to_value(item("new", 1))?);
                Ok(())
            })
            .unwrap();

        let raw = store.load_raw().unwrap();
        assert_eq!(raw.revision, 2);
        assert!(raw.records.contains_key("bad"));
        assert!(raw.records.contains_key("new"));
    }
}
