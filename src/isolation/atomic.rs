//! Multi-step repository mutations that either fully apply or leave the
//! repository exactly as it was.
//!
//! Before the first step a checkpoint records HEAD, the guarded refs and,
//! if the tree is dirty, a stash of the dirty state (applied straight back
//! so the steps see an unchanged tree). When a step fails the refs and HEAD
//! are restored, the tree is reset hard, untracked files are removed and
//! the stash is re-applied.

use std::path::Path;

use git2::{Oid, Repository, ResetType, StashApplyOptions, StashFlags, Status, StatusOptions};

use crate::git::signature;
use crate::{clog_debug, clog_error, clog_warn, Error, Result};

type StepFn = Box<dyn FnOnce(&Repository) -> Result<()> + Send>;

pub struct AtomicStep {
    pub name: String,
    run: StepFn,
}

impl AtomicStep {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(&Repository) -> Result<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }
}

fn has_changes(repo: &Repository) -> Result<bool> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    Ok(!repo.statuses(Some(&mut opts))?.is_empty())
}

fn stash_index(repo: &mut Repository, oid: Oid) -> Result<Option<usize>> {
    let mut found = None;
    repo.stash_foreach(|idx, _msg, id| {
        if *id == oid {
            found = Some(idx);
            false
        } else {
            true
        }
    })?;
    Ok(found)
}

fn remove_untracked(repo: &Repository) -> Result<()> {
    let Some(workdir) = repo.workdir() else {
        return Ok(());
    };
    let mut opts = StatusOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(false);
    let statuses = repo.statuses(Some(&mut opts))?;
    for entry in statuses.iter() {
        if !entry.status().contains(Status::WT_NEW) {
            continue;
        }
        if let Some(path) = entry.path() {
            let full = workdir.join(path);
            if full.is_dir() {
                std::fs::remove_dir_all(&full)?;
            } else if full.exists() {
                std::fs::remove_file(&full)?;
            }
        }
    }
    Ok(())
}

struct Checkpoint {
    head_ref: Option<String>,
    head: Oid,
    guarded: Vec<(String, Option<Oid>)>,
    stash: Option<Oid>,
}

impl Checkpoint {
    fn take(repo: &mut Repository, operation: &str, guarded_refs: &[String]) -> Result<Self> {
        let (head_ref, head) = {
            let head = repo.head()?;
            let name = if head.is_branch() {
                head.name().map(String::from)
            } else {
                None
            };
            (name, head.peel_to_commit()?.id())
        };
        let guarded = guarded_refs
            .iter()
            .map(|r| (r.clone(), repo.refname_to_id(r).ok()))
            .collect();

        let stash = if has_changes(repo)? {
            let sig = signature(repo)?;
            let oid = repo.stash_save(
                &sig,
                &format!("conductor checkpoint: {}", operation),
                Some(StashFlags::INCLUDE_UNTRACKED),
            )?;
            let mut opts = StashApplyOptions::new();
            opts.reinstantiate_index();
            repo.stash_apply(0, Some(&mut opts))?;
            Some(oid)
        } else {
            None
        };

        Ok(Self {
            head_ref,
            head,
            guarded,
            stash,
        })
    }

    fn rollback(&self, repo: &mut Repository) -> Result<()> {
        for (name, oid) in &self.guarded {
            match oid {
                Some(oid) => {
                    repo.reference(name, *oid, true, "conductor: rollback")?;
                }
                None => {
                    if let Ok(mut r) = repo.find_reference(name) {
                        r.delete()?;
                    }
                }
            }
        }
        match &self.head_ref {
            Some(name) => {
                repo.reference(name, self.head, true, "conductor: rollback")?;
                repo.set_head(name)?;
            }
            None => repo.set_head_detached(self.head)?,
        }
        {
            let target = repo.find_object(self.head, None)?;
            repo.reset(&target, ResetType::Hard, None)?;
        }
        remove_untracked(repo)?;
        repo.cleanup_state()?;

        if let Some(oid) = self.stash {
            match stash_index(repo, oid)? {
                Some(idx) => {
                    let mut opts = StashApplyOptions::new();
                    opts.reinstantiate_index();
                    repo.stash_apply(idx, Some(&mut opts))?;
                    repo.stash_drop(idx)?;
                }
                None => clog_warn!("Checkpoint stash {} vanished before rollback", oid),
            }
        }
        Ok(())
    }

    fn discard(&self, repo: &mut Repository) -> Result<()> {
        if let Some(oid) = self.stash {
            if let Some(idx) = stash_index(repo, oid)? {
                repo.stash_drop(idx)?;
            }
        }
        Ok(())
    }
}

/// Run `steps` in order against the repository at `repo_path`. `guarded_refs`
/// are full ref names (e.g. `refs/heads/main`) restored on rollback; HEAD and
/// the branch it points at are always restored.
pub fn atomic_operation(
    repo_path: &Path,
    operation: &str,
    guarded_refs: &[String],
    steps: Vec<AtomicStep>,
) -> Result<()> {
    let mut repo = Repository::discover(repo_path)?;
    let checkpoint = Checkpoint::take(&mut repo, operation, guarded_refs)?;
    clog_debug!(
        "Atomic operation {} started ({} steps, stash={})",
        operation,
        steps.len(),
        checkpoint.stash.is_some()
    );

    for step in steps {
        let AtomicStep { name, run } = step;
        if let Err(e) = run(&repo) {
            clog_warn!(
                "Atomic operation {} failed at step '{}': {}; rolling back",
                operation,
                name,
                e
            );
            if let Err(rb) = checkpoint.rollback(&mut repo) {
                clog_error!("Rollback of {} failed: {}", operation, rb);
            }
            return Err(Error::RolledBack {
                operation: format!("{}/{}", operation, name),
                source: Box::new(e),
            });
        }
    }

    if let Err(e) = checkpoint.discard(&mut repo) {
        clog_warn!("Could not drop checkpoint stash for {}: {}", operation, e);
    }
    clog_debug!("Atomic operation {} committed", operation);
    Ok(())
}
