use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use git2::{BranchType, ErrorCode, IndexAddOption, Oid, Repository, Signature, StatusOptions};

use crate::error::ConflictKind;
use crate::{clog_debug, clog_warn, Error, Result};

/// Signature used when the repository has no `user.name` configured.
pub fn signature(repo: &Repository) -> Result<Signature<'static>> {
    Ok(repo
        .signature()
        .or_else(|_| Signature::now("Conductor", "conductor@localhost"))?)
}

fn prune_options() -> git2::WorktreePruneOptions {
    let mut opts = git2::WorktreePruneOptions::new();
    opts.valid(true).working_tree(true).locked(true);
    opts
}

#[derive(Debug, Clone)]
pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        clog_debug!("GitOps::new path={}", repo_path.display());
        let repo = Repository::discover(repo_path)?;
        let repo_path = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo_path.to_path_buf());
        Ok(Self { repo_path })
    }

    pub fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Commit the branch currently points at.
    pub fn branch_tip(&self, branch: &str) -> Result<Oid> {
        let repo = self.repo()?;
        let tip = match repo.find_branch(branch, BranchType::Local) {
            Ok(b) => Ok(b.get().peel_to_commit()?.id()),
            Err(e) if e.code() == ErrorCode::NotFound => Err(Error::not_found("branch", branch)),
            Err(e) => Err(e.into()),
        };
        tip
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let exists = match repo.find_branch(branch, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        };
        exists
    }

    /// Create `branch` at `base` and check it out in a new worktree at `path`.
    pub fn create_branch_worktree(&self, branch: &str, base: Oid, worktree_path: &Path) -> Result<()> {
        clog_debug!(
            "GitOps::create_branch_worktree branch={} base={} path={}",
            branch,
            base,
            worktree_path.display()
        );
        if self.branch_exists(branch)? {
            return Err(Error::conflict(ConflictKind::BranchExists(branch.to_string())));
        }
        if worktree_path.exists() {
            return Err(Error::conflict(ConflictKind::WorktreeExists(
                worktree_path.to_path_buf(),
            )));
        }
        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let repo = self.repo()?;
        let commit = repo.find_commit(base)?;
        let branch_obj = repo.branch(branch, &commit, false)?;
        let branch_ref = branch_obj.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Branch names contain slashes; the folder name is the worktree name
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        if let Err(e) = repo.worktree(worktree_name, worktree_path, Some(&opts)) {
            // Leave no half-created branch behind
            if let Ok(mut b) = repo.find_branch(branch, BranchType::Local) {
                let _ = b.delete();
            }
            return Err(e.into());
        }
        clog_debug!("Worktree created for {}", branch);
        Ok(())
    }

    /// Remove a worktree and its admin directory, even if parts of the
    /// cleanup fail. The admin directory must go, otherwise git still
    /// considers the branch checked out and refuses to delete it.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        clog_debug!("GitOps::remove_worktree path={}", worktree_path.display());
        let repo = self.repo()?;
        let worktrees = repo.worktrees()?;

        let by_path: Option<String> = worktrees
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
            })
            .map(String::from);
        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from);
        let worktree_name = by_path.or_else(|| {
            folder_name.as_ref().and_then(|fname| {
                worktrees
                    .iter()
                    .flatten()
                    .find(|name| *name == fname.as_str())
                    .map(String::from)
            })
        });

        if let Some(ref name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(&mut prune_options())) {
                    clog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        for name in worktree_name.iter().chain(folder_name.iter()) {
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                clog_debug!("Cleaning up worktree admin dir: {}", admin_dir.display());
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }

        drop(repo);
        self.prune_worktrees()?;
        Ok(())
    }

    /// Prune admin entries whose working directory no longer exists.
    pub fn prune_worktrees(&self) -> Result<usize> {
        let repo = self.repo()?;
        let mut pruned = 0;
        for name in repo.worktrees()?.iter().flatten() {
            if let Ok(wt) = repo.find_worktree(name) {
                if !wt.path().exists() && wt.prune(Some(&mut prune_options())).is_ok() {
                    clog_debug!("Pruned stale worktree reference: {}", name);
                    pruned += 1;
                }
            }
        }
        Ok(pruned)
    }

    pub fn list_worktrees(&self) -> Result<Vec<(String, PathBuf)>> {
        let repo = self.repo()?;
        let mut out = Vec::new();
        for name in repo.worktrees()?.iter().flatten() {
            if let Ok(wt) = repo.find_worktree(name) {
                out.push((name.to_string(), wt.path().to_path_buf()));
            }
        }
        Ok(out)
    }

    /// Whether the worktree has staged, unstaged or untracked changes.
    pub fn is_dirty(worktree_path: &Path) -> Result<bool> {
        let repo = Repository::open(worktree_path)?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    /// Commit every pending change in the worktree. Returns `None` when
    /// there was nothing to commit.
    pub fn commit_all(worktree_path: &Path, message: &str) -> Result<Option<Oid>> {
        if !Self::is_dirty(worktree_path)? {
            return Ok(None);
        }
        clog_debug!(
            "GitOps::commit_all path={} message={}",
            worktree_path.display(),
            message
        );
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["."].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = signature(&repo)?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        clog_debug!("Commit created: {}", commit_id);
        Ok(Some(commit_id))
    }

    /// Delete a local branch. Missing branches are fine.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        clog_debug!("GitOps::delete_branch branch={}", branch);
        let repo = self.repo()?;
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut b) => {
                if let Err(e) = b.delete() {
                    clog_warn!("Failed to delete branch '{}': {}", branch, e);
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                clog_debug!("Branch '{}' not found (already deleted?)", branch);
            }
            Err(e) => clog_warn!("Error looking up branch '{}': {}", branch, e),
        }
        Ok(())
    }

    pub fn merge_base(&self, a: Oid, b: Oid) -> Result<Oid> {
        Ok(self.repo()?.merge_base(a, b)?)
    }

    /// Paths touched between two commits, renames counted on both sides.
    pub fn changed_files(&self, from: Oid, to: Oid) -> Result<BTreeSet<String>> {
        let repo = self.repo()?;
        let from_tree = repo.find_commit(from)?.tree()?;
        let to_tree = repo.find_commit(to)?.tree()?;
        let diff = repo.diff_tree_to_tree(Some(&from_tree), Some(&to_tree), None)?;
        let mut files = BTreeSet::new();
        for delta in diff.deltas() {
            for path in [delta.old_file().path(), delta.new_file().path()]
                .into_iter()
                .flatten()
            {
                files.insert(path.to_string_lossy().into_owned());
            }
        }
        Ok(files)
    }
}
