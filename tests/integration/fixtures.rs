//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories on `main`
//! - A coordinator over the in-memory transport
//! - Committing work inside a leased worktree

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::{IndexAddOption, Repository, RepositoryInitOptions, Signature};
use tempfile::TempDir;

use conductor::config::{Config, StatePaths};
use conductor::coordinator::{Coordinator, SpawnRequest};
use conductor::core::{Role, Worker, WorkerId};
use conductor::transport::MemoryTransport;

/// A test repository with a temporary directory and one commit on `main`.
pub struct TestRepo {
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("repo");
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        Repository::init_opts(&path, &opts).expect("Failed to init repository");

        let repo = Self { temp_dir, path };
        repo.write("README.md", "# Test Repository\n");
        repo.write("x.txt", "x\n");
        repo.write("y.txt", "y\n");
        commit_all(&repo.path, "Initial commit");
        repo
    }

    pub fn write(&self, name: &str, content: &str) {
        write_file(&self.path, name, content);
    }

    pub fn head(&self) -> String {
        let repo = Repository::open(&self.path).expect("Failed to open repository");
        let head = repo.head().expect("No HEAD");
        head.target().expect("Detached HEAD").to_string()
    }
}

pub fn write_file(root: &Path, name: &str, content: &str) {
    let file = root.join(name);
    if let Some(parent) = file.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directory");
    }
    std::fs::write(file, content).expect("Failed to write file");
}

/// Stage everything under `root` (a repo or worktree) and commit it on
/// the checked-out branch.
pub fn commit_all(root: &Path, message: &str) -> String {
    let repo = Repository::open(root).expect("Failed to open repository");
    let mut index = repo.index().expect("No index");
    index
        .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
        .expect("Failed to stage");
    index.write().expect("Failed to write index");
    let tree_id = index.write_tree().expect("Failed to write tree");
    let tree = repo.find_tree(tree_id).expect("Missing tree");
    let sig = Signature::now("Test User", "test@test.com").expect("Bad signature");
    let parents = match repo.head().ok().and_then(|h| h.peel_to_commit().ok()) {
        Some(parent) => vec![parent],
        None => Vec::new(),
    };
    let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
        .expect("Failed to commit")
        .to_string()
}

/// A coordinator over a [`MemoryTransport`], with a root Delegate.
pub struct Harness {
    pub dir: TempDir,
    pub transport: Arc<MemoryTransport>,
    pub coordinator: Arc<Coordinator>,
    pub repo: Option<TestRepo>,
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.transport.batch_window_ms = 1;
    config.detector.poll_interval_ms = 10;
    config.scheduler.spawn_wait_secs = 0;
    config.scheduler.lock_wait_secs = 0;
    config
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(test_config(), false).await
    }

    pub async fn with_repo() -> Self {
        Self::build(test_config(), true).await
    }

    pub async fn build(config: Config, with_repo: bool) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let repo = with_repo.then(TestRepo::new);
        let transport = Arc::new(MemoryTransport::new());
        let coordinator = Coordinator::open(
            config,
            StatePaths::new(dir.path().join("state")),
            transport.clone(),
            repo.as_ref().map(|r| r.path.as_path()),
        )
        .expect("Failed to open coordinator");
        coordinator
            .init_root(BTreeMap::new())
            .await
            .expect("Failed to create root");
        Self {
            dir,
            transport,
            coordinator: Arc::new(coordinator),
            repo,
        }
    }

    /// A second coordinator on the same state directory and repository,
    /// standing in for another `conductor` process.
    pub fn reopen(&self, config: Config) -> Arc<Coordinator> {
        let coordinator = Coordinator::open(
            config,
            StatePaths::new(self.dir.path().join("state")),
            Arc::new(MemoryTransport::new()),
            self.repo.as_ref().map(|r| r.path.as_path()),
        )
        .expect("Failed to reopen coordinator");
        Arc::new(coordinator)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    pub async fn spawn(&self, role: Role, parent: &WorkerId) -> Worker {
        let mut req = SpawnRequest::new(role, parent.clone());
        req.work_dir = Some(self.work_dir());
        self.coordinator
            .spawn(parent, req)
            .await
            .expect("Failed to spawn")
    }

    /// Tmux-style session name of `worker`.
    pub fn session(&self, worker: &WorkerId) -> String {
        format!("conductor_{}", worker)
    }
}
