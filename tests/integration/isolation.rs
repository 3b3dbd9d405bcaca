//! Worktree leases, file claims, conflict analysis and merge-back.

use std::time::Duration;

use conductor::coordinator::SpawnRequest;
use conductor::core::{Role, Worker, WorkerId};
use conductor::git::GitOps;
use conductor::isolation::{lease_key, MergeOutcome, ReleaseOptions, WorkTreeLease};
use conductor::{Error, ErrorKind};

use super::fixtures::{commit_all, test_config, write_file, Harness};

async fn spawn_with_task(h: &Harness, parent: &WorkerId, task: &str) -> (Worker, WorkTreeLease) {
    let mut req = SpawnRequest::new(Role::Specialist, parent.clone());
    req.task = Some(task.to_string());
    let worker = h.coordinator.spawn(parent, req).await.unwrap();
    let lease = h
        .coordinator
        .isolation()
        .unwrap()
        .lease(&lease_key(&worker.id, task))
        .await
        .unwrap();
    (worker, lease)
}

async fn two_leases(h: &Harness) -> (WorkTreeLease, WorkTreeLease) {
    let mgr = h.spawn(Role::Manager, &WorkerId::root()).await;
    let (_, a) = spawn_with_task(h, &mgr.id, "a").await;
    let (_, b) = spawn_with_task(h, &mgr.id, "b").await;
    (a, b)
}

#[tokio::test]
async fn test_spawn_with_task_gets_its_own_worktree() {
    let h = Harness::with_repo().await;
    let mgr = h.spawn(Role::Manager, &WorkerId::root()).await;
    let (worker, lease) = spawn_with_task(&h, &mgr.id, "docs").await;

    assert_eq!(lease.branch, "conductor/spec_1_1/docs");
    assert_eq!(lease.base_branch, "main");
    assert_eq!(worker.working_directory.as_deref(), Some(lease.path.as_path()));
    assert_eq!(worker.branch_name.as_deref(), Some("conductor/spec_1_1/docs"));
    assert!(lease.path.join("x.txt").exists());
}

/// Given two leases cut from main
/// When A edits x.txt and B edits x.txt and y.txt
/// Then only x.txt is reported as a conflict
#[tokio::test]
async fn test_conflicts_are_paths_changed_on_both_sides() {
    let h = Harness::with_repo().await;
    let (a, b) = two_leases(&h).await;

    write_file(&a.path, "x.txt", "x from a\n");
    commit_all(&a.path, "a edits x");
    write_file(&b.path, "y.txt", "y from b\n");
    write_file(&b.path, "x.txt", "x from b\n");
    commit_all(&b.path, "b edits x and y");

    let report = h
        .coordinator
        .isolation()
        .unwrap()
        .analyze_conflicts(&a.branch, &b.branch)
        .await
        .unwrap();

    assert_eq!(report.conflicts, vec!["x.txt".to_string()]);
    assert!(report.target_changes.contains("y.txt"));
    assert!(!report.source_changes.contains("y.txt"));
}

#[tokio::test]
async fn test_claims_are_exclusive_between_leases() {
    let h = Harness::with_repo().await;
    let (a, b) = two_leases(&h).await;
    let isolation = h.coordinator.isolation().unwrap();

    let updated = isolation
        .claim_files(&a.key(), &["x.txt".to_string()])
        .await
        .unwrap();
    assert!(updated.claimed_files.contains("x.txt"));

    let err = isolation
        .claim_files(&b.key(), &["y.txt".to_string(), "x.txt".to_string()])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    // The failed batch left nothing behind
    let b_now = isolation.lease(&b.key()).await.unwrap();
    assert!(b_now.claimed_files.is_empty());
    assert!(h.coordinator.locks().holder("file:y.txt").is_none());

    isolation.release_claims(&a.key(), None).await.unwrap();
    let b_now = isolation
        .claim_files(&b.key(), &["x.txt".to_string()])
        .await
        .unwrap();
    assert!(b_now.claimed_files.contains("x.txt"));
}

/// Given a file claim whose ttl lapsed while no process was running
/// When the state is opened again
/// Then the claim stays expired and another lease can take the file
#[tokio::test]
async fn test_expired_claim_is_not_revived_on_reopen() {
    let mut config = test_config();
    config.scheduler.claim_ttl_secs = 1;
    let h = Harness::build(config.clone(), true).await;
    let (a, b) = two_leases(&h).await;
    h.coordinator
        .isolation()
        .unwrap()
        .claim_files(&a.key(), &["x.txt".to_string()])
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let reopened = h.reopen(config);
    reopened.rehydrate().await.unwrap();

    assert!(reopened.locks().holder("file:x.txt").is_none());
    let b_now = reopened
        .isolation()
        .unwrap()
        .claim_files(&b.key(), &["x.txt".to_string()])
        .await
        .unwrap();
    assert!(b_now.claimed_files.contains("x.txt"));
    assert_eq!(
        reopened.locks().holder("file:x.txt").as_deref(),
        Some(b.key().as_str())
    );
}

#[tokio::test]
async fn test_merge_back_then_conflicting_merge_is_refused() {
    let h = Harness::with_repo().await;
    let repo = h.repo.as_ref().unwrap();
    let git = GitOps::new(&repo.path).unwrap();
    let isolation = h.coordinator.isolation().unwrap();
    let (a, b) = two_leases(&h).await;
    let initial = git.branch_tip("main").unwrap();

    write_file(&a.path, "x.txt", "x from a\n");
    write_file(&b.path, "x.txt", "x from b\n");

    // Pending work is committed on release, then merged
    let outcome = isolation
        .release_worktree(&a, ReleaseOptions::merge())
        .await
        .unwrap();
    assert!(outcome.committed.is_some());
    assert!(matches!(outcome.merged, Some(MergeOutcome::FastForward { .. })));
    assert!(outcome.branch_deleted);
    assert!(!a.path.exists());
    let merged_tip = git.branch_tip("main").unwrap();
    assert_ne!(merged_tip, initial);
    assert_eq!(repo.head(), merged_tip.to_string());

    let err = isolation
        .release_worktree(&b, ReleaseOptions::merge())
        .await
        .unwrap_err();
    match err.root_cause() {
        Error::Conflict(_) => assert_eq!(err.conflicting_files(), Some(&["x.txt".to_string()][..])),
        other => panic!("expected a merge conflict, got {:?}", other),
    }
    // Target untouched, lease kept for another attempt
    assert_eq!(git.branch_tip("main").unwrap(), merged_tip);
    assert!(isolation.lease(&b.key()).await.is_ok());
    assert!(b.path.exists());
}

#[tokio::test]
async fn test_terminate_abandons_leases_and_keeps_branches() {
    let h = Harness::with_repo().await;
    let repo = h.repo.as_ref().unwrap();
    let git = GitOps::new(&repo.path).unwrap();
    let mgr = h.spawn(Role::Manager, &WorkerId::root()).await;
    let (worker, lease) = spawn_with_task(&h, &mgr.id, "docs").await;
    let isolation = h.coordinator.isolation().unwrap();
    isolation
        .claim_files(&lease.key(), &["README.md".to_string()])
        .await
        .unwrap();

    h.coordinator
        .terminate(&WorkerId::root(), &mgr.id, true)
        .await
        .unwrap();

    assert!(isolation.leases_for(&worker.id).await.unwrap().is_empty());
    assert!(!lease.path.exists());
    assert!(git.branch_exists(&lease.branch).unwrap());
    assert!(h.coordinator.locks().holder("file:README.md").is_none());
}
