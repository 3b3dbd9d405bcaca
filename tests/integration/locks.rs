//! TTL locks and the per-Manager concurrency ceiling.

use std::sync::Arc;
use std::time::Duration;

use conductor::coordinator::SpawnRequest;
use conductor::core::{Role, WorkerId};
use conductor::orchestration::TtlLockManager;
use conductor::ErrorKind;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

use super::fixtures::{test_config, Harness};

fn lock_table(dir: &TempDir) -> TtlLockManager {
    TtlLockManager::open(dir.path().join("locks.json"))
}

/// Given w1 holds file:a.js briefly
/// When w2 claims immediately, then again after the ttl lapses
/// Then the first claim conflicts and the second succeeds
#[tokio::test]
async fn test_expired_claim_passes_to_next_holder() {
    let dir = TempDir::new().unwrap();
    let locks = lock_table(&dir);
    let ttl = Duration::from_millis(300);

    locks.claim("file:a.js", "w1", ttl).unwrap();
    let err = locks.claim("file:a.js", "w2", ttl).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    tokio::time::sleep(Duration::from_millis(400)).await;

    let info = assert_ok!(locks.claim("file:a.js", "w2", ttl));
    assert_eq!(info.holder, "w2");
    // The old holder finds out when it validates
    assert!(!locks.validate("file:a.js", "w1"));
    assert_err!(locks.release("file:a.js", "w1"));
}

#[tokio::test]
async fn test_waiting_claim_gets_lock_on_release() {
    let dir = TempDir::new().unwrap();
    let locks = Arc::new(lock_table(&dir));
    locks
        .claim("resource:db", "w1", Duration::from_secs(60))
        .unwrap();

    let waiter = {
        let locks = locks.clone();
        tokio::spawn(async move {
            locks
                .claim_with_wait(
                    "resource:db",
                    "w2",
                    Duration::from_secs(60),
                    Duration::from_secs(5),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_ok!(locks.release("resource:db", "w1"));

    let info = waiter.await.unwrap().unwrap();
    assert_eq!(info.holder, "w2");
}

#[tokio::test]
async fn test_terminate_releases_worker_locks() {
    let h = Harness::new().await;
    let mgr = h.spawn(Role::Manager, &WorkerId::root()).await;
    let locks = h.coordinator.locks();
    locks
        .claim("resource:deploy", mgr.id.as_str(), Duration::from_secs(60))
        .unwrap();

    h.coordinator
        .terminate(&WorkerId::root(), &mgr.id, true)
        .await
        .unwrap();

    assert!(locks.holder("resource:deploy").is_none());
}

/// Given a claim made through one coordinator process
/// When another process on the same state directory claims the same key
/// Then it sees the first holder
#[tokio::test]
async fn test_claims_are_shared_between_processes() {
    let h = Harness::new().await;
    let other = h.reopen(test_config());

    h.coordinator
        .locks()
        .claim("file:a.js", "w1", Duration::from_secs(60))
        .unwrap();
    let err = assert_err!(other
        .locks()
        .claim("file:a.js", "w2", Duration::from_secs(60)));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(other.locks().holder("file:a.js").as_deref(), Some("w1"));

    assert_ok!(h.coordinator.locks().release("file:a.js", "w1"));
    assert_ok!(other.locks().claim("file:a.js", "w2", Duration::from_secs(60)));
}

/// Given a ceiling of one Specialist per Manager, used up by one process
/// When another process asks for a Specialist under the same Manager
/// Then it gets no slot until the first Specialist is terminated
#[tokio::test]
async fn test_specialist_ceiling_holds_across_processes() {
    let mut config = test_config();
    config.scheduler.max_specialists_per_manager = 1;
    let h = Harness::build(config.clone(), false).await;
    let mgr = h.spawn(Role::Manager, &WorkerId::root()).await;
    let first = h.spawn(Role::Specialist, &mgr.id).await;
    let other = h.reopen(config);

    let mut req = SpawnRequest::new(Role::Specialist, mgr.id.clone());
    req.work_dir = Some(h.work_dir());
    let err = other.spawn(&mgr.id, req.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(other.governor().active(&mgr.id), 0);

    h.coordinator
        .terminate(&mgr.id, &first.id, true)
        .await
        .unwrap();
    let second = other.spawn(&mgr.id, req).await.unwrap();
    assert_eq!(second.id.as_str(), "spec_1_2");
}

/// Given a ceiling of one Specialist per Manager
/// When a second Specialist is requested
/// Then it waits until the first one is terminated
#[tokio::test]
async fn test_specialist_waits_for_slot() {
    let mut config = test_config();
    config.scheduler.max_specialists_per_manager = 1;
    config.scheduler.spawn_wait_secs = 10;
    let h = Harness::build(config, false).await;
    let mgr = h.spawn(Role::Manager, &WorkerId::root()).await;
    let first = h.spawn(Role::Specialist, &mgr.id).await;
    assert_eq!(h.coordinator.governor().active(&mgr.id), 1);

    let waiting = {
        let coordinator = h.coordinator.clone();
        let mut req = SpawnRequest::new(Role::Specialist, mgr.id.clone());
        req.work_dir = Some(h.work_dir());
        let caller = mgr.id.clone();
        tokio::spawn(async move { coordinator.spawn(&caller, req).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiting.is_finished());
    assert_eq!(h.coordinator.governor().waiting(&mgr.id), 1);

    h.coordinator
        .terminate(&mgr.id, &first.id, true)
        .await
        .unwrap();

    let second = waiting.await.unwrap().unwrap();
    assert_eq!(second.id.as_str(), "spec_1_2");
    assert_eq!(h.coordinator.governor().active(&mgr.id), 1);
}
