//! Worker tree lifecycle across the coordinator and the registry.

use conductor::core::{Role, WorkerId, WorkerStatus};
use conductor::coordinator::{Coordinator, SpawnRequest};
use conductor::config::StatePaths;
use conductor::registry::WorkerFilter;
use conductor::transport::{MemoryTransport, SessionTransport};
use conductor::ErrorKind;
use std::sync::Arc;

use super::fixtures::{test_config, Harness};

/// Given a Manager with one Specialist
/// When the Manager is terminated with cascade
/// Then both records are terminated and their sessions are gone
#[tokio::test]
async fn test_cascade_terminate_covers_subtree() {
    let h = Harness::new().await;
    let root = WorkerId::root();

    let mgr = h.spawn(Role::Manager, &root).await;
    assert_eq!(mgr.id.as_str(), "mgr_1");
    let spec = h.spawn(Role::Specialist, &mgr.id).await;
    assert_eq!(spec.id.as_str(), "spec_1_1");
    assert_eq!(spec.parent_id.as_ref(), Some(&mgr.id));

    let terminated = h.coordinator.terminate(&root, &mgr.id, true).await.unwrap();
    assert!(terminated.contains(&mgr.id));
    assert!(terminated.contains(&spec.id));

    for id in [&mgr.id, &spec.id] {
        let record = h.coordinator.registry().get(id).await.unwrap();
        assert_eq!(record.status, WorkerStatus::Terminated);
    }
    assert!(!h.transport.exists(&h.session(&spec.id)).unwrap());
    assert!(!h.transport.exists(&h.session(&mgr.id)).unwrap());

    // Terminating again is a no-op, not an error
    let again = h.coordinator.terminate(&root, &mgr.id, true).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn test_ids_follow_lineage() {
    let h = Harness::new().await;
    let root = WorkerId::root();
    let m1 = h.spawn(Role::Manager, &root).await;
    let m2 = h.spawn(Role::Manager, &root).await;
    let s21 = h.spawn(Role::Specialist, &m2.id).await;
    let s22 = h.spawn(Role::Specialist, &m2.id).await;

    assert_eq!(m1.id.as_str(), "mgr_1");
    assert_eq!(m2.id.as_str(), "mgr_2");
    assert_eq!(s21.id.as_str(), "spec_2_1");
    assert_eq!(s22.id.as_str(), "spec_2_2");
    assert_eq!(s22.depth, 2);
}

#[tokio::test]
async fn test_role_table_is_enforced() {
    let h = Harness::new().await;
    let root = WorkerId::root();
    let mgr = h.spawn(Role::Manager, &root).await;
    let spec = h.spawn(Role::Specialist, &mgr.id).await;

    // Specialists cannot spawn
    let req = SpawnRequest::new(Role::Specialist, spec.id.clone());
    let err = h.coordinator.spawn(&spec.id, req).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    // Managers cannot spawn Managers
    let req = SpawnRequest::new(Role::Manager, mgr.id.clone());
    let err = h.coordinator.spawn(&mgr.id, req).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    // Specialists cannot dispatch, even to themselves
    let err = h
        .coordinator
        .dispatch(&spec.id, &spec.id, "hello")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    // ...but they can look around
    let all = h
        .coordinator
        .enumerate(&spec.id, &WorkerFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn test_enumerate_filters() {
    let h = Harness::new().await;
    let root = WorkerId::root();
    let m1 = h.spawn(Role::Manager, &root).await;
    let m2 = h.spawn(Role::Manager, &root).await;
    h.spawn(Role::Specialist, &m1.id).await;
    h.spawn(Role::Specialist, &m2.id).await;
    h.coordinator.terminate(&root, &m2.id, true).await.unwrap();

    let live = h
        .coordinator
        .enumerate(&root, &WorkerFilter::live())
        .await
        .unwrap();
    let ids: Vec<&str> = live.iter().map(|w| w.id.as_str()).collect();
    assert!(ids.contains(&"mgr_1"));
    assert!(ids.contains(&"spec_1_1"));
    assert!(!ids.contains(&"mgr_2"));

    let subtree = h
        .coordinator
        .enumerate(
            &root,
            &WorkerFilter {
                subtree_of: Some(m2.id.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(subtree.len(), 2);
    assert!(subtree.iter().all(|w| w.status == WorkerStatus::Terminated));

    let specialists = h
        .coordinator
        .enumerate(
            &root,
            &WorkerFilter {
                role: Some(Role::Specialist),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(specialists.len(), 2);
}

/// A second coordinator process over the same state directory sees the
/// first one's workers and continues the id sequence.
#[tokio::test]
async fn test_state_is_shared_between_processes() {
    let h = Harness::new().await;
    let root = WorkerId::root();
    h.spawn(Role::Manager, &root).await;

    let other = Coordinator::open(
        test_config(),
        StatePaths::new(h.dir.path().join("state")),
        Arc::new(MemoryTransport::new()),
        None,
    )
    .unwrap();
    let workers = other
        .enumerate(&root, &WorkerFilter::default())
        .await
        .unwrap();
    assert_eq!(workers.len(), 2);

    let mut req = SpawnRequest::new(Role::Manager, root.clone());
    req.work_dir = Some(h.work_dir());
    let next = other.spawn(&root, req).await.unwrap();
    assert_eq!(next.id.as_str(), "mgr_2");

    // The first process picks the new worker up on its next read
    let seen = h
        .coordinator
        .enumerate(&root, &WorkerFilter::default())
        .await
        .unwrap();
    assert_eq!(seen.len(), 3);
}
