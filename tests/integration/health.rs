//! Health monitoring over a small worker tree.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use conductor::core::{Role, WorkerId};
use conductor::orchestration::{HealthConfig, HealthEvent, HealthMonitor, RecoveryAction};
use conductor::transport::SessionTransport;

use super::fixtures::Harness;

/// Given a Manager and two Specialists
/// When one Specialist's session disappears
/// Then only that Specialist is reported and restarted
#[tokio::test]
async fn test_only_the_lost_session_is_recovered() {
    let h = Harness::new().await;
    let mgr = h.spawn(Role::Manager, &WorkerId::root()).await;
    let lost = h.spawn(Role::Specialist, &mgr.id).await;
    let kept = h.spawn(Role::Specialist, &mgr.id).await;
    let (tx, _rx) = mpsc::channel(64);
    let monitor = HealthMonitor::new(HealthConfig::default(), h.coordinator.clone(), tx);

    h.transport.kill(&h.session(&lost.id));
    let events = monitor.check_all().await;

    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|event| match event {
        HealthEvent::Unresponsive { worker, .. } => *worker == lost.id,
        HealthEvent::RecoveryTriggered { worker, action } => {
            *worker == lost.id && *action == RecoveryAction::Restart
        }
        _ => false,
    }));
    assert!(h.transport.exists(&h.session(&lost.id)).unwrap());
    assert_eq!(monitor.restarts(&lost.id).await, 1);
    assert_eq!(monitor.restarts(&kept.id).await, 0);
}

#[tokio::test]
async fn test_background_monitor_reports_and_stops() {
    let h = Harness::new().await;
    let mgr = h.spawn(Role::Manager, &WorkerId::root()).await;
    let (tx, mut rx) = mpsc::channel(64);
    let config = HealthConfig {
        probe_interval: Duration::from_millis(50),
        ..HealthConfig::default()
    };
    let monitor = HealthMonitor::new(config, h.coordinator.clone(), tx);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(monitor.run(cancel.clone()));

    h.transport.kill(&h.session(&mgr.id));
    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, HealthEvent::Unresponsive { worker, .. } if worker == mgr.id));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
}
