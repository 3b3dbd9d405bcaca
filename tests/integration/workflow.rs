//! Workflow runs driven against workers on the in-memory transport.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use conductor::core::{Role, WorkerId, WorkerStatus};
use conductor::workflow::{RunStatus, WorkflowDefinition, WorkflowEngine};

use super::fixtures::Harness;

const REVIEW: &str = r#"
name = "review"

[[stages]]
id = "work"
prompt = "Summarize the change and end by saying DONE"
completion_marker = "DONE"
timeout_seconds = 0.1
max_timeout_retries = 1
on_timeout = [{ type = "dispatch_prompt", prompt = "Reminder: finish and say DONE" }]
on_success = [{ type = "advance_stage", stage = "report" }]

[[stages]]
id = "report"
prompt = "Report back"
completion_marker = "REPORTED"
timeout_seconds = 0.1
on_success = [{ type = "complete_workflow" }]
"#;

/// Given a stage whose prompt itself contains the marker
/// When the worker never answers
/// Then the echoed prompt does not count, the timeout chain runs and the
/// run never reaches the next stage
#[tokio::test]
async fn test_echoed_marker_does_not_complete_stage() {
    let h = Harness::new().await;
    let mgr = h.spawn(Role::Manager, &WorkerId::root()).await;
    let engine = WorkflowEngine::new(h.coordinator.clone());
    let def = WorkflowDefinition::from_toml(REVIEW).unwrap();

    let run = engine
        .start(def, mgr.id.clone(), WorkerId::root(), BTreeMap::new())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.current_stage, "work");
    assert!(run.history.iter().all(|entry| entry.stage == "work"));
    assert!(run.context.get("work.response").is_none());

    let writes = h.transport.writes(&h.session(&mgr.id));
    assert!(writes.iter().any(|w| w.contains("end by saying DONE")));
    assert!(writes.iter().any(|w| w.starts_with("Reminder")));
}

#[tokio::test]
async fn test_genuine_reply_advances_run() {
    let h = Harness::new().await;
    h.transport.set_responder(|_session, text| {
        if text.contains("end by saying DONE") {
            Some("⏺ Two files changed.\nDONE".to_string())
        } else if text.contains("Report back") {
            Some("⏺ All good. REPORTED".to_string())
        } else {
            None
        }
    });
    let mgr = h.spawn(Role::Manager, &WorkerId::root()).await;
    let engine = WorkflowEngine::new(h.coordinator.clone());
    let def = WorkflowDefinition::from_toml(REVIEW).unwrap();

    let run = engine
        .start(def, mgr.id.clone(), WorkerId::root(), BTreeMap::new())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let response = run.context.get("work.response").and_then(Value::as_str).unwrap();
    assert!(response.contains("Two files changed"));
    assert_eq!(
        run.history.iter().map(|e| e.stage.as_str()).collect::<Vec<_>>(),
        vec!["work", "report"]
    );
}

/// A stage can grow the tree: spawn a Specialist under the run's worker,
/// then tear it down again.
#[tokio::test]
async fn test_subsystem_actions_act_as_run_owner() {
    let h = Harness::new().await;
    h.transport.set_responder(|_session, text| {
        text.contains("Plan the work")
            .then(|| "⏺ plan ready PLANNED".to_string())
    });
    let mgr = h.spawn(Role::Manager, &WorkerId::root()).await;
    let engine = WorkflowEngine::new(h.coordinator.clone());
    let def: WorkflowDefinition = serde_json::from_value(json!({
        "name": "fan-out",
        "stages": [{
            "id": "plan",
            "prompt": "Plan the work",
            "completion_marker": "PLANNED",
            "timeout_seconds": 2.0,
            "on_success": [
                {"type": "invoke_subsystem", "subsystem": "spawn", "role": "specialist",
                 "work_dir": "{{ dir }}", "context": "help with {{ run.workflow }}",
                 "output": "helper"},
                {"type": "invoke_subsystem", "subsystem": "terminate",
                 "worker": "{{ plan.helper.id }}"},
                {"type": "complete_workflow"}
            ]
        }]
    }))
    .unwrap();
    let mut vars = BTreeMap::new();
    vars.insert(
        "dir".to_string(),
        Value::String(h.work_dir().display().to_string()),
    );

    let run = engine
        .start(def, mgr.id.clone(), WorkerId::root(), vars)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let helper: WorkerId = run
        .context
        .get("plan.helper.id")
        .and_then(Value::as_str)
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(helper.as_str(), "spec_1_1");
    let record = h.coordinator.registry().get(&helper).await.unwrap();
    assert_eq!(record.parent_id.as_ref(), Some(&mgr.id));
    assert_eq!(record.status, WorkerStatus::Terminated);
}

/// Given a run waiting on its worker
/// When the worker is terminated
/// Then the run is aborted instead of timing out
#[tokio::test]
async fn test_terminated_worker_aborts_run() {
    let h = Harness::new().await;
    let mgr = h.spawn(Role::Manager, &WorkerId::root()).await;
    let engine = Arc::new(WorkflowEngine::new(h.coordinator.clone()));
    let mut def = WorkflowDefinition::from_toml(REVIEW).unwrap();
    def.stages[0].timeout_seconds = 30.0;

    let pending = {
        let engine = engine.clone();
        let worker = mgr.id.clone();
        tokio::spawn(async move {
            engine
                .start(def, worker, WorkerId::root(), BTreeMap::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.coordinator
        .terminate(&WorkerId::root(), &mgr.id, true)
        .await
        .unwrap();

    let run = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(engine.get(&run.id).await.unwrap().status, RunStatus::Aborted);
}
