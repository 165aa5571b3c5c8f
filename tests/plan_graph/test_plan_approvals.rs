use conductor::core::config::{ApprovalSettings, DeliveryMode};
use conductor::core::plan_graph::{
    adapter::AdapterRegistry,
    adapters::register_builtins,
    approval::{
        ApprovalController, ApprovalStatus, ApprovalStore, DecisionDelivery,
        JsonlApprovalStore, ManualApprovalRequest, MemoryApprovalStore, PendingApprovalEntry,
        PollingDelivery, WatchDelivery,
    },
    context::ExecutionContext,
    executor::execute,
    schema::{load_plan, LoadedPlan, RiskLevel},
    state::ExecutionStatus,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

const WAIT_LIMIT: Duration = Duration::from_secs(10);

fn memory_controller() -> Arc<ApprovalController> {
    let store: Arc<dyn ApprovalStore> = Arc::new(MemoryApprovalStore::new());
    let delivery: Arc<dyn DecisionDelivery> =
        Arc::new(WatchDelivery::new(Arc::clone(&store), Duration::from_millis(20)).unwrap());
    Arc::new(ApprovalController::new(store, delivery))
}

fn gated_plan() -> LoadedPlan {
    load_plan(json!({
        "id": "release",
        "version": "7",
        "entry": "root",
        "nodes": [
            {"id": "root", "type": "sequence", "children": ["build", "deploy", "notify"]},
            {"id": "build", "type": "local_task", "params": {"set": {"artifact": "v7.tar"}}},
            {"id": "deploy", "type": "external_service", "riskLevel": "high", "params": {"target": "prod"}},
            {"id": "notify", "type": "mcp_tool"}
        ]
    }))
    .unwrap()
}

fn context_with(approvals: Arc<ApprovalController>) -> ExecutionContext {
    let mut builder = AdapterRegistry::builder();
    register_builtins(&mut builder);
    ExecutionContext::new(builder.build()).with_approvals(approvals)
}

/// Waits for the first pending entry to show up, then decides it.
async fn decide_first_pending(
    controller: Arc<ApprovalController>,
    status: ApprovalStatus,
    comment: Option<&str>,
) -> PendingApprovalEntry {
    loop {
        let pending = controller.list_pending().unwrap();
        if let Some(entry) = pending.into_iter().next() {
            controller
                .record_decision(&entry.id, status, comment.map(str::to_string))
                .unwrap();
            return entry;
        }
        sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn high_risk_node_blocks_until_approved() {
    let controller = memory_controller();
    let plan = gated_plan();
    let mut ctx = context_with(Arc::clone(&controller));

    let (result, decided) = timeout(WAIT_LIMIT, async {
        tokio::join!(
            execute(&plan, &mut ctx),
            decide_first_pending(Arc::clone(&controller), ApprovalStatus::Approved, None)
        )
    })
    .await
    .expect("approval flow timed out");
    let result = result.unwrap();

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(decided.node_id, "deploy");
    assert_eq!(decided.plan_id, "release");
    assert_eq!(decided.plan_version, "7");
    assert_eq!(decided.risk_level, RiskLevel::High);
    assert_eq!(decided.payload["params"], json!({"target": "prod"}));
    assert!(result.outputs.contains_key("notify"));
    assert!(controller.list_pending().unwrap().is_empty());
}

#[tokio::test]
async fn rejection_fails_run_with_comment_and_skips_rest() {
    let controller = memory_controller();
    let plan = gated_plan();
    let mut ctx = context_with(Arc::clone(&controller));

    let (result, _) = timeout(WAIT_LIMIT, async {
        tokio::join!(
            execute(&plan, &mut ctx),
            decide_first_pending(Arc::clone(&controller), ApprovalStatus::Rejected, Some("no"))
        )
    })
    .await
    .expect("approval flow timed out");
    let result = result.unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    let error = result.error.unwrap();
    assert_eq!(error.code, "PLN-APPR-001");
    assert!(error.message.ends_with(": no"));
    assert!(result.outputs.contains_key("build"));
    assert!(!result.outputs.contains_key("deploy"));
    assert!(!result.outputs.contains_key("notify"));
}

#[tokio::test]
async fn human_approval_node_records_decision_output() {
    let controller = memory_controller();
    let plan = load_plan(json!({
        "id": "signoff",
        "version": "1",
        "entry": "ask",
        "nodes": [{"id": "ask", "type": "human_approval", "prompt": "Proceed?"}]
    }))
    .unwrap();
    let mut ctx = context_with(Arc::clone(&controller));

    let (result, entry) = timeout(WAIT_LIMIT, async {
        tokio::join!(
            execute(&plan, &mut ctx),
            decide_first_pending(Arc::clone(&controller), ApprovalStatus::Approved, Some("lgtm"))
        )
    })
    .await
    .expect("approval flow timed out");
    let result = result.unwrap();

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(entry.payload["prompt"], json!("Proceed?"));
    let output = result.outputs["ask"].output.clone().unwrap();
    assert_eq!(output["approved"], json!(true));
    assert_eq!(output["approvalId"], json!(entry.id));
    assert_eq!(output["comment"], json!("lgtm"));
}

#[tokio::test]
async fn ensure_approval_is_noop_for_ungated_nodes() {
    let controller = memory_controller();
    let plan = gated_plan();

    let outcome = controller
        .ensure_approval(plan.id(), plan.version(), plan.node("build").unwrap())
        .await
        .unwrap();

    assert!(outcome.is_none());
    assert!(controller.list_pending().unwrap().is_empty());
}

#[tokio::test]
async fn ensure_approval_returns_decision_for_the_created_entry() {
    let controller = memory_controller();
    let plan = gated_plan();
    let node = plan.node("deploy").unwrap();

    let (decision, pending) = timeout(WAIT_LIMIT, async {
        tokio::join!(
            controller.ensure_approval(plan.id(), plan.version(), node),
            decide_first_pending(Arc::clone(&controller), ApprovalStatus::Approved, None)
        )
    })
    .await
    .expect("approval flow timed out");

    let decision = decision.unwrap().expect("gated node must produce a decision");
    assert_eq!(decision.pending.id, pending.id);
    assert_eq!(decision.decided_by, "operator");
}

#[tokio::test]
async fn decision_recorded_before_wait_is_not_lost() {
    for delivery in ["watch", "poll"] {
        let store: Arc<dyn ApprovalStore> = Arc::new(MemoryApprovalStore::new());
        let delivery: Arc<dyn DecisionDelivery> = match delivery {
            "watch" => Arc::new(WatchDelivery::new(Arc::clone(&store), Duration::from_millis(20)).unwrap()),
            _ => Arc::new(PollingDelivery::new(Arc::clone(&store), Duration::from_millis(20))),
        };
        let controller = ApprovalController::new(store, delivery);
        let pending = controller
            .create_manual_approval(ManualApprovalRequest {
                plan_id: "ext".to_string(),
                plan_version: "1".to_string(),
                node_id: "plugin-gate".to_string(),
                node_type: "external_service".to_string(),
                ..ManualApprovalRequest::default()
            })
            .unwrap();
        controller
            .record_decision(&pending.id, ApprovalStatus::Approved, None)
            .unwrap();

        let decision = timeout(WAIT_LIMIT, controller.wait_for_decision(&pending.id))
            .await
            .expect("early decision was missed")
            .unwrap();
        assert!(decision.is_approved());
    }
}

#[tokio::test]
async fn concurrent_waiters_resolve_independently() {
    let store: Arc<dyn ApprovalStore> = Arc::new(MemoryApprovalStore::new());
    let watch = Arc::new(WatchDelivery::new(Arc::clone(&store), Duration::from_millis(20)).unwrap());
    let controller = Arc::new(ApprovalController::new(store, watch.clone()));
    let request = |node: &str| ManualApprovalRequest {
        plan_id: "multi".to_string(),
        plan_version: "1".to_string(),
        node_id: node.to_string(),
        node_type: "mcp_tool".to_string(),
        ..ManualApprovalRequest::default()
    };
    let first = controller.create_manual_approval(request("a")).unwrap();
    let second = controller.create_manual_approval(request("b")).unwrap();

    let first_wait = {
        let controller = Arc::clone(&controller);
        let id = first.id.clone();
        tokio::spawn(async move { controller.wait_for_decision(&id).await })
    };
    let second_wait = {
        let controller = Arc::clone(&controller);
        let id = second.id.clone();
        tokio::spawn(async move { controller.wait_for_decision(&id).await })
    };

    timeout(WAIT_LIMIT, async {
        while watch.waiting_ids() < 2 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("waiters never registered");

    controller
        .record_decision(&second.id, ApprovalStatus::Rejected, Some("later".to_string()))
        .unwrap();
    let second_decision = timeout(WAIT_LIMIT, second_wait).await.unwrap().unwrap().unwrap();
    assert_eq!(second_decision.status, ApprovalStatus::Rejected);
    assert!(!first_wait.is_finished());
    assert_eq!(watch.waiting_ids(), 1);

    controller
        .record_decision(&first.id, ApprovalStatus::Approved, None)
        .unwrap();
    let first_decision = timeout(WAIT_LIMIT, first_wait).await.unwrap().unwrap().unwrap();
    assert!(first_decision.is_approved());
}

#[tokio::test]
async fn record_decision_rejects_unknown_and_repeated_ids() {
    let controller = memory_controller();
    let unknown = controller
        .record_decision("missing", ApprovalStatus::Approved, None)
        .unwrap_err();
    assert_eq!(unknown.code, "PLN-APPR-002");

    let pending = controller
        .create_manual_approval(ManualApprovalRequest {
            plan_id: "p".to_string(),
            plan_version: "1".to_string(),
            node_id: "n".to_string(),
            node_type: "local_task".to_string(),
            ..ManualApprovalRequest::default()
        })
        .unwrap();
    controller
        .record_decision(&pending.id, ApprovalStatus::Approved, None)
        .unwrap();
    let repeated = controller
        .record_decision(&pending.id, ApprovalStatus::Rejected, None)
        .unwrap_err();
    assert_eq!(repeated.code, "PLN-APPR-003");
}

#[tokio::test]
async fn pending_callback_sees_every_new_entry() {
    let controller = memory_controller();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    controller.set_pending_callback(Some(Arc::new(move |entry: &PendingApprovalEntry| {
        sink.lock().unwrap().push(entry.node_id.clone());
    })));

    controller
        .create_manual_approval(ManualApprovalRequest {
            plan_id: "p".to_string(),
            plan_version: "1".to_string(),
            node_id: "gate-1".to_string(),
            node_type: "mcp_tool".to_string(),
            ..ManualApprovalRequest::default()
        })
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["gate-1"]);
}

#[tokio::test]
async fn file_store_decision_from_second_controller_unblocks_watcher() {
    let workspace = TempDir::new().unwrap();
    let settings = ApprovalSettings {
        delivery: DeliveryMode::Watch,
        poll_interval: Duration::from_millis(25),
        ..ApprovalSettings::default()
    };
    let waiter = Arc::new(ApprovalController::from_settings(&settings, workspace.path()).unwrap());
    let decider = ApprovalController::from_settings(
        &ApprovalSettings {
            delivery: DeliveryMode::Poll,
            ..settings.clone()
        },
        workspace.path(),
    )
    .unwrap();
    assert_eq!(waiter.delivery_name(), "watch");
    assert_eq!(decider.delivery_name(), "poll");

    let plan = gated_plan();
    let mut ctx = context_with(Arc::clone(&waiter));

    let (result, _) = timeout(WAIT_LIMIT, async {
        tokio::join!(execute(&plan, &mut ctx), async {
            loop {
                if let Some(entry) = decider.list_pending().unwrap().into_iter().next() {
                    decider
                        .record_decision(&entry.id, ApprovalStatus::Approved, None)
                        .unwrap();
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
    })
    .await
    .expect("file watcher never delivered the decision");

    assert_eq!(result.unwrap().status, ExecutionStatus::Success);
    let store = JsonlApprovalStore::new(workspace.path().join(&settings.store_dir)).unwrap();
    assert_eq!(store.list_completed().unwrap().len(), 1);
}

#[tokio::test]
async fn cancellation_ends_an_approval_wait() {
    let controller = memory_controller();
    let plan = gated_plan();
    let mut ctx = context_with(Arc::clone(&controller));
    let cancel = ctx.cancel.clone();

    let (result, _) = timeout(WAIT_LIMIT, async {
        tokio::join!(execute(&plan, &mut ctx), async {
            while controller.list_pending().unwrap().is_empty() {
                sleep(Duration::from_millis(5)).await;
            }
            cancel.cancel();
        })
    })
    .await
    .expect("cancellation did not end the wait");
    let result = result.unwrap();

    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert!(!result.outputs.contains_key("deploy"));
}

#[test]
fn racing_decisions_record_exactly_one_outcome() {
    let workspace = TempDir::new().unwrap();
    let store = Arc::new(JsonlApprovalStore::new(workspace.path().join("approvals")).unwrap());
    let dyn_store: Arc<dyn ApprovalStore> = store.clone();
    let delivery: Arc<dyn DecisionDelivery> = Arc::new(PollingDelivery::new(
        Arc::clone(&dyn_store),
        Duration::from_millis(20),
    ));
    let controller = ApprovalController::new(dyn_store, delivery);

    for round in 0..20 {
        let pending = controller
            .create_manual_approval(ManualApprovalRequest {
                plan_id: "p".to_string(),
                plan_version: "1".to_string(),
                node_id: format!("gate-{round}"),
                node_type: "external_service".to_string(),
                ..ManualApprovalRequest::default()
            })
            .unwrap();
        let barrier = std::sync::Barrier::new(8);

        let outcomes: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let (controller, barrier, id) = (&controller, &barrier, &pending.id);
                    scope.spawn(move || {
                        let status = if i % 2 == 0 {
                            ApprovalStatus::Approved
                        } else {
                            ApprovalStatus::Rejected
                        };
                        barrier.wait();
                        controller.record_decision(id, status, None)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let accepted: Vec<_> = outcomes.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(accepted.len(), 1);
        assert!(outcomes
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|err| err.code == "PLN-APPR-003"));

        let recorded: Vec<_> = store
            .list_completed()
            .unwrap()
            .into_iter()
            .filter(|entry| entry.pending.id == pending.id)
            .collect();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].status, accepted[0].status);
    }
}
