use conductor::core::plan_graph::{
    adapter::AdapterRegistry,
    adapters::{register_builtins, set_state::SetStateAdapter},
    approval::{ApprovalController, ApprovalStore, MemoryApprovalStore, PollingDelivery},
    context::ExecutionContext,
    executor::dry_run,
    schema::{load_plan, LoadedPlan, NodeType},
    state::SharedState,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn review_plan() -> LoadedPlan {
    load_plan(json!({
        "id": "review",
        "version": "3",
        "entry": "root",
        "nodes": [
            {"id": "root", "type": "sequence", "children": ["prepare", "check", "push"]},
            {"id": "prepare", "type": "local_task", "params": {"set": {"ready": true}}},
            {"id": "check", "type": "conditional",
             "condition": {"expression": {"var": "ready"}},
             "whenTrue": ["signoff"]},
            {"id": "signoff", "type": "human_approval", "prompt": "Ship it?"},
            {"id": "push", "type": "external_service", "requiresApproval": true}
        ]
    }))
    .unwrap()
}

fn controller() -> Arc<ApprovalController> {
    let store: Arc<dyn ApprovalStore> = Arc::new(MemoryApprovalStore::new());
    let delivery = Arc::new(PollingDelivery::new(Arc::clone(&store), Duration::from_millis(20)));
    Arc::new(ApprovalController::new(store, delivery))
}

#[test]
fn missing_adapters_are_reported_per_leaf() {
    let mut builder = AdapterRegistry::builder();
    builder.register(NodeType::LocalTask, SetStateAdapter::new());
    let ctx = ExecutionContext::new(builder.build()).with_approvals(controller());

    let summary = dry_run(&review_plan(), &ctx);

    assert_eq!(summary.plan_id, "review");
    assert_eq!(
        summary.warnings,
        vec!["no adapter registered for node 'push' of type external_service".to_string()]
    );
}

#[test]
fn gated_nodes_warn_without_approval_controller() {
    let mut builder = AdapterRegistry::builder();
    register_builtins(&mut builder);
    let ctx = ExecutionContext::new(builder.build());

    let summary = dry_run(&review_plan(), &ctx);

    let gate_warnings: Vec<_> = summary
        .warnings
        .iter()
        .filter(|warning| warning.contains("requires approval"))
        .collect();
    assert_eq!(gate_warnings.len(), 2);
    assert!(gate_warnings[0].contains("'signoff'"));
    assert!(gate_warnings[1].contains("'push'"));
}

#[test]
fn adapter_warnings_are_collected() {
    let plan = load_plan(json!({
        "id": "bad-params",
        "version": "1",
        "entry": "write",
        "nodes": [{"id": "write", "type": "local_task", "params": {"set": [1, 2]}}]
    }))
    .unwrap();
    let mut builder = AdapterRegistry::builder();
    builder.register(NodeType::LocalTask, SetStateAdapter::new());
    let ctx = ExecutionContext::new(builder.build());

    let summary = dry_run(&plan, &ctx);

    assert_eq!(
        summary.warnings,
        vec!["node 'write': params.set must be an object".to_string()]
    );
}

#[test]
fn dry_run_is_idempotent_and_leaves_state_untouched() {
    let mut builder = AdapterRegistry::builder();
    register_builtins(&mut builder);
    let mut state = SharedState::new();
    state.set("ready", json!(false));
    let ctx = ExecutionContext::new(builder.build())
        .with_shared_state(state.clone())
        .with_approvals(controller());
    let plan = review_plan();

    let first = dry_run(&plan, &ctx);
    let second = dry_run(&plan, &ctx);

    assert_eq!(first, second);
    assert_eq!(ctx.shared_state, state);
    assert!(ctx
        .approvals
        .as_ref()
        .unwrap()
        .list_pending()
        .unwrap()
        .is_empty());
}
