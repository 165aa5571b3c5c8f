use conductor::core::plan_graph::schema::{load_plan, load_plan_file, LoopMode, NodeKind, NodeType, RiskLevel};
use serde_json::json;
use std::fs;
use tempfile::TempDir;

fn code_of(raw: serde_json::Value) -> String {
    load_plan(raw).unwrap_err().code
}

#[test]
fn loads_plan_and_builds_node_map_and_adjacency() {
    let plan = load_plan(json!({
        "id": "deploy",
        "version": 3,
        "entry": "root",
        "nodes": [
            {"id": "root", "type": "sequence", "children": ["build", "gate"]},
            {"id": "build", "type": "local_task", "params": {"set": {"built": true}}},
            {"id": "gate", "type": "human_approval", "prompt": "ship it?"}
        ]
    }))
    .unwrap();

    assert_eq!(plan.id(), "deploy");
    assert_eq!(plan.version(), "3");
    assert_eq!(plan.entry(), "root");
    assert_eq!(plan.node_map.len(), 3);
    assert_eq!(
        plan.adjacency.get("root").unwrap(),
        &vec!["build".to_string(), "gate".to_string()]
    );
    assert_eq!(plan.node("build").unwrap().node_type(), NodeType::LocalTask);
    assert!(plan.node("gate").unwrap().is_gated());
    assert_eq!(plan.hash.len(), 64);
}

#[test]
fn high_risk_and_explicit_flags_gate_nodes() {
    let plan = load_plan(json!({
        "id": "p",
        "version": "1",
        "entry": "root",
        "nodes": [
            {"id": "root", "type": "parallel", "children": ["risky", "flagged", "plain"]},
            {"id": "risky", "type": "external_service", "riskLevel": "high"},
            {"id": "flagged", "type": "mcp_tool", "riskLevel": "low", "requiresApproval": true},
            {"id": "plain", "type": "agent_invocation", "riskLevel": "medium"}
        ]
    }))
    .unwrap();

    assert!(plan.node("risky").unwrap().is_gated());
    assert!(plan.node("flagged").unwrap().is_gated());
    assert!(!plan.node("plain").unwrap().is_gated());
    assert_eq!(plan.node("plain").unwrap().risk_level(), RiskLevel::Medium);
}

#[test]
fn rejects_dangling_child_reference() {
    let code = code_of(json!({
        "id": "p",
        "version": "1",
        "entry": "root",
        "nodes": [{"id": "root", "type": "sequence", "children": ["ghost"]}]
    }));
    assert_eq!(code, "PLN-LOAD-002");
}

#[test]
fn rejects_missing_entry() {
    let code = code_of(json!({
        "id": "p",
        "version": "1",
        "entry": "nowhere",
        "nodes": [{"id": "a", "type": "local_task"}]
    }));
    assert_eq!(code, "PLN-LOAD-002");
}

#[test]
fn rejects_duplicate_ids() {
    let code = code_of(json!({
        "id": "p",
        "version": "1",
        "entry": "a",
        "nodes": [
            {"id": "a", "type": "local_task"},
            {"id": "a", "type": "mcp_tool"}
        ]
    }));
    assert_eq!(code, "PLN-LOAD-003");
}

#[test]
fn rejects_structural_cycle() {
    let code = code_of(json!({
        "id": "p",
        "version": "1",
        "entry": "a",
        "nodes": [
            {"id": "a", "type": "sequence", "children": ["b"]},
            {"id": "b", "type": "sequence", "children": ["a"]}
        ]
    }));
    assert_eq!(code, "PLN-LOAD-004");
}

#[test]
fn rejects_loops_without_condition_or_collection() {
    let while_code = code_of(json!({
        "id": "p",
        "version": "1",
        "entry": "w",
        "nodes": [
            {"id": "w", "type": "loop", "mode": "while", "body": ["t"]},
            {"id": "t", "type": "local_task"}
        ]
    }));
    assert_eq!(while_code, "PLN-LOAD-005");

    let each_code = code_of(json!({
        "id": "p",
        "version": "1",
        "entry": "e",
        "nodes": [
            {"id": "e", "type": "loop", "mode": "forEach", "body": ["t"]},
            {"id": "t", "type": "local_task"}
        ]
    }));
    assert_eq!(each_code, "PLN-LOAD-005");
}

#[test]
fn rejects_malformed_rule_strings_at_load_time() {
    let code = code_of(json!({
        "id": "p",
        "version": "1",
        "entry": "c",
        "nodes": [
            {"id": "c", "type": "conditional", "condition": {"expression": "{\"==\": [1, "}, "whenTrue": ["t"]},
            {"id": "t", "type": "local_task"}
        ]
    }));
    assert_eq!(code, "PLN-EXPR-001");

    let unknown_op = code_of(json!({
        "id": "p",
        "version": "1",
        "entry": "c",
        "nodes": [
            {"id": "c", "type": "conditional", "condition": {"expression": {"frobnicate": [1]}}, "whenTrue": ["t"]},
            {"id": "t", "type": "local_task"}
        ]
    }));
    assert_eq!(unknown_op, "PLN-EXPR-001");
}

#[test]
fn rejects_unknown_node_type() {
    let code = code_of(json!({
        "id": "p",
        "version": "1",
        "entry": "a",
        "nodes": [{"id": "a", "type": "teleport"}]
    }));
    assert_eq!(code, "PLN-LOAD-001");
}

#[test]
fn loads_yaml_plan_file_with_loop_alias() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("plan.yaml");
    fs::write(
        &path,
        r#"
id: batch
version: 2
entry: each
nodes:
  - id: each
    type: loop
    mode: for-each
    collectionPath: items
    maxIterations: 5
    body: [work]
  - id: work
    type: local_task
"#,
    )
    .unwrap();

    let plan = load_plan_file(&path).unwrap();
    assert_eq!(plan.version(), "2");
    match &plan.node("each").unwrap().kind {
        NodeKind::Loop(spec) => {
            assert_eq!(spec.mode, LoopMode::ForEach);
            assert_eq!(spec.max_iterations, 5);
        }
        other => panic!("expected loop node, got {:?}", other),
    }
}

#[test]
fn same_document_hashes_identically() {
    let raw = json!({
        "id": "p",
        "version": "1",
        "entry": "a",
        "nodes": [{"id": "a", "type": "local_task"}]
    });
    let first = load_plan(raw.clone()).unwrap();
    let second = load_plan(raw).unwrap();
    assert_eq!(first.hash, second.hash);
}
