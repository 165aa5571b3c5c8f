use async_trait::async_trait;
use conductor::core::error::AppError;
use conductor::core::plan_graph::{
    adapter::{AdapterRegistry, NodeAdapter, NodeContext},
    adapters::{register_builtins, set_state::SetStateAdapter},
    checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore},
    context::{EngineSettings, ExecutionContext},
    executor::{execute, resume_execution},
    schema::{load_plan, LoadedPlan, Node, NodeType},
    state::{ExecutionStatus, NodeResult, SharedState},
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Fails on its first call and succeeds afterwards.
struct FlakyAdapter {
    tripped: AtomicBool,
}

#[async_trait]
impl NodeAdapter for FlakyAdapter {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn execute(&self, node: &Node, ctx: NodeContext<'_>) -> Result<NodeResult, AppError> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Ok(NodeResult::failure(node.id.clone(), "upstream unavailable"));
        }
        ctx.shared_state.set("published", json!(true));
        Ok(NodeResult::success(node.id.clone(), json!("published")))
    }
}

fn pipeline(version: &str) -> LoadedPlan {
    load_plan(json!({
        "id": "pipeline",
        "version": version,
        "entry": "root",
        "nodes": [
            {"id": "root", "type": "sequence", "children": ["fetch", "publish", "report"]},
            {"id": "fetch", "type": "local_task", "params": {"set": {"fetched": 42}}},
            {"id": "publish", "type": "external_service"},
            {"id": "report", "type": "local_task", "params": {"set": {"reported": true}}}
        ]
    }))
    .unwrap()
}

fn flaky_registry() -> AdapterRegistry {
    let mut builder = AdapterRegistry::builder();
    builder.register(NodeType::LocalTask, SetStateAdapter::new());
    builder.register(
        NodeType::ExternalService,
        FlakyAdapter {
            tripped: AtomicBool::new(false),
        },
    );
    builder.build()
}

fn builtin_context() -> ExecutionContext {
    let mut builder = AdapterRegistry::builder();
    register_builtins(&mut builder);
    ExecutionContext::new(builder.build())
}

#[tokio::test]
async fn checkpoint_saved_after_every_successful_leaf() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let plan = pipeline("1");
    let mut ctx = builtin_context().with_checkpoint_store(store.clone());

    let result = execute(&plan, &mut ctx).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(store.save_count(), 3);
    let latest = store.load("pipeline").unwrap().unwrap();
    assert_eq!(latest.last_node_id.as_deref(), Some("report"));
    assert!(latest.queue.is_empty());
    assert_eq!(latest.plan_hash, plan.hash);
    assert_eq!(latest.shared_state.get("reported"), Some(&json!(true)));
}

#[tokio::test]
async fn per_node_checkpoints_can_be_disabled() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let plan = pipeline("1");
    let mut ctx = builtin_context()
        .with_checkpoint_store(store.clone())
        .with_settings(EngineSettings {
            checkpoint_on_each_node: false,
            ..EngineSettings::default()
        });

    let result = execute(&plan, &mut ctx).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(store.save_count(), 0);
    assert!(store.load("pipeline").unwrap().is_none());
}

#[tokio::test]
async fn failed_run_resumes_from_last_successful_node() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileCheckpointStore::new(dir.path()));
    let plan = pipeline("1");
    let mut ctx = ExecutionContext::new(flaky_registry()).with_checkpoint_store(store.clone());

    let first = execute(&plan, &mut ctx).await.unwrap();
    assert_eq!(first.status, ExecutionStatus::Failed);
    assert_eq!(first.error.as_ref().unwrap().code, "PLN-EXEC-003");

    let path = dir.path().join("pipeline").join("checkpoint.json");
    assert!(path.exists());
    let checkpoint = store.load("pipeline").unwrap().unwrap();
    assert_eq!(checkpoint.last_node_id.as_deref(), Some("fetch"));
    assert_eq!(checkpoint.queue, vec!["report".to_string(), "publish".to_string()]);

    // Same adapter instance, so the retry succeeds.
    ctx.shared_state = SharedState::new();
    let resumed = resume_execution(&plan, &mut ctx, checkpoint).await.unwrap();

    assert_eq!(resumed.status, ExecutionStatus::Success);
    assert!(!resumed.outputs.contains_key("fetch"));
    assert!(resumed.outputs.contains_key("publish"));
    assert!(resumed.outputs.contains_key("report"));
    assert_eq!(ctx.shared_state.get("fetched"), Some(&json!(42)));
    assert_eq!(ctx.shared_state.get("published"), Some(&json!(true)));
    assert_eq!(resumed.last_node_id.as_deref(), Some("report"));
}

#[tokio::test]
async fn resume_rejects_checkpoint_from_another_plan_version() {
    let old_plan = pipeline("1");
    let new_plan = pipeline("2");
    let checkpoint = Checkpoint::capture(
        &old_plan,
        Some("fetch".to_string()),
        vec!["report".to_string(), "publish".to_string()],
        &SharedState::new(),
    );
    let mut ctx = builtin_context();

    let err = resume_execution(&new_plan, &mut ctx, checkpoint)
        .await
        .unwrap_err();

    assert_eq!(err.code, "PLN-CKPT-001");
    assert!(err.message.contains("plan version"));
}

#[tokio::test]
async fn manual_checkpoint_resumes_with_its_shared_state() {
    let plan = pipeline("1");
    let mut state = SharedState::new();
    state.set("fetched", json!(7));
    let checkpoint = Checkpoint::capture(
        &plan,
        Some("publish".to_string()),
        vec!["report".to_string()],
        &state,
    );
    let mut ctx = builtin_context();

    let result = resume_execution(&plan, &mut ctx, checkpoint).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.outputs.keys().collect::<Vec<_>>(), vec!["report"]);
    assert_eq!(ctx.shared_state.get("fetched"), Some(&json!(7)));
    assert_eq!(ctx.shared_state.get("reported"), Some(&json!(true)));
}

#[tokio::test]
async fn history_keeps_timestamped_copies() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileCheckpointStore::new(dir.path()).with_history(true));
    let plan = pipeline("1");
    let mut ctx = builtin_context().with_checkpoint_store(store.clone());

    execute(&plan, &mut ctx).await.unwrap();

    let history: Vec<_> = std::fs::read_dir(store.history_dir("pipeline").unwrap())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(!history.is_empty());
    assert!(history
        .iter()
        .all(|name| name.starts_with("checkpoint-") && name.ends_with(".json")));
    assert!(store.checkpoint_path("pipeline").unwrap().exists());
}

#[test]
fn file_store_rejects_unsafe_plan_ids() {
    let dir = TempDir::new().unwrap();
    let store = FileCheckpointStore::new(dir.path());
    assert!(store.checkpoint_path("../escape").is_err());
    assert!(store.load("nested/plan").is_err());
}

#[test]
fn file_store_reports_missing_and_corrupt_checkpoints() {
    let dir = TempDir::new().unwrap();
    let store = FileCheckpointStore::new(dir.path());
    assert!(store.load("absent").unwrap().is_none());

    let path = store.checkpoint_path("broken").unwrap();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "{not json").unwrap();
    assert_eq!(store.load("broken").unwrap_err().code, "PLN-CKPT-002");
}
