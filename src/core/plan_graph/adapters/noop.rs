use crate::core::error::AppError;
use crate::core::plan_graph::adapter::{NodeAdapter, NodeContext};
use crate::core::plan_graph::schema::Node;
use crate::core::plan_graph::state::{NodeResult, SharedState};
use async_trait::async_trait;
use serde_json::json;

/// Stand-in for effectors that live outside this crate.
pub struct NoopAdapter;

impl Default for NoopAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl NoopAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NodeAdapter for NoopAdapter {
    fn name(&self) -> &'static str {
        "NoopAdapter"
    }

    async fn execute(&self, node: &Node, _ctx: NodeContext<'_>) -> Result<NodeResult, AppError> {
        tracing::debug!(node_id = %node.id, node_type = %node.node_type(), "noop adapter executed");
        Ok(NodeResult::success(
            node.id.clone(),
            json!({"status": "ok", "nodeType": node.node_type().as_str()}),
        ))
    }

    fn dry_run(&self, node: &Node, _state: &SharedState) -> Vec<String> {
        vec![format!(
            "node '{}' ({}) is served by a no-op adapter",
            node.id,
            node.node_type()
        )]
    }
}
