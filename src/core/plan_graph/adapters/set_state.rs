use crate::core::error::AppError;
use crate::core::plan_graph::adapter::{NodeAdapter, NodeContext};
use crate::core::plan_graph::schema::Node;
use crate::core::plan_graph::state::{NodeResult, SharedState};
use async_trait::async_trait;
use serde_json::{json, Value};

/// Writes `params.set` into shared state and reports `params.output`.
///
/// `params.fail` (a string) makes the node report a failed result instead.
pub struct SetStateAdapter;

impl Default for SetStateAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SetStateAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NodeAdapter for SetStateAdapter {
    fn name(&self) -> &'static str {
        "SetStateAdapter"
    }

    async fn execute(&self, node: &Node, ctx: NodeContext<'_>) -> Result<NodeResult, AppError> {
        let params = node.params().cloned().unwrap_or(Value::Null);
        if let Some(message) = params.get("fail").and_then(Value::as_str) {
            return Ok(NodeResult::failure(node.id.clone(), message));
        }

        let mut applied = Vec::new();
        match params.get("set") {
            Some(Value::Object(patch)) => {
                ctx.shared_state.merge(patch);
                applied.extend(patch.keys().cloned());
            }
            Some(other) if !other.is_null() => {
                return Ok(NodeResult::failure(
                    node.id.clone(),
                    "params.set must be an object",
                ));
            }
            _ => {}
        }

        let output = params
            .get("output")
            .cloned()
            .unwrap_or_else(|| json!({ "applied": applied }));
        Ok(NodeResult::success(node.id.clone(), output))
    }

    fn dry_run(&self, node: &Node, _state: &SharedState) -> Vec<String> {
        let mut warnings = Vec::new();
        match node.params() {
            Some(Value::Object(params)) => {
                if let Some(set) = params.get("set") {
                    if !set.is_object() {
                        warnings.push(format!("node '{}': params.set must be an object", node.id));
                    }
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => warnings.push(format!("node '{}': params must be an object", node.id)),
        }
        warnings
    }
}
