use crate::core::plan_graph::schema::{LoadedPlan, Node};
use crate::core::plan_graph::state::{ExecutionStatus, NodeResult, SharedState};
use async_trait::async_trait;

/// Lifecycle hooks invoked by the dispatch loop.
///
/// Every hook defaults to a no-op so observers implement only what they need.
#[async_trait]
pub trait LifecycleObserver: Send + Sync {
    async fn start(&self, _plan: &LoadedPlan, _state: &SharedState) {}

    /// Fires for every gate or leaf node, before any approval gate.
    async fn before_node(&self, _node: &Node, _state: &SharedState) {}

    async fn after_node(&self, _result: &NodeResult, _state: &SharedState) {}

    async fn finish(&self, _status: ExecutionStatus, _state: &SharedState) {}
}
