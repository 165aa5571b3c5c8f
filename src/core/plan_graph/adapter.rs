#![allow(clippy::result_large_err)] // Adapter trait and registry return AppError directly for structured diagnostics without boxing.

use crate::core::error::AppError;
use crate::core::plan_graph::schema::{Node, NodeType};
use crate::core::plan_graph::state::{NodeResult, SharedState};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-invocation view handed to a leaf adapter.
pub struct NodeContext<'a> {
    pub plan_id: &'a str,
    pub execution_id: &'a str,
    pub shared_state: &'a mut SharedState,
}

/// Effector for one or more leaf node types.
///
/// Expected failures are reported as a failed [`NodeResult`]; an `Err` is
/// treated by the engine as an unexpected fault. Retries, if any, belong here.
#[async_trait]
pub trait NodeAdapter: Send + Sync + 'static {
    /// Adapter name used in logs.
    fn name(&self) -> &'static str;

    /// Execute the node against the shared state.
    async fn execute(&self, node: &Node, ctx: NodeContext<'_>) -> Result<NodeResult, AppError>;

    /// Validate the node without side effects, returning warnings.
    fn dry_run(&self, _node: &Node, _state: &SharedState) -> Vec<String> {
        Vec::new()
    }
}

/// Builder used to register adapters before execution.
pub struct AdapterRegistryBuilder {
    adapters: HashMap<NodeType, Arc<dyn NodeAdapter>>,
}

impl Default for AdapterRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistryBuilder {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register<T: NodeAdapter>(&mut self, node_type: NodeType, adapter: T) -> &mut Self {
        self.register_shared(node_type, Arc::new(adapter))
    }

    /// Register one adapter instance for a node type; panics on duplicates.
    pub fn register_shared(
        &mut self,
        node_type: NodeType,
        adapter: Arc<dyn NodeAdapter>,
    ) -> &mut Self {
        if self.adapters.contains_key(&node_type) {
            panic!("duplicate adapter registered for node type: {}", node_type);
        }
        self.adapters.insert(node_type, adapter);
        self
    }

    pub fn build(self) -> AdapterRegistry {
        AdapterRegistry {
            inner: Arc::new(self.adapters),
        }
    }
}

/// Immutable adapter table consulted by the dispatch loop.
#[derive(Clone)]
pub struct AdapterRegistry {
    inner: Arc<HashMap<NodeType, Arc<dyn NodeAdapter>>>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        AdapterRegistryBuilder::new().build()
    }

    pub fn builder() -> AdapterRegistryBuilder {
        AdapterRegistryBuilder::new()
    }

    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn NodeAdapter>> {
        self.inner.get(&node_type).cloned()
    }

    pub fn contains(&self, node_type: NodeType) -> bool {
        self.inner.contains_key(&node_type)
    }
}
