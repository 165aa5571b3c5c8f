pub mod noop;
pub mod set_state;

use crate::core::plan_graph::adapter::{AdapterRegistryBuilder, NodeAdapter};
use crate::core::plan_graph::schema::NodeType;
use std::sync::Arc;

/// Register the built-in adapters: `local_task` writes shared state, every
/// other leaf type is a no-op stand-in.
pub fn register_builtins(builder: &mut AdapterRegistryBuilder) {
    builder.register(NodeType::LocalTask, set_state::SetStateAdapter::new());
    let noop: Arc<dyn NodeAdapter> = Arc::new(noop::NoopAdapter::new());
    for node_type in NodeType::LEAF_TYPES {
        if node_type != NodeType::LocalTask {
            builder.register_shared(node_type, Arc::clone(&noop));
        }
    }
}
