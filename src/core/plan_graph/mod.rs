//! Hierarchical plan execution: model, evaluator, approvals, and the dispatch loop.

pub mod adapter;
pub mod adapters;
pub mod approval;
pub mod checkpoint;
pub mod context;
pub mod executor;
pub mod expression;
pub mod observer;
pub mod schema;
pub mod state;

pub use adapter::{AdapterRegistry, AdapterRegistryBuilder, NodeAdapter, NodeContext};
pub use approval::{
    ApprovalController, ApprovalStatus, CompletedApprovalEntry, ManualApprovalRequest,
    PendingApprovalEntry,
};
pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use context::{CancellationFlag, EngineSettings, ExecutionContext};
pub use executor::{dry_run, execute, resume_execution};
pub use expression::ExpressionEvaluator;
pub use observer::LifecycleObserver;
pub use schema::{load_plan, load_plan_file, LoadedPlan, Node, NodeKind, NodeType, Plan, RiskLevel};
pub use state::{
    DryRunSummary, ExecutionReport, ExecutionResult, ExecutionStatus, NodeResult, NodeStatus,
    SharedState,
};
