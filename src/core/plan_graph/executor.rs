#![allow(clippy::result_large_err)] // Executor returns AppError to preserve full diagnostic context; boxing would discard run-time state.

use crate::core::error::AppError;
use crate::core::plan_graph::adapter::{NodeAdapter, NodeContext};
use crate::core::plan_graph::approval::CompletedApprovalEntry;
use crate::core::plan_graph::checkpoint::Checkpoint;
use crate::core::plan_graph::context::ExecutionContext;
use crate::core::plan_graph::schema::{LoadedPlan, LoopMode, LoopSpec, Node, NodeKind, NodeType};
use crate::core::plan_graph::state::{
    error_key, loop_index_key, loop_item_key, output_key, DryRunSummary, ExecutionResult,
    ExecutionState, NodeResult,
};
use crate::core::types::ErrorCategory;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

/// Run `plan` to completion, failure, or cancellation.
///
/// Fatal node conditions end up in `ExecutionResult.error`; `Err` is
/// reserved for checkpoint persistence failures.
pub async fn execute(
    plan: &LoadedPlan,
    ctx: &mut ExecutionContext,
) -> Result<ExecutionResult, AppError> {
    let state = ExecutionState::new(vec![plan.entry().to_string()]);
    PlanRun::new(plan, ctx, state).run().await
}

/// Continue a run from a checkpoint taken from the same plan document.
pub async fn resume_execution(
    plan: &LoadedPlan,
    ctx: &mut ExecutionContext,
    checkpoint: Checkpoint,
) -> Result<ExecutionResult, AppError> {
    checkpoint.verify_matches(plan)?;
    tracing::info!(
        plan_id = %plan.id(),
        last_node_id = ?checkpoint.last_node_id,
        queued = checkpoint.queue.len(),
        "resuming plan from checkpoint"
    );
    ctx.shared_state = checkpoint.shared_state;
    let mut state = ExecutionState::new(checkpoint.queue);
    state.last_node_id = checkpoint.last_node_id;
    PlanRun::new(plan, ctx, state).run().await
}

/// Ask each leaf adapter for warnings without executing anything.
pub fn dry_run(plan: &LoadedPlan, ctx: &ExecutionContext) -> DryRunSummary {
    let mut warnings = Vec::new();
    for node in plan.leaf_nodes() {
        if node.is_gated() && ctx.approvals.is_none() {
            warnings.push(format!(
                "node '{}' requires approval but no approval controller is configured",
                node.id
            ));
        }
        if node.node_type() == NodeType::HumanApproval {
            continue;
        }
        match ctx.adapters.get(node.node_type()) {
            Some(adapter) => warnings.extend(adapter.dry_run(node, &ctx.shared_state)),
            None => warnings.push(format!(
                "no adapter registered for node '{}' of type {}",
                node.id,
                node.node_type()
            )),
        }
    }
    DryRunSummary {
        plan_id: plan.id().to_string(),
        warnings,
    }
}

struct PlanRun<'a> {
    plan: &'a LoadedPlan,
    ctx: &'a mut ExecutionContext,
    state: ExecutionState,
    execution_id: String,
    started_at: DateTime<Utc>,
}

enum GateOutcome {
    Open,
    Approved(CompletedApprovalEntry),
    Cancelled,
}

impl<'a> PlanRun<'a> {
    fn new(plan: &'a LoadedPlan, ctx: &'a mut ExecutionContext, state: ExecutionState) -> Self {
        Self {
            plan,
            ctx,
            state,
            execution_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
        }
    }

    async fn run(mut self) -> Result<ExecutionResult, AppError> {
        tracing::info!(
            plan_id = %self.plan.id(),
            execution_id = %self.execution_id,
            "plan execution started"
        );
        if let Some(observer) = self.ctx.observer.clone() {
            observer.start(self.plan, &self.ctx.shared_state).await;
        }

        while !self.state.is_terminal() {
            if self.ctx.cancel.is_cancelled() {
                tracing::info!(plan_id = %self.plan.id(), "plan execution cancelled");
                self.state.cancel();
                break;
            }
            let Some(node_id) = self.state.queue.pop() else {
                break;
            };
            let plan = self.plan;
            let Some(node) = plan.node(&node_id) else {
                self.state.fail(
                    AppError::new(
                        ErrorCategory::ValidationError,
                        format!("node '{}' is not present in plan {}", node_id, plan.id()),
                    )
                    .with_code("PLN-EXEC-001"),
                );
                break;
            };
            self.state.current_node_id = Some(node_id);
            tracing::debug!(node_id = %node.id, node_type = %node.node_type(), "dispatching node");

            match &node.kind {
                NodeKind::Sequence(group) => self.push_in_order(&group.children),
                // Queue ordering only; children run one after another.
                NodeKind::Parallel(group) => {
                    self.state.queue.extend(group.children.iter().cloned());
                }
                NodeKind::Conditional(spec) => {
                    let evaluator = &self.ctx.evaluator;
                    let shared = &self.ctx.shared_state;
                    let taken = match self.plan.expression(&node.id) {
                        Some(compiled) => evaluator.condition_holds(compiled, shared),
                        None => evaluator.evaluate_condition(&spec.condition.expression, shared),
                    };
                    tracing::debug!(node_id = %node.id, branch = taken, "conditional evaluated");
                    let branch = if taken { &spec.when_true } else { &spec.when_false };
                    self.push_in_order(branch);
                }
                NodeKind::Loop(spec) => self.visit_loop(node, spec),
                _ => self.visit_action(node).await?,
            }
        }

        self.state.current_node_id = None;
        let status = self.state.status;
        if let Some(observer) = self.ctx.observer.clone() {
            observer.finish(status, &self.ctx.shared_state).await;
        }
        match &self.state.error {
            Some(error) => tracing::warn!(
                plan_id = %self.plan.id(),
                status = %status,
                error = %error,
                "plan execution finished"
            ),
            None => tracing::info!(plan_id = %self.plan.id(), status = %status, "plan execution finished"),
        }

        Ok(ExecutionResult {
            plan_id: self.plan.id().to_string(),
            status,
            started_at: self.started_at,
            finished_at: Utc::now(),
            last_node_id: self.state.last_node_id,
            outputs: self.state.outputs,
            error: self.state.error,
        })
    }

    /// Push ids so the first one is popped next.
    fn push_in_order(&mut self, ids: &[String]) {
        self.state.queue.extend(ids.iter().rev().cloned());
    }

    fn visit_loop(&mut self, node: &Node, spec: &LoopSpec) {
        let shared = &mut self.ctx.shared_state;
        let mut cursor = shared.loop_cursor(&node.id);
        match spec.mode {
            LoopMode::While => {
                if cursor.iterations >= spec.max_iterations {
                    tracing::debug!(node_id = %node.id, max = spec.max_iterations, "loop reached maxIterations");
                    shared.reset_loop_cursor(&node.id);
                    return;
                }
                let Some(condition) = &spec.condition else {
                    shared.reset_loop_cursor(&node.id);
                    return;
                };
                let holds = match self.plan.expression(&node.id) {
                    Some(compiled) => self.ctx.evaluator.condition_holds(compiled, shared),
                    None => self.ctx.evaluator.evaluate_condition(&condition.expression, shared),
                };
                if !holds {
                    shared.reset_loop_cursor(&node.id);
                    return;
                }
                cursor.iterations += 1;
                shared.set_loop_cursor(&node.id, cursor);
            }
            LoopMode::ForEach => {
                let items = match (self.plan.expression(&node.id), &spec.collection_path) {
                    (Some(compiled), _) => self.ctx.evaluator.collection_items(compiled, shared),
                    (None, Some(path)) => self.ctx.evaluator.read_collection(path, shared),
                    (None, None) => Vec::new(),
                };
                let index = cursor.index as usize;
                if index >= items.len() || cursor.index >= spec.max_iterations {
                    shared.reset_loop_cursor(&node.id);
                    return;
                }
                shared.set(loop_item_key(&node.id), items[index].clone());
                shared.set(loop_index_key(&node.id), json!(index));
                cursor.index += 1;
                cursor.iterations += 1;
                shared.set_loop_cursor(&node.id, cursor);
            }
        }
        self.state.queue.push(node.id.clone());
        self.push_in_order(&spec.body);
    }

    async fn visit_action(&mut self, node: &Node) -> Result<(), AppError> {
        if let Some(observer) = self.ctx.observer.clone() {
            observer.before_node(node, &self.ctx.shared_state).await;
        }

        let decision = match self.pass_gate(node).await {
            Ok(GateOutcome::Open) => None,
            Ok(GateOutcome::Approved(decision)) => Some(decision),
            Ok(GateOutcome::Cancelled) => {
                tracing::info!(node_id = %node.id, "approval wait ended by cancellation");
                self.state.cancel();
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(node_id = %node.id, error = %err, "approval gate failed");
                self.state.fail(err);
                return Ok(());
            }
        };

        let result = if let NodeKind::HumanApproval(_) = &node.kind {
            let (approval_id, comment) = decision
                .map(|entry| (Value::String(entry.pending.id), json!(entry.comment)))
                .unwrap_or((Value::Null, Value::Null));
            NodeResult::success(
                node.id.clone(),
                json!({"approved": true, "approvalId": approval_id, "comment": comment}),
            )
        } else {
            let Some(adapter) = self.ctx.adapters.get(node.node_type()) else {
                self.state.fail(
                    AppError::new(
                        ErrorCategory::AdapterError,
                        format!(
                            "no adapter registered for node '{}' of type {}",
                            node.id,
                            node.node_type()
                        ),
                    )
                    .with_code("PLN-EXEC-002")
                    .with_context("node_id", node.id.clone()),
                );
                return Ok(());
            };
            match self.invoke_adapter(node, adapter).await {
                Ok(result) => result,
                Err(err) => {
                    let failed = NodeResult::failure(node.id.clone(), err.message.clone());
                    self.record(node, failed.clone());
                    self.notify_after(&failed).await;
                    self.state.fail(err);
                    return Ok(());
                }
            }
        };

        self.record(node, result.clone());
        self.notify_after(&result).await;

        if !result.is_success() {
            let message = result.error.clone().unwrap_or_else(|| "no error reported".to_string());
            tracing::warn!(node_id = %node.id, error = %message, "node reported failure");
            self.state.fail(
                AppError::new(
                    ErrorCategory::AdapterError,
                    format!("node '{}' failed: {}", node.id, message),
                )
                .with_code("PLN-EXEC-003")
                .with_context("node_id", node.id.clone()),
            );
            return Ok(());
        }

        if self.ctx.settings.checkpoint_on_each_node {
            if let Some(store) = self.ctx.checkpoint_store.clone() {
                let checkpoint = Checkpoint::capture(
                    self.plan,
                    self.state.last_node_id.clone(),
                    self.state.queue.clone(),
                    &self.ctx.shared_state,
                );
                store.save(&checkpoint)?;
            }
        }
        Ok(())
    }

    async fn pass_gate(&self, node: &Node) -> Result<GateOutcome, AppError> {
        if !node.is_gated() {
            return Ok(GateOutcome::Open);
        }
        let Some(approvals) = self.ctx.approvals.clone() else {
            return Err(AppError::new(
                ErrorCategory::ApprovalError,
                format!(
                    "node '{}' requires approval but no approval controller is configured",
                    node.id
                ),
            )
            .with_code("PLN-EXEC-005"));
        };
        let pending = approvals.open_request(self.plan.id(), self.plan.version(), node)?;
        let cancel = self.ctx.cancel.clone();
        let decision = tokio::select! {
            decision = approvals.wait_for_decision(&pending.id) => decision?,
            _ = cancel.cancelled() => return Ok(GateOutcome::Cancelled),
        };
        if decision.is_approved() {
            tracing::info!(node_id = %node.id, approval_id = %pending.id, "approval granted");
            Ok(GateOutcome::Approved(decision))
        } else {
            Err(decision.rejection_error())
        }
    }

    async fn invoke_adapter(
        &mut self,
        node: &Node,
        adapter: Arc<dyn NodeAdapter>,
    ) -> Result<NodeResult, AppError> {
        let node_ctx = NodeContext {
            plan_id: self.plan.id(),
            execution_id: &self.execution_id,
            shared_state: &mut self.ctx.shared_state,
        };
        match adapter.execute(node, node_ctx).await {
            Ok(result) if result.node_id != node.id => Err(AppError::new(
                ErrorCategory::AdapterError,
                format!(
                    "adapter {} returned a result for '{}' while executing '{}'",
                    adapter.name(),
                    result.node_id,
                    node.id
                ),
            )
            .with_code("PLN-EXEC-006")),
            Ok(result) => Ok(result),
            Err(err) => {
                let mut wrapped = AppError::new(
                    ErrorCategory::AdapterError,
                    format!(
                        "adapter {} raised an unexpected error on node '{}': {}",
                        adapter.name(),
                        node.id,
                        err.message
                    ),
                )
                .with_code("PLN-EXEC-004")
                .with_context("node_id", node.id.clone());
                wrapped.source = Some(anyhow::Error::new(err));
                Err(wrapped)
            }
        }
    }

    fn record(&mut self, node: &Node, result: NodeResult) {
        let shared = &mut self.ctx.shared_state;
        if result.is_success() {
            shared.set(
                output_key(&node.id),
                result.output.clone().unwrap_or(Value::Null),
            );
        } else {
            shared.set(
                error_key(&node.id),
                Value::String(result.error.clone().unwrap_or_default()),
            );
        }
        self.state.last_node_id = Some(node.id.clone());
        self.state.outputs.insert(node.id.clone(), result);
    }

    async fn notify_after(&self, result: &NodeResult) {
        if let Some(observer) = self.ctx.observer.clone() {
            observer.after_node(result, &self.ctx.shared_state).await;
        }
    }
}
