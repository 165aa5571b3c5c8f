#![allow(clippy::result_large_err)] // Runtime surfaces AppError unchanged from the executor.

//! Bridge-supervised wrapper around the dispatch loop.
//!
//! `PlanRuntime` refuses to start while the bridge is down, instruments the
//! run through a [`LifecycleObserver`], and republishes a [`StatusSnapshot`]
//! on every node transition and every bridge connectivity change.

pub mod bridge;
pub mod status;

pub use bridge::{BridgeEvent, BridgeSession, BridgeState, LocalBridge};
pub use status::{RunBookkeeping, RunStatus, StatusPublisher, StatusSnapshot};

use crate::core::error::AppError;
use crate::core::plan_graph::approval::{ApprovalController, PendingApprovalEntry, PendingCallback};
use crate::core::plan_graph::checkpoint::Checkpoint;
use crate::core::plan_graph::context::{CancellationFlag, ExecutionContext};
use crate::core::plan_graph::executor;
use crate::core::plan_graph::observer::LifecycleObserver;
use crate::core::plan_graph::schema::{LoadedPlan, Node};
use crate::core::plan_graph::state::{ExecutionResult, ExecutionStatus, NodeResult, SharedState};
use crate::core::types::ErrorCategory;
use async_trait::async_trait;
use futures::{future, Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

struct RuntimeShared {
    publisher: StatusPublisher,
    bridge: Arc<dyn BridgeSession>,
    approvals: Option<Arc<ApprovalController>>,
    running: AtomicBool,
    cancel: Mutex<Option<CancellationFlag>>,
}

impl RuntimeShared {
    fn active_cancel(&self) -> Option<CancellationFlag> {
        self.cancel.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn set_active_cancel(&self, flag: Option<CancellationFlag>) {
        *self.cancel.lock().unwrap_or_else(|p| p.into_inner()) = flag;
    }
}

/// Runs plans on behalf of a bridge session and streams their status.
pub struct PlanRuntime {
    shared: Arc<RuntimeShared>,
    bridge_listener: JoinHandle<()>,
}

impl PlanRuntime {
    /// Must be called from within a tokio runtime: the bridge listener is spawned here.
    pub fn new(bridge: Arc<dyn BridgeSession>, approvals: Option<Arc<ApprovalController>>) -> Self {
        let shared = Arc::new(RuntimeShared {
            publisher: StatusPublisher::new(Arc::clone(&bridge), approvals.clone()),
            bridge,
            approvals,
            running: AtomicBool::new(false),
            cancel: Mutex::new(None),
        });
        let events = shared.bridge.subscribe();
        let bridge_listener = tokio::spawn(listen_to_bridge(Arc::clone(&shared), events));
        Self {
            shared,
            bridge_listener,
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusSnapshot> {
        self.shared.publisher.subscribe()
    }

    /// Snapshots as a stream; a subscriber that falls behind skips what it missed.
    pub fn status_stream(&self) -> impl Stream<Item = StatusSnapshot> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|item| future::ready(item.ok()))
    }

    /// Current status without broadcasting it.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.shared.publisher.compose()
    }

    /// Execute `plan` with `ctx`, publishing status along the way.
    ///
    /// Fails with `PLN-RT-001` while another run is active and with
    /// `PLN-RT-002` when the bridge is not connected; neither case touches
    /// `ctx` or the published status.
    pub async fn start(
        &self,
        plan: &LoadedPlan,
        ctx: &mut ExecutionContext,
    ) -> Result<ExecutionResult, AppError> {
        self.run(plan, ctx, None).await
    }

    /// Like [`PlanRuntime::start`], continuing from a checkpoint of the same plan.
    pub async fn resume(
        &self,
        plan: &LoadedPlan,
        ctx: &mut ExecutionContext,
        checkpoint: Checkpoint,
    ) -> Result<ExecutionResult, AppError> {
        self.run(plan, ctx, Some(checkpoint)).await
    }

    async fn run(
        &self,
        plan: &LoadedPlan,
        ctx: &mut ExecutionContext,
        checkpoint: Option<Checkpoint>,
    ) -> Result<ExecutionResult, AppError> {
        if self.is_running() {
            return Err(already_running(plan));
        }
        let bridge_state = self.shared.bridge.state();
        if bridge_state != BridgeState::Connected {
            return Err(AppError::new(
                ErrorCategory::BridgeError,
                format!(
                    "cannot start plan {}: bridge is {}",
                    plan.id(),
                    bridge_state
                ),
            )
            .with_code("PLN-RT-002")
            .with_context("bridgeState", bridge_state.as_str()));
        }
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(already_running(plan));
        }

        let mut guard = RunGuard::install(
            Arc::clone(&self.shared),
            plan.id(),
            ctx,
            self.pending_callback(),
        );

        self.shared.publisher.update(|run| {
            *run = RunBookkeeping {
                plan_id: Some(plan.id().to_string()),
                status: RunStatus::Running,
                running: true,
                ..RunBookkeeping::default()
            };
        });
        self.shared.publisher.publish().await;
        tracing::info!(plan_id = %plan.id(), "runtime started plan");

        let outcome = match checkpoint {
            Some(checkpoint) => executor::resume_execution(plan, &mut *guard.ctx, checkpoint).await,
            None => executor::execute(plan, &mut *guard.ctx).await,
        };
        guard.settle(Some(&outcome));
        drop(guard);
        self.shared.publisher.publish().await;

        match &outcome {
            Ok(result) => {
                tracing::info!(plan_id = %plan.id(), status = %result.status, "runtime finished plan")
            }
            Err(err) => tracing::error!(plan_id = %plan.id(), error = %err, "runtime run failed"),
        }
        outcome
    }

    /// Request cooperative cancellation of the active run.
    ///
    /// Returns `false` when nothing is running. An adapter call already in
    /// flight still completes; the loop stops before the next node.
    pub async fn stop(&self) -> bool {
        let shared = &self.shared;
        // Decided under the bookkeeping lock so a run that is settling either
        // sees the flag or has already cleared `running`.
        let requested = shared.publisher.update(|run| {
            if !run.running {
                return false;
            }
            if let Some(flag) = shared.active_cancel() {
                flag.cancel();
            }
            run.status = RunStatus::Cancelled;
            run.current_node_id = None;
            true
        });
        if !requested {
            return false;
        }
        shared.publisher.publish().await;
        tracing::info!("runtime stop requested");
        true
    }

    fn pending_callback(&self) -> PendingCallback {
        let shared = Arc::clone(&self.shared);
        Arc::new(move |entry: &PendingApprovalEntry| {
            tracing::debug!(approval_id = %entry.id, "pending approval published");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let shared = Arc::clone(&shared);
                handle.spawn(async move {
                    shared.publisher.publish().await;
                });
            }
        })
    }
}

impl Drop for PlanRuntime {
    fn drop(&mut self) {
        self.bridge_listener.abort();
    }
}

fn already_running(plan: &LoadedPlan) -> AppError {
    AppError::new(
        ErrorCategory::InternalError,
        format!("cannot start plan {}: a run is already in progress", plan.id()),
    )
    .with_code("PLN-RT-001")
}

async fn listen_to_bridge(shared: Arc<RuntimeShared>, mut events: broadcast::Receiver<BridgeEvent>) {
    loop {
        match events.recv().await {
            Ok(BridgeEvent::Error(message)) => {
                tracing::warn!(error = %message, "bridge reported an error");
            }
            Ok(event) => {
                tracing::info!(event = ?event, "bridge connectivity changed");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "bridge listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
        shared.publisher.publish().await;
    }
}

/// Hooks installed into a caller's context for one run.
///
/// Settling restores the caller's observer, approval controller and pending
/// callback, records the terminal status and clears the running flag. A guard
/// dropped unsettled (the run future was dropped or an adapter panicked)
/// settles itself and publishes from a spawned task.
struct RunGuard<'a> {
    shared: Arc<RuntimeShared>,
    plan_id: String,
    ctx: &'a mut ExecutionContext,
    original_observer: Option<Arc<dyn LifecycleObserver>>,
    original_approvals: Option<Arc<ApprovalController>>,
    active_approvals: Option<Arc<ApprovalController>>,
    original_callback: Option<PendingCallback>,
    settled: bool,
}

impl<'a> RunGuard<'a> {
    fn install(
        shared: Arc<RuntimeShared>,
        plan_id: &str,
        ctx: &'a mut ExecutionContext,
        callback: PendingCallback,
    ) -> Self {
        let original_observer = ctx.observer.take();
        let original_approvals = ctx.approvals.clone();
        if ctx.approvals.is_none() {
            ctx.approvals = shared.approvals.clone();
        }
        let active_approvals = ctx.approvals.clone();
        let original_callback = active_approvals
            .as_ref()
            .and_then(|approvals| approvals.set_pending_callback(Some(callback)));
        shared.publisher.set_run_approvals(active_approvals.clone());

        ctx.cancel.reset();
        shared.set_active_cancel(Some(ctx.cancel.clone()));
        ctx.observer = Some(Arc::new(RuntimeObserver {
            shared: Arc::clone(&shared),
            inner: original_observer.clone(),
        }));

        Self {
            shared,
            plan_id: plan_id.to_string(),
            ctx,
            original_observer,
            original_approvals,
            active_approvals,
            original_callback,
            settled: false,
        }
    }

    /// Record the terminal status for `outcome`; `None` means the run never finished.
    fn settle(&mut self, outcome: Option<&Result<ExecutionResult, AppError>>) {
        if self.settled {
            return;
        }
        self.settled = true;

        let cancel = self.ctx.cancel.clone();
        let plan_id = self.plan_id.clone();
        self.shared.publisher.update(|run| {
            let stopped = cancel.is_cancelled();
            let (status, error) = match outcome {
                Some(Ok(result)) => {
                    let status = if stopped {
                        RunStatus::Cancelled
                    } else {
                        RunStatus::from(result.status)
                    };
                    (status, result.error.as_ref().map(AppError::summary))
                }
                Some(Err(err)) => (RunStatus::Failed, Some(err.summary())),
                None if std::thread::panicking() => (
                    RunStatus::Failed,
                    Some(
                        AppError::new(
                            ErrorCategory::InternalError,
                            format!("run of plan {} aborted by a panic", plan_id),
                        )
                        .with_code("PLN-RT-003")
                        .summary(),
                    ),
                ),
                None => (RunStatus::Cancelled, None),
            };
            run.status = status;
            run.running = false;
            run.current_node_id = None;
            run.error = error;
        });

        self.ctx.observer = self.original_observer.take();
        if let Some(approvals) = &self.active_approvals {
            approvals.set_pending_callback(self.original_callback.take());
        }
        self.ctx.approvals = self.original_approvals.take();
        self.shared.publisher.set_run_approvals(None);
        self.shared.set_active_cancel(None);
        self.shared.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.settle(None);
        tracing::warn!(plan_id = %self.plan_id, "run ended before the executor returned");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let shared = Arc::clone(&self.shared);
            handle.spawn(async move {
                shared.publisher.publish().await;
            });
        }
    }
}

/// Mirrors node transitions into the published status, then defers to the caller's observer.
struct RuntimeObserver {
    shared: Arc<RuntimeShared>,
    inner: Option<Arc<dyn LifecycleObserver>>,
}

#[async_trait]
impl LifecycleObserver for RuntimeObserver {
    async fn start(&self, plan: &LoadedPlan, state: &SharedState) {
        if let Some(inner) = &self.inner {
            inner.start(plan, state).await;
        }
    }

    async fn before_node(&self, node: &Node, state: &SharedState) {
        if let Some(inner) = &self.inner {
            inner.before_node(node, state).await;
        }
        let node_id = node.id.clone();
        self.shared
            .publisher
            .update(|run| run.current_node_id = Some(node_id));
        self.shared.publisher.publish().await;
    }

    async fn after_node(&self, result: &NodeResult, state: &SharedState) {
        if let Some(inner) = &self.inner {
            inner.after_node(result, state).await;
        }
        let completed = result.is_success().then(|| result.node_id.clone());
        self.shared.publisher.update(|run| {
            run.current_node_id = None;
            if completed.is_some() {
                run.last_completed_node_id = completed;
            }
        });
        self.shared.publisher.publish().await;
    }

    async fn finish(&self, status: ExecutionStatus, state: &SharedState) {
        if let Some(inner) = &self.inner {
            inner.finish(status, state).await;
        }
    }
}
