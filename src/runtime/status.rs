use crate::core::error::AppErrorSummary;
use crate::core::plan_graph::approval::{ApprovalController, PendingApprovalEntry};
use crate::core::plan_graph::state::ExecutionStatus;
use crate::runtime::bridge::{BridgeSession, BridgeState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const SNAPSHOT_CAPACITY: usize = 128;

/// Runtime-level status: `idle` until the first run, then `running` and a terminal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl From<ExecutionStatus> for RunStatus {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Success => RunStatus::Success,
            ExecutionStatus::Failed => RunStatus::Failed,
            ExecutionStatus::Cancelled => RunStatus::Cancelled,
        }
    }
}

/// Consolidated status pushed to subscribers after every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub bridge_state: BridgeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_metadata: Option<Value>,
    pub plan_id: Option<String>,
    pub status: RunStatus,
    pub running: bool,
    pub current_node_id: Option<String>,
    pub last_completed_node_id: Option<String>,
    pub pending_approvals: Vec<PendingApprovalEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AppErrorSummary>,
}

/// Bookkeeping mutated by the runtime and its observer.
#[derive(Debug, Clone, Default)]
pub struct RunBookkeeping {
    pub plan_id: Option<String>,
    pub status: RunStatus,
    pub running: bool,
    pub current_node_id: Option<String>,
    pub last_completed_node_id: Option<String>,
    pub error: Option<AppErrorSummary>,
}

/// Builds snapshots and broadcasts them one at a time.
pub struct StatusPublisher {
    bridge: Arc<dyn BridgeSession>,
    approvals: Option<Arc<ApprovalController>>,
    run_approvals: Mutex<Option<Arc<ApprovalController>>>,
    run: Mutex<RunBookkeeping>,
    last_pending: Mutex<Vec<PendingApprovalEntry>>,
    in_flight: tokio::sync::Mutex<()>,
    tx: broadcast::Sender<StatusSnapshot>,
}

impl StatusPublisher {
    pub fn new(bridge: Arc<dyn BridgeSession>, approvals: Option<Arc<ApprovalController>>) -> Self {
        let (tx, _) = broadcast::channel(SNAPSHOT_CAPACITY);
        Self {
            bridge,
            approvals,
            run_approvals: Mutex::new(None),
            run: Mutex::new(RunBookkeeping::default()),
            last_pending: Mutex::new(Vec::new()),
            in_flight: tokio::sync::Mutex::new(()),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    pub fn update<R, F: FnOnce(&mut RunBookkeeping) -> R>(&self, apply: F) -> R {
        let mut run = self.run.lock().unwrap_or_else(|p| p.into_inner());
        apply(&mut run)
    }

    /// Controller the active run gates on; pending lists fall back to the
    /// runtime's own controller when unset.
    pub fn set_run_approvals(&self, approvals: Option<Arc<ApprovalController>>) {
        *self.run_approvals.lock().unwrap_or_else(|p| p.into_inner()) = approvals;
    }

    pub fn bookkeeping(&self) -> RunBookkeeping {
        self.run.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Compose a fresh snapshot and broadcast it.
    ///
    /// A publish requested while another is in flight waits for it, so
    /// subscribers never see an older snapshot after a newer one.
    pub async fn publish(&self) -> StatusSnapshot {
        let _in_flight = self.in_flight.lock().await;
        let snapshot = self.compose();
        // Nobody listening is not an error.
        let _ = self.tx.send(snapshot.clone());
        snapshot
    }

    /// Snapshot of the current state without broadcasting it.
    pub fn compose(&self) -> StatusSnapshot {
        let run = self.bookkeeping();
        StatusSnapshot {
            bridge_state: self.bridge.state(),
            bridge_metadata: self.bridge.metadata(),
            plan_id: run.plan_id,
            status: run.status,
            running: run.running,
            current_node_id: run.current_node_id,
            last_completed_node_id: run.last_completed_node_id,
            pending_approvals: self.pending_approvals(),
            error: run.error,
        }
    }

    fn pending_approvals(&self) -> Vec<PendingApprovalEntry> {
        let active = self
            .run_approvals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let Some(approvals) = active.or_else(|| self.approvals.clone()) else {
            return Vec::new();
        };
        let mut last = self.last_pending.lock().unwrap_or_else(|p| p.into_inner());
        match approvals.list_pending() {
            Ok(pending) => {
                *last = pending.clone();
                pending
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to list pending approvals; reusing last known list");
                last.clone()
            }
        }
    }
}
