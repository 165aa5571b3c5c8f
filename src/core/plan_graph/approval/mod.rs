#![allow(clippy::result_large_err)] // Approval controller returns AppError to keep approval ids and node context on failures.

pub mod delivery;
pub mod store;

use crate::core::config::{ApprovalSettings, DeliveryMode};
use crate::core::error::AppError;
use crate::core::plan_graph::schema::{Node, NodeKind, RiskLevel};
use crate::core::types::ErrorCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

pub use delivery::{DecisionDelivery, PollingDelivery, WatchDelivery};
pub use store::{ApprovalStore, JsonlApprovalStore, MemoryApprovalStore};

/// Request record persisted when a gate is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApprovalEntry {
    pub id: String,
    pub plan_id: String,
    pub plan_version: String,
    pub node_id: String,
    pub node_type: String,
    pub risk_level: RiskLevel,
    pub requires_approval: bool,
    pub requested_at: DateTime<Utc>,
    pub requested_by: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for ApprovalStatus {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "approved" | "approve" => Ok(ApprovalStatus::Approved),
            "rejected" | "reject" => Ok(ApprovalStatus::Rejected),
            _ => Err("must be 'approved' or 'rejected'"),
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending entry plus its terminal decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedApprovalEntry {
    #[serde(flatten)]
    pub pending: PendingApprovalEntry,
    pub status: ApprovalStatus,
    pub decided_at: DateTime<Utc>,
    pub decided_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl CompletedApprovalEntry {
    pub fn is_approved(&self) -> bool {
        self.status == ApprovalStatus::Approved
    }

    /// Fatal error raised for a rejected gate; the message carries the comment.
    pub fn rejection_error(&self) -> AppError {
        let comment = self.comment.as_deref().unwrap_or("no comment");
        AppError::new(
            ErrorCategory::ApprovalError,
            format!(
                "approval {} for node '{}' was rejected by {}: {}",
                self.pending.id, self.pending.node_id, self.decided_by, comment
            ),
        )
        .with_code("PLN-APPR-001")
        .with_context("approval_id", self.pending.id.clone())
        .with_context("node_id", self.pending.node_id.clone())
    }
}

/// Gate raised outside the plan graph.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualApprovalRequest {
    pub plan_id: String,
    pub plan_version: String,
    pub node_id: String,
    pub node_type: String,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub requested_by: Option<String>,
}

/// Callback notified whenever a pending entry is persisted.
pub type PendingCallback = Arc<dyn Fn(&PendingApprovalEntry) + Send + Sync>;

/// Creates, records, and waits on approval decisions.
pub struct ApprovalController {
    store: Arc<dyn ApprovalStore>,
    delivery: Arc<dyn DecisionDelivery>,
    on_pending: RwLock<Option<PendingCallback>>,
    requested_by: String,
    decided_by: String,
}

impl ApprovalController {
    pub fn new(store: Arc<dyn ApprovalStore>, delivery: Arc<dyn DecisionDelivery>) -> Self {
        Self {
            store,
            delivery,
            on_pending: RwLock::new(None),
            requested_by: "conductor".to_string(),
            decided_by: "operator".to_string(),
        }
    }

    /// Build the JSONL-backed controller described by `settings`.
    pub fn from_settings(settings: &ApprovalSettings, workspace: &Path) -> Result<Self, AppError> {
        let store: Arc<dyn ApprovalStore> = Arc::new(
            JsonlApprovalStore::new(workspace.join(&settings.store_dir))?
                .with_redact_keys(settings.redact_keys.clone()),
        );
        let delivery: Arc<dyn DecisionDelivery> = match settings.delivery {
            DeliveryMode::Watch => Arc::new(WatchDelivery::new(
                Arc::clone(&store),
                settings.poll_interval,
            )?),
            DeliveryMode::Poll => Arc::new(PollingDelivery::new(
                Arc::clone(&store),
                settings.poll_interval,
            )),
        };
        Ok(Self::new(store, delivery)
            .with_identity(settings.requested_by.clone(), settings.decided_by.clone()))
    }

    /// Names recorded as `requestedBy` and the default `decidedBy`.
    pub fn with_identity(
        mut self,
        requested_by: impl Into<String>,
        decided_by: impl Into<String>,
    ) -> Self {
        self.requested_by = requested_by.into();
        self.decided_by = decided_by.into();
        self
    }

    pub fn store(&self) -> Arc<dyn ApprovalStore> {
        Arc::clone(&self.store)
    }

    pub fn delivery_name(&self) -> &'static str {
        self.delivery.name()
    }

    /// Replace the pending callback, returning the previous one.
    pub fn set_pending_callback(&self, callback: Option<PendingCallback>) -> Option<PendingCallback> {
        let mut slot = self.on_pending.write().unwrap_or_else(|p| p.into_inner());
        std::mem::replace(&mut *slot, callback)
    }

    pub fn requires_approval(&self, node: &Node) -> bool {
        node.is_gated()
    }

    /// Gate `node`: returns `None` when no approval is needed, otherwise
    /// blocks until a decision is recorded and returns it.
    pub async fn ensure_approval(
        &self,
        plan_id: &str,
        plan_version: &str,
        node: &Node,
    ) -> Result<Option<CompletedApprovalEntry>, AppError> {
        if !self.requires_approval(node) {
            return Ok(None);
        }
        let pending = self.open_request(plan_id, plan_version, node)?;
        self.wait_for_decision(&pending.id).await.map(Some)
    }

    /// Persist a pending entry for `node` and notify the pending callback.
    pub fn open_request(
        &self,
        plan_id: &str,
        plan_version: &str,
        node: &Node,
    ) -> Result<PendingApprovalEntry, AppError> {
        let mut payload = Map::new();
        if let Some(name) = &node.name {
            payload.insert("name".to_string(), Value::String(name.clone()));
        }
        if let NodeKind::HumanApproval(spec) = &node.kind {
            if let Some(prompt) = &spec.prompt {
                payload.insert("prompt".to_string(), Value::String(prompt.clone()));
            }
        }
        if let Some(params) = node.params() {
            payload.insert("params".to_string(), params.clone());
        }
        let entry = PendingApprovalEntry {
            id: uuid::Uuid::new_v4().to_string(),
            plan_id: plan_id.to_string(),
            plan_version: plan_version.to_string(),
            node_id: node.id.clone(),
            node_type: node.node_type().as_str().to_string(),
            risk_level: node.risk_level(),
            requires_approval: node.requires_approval(),
            requested_at: Utc::now(),
            requested_by: self.requested_by.clone(),
            payload: Value::Object(payload),
        };
        self.persist_pending(&entry)?;
        Ok(entry)
    }

    /// Persist a gate raised outside the plan graph without blocking.
    pub fn create_manual_approval(
        &self,
        request: ManualApprovalRequest,
    ) -> Result<PendingApprovalEntry, AppError> {
        let entry = PendingApprovalEntry {
            id: uuid::Uuid::new_v4().to_string(),
            plan_id: request.plan_id,
            plan_version: request.plan_version,
            node_id: request.node_id,
            node_type: request.node_type,
            risk_level: request.risk_level,
            requires_approval: true,
            requested_at: Utc::now(),
            requested_by: request
                .requested_by
                .unwrap_or_else(|| self.requested_by.clone()),
            payload: request.payload,
        };
        self.persist_pending(&entry)?;
        Ok(entry)
    }

    fn persist_pending(&self, entry: &PendingApprovalEntry) -> Result<(), AppError> {
        self.store.append_pending(entry)?;
        tracing::info!(
            approval_id = %entry.id,
            plan_id = %entry.plan_id,
            node_id = %entry.node_id,
            risk_level = entry.risk_level.as_str(),
            "approval requested"
        );
        let callback = self
            .on_pending
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(entry);
        }
        Ok(())
    }

    /// Block until a decision for `id` exists.
    pub async fn wait_for_decision(&self, id: &str) -> Result<CompletedApprovalEntry, AppError> {
        tracing::debug!(approval_id = %id, delivery = self.delivery.name(), "waiting for decision");
        self.delivery.wait_for_decision(id).await
    }

    /// Record the decision for a pending entry, decided by the default identity.
    pub fn record_decision(
        &self,
        id: &str,
        status: ApprovalStatus,
        comment: Option<String>,
    ) -> Result<CompletedApprovalEntry, AppError> {
        let decided_by = self.decided_by.clone();
        self.record_decision_as(id, status, comment, decided_by)
    }

    pub fn record_decision_as(
        &self,
        id: &str,
        status: ApprovalStatus,
        comment: Option<String>,
        decided_by: String,
    ) -> Result<CompletedApprovalEntry, AppError> {
        let pending = self.store.find_pending(id)?.ok_or_else(|| {
            AppError::new(
                ErrorCategory::ApprovalError,
                format!("no pending approval with id {}", id),
            )
            .with_code("PLN-APPR-002")
        })?;
        let entry = CompletedApprovalEntry {
            pending,
            status,
            decided_at: Utc::now(),
            decided_by,
            comment,
        };
        if !self.store.append_completed_if_absent(&entry)? {
            let existing = self
                .store
                .find_decision(id)?
                .map(|existing| existing.status.to_string())
                .unwrap_or_else(|| "decided".to_string());
            return Err(AppError::new(
                ErrorCategory::ApprovalError,
                format!("approval {} was already {}", id, existing),
            )
            .with_code("PLN-APPR-003"));
        }
        tracing::info!(
            approval_id = %id,
            node_id = %entry.pending.node_id,
            status = %status,
            "approval decided"
        );
        self.delivery.decision_recorded(&entry);
        Ok(entry)
    }

    pub fn list_pending(&self) -> Result<Vec<PendingApprovalEntry>, AppError> {
        self.store.list_pending()
    }
}
