#![allow(clippy::result_large_err)] // Checkpoint module returns AppError to preserve structured diagnostic context; boxing would discard run-time state.

use crate::core::error::AppError;
use crate::core::plan_graph::schema::LoadedPlan;
use crate::core::plan_graph::state::{validate_path_component, SharedState};
use crate::core::types::ErrorCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Durable snapshot of progress through one plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub format_version: u32,
    pub plan_id: String,
    pub plan_version: String,
    pub plan_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_node_id: Option<String>,
    /// Pending node ids, bottom of the stack first.
    pub queue: Vec<String>,
    pub shared_state: SharedState,
}

impl Checkpoint {
    pub fn capture(
        plan: &LoadedPlan,
        last_node_id: Option<String>,
        queue: Vec<String>,
        shared_state: &SharedState,
    ) -> Self {
        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            plan_id: plan.id().to_string(),
            plan_version: plan.version().to_string(),
            plan_hash: plan.hash.clone(),
            created_at: Utc::now(),
            last_node_id,
            queue,
            shared_state: shared_state.clone(),
        }
    }

    /// Ensure this checkpoint was taken from the same plan document.
    pub fn verify_matches(&self, plan: &LoadedPlan) -> Result<(), AppError> {
        let mismatch = |field: &str, expected: &str, found: &str| {
            AppError::new(
                ErrorCategory::CheckpointError,
                format!(
                    "checkpoint {} mismatch: plan has '{}', checkpoint has '{}'",
                    field, expected, found
                ),
            )
            .with_code("PLN-CKPT-001")
        };
        if self.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(mismatch(
                "format version",
                &CHECKPOINT_FORMAT_VERSION.to_string(),
                &self.format_version.to_string(),
            ));
        }
        if self.plan_id != plan.id() {
            return Err(mismatch("plan id", plan.id(), &self.plan_id));
        }
        if self.plan_version != plan.version() {
            return Err(mismatch("plan version", plan.version(), &self.plan_version));
        }
        if self.plan_hash != plan.hash {
            return Err(mismatch("plan hash", &plan.hash, &self.plan_hash));
        }
        Ok(())
    }
}

/// Persistence collaborator for checkpoints.
pub trait CheckpointStore: Send + Sync {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), AppError>;

    fn load(&self, plan_id: &str) -> Result<Option<Checkpoint>, AppError>;
}

fn io_error(message: String) -> AppError {
    AppError::new(ErrorCategory::IoError, message).with_code("PLN-CKPT-002")
}

pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            io_error(format!(
                "failed to create directory {}: {}",
                parent.display(),
                err
            ))
        })?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, data)
        .map_err(|err| io_error(format!("failed to write {}: {}", tmp_path.display(), err)))?;
    fs::rename(&tmp_path, path).map_err(|err| {
        io_error(format!(
            "failed to rename {} -> {}: {}",
            tmp_path.display(),
            path.display(),
            err
        ))
    })?;
    Ok(())
}

/// Stores checkpoints under `<root>/<planId>/checkpoint.json`.
pub struct FileCheckpointStore {
    root: PathBuf,
    keep_history: bool,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            keep_history: false,
        }
    }

    /// Also keep a timestamped copy of every checkpoint under `checkpoints/`.
    pub fn with_history(mut self, keep_history: bool) -> Self {
        self.keep_history = keep_history;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn checkpoint_path(&self, plan_id: &str) -> Result<PathBuf, AppError> {
        validate_path_component("plan id", plan_id)?;
        Ok(self.root.join(plan_id).join("checkpoint.json"))
    }

    pub fn history_dir(&self, plan_id: &str) -> Result<PathBuf, AppError> {
        validate_path_component("plan id", plan_id)?;
        Ok(self.root.join(plan_id).join("checkpoints"))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), AppError> {
        let path = self.checkpoint_path(&checkpoint.plan_id)?;
        let content = serde_json::to_vec_pretty(checkpoint).map_err(|err| {
            AppError::new(
                ErrorCategory::SerializationError,
                format!("failed to serialize checkpoint.json: {}", err),
            )
            .with_code("PLN-CKPT-002")
        })?;
        atomic_write(&path, &content)?;
        if self.keep_history {
            let timestamp = checkpoint
                .created_at
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
                .replace(':', "-");
            let historic = self
                .history_dir(&checkpoint.plan_id)?
                .join(format!("checkpoint-{}.json", timestamp));
            atomic_write(&historic, &content)?;
        }
        tracing::debug!(
            plan_id = %checkpoint.plan_id,
            last_node_id = ?checkpoint.last_node_id,
            "checkpoint saved"
        );
        Ok(())
    }

    fn load(&self, plan_id: &str) -> Result<Option<Checkpoint>, AppError> {
        let path = self.checkpoint_path(plan_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .map_err(|err| io_error(format!("failed to read {}: {}", path.display(), err)))?;
        serde_json::from_slice(&bytes).map(Some).map_err(|err| {
            AppError::new(
                ErrorCategory::SerializationError,
                format!("failed to deserialize checkpoint.json: {}", err),
            )
            .with_code("PLN-CKPT-002")
        })
    }
}

/// In-process store, keeping the latest checkpoint per plan.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    saves: Mutex<usize>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves since creation.
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), AppError> {
        self.checkpoints
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(checkpoint.plan_id.clone(), checkpoint.clone());
        *self.saves.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        Ok(())
    }

    fn load(&self, plan_id: &str) -> Result<Option<Checkpoint>, AppError> {
        Ok(self
            .checkpoints
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(plan_id)
            .cloned())
    }
}
