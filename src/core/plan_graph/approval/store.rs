#![allow(clippy::result_large_err)] // Store helpers return AppError for consistent diagnostics.

use crate::core::error::AppError;
use crate::core::plan_graph::approval::{CompletedApprovalEntry, PendingApprovalEntry};
use crate::core::plan_graph::state::redact_value;
use crate::core::types::ErrorCategory;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const PENDING_FILE: &str = "pending.jsonl";
pub const COMPLETED_FILE: &str = "completed.jsonl";

/// Durable, append-only record of approval requests and decisions.
pub trait ApprovalStore: Send + Sync {
    fn append_pending(&self, entry: &PendingApprovalEntry) -> Result<(), AppError>;

    fn append_completed(&self, entry: &CompletedApprovalEntry) -> Result<(), AppError>;

    /// Append `entry` unless a decision for its id already exists. The check
    /// and the write happen under one lock; returns `false` when a decision
    /// was already present.
    fn append_completed_if_absent(&self, entry: &CompletedApprovalEntry)
        -> Result<bool, AppError>;

    fn find_pending(&self, id: &str) -> Result<Option<PendingApprovalEntry>, AppError>;

    /// The first decision recorded for `id`, if any.
    fn find_decision(&self, id: &str) -> Result<Option<CompletedApprovalEntry>, AppError>;

    /// Pending entries without a recorded decision, oldest first.
    fn list_pending(&self) -> Result<Vec<PendingApprovalEntry>, AppError>;

    /// Directory whose changes signal new decisions, for file-watch delivery.
    fn watch_path(&self) -> Option<PathBuf> {
        None
    }
}

fn store_error(message: String) -> AppError {
    AppError::new(ErrorCategory::ApprovalError, message).with_code("PLN-APPR-004")
}

/// JSON-lines store: `pending.jsonl` and `completed.jsonl` under one directory.
pub struct JsonlApprovalStore {
    dir: PathBuf,
    redact_keys: Vec<String>,
    append_lock: Mutex<()>,
}

impl JsonlApprovalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, AppError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| {
            store_error(format!(
                "failed to create approval store {}: {}",
                dir.display(),
                err
            ))
        })?;
        Ok(Self {
            dir,
            redact_keys: Vec::new(),
            append_lock: Mutex::new(()),
        })
    }

    /// Mask payload keys containing any of `keys` before they reach disk.
    pub fn with_redact_keys(mut self, keys: Vec<String>) -> Self {
        self.redact_keys = keys;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pending_path(&self) -> PathBuf {
        self.dir.join(PENDING_FILE)
    }

    pub fn completed_path(&self) -> PathBuf {
        self.dir.join(COMPLETED_FILE)
    }

    /// All decisions, in the order they were recorded.
    pub fn list_completed(&self) -> Result<Vec<CompletedApprovalEntry>, AppError> {
        read_lines(&self.completed_path())
    }

    fn encode_line<T: Serialize>(&self, entry: &T) -> Result<String, AppError> {
        let mut value = serde_json::to_value(entry).map_err(|err| {
            AppError::new(
                ErrorCategory::SerializationError,
                format!("failed to serialize approval entry: {}", err),
            )
        })?;
        if let Some(payload) = value.get_mut("payload") {
            redact_value(payload, &self.redact_keys);
        }
        let mut line = serde_json::to_string(&value).map_err(|err| {
            AppError::new(
                ErrorCategory::SerializationError,
                format!("failed to serialize approval entry: {}", err),
            )
        })?;
        line.push('\n');
        Ok(line)
    }

    fn append_line<T: Serialize>(&self, path: &Path, entry: &T) -> Result<(), AppError> {
        let line = self.encode_line(entry)?;
        let _guard = self.append_lock.lock().unwrap_or_else(|p| p.into_inner());
        write_line(path, &line)
    }
}

/// Caller holds `append_lock`.
fn write_line(path: &Path, line: &str) -> Result<(), AppError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| store_error(format!("failed to open {}: {}", path.display(), err)))?;
    file.write_all(line.as_bytes())
        .map_err(|err| store_error(format!("failed to append to {}: {}", path.display(), err)))
}

fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, AppError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path)
        .map_err(|err| store_error(format!("failed to read {}: {}", path.display(), err)))?;
    let mut entries = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(entry) => entries.push(entry),
            Err(err) => tracing::warn!(
                path = %path.display(),
                line = index + 1,
                error = %err,
                "skipping unreadable approval record"
            ),
        }
    }
    Ok(entries)
}

impl ApprovalStore for JsonlApprovalStore {
    fn append_pending(&self, entry: &PendingApprovalEntry) -> Result<(), AppError> {
        self.append_line(&self.pending_path(), entry)
    }

    fn append_completed(&self, entry: &CompletedApprovalEntry) -> Result<(), AppError> {
        self.append_line(&self.completed_path(), entry)
    }

    fn append_completed_if_absent(
        &self,
        entry: &CompletedApprovalEntry,
    ) -> Result<bool, AppError> {
        let line = self.encode_line(entry)?;
        let _guard = self.append_lock.lock().unwrap_or_else(|p| p.into_inner());
        if self.find_decision(&entry.pending.id)?.is_some() {
            return Ok(false);
        }
        write_line(&self.completed_path(), &line)?;
        Ok(true)
    }

    fn find_pending(&self, id: &str) -> Result<Option<PendingApprovalEntry>, AppError> {
        let entries: Vec<PendingApprovalEntry> = read_lines(&self.pending_path())?;
        Ok(entries.into_iter().find(|entry| entry.id == id))
    }

    fn find_decision(&self, id: &str) -> Result<Option<CompletedApprovalEntry>, AppError> {
        Ok(self
            .list_completed()?
            .into_iter()
            .find(|entry| entry.pending.id == id))
    }

    fn list_pending(&self) -> Result<Vec<PendingApprovalEntry>, AppError> {
        let decided: HashSet<String> = self
            .list_completed()?
            .into_iter()
            .map(|entry| entry.pending.id)
            .collect();
        let pending: Vec<PendingApprovalEntry> = read_lines(&self.pending_path())?;
        Ok(pending
            .into_iter()
            .filter(|entry| !decided.contains(&entry.id))
            .collect())
    }

    fn watch_path(&self) -> Option<PathBuf> {
        Some(self.dir.clone())
    }
}

/// In-process store for embedding and tests.
#[derive(Default)]
pub struct MemoryApprovalStore {
    pending: Mutex<Vec<PendingApprovalEntry>>,
    completed: Mutex<Vec<CompletedApprovalEntry>>,
}

impl MemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ApprovalStore for MemoryApprovalStore {
    fn append_pending(&self, entry: &PendingApprovalEntry) -> Result<(), AppError> {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(entry.clone());
        Ok(())
    }

    fn append_completed(&self, entry: &CompletedApprovalEntry) -> Result<(), AppError> {
        self.completed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(entry.clone());
        Ok(())
    }

    fn append_completed_if_absent(
        &self,
        entry: &CompletedApprovalEntry,
    ) -> Result<bool, AppError> {
        let mut completed = self.completed.lock().unwrap_or_else(|p| p.into_inner());
        if completed
            .iter()
            .any(|existing| existing.pending.id == entry.pending.id)
        {
            return Ok(false);
        }
        completed.push(entry.clone());
        Ok(true)
    }

    fn find_pending(&self, id: &str) -> Result<Option<PendingApprovalEntry>, AppError> {
        Ok(self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|entry| entry.id == id)
            .cloned())
    }

    fn find_decision(&self, id: &str) -> Result<Option<CompletedApprovalEntry>, AppError> {
        Ok(self
            .completed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|entry| entry.pending.id == id)
            .cloned())
    }

    fn list_pending(&self) -> Result<Vec<PendingApprovalEntry>, AppError> {
        let completed = self.completed.lock().unwrap_or_else(|p| p.into_inner());
        let decided: HashSet<&str> = completed
            .iter()
            .map(|entry| entry.pending.id.as_str())
            .collect();
        Ok(self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|entry| !decided.contains(entry.id.as_str()))
            .cloned()
            .collect())
    }
}
