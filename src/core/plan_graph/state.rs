#![allow(clippy::result_large_err)] // State module returns AppError to preserve structured diagnostic context; boxing would discard run-time state.

use crate::core::error::{AppError, AppErrorSummary};
use crate::core::types::ErrorCategory;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Flat, JSON-compatible scratchpad visible to every node of one execution.
///
/// Keys are caller-chosen strings and frequently contain dots themselves
/// (`"fetch.output"`), so path lookups resolve the longest matching flat key
/// first and only then descend into the stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedState {
    entries: Map<String, Value>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a JSON object. Any other JSON shape is rejected.
    pub fn from_value(value: Value) -> Result<Self, AppError> {
        match value {
            Value::Object(entries) => Ok(Self { entries }),
            Value::Null => Ok(Self::default()),
            other => Err(AppError::new(
                ErrorCategory::ValidationError,
                format!(
                    "shared state must be a JSON object, got {}",
                    json_type_name(&other)
                ),
            )),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn set<K: Into<String>>(&mut self, key: K, value: Value) -> Option<Value> {
        self.entries.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Merge the top-level keys of `patch` into the store, replacing existing keys.
    pub fn merge(&mut self, patch: &Map<String, Value>) {
        for (key, value) in patch {
            self.entries.insert(key.clone(), value.clone());
        }
    }

    /// Resolve a dot path against the store.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return None;
        }
        if let Some(value) = self.entries.get(path) {
            return Some(value);
        }
        let segments: Vec<&str> = path.split('.').collect();
        for split in (1..segments.len()).rev() {
            let key = segments[..split].join(".");
            if let Some(value) = self.entries.get(&key) {
                return lookup_in_value(value, &segments[split..]);
            }
        }
        None
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.entries.clone())
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.entries
    }

    /// Current cursor of a loop node, `{0, 0}` when none is stored.
    pub fn loop_cursor(&self, loop_id: &str) -> LoopCursor {
        self.entries
            .get(&loop_state_key(loop_id))
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }

    pub fn set_loop_cursor(&mut self, loop_id: &str, cursor: LoopCursor) {
        self.entries
            .insert(loop_state_key(loop_id), cursor.to_value());
    }

    pub fn reset_loop_cursor(&mut self, loop_id: &str) {
        self.set_loop_cursor(loop_id, LoopCursor::default());
    }
}

/// Descend into a JSON value by object key or array index.
pub fn lookup_in_value<'a>(value: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

pub fn output_key(node_id: &str) -> String {
    format!("{}.output", node_id)
}

pub fn error_key(node_id: &str) -> String {
    format!("{}.error", node_id)
}

pub fn loop_state_key(loop_id: &str) -> String {
    format!("{}.__loopState", loop_id)
}

pub fn loop_item_key(loop_id: &str) -> String {
    format!("{}.loopItem", loop_id)
}

pub fn loop_index_key(loop_id: &str) -> String {
    format!("{}.loopIndex", loop_id)
}

/// Iteration bookkeeping for one loop node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopCursor {
    pub iterations: u32,
    #[serde(default)]
    pub index: u32,
}

impl LoopCursor {
    pub fn to_value(self) -> Value {
        serde_json::json!({ "iterations": self.iterations, "index": self.index })
    }
}

/// Terminal status of a plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status reported by a leaf adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Success,
    Failed,
}

/// Result contract returned by every leaf adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    pub node_id: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeResult {
    pub fn success<T: Into<String>>(node_id: T, output: Value) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Success,
            output: Some(output),
            error: None,
        }
    }

    pub fn failure<T: Into<String>, E: Into<String>>(node_id: T, error: E) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Failed,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == NodeStatus::Success
    }
}

/// Outcome of one `execute` call.
#[derive(Debug)]
pub struct ExecutionResult {
    pub plan_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub last_node_id: Option<String>,
    pub outputs: IndexMap<String, NodeResult>,
    pub error: Option<AppError>,
}

impl ExecutionResult {
    /// Serializable view of the result; the error collapses to its summary.
    pub fn report(&self) -> ExecutionReport {
        ExecutionReport {
            plan_id: self.plan_id.clone(),
            status: self.status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            last_node_id: self.last_node_id.clone(),
            outputs: self.outputs.clone(),
            error: self.error.as_ref().map(AppError::summary),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub plan_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub last_node_id: Option<String>,
    pub outputs: IndexMap<String, NodeResult>,
    pub error: Option<AppErrorSummary>,
}

/// Warnings collected by a dry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DryRunSummary {
    pub plan_id: String,
    pub warnings: Vec<String>,
}

/// Mutable record threaded through the dispatch loop.
#[derive(Debug)]
pub(crate) struct ExecutionState {
    pub queue: Vec<String>,
    pub current_node_id: Option<String>,
    pub status: ExecutionStatus,
    pub last_node_id: Option<String>,
    pub outputs: IndexMap<String, NodeResult>,
    pub error: Option<AppError>,
}

impl ExecutionState {
    pub fn new(queue: Vec<String>) -> Self {
        Self {
            queue,
            current_node_id: None,
            status: ExecutionStatus::Success,
            last_node_id: None,
            outputs: IndexMap::new(),
            error: None,
        }
    }

    /// Record a fatal condition: the queue is drained and the run is marked failed.
    pub fn fail(&mut self, error: AppError) {
        self.queue.clear();
        self.status = ExecutionStatus::Failed;
        self.error = Some(error);
    }

    pub fn cancel(&mut self) {
        self.queue.clear();
        self.status = ExecutionStatus::Cancelled;
    }

    pub fn is_terminal(&self) -> bool {
        self.status != ExecutionStatus::Success
    }
}

/// Redact sensitive keys in the given JSON value.
pub fn redact_value(value: &mut Value, redact_keys: &[String]) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if should_redact(key, redact_keys) {
                    *child = Value::String("[REDACTED]".to_string());
                    continue;
                }
                redact_value(child, redact_keys);
            }
        }
        Value::Array(items) => {
            for item in items {
                redact_value(item, redact_keys);
            }
        }
        _ => {}
    }
}

fn should_redact(key: &str, redact_keys: &[String]) -> bool {
    let key_lower = key.to_lowercase();
    redact_keys
        .iter()
        .any(|pattern| key_lower.contains(&pattern.to_lowercase()))
}

/// Compute the SHA-256 hash encoded as lowercase hex.
pub fn compute_sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Reject identifiers that cannot be used as a single path component.
pub fn validate_path_component(kind: &str, value: &str) -> Result<(), AppError> {
    let valid = !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !valid {
        return Err(AppError::new(
            ErrorCategory::ValidationError,
            format!(
                "{} '{}' contains invalid characters for filesystem use",
                kind, value
            ),
        )
        .with_code("PLN-CKPT-002"));
    }
    Ok(())
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
