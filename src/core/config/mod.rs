use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration loaded from conductor.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConductorConfig {
    /// Dispatch loop and checkpoint configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Approval store and delivery configuration
    #[serde(default)]
    pub approvals: ApprovalSettings,

    /// Expression evaluator configuration
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Persist a checkpoint after every successful leaf
    #[serde(default = "default_checkpoint_on_each_node")]
    pub checkpoint_on_each_node: bool,

    /// Keep a timestamped copy of every checkpoint
    #[serde(default)]
    pub checkpoint_keep_history: bool,

    /// Checkpoint directory, relative to the workspace
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

/// How blocked executions learn about decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    #[default]
    Watch,
    Poll,
}

impl std::str::FromStr for DeliveryMode {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "watch" => Ok(DeliveryMode::Watch),
            "poll" => Ok(DeliveryMode::Poll),
            _ => Err("must be 'watch' or 'poll'"),
        }
    }
}

/// Approval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalSettings {
    #[serde(default)]
    pub delivery: DeliveryMode,

    /// Poll (and file-watch scan) interval, e.g. "500ms"
    #[serde(
        default = "default_poll_interval",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub poll_interval: Duration,

    /// Approval store directory, relative to the workspace
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,

    #[serde(default = "default_requested_by")]
    pub requested_by: String,

    #[serde(default = "default_decided_by")]
    pub decided_by: String,

    /// Payload keys masked before approval records reach disk
    #[serde(default = "default_redact_keys")]
    pub redact_keys: Vec<String>,
}

/// Evaluator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Compiled rule strings kept before the cache is cleared
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

// Default functions
fn default_checkpoint_on_each_node() -> bool {
    true
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".conductor/state")
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(".conductor/approvals")
}

fn default_requested_by() -> String {
    "conductor".to_string()
}

fn default_decided_by() -> String {
    "operator".to_string()
}

fn default_redact_keys() -> Vec<String> {
    vec!["token".into(), "password".into(), "secret".into()]
}

fn default_cache_capacity() -> usize {
    crate::core::plan_graph::expression::DEFAULT_CACHE_CAPACITY
}

fn serialize_duration<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
}

fn deserialize_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let text = String::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            checkpoint_on_each_node: default_checkpoint_on_each_node(),
            checkpoint_keep_history: false,
            state_dir: default_state_dir(),
        }
    }
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        ApprovalSettings {
            delivery: DeliveryMode::default(),
            poll_interval: default_poll_interval(),
            store_dir: default_store_dir(),
            requested_by: default_requested_by(),
            decided_by: default_decided_by(),
            redact_keys: default_redact_keys(),
        }
    }
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        EvaluatorConfig {
            cache_capacity: default_cache_capacity(),
        }
    }
}


pub mod loader;

pub use loader::ConfigLoader;
