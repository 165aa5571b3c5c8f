use conductor::core::config::{ConfigLoader, DeliveryMode};
use conductor::core::plan_graph::context::EngineSettings;
use conductor::core::types::ErrorCategory;
use serial_test::serial;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

fn clear_conductor_env() {
    for v in &[
        "CONDUCTOR_CHECKPOINT_ON_EACH_NODE",
        "CONDUCTOR_APPROVAL_DELIVERY",
        "CONDUCTOR_APPROVAL_POLL_INTERVAL",
    ] {
        env::remove_var(v);
    }
}

#[test]
#[serial]
fn test_missing_workspace_config_uses_defaults() {
    clear_conductor_env();
    let temp_dir = TempDir::new().unwrap();

    let config = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap();

    assert!(config.engine.checkpoint_on_each_node);
    assert_eq!(config.engine.state_dir, PathBuf::from(".conductor/state"));
    assert_eq!(config.approvals.delivery, DeliveryMode::Watch);
    assert_eq!(config.approvals.store_dir, PathBuf::from(".conductor/approvals"));
}

#[test]
#[serial]
fn test_workspace_config_file_is_loaded() {
    clear_conductor_env();
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("conductor.toml"),
        r#"
[engine]
checkpoint_on_each_node = false
state_dir = "run/state"

[approvals]
delivery = "poll"
poll_interval = "250ms"

[evaluator]
cache_capacity = 8
"#,
    )
    .unwrap();

    let config = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap();

    assert!(!config.engine.checkpoint_on_each_node);
    assert_eq!(config.engine.state_dir, PathBuf::from("run/state"));
    assert_eq!(config.approvals.delivery, DeliveryMode::Poll);
    assert_eq!(config.approvals.poll_interval, Duration::from_millis(250));

    let settings = EngineSettings::from(&config);
    assert!(!settings.checkpoint_on_each_node);
    assert_eq!(settings.evaluator_cache_capacity, 8);
}

#[test]
#[serial]
fn test_env_overrides_take_precedence() {
    clear_conductor_env();
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("conductor.toml"),
        "[approvals]\ndelivery = \"poll\"\npoll_interval = \"2s\"\n",
    )
    .unwrap();

    env::set_var("CONDUCTOR_APPROVAL_DELIVERY", "watch");
    env::set_var("CONDUCTOR_APPROVAL_POLL_INTERVAL", "75ms");
    env::set_var("CONDUCTOR_CHECKPOINT_ON_EACH_NODE", "false");

    let config = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap();
    clear_conductor_env();

    assert_eq!(config.approvals.delivery, DeliveryMode::Watch);
    assert_eq!(config.approvals.poll_interval, Duration::from_millis(75));
    assert!(!config.engine.checkpoint_on_each_node);
}

#[test]
#[serial]
fn test_unparsable_env_values_are_ignored() {
    clear_conductor_env();
    let temp_dir = TempDir::new().unwrap();

    env::set_var("CONDUCTOR_APPROVAL_DELIVERY", "carrier-pigeon");
    env::set_var("CONDUCTOR_CHECKPOINT_ON_EACH_NODE", "sometimes");

    let config = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap();
    clear_conductor_env();

    assert_eq!(config.approvals.delivery, DeliveryMode::Watch);
    assert!(config.engine.checkpoint_on_each_node);
}

#[test]
#[serial]
fn test_explicit_config_file_must_exist() {
    clear_conductor_env();
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("elsewhere.toml");

    let err = ConfigLoader::load(temp_dir.path(), Some(&missing)).unwrap_err();

    assert_eq!(err.category, ErrorCategory::IoError);
    assert!(err.message.contains("elsewhere.toml"));
}

#[test]
#[serial]
fn test_explicit_config_file_overrides_workspace_file() {
    clear_conductor_env();
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("conductor.toml"),
        "[approvals]\ndecided_by = \"workspace\"\n",
    )
    .unwrap();
    let explicit = temp_dir.path().join("ci.toml");
    fs::write(&explicit, "[approvals]\ndecided_by = \"ci-bot\"\n").unwrap();

    let config = ConfigLoader::load(temp_dir.path(), Some(&explicit)).unwrap();

    assert_eq!(config.approvals.decided_by, "ci-bot");
}

#[test]
#[serial]
fn test_invalid_values_are_rejected() {
    clear_conductor_env();
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("conductor.toml"),
        "[approvals]\npoll_interval = \"0s\"\n",
    )
    .unwrap();

    let err = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap_err();
    assert_eq!(err.category, ErrorCategory::ValidationError);
    assert!(err.message.contains("poll_interval"));

    fs::write(temp_dir.path().join("conductor.toml"), "[engine\n").unwrap();
    let err = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap_err();
    assert_eq!(err.category, ErrorCategory::ValidationError);
    assert!(err.message.contains("Failed to parse config file"));
}
