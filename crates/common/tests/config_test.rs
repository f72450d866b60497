use ai_agent_common::config::{FirePolicy, StorageBackend, SystemConfig};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_config_load_from_toml() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("test_config.toml");

    let config_content = r#"
[coordinator]
tick_interval_secs = 2
stuck_threshold_secs = 60
escalation_threshold_secs = 30
max_hard_restarts = 3
cascade_failures = false
fire_policy = "fail_cascade"
priority_aging_ticks = 4

[locks]
workspace_root = "/srv/repo"
acquire_timeout_secs = 5

[storage]
backend = "json"
path = "/var/lib/coord/state.json"

[worker]
shell = "bash"
default_command = "make"

[logging]
level = "debug"
json = true
"#;

    fs::write(&config_path, config_content).unwrap();

    let config = SystemConfig::from_file(&config_path).unwrap();

    assert_eq!(config.coordinator.tick_interval(), Duration::from_secs(2));
    assert_eq!(config.coordinator.stuck_threshold(), Duration::from_secs(60));
    assert_eq!(config.coordinator.escalation_threshold(), Duration::from_secs(30));
    assert_eq!(config.coordinator.max_hard_restarts, 3);
    assert!(!config.coordinator.cascade_failures);
    assert_eq!(config.coordinator.fire_policy, FirePolicy::FailCascade);
    assert_eq!(config.coordinator.priority_aging_ticks, 4);
    assert_eq!(config.locks.workspace_root, Some(PathBuf::from("/srv/repo")));
    assert_eq!(config.locks.acquire_timeout(), Duration::from_secs(5));
    assert_eq!(config.storage.backend, StorageBackend::Json);
    assert_eq!(config.worker.shell, "bash");
    assert_eq!(config.worker.default_command.as_deref(), Some("make"));
    assert_eq!(config.logging.level, "debug");
    assert!(config.logging.json);
}

#[test]
fn test_empty_config_uses_defaults() {
    let config = SystemConfig::from_toml("").unwrap();

    assert_eq!(config.coordinator.tick_interval_secs, 5);
    assert_eq!(config.coordinator.stuck_threshold_secs, 300);
    assert_eq!(config.coordinator.max_hard_restarts, 2);
    assert!(config.coordinator.cascade_failures);
    assert_eq!(config.coordinator.fire_policy, FirePolicy::Requeue);
    assert_eq!(config.storage.backend, StorageBackend::Memory);
    assert_eq!(config.worker.shell, "sh");
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_config_validation_zero_tick_interval() {
    let result = SystemConfig::from_toml(
        r#"
[coordinator]
tick_interval_secs = 0
"#,
    );
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("tick_interval_secs"));
}

#[test]
fn test_config_validation_postgres_requires_url() {
    let result = SystemConfig::from_toml(
        r#"
[storage]
backend = "postgres"
"#,
    );
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("postgres_url"));
}

#[test]
fn test_config_rejects_unknown_fire_policy() {
    let result = SystemConfig::from_toml(
        r#"
[coordinator]
fire_policy = "shrug"
"#,
    );
    assert!(result.is_err());
}

#[test]
fn test_missing_config_file() {
    let temp_dir = TempDir::new().unwrap();
    let result = SystemConfig::from_file(temp_dir.path().join("absent.toml"));
    assert!(result.unwrap_err().to_string().contains("Failed to read config file"));
}
