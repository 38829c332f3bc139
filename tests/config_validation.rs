//! Integration tests for configuration validation

#![allow(clippy::expect_used)]

use handle_ipc::config::{IpcConfig, DEFAULT_SERVICE_PORT};
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = IpcConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
    assert_eq!(config.service.port, DEFAULT_SERVICE_PORT);
    assert_eq!(config.service.sweep_interval, Duration::from_secs(60));
    assert_eq!(config.service.probe_timeout, Duration::from_secs(10));
}

#[test]
fn test_password_without_salt() {
    let mut config = IpcConfig::default();
    config.service.password = Some("secret".to_string());

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Password and salt must be given together")));
}

#[test]
fn test_short_salt() {
    let mut config = IpcConfig::default();
    config.service.password = Some("secret".to_string());
    config.service.salt = Some("{0x59, 0x06}".to_string());

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Salt too short")));
}

#[test]
fn test_malformed_salt() {
    let mut config = IpcConfig::default();
    config.service.password = Some("secret".to_string());
    config.service.salt = Some("abc".to_string());

    assert!(!config.validate().is_empty());
}

#[test]
fn test_probe_timeout_longer_than_sweep() {
    let mut config = IpcConfig::default();
    config.service.sweep_interval = Duration::from_secs(5);
    config.service.probe_timeout = Duration::from_secs(10);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Probe timeout cannot exceed the sweep interval")));
}

#[test]
fn test_short_connect_timeout() {
    let mut config = IpcConfig::default();
    config.sender.connect_timeout = Duration::from_millis(1);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Connect timeout too short")));
}

#[test]
fn test_zero_registration_attempts() {
    let mut config = IpcConfig::default();
    config.receiver.registration_attempts = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Registration attempts must be greater than 0")));
}

#[test]
fn test_allowed_port_zero() {
    let mut config = IpcConfig::default();
    config.receiver.allowed_ports = vec![9000, 0];

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot contain port 0")));
}

#[test]
fn test_empty_app_name() {
    let mut config = IpcConfig::default();
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_multiple_validation_errors() {
    let mut config = IpcConfig::default();
    config.receiver.registration_attempts = 0;
    config.receiver.listen_backlog = 0;
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors.len() >= 3, "Expected at least 3 errors, got {:?}", errors);
}

#[test]
fn test_validate_strict_returns_error() {
    let mut config = IpcConfig::default();
    config.receiver.registration_attempts = 0;

    let result = config.validate_strict();
    assert!(result.is_err());
    let message = result.expect_err("should fail").to_string();
    assert!(message.contains("Configuration validation failed"));
}

#[test]
fn test_toml_round_trip() {
    let config = IpcConfig::default_with_overrides(|c| {
        c.service.port = 5000;
        c.service.password = Some("secret".to_string());
        c.service.salt = Some("59063e8a1b2c3d4e".to_string());
        c.sender.buffered = true;
        c.receiver.allowed_ports = vec![9000, 9001];
        c.logging.log_level = Level::DEBUG;
    });

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ipc.toml");
    config.save_to_file(&path).expect("save");
    let loaded = IpcConfig::from_file(&path).expect("load");

    assert_eq!(loaded.service.port, 5000);
    assert_eq!(loaded.service.salt.as_deref(), Some("59063e8a1b2c3d4e"));
    assert!(loaded.sender.buffered);
    assert_eq!(loaded.receiver.allowed_ports, vec![9000, 9001]);
    assert_eq!(loaded.logging.log_level, Level::DEBUG);
    assert!(loaded.validate().is_empty());
    assert!(loaded.service.cipher().expect("cipher").is_some());
}

#[test]
fn test_partial_toml_uses_defaults() {
    let config = IpcConfig::from_toml(
        r#"
        [receiver]
        registration_attempts = 5
        listen_backlog = 8
        local_ip = "192.168.1.10"
        "#,
    )
    .expect("parse");

    assert_eq!(config.receiver.registration_attempts, 5);
    assert_eq!(config.receiver.local_ip, Some("192.168.1.10".parse().expect("ip")));
    assert_eq!(config.service.port, DEFAULT_SERVICE_PORT);
}

#[test]
fn test_example_config_parses() {
    let example = IpcConfig::example_config();
    let config = IpcConfig::from_toml(&example).expect("example config should parse");
    assert!(config.validate().is_empty());
}
