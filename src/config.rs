//! # Configuration Management
//!
//! Centralized configuration for the directory service, senders, receivers and the
//! local directory store.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`HANDLE_IPC_*`)
//!
//! ## Security Considerations
//! - The service channel is only encrypted when both `password` and `salt` are set
//! - The same password and salt must be configured on every client of the service

use crate::error::{IpcError, Result};
use crate::utils::crypto::ChannelCipher;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Default TCP port of the directory service
pub const DEFAULT_SERVICE_PORT: u16 = 4455;

/// Default number of registration attempts made by a receiver
pub const DEFAULT_REGISTRATION_ATTEMPTS: u32 = 3;

/// Default listen backlog of a receiver (one more is added when a remote directory is used)
pub const DEFAULT_LISTEN_BACKLOG: i32 = 4;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct IpcConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub sender: SenderConfig,

    #[serde(default)]
    pub receiver: ReceiverConfig,

    #[serde(default)]
    pub local_store: LocalStoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl IpcConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| IpcError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| IpcError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| IpcError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("HANDLE_IPC_SERVICE_PORT") {
            config.service.port = port
                .parse()
                .map_err(|_| IpcError::ConfigError(format!("Invalid service port: {port}")))?;
        }

        if let Ok(password) = std::env::var("HANDLE_IPC_SERVICE_PASSWORD") {
            config.service.password = Some(password);
        }

        if let Ok(salt) = std::env::var("HANDLE_IPC_SERVICE_SALT") {
            config.service.salt = Some(salt);
        }

        if let Ok(timeout) = std::env::var("HANDLE_IPC_CONNECT_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.sender.connect_timeout = Duration::from_millis(val);
                config.service.probe_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(ip) = std::env::var("HANDLE_IPC_LOCAL_IP") {
            config.receiver.local_ip = Some(
                ip.parse()
                    .map_err(|_| IpcError::ConfigError(format!("Invalid local IP: {ip}")))?,
            );
        }

        if let Ok(dir) = std::env::var("HANDLE_IPC_STORE_DIR") {
            config.local_store.directory = Some(PathBuf::from(dir));
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| IpcError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| IpcError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.service.validate());
        errors.extend(self.sender.validate());
        errors.extend(self.receiver.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(IpcError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Directory service configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// TCP port listened on for both IPv4-any and IPv6-any
    pub port: u16,

    /// Interval between two liveness sweeps
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,

    /// Bound on each liveness connect-probe
    #[serde(with = "duration_serde")]
    pub probe_timeout: Duration,

    /// Password for the encrypted channel
    #[serde(default)]
    pub password: Option<String>,

    /// Salt for the encrypted channel, as hex or `{0x.., 0x..}`
    #[serde(default)]
    pub salt: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SERVICE_PORT,
            sweep_interval: timeout::SWEEP_INTERVAL,
            probe_timeout: timeout::DEFAULT_TIMEOUT,
            password: None,
            salt: None,
        }
    }
}

impl ServiceConfig {
    /// Build the channel cipher if encryption is configured.
    pub fn cipher(&self) -> Result<Option<ChannelCipher>> {
        match (&self.password, &self.salt) {
            (Some(password), Some(salt)) if !password.is_empty() => {
                let salt = ChannelCipher::parse_salt(salt)?;
                Ok(Some(ChannelCipher::new(password, &salt)?))
            }
            _ => Ok(None),
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.sweep_interval.as_millis() < 100 {
            errors.push("Sweep interval too short (minimum: 100ms)".to_string());
        } else if self.sweep_interval.as_secs() > 3600 {
            errors.push("Sweep interval too long (maximum: 1 hour)".to_string());
        }

        if self.probe_timeout.as_millis() < 100 {
            errors.push("Probe timeout too short (minimum: 100ms)".to_string());
        } else if self.probe_timeout > self.sweep_interval {
            errors.push("Probe timeout cannot exceed the sweep interval".to_string());
        }

        match (&self.password, &self.salt) {
            (Some(_), None) | (None, Some(_)) => {
                errors.push("Password and salt must be given together".to_string());
            }
            (Some(password), Some(salt)) => {
                if password.is_empty() {
                    errors.push("Password cannot be empty when a salt is given".to_string());
                }
                match ChannelCipher::parse_salt(salt) {
                    Ok(bytes) if bytes.len() < 8 => {
                        errors.push("Salt too short (minimum: 8 bytes)".to_string());
                    }
                    Ok(_) => {}
                    Err(e) => errors.push(e.to_string()),
                }
            }
            (None, None) => {}
        }

        errors
    }
}

/// Sender configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SenderConfig {
    /// Bound on connecting to a receiver before it is skipped
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Keep the last serialized envelope and reuse it for an identical message
    pub buffered: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            connect_timeout: timeout::DEFAULT_TIMEOUT,
            buffered: false,
        }
    }
}

impl SenderConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.connect_timeout.as_millis() < 10 {
            errors.push("Connect timeout too short (minimum: 10ms)".to_string());
        } else if self.connect_timeout.as_secs() > 300 {
            errors.push("Connect timeout too long (maximum: 300s)".to_string());
        }

        errors
    }
}

/// Receiver configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReceiverConfig {
    /// Registration attempts before giving up
    pub registration_attempts: u32,

    /// Listen backlog
    pub listen_backlog: i32,

    /// Address to register instead of the discovered one
    #[serde(default)]
    pub local_ip: Option<IpAddr>,

    /// Ports the receiver may listen on; empty means any free port
    #[serde(default)]
    pub allowed_ports: Vec<u16>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            registration_attempts: DEFAULT_REGISTRATION_ATTEMPTS,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            local_ip: None,
            allowed_ports: Vec::new(),
        }
    }
}

impl ReceiverConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.registration_attempts == 0 {
            errors.push("Registration attempts must be greater than 0".to_string());
        }

        if self.listen_backlog < 1 {
            errors.push("Listen backlog must be at least 1".to_string());
        }

        if self.allowed_ports.contains(&0) {
            errors.push("Allowed ports cannot contain port 0".to_string());
        }

        errors
    }
}

/// Local directory store configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct LocalStoreConfig {
    /// Directory holding the snapshot and lock files; defaults to the per-user data dir
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("handle-ipc"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
