//! Configuration management for remterm.
//!
//! One TOML file configures both `remterm serve` and `remterm connect`.
//! It lives at `~/.config/remterm/config.toml` unless `--config` says otherwise.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::ChannelSettings;

/// Largest accepted scrollback size.
pub const MAX_SCREEN_LIMIT: usize = 100_000;

/// Largest accepted scrypt cost exponent.
pub const MAX_KDF_LOG_N: u8 = 20;

/// Why a configuration was rejected.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("secret must not be empty")]
    MissingSecret,

    #[error("port must be greater than 0")]
    InvalidPort,

    #[error("screen_limit must be between 1 and {MAX_SCREEN_LIMIT}, got {0}")]
    InvalidScreenLimit(usize),

    #[error("heartbeat_interval_secs must be greater than 0")]
    InvalidHeartbeatInterval,

    #[error("timeout_secs ({timeout}) must not be shorter than heartbeat_interval_secs ({interval})")]
    InvalidTimeout { timeout: u64, interval: u64 },

    #[error("kdf_log_n must be between 1 and {MAX_KDF_LOG_N}, got {0}")]
    InvalidKdfCost(u8),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Names and logging.
    pub general: GeneralConfig,

    /// Listen / connect address.
    pub network: NetworkConfig,

    /// Shared secret and key derivation cost.
    pub security: SecurityConfig,

    /// Scrollback and liveness.
    pub session: SessionConfig,
}

/// General configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Display name of the hosted process.
    pub name: String,

    /// Name of the local operator.
    pub user_name: String,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Pre-shared secret. Required.
    pub secret: String,

    /// scrypt cost exponent (N = 2^kdf_log_n, r = 8, p = 1).
    pub kdf_log_n: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of scrollback lines kept by a process.
    pub screen_limit: usize,

    pub heartbeat_interval_secs: u64,

    /// Silence budget before a channel is dropped.
    pub timeout_secs: u64,

    /// Ask the server for its scrollback after connecting.
    pub request_history: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: "Server".to_string(),
            user_name: "Admin".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            kdf_log_n: protocol::DEFAULT_KDF_LOG_N,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            screen_limit: crate::process::DEFAULT_SCREEN_LIMIT,
            heartbeat_interval_secs: 10,
            timeout_secs: 60,
            request_history: true,
        }
    }
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("remterm")
        .join("config.toml")
}

impl NetworkConfig {
    /// `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Config {
    /// Overlays `REMTERM_*` environment variables on the loaded values.
    ///
    /// Empty variables are ignored. Recognized:
    /// - REMTERM_SECRET: Override the shared secret
    /// - REMTERM_HOST: Override the host
    /// - REMTERM_PORT: Override the port
    /// - REMTERM_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var("REMTERM_SECRET") {
            if !secret.is_empty() {
                tracing::info!("Overriding secret from environment");
                self.security.secret = secret;
            }
        }

        if let Ok(host) = std::env::var("REMTERM_HOST") {
            if !host.is_empty() {
                tracing::info!("Overriding host from environment: {}", host);
                self.network.host = host;
            }
        }

        if let Ok(port) = std::env::var("REMTERM_PORT") {
            if !port.is_empty() {
                match port.parse::<u16>() {
                    Ok(port) => {
                        tracing::info!("Overriding port from environment: {}", port);
                        self.network.port = port;
                    }
                    Err(_) => tracing::warn!("Ignoring invalid REMTERM_PORT: {}", port),
                }
            }
        }

        if let Ok(level) = std::env::var("REMTERM_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.general.log_level = level;
            }
        }
    }

    /// Checks that the configuration can run a channel.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.security.secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }

        if self.network.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if self.session.screen_limit == 0 || self.session.screen_limit > MAX_SCREEN_LIMIT {
            return Err(ConfigError::InvalidScreenLimit(self.session.screen_limit));
        }

        if self.session.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidHeartbeatInterval);
        }

        if self.session.timeout_secs < self.session.heartbeat_interval_secs {
            return Err(ConfigError::InvalidTimeout {
                timeout: self.session.timeout_secs,
                interval: self.session.heartbeat_interval_secs,
            });
        }

        if self.security.kdf_log_n == 0 || self.security.kdf_log_n > MAX_KDF_LOG_N {
            return Err(ConfigError::InvalidKdfCost(self.security.kdf_log_n));
        }

        let level = self.general.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.general.log_level.clone()));
        }

        Ok(())
    }

    /// Channel tunables derived from the `[session]` and `[security]`
    /// sections.
    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            heartbeat_interval: Duration::from_secs(self.session.heartbeat_interval_secs),
            timeout: Duration::from_secs(self.session.timeout_secs),
            kdf_log_n: self.security.kdf_log_n,
        }
    }

    /// Reads `path`, falling back to defaults when the file is missing.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Writes the configuration to `path`, creating missing directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Appends the byte span to a TOML error message when known.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn valid() -> Config {
        let mut config = Config::default();
        config.security.secret = "s3cr3t".to_string();
        config
    }

    fn clear_env() {
        for var in [
            "REMTERM_SECRET",
            "REMTERM_HOST",
            "REMTERM_PORT",
            "REMTERM_LOG_LEVEL",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.general.name, "Server");
        assert_eq!(config.general.user_name, "Admin");
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.network.address(), "127.0.0.1:8080");
        assert!(config.security.secret.is_empty());
        assert_eq!(config.security.kdf_log_n, 14);
        assert_eq!(config.session.screen_limit, 1000);
        assert_eq!(config.session.heartbeat_interval_secs, 10);
        assert_eq!(config.session.timeout_secs, 60);
        assert!(config.session.request_history);
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[security]
secret = "s3cr3t"

[network]
port = 9000
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.security.secret, "s3cr3t");
        assert_eq!(config.network.port, 9000);
        assert_eq!(config.network.host, "127.0.0.1");
        assert_eq!(config.security.kdf_log_n, 14);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[general]
name = "Lab"
user_name = "ops"
log_level = "debug"

[network]
host = "0.0.0.0"
port = 7000

[security]
secret = "hunter2"
kdf_log_n = 10

[session]
screen_limit = 50
heartbeat_interval_secs = 5
timeout_secs = 30
request_history = false
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.general.name, "Lab");
        assert_eq!(config.general.user_name, "ops");
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.network.address(), "0.0.0.0:7000");
        assert_eq!(config.security.secret, "hunter2");
        assert_eq!(config.security.kdf_log_n, 10);
        assert_eq!(config.session.screen_limit, 50);
        assert_eq!(config.session.heartbeat_interval_secs, 5);
        assert_eq!(config.session.timeout_secs, 30);
        assert!(!config.session.request_history);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[network\nport = 1");
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[network]
port = "eighty"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
[general]
name = "X"
color = "blue"
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.general.name, "X");
    }

    #[test]
    fn test_roundtrip() {
        let original = valid();
        let toml = original.to_toml().unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[security]"));
        let loaded = Config::from_toml(&toml).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_creates_directories_and_loads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("dir").join("config.toml");

        let mut config = valid();
        config.general.name = "Saved".to_string();
        config.save(&path).unwrap();

        assert!(path.exists());
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "not [valid toml").unwrap();

        let err = format!("{:#}", Config::load(&path).unwrap_err());
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("remterm/config.toml"));
    }

    #[test]
    fn test_channel_settings() {
        let mut config = valid();
        config.session.heartbeat_interval_secs = 3;
        config.session.timeout_secs = 9;
        config.security.kdf_log_n = 4;

        let settings = config.channel_settings();
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(3));
        assert_eq!(settings.timeout, Duration::from_secs(9));
        assert_eq!(settings.kdf_log_n, 4);
    }

    #[test]
    #[serial]
    fn test_env_override_secret_and_address() {
        clear_env();
        std::env::set_var("REMTERM_SECRET", "from-env");
        std::env::set_var("REMTERM_HOST", "0.0.0.0");
        std::env::set_var("REMTERM_PORT", "9100");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.security.secret, "from-env");
        assert_eq!(config.network.address(), "0.0.0.0:9100");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        clear_env();
        std::env::set_var("REMTERM_SECRET", "");
        std::env::set_var("REMTERM_LOG_LEVEL", "");

        let mut config = valid();
        config.apply_env_overrides();

        assert_eq!(config.security.secret, "s3cr3t");
        assert_eq!(config.general.log_level, "info");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_port_ignored() {
        clear_env();
        std::env::set_var("REMTERM_PORT", "not-a-port");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.network.port, 8080);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        clear_env();
        std::env::set_var("REMTERM_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.general.log_level, "debug");

        clear_env();
    }

    #[test]
    fn test_validate_requires_secret() {
        assert_eq!(Config::default().validate(), Err(ConfigError::MissingSecret));
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_port_zero() {
        let mut config = valid();
        config.network.port = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPort));
    }

    #[test]
    fn test_validate_screen_limit_bounds() {
        let mut config = valid();
        config.session.screen_limit = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidScreenLimit(0)));

        config.session.screen_limit = MAX_SCREEN_LIMIT + 1;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidScreenLimit(MAX_SCREEN_LIMIT + 1))
        );

        config.session.screen_limit = MAX_SCREEN_LIMIT;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_heartbeat_and_timeout() {
        let mut config = valid();
        config.session.heartbeat_interval_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidHeartbeatInterval));

        config.session.heartbeat_interval_secs = 10;
        config.session.timeout_secs = 5;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTimeout {
                timeout: 5,
                interval: 10
            })
        );

        config.session.timeout_secs = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_kdf_cost() {
        let mut config = valid();
        config.security.kdf_log_n = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidKdfCost(0)));
        config.security.kdf_log_n = 21;
        assert_eq!(config.validate(), Err(ConfigError::InvalidKdfCost(21)));
        config.security.kdf_log_n = 20;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = valid();
        config.general.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.general.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }
}
