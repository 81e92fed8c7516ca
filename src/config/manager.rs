//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::path::Path;
use std::time::Duration;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const MIN_BUFFER_SIZE: usize = 512;
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config = Self::load_from_str(&content)
                .with_context(|| format!("Failed to load config file: {}", path.display()))?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Parse and validate TOML configuration text
    pub fn load_from_str(content: &str) -> Result<Config> {
        let config: Config = toml::from_str(content).context("Failed to parse configuration")?;
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }
}

/// Command-line values that take precedence over the configuration file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub local_host: Option<String>,
    pub local_port: Option<u16>,
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
    pub buffer_size: Option<usize>,
    pub backlog: Option<u32>,
    pub idle_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub log_level: Option<String>,
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_listen_config()
            .context("Listen configuration validation failed")?;
        self.validate_remote_config()
            .context("Remote configuration validation failed")?;
        self.validate_relay_config()
            .context("Relay configuration validation failed")?;
        self.validate_logging_config()
            .context("Logging configuration validation failed")?;
        Ok(())
    }

    fn validate_listen_config(&self) -> Result<()> {
        if self.listen.host.trim().is_empty() {
            bail!("listen.host must not be empty");
        }

        if self.listen.backlog == 0 {
            bail!("listen.backlog must be greater than 0");
        }

        Ok(())
    }

    fn validate_remote_config(&self) -> Result<()> {
        if self.remote.host.trim().is_empty() {
            bail!("remote.host must not be empty");
        }

        if self.remote.port == 0 {
            bail!("remote.port must be greater than 0");
        }

        if self.remote.connect_timeout == Some(Duration::ZERO) {
            bail!("remote.connect_timeout must be greater than 0 when set");
        }

        Ok(())
    }

    fn validate_relay_config(&self) -> Result<()> {
        if self.relay.buffer_size < MIN_BUFFER_SIZE {
            bail!("relay.buffer_size must be at least {} bytes", MIN_BUFFER_SIZE);
        }

        if self.relay.buffer_size > MAX_BUFFER_SIZE {
            bail!("relay.buffer_size cannot exceed 1MB");
        }

        if self.relay.idle_timeout == Some(Duration::ZERO) {
            bail!("relay.idle_timeout must be greater than 0 when set");
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            bail!("logging.level must be one of: {}", VALID_LOG_LEVELS.join(", "));
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(&mut self, overrides: ConfigOverrides) {
        if let Some(host) = overrides.local_host {
            tracing::info!("CLI override: local host set to {}", host);
            self.listen.host = host;
        }

        if let Some(port) = overrides.local_port {
            self.listen.port = port;
            tracing::info!("CLI override: local port set to {}", port);
        }

        if let Some(host) = overrides.remote_host {
            tracing::info!("CLI override: remote host set to {}", host);
            self.remote.host = host;
        }

        if let Some(port) = overrides.remote_port {
            self.remote.port = port;
            tracing::info!("CLI override: remote port set to {}", port);
        }

        if let Some(buffer_size) = overrides.buffer_size {
            self.relay.buffer_size = buffer_size;
            tracing::info!("CLI override: buffer size set to {} bytes", buffer_size);
        }

        if let Some(backlog) = overrides.backlog {
            self.listen.backlog = backlog;
            tracing::info!("CLI override: backlog set to {}", backlog);
        }

        if let Some(idle_timeout) = overrides.idle_timeout {
            self.relay.idle_timeout = Some(idle_timeout);
            tracing::info!("CLI override: idle timeout set to {:?}", idle_timeout);
        }

        if let Some(connect_timeout) = overrides.connect_timeout {
            self.remote.connect_timeout = Some(connect_timeout);
            tracing::info!("CLI override: connect timeout set to {:?}", connect_timeout);
        }

        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen.host, "0.0.0.0");
        assert_eq!(config.listen.port, 8080);
        assert_eq!(config.relay.buffer_size, 4096);
        assert_eq!(config.relay.idle_timeout, None);
        assert_eq!(config.remote.connect_timeout, None);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = ConfigManager::load_from_str(
            r#"
            [remote]
            host = "10.0.0.5"
            port = 5432
            connect_timeout = "3s"

            [relay]
            idle_timeout = "5m"
            "#,
        )
        .unwrap();

        assert_eq!(config.remote.host, "10.0.0.5");
        assert_eq!(config.remote.port, 5432);
        assert_eq!(config.remote.connect_timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.relay.idle_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.relay.buffer_size, 4096);
        assert_eq!(config.listen, Config::default().listen);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.remote.port = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.relay.buffer_size = 16;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.relay.idle_timeout = Some(Duration::ZERO);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.listen.host = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ephemeral_listen_port_allowed() {
        let mut config = Config::default();
        config.listen.port = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_overrides_take_precedence() {
        let mut config = ConfigManager::load_from_str(
            r#"
            [listen]
            port = 9000

            [remote]
            host = "db.internal"
            port = 5432
            "#,
        )
        .unwrap();

        config.merge_with_cli_args(ConfigOverrides {
            local_port: Some(15432),
            remote_host: Some("10.1.1.1".to_string()),
            idle_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        });

        assert_eq!(config.listen.port, 15432);
        assert_eq!(config.remote.host, "10.1.1.1");
        assert_eq!(config.remote.port, 5432);
        assert_eq!(config.relay.idle_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_unparseable_file_is_error() {
        assert!(ConfigManager::load_from_str("[remote]\nport = \"not a port\"").is_err());
    }
}
