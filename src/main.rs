//! portrelay - Transparent TCP port forwarder

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

use portrelay::{
    config::{ConfigManager, ConfigOverrides},
    Config, Listener, RelayEngine, ShutdownCoordinator,
};

/// CLI arguments for portrelay
#[derive(Parser, Debug)]
#[command(name = "portrelay")]
#[command(about = "Transparent TCP port forwarder")]
#[command(version)]
#[command(long_about = "
portrelay - Transparent TCP port forwarder

Accepts TCP connections on a local address and relays each one, byte for
byte, to a single fixed remote target.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Built-in defaults

RUST_LOG, when set, overrides the log level.
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, help = "Path to TOML configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Local host to listen on (default: 0.0.0.0)")]
    pub local_host: Option<String>,

    #[arg(long, help = "Local port to listen on (default: 8080)")]
    pub local_port: Option<u16>,

    #[arg(long, help = "Remote host/IP to forward to (default: 127.0.0.1)")]
    pub remote_host: Option<String>,

    #[arg(long, help = "Remote port to forward to (default: 8000)")]
    pub remote_port: Option<u16>,

    #[arg(long, help = "Bytes to read/write at a time (default: 4096)")]
    pub buffer_size: Option<usize>,

    #[arg(long, help = "Listen backlog (default: 128)")]
    pub backlog: Option<u32>,

    /// Close sessions with no traffic in either direction for this long
    #[arg(
        long,
        value_parser = humantime::parse_duration,
        help = "Idle session timeout (e.g., 30s, 5m)"
    )]
    pub idle_timeout: Option<Duration>,

    #[arg(
        long,
        value_parser = humantime::parse_duration,
        help = "Remote connect timeout (e.g., 10s)"
    )]
    pub connect_timeout: Option<Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

impl CliArgs {
    /// Level logged at before the configuration file is read
    fn bootstrap_log_level(&self) -> &str {
        if self.verbose {
            "debug"
        } else {
            self.log_level.as_deref().unwrap_or("info")
        }
    }

    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            local_host: self.local_host.clone(),
            local_port: self.local_port,
            remote_host: self.remote_host.clone(),
            remote_port: self.remote_port,
            buffer_size: self.buffer_size,
            backlog: self.backlog,
            idle_timeout: self.idle_timeout,
            connect_timeout: self.connect_timeout,
            log_level: if self.verbose {
                Some("debug".to_string())
            } else {
                self.log_level.clone()
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Tracing comes first so config loading and CLI overrides are logged
    let log_filter = init_tracing(args.bootstrap_log_level());

    let mut config = match &args.config {
        Some(path) => ConfigManager::load_from_file(path)?,
        None => Config::default(),
    };
    config.merge_with_cli_args(args.overrides());

    if let Some(handle) = log_filter {
        if let Err(e) = handle.reload(EnvFilter::new(&config.logging.level)) {
            error!("Failed to apply log level {}: {}", config.logging.level, e);
        }
    }

    config
        .validate()
        .context("Final configuration validation failed")?;

    info!("Starting portrelay v{}", env!("CARGO_PKG_VERSION"));

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Listen address: {}:{}", config.listen.host, config.listen.port);
        info!("  Remote target: {}:{}", config.remote.host, config.remote.port);
        info!("  Backlog: {}", config.listen.backlog);
        info!("  Buffer size: {} bytes", config.relay.buffer_size);
        info!("  Idle timeout: {:?}", config.relay.idle_timeout);
        info!("  Connect timeout: {:?}", config.remote.connect_timeout);
        return Ok(());
    }

    let engine = Arc::new(RelayEngine::from_config(&config));

    // Bind failures are fatal, nothing is retried
    let listener = Listener::bind(&config.listen, engine)
        .await
        .with_context(|| {
            format!(
                "Could not listen on {}:{}. \
                 Check if the port is already in use or if you have permissions",
                config.listen.host, config.listen.port
            )
        })?;

    let shutdown_coordinator = ShutdownCoordinator::new();
    let server_handle = tokio::spawn(listener.run(shutdown_coordinator.subscribe()));

    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
        shutdown_coordinator.trigger();
    }

    if let Err(e) = server_handle.await {
        if !e.is_cancelled() {
            error!("Server task failed: {}", e);
        }
    }

    info!("Listening socket closed, exiting");
    Ok(())
}

/// Initialize tracing/logging
///
/// Returns a handle for replacing the level once the configuration is known,
/// or `None` when `RUST_LOG` decides the filter.
fn init_tracing(log_level: &str) -> Option<reload::Handle<EnvFilter, Registry>> {
    let (env_filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(log_level), false),
    };
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .init();

    (!from_env).then_some(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("portrelay").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_bootstrap_log_level() {
        assert_eq!(parse(&[]).bootstrap_log_level(), "info");
        assert_eq!(parse(&["--log-level", "warn"]).bootstrap_log_level(), "warn");
        assert_eq!(parse(&["-v"]).bootstrap_log_level(), "debug");
        assert_eq!(parse(&["-v", "--log-level", "error"]).bootstrap_log_level(), "debug");
    }

    #[test]
    fn test_overrides_follow_cli_flags() {
        let args = parse(&[
            "-c",
            "/nonexistent/portrelay.toml",
            "--remote-port",
            "9001",
            "--idle-timeout",
            "5m",
            "-v",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("/nonexistent/portrelay.toml")));

        let overrides = args.overrides();
        assert_eq!(overrides.remote_port, Some(9001));
        assert_eq!(overrides.idle_timeout, Some(Duration::from_secs(300)));
        assert_eq!(overrides.log_level.as_deref(), Some("debug"));
        assert_eq!(overrides.local_port, None);
    }
}
