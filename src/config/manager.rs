//! Configuration Manager

use super::{Config, Protocol};
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from a TOML file.
    ///
    /// The file is not validated here: CLI overrides are applied afterwards and
    /// the merged result is validated once.
    pub fn load_from_file(path: &Path) -> Result<Config> {
        tracing::info!("Loading configuration from: {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load configuration from `PORTREDIR_*` environment variables on top of the defaults
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(protocol) = std::env::var("PORTREDIR_PROTOCOL") {
            config.redirect.protocol = match protocol.to_ascii_lowercase().as_str() {
                "tcp" => Protocol::Tcp,
                "udp" => Protocol::Udp,
                "http" => Protocol::Http,
                other => bail!("Invalid PORTREDIR_PROTOCOL: {}", other),
            };
        }

        if let Ok(port) = std::env::var("PORTREDIR_LISTEN_PORT") {
            config.redirect.listen_port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid PORTREDIR_LISTEN_PORT: {}", port))?;
        }

        if let Ok(host) = std::env::var("PORTREDIR_DESTINATION_HOST") {
            config.redirect.destination_host = host;
        }

        if let Ok(port) = std::env::var("PORTREDIR_DESTINATION_PORT") {
            config.redirect.destination_port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid PORTREDIR_DESTINATION_PORT: {}", port))?;
        }

        if let Ok(verbose) = std::env::var("PORTREDIR_VERBOSE") {
            config.redirect.verbose = verbose
                .parse::<bool>()
                .with_context(|| format!("Invalid PORTREDIR_VERBOSE: {}", verbose))?;
        }

        if let Ok(bind_host) = std::env::var("PORTREDIR_BIND_HOST") {
            config.server.bind_host = bind_host;
        }

        if let Ok(buffer_size) = std::env::var("PORTREDIR_BUFFER_SIZE") {
            config.server.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid PORTREDIR_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Ok(timeout) = std::env::var("PORTREDIR_CONNECT_TIMEOUT") {
            config.server.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid PORTREDIR_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Ok(log_level) = std::env::var("PORTREDIR_LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_redirect_config()
            .with_context(|| "Redirect configuration validation failed")?;

        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_monitoring_config()
            .with_context(|| "Monitoring configuration validation failed")?;

        Ok(())
    }

    fn validate_redirect_config(&self) -> Result<()> {
        let host = self.redirect.destination_host.trim();
        if host.is_empty() {
            bail!("destination_host must be set");
        }

        if host.chars().any(char::is_whitespace) {
            bail!("destination_host must be a single host literal, got '{}'", host);
        }

        if self.redirect.destination_port == 0 {
            bail!("destination_port must be greater than 0");
        }

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.bind_host.trim().is_empty() {
            bail!("bind_host must not be empty");
        }

        if self.server.buffer_size < 1024 {
            bail!("buffer_size must be at least 1024 bytes");
        }

        if self.server.buffer_size > 1048576 {
            bail!("buffer_size cannot exceed 1MB");
        }

        if self.server.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        if self.server.accept_backoff.is_zero() {
            bail!("accept_backoff must be greater than 0");
        }

        if self.server.accept_backoff > Duration::from_secs(60) {
            bail!("accept_backoff cannot exceed 60 seconds");
        }

        if self.server.udp_idle_timeout.is_zero() {
            bail!("udp_idle_timeout must be greater than 0");
        }

        if self.server.max_http_body_bytes == 0 {
            bail!("max_http_body_bytes must be greater than 0");
        }

        Ok(())
    }

    fn validate_monitoring_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            bail!("monitoring.log_level must be one of: {}", valid_log_levels.join(", "));
        }

        Ok(())
    }

    /// Merge with CLI arguments
    #[allow(clippy::too_many_arguments)]
    pub fn merge_with_cli_args(
        &mut self,
        protocol: Option<Protocol>,
        listen_port: Option<u16>,
        destination_host: Option<&str>,
        destination_port: Option<u16>,
        verbose: bool,
        buffer_size: Option<usize>,
        connect_timeout: Option<u64>,
        metrics_addr: Option<SocketAddr>,
    ) {
        if let Some(protocol) = protocol {
            self.redirect.protocol = protocol;
            tracing::info!("CLI override: protocol set to {}", protocol);
        }

        if let Some(port) = listen_port {
            self.redirect.listen_port = port;
            tracing::info!("CLI override: listen port set to {}", port);
        }

        if let Some(host) = destination_host {
            self.redirect.destination_host = host.to_string();
            tracing::info!("CLI override: destination host set to {}", host);
        }

        if let Some(port) = destination_port {
            self.redirect.destination_port = port;
            tracing::info!("CLI override: destination port set to {}", port);
        }

        if verbose {
            self.redirect.verbose = true;
        }

        if let Some(buffer_size) = buffer_size {
            self.server.buffer_size = buffer_size;
            tracing::info!("CLI override: buffer size set to {} bytes", buffer_size);
        }

        if let Some(timeout_secs) = connect_timeout {
            self.server.connect_timeout = Duration::from_secs(timeout_secs);
            tracing::info!("CLI override: connect timeout set to {}s", timeout_secs);
        }

        if let Some(addr) = metrics_addr {
            self.monitoring.metrics_addr = Some(addr);
            tracing::info!("CLI override: metrics address set to {}", addr);
        }
    }
}
