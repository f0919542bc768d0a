//! portredir - transparent TCP/UDP/HTTP port redirector
//!
//! Listens on a local port and relays every connection, unmodified, to a
//! single fixed destination.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info};
use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

use portredir::{
    config::{Config, ConfigManager, Protocol},
    metrics::{MetricsServer, RedirectMetrics},
    Redirector, ShutdownCoordinator,
};

/// CLI arguments for portredir
#[derive(Parser, Debug)]
#[command(name = "portredir")]
#[command(about = "Redirect a local port to a remote destination")]
#[command(version)]
#[command(long_about = "
Redirect a local port to a remote destination.

Every connection accepted on the listen port is relayed byte for byte to
destination_host:destination_port until either side closes.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  PORTREDIR_PROTOCOL          - tcp, udp or http
  PORTREDIR_LISTEN_PORT       - Local port to listen on
  PORTREDIR_DESTINATION_HOST  - Destination host
  PORTREDIR_DESTINATION_PORT  - Destination port
  PORTREDIR_VERBOSE           - Log each redirected connection (true/false)
  PORTREDIR_BIND_HOST         - Local address to bind (default 0.0.0.0)
  PORTREDIR_BUFFER_SIZE       - Relay buffer size in bytes
  PORTREDIR_CONNECT_TIMEOUT   - Destination dial timeout (e.g. 10s)
  PORTREDIR_LOG_LEVEL         - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "portredir.toml")]
    pub config: PathBuf,

    /// Protocol to redirect
    #[arg(long, value_enum)]
    pub protocol: Option<Protocol>,

    /// Local port to listen on
    #[arg(short, long)]
    pub listen_port: Option<u16>,

    /// Destination host
    #[arg(short, long)]
    pub destination_host: Option<String>,

    /// Destination port
    #[arg(short = 'p', long)]
    pub destination_port: Option<u16>,

    /// Log every redirected connection
    #[arg(short, long)]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Relay buffer size in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Destination dial timeout in seconds
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Address to serve Prometheus metrics on
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Logging comes up first so configuration loading is visible; the level
    // is settled once the merged config is known.
    let log_filter = init_tracing(&args)?;
    let config = load_config(&args)?;
    if let Some(handle) = log_filter {
        handle
            .reload(EnvFilter::new(&config.monitoring.log_level))
            .context("Failed to apply configured log level")?;
    }

    if args.validate_config {
        println!("Configuration is valid");
        println!("  Protocol: {}", config.redirect.protocol);
        println!("  Listen address: {}", config.listen_addr());
        println!("  Destination: {}", config.redirect.destination());
        println!("  Buffer size: {} bytes", config.server.buffer_size);
        println!("  Connect timeout: {:?}", config.server.connect_timeout);
        println!(
            "  Metrics: {}",
            config
                .monitoring
                .metrics_addr
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| "disabled".to_string())
        );
        return Ok(());
    }

    info!(
        "Starting portredir v{} ({} {} -> {})",
        env!("CARGO_PKG_VERSION"),
        config.redirect.protocol,
        config.listen_addr(),
        config.redirect.destination()
    );

    let config = Arc::new(config);
    let shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);
    let metrics = Arc::new(RedirectMetrics::new()?);

    let metrics_task = config.monitoring.metrics_addr.map(|addr| {
        let server = MetricsServer::new(Arc::clone(&metrics), addr);
        let mut shutdown_rx = shutdown_coordinator.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                result = server.start() => {
                    if let Err(e) = result {
                        error!("Metrics server error: {:#}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Metrics server stopped");
                }
            }
        })
    });

    let redirector = Redirector::bind(Arc::clone(&config), metrics).await?;
    let stop = redirector.stop_handle();
    let engine = redirector.engine();

    let mut server_handle = tokio::spawn(redirector.run());

    tokio::select! {
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!("Redirector stopped"),
                Ok(Err(e)) => error!("Redirector error: {:#}", e),
                Err(e) => error!("Redirector task failed: {}", e),
            }
        }
        signal = shutdown_coordinator.listen_for_signals() => {
            if let Err(e) = signal {
                error!("Error setting up signal handlers: {}", e);
            }

            shutdown_coordinator
                .shutdown_redirector(&stop, engine.as_deref())
                .await?;

            if let Err(e) = server_handle.await {
                error!("Redirector task failed: {}", e);
            }
        }
    }

    shutdown_coordinator.trigger();
    if let Some(task) = metrics_task {
        if let Err(e) = task.await {
            error!("Metrics server task failed: {}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Build the effective configuration: file or environment, then CLI overrides
fn load_config(args: &CliArgs) -> Result<Config> {
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(
        args.protocol,
        args.listen_port,
        args.destination_host.as_deref(),
        args.destination_port,
        args.verbose,
        args.buffer_size,
        args.connect_timeout,
        args.metrics_addr,
    );

    if let Some(level) = &args.log_level {
        config.monitoring.log_level = level.clone();
    } else if config.redirect.verbose && config.monitoring.log_level == "warn" {
        config.monitoring.log_level = "info".to_string();
    }

    config
        .validate()
        .context("Configuration validation failed")?;

    Ok(config)
}

type LogFilterHandle = reload::Handle<EnvFilter, Registry>;

/// Level used until the configuration is loaded
fn provisional_log_level(args: &CliArgs) -> &str {
    match &args.log_level {
        Some(level) => level.as_str(),
        None if args.verbose => "info",
        None => "warn",
    }
}

/// Subscriber with a reloadable filter
fn build_subscriber(level: &str) -> (impl tracing::Subscriber + Send + Sync, LogFilterHandle) {
    let (filter, handle) = reload::Layer::new(EnvFilter::new(level));
    let subscriber = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_level(true)
            .with_ansi(true),
    );
    (subscriber, handle)
}

/// Initialize tracing/logging.
///
/// `RUST_LOG` wins when set and is never reloaded; otherwise a handle is
/// returned so the configured level can replace the provisional one.
fn init_tracing(args: &CliArgs) -> Result<Option<LogFilterHandle>> {
    if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_level(true)
                    .with_ansi(true),
            )
            .try_init()
            .context("Failed to initialize logging")?;
        return Ok(None);
    }

    let (subscriber, handle) = build_subscriber(provisional_log_level(args));
    subscriber
        .try_init()
        .context("Failed to initialize logging")?;
    Ok(Some(handle))
}
