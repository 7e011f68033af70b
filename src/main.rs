//! MarketCache Service
//!
//! Runs the coordination layer with its background jobs and exposes the
//! operations endpoints.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    marketcache                            │
//! ├──────────────────────────────────────────────────────────┤
//! │  TimeoutStore ─▶ InMemoryKeyValueStore                     │
//! │  Scheduler: views flush │ offers reap │ viewers reap       │
//! │  Events ─▶ broadcast + log      Ops: /healthz /metrics     │
//! └──────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use marketcache::adapters::{
    BroadcastEventPublisher, CompositeEventPublisher, InMemoryKeyValueStore, LoggingDurableStore,
    LoggingEventPublisher, TimeoutStore,
};
use marketcache::config::parse_duration;
use marketcache::{ops, Coordinator, CoordinationConfig, Error, Result, SystemClock};

// =============================================================================
// CLI Arguments
// =============================================================================

/// MarketCache - caching and real-time coordination layer
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "MARKETCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Key prefix (overrides the configuration file)
    #[arg(long, env = "MARKETCACHE_KEY_PREFIX")]
    key_prefix: Option<String>,

    /// Store operation timeout, e.g. "250ms" (overrides the configuration file)
    #[arg(long, env = "MARKETCACHE_OP_TIMEOUT")]
    op_timeout: Option<String>,

    /// Ops server bind address
    #[arg(long, env = "OPS_ADDR", default_value = "0.0.0.0:8080")]
    ops_addr: String,

    /// Capacity of the live event broadcast channel
    #[arg(long, env = "BROADCAST_CAPACITY", default_value = "1024")]
    broadcast_capacity: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = load_config(&args)?;
    info!("Starting marketcache");
    info!("  Key prefix: {}", config.store.key_prefix);
    info!("  Store op timeout: {:?}", config.store.op_timeout);
    info!("  View flush interval: {:?}", config.counters.flush_interval);
    info!("  Offer reap interval: {:?}", config.expiration.reap_interval);

    let clock = SystemClock::shared();
    let store = Arc::new(TimeoutStore::new(
        Arc::new(InMemoryKeyValueStore::new(clock.clone())),
        config.store.op_timeout,
    ));
    let publisher = CompositeEventPublisher::new()
        .with_publisher(BroadcastEventPublisher::new(args.broadcast_capacity))
        .with_publisher(LoggingEventPublisher::new());

    let coordinator = Arc::new(Coordinator::new(
        config,
        store,
        Arc::new(LoggingDurableStore),
        Arc::new(publisher),
        clock,
    )?);
    coordinator.start();

    let shutdown = CancellationToken::new();
    let ops_handle = tokio::spawn({
        let coordinator = coordinator.clone();
        let shutdown = shutdown.clone();
        let addr = args.ops_addr.clone();
        async move {
            if let Err(e) = ops::serve(&addr, coordinator, shutdown).await {
                error!("Ops server error: {}", e);
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.cancel();
    coordinator.shutdown().await;
    if let Err(e) = ops_handle.await {
        error!("Ops server task failed: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

fn load_config(args: &Args) -> Result<CoordinationConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            CoordinationConfig::from_file(path)?
        }
        None => CoordinationConfig::default(),
    };

    if let Some(prefix) = &args.key_prefix {
        config.store.key_prefix = prefix.clone();
    }
    if let Some(timeout) = &args.op_timeout {
        config.store.op_timeout = parse_duration(timeout)?;
    }
    config.validate().map_err(|e| match e {
        Error::Config(msg) => Error::Config(format!("invalid configuration: {}", msg)),
        other => other,
    })?;
    Ok(config)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "hyper_util=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
