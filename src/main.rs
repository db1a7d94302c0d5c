use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{GatekeeperConfig, StorageBackend};
use gatekeeper::http::{AdmissionState, HttpServer};
use gatekeeper::ratelimit::{
    LimiterStorage, MemoryStorage, PolicyRegistry, RateLimiter, RedisStorage,
};

/// How often the in-memory backend drops expired entries.
const MEMORY_PURGE_INTERVAL: Duration = Duration::from_secs(30);

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

/// Admission control in front of an HTTP service.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Default log level; `RUST_LOG` takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, &cli.log_level);

    info!("Starting Gatekeeper admission service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = GatekeeperConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.addr {
        config.server.http_addr = addr;
    }
    info!(
        http_addr = %config.server.http_addr,
        backend = ?config.storage.backend,
        "Configuration loaded"
    );

    let storage = build_storage(&config).await?;

    let policies = Arc::new(PolicyRegistry::from_config(&config.rate_limiting)?);
    let rate_limiter = Arc::new(
        RateLimiter::new(storage, policies)
            .with_counter_window(config.rate_limiting.counter_window()),
    );
    info!(
        tiers = ?rate_limiter.policies().tier_labels().collect::<Vec<_>>(),
        counter_window_secs = ?config.rate_limiting.counter_window_secs,
        "Rate limiter initialized"
    );

    let state = AdmissionState::new(rate_limiter, config.rate_limiting.failure_mode);
    let server = HttpServer::new(config.server.http_addr, state);

    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Gatekeeper admission service stopped");
    Ok(())
}

/// Install the global tracing subscriber.
fn init_tracing(format: LogFormat, level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Connect the configured counter backend.
async fn build_storage(config: &GatekeeperConfig) -> anyhow::Result<Arc<dyn LimiterStorage>> {
    match config.storage.backend {
        StorageBackend::Redis => {
            let storage = RedisStorage::connect(config.storage.redis.connection_info()?).await?;
            storage.ping().await?;
            Ok(Arc::new(storage) as Arc<dyn LimiterStorage>)
        }
        StorageBackend::Memory => {
            let storage = Arc::new(MemoryStorage::new());
            spawn_purge_loop(storage.clone());
            info!("Using in-memory counter backend");
            Ok(storage as Arc<dyn LimiterStorage>)
        }
    }
}

/// Periodically drop expired entries from the in-memory backend.
fn spawn_purge_loop(storage: Arc<MemoryStorage>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(MEMORY_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            let removed = storage.purge_expired();
            if removed > 0 {
                debug!(removed = removed, "Purged expired entries");
            }
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
