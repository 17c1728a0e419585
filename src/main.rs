use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{LogFormat, LoggingConfig, StorageBackend, TurnstileConfig};
use turnstile::http::HttpServer;
use turnstile::ratelimit::RateLimiter;
use turnstile::storage;

/// Per-caller HTTP rate limiter.
#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the storage backend (redis or memory)
    #[arg(long)]
    backend: Option<StorageBackend>,

    /// Override the log format (text or json)
    #[arg(long)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // A missing .env file is fine; the environment may already be set.
    let _ = dotenvy::dotenv();

    let mut config = TurnstileConfig::load(args.config.as_deref())?;
    if let Some(backend) = args.backend {
        config.storage.backend = backend;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    init_tracing(&config.logging);

    info!("Starting Turnstile Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        listen_addr = %config.server.listen_addr,
        ip_per_second = config.limits.ip_per_second,
        token_per_second = config.limits.token_per_second,
        block_duration_secs = config.limits.block_duration_secs,
        backend = ?config.storage.backend,
        "Configuration loaded"
    );

    let storage = storage::connect(&config.storage).await?;

    let rate_limiter = Arc::new(
        RateLimiter::new(storage, config.limiter_settings())
            .with_operation_timeout(config.operation_timeout()),
    );
    info!("Rate limiter initialized");

    let server = HttpServer::new(config.server.listen_addr, rate_limiter.clone());
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    if let Err(e) = rate_limiter.shutdown().await {
        warn!(error = %e, "Storage shutdown reported an error");
    }
    served?;

    info!("Turnstile Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Resolve on the first Ctrl+C or SIGTERM.
///
/// A listener that cannot be installed is logged and left out; it never
/// triggers a shutdown by itself.
async fn shutdown_signal() {
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(e) => {
                warn!(error = %e, "Ctrl+C listener unavailable");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                "SIGTERM"
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM listener unavailable");
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&str>();

    let received = tokio::select! {
        name = interrupt => name,
        name = terminate => name,
    };
    info!(signal = received, "Shutting down, draining in-flight requests");
}
