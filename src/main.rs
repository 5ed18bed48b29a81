//! Authgate Proxy - token-authenticating, role-authorizing HTTP reverse proxy
//!
//! Startup order matters: the four configuration documents are loaded
//! synchronously before either server listens, so there is never a serving
//! process without a snapshot. A failed initial load is fatal; later reload
//! failures are logged and the prior snapshot keeps serving.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use authgate_proxy::config::Settings;
use authgate_proxy::forward::Forwarder;
use authgate_proxy::http_listener::{self, GatewayState};
use authgate_proxy::metrics::{self, MetricsRegistry};
use authgate_proxy::reload::{self, Reloader};

/// Authgate Proxy - token-authenticating, role-authorizing HTTP reverse proxy
#[derive(Parser, Debug)]
#[command(name = "authgate-proxy")]
#[command(version, about, long_about = None)]
struct Args {
    /// Base directory for the configuration documents
    #[arg(long, default_value = "local/config", env = "CONFIG_DIR")]
    config_dir: PathBuf,

    /// Tokens document, relative to the config directory
    #[arg(long, default_value = "tokens.yaml", env = "TOKENS_FILE")]
    tokens_file: String,

    /// Users document, relative to the config directory
    #[arg(long, default_value = "users.yaml", env = "USERS_FILE")]
    users_file: String,

    /// Routes document, relative to the config directory
    #[arg(long, default_value = "routes.yaml", env = "ROUTES_FILE")]
    routes_file: String,

    /// Roles document, relative to the config directory
    #[arg(long, default_value = "roles.yaml", env = "ROLES_FILE")]
    roles_file: String,

    /// Proxy listen port
    #[arg(long, default_value_t = 8080, env = "HTTP_PORT")]
    http_port: u16,

    /// Metrics listen port
    #[arg(long, default_value_t = 8181, env = "METRICS_PORT")]
    metrics_port: u16,

    /// Configuration polling interval in milliseconds (0 disables polling)
    #[arg(long, default_value_t = 15000, env = "RELOAD_INTERVAL_MS")]
    reload_interval_ms: u64,

    /// Comma-separated header names to consult for tokens, in priority order
    #[arg(long, default_value = "x-authorization", env = "AUTH_HEADERS")]
    auth_headers: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "JSON_LOGS")]
    json_logs: bool,

    /// Load and validate the configuration, then exit without serving
    #[arg(long)]
    validate: bool,
}

impl Args {
    fn settings(&self) -> Settings {
        Settings {
            config_dir: self.config_dir.clone(),
            tokens_file: self.tokens_file.clone(),
            users_file: self.users_file.clone(),
            routes_file: self.routes_file.clone(),
            roles_file: self.roles_file.clone(),
            http_port: self.http_port,
            metrics_port: self.metrics_port,
            reload_interval_ms: self.reload_interval_ms,
            auth_headers: Settings::parse_auth_headers(&self.auth_headers),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.json_logs)?;

    info!("Starting authgate-proxy v{}", env!("CARGO_PKG_VERSION"));

    let settings = args.settings();
    let paths = settings.paths();
    info!("Configuration directory: {:?}", settings.config_dir);

    // Initial load, synchronous and fatal on error: the server must not
    // listen without a snapshot.
    let snapshot = reload::load_snapshot(&paths)
        .map_err(|e| anyhow::anyhow!("initial configuration load failed: {e}"))?;
    info!(routes = snapshot.routes().len(), "configuration loaded");

    if args.validate {
        info!("Configuration validation successful, exiting");
        return Ok(());
    }

    let current = Arc::new(ArcSwap::from_pointee(snapshot));
    let registry = Arc::new(MetricsRegistry::new());
    let forwarder = Arc::new(Forwarder::new(settings.http_port));

    // Periodic reload: single writer of the snapshot handle.
    let reloader = Arc::new(Reloader::new(paths, current.clone()));
    let reload_task = match settings.reload_interval() {
        Some(period) => {
            info!(
                interval_ms = period.as_millis() as u64,
                "configuration polling enabled"
            );
            Some(tokio::spawn(reloader.run(period)))
        }
        None => {
            info!("configuration polling disabled");
            None
        }
    };

    let state = GatewayState {
        snapshot: current,
        forwarder,
        metrics: registry.clone(),
        auth_headers: Arc::new(settings.auth_headers.clone()),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy_addr = settings.proxy_addr();
    let mut proxy_shutdown = shutdown_rx.clone();
    let proxy_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = proxy_shutdown.changed().await;
        };
        if let Err(e) = http_listener::run_proxy_server(proxy_addr, state, shutdown).await {
            error!("proxy server error: {e}");
        }
    });

    let metrics_addr = settings.metrics_addr();
    let mut metrics_shutdown = shutdown_rx.clone();
    let metrics_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = metrics_shutdown.changed().await;
        };
        if let Err(e) = metrics::run_metrics_server(metrics_addr, registry, shutdown).await {
            error!("metrics server error: {e}");
        }
    });

    info!("authgate-proxy ready: proxy on {proxy_addr}, metrics on {metrics_addr}");

    shutdown_signal().await;
    info!("shutdown signal received, closing servers");

    // Stop the reload timer and let in-flight requests drain.
    if let Some(task) = reload_task {
        task.abort();
    }
    let _ = shutdown_tx.send(true);
    let _ = proxy_handle.await;
    let _ = metrics_handle.await;

    info!("authgate-proxy shutdown complete");
    Ok(())
}

/// Initialize logging
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .init();
    }

    Ok(())
}

/// Wait for an OS shutdown signal
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C");
}
