//! Request counters and the metrics endpoint.
//!
//! Two counter families: `proxy_requests_total{code,resource}` for dispatch
//! outcomes (the `302` code label means "proxied to upstream") and
//! `internal_errors_total{code}` for unexpected handler failures. A secondary
//! HTTP server exposes them: `GET /ready` answers `Ready`, every other path
//! returns the text exposition.

use std::fmt::Write;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::routing::{any, get};
use axum::Router;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Key for the request counter family.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RequestKey {
    code: u16,
    resource: String,
}

/// Counter registry shared by all request handlers.
pub struct MetricsRegistry {
    requests: DashMap<RequestKey, AtomicU64>,
    internal_errors: DashMap<u16, AtomicU64>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            requests: DashMap::new(),
            internal_errors: DashMap::new(),
            start_time: Instant::now(),
        }
    }

    /// Count one dispatch outcome. Routeless outcomes (404) pass an empty
    /// resource label.
    pub fn record_request(&self, code: u16, resource: &str) {
        self.requests
            .entry(RequestKey {
                code,
                resource: resource.to_string(),
            })
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count one unexpected handler failure.
    pub fn record_internal_error(&self, code: u16) {
        self.internal_errors
            .entry(code)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Export all counters in Prometheus text format. Entries are sorted so
    /// the exposition is stable across scrapes.
    pub fn export_prometheus(&self) -> String {
        let mut output = String::with_capacity(1024);

        output.push_str("# HELP authgate_uptime_seconds Server uptime in seconds\n");
        output.push_str("# TYPE authgate_uptime_seconds gauge\n");
        let _ = writeln!(output, "authgate_uptime_seconds {}", self.uptime_secs());

        let mut requests: Vec<(RequestKey, u64)> = self
            .requests
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        requests.sort_by(|a, b| a.0.cmp(&b.0));

        output.push_str("# HELP proxy_requests_total Dispatch outcomes by status code and resource\n");
        output.push_str("# TYPE proxy_requests_total counter\n");
        for (key, count) in requests {
            let _ = writeln!(
                output,
                "proxy_requests_total{{code=\"{}\",resource=\"{}\"}} {}",
                key.code, key.resource, count
            );
        }

        let mut errors: Vec<(u16, u64)> = self
            .internal_errors
            .iter()
            .map(|entry| (*entry.key(), entry.value().load(Ordering::Relaxed)))
            .collect();
        errors.sort_by_key(|(code, _)| *code);

        output.push_str("# HELP internal_errors_total Unexpected handler failures by status code\n");
        output.push_str("# TYPE internal_errors_total counter\n");
        for (code, count) in errors {
            let _ = writeln!(output, "internal_errors_total{{code=\"{code}\"}} {count}");
        }

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialOrd for RequestKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RequestKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.code, &self.resource).cmp(&(other.code, &other.resource))
    }
}

/// Build the metrics router: `GET /ready` for readiness, everything else
/// serves the exposition.
pub fn build_metrics_router(metrics: Arc<MetricsRegistry>) -> Router {
    Router::new()
        .route("/ready", get(ready_handler))
        .fallback(any(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(metrics)
}

async fn ready_handler() -> &'static str {
    "Ready"
}

async fn metrics_handler(State(metrics): State<Arc<MetricsRegistry>>) -> String {
    metrics.export_prometheus()
}

/// Run the metrics server until `shutdown` resolves.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<MetricsRegistry>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("metrics server listening on {addr}");

    axum::serve(listener, build_metrics_router(metrics))
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
