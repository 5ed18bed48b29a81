//! Public-facing proxy server and request dispatch pipeline.
//!
//! Every request flows match -> authenticate -> authorize -> forward, against
//! a snapshot captured once at entry so an in-flight request is immune to a
//! mid-flight reload. Outcomes map to 404 (no route), 401 (unauthenticated),
//! 403 (denied), 502 (upstream failure), or the upstream's own response; a
//! panicking handler is converted to 500 by the catch-panic layer. Each
//! outcome increments exactly one counter.

use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{debug, error, info, warn};

use crate::auth::{authenticate, ANONYMOUS_USER};
use crate::forward::Forwarder;
use crate::index::Snapshot;
use crate::metrics::MetricsRegistry;
use crate::routes::match_route;

/// Shared state for the dispatch handler.
#[derive(Clone)]
pub struct GatewayState {
    /// Single reader-visible snapshot handle; written only by the reloader.
    pub snapshot: Arc<ArcSwap<Snapshot>>,
    pub forwarder: Arc<Forwarder>,
    pub metrics: Arc<MetricsRegistry>,
    /// Ordered, lowercased header names to consult for tokens.
    pub auth_headers: Arc<Vec<String>>,
}

/// Build the proxy router. All paths funnel into the dispatch handler.
pub fn build_router(state: GatewayState) -> Router {
    let metrics = state.metrics.clone();

    Router::new()
        .fallback(any(dispatch))
        .layer(CatchPanicLayer::custom(
            move |err: Box<dyn Any + Send + 'static>| {
                let detail = if let Some(s) = err.downcast_ref::<String>() {
                    s.clone()
                } else if let Some(s) = err.downcast_ref::<&str>() {
                    (*s).to_string()
                } else {
                    "unknown panic".to_string()
                };
                error!("request handler panicked: {detail}");
                metrics.record_internal_error(500);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Error").into_response()
            },
        ))
        .with_state(state)
}

async fn dispatch(
    State(state): State<GatewayState>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    // One read of the atomic handle; this reference serves the whole request.
    let snapshot = state.snapshot.load_full();

    let method = req.method().as_str().to_string();
    // Routes match the URL-line as received, query string included.
    let url_line = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| req.uri().path())
        .to_string();
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let Some(route) = match_route(snapshot.routes(), &method, &url_line, &host) else {
        debug!(%method, url = %url_line, %host, "no route matched");
        state.metrics.record_request(404, "");
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };
    let resource = route.resource.clone();

    let user = if route.anonymous {
        ANONYMOUS_USER.to_string()
    } else {
        let Some(user) = authenticate(&snapshot, req.headers(), &state.auth_headers) else {
            debug!(%method, url = %url_line, %resource, "authentication failed");
            state.metrics.record_request(401, &resource);
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        };
        if !snapshot.allow(user, &resource, &method) {
            debug!(%user, %resource, %method, "authorization denied");
            state.metrics.record_request(403, &resource);
            return (StatusCode::FORBIDDEN, "Forbidden").into_response();
        }
        user.to_string()
    };

    debug!(%user, %resource, target = %route.target, "forwarding request");

    match state.forwarder.forward(req, &route.target, client.ip()).await {
        Ok(response) => {
            // One "proxied" counter per request that reached the upstream
            // response phase; the 302 code label is a convention, not a
            // status the client sees.
            state.metrics.record_request(302, &resource);
            response
        }
        Err(e) => {
            warn!(%resource, target = %route.target, "upstream request failed: {e}");
            state.metrics.record_request(502, &resource);
            (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
        }
    }
}

/// Run the proxy server until `shutdown` resolves. In-flight requests are
/// allowed to complete.
pub async fn run_proxy_server(
    addr: SocketAddr,
    state: GatewayState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("proxy server listening on {addr}");

    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    Ok(())
}
