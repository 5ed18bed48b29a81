//! End-to-end tests for the dispatch pipeline and hot reload.
//!
//! The proxy router is exercised directly with `tower::ServiceExt::oneshot`;
//! forwarding targets a real upstream server bound to an ephemeral port.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use authgate_proxy::forward::Forwarder;
use authgate_proxy::http_listener::{build_router, GatewayState};
use authgate_proxy::index::Snapshot;
use authgate_proxy::metrics::{build_metrics_router, MetricsRegistry};
use authgate_proxy::reload::{load_snapshot, ConfigPaths, ReloadOutcome, Reloader};
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::routing::any;
use axum::Router;
use tower::ServiceExt; // for oneshot

fn client_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 43210))
}

/// Spawn a real upstream that echoes forwarded headers back for assertions.
async fn spawn_upstream() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let app = Router::new().fallback(any(|headers: HeaderMap| async move {
        let mut echo = HeaderMap::new();
        for name in ["x-forwarded-for", "x-forwarded-host", "x-forwarded-proto"] {
            if let Some(value) = headers.get(name) {
                echo.insert(format!("echo-{name}").parse::<axum::http::HeaderName>().unwrap(), value.clone());
            }
        }
        (echo, "upstream response")
    }));

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// An address that refuses connections: bound, observed, then dropped.
async fn dead_upstream() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

fn snapshot_from_yaml(routes: &str, users: &str, roles: &str, tokens: &str) -> Snapshot {
    Snapshot::build(
        &serde_yaml::from_str(routes).unwrap(),
        &serde_yaml::from_str(users).unwrap(),
        &serde_yaml::from_str(roles).unwrap(),
        &serde_yaml::from_str(tokens).unwrap(),
        SystemTime::UNIX_EPOCH,
    )
    .unwrap()
}

fn state_for(snapshot: Snapshot) -> GatewayState {
    GatewayState {
        snapshot: Arc::new(ArcSwap::from_pointee(snapshot)),
        forwarder: Arc::new(Forwarder::new(8080)),
        metrics: Arc::new(MetricsRegistry::new()),
        auth_headers: Arc::new(vec!["x-authorization".to_string()]),
    }
}

fn request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .extension(ConnectInfo(client_addr()))
        .body(Body::empty())
        .unwrap()
}

fn request_with_header(method: &str, uri: &str, name: &str, value: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(name, value)
        .extension(ConnectInfo(client_addr()))
        .body(Body::empty())
        .unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn anonymous_route_accepts_with_and_without_auth_header() {
    let upstream = spawn_upstream().await;
    let snapshot = snapshot_from_yaml(
        &format!(
            "routes: [{{path: '^/public', proxy: {{target: 'http://{upstream}'}}, resource: pub, anonymous: true}}]"
        ),
        "users: []",
        "roles: []",
        "tokens: []",
    );
    let state = state_for(snapshot);
    let app = build_router(state.clone());

    let response = app.clone().oneshot(request("GET", "/public")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "upstream response");

    // The token index is never consulted; any value is accepted.
    let response = app
        .oneshot(request_with_header("GET", "/public", "x-authorization", "anything"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let exposition = state.metrics.export_prometheus();
    assert!(exposition.contains("proxy_requests_total{code=\"302\",resource=\"pub\"} 2"));
}

#[tokio::test]
async fn role_grants_gate_method_and_token() {
    let upstream = spawn_upstream().await;
    let snapshot = snapshot_from_yaml(
        &format!("routes: [{{path: '^/', proxy: {{target: 'http://{upstream}'}}, resource: api}}]"),
        "users: [{name: john, roles: [reader]}]",
        "roles: [{name: reader, grants: [{resource: api, methods: [GET]}]}]",
        "tokens: [{token: T1, user: john}]",
    );
    let state = state_for(snapshot);
    let app = build_router(state.clone());

    let response = app
        .clone()
        .oneshot(request_with_header("GET", "/", "x-authorization", "T1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(request_with_header("GET", "/", "x-authorization", "unknown"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.clone().oneshot(request("GET", "/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(request_with_header("PUT", "/", "x-authorization", "T1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let exposition = state.metrics.export_prometheus();
    assert!(exposition.contains("proxy_requests_total{code=\"302\",resource=\"api\"} 1"));
    assert!(exposition.contains("proxy_requests_total{code=\"401\",resource=\"api\"} 2"));
    assert!(exposition.contains("proxy_requests_total{code=\"403\",resource=\"api\"} 1"));
}

#[tokio::test]
async fn admin_user_bypasses_role_grants() {
    let upstream = spawn_upstream().await;
    let snapshot = snapshot_from_yaml(
        &format!("routes: [{{path: '^/', proxy: {{target: 'http://{upstream}'}}, resource: api}}]"),
        "users: [{name: alice, admin: true}]",
        "roles: []",
        "tokens: [{token: T2, user: alice}]",
    );
    let app = build_router(state_for(snapshot));

    let response = app
        .oneshot(request_with_header("PUT", "/", "x-authorization", "T2"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn host_gated_route_requires_a_matching_host_header() {
    let upstream = spawn_upstream().await;
    let snapshot = snapshot_from_yaml(
        &format!(
            r"routes: [{{path: '^/hostroute', hosts: ['^host1\.example$', '^host2\.example$'], proxy: {{target: 'http://{upstream}'}}, resource: hr, anonymous: true}}]"
        ),
        "users: []",
        "roles: []",
        "tokens: []",
    );
    let state = state_for(snapshot);
    let app = build_router(state.clone());

    let response = app
        .clone()
        .oneshot(request_with_header("GET", "/hostroute", "host", "host1.example"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(request_with_header("GET", "/hostroute", "host", "host3.example"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Missing Host header matches as the empty string, which no pattern hits.
    let response = app.oneshot(request("GET", "/hostroute")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let exposition = state.metrics.export_prometheus();
    assert!(exposition.contains("proxy_requests_total{code=\"404\",resource=\"\"} 2"));
}

#[tokio::test]
async fn unmatched_method_is_404_not_401() {
    let upstream = spawn_upstream().await;
    let snapshot = snapshot_from_yaml(
        &format!(
            "routes: [{{path: '^/', methods: [GET, POST], proxy: {{target: 'http://{upstream}'}}, resource: api}}]"
        ),
        "users: []",
        "roles: []",
        "tokens: []",
    );
    let app = build_router(state_for(snapshot));

    // No credentials at all: the route simply does not match HEAD, so the
    // outcome is 404 rather than an authentication failure.
    let response = app.oneshot(request("HEAD", "/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn upstream_connection_failure_maps_to_502() {
    let dead = dead_upstream().await;
    let snapshot = snapshot_from_yaml(
        &format!(
            "routes: [{{path: '^/', proxy: {{target: 'http://{dead}'}}, resource: api, anonymous: true}}]"
        ),
        "users: []",
        "roles: []",
        "tokens: []",
    );
    let state = state_for(snapshot);
    let app = build_router(state.clone());

    let response = app.oneshot(request("GET", "/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let exposition = state.metrics.export_prometheus();
    assert!(exposition.contains("proxy_requests_total{code=\"502\",resource=\"api\"} 1"));
}

#[tokio::test]
async fn forwarded_headers_reach_the_upstream() {
    let upstream = spawn_upstream().await;
    let snapshot = snapshot_from_yaml(
        &format!(
            "routes: [{{path: '^/', proxy: {{target: 'http://{upstream}'}}, resource: api, anonymous: true}}]"
        ),
        "users: []",
        "roles: []",
        "tokens: []",
    );
    let app = build_router(state_for(snapshot));

    let response = app
        .oneshot(request_with_header("GET", "/", "host", "app.example"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("echo-x-forwarded-for").unwrap(),
        "127.0.0.1"
    );
    assert_eq!(
        response.headers().get("echo-x-forwarded-host").unwrap(),
        "app.example"
    );
    assert_eq!(
        response.headers().get("echo-x-forwarded-proto").unwrap(),
        "http"
    );
}

#[tokio::test]
async fn ready_endpoint_and_metrics_fallback() {
    let metrics = Arc::new(MetricsRegistry::new());
    metrics.record_request(302, "api");
    let app = build_metrics_router(metrics);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "Ready");

    // Any other path serves the exposition.
    let response = app
        .oneshot(Request::builder().uri("/whatever").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("proxy_requests_total{code=\"302\",resource=\"api\"} 1"));
}

fn write_config(dir: &Path, upstream: SocketAddr) -> ConfigPaths {
    let paths = ConfigPaths {
        tokens: dir.join("tokens.yaml"),
        users: dir.join("users.yaml"),
        routes: dir.join("routes.yaml"),
        roles: dir.join("roles.yaml"),
    };
    fs::write(&paths.tokens, "tokens:\n  - {token: T1, user: john}\n").unwrap();
    fs::write(
        &paths.users,
        "users:\n  - {name: john, roles: [reader]}\n  - {name: jeff, roles: [reader]}\n",
    )
    .unwrap();
    fs::write(
        &paths.routes,
        format!("routes:\n  - {{path: '^/', proxy: {{target: 'http://{upstream}'}}, resource: api}}\n"),
    )
    .unwrap();
    fs::write(
        &paths.roles,
        "roles:\n  - {name: reader, grants: [{resource: api, methods: [GET]}]}\n",
    )
    .unwrap();
    paths
}

fn bump_mtime(path: &Path) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(5))
        .unwrap();
}

#[tokio::test]
async fn reload_picks_up_new_tokens_and_survives_a_broken_document() {
    let upstream = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();
    let paths = write_config(dir.path(), upstream);

    let snapshot = load_snapshot(&paths).unwrap();
    let current = Arc::new(ArcSwap::from_pointee(snapshot));
    let reloader = Reloader::new(paths.clone(), current.clone());

    let state = GatewayState {
        snapshot: current.clone(),
        forwarder: Arc::new(Forwarder::new(8080)),
        metrics: Arc::new(MetricsRegistry::new()),
        auth_headers: Arc::new(vec!["x-authorization".to_string()]),
    };
    let app = build_router(state);

    // The new token does not exist yet.
    let response = app
        .clone()
        .oneshot(request_with_header("GET", "/", "x-authorization", "T3"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Append a token and touch the file; the next tick publishes it.
    fs::write(
        &paths.tokens,
        "tokens:\n  - {token: T1, user: john}\n  - {token: T3, user: jeff}\n",
    )
    .unwrap();
    bump_mtime(&paths.tokens);
    assert_eq!(reloader.try_reload().unwrap(), ReloadOutcome::Reloaded);
    assert_eq!(current.load().user_by_token("T3"), Some("jeff"));

    let response = app
        .clone()
        .oneshot(request_with_header("GET", "/", "x-authorization", "T3"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // A syntactically broken routes document leaves the snapshot serving.
    fs::write(&paths.routes, "routes: [oops").unwrap();
    bump_mtime(&paths.routes);
    assert!(reloader.try_reload().is_err());
    assert_eq!(current.load().user_by_token("T3"), Some("jeff"));

    let response = app
        .oneshot(request_with_header("GET", "/", "x-authorization", "T3"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
