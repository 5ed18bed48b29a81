//! Authgate Proxy - token-authenticating, role-authorizing HTTP reverse proxy
//!
//! A reverse proxy that:
//! - Resolves inbound requests to declared routes (method + host + path regex)
//! - Authenticates callers via header-borne opaque tokens
//! - Authorizes callers against role grants (with an admin bypass)
//! - Forwards allowed requests to upstream targets with `X-Forwarded-*` headers
//! - Hot-reloads its four YAML configuration documents without restart
//! - Exposes request counters on a secondary metrics port

pub mod auth;
pub mod config;
pub mod error;
pub mod forward;
pub mod http_listener;
pub mod index;
pub mod metrics;
pub mod reload;
pub mod routes;
pub mod schema;

// Re-export commonly used types
pub use auth::{authenticate, ANONYMOUS_USER};
pub use config::Settings;
pub use error::ConfigError;
pub use forward::{ForwardError, Forwarder};
pub use http_listener::{build_router, run_proxy_server, GatewayState};
pub use index::Snapshot;
pub use metrics::{build_metrics_router, run_metrics_server, MetricsRegistry};
pub use reload::{load_snapshot, ConfigPaths, ReloadOutcome, Reloader};
pub use routes::{match_route, CompiledRoute};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
