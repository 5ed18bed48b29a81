//! Runtime settings resolved from the environment.
//!
//! All values are externalized - no hardcoded ports, paths, or header names.
//! The actual environment/CLI surface lives on `Args` in `main.rs`; this
//! module holds the resolved settings the rest of the crate consumes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::reload::ConfigPaths;

/// Floor applied to a non-zero reload interval.
pub const MIN_RELOAD_INTERVAL_MS: u64 = 1000;

/// Resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base directory for the four configuration documents.
    pub config_dir: PathBuf,
    /// File names relative to `config_dir`.
    pub tokens_file: String,
    pub users_file: String,
    pub routes_file: String,
    pub roles_file: String,
    /// Proxy listen port.
    pub http_port: u16,
    /// Metrics listen port.
    pub metrics_port: u16,
    /// Polling interval in milliseconds; 0 disables polling.
    pub reload_interval_ms: u64,
    /// Header names to consult for tokens, in priority order, lowercased.
    pub auth_headers: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("local/config"),
            tokens_file: "tokens.yaml".to_string(),
            users_file: "users.yaml".to_string(),
            routes_file: "routes.yaml".to_string(),
            roles_file: "roles.yaml".to_string(),
            http_port: 8080,
            metrics_port: 8181,
            reload_interval_ms: 15000,
            auth_headers: vec!["x-authorization".to_string()],
        }
    }
}

impl Settings {
    /// Parse a comma-separated `AUTH_HEADERS` value into an ordered,
    /// lowercased list. An all-empty value falls back to the default.
    pub fn parse_auth_headers(raw: &str) -> Vec<String> {
        let headers: Vec<String> = raw
            .split(',')
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();

        if headers.is_empty() {
            vec!["x-authorization".to_string()]
        } else {
            headers
        }
    }

    /// Absolute paths of the four configuration documents.
    pub fn paths(&self) -> ConfigPaths {
        ConfigPaths {
            tokens: self.config_dir.join(&self.tokens_file),
            users: self.config_dir.join(&self.users_file),
            routes: self.config_dir.join(&self.routes_file),
            roles: self.config_dir.join(&self.roles_file),
        }
    }

    /// Effective polling period. `None` disables the reload timer; non-zero
    /// values are floored at [`MIN_RELOAD_INTERVAL_MS`].
    pub fn reload_interval(&self) -> Option<Duration> {
        if self.reload_interval_ms == 0 {
            return None;
        }
        Some(Duration::from_millis(
            self.reload_interval_ms.max(MIN_RELOAD_INTERVAL_MS),
        ))
    }

    pub fn proxy_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.http_port))
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.metrics_port))
    }
}
