//! Forwarder adapter: the outbound leg of the proxy.
//!
//! One operation: send the inbound request to an upstream base URL,
//! preserving method, path + query, headers, and body, with `X-Forwarded-*`
//! injection. Upstream failures surface as [`ForwardError`] so the dispatcher
//! can answer 502; upstream responses stream back unchanged.

use std::net::IpAddr;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;

/// Upstream proxy failure, distinct from configuration and dispatch errors.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid upstream target `{target}`: {source}")]
    InvalidTarget {
        target: String,
        #[source]
        source: axum::http::uri::InvalidUri,
    },

    #[error("failed to build upstream request: {0}")]
    Build(#[from] axum::http::Error),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),
}

/// Connection-level hop-by-hop headers that must not be forwarded.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name)
}

/// Thin contract over the HTTP client used for upstream requests.
pub struct Forwarder {
    client: Client<HttpConnector, Body>,
    /// Local proxy port, reported as `X-Forwarded-Port`.
    port: u16,
}

impl Forwarder {
    pub fn new(port: u16) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .build_http();
        Self { client, port }
    }

    /// Forward `req` to `target`, streaming the upstream response back.
    pub async fn forward(
        &self,
        req: Request<Body>,
        target: &str,
        client_ip: IpAddr,
    ) -> Result<Response<Body>, ForwardError> {
        let (parts, body) = req.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let upstream_uri: Uri = format!("{}{}", target.trim_end_matches('/'), path_and_query)
            .parse()
            .map_err(|source| ForwardError::InvalidTarget {
                target: target.to_string(),
                source,
            })?;

        let headers = forwarded_headers(&parts.headers, client_ip, self.port);

        let mut upstream_req = Request::builder()
            .method(parts.method)
            .uri(upstream_uri)
            .body(body)?;
        *upstream_req.headers_mut() = headers;

        let response = self.client.request(upstream_req).await?;
        let (parts, incoming) = response.into_parts();
        Ok(Response::from_parts(parts, Body::new(incoming)))
    }
}

/// Copy inbound headers minus hop-by-hop ones and inject `X-Forwarded-*`.
fn forwarded_headers(inbound: &HeaderMap, client_ip: IpAddr, port: u16) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 4);

    for (name, value) in inbound.iter() {
        if !is_hop_by_hop(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    // Append the client to any forwarded chain a prior proxy started.
    let forwarded_for = match inbound
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }

    headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    if let Some(host) = inbound.get(header::HOST) {
        headers.insert("x-forwarded-host", host.clone());
    }
    if let Ok(value) = HeaderValue::from_str(&port.to_string()) {
        headers.insert("x-forwarded-port", value);
    }

    headers
}
