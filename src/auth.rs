//! Header-based token authentication.

use axum::http::HeaderMap;

use crate::index::Snapshot;

/// Effective user attached to requests on anonymous routes.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Resolve the request to a user name via the configured auth headers.
///
/// Headers are consulted in priority order; the first one present on the
/// request is authoritative and later ones are never consulted. A present
/// but empty value means unauthenticated immediately - it does not fall
/// through to the next configured header. A non-empty value is looked up in
/// the token index, which may itself come back empty-handed.
pub fn authenticate<'a>(
    snapshot: &'a Snapshot,
    headers: &HeaderMap,
    auth_headers: &[String],
) -> Option<&'a str> {
    for name in auth_headers {
        let Some(value) = headers.get(name.as_str()) else {
            continue;
        };
        let Ok(token) = value.to_str() else {
            return None;
        };
        if token.is_empty() {
            return None;
        }
        return snapshot.user_by_token(token);
    }
    None
}
