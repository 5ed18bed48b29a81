//! Compiled routes and route matching.
//!
//! Route and host patterns are compiled once when a snapshot is built, so the
//! per-request cost of matching is a linear scan over precompiled regexes.
//! Ordering matters: the first route in declared order that satisfies all of
//! method, host, and path wins, even if later routes would also match.

use std::collections::HashSet;

use regex::Regex;

use crate::error::ConfigError;
use crate::schema::RouteDoc;

/// A dispatch rule with its patterns compiled.
#[derive(Debug, Clone)]
pub struct CompiledRoute {
    /// Matched against the request URL-line as received, including the query.
    path: Regex,
    /// Uppercased method allow-set; `None` matches any method.
    methods: Option<HashSet<String>>,
    /// At least one must match the `Host` header; `None` matches any host.
    hosts: Option<Vec<Regex>>,
    /// Upstream base URL.
    pub target: String,
    /// Opaque label for authorization and metrics.
    pub resource: String,
    /// Skips authentication and authorization when true.
    pub anonymous: bool,
}

impl CompiledRoute {
    /// Compile a validated route document. Pattern compilation failures are
    /// configuration errors naming the offending field.
    pub fn compile(index: usize, doc: &RouteDoc) -> Result<Self, ConfigError> {
        let path = Regex::new(&doc.path).map_err(|e| {
            ConfigError::rule(format!("routes[{index}].path: invalid regex: {e}"))
        })?;

        let hosts = doc
            .hosts
            .as_ref()
            .map(|patterns| {
                patterns
                    .iter()
                    .enumerate()
                    .map(|(j, pattern)| {
                        Regex::new(pattern).map_err(|e| {
                            ConfigError::rule(format!(
                                "routes[{index}].hosts[{j}]: invalid regex: {e}"
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;

        let methods = doc
            .methods
            .as_ref()
            .map(|m| m.iter().map(|m| m.to_ascii_uppercase()).collect());

        Ok(Self {
            path,
            methods,
            hosts,
            target: doc.proxy.target.clone(),
            resource: doc.resource.clone(),
            anonymous: doc.anonymous,
        })
    }

    fn matches(&self, method: &str, url_line: &str, host: &str) -> bool {
        if let Some(methods) = &self.methods {
            if !methods.contains(method) {
                return false;
            }
        }
        if let Some(hosts) = &self.hosts {
            if !hosts.iter().any(|re| re.is_match(host)) {
                return false;
            }
        }
        self.path.is_match(url_line)
    }
}

/// Scan `routes` in declared order and return the first satisfying route.
/// A request with no `Host` header is matched with `host = ""`.
pub fn match_route<'a>(
    routes: &'a [CompiledRoute],
    method: &str,
    url_line: &str,
    host: &str,
) -> Option<&'a CompiledRoute> {
    routes.iter().find(|r| r.matches(method, url_line, host))
}
