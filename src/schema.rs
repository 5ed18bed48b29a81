//! Document model and validation for the four configuration files.
//!
//! Each file carries a single top-level key (`routes:`, `users:`, `roles:`,
//! `tokens:`) holding an ordered sequence of records. Serde enforces the
//! wrapper shape; the `validate` methods enforce the per-record rules and
//! report the first violation with a message pinpointing the field.

use serde::Deserialize;

use crate::error::ConfigError;

/// `routes.yaml` - ordered dispatch rules.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutesFile {
    pub routes: Vec<RouteDoc>,
}

/// One dispatch rule. `path` and each `hosts[i]` are regex strings compiled
/// once when the snapshot is built.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteDoc {
    pub path: String,
    #[serde(default)]
    pub methods: Option<Vec<String>>,
    #[serde(default)]
    pub hosts: Option<Vec<String>>,
    pub proxy: ProxyDoc,
    pub resource: String,
    #[serde(default)]
    pub anonymous: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyDoc {
    pub target: String,
}

/// `users.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct UsersFile {
    pub users: Vec<UserDoc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserDoc {
    pub name: String,
    /// Absent is equivalent to empty. Unknown role names contribute nothing.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Grants every operation regardless of role grants.
    #[serde(default)]
    pub admin: bool,
}

/// `roles.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct RolesFile {
    pub roles: Vec<RoleDoc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleDoc {
    pub name: String,
    pub grants: Vec<GrantDoc>,
}

/// A permission to access a resource. Absent `methods` means all methods.
#[derive(Debug, Clone, Deserialize)]
pub struct GrantDoc {
    pub resource: String,
    #[serde(default)]
    pub methods: Option<Vec<String>>,
}

/// `tokens.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct TokensFile {
    pub tokens: Vec<TokenDoc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenDoc {
    pub token: String,
    pub user: String,
}

impl RoutesFile {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, route) in self.routes.iter().enumerate() {
            if route.path.is_empty() {
                return Err(ConfigError::rule(format!(
                    "routes[{i}].path must not be empty"
                )));
            }
            if route.proxy.target.is_empty() {
                return Err(ConfigError::rule(format!(
                    "routes[{i}].proxy.target must not be empty"
                )));
            }
            if route.resource.is_empty() {
                return Err(ConfigError::rule(format!(
                    "routes[{i}].resource must not be empty"
                )));
            }
            if let Some(methods) = &route.methods {
                for (j, method) in methods.iter().enumerate() {
                    if method.is_empty() {
                        return Err(ConfigError::rule(format!(
                            "routes[{i}].methods[{j}] must not be empty"
                        )));
                    }
                }
            }
            if let Some(hosts) = &route.hosts {
                for (j, host) in hosts.iter().enumerate() {
                    if host.is_empty() {
                        return Err(ConfigError::rule(format!(
                            "routes[{i}].hosts[{j}] must not be empty"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl UsersFile {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, user) in self.users.iter().enumerate() {
            if user.name.is_empty() {
                return Err(ConfigError::rule(format!(
                    "users[{i}].name must not be empty"
                )));
            }
            for (j, role) in user.roles.iter().enumerate() {
                if role.is_empty() {
                    return Err(ConfigError::rule(format!(
                        "users[{i}].roles[{j}] must not be empty"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl RolesFile {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, role) in self.roles.iter().enumerate() {
            if role.name.is_empty() {
                return Err(ConfigError::rule(format!(
                    "roles[{i}].name must not be empty"
                )));
            }
            for (j, grant) in role.grants.iter().enumerate() {
                if grant.resource.is_empty() {
                    return Err(ConfigError::rule(format!(
                        "roles[{i}].grants[{j}].resource must not be empty"
                    )));
                }
                if let Some(methods) = &grant.methods {
                    for (k, method) in methods.iter().enumerate() {
                        if method.is_empty() {
                            return Err(ConfigError::rule(format!(
                                "roles[{i}].grants[{j}].methods[{k}] must not be empty"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl TokensFile {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, token) in self.tokens.iter().enumerate() {
            if token.token.is_empty() {
                return Err(ConfigError::rule(format!(
                    "tokens[{i}].token must not be empty"
                )));
            }
            if token.user.is_empty() {
                return Err(ConfigError::rule(format!(
                    "tokens[{i}].user must not be empty"
                )));
            }
        }
        Ok(())
    }
}
