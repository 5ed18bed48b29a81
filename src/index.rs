//! Derived indices and the immutable configuration snapshot.
//!
//! A [`Snapshot`] bundles the compiled routes with four lookup indices built
//! from the validated documents. It is created by the reloader, published by
//! one `ArcSwap` store, and read concurrently by request handlers; it exposes
//! read operations only. Either all four indices build or the whole attempt
//! fails - partial results are never observable.

use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

use crate::error::ConfigError;
use crate::routes::CompiledRoute;
use crate::schema::{RoleDoc, RolesFile, RoutesFile, TokensFile, UserDoc, UsersFile};

/// Per-user, per-resource method allowance. A grant without `methods` sets
/// `wildcard`; wildcard is tested before method membership.
#[derive(Debug, Clone, Default)]
pub struct MethodAllowance {
    wildcard: bool,
    methods: HashSet<String>,
}

impl MethodAllowance {
    fn permit(&mut self, methods: Option<&Vec<String>>) {
        match methods {
            None => self.wildcard = true,
            Some(methods) => {
                self.methods
                    .extend(methods.iter().map(|m| m.to_ascii_uppercase()));
            }
        }
    }

    pub fn allows(&self, method: &str) -> bool {
        self.wildcard || self.methods.contains(method)
    }
}

type GrantIndex = HashMap<String, HashMap<String, MethodAllowance>>;

/// Immutable bundle of compiled routes and derived indices.
#[derive(Debug)]
pub struct Snapshot {
    routes: Vec<CompiledRoute>,
    /// token -> user name; keys unique across the document.
    token_index: HashMap<String, String>,
    /// user name -> user record.
    user_index: HashMap<String, UserDoc>,
    /// role name -> role record.
    role_index: HashMap<String, RoleDoc>,
    /// user name -> resource -> allowance; built only for non-admin users.
    grant_index: GrantIndex,
    /// `max(mtime)` of the four source files at build time.
    source_mtime: SystemTime,
}

impl Snapshot {
    /// Fold the validated documents into a snapshot. Duplicate keys are
    /// detected during insertion and abort the build.
    pub fn build(
        routes: &RoutesFile,
        users: &UsersFile,
        roles: &RolesFile,
        tokens: &TokensFile,
        source_mtime: SystemTime,
    ) -> Result<Self, ConfigError> {
        let compiled = routes
            .routes
            .iter()
            .enumerate()
            .map(|(i, doc)| CompiledRoute::compile(i, doc))
            .collect::<Result<Vec<_>, _>>()?;

        let mut token_index = HashMap::with_capacity(tokens.tokens.len());
        for record in &tokens.tokens {
            if token_index
                .insert(record.token.clone(), record.user.clone())
                .is_some()
            {
                return Err(ConfigError::rule(format!(
                    "duplicate token for user `{}`",
                    record.user
                )));
            }
        }

        let mut user_index = HashMap::with_capacity(users.users.len());
        for user in &users.users {
            if user_index.insert(user.name.clone(), user.clone()).is_some() {
                return Err(ConfigError::rule(format!(
                    "duplicate user name `{}`",
                    user.name
                )));
            }
        }

        let mut role_index = HashMap::with_capacity(roles.roles.len());
        for role in &roles.roles {
            if role_index.insert(role.name.clone(), role.clone()).is_some() {
                return Err(ConfigError::rule(format!(
                    "duplicate role name `{}`",
                    role.name
                )));
            }
        }

        let grant_index = build_grant_index(&user_index, &role_index);

        Ok(Self {
            routes: compiled,
            token_index,
            user_index,
            role_index,
            grant_index,
            source_mtime,
        })
    }

    pub fn routes(&self) -> &[CompiledRoute] {
        &self.routes
    }

    pub fn user_by_token(&self, token: &str) -> Option<&str> {
        self.token_index.get(token).map(String::as_str)
    }

    pub fn user(&self, name: &str) -> Option<&UserDoc> {
        self.user_index.get(name)
    }

    pub fn role(&self, name: &str) -> Option<&RoleDoc> {
        self.role_index.get(name)
    }

    pub fn source_mtime(&self) -> SystemTime {
        self.source_mtime
    }

    /// Decide whether `user` may invoke `resource` under `method`.
    ///
    /// Admin users bypass the grant index entirely; everyone else needs an
    /// allowance for the resource, with wildcard tested before the method.
    pub fn allow(&self, user: &str, resource: &str, method: &str) -> bool {
        if self.user_index.get(user).is_some_and(|u| u.admin) {
            return true;
        }
        let Some(resources) = self.grant_index.get(user) else {
            return false;
        };
        let Some(allowance) = resources.get(resource) else {
            return false;
        };
        allowance.allows(method)
    }
}

/// Union the grants of each non-admin user's roles. Role names that resolve
/// to no known role contribute nothing; duplicate grants collapse via set
/// semantics.
fn build_grant_index(
    user_index: &HashMap<String, UserDoc>,
    role_index: &HashMap<String, RoleDoc>,
) -> GrantIndex {
    let mut index = GrantIndex::new();

    for user in user_index.values() {
        if user.admin {
            continue;
        }
        for role_name in &user.roles {
            let Some(role) = role_index.get(role_name) else {
                continue;
            };
            for grant in &role.grants {
                index
                    .entry(user.name.clone())
                    .or_default()
                    .entry(grant.resource.clone())
                    .or_default()
                    .permit(grant.methods.as_ref());
            }
        }
    }

    index
}
