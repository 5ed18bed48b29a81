//! Configuration loading and the hot-reload protocol.
//!
//! The reloader polls the four document files on a timer. Each tick: acquire
//! the self-exclusion guard (or skip the tick), open and stat all four files,
//! compare `max(mtime)` against the active snapshot (equal means a silent
//! no-op), then parse, validate, build, and publish the new snapshot with a
//! single atomic store. A failed attempt after a successful prior load keeps
//! the prior snapshot serving; the initial load is performed synchronously by
//! `main` and is fatal on error. File handles close on every exit path.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use crate::error::ConfigError;
use crate::index::Snapshot;
use crate::schema::{RolesFile, RoutesFile, TokensFile, UsersFile};

/// Locations of the four configuration documents.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub tokens: PathBuf,
    pub users: PathBuf,
    pub routes: PathBuf,
    pub roles: PathBuf,
}

/// An opened configuration file with its stat-time mtime.
struct OpenDocument {
    path: PathBuf,
    file: File,
    mtime: SystemTime,
}

impl OpenDocument {
    fn open(path: &Path) -> Result<Self, ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(io_err)?;
        let mtime = file.metadata().and_then(|m| m.modified()).map_err(io_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            mtime,
        })
    }

    fn parse<T: DeserializeOwned>(mut self) -> Result<T, ConfigError> {
        let mut contents = String::new();
        self.file
            .read_to_string(&mut contents)
            .map_err(|source| ConfigError::Io {
                path: self.path.clone(),
                source,
            })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: self.path,
            source,
        })
    }
}

/// All four files opened and statted, prior to parsing.
struct OpenedFiles {
    tokens: OpenDocument,
    users: OpenDocument,
    routes: OpenDocument,
    roles: OpenDocument,
}

impl OpenedFiles {
    fn open(paths: &ConfigPaths) -> Result<Self, ConfigError> {
        Ok(Self {
            tokens: OpenDocument::open(&paths.tokens)?,
            users: OpenDocument::open(&paths.users)?,
            routes: OpenDocument::open(&paths.routes)?,
            roles: OpenDocument::open(&paths.roles)?,
        })
    }

    fn max_mtime(&self) -> SystemTime {
        [
            self.tokens.mtime,
            self.users.mtime,
            self.routes.mtime,
            self.roles.mtime,
        ]
        .into_iter()
        .max()
        .unwrap_or(SystemTime::UNIX_EPOCH)
    }

    /// Parse, validate, and index into a snapshot stamped with `max(mtime)`.
    fn into_snapshot(self) -> Result<Snapshot, ConfigError> {
        let source_mtime = self.max_mtime();

        let tokens: TokensFile = self.tokens.parse()?;
        let users: UsersFile = self.users.parse()?;
        let routes: RoutesFile = self.routes.parse()?;
        let roles: RolesFile = self.roles.parse()?;

        tokens.validate()?;
        users.validate()?;
        routes.validate()?;
        roles.validate()?;

        Snapshot::build(&routes, &users, &roles, &tokens, source_mtime)
    }
}

/// Load a snapshot unconditionally. Used for the initial synchronous load;
/// the server must not listen until this has succeeded.
pub fn load_snapshot(paths: &ConfigPaths) -> Result<Snapshot, ConfigError> {
    OpenedFiles::open(paths)?.into_snapshot()
}

/// What a reload tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Another reload was in progress; the tick was dropped.
    Skipped,
    /// `max(mtime)` matched the active snapshot; nothing to do.
    Unchanged,
    /// A new snapshot was published.
    Reloaded,
}

/// Periodic reloader. Single writer of the shared snapshot handle.
pub struct Reloader {
    paths: ConfigPaths,
    current: Arc<ArcSwap<Snapshot>>,
    is_reloading: AtomicBool,
}

/// Scoped acquisition of the self-exclusion flag; cleared on drop so a
/// panicking reload cannot wedge future ticks.
struct ReloadGuard<'a>(&'a AtomicBool);

impl<'a> ReloadGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ReloadGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Reloader {
    pub fn new(paths: ConfigPaths, current: Arc<ArcSwap<Snapshot>>) -> Self {
        Self {
            paths,
            current,
            is_reloading: AtomicBool::new(false),
        }
    }

    /// Run one reload attempt. Errors leave the active snapshot untouched.
    pub fn try_reload(&self) -> Result<ReloadOutcome, ConfigError> {
        let Some(_guard) = ReloadGuard::acquire(&self.is_reloading) else {
            return Ok(ReloadOutcome::Skipped);
        };

        let opened = OpenedFiles::open(&self.paths)?;
        if opened.max_mtime() == self.current.load().source_mtime() {
            return Ok(ReloadOutcome::Unchanged);
        }

        let snapshot = opened.into_snapshot()?;
        self.current.store(Arc::new(snapshot));
        Ok(ReloadOutcome::Reloaded)
    }

    /// Poll forever at `period`. Failed attempts are logged and retried on
    /// the next tick.
    pub async fn run(self: Arc<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately; the initial
        // load already happened, so consume it.
        interval.tick().await;

        loop {
            interval.tick().await;
            match self.try_reload() {
                Ok(ReloadOutcome::Reloaded) => {
                    let snapshot = self.current.load();
                    info!(routes = snapshot.routes().len(), "configuration reloaded");
                }
                Ok(ReloadOutcome::Unchanged) => {}
                Ok(ReloadOutcome::Skipped) => {
                    debug!("reload already in progress, tick dropped");
                }
                Err(e) => {
                    error!("configuration reload failed, keeping prior snapshot: {e}");
                }
            }
        }
    }
}
