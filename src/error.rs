//! Configuration error kinds shared by the loader, validator, and index builder.

use std::path::PathBuf;

use thiserror::Error;

/// Any failure encountered while loading, validating, or indexing the four
/// configuration documents. The first error aborts the reload attempt.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Open/stat/read failure on a configuration file.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file's bytes do not parse as the expected YAML document.
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A record violates a shape, uniqueness, or referential rule. The
    /// message pinpoints the offending field.
    #[error("{0}")]
    Rule(String),
}

impl ConfigError {
    pub fn rule(message: impl Into<String>) -> Self {
        Self::Rule(message.into())
    }
}
