//! Error types for the daemon's fallible collaborators.
//!
//! None of these reach IPC callers: engine operations absorb them and report
//! through tracing.

use std::path::PathBuf;

/// Failures while reading or writing the persisted wear snapshot.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("Failed to prepare data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("SQLite error: {context}: {source}")]
    Sqlite {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Persistence backend unavailable: {0}")]
    Unavailable(String),
}

impl PersistError {
    pub fn sqlite(context: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| PersistError::Sqlite { context, source }
    }
}

/// Failures while loading the TOML configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Home directory not found")]
    NoHome,
}
