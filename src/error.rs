//! Crate-level error types.
//!
//! Protocol errors answered to a single socket never surface here; they are
//! encoded as ERROR frames at the offending connection. These types cover
//! the plugin and startup boundaries.

use std::path::PathBuf;

use thiserror::Error;

/// Storage plugin failure. Storage errors are reported and logged but never
/// tear down server state; the plugin is expected to recover.
#[derive(Debug, Error, Clone)]
#[error("storage {op} for `{name}` failed: {reason}")]
pub struct StorageError {
    pub op: &'static str,
    pub name: String,
    pub reason: String,
}

impl StorageError {
    pub fn get(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            op: "get",
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn set(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            op: "set",
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Cluster state plugin failure. These schedule a coarse re-reconcile
/// rather than propagating.
#[derive(Debug, Error, Clone)]
#[error("cluster state {op} failed: {reason}")]
pub struct ClusterError {
    pub op: &'static str,
    pub reason: String,
}

impl ClusterError {
    pub fn new(op: &'static str, reason: impl Into<String>) -> Self {
        Self {
            op,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Unparseable {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("storage exclusion pattern `{raw}` does not compile: {source}")]
    BadStorageExclusion { raw: String, source: regex::Error },
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

pub type Result<T, E = ServerError> = std::result::Result<T, E>;
