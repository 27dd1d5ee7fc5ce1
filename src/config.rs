//! Server options (normative defaults).

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Options {
    /// Unique identity of this server in the cluster.
    pub server_name: String,
    /// Upper bound on resident record cache entries. Entries with local
    /// subscribers are pinned and never count against eviction.
    pub cache_size: usize,
    /// Record names matching this pattern skip the storage write on UPDATE
    /// and the storage load on READ.
    pub storage_exclusion: Option<String>,
    /// Milliseconds a provider has to ACCEPT a forwarded request.
    pub rpc_ack_timeout_ms: u64,
    /// Milliseconds from ACCEPT until the response is overdue.
    pub rpc_timeout_ms: u64,
    /// Milliseconds between broadcast flushes. Zero flushes on every pass
    /// of the state loop.
    pub broadcast_timeout_ms: u64,
    /// Milliseconds a listener has to accept a provider offer.
    pub listen_response_timeout_ms: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            server_name: String::new(),
            cache_size: 10_000,
            storage_exclusion: None,
            rpc_ack_timeout_ms: 1_000,
            rpc_timeout_ms: 10_000,
            broadcast_timeout_ms: 0,
            listen_response_timeout_ms: 500,
        }
    }
}

impl Options {
    pub fn rpc_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_ack_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast_timeout_ms)
    }

    pub fn listen_response_timeout(&self) -> Duration {
        Duration::from_millis(self.listen_response_timeout_ms)
    }

    /// Compile the storage exclusion pattern, if configured.
    pub fn compile_storage_exclusion(&self) -> Result<Option<Regex>, ConfigError> {
        match &self.storage_exclusion {
            None => Ok(None),
            Some(raw) => {
                Regex::new(raw)
                    .map(Some)
                    .map_err(|source| ConfigError::BadStorageExclusion {
                        raw: raw.clone(),
                        source,
                    })
            }
        }
    }
}

pub fn load_from_path(path: &std::path::Path) -> Result<Options, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Unparseable {
        path: path.to_path_buf(),
        source,
    })
}
