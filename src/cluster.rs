//! Cluster state boundary: the distributed provider map.
//!
//! One entry per record name, shared across the fleet. Every write goes
//! through [`ProviderMap::upsert`], whose closure sees the current value and
//! either keeps it, replaces it, or clears it; the plugin must give the
//! exchange CAS or serializable semantics. Watch events fan out changes from
//! any node.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam::channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// The listener currently responsible for a record name. `deadline` (epoch
/// ms) is set while the offer is outstanding and cleared on accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub uuid: String,
    pub pattern: String,
    pub server_name: String,
    pub deadline: Option<u64>,
}

/// A listener identity: (socket uuid, pattern).
pub type OfferId = (String, String);

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub provider: Option<Provider>,
    /// Offers already made for this name and rejected or expired, so the
    /// next assignment rotates to a fresh candidate.
    pub history: Vec<OfferId>,
}

impl ProviderEntry {
    pub fn with_history(history: Vec<OfferId>) -> Self {
        Self {
            provider: None,
            history,
        }
    }
}

/// What an upsert closure decided.
pub enum UpsertAction {
    Keep,
    Put(ProviderEntry),
    Clear,
}

/// What an upsert did, with both sides of the exchange for post-commit
/// notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Unchanged,
    Updated {
        prev: Option<ProviderEntry>,
        next: Option<ProviderEntry>,
    },
}

pub trait ProviderMap: Send + Sync + 'static {
    fn get(&self, name: &str) -> Result<Option<ProviderEntry>, ClusterError>;

    /// Atomically exchange the entry for `name`. The closure may run more
    /// than once under contention.
    fn upsert(
        &self,
        name: &str,
        decide: &mut dyn FnMut(Option<&ProviderEntry>) -> UpsertAction,
    ) -> Result<UpsertOutcome, ClusterError>;

    /// Names changed by any node, this one included.
    fn watch(&self) -> Receiver<String>;

    /// Server names of the other currently connected nodes.
    fn remote_servers(&self) -> Result<Vec<String>, ClusterError>;
}

/// Single-node provider map. The mutex makes upserts serializable, which is
/// all the CAS contract asks for in-process.
#[derive(Clone, Default)]
pub struct MemoryProviderMap {
    inner: Arc<Mutex<MemoryProviderState>>,
}

#[derive(Default)]
struct MemoryProviderState {
    entries: HashMap<String, ProviderEntry>,
    watchers: Vec<Sender<String>>,
    remote_servers: Vec<String>,
}

impl MemoryProviderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: pretend the given servers are connected remotes.
    pub fn set_remote_servers(&self, servers: Vec<String>) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.remote_servers = servers;
    }

    /// Test hook: install an entry as a remote node would, notifying
    /// watchers.
    pub fn inject(&self, name: &str, entry: ProviderEntry) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.insert(name.to_string(), entry);
        notify(&mut state, name);
    }
}

fn notify(state: &mut MemoryProviderState, name: &str) {
    state
        .watchers
        .retain(|tx| tx.send(name.to_string()).is_ok());
}

impl ProviderMap for MemoryProviderMap {
    fn get(&self, name: &str) -> Result<Option<ProviderEntry>, ClusterError> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.entries.get(name).cloned())
    }

    fn upsert(
        &self,
        name: &str,
        decide: &mut dyn FnMut(Option<&ProviderEntry>) -> UpsertAction,
    ) -> Result<UpsertOutcome, ClusterError> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let prev = state.entries.get(name).cloned();
        match decide(prev.as_ref()) {
            UpsertAction::Keep => Ok(UpsertOutcome::Unchanged),
            UpsertAction::Put(next) => {
                if prev.as_ref() == Some(&next) {
                    return Ok(UpsertOutcome::Unchanged);
                }
                state.entries.insert(name.to_string(), next.clone());
                notify(&mut state, name);
                Ok(UpsertOutcome::Updated {
                    prev,
                    next: Some(next),
                })
            }
            UpsertAction::Clear => {
                if prev.is_none() {
                    return Ok(UpsertOutcome::Unchanged);
                }
                state.entries.remove(name);
                notify(&mut state, name);
                Ok(UpsertOutcome::Updated { prev, next: None })
            }
        }
    }

    fn watch(&self) -> Receiver<String> {
        let (tx, rx) = crossbeam::channel::unbounded();
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.watchers.push(tx);
        rx
    }

    fn remote_servers(&self) -> Result<Vec<String>, ClusterError> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.remote_servers.clone())
    }
}
