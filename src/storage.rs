//! Storage plugin boundary.
//!
//! Storage is authoritative for cross-process conflict resolution; its
//! changefeed is the only cross-process record-update signal the core
//! consumes. Lookups and writes run on a dedicated worker thread so the
//! state loop never blocks on plugin IO; completions re-enter the loop as
//! [`StorageDone`] events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam::channel::{Receiver, Sender};
use serde_json::Value;

use crate::error::StorageError;
use crate::socket::SocketRef;
use crate::version::RecordVersion;

/// A record as the storage layer sees it: no wire frame, just the
/// versioned document.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub name: String,
    pub version: RecordVersion,
    pub body: Value,
}

/// A remote write observed by the storage layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotice {
    pub name: String,
    pub version: RecordVersion,
}

pub trait StoragePlugin: Send + Sync + 'static {
    fn get(&self, name: &str) -> Result<Option<StoredRecord>, StorageError>;
    fn set(&self, record: &StoredRecord) -> Result<(), StorageError>;
    /// Stream of remote-write notifications.
    fn watch(&self) -> Receiver<ChangeNotice>;
}

/// Operation sent to the storage worker thread.
pub enum StorageOp {
    Get {
        name: String,
    },
    Set {
        record: StoredRecord,
        /// Originating socket, so a failed write can be reported back.
        sender: SocketRef,
    },
    Shutdown,
}

/// Completion re-entering the state loop.
pub enum StorageDone {
    Get {
        name: String,
        result: Result<Option<StoredRecord>, StorageError>,
    },
    Set {
        name: String,
        sender: SocketRef,
        result: Result<(), StorageError>,
    },
}

/// Drain storage ops until shutdown. One op at a time; the plugin is free
/// to block.
pub fn run_storage_worker(
    plugin: Arc<dyn StoragePlugin>,
    op_rx: Receiver<StorageOp>,
    done_tx: Sender<StorageDone>,
) {
    for op in op_rx {
        match op {
            StorageOp::Get { name } => {
                let result = plugin.get(&name);
                if done_tx.send(StorageDone::Get { name, result }).is_err() {
                    return;
                }
            }
            StorageOp::Set { record, sender } => {
                let result = plugin.set(&record);
                let done = StorageDone::Set {
                    name: record.name,
                    sender,
                    result,
                };
                if done_tx.send(done).is_err() {
                    return;
                }
            }
            StorageOp::Shutdown => return,
        }
    }
}

/// In-process storage for single-node deployments and tests. Writes apply
/// unconditionally (last writer wins at this layer; the cache merge is the
/// version arbiter). Remote writes can be injected with
/// [`MemoryStorage::emit_change`].
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageState>>,
}

#[derive(Default)]
struct MemoryStorageState {
    records: HashMap<String, StoredRecord>,
    watchers: Vec<Sender<ChangeNotice>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record and notify watchers, as a write from another process
    /// would.
    pub fn emit_change(&self, record: StoredRecord) {
        let notice = ChangeNotice {
            name: record.name.clone(),
            version: record.version.clone(),
        };
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.records.insert(record.name.clone(), record);
        state.watchers.retain(|tx| tx.send(notice.clone()).is_ok());
    }
}

impl StoragePlugin for MemoryStorage {
    fn get(&self, name: &str) -> Result<Option<StoredRecord>, StorageError> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.records.get(name).cloned())
    }

    fn set(&self, record: &StoredRecord) -> Result<(), StorageError> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.records.insert(record.name.clone(), record.clone());
        Ok(())
    }

    fn watch(&self) -> Receiver<ChangeNotice> {
        let (tx, rx) = crossbeam::channel::unbounded();
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.watchers.push(tx);
        rx
    }
}
