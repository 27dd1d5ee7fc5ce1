//! Server assembly: topic dispatch, timer pacing, thread wiring.
//!
//! Three thread roles, one serialization point:
//! - connection reader threads parse frames and feed the state loop;
//! - the state thread owns every registry, cache, and invocation map;
//! - a storage worker runs plugin IO off the state thread.

mod endpoint;
mod state_loop;

pub use endpoint::run_acceptor;
pub use state_loop::{run_state_loop, ServerEvent};

use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam::channel::Sender;

use crate::cluster::ProviderMap;
use crate::config::Options;
use crate::error::{ConfigError, Result, ServerError};
use crate::protocol::{ErrorCode, Message, Topic};
use crate::record::RecordHandler;
use crate::rpc::RpcHandler;
use crate::socket::SocketRef;
use crate::storage::{run_storage_worker, ChangeNotice, StorageDone, StorageOp, StoragePlugin};

/// Wall time in milliseconds since the Unix epoch, for cluster-comparable
/// offer deadlines.
pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct Server {
    record: RecordHandler,
    rpc: RpcHandler,
    broadcast_timeout: Duration,
    next_flush: Option<Instant>,
}

impl Server {
    pub fn new(
        options: &Options,
        storage_tx: Sender<StorageOp>,
        providers: Arc<dyn ProviderMap>,
    ) -> Result<Self, ConfigError> {
        let storage_exclusion = options.compile_storage_exclusion()?;
        Ok(Self {
            record: RecordHandler::new(options, storage_exclusion, storage_tx, providers),
            rpc: RpcHandler::new(options),
            broadcast_timeout: options.broadcast_timeout(),
            next_flush: None,
        })
    }

    pub fn dispatch(&mut self, socket: &SocketRef, msg: &Message, now: Instant, now_ms: u64) {
        match msg.topic {
            Topic::Record => self.record.handle(socket, msg, now, now_ms),
            Topic::Rpc => self.rpc.handle(socket, msg, now),
            Topic::ListenPatterns => {
                // Cluster-internal namespace; clients have no business here.
                socket.send_error(Topic::ListenPatterns, ErrorCode::InvalidMessageData, &[]);
            }
        }
    }

    pub fn on_storage_done(&mut self, done: StorageDone) {
        self.record.on_storage_done(done);
    }

    pub fn on_storage_change(&mut self, notice: ChangeNotice) {
        self.record.on_storage_change(notice);
    }

    pub fn on_provider_watch(&mut self, name: String, now: Instant) {
        self.record.on_provider_watch_event(name, now);
    }

    pub fn connection_lost(&mut self, socket: &SocketRef, now: Instant) {
        socket.mark_closed();
        self.record.connection_lost(socket, now);
        self.rpc.connection_lost(socket, now);
    }

    /// Earliest instant at which [`Server::housekeeping`] has work.
    pub fn next_deadline(&mut self, now: Instant) -> Option<Instant> {
        let mut deadline = match (self.rpc.next_deadline(), self.record.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if self.record.has_pending_broadcasts() {
            let flush_at = self.next_flush.unwrap_or(now);
            deadline = Some(deadline.map_or(flush_at, |d| d.min(flush_at)));
        }
        deadline
    }

    /// Fire every due timer and flush coalesced broadcasts on the
    /// configured cadence.
    pub fn housekeeping(&mut self, now: Instant, now_ms: u64) {
        self.rpc.fire_due(now);
        self.record.fire_due(now, now_ms);

        if self.record.has_pending_broadcasts() {
            match self.next_flush {
                None => {
                    if self.broadcast_timeout.is_zero() {
                        self.record.flush_broadcasts();
                    } else {
                        self.next_flush = Some(now + self.broadcast_timeout);
                    }
                }
                Some(at) if at <= now => {
                    self.record.flush_broadcasts();
                    self.next_flush = None;
                }
                Some(_) => {}
            }
        } else {
            self.next_flush = None;
        }
    }
}

/// Bind everything together and serve until the listener fails.
///
/// Spawns the storage worker and the state thread, then runs the acceptor
/// on the calling thread.
pub fn run(
    options: Options,
    storage: Arc<dyn StoragePlugin>,
    providers: Arc<dyn ProviderMap>,
    listener: TcpListener,
) -> Result<()> {
    let (storage_tx, storage_op_rx) = crossbeam::channel::unbounded();
    let (storage_done_tx, storage_done_rx) = crossbeam::channel::unbounded();
    let (event_tx, event_rx) = crossbeam::channel::unbounded();
    let change_rx = storage.watch();
    let provider_watch_rx = providers.watch();

    let server = Server::new(&options, storage_tx.clone(), providers).map_err(ServerError::from)?;

    let worker_storage = Arc::clone(&storage);
    std::thread::spawn(move || run_storage_worker(worker_storage, storage_op_rx, storage_done_tx));
    std::thread::spawn(move || {
        run_state_loop(
            server,
            event_rx,
            storage_done_rx,
            change_rx,
            provider_watch_rx,
            storage_tx,
        )
    });

    tracing::info!(server_name = %options.server_name, "accepting connections");
    run_acceptor(listener, event_tx);
    Ok(())
}

#[cfg(test)]
mod tests;
