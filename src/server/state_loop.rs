//! The state thread: every mutation of server state happens here.

use std::time::Instant;

use crossbeam::channel::{never, Receiver, Sender};

use super::{epoch_ms, Server};
use crate::protocol::Message;
use crate::socket::SocketRef;
use crate::storage::{ChangeNotice, StorageDone, StorageOp};

/// Events fed to the state thread by connection readers.
pub enum ServerEvent {
    Message(SocketRef, Message),
    Disconnected(SocketRef),
}

/// Run until the event channel closes (all connection feeders gone).
///
/// Fairly selects over client messages, storage completions, the storage
/// changefeed, cluster watch events, and a tick armed from the earliest
/// pending deadline.
pub fn run_state_loop(
    mut server: Server,
    event_rx: Receiver<ServerEvent>,
    storage_done_rx: Receiver<StorageDone>,
    change_rx: Receiver<ChangeNotice>,
    provider_watch_rx: Receiver<String>,
    storage_tx: Sender<StorageOp>,
) {
    loop {
        let now = Instant::now();
        let tick = match server.next_deadline(now) {
            Some(at) => crossbeam::channel::after(at.saturating_duration_since(now)),
            None => never(),
        };

        crossbeam::select! {
            recv(event_rx) -> event => {
                match event {
                    Ok(ServerEvent::Message(socket, message)) => {
                        let now = Instant::now();
                        server.dispatch(&socket, &message, now, epoch_ms());
                        server.housekeeping(now, epoch_ms());
                    }
                    Ok(ServerEvent::Disconnected(socket)) => {
                        let now = Instant::now();
                        server.connection_lost(&socket, now);
                        server.housekeeping(now, epoch_ms());
                    }
                    Err(_) => {
                        let _ = storage_tx.send(StorageOp::Shutdown);
                        tracing::info!("event channel closed, state loop exiting");
                        return;
                    }
                }
            }
            recv(storage_done_rx) -> done => {
                if let Ok(done) = done {
                    server.on_storage_done(done);
                    server.housekeeping(Instant::now(), epoch_ms());
                }
            }
            recv(change_rx) -> notice => {
                if let Ok(notice) = notice {
                    server.on_storage_change(notice);
                    server.housekeeping(Instant::now(), epoch_ms());
                }
            }
            recv(provider_watch_rx) -> name => {
                if let Ok(name) = name {
                    server.on_provider_watch(name, Instant::now());
                    server.housekeeping(Instant::now(), epoch_ms());
                }
            }
            recv(tick) -> _ => {
                server.housekeeping(Instant::now(), epoch_ms());
            }
        }
    }
}
