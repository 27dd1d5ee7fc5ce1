use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::Receiver;

use super::Server;
use crate::cluster::MemoryProviderMap;
use crate::config::Options;
use crate::protocol::{build_frame, parse_frame, Action, Topic, FRAME_SEPARATOR};
use crate::socket::SocketRef;
use crate::storage::{MemoryStorage, StorageDone, StorageOp, StoragePlugin};

struct Rig {
    server: Server,
    storage: MemoryStorage,
    op_rx: Receiver<StorageOp>,
    now: Instant,
    now_ms: u64,
}

impl Rig {
    fn new(options: Options) -> Self {
        let (op_tx, op_rx) = crossbeam::channel::unbounded();
        let server = Server::new(&options, op_tx, Arc::new(MemoryProviderMap::new())).unwrap();
        Self {
            server,
            storage: MemoryStorage::new(),
            op_rx,
            now: Instant::now(),
            now_ms: 1_000_000,
        }
    }

    fn send(&mut self, socket: &SocketRef, topic: Topic, action: Action, data: &[&str]) {
        let msg = parse_frame(&build_frame(topic, action, data)).unwrap();
        self.server.dispatch(socket, &msg, self.now, self.now_ms);
        self.pump_storage();
        self.server.housekeeping(self.now, self.now_ms);
    }

    fn pump_storage(&mut self) {
        while let Ok(op) = self.op_rx.try_recv() {
            match op {
                StorageOp::Get { name } => {
                    let result = self.storage.get(&name);
                    self.server.on_storage_done(StorageDone::Get { name, result });
                }
                StorageOp::Set { record, sender } => {
                    let result = self.storage.set(&record);
                    self.server.on_storage_done(StorageDone::Set {
                        name: record.name,
                        sender,
                        result,
                    });
                }
                StorageOp::Shutdown => {}
            }
        }
    }

    fn advance(&mut self, by: Duration) {
        self.now += by;
        self.now_ms += by.as_millis() as u64;
        self.server.housekeeping(self.now, self.now_ms);
    }
}

fn frames(rx: &Receiver<Bytes>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(buf) = rx.try_recv() {
        for raw in buf.split(|b| *b == FRAME_SEPARATOR) {
            if raw.is_empty() {
                continue;
            }
            let msg = parse_frame(raw).unwrap();
            out.push(format!(
                "{}/{}:{}",
                msg.topic.as_str(),
                msg.action.as_str(),
                msg.data.join(",")
            ));
        }
    }
    out
}

#[test]
fn dispatch_routes_records_and_rpcs_independently() {
    let mut rig = Rig::new(Options::default());
    let (client, client_rx) = SocketRef::pair();
    let (provider, provider_rx) = SocketRef::pair();

    rig.send(&client, Topic::Record, Action::Read, &["user/1"]);
    assert_eq!(
        frames(&client_rx),
        vec!["RECORD/UPDATE:user/1,0-00000000000000,{}"]
    );

    rig.send(&provider, Topic::Rpc, Action::Provide, &["addTwo"]);
    rig.send(&client, Topic::Rpc, Action::Request, &["addTwo", "c1", "{}"]);
    assert_eq!(frames(&provider_rx), vec!["RPC/REQUEST:addTwo,c1,{}"]);
}

#[test]
fn update_round_trips_through_read() {
    let mut rig = Rig::new(Options::default());
    let (writer, _writer_rx) = SocketRef::pair();
    rig.send(
        &writer,
        Topic::Record,
        Action::Update,
        &["user/1", "3-abc", "{\"name\":\"ada\"}"],
    );

    let (reader, reader_rx) = SocketRef::pair();
    rig.send(&reader, Topic::Record, Action::Read, &["user/1"]);
    assert_eq!(
        frames(&reader_rx),
        vec!["RECORD/UPDATE:user/1,3-abc,{\"name\":\"ada\"}"]
    );
}

#[test]
fn connection_lost_sweeps_records_and_rpcs() {
    let mut rig = Rig::new(Options::default());
    let (gone, gone_rx) = SocketRef::pair();
    let (requestor, requestor_rx) = SocketRef::pair();

    rig.send(&gone, Topic::Record, Action::Read, &["user/1"]);
    rig.send(&gone, Topic::Rpc, Action::Provide, &["addTwo"]);
    let _ = frames(&gone_rx);

    gone.mark_closed();
    rig.server.connection_lost(&gone, rig.now);
    rig.server.housekeeping(rig.now, rig.now_ms);

    // The provider set is empty now.
    rig.send(
        &requestor,
        Topic::Rpc,
        Action::Request,
        &["addTwo", "c1", "{}"],
    );
    assert_eq!(
        frames(&requestor_rx),
        vec!["RPC/ERROR:NO_RPC_PROVIDER,addTwo,c1"]
    );
}

#[test]
fn broadcast_timeout_coalesces_updates_into_one_tick() {
    let options = Options {
        broadcast_timeout_ms: 50,
        ..Options::default()
    };
    let mut rig = Rig::new(options);
    let (writer, _writer_rx) = SocketRef::pair();
    let (reader, reader_rx) = SocketRef::pair();

    rig.send(&reader, Topic::Record, Action::Read, &["a"]);
    rig.advance(Duration::from_millis(60));
    let _ = frames(&reader_rx);

    rig.send(&writer, Topic::Record, Action::Update, &["a", "1-t", "{}"]);
    rig.send(&writer, Topic::Record, Action::Update, &["a", "2-t", "{}"]);
    // Within the window nothing is delivered yet.
    assert!(frames(&reader_rx).is_empty());

    rig.advance(Duration::from_millis(50));
    assert_eq!(
        frames(&reader_rx),
        vec!["RECORD/UPDATE:a,1-t,{}", "RECORD/UPDATE:a,2-t,{}"]
    );
}

#[test]
fn rpc_timeouts_fire_from_housekeeping() {
    let options = Options {
        rpc_ack_timeout_ms: 100,
        ..Options::default()
    };
    let mut rig = Rig::new(options);
    let (provider, _provider_rx) = SocketRef::pair();
    let (requestor, requestor_rx) = SocketRef::pair();

    rig.send(&provider, Topic::Rpc, Action::Provide, &["slow"]);
    rig.send(&requestor, Topic::Rpc, Action::Request, &["slow", "c1", "{}"]);
    assert!(rig.server.next_deadline(rig.now).is_some());

    rig.advance(Duration::from_millis(100));
    assert_eq!(
        frames(&requestor_rx),
        vec!["RPC/ERROR:ACCEPT_TIMEOUT,slow,c1"]
    );
}

#[test]
fn listen_patterns_topic_is_not_client_facing() {
    let mut rig = Rig::new(Options::default());
    let (client, client_rx) = SocketRef::pair();
    rig.send(&client, Topic::ListenPatterns, Action::Listen, &["x"]);
    assert_eq!(
        frames(&client_rx),
        vec!["LISTEN_PATTERNS/ERROR:INVALID_MESSAGE_DATA"]
    );
}
