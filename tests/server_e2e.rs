//! End-to-end tests over real TCP connections.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use driftwire::cluster::MemoryProviderMap;
use driftwire::config::Options;
use driftwire::storage::MemoryStorage;

const PART: char = '\x1F';
const SEP: u8 = 0x1E;

struct Client {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Client {
    fn connect(addr: &str) -> Client {
        let stream = TcpStream::connect(addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        let reader = BufReader::new(stream.try_clone().expect("clone"));
        Client { stream, reader }
    }

    fn send(&mut self, parts: &[&str]) {
        let mut frame = parts.join(&PART.to_string()).into_bytes();
        frame.push(SEP);
        self.stream.write_all(&frame).expect("write frame");
    }

    fn recv(&mut self) -> Vec<String> {
        let mut buf = Vec::new();
        self.reader.read_until(SEP, &mut buf).expect("read frame");
        if buf.last() == Some(&SEP) {
            buf.pop();
        }
        String::from_utf8(buf)
            .expect("utf8 frame")
            .split(PART)
            .map(str::to_string)
            .collect()
    }
}

fn start_server(options: Options) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    std::thread::spawn(move || {
        driftwire::server::run(
            options,
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryProviderMap::new()),
            listener,
        )
    });
    addr
}

fn options() -> Options {
    Options {
        server_name: "e2e".to_string(),
        ..Options::default()
    }
}

#[test]
fn record_update_reaches_other_subscribers() {
    let addr = start_server(options());
    let mut reader = Client::connect(&addr);
    let mut writer = Client::connect(&addr);

    reader.send(&["RECORD", "READ", "user/1"]);
    assert_eq!(
        reader.recv(),
        vec!["RECORD", "UPDATE", "user/1", "0-00000000000000", "{}"]
    );

    writer.send(&["RECORD", "UPDATE", "user/1", "1-abc", "{\"x\":1}"]);
    assert_eq!(
        reader.recv(),
        vec!["RECORD", "UPDATE", "user/1", "1-abc", "{\"x\":1}"]
    );
}

#[test]
fn read_replays_the_stored_record() {
    let addr = start_server(options());
    let mut writer = Client::connect(&addr);

    // Subscribing first also orders the write ahead of the later read.
    writer.send(&["RECORD", "READ", "user/2"]);
    let _ = writer.recv();
    writer.send(&["RECORD", "UPDATE", "user/2", "4-t", "{\"y\":2}"]);

    let mut reader = Client::connect(&addr);
    reader.send(&["RECORD", "READ", "user/2"]);
    assert_eq!(
        reader.recv(),
        vec!["RECORD", "UPDATE", "user/2", "4-t", "{\"y\":2}"]
    );
}

#[test]
fn rpc_round_trip() {
    let addr = start_server(options());
    let mut provider = Client::connect(&addr);
    let mut requestor = Client::connect(&addr);

    provider.send(&["RPC", "PROVIDE", "addTwo"]);
    // Round-trip a read so the PROVIDE is processed before the request.
    provider.send(&["RECORD", "READ", "sync/provider"]);
    let _ = provider.recv();

    requestor.send(&["RPC", "REQUEST", "addTwo", "c-1", "{\"numA\":5,\"numB\":7}"]);
    assert_eq!(
        provider.recv(),
        vec!["RPC", "REQUEST", "addTwo", "c-1", "{\"numA\":5,\"numB\":7}"]
    );

    provider.send(&["RPC", "ACCEPT", "addTwo", "c-1"]);
    assert_eq!(requestor.recv(), vec!["RPC", "ACCEPT", "addTwo", "c-1"]);

    provider.send(&["RPC", "RESPONSE", "addTwo", "c-1", "\"12\""]);
    assert_eq!(
        requestor.recv(),
        vec!["RPC", "RESPONSE", "addTwo", "c-1", "\"12\""]
    );
}

#[test]
fn listen_offer_and_accept_flow() {
    let addr = start_server(options());
    let mut listener = Client::connect(&addr);
    let mut subscriber = Client::connect(&addr);

    listener.send(&["RECORD", "LISTEN", "user/.*"]);
    // Order the LISTEN ahead of the subscription below.
    listener.send(&["RECORD", "READ", "sync/listener"]);
    let _ = listener.recv();

    subscriber.send(&["RECORD", "READ", "user/7"]);
    let _ = subscriber.recv();

    assert_eq!(
        listener.recv(),
        vec!["RECORD", "SUBSCRIPTION_FOR_PATTERN_FOUND", "user/.*", "user/7"]
    );

    listener.send(&["RECORD", "LISTEN_ACCEPT", "user/.*", "user/7"]);
    assert_eq!(
        subscriber.recv(),
        vec!["RECORD", "SUBSCRIPTION_HAS_PROVIDER", "user/7", "T"]
    );
}

#[test]
fn provider_disconnect_fails_inflight_request() {
    let addr = start_server(options());
    let mut provider = Client::connect(&addr);
    let mut requestor = Client::connect(&addr);

    provider.send(&["RPC", "PROVIDE", "job"]);
    provider.send(&["RECORD", "READ", "sync/p"]);
    let _ = provider.recv();

    requestor.send(&["RPC", "REQUEST", "job", "c-9", "{}"]);
    let _ = provider.recv();
    provider.send(&["RPC", "ACCEPT", "job", "c-9"]);
    let _ = requestor.recv();

    drop(provider);
    assert_eq!(
        requestor.recv(),
        vec!["RPC", "ERROR", "NO_RPC_PROVIDER", "job", "c-9"]
    );
}

#[test]
fn unknown_action_is_answered_at_the_connection() {
    let addr = start_server(options());
    let mut client = Client::connect(&addr);
    client.send(&["RECORD", "FROBNICATE", "x"]);
    assert_eq!(
        client.recv(),
        vec!["RECORD", "ERROR", "UNKNOWN_ACTION", "FROBNICATE"]
    );
}
