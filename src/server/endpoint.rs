//! TCP connection endpoint.
//!
//! One reader thread per connection parses `\x1E`-terminated frames and
//! feeds the state loop; a writer thread drains the socket's outbound
//! queue. Reader EOF or error raises the disconnect event that sweeps the
//! socket out of every registry.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};

use crossbeam::channel::{Receiver, Sender};

use super::ServerEvent;
use crate::protocol::{parse_frame, CodecError, ErrorCode, Topic, FRAME_SEPARATOR};
use crate::socket::SocketRef;

pub fn run_acceptor(listener: TcpListener, event_tx: Sender<ServerEvent>) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let event_tx = event_tx.clone();
                std::thread::spawn(move || handle_connection(stream, event_tx));
            }
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
            }
        }
    }
}

fn handle_connection(stream: TcpStream, event_tx: Sender<ServerEvent>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let reader = match stream.try_clone() {
        Ok(clone) => BufReader::new(clone),
        Err(err) => {
            tracing::error!(peer = %peer, error = %err, "failed to clone stream");
            return;
        }
    };

    let (socket, outbound_rx) = SocketRef::pair();
    let writer_handle = spawn_writer(stream, outbound_rx);
    tracing::debug!(peer = %peer, uuid = %socket.uuid(), "connection open");

    read_frames(reader, &socket, &event_tx);

    socket.mark_closed();
    let _ = event_tx.send(ServerEvent::Disconnected(socket));
    let _ = writer_handle.join();
    tracing::debug!(peer = %peer, "connection closed");
}

fn spawn_writer(
    mut stream: TcpStream,
    outbound_rx: Receiver<bytes::Bytes>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        for frame in outbound_rx {
            if stream.write_all(&frame).is_err() {
                return;
            }
        }
    })
}

fn read_frames(mut reader: BufReader<TcpStream>, socket: &SocketRef, event_tx: &Sender<ServerEvent>) {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(FRAME_SEPARATOR, &mut buf) {
            Ok(0) => return,
            Ok(_) => {}
            Err(_) => return,
        }
        if buf.last() == Some(&FRAME_SEPARATOR) {
            buf.pop();
        }
        if buf.is_empty() {
            continue;
        }
        match parse_frame(&buf) {
            Ok(message) => {
                if event_tx
                    .send(ServerEvent::Message(socket.clone(), message))
                    .is_err()
                {
                    return;
                }
            }
            Err(CodecError::UnknownAction { topic, raw }) => {
                socket.send_error(topic, ErrorCode::UnknownAction, &[raw.as_str()]);
            }
            Err(err) => {
                tracing::debug!(error = %err, "dropping malformed frame");
                socket.send_error(Topic::Record, ErrorCode::InvalidMessageData, &[]);
            }
        }
    }
}
