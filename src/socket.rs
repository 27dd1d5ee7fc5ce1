//! Socket handles.
//!
//! The core never touches the network directly. A [`SocketRef`] is a cheap
//! clonable handle carrying a stable uuid and an outbound frame channel; the
//! connection endpoint drains the channel onto the real stream. Tests read
//! the channel directly.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use crossbeam::channel::{Receiver, Sender};
use uuid::Uuid;

use crate::protocol::{error_frame, ErrorCode, Topic, FRAME_SEPARATOR};

#[derive(Clone)]
pub struct SocketRef {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    uuid: Uuid,
    outbound: Sender<Bytes>,
    open: AtomicBool,
}

impl SocketRef {
    /// Create a socket handle plus the receiving end of its outbound queue.
    pub fn pair() -> (SocketRef, Receiver<Bytes>) {
        let (tx, rx) = crossbeam::channel::unbounded();
        let socket = SocketRef {
            inner: Arc::new(SocketInner {
                uuid: Uuid::new_v4(),
                outbound: tx,
                open: AtomicBool::new(true),
            }),
        };
        (socket, rx)
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Mark the handle closed; subsequent sends are dropped silently.
    pub fn mark_closed(&self) {
        self.inner.open.store(false, Ordering::Release);
    }

    /// Queue a frame for delivery, appending the record separator if the
    /// frame does not already end with one.
    pub fn send_frame(&self, frame: &Bytes) {
        if !self.is_open() {
            return;
        }
        let framed = if frame.last() == Some(&FRAME_SEPARATOR) {
            frame.clone()
        } else {
            let mut buf = BytesMut::with_capacity(frame.len() + 1);
            buf.extend_from_slice(frame);
            buf.extend_from_slice(&[FRAME_SEPARATOR]);
            buf.freeze()
        };
        let _ = self.inner.outbound.send(framed);
    }

    /// Queue an ERROR frame for this socket.
    pub fn send_error(&self, topic: Topic, code: ErrorCode, context: &[&str]) {
        self.send_frame(&error_frame(topic, code, context));
    }
}

impl fmt::Debug for SocketRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketRef")
            .field("uuid", &self.inner.uuid)
            .field("open", &self.is_open())
            .finish()
    }
}

impl PartialEq for SocketRef {
    fn eq(&self, other: &Self) -> bool {
        self.inner.uuid == other.inner.uuid
    }
}

impl Eq for SocketRef {}
