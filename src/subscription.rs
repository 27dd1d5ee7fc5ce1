//! Per-topic name→subscriber index with coalesced broadcasts.
//!
//! Outbound frames for a name accumulate in one shared buffer per broadcast
//! tick. Each frame appended on behalf of a sender records its byte range,
//! so at flush time the sender receives the buffer with its own
//! contributions spliced out while everyone else shares a single
//! reference-counted copy.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use uuid::Uuid;

use crate::protocol::{ErrorCode, Topic, FRAME_SEPARATOR};
use crate::socket::SocketRef;

pub struct SubscriptionRegistry {
    topic: Topic,
    subscriptions: HashMap<String, Subscription>,
    by_socket: HashMap<Uuid, HashSet<String>>,
    pending: HashSet<String>,
}

#[derive(Default)]
struct Subscription {
    sockets: Vec<SocketRef>,
    shared: Vec<u8>,
    sender_gaps: HashMap<Uuid, Vec<(usize, usize)>>,
}

impl Subscription {
    fn position_of(&self, uuid: Uuid) -> Option<usize> {
        self.sockets.iter().position(|s| s.uuid() == uuid)
    }

    /// Prepared buffer with the given sender's byte ranges excised.
    fn spliced_with(&self, prepared: &Bytes, uuid: Uuid) -> Vec<u8> {
        let Some(gaps) = self.sender_gaps.get(&uuid) else {
            return prepared.to_vec();
        };
        let mut out = Vec::with_capacity(prepared.len());
        let mut pos = 0;
        for &(start, stop) in gaps {
            out.extend_from_slice(&prepared[pos..start]);
            pos = stop;
        }
        out.extend_from_slice(&prepared[pos..]);
        out
    }
}

impl SubscriptionRegistry {
    pub fn new(topic: Topic) -> Self {
        Self {
            topic,
            subscriptions: HashMap::new(),
            by_socket: HashMap::new(),
            pending: HashSet::new(),
        }
    }

    /// Add `socket` under `name`. Returns the local count after the add, or
    /// `None` (after telling the socket `MULTIPLE_SUBSCRIPTIONS`) when it
    /// was already subscribed.
    pub fn subscribe(&mut self, name: &str, socket: &SocketRef) -> Option<usize> {
        let sub = self.subscriptions.entry(name.to_string()).or_default();
        if sub.position_of(socket.uuid()).is_some() {
            socket.send_error(self.topic, ErrorCode::MultipleSubscriptions, &[name]);
            return None;
        }
        sub.sockets.push(socket.clone());
        let count = sub.sockets.len();
        self.by_socket
            .entry(socket.uuid())
            .or_default()
            .insert(name.to_string());
        Some(count)
    }

    /// Remove `socket` from `name`. Returns the remaining local count, or
    /// `None` when the socket was not subscribed (signalled with
    /// `NOT_SUBSCRIBED` unless `silent`).
    pub fn unsubscribe(&mut self, name: &str, socket: &SocketRef, silent: bool) -> Option<usize> {
        let removed = self.subscriptions.get_mut(name).and_then(|sub| {
            let pos = sub.position_of(socket.uuid())?;
            sub.sockets.remove(pos);
            sub.sender_gaps.remove(&socket.uuid());
            Some(sub.sockets.len())
        });
        let Some(remaining) = removed else {
            if !silent {
                socket.send_error(self.topic, ErrorCode::NotSubscribed, &[name]);
            }
            return None;
        };
        if remaining == 0 && self.subscriptions.get(name).is_some_and(|s| s.shared.is_empty()) {
            self.subscriptions.remove(name);
            self.pending.remove(name);
        }
        if let Some(names) = self.by_socket.get_mut(&socket.uuid()) {
            names.remove(name);
            if names.is_empty() {
                self.by_socket.remove(&socket.uuid());
            }
        }
        Some(remaining)
    }

    /// Queue `frame` for every subscriber of `name` on the next flush. When
    /// a sender is given its byte range is recorded so the sender's own copy
    /// of the tick omits it.
    pub fn send_to_subscribers(&mut self, name: &str, frame: &Bytes, sender: Option<&SocketRef>) {
        let Some(sub) = self.subscriptions.get_mut(name) else {
            return;
        };
        if sub.sockets.is_empty() {
            return;
        }
        let start = sub.shared.len();
        sub.shared.extend_from_slice(frame);
        if frame.last() != Some(&FRAME_SEPARATOR) {
            sub.shared.push(FRAME_SEPARATOR);
        }
        if let Some(sender) = sender {
            sub.sender_gaps
                .entry(sender.uuid())
                .or_default()
                .push((start, sub.shared.len()));
        }
        self.pending.insert(name.to_string());
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Deliver every pending buffer. Non-senders share one prepared
    /// reference-counted buffer; unique senders get their spliced copy.
    pub fn flush(&mut self) {
        for name in std::mem::take(&mut self.pending) {
            let Some(sub) = self.subscriptions.get_mut(&name) else {
                continue;
            };
            if sub.shared.is_empty() {
                continue;
            }
            let prepared = Bytes::from(std::mem::take(&mut sub.shared));
            for socket in &sub.sockets {
                if sub.sender_gaps.contains_key(&socket.uuid()) {
                    let own = sub.spliced_with(&prepared, socket.uuid());
                    if !own.is_empty() {
                        socket.send_frame(&Bytes::from(own));
                    }
                } else {
                    socket.send_frame(&prepared);
                }
            }
            sub.sender_gaps.clear();
            if sub.sockets.is_empty() {
                self.subscriptions.remove(&name);
            }
        }
    }

    pub fn subscribers(&self, name: &str) -> &[SocketRef] {
        self.subscriptions
            .get(name)
            .map(|sub| sub.sockets.as_slice())
            .unwrap_or(&[])
    }

    pub fn local_count(&self, name: &str) -> usize {
        self.subscribers(name).len()
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.local_count(name) > 0
    }

    /// Names with at least one subscriber.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.subscriptions
            .iter()
            .filter(|(_, sub)| !sub.sockets.is_empty())
            .map(|(name, _)| name.as_str())
    }

    /// Names this socket is subscribed to.
    pub fn names_for(&self, socket: &SocketRef) -> Vec<String> {
        self.by_socket
            .get(&socket.uuid())
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Silently drop every subscription held by a closed socket. Returns
    /// `(name, remaining_count)` for each removal so callers can unpin and
    /// reconcile.
    pub fn connection_lost(&mut self, socket: &SocketRef) -> Vec<(String, usize)> {
        let names = self.names_for(socket);
        let mut removed = Vec::with_capacity(names.len());
        for name in names {
            if let Some(remaining) = self.unsubscribe(&name, socket, true) {
                removed.push((name, remaining));
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_frame, parse_frame, Action};
    use crossbeam::channel::Receiver;

    fn frames(rx: &Receiver<Bytes>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(buf) = rx.try_recv() {
            for raw in buf.split(|b| *b == FRAME_SEPARATOR) {
                if raw.is_empty() {
                    continue;
                }
                let msg = parse_frame(raw).unwrap();
                out.push(format!("{}:{}", msg.action.as_str(), msg.data.join(",")));
            }
        }
        out
    }

    fn update_frame(name: &str, version: &str) -> Bytes {
        build_frame(Topic::Record, Action::Update, &[name, version, "{}"])
    }

    #[test]
    fn duplicate_subscribe_is_an_error() {
        let mut reg = SubscriptionRegistry::new(Topic::Record);
        let (socket, rx) = SocketRef::pair();
        assert_eq!(reg.subscribe("a", &socket), Some(1));
        assert_eq!(reg.subscribe("a", &socket), None);
        assert_eq!(frames(&rx), vec!["ERROR:MULTIPLE_SUBSCRIPTIONS,a"]);
    }

    #[test]
    fn unsubscribe_unknown_is_an_error_unless_silent() {
        let mut reg = SubscriptionRegistry::new(Topic::Record);
        let (socket, rx) = SocketRef::pair();
        assert_eq!(reg.unsubscribe("a", &socket, false), None);
        assert_eq!(frames(&rx), vec!["ERROR:NOT_SUBSCRIBED,a"]);
        assert_eq!(reg.unsubscribe("a", &socket, true), None);
        assert!(frames(&rx).is_empty());
    }

    #[test]
    fn flush_delivers_in_append_order() {
        let mut reg = SubscriptionRegistry::new(Topic::Record);
        let (socket, rx) = SocketRef::pair();
        reg.subscribe("a", &socket);
        reg.send_to_subscribers("a", &update_frame("a", "1-x"), None);
        reg.send_to_subscribers("a", &update_frame("a", "2-x"), None);
        reg.flush();
        assert_eq!(frames(&rx), vec!["UPDATE:a,1-x,{}", "UPDATE:a,2-x,{}"]);
    }

    #[test]
    fn sender_does_not_receive_its_own_frames() {
        let mut reg = SubscriptionRegistry::new(Topic::Record);
        let (alice, alice_rx) = SocketRef::pair();
        let (bob, bob_rx) = SocketRef::pair();
        let (carol, carol_rx) = SocketRef::pair();
        reg.subscribe("a", &alice);
        reg.subscribe("a", &bob);
        reg.subscribe("a", &carol);

        reg.send_to_subscribers("a", &update_frame("a", "1-x"), Some(&alice));
        reg.send_to_subscribers("a", &update_frame("a", "2-x"), Some(&bob));
        reg.send_to_subscribers("a", &update_frame("a", "3-x"), Some(&alice));
        reg.flush();

        // Alice sees only bob's frame, bob sees alice's two, carol sees all
        // three in order.
        assert_eq!(frames(&alice_rx), vec!["UPDATE:a,2-x,{}"]);
        assert_eq!(frames(&bob_rx), vec!["UPDATE:a,1-x,{}", "UPDATE:a,3-x,{}"]);
        assert_eq!(
            frames(&carol_rx),
            vec!["UPDATE:a,1-x,{}", "UPDATE:a,2-x,{}", "UPDATE:a,3-x,{}"]
        );
    }

    #[test]
    fn sole_sender_receives_nothing() {
        let mut reg = SubscriptionRegistry::new(Topic::Record);
        let (alice, alice_rx) = SocketRef::pair();
        reg.subscribe("a", &alice);
        reg.send_to_subscribers("a", &update_frame("a", "1-x"), Some(&alice));
        reg.flush();
        assert!(frames(&alice_rx).is_empty());
    }

    #[test]
    fn buffers_reset_between_ticks() {
        let mut reg = SubscriptionRegistry::new(Topic::Record);
        let (socket, rx) = SocketRef::pair();
        reg.subscribe("a", &socket);
        reg.send_to_subscribers("a", &update_frame("a", "1-x"), None);
        reg.flush();
        reg.send_to_subscribers("a", &update_frame("a", "2-x"), None);
        reg.flush();
        assert_eq!(frames(&rx), vec!["UPDATE:a,1-x,{}", "UPDATE:a,2-x,{}"]);
        assert!(!reg.has_pending());
    }

    #[test]
    fn send_without_subscribers_is_dropped() {
        let mut reg = SubscriptionRegistry::new(Topic::Record);
        reg.send_to_subscribers("a", &update_frame("a", "1-x"), None);
        assert!(!reg.has_pending());
    }

    #[test]
    fn connection_lost_drops_every_subscription() {
        let mut reg = SubscriptionRegistry::new(Topic::Record);
        let (alice, _alice_rx) = SocketRef::pair();
        let (bob, _bob_rx) = SocketRef::pair();
        reg.subscribe("a", &alice);
        reg.subscribe("b", &alice);
        reg.subscribe("a", &bob);

        let mut removed = reg.connection_lost(&alice);
        removed.sort();
        assert_eq!(removed, vec![("a".to_string(), 1), ("b".to_string(), 0)]);
        assert_eq!(reg.local_count("a"), 1);
        assert!(!reg.has_name("b"));
        assert!(reg.names_for(&alice).is_empty());
    }
}
