//! Record handling: subscriptions, cached documents, storage write-through.
//!
//! All conflict resolution funnels through [`RecordHandler::apply_update`];
//! local UPDATEs, storage loads, and changefeed refreshes are
//! indistinguishable once they reach the merge, which is what keeps every
//! node convergent.

mod cache;

pub use cache::{CacheEntry, Record, RecordCache};

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use crossbeam::channel::Sender;
use regex::Regex;
use serde_json::Value;

use crate::cluster::ProviderMap;
use crate::config::Options;
use crate::listen::ListenerRegistry;
use crate::protocol::{build_frame, Action, ErrorCode, Message, Topic};
use crate::socket::SocketRef;
use crate::storage::{ChangeNotice, StorageDone, StorageOp, StoredRecord};
use crate::subscription::SubscriptionRegistry;
use crate::version::RecordVersion;

pub struct RecordHandler {
    registry: SubscriptionRegistry,
    cache: RecordCache,
    listeners: ListenerRegistry,
    storage_tx: Sender<StorageOp>,
    storage_exclusion: Option<Regex>,
}

impl RecordHandler {
    pub fn new(
        options: &Options,
        storage_exclusion: Option<Regex>,
        storage_tx: Sender<StorageOp>,
        providers: Arc<dyn ProviderMap>,
    ) -> Self {
        Self {
            registry: SubscriptionRegistry::new(Topic::Record),
            cache: RecordCache::new(options.cache_size),
            listeners: ListenerRegistry::new(options, providers),
            storage_tx,
            storage_exclusion,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_listeners(
        options: &Options,
        storage_exclusion: Option<Regex>,
        storage_tx: Sender<StorageOp>,
        listeners: ListenerRegistry,
    ) -> Self {
        Self {
            registry: SubscriptionRegistry::new(Topic::Record),
            cache: RecordCache::new(options.cache_size),
            listeners,
            storage_tx,
            storage_exclusion,
        }
    }

    pub fn handle(&mut self, socket: &SocketRef, msg: &Message, now: Instant, now_ms: u64) {
        match msg.action {
            Action::Read => self.read(socket, msg, now, now_ms),
            Action::Update => self.update(socket, msg),
            Action::Unsubscribe => self.unsubscribe(socket, msg, now),
            Action::Listen => {
                if let Some(pattern) = single(msg, socket) {
                    self.listeners
                        .handle_listen(socket, &pattern, &self.registry, now);
                }
            }
            Action::Unlisten => {
                if let Some(pattern) = single(msg, socket) {
                    self.listeners
                        .handle_unlisten(socket, &pattern, &self.registry, now);
                }
            }
            Action::ListenAccept => {
                if let Some((pattern, name)) = pair(msg, socket) {
                    self.listeners
                        .handle_accept(socket, &pattern, &name, &mut self.registry, now);
                }
            }
            Action::ListenReject => {
                if let Some((pattern, name)) = pair(msg, socket) {
                    self.listeners.handle_reject(socket, &pattern, &name, now);
                }
            }
            _ => {
                socket.send_error(
                    Topic::Record,
                    ErrorCode::UnknownAction,
                    &[msg.action.as_str()],
                );
            }
        }
    }

    fn read(&mut self, socket: &SocketRef, msg: &Message, now: Instant, now_ms: u64) {
        let Some(name) = msg.data.first().map(String::as_str) else {
            socket.send_error(Topic::Record, ErrorCode::InvalidMessageData, &[]);
            return;
        };
        let Some(count) = self.registry.subscribe(name, socket) else {
            return;
        };
        self.listeners
            .on_subscription_added(name, socket, count, now, now_ms);
        if count == 1 {
            self.cache.pin(name);
        }

        match self.cache.get(name) {
            Some(CacheEntry::Hydrated(record)) => {
                socket.send_frame(&record.frame);
            }
            Some(CacheEntry::Loading) => {
                // A load for this name is already in flight; the broadcast
                // on completion covers this subscriber too.
            }
            None => {
                if self.excluded(name) {
                    let record = fresh_record(name);
                    self.cache
                        .insert_pinned(name, CacheEntry::Hydrated(record.clone()));
                    self.registry.send_to_subscribers(name, &record.frame, None);
                } else {
                    self.cache.insert_pinned(name, CacheEntry::Loading);
                    let _ = self.storage_tx.send(StorageOp::Get {
                        name: name.to_string(),
                    });
                }
            }
        }
    }

    fn update(&mut self, socket: &SocketRef, msg: &Message) {
        let (Some(name), Some(raw_version), Some(raw_body)) =
            (msg.data.first(), msg.data.get(1), msg.data.get(2))
        else {
            let name = msg.data.first().map(String::as_str).unwrap_or("");
            socket.send_error(Topic::Record, ErrorCode::InvalidMessageData, &[name]);
            return;
        };
        let name = name.as_str();
        let version = match RecordVersion::parse(raw_version) {
            Ok(version) => version,
            Err(_) => {
                socket.send_error(
                    Topic::Record,
                    ErrorCode::InvalidVersion,
                    &[name, raw_version.as_str()],
                );
                return;
            }
        };
        let body: Value = match serde_json::from_str(raw_body) {
            Ok(body) => body,
            Err(_) => {
                socket.send_error(Topic::Record, ErrorCode::InvalidMessageData, &[name]);
                return;
            }
        };

        if version.storable() && !self.excluded(name) {
            let record = StoredRecord {
                name: name.to_string(),
                version: version.clone(),
                body: body.clone(),
            };
            let _ = self.storage_tx.send(StorageOp::Set {
                record,
                sender: socket.clone(),
            });
        }
        self.apply_update(name, version, body, msg.raw.clone(), Some(socket));
    }

    fn unsubscribe(&mut self, socket: &SocketRef, msg: &Message, now: Instant) {
        let Some(name) = msg.data.first().map(String::as_str) else {
            socket.send_error(Topic::Record, ErrorCode::InvalidMessageData, &[]);
            return;
        };
        if let Some(remaining) = self.registry.unsubscribe(name, socket, false) {
            if remaining == 0 {
                self.cache.unpin(name);
            }
            self.listeners.on_subscription_removed(name, remaining, now);
        }
    }

    /// The merge. An incoming record replaces the stored one only if the
    /// stored version does not dominate it; winners are broadcast to every
    /// subscriber except the originating sender.
    pub fn apply_update(
        &mut self,
        name: &str,
        version: RecordVersion,
        body: Value,
        frame: Bytes,
        sender: Option<&SocketRef>,
    ) -> bool {
        if let Some(CacheEntry::Hydrated(prev)) = self.cache.peek(name) {
            if prev.version.dominates(&version) {
                tracing::debug!(
                    name = %name,
                    stored = %prev.version,
                    incoming = %version,
                    "dropping stale record update"
                );
                return false;
            }
        }
        self.cache.insert(
            name,
            CacheEntry::Hydrated(Record {
                version,
                body,
                frame: frame.clone(),
            }),
        );
        self.registry.send_to_subscribers(name, &frame, sender);
        true
    }

    /// Completion of a storage op issued by READ, UPDATE, or the changefeed.
    pub fn on_storage_done(&mut self, done: StorageDone) {
        match done {
            StorageDone::Get {
                name,
                result: Ok(found),
            } => {
                let record = match found {
                    Some(stored) => hydrate(&stored),
                    // Nothing stored: the name springs into existence empty.
                    None => fresh_record(&name),
                };
                match self.cache.peek(&name) {
                    Some(CacheEntry::Hydrated(_)) => {
                        // An update overtook the load; let the merge decide.
                        self.apply_update(&name, record.version, record.body, record.frame, None);
                    }
                    _ => {
                        if self.registry.has_name(&name) {
                            self.cache
                                .insert_pinned(&name, CacheEntry::Hydrated(record.clone()));
                        } else {
                            self.cache.insert(&name, CacheEntry::Hydrated(record.clone()));
                        }
                        self.registry.send_to_subscribers(&name, &record.frame, None);
                    }
                }
            }
            StorageDone::Get {
                name,
                result: Err(err),
            } => {
                tracing::error!(
                    name = %name,
                    error = %err,
                    code = "RECORD_LOAD_ERROR",
                    "record load failed"
                );
                // Drop the placeholder so a later READ retries the load.
                if matches!(self.cache.peek(&name), Some(CacheEntry::Loading)) {
                    self.cache.remove(&name);
                }
            }
            StorageDone::Set {
                name,
                sender,
                result: Err(err),
            } => {
                tracing::error!(
                    name = %name,
                    error = %err,
                    code = "RECORD_UPDATE_ERROR",
                    "record write failed"
                );
                sender.send_error(
                    Topic::Record,
                    ErrorCode::RecordUpdateError,
                    &[name.as_str(), err.reason.as_str()],
                );
            }
            StorageDone::Set { result: Ok(()), .. } => {}
        }
    }

    /// A remote write surfaced through the storage changefeed.
    pub fn on_storage_change(&mut self, notice: ChangeNotice) {
        match self.cache.peek(&notice.name) {
            Some(CacheEntry::Hydrated(record)) if record.version.dominates(&notice.version) => {
                return;
            }
            Some(CacheEntry::Loading) => return,
            _ => {}
        }
        if !self.registry.has_name(&notice.name) {
            // Nobody local cares; forget it instead of refreshing.
            self.cache.remove(&notice.name);
            return;
        }
        let _ = self.storage_tx.send(StorageOp::Get { name: notice.name });
    }

    pub fn on_provider_watch_event(&mut self, name: String, now: Instant) {
        self.listeners.on_watch_event(name, now);
    }

    pub fn connection_lost(&mut self, socket: &SocketRef, now: Instant) {
        let removed = self.registry.connection_lost(socket);
        for (name, remaining) in removed {
            if remaining == 0 {
                self.cache.unpin(&name);
            }
            self.listeners.on_subscription_removed(&name, remaining, now);
        }
        self.listeners.connection_lost(socket, &self.registry, now);
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.listeners.next_deadline()
    }

    pub fn fire_due(&mut self, now: Instant, now_ms: u64) {
        self.listeners.fire_due(now, now_ms, &mut self.registry);
    }

    pub fn has_pending_broadcasts(&self) -> bool {
        self.registry.has_pending()
    }

    pub fn flush_broadcasts(&mut self) {
        self.registry.flush();
    }

    fn excluded(&self, name: &str) -> bool {
        self.storage_exclusion
            .as_ref()
            .is_some_and(|re| re.is_match(name))
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &RecordCache {
        &self.cache
    }
}

fn single(msg: &Message, socket: &SocketRef) -> Option<String> {
    match msg.data.first() {
        Some(value) => Some(value.clone()),
        None => {
            socket.send_error(Topic::Record, ErrorCode::InvalidMessageData, &[]);
            None
        }
    }
}

fn pair(msg: &Message, socket: &SocketRef) -> Option<(String, String)> {
    match (msg.data.first(), msg.data.get(1)) {
        (Some(a), Some(b)) => Some((a.clone(), b.clone())),
        _ => {
            socket.send_error(Topic::Record, ErrorCode::InvalidMessageData, &[]);
            None
        }
    }
}

/// Rebuild the wire frame for a record coming out of storage.
fn hydrate(stored: &StoredRecord) -> Record {
    let version = stored.version.to_string();
    let body_json = stored.body.to_string();
    let frame = build_frame(
        Topic::Record,
        Action::Update,
        &[stored.name.as_str(), version.as_str(), body_json.as_str()],
    );
    Record {
        version: stored.version.clone(),
        body: stored.body.clone(),
        frame,
    }
}

/// A brand-new record: version zero, empty object body.
fn fresh_record(name: &str) -> Record {
    let version = RecordVersion::default();
    let rendered = version.to_string();
    let frame = build_frame(
        Topic::Record,
        Action::Update,
        &[name, rendered.as_str(), "{}"],
    );
    Record {
        version,
        body: serde_json::json!({}),
        frame,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryProviderMap;
    use crate::error::StorageError;
    use crate::protocol::{parse_frame, FRAME_SEPARATOR};
    use crate::storage::{MemoryStorage, StoragePlugin};
    use crate::version::VersionNum;
    use crossbeam::channel::Receiver;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Rig {
        handler: RecordHandler,
        storage: MemoryStorage,
        op_rx: Receiver<StorageOp>,
        now: Instant,
        now_ms: u64,
    }

    impl Rig {
        fn new() -> Self {
            Self::with_exclusion(None)
        }

        fn with_exclusion(pattern: Option<&str>) -> Self {
            let options = Options {
                server_name: "node-a".to_string(),
                cache_size: 8,
                ..Options::default()
            };
            let (op_tx, op_rx) = crossbeam::channel::unbounded();
            let exclusion = pattern.map(|p| Regex::new(p).unwrap());
            let listeners = ListenerRegistry::with_rng(
                &options,
                Arc::new(MemoryProviderMap::new()),
                StdRng::seed_from_u64(3),
            );
            Self {
                handler: RecordHandler::with_listeners(&options, exclusion, op_tx, listeners),
                storage: MemoryStorage::new(),
                op_rx,
                now: Instant::now(),
                now_ms: 1_000_000,
            }
        }

        fn handle(&mut self, socket: &SocketRef, action: Action, data: &[&str]) {
            let msg = parse_frame(&build_frame(Topic::Record, action, data)).unwrap();
            self.handler.handle(socket, &msg, self.now, self.now_ms);
        }

        /// Run queued storage ops against the in-memory plugin and feed the
        /// completions back, like the worker thread does.
        fn pump_storage(&mut self) {
            while let Ok(op) = self.op_rx.try_recv() {
                match op {
                    StorageOp::Get { name } => {
                        let result = self.storage.get(&name);
                        self.handler.on_storage_done(StorageDone::Get { name, result });
                    }
                    StorageOp::Set { record, sender } => {
                        let result = self.storage.set(&record);
                        self.handler.on_storage_done(StorageDone::Set {
                            name: record.name,
                            sender,
                            result,
                        });
                    }
                    StorageOp::Shutdown => {}
                }
            }
            self.handler.flush_broadcasts();
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
                out.push(format!("{}:{}", msg.action.as_str(), msg.data.join(",")));
            }
        }
        out
    }

    #[test]
    fn read_miss_loads_from_storage_and_broadcasts() {
        let mut rig = Rig::new();
        rig.storage
            .set(&StoredRecord {
                name: "user/1".to_string(),
                version: RecordVersion::parse("3-abc").unwrap(),
                body: serde_json::json!({"x": 1}),
            })
            .unwrap();

        let (socket, rx) = SocketRef::pair();
        rig.handle(&socket, Action::Read, &["user/1"]);
        assert!(frames(&rx).is_empty());
        rig.pump_storage();
        assert_eq!(frames(&rx), vec!["UPDATE:user/1,3-abc,{\"x\":1}"]);
    }

    #[test]
    fn read_hit_replays_cached_frame_directly() {
        let mut rig = Rig::new();
        let (writer, _writer_rx) = SocketRef::pair();
        rig.handle(&writer, Action::Update, &["user/1", "2-t", "{\"x\":5}"]);
        rig.pump_storage();

        let (reader, rx) = SocketRef::pair();
        rig.handle(&reader, Action::Read, &["user/1"]);
        assert_eq!(frames(&rx), vec!["UPDATE:user/1,2-t,{\"x\":5}"]);
        // No further storage traffic for the hit.
        assert!(rig.op_rx.try_recv().is_err());
    }

    #[test]
    fn concurrent_reads_share_one_load() {
        let mut rig = Rig::new();
        let (a, a_rx) = SocketRef::pair();
        let (b, b_rx) = SocketRef::pair();
        rig.handle(&a, Action::Read, &["user/1"]);
        rig.handle(&b, Action::Read, &["user/1"]);

        let mut gets = 0;
        while let Ok(op) = rig.op_rx.try_recv() {
            if matches!(op, StorageOp::Get { .. }) {
                gets += 1;
                if let StorageOp::Get { name } = op {
                    let result = rig.storage.get(&name);
                    rig.handler.on_storage_done(StorageDone::Get { name, result });
                }
            }
        }
        rig.handler.flush_broadcasts();
        assert_eq!(gets, 1);
        // Both subscribers see the (fresh, empty) record.
        assert_eq!(frames(&a_rx), vec!["UPDATE:user/1,0-00000000000000,{}"]);
        assert_eq!(frames(&b_rx), vec!["UPDATE:user/1,0-00000000000000,{}"]);
    }

    #[test]
    fn update_ordering_follows_version_dominance() {
        let mut rig = Rig::new();
        let (writer, _writer_rx) = SocketRef::pair();
        let (reader, rx) = SocketRef::pair();
        rig.handle(&reader, Action::Read, &["foo"]);
        rig.pump_storage();
        let _ = frames(&rx);

        rig.handle(&writer, Action::Update, &["foo", "5-aaa", "{\"x\":1}"]);
        rig.pump_storage();
        assert_eq!(frames(&rx), vec!["UPDATE:foo,5-aaa,{\"x\":1}"]);

        // Stale numeric part: dropped.
        rig.handle(&writer, Action::Update, &["foo", "4-zzz", "{\"x\":9}"]);
        rig.pump_storage();
        assert!(frames(&rx).is_empty());

        // Same number, later tag: accepted.
        rig.handle(&writer, Action::Update, &["foo", "5-zzz", "{\"x\":2}"]);
        rig.pump_storage();
        assert_eq!(frames(&rx), vec!["UPDATE:foo,5-zzz,{\"x\":2}"]);

        // INF wins over everything and then refuses everything.
        rig.handle(&writer, Action::Update, &["foo", "INF-x", "{}"]);
        rig.pump_storage();
        assert_eq!(frames(&rx), vec!["UPDATE:foo,INF-x,{}"]);
        rig.handle(&writer, Action::Update, &["foo", "999-x", "{}"]);
        rig.pump_storage();
        assert!(frames(&rx).is_empty());
    }

    #[test]
    fn update_writes_through_to_storage() {
        let mut rig = Rig::new();
        let (writer, _rx) = SocketRef::pair();
        rig.handle(&writer, Action::Update, &["user/1", "1-t", "{\"x\":1}"]);
        rig.pump_storage();
        let stored = rig.storage.get("user/1").unwrap().unwrap();
        assert_eq!(stored.version, RecordVersion::parse("1-t").unwrap());
    }

    #[test]
    fn excluded_names_skip_storage_entirely() {
        let mut rig = Rig::with_exclusion(Some("^volatile/"));
        let (writer, _rx) = SocketRef::pair();
        rig.handle(&writer, Action::Update, &["volatile/x", "1-t", "{}"]);
        rig.pump_storage();
        assert_eq!(rig.storage.get("volatile/x").unwrap(), None);

        // READ of an absent excluded record springs up empty without a load.
        let (reader, reader_rx) = SocketRef::pair();
        rig.handle(&reader, Action::Read, &["volatile/y"]);
        assert!(rig.op_rx.try_recv().is_err());
        rig.handler.flush_broadcasts();
        assert_eq!(
            frames(&reader_rx),
            vec!["UPDATE:volatile/y,0-00000000000000,{}"]
        );
    }

    #[test]
    fn zero_and_inf_versions_stay_out_of_storage() {
        let mut rig = Rig::new();
        let (writer, _rx) = SocketRef::pair();
        rig.handle(&writer, Action::Update, &["a", "0-t", "{}"]);
        rig.handle(&writer, Action::Update, &["b", "INF-t", "{}"]);
        rig.pump_storage();
        assert_eq!(rig.storage.get("a").unwrap(), None);
        assert_eq!(rig.storage.get("b").unwrap(), None);
    }

    #[test]
    fn malformed_updates_are_rejected() {
        let mut rig = Rig::new();
        let (writer, rx) = SocketRef::pair();
        rig.handle(&writer, Action::Update, &["a", "not-a-version", "{}"]);
        assert_eq!(
            frames(&rx),
            vec!["ERROR:INVALID_VERSION,a,not-a-version"]
        );
        rig.handle(&writer, Action::Update, &["a", "1-t", "{broken"]);
        assert_eq!(frames(&rx), vec!["ERROR:INVALID_MESSAGE_DATA,a"]);
        rig.handle(&writer, Action::Update, &["a"]);
        assert_eq!(frames(&rx), vec!["ERROR:INVALID_MESSAGE_DATA,a"]);
    }

    #[test]
    fn unknown_action_is_reported() {
        let mut rig = Rig::new();
        let (socket, rx) = SocketRef::pair();
        rig.handle(&socket, Action::Provide, &["a"]);
        assert_eq!(frames(&rx), vec!["ERROR:UNKNOWN_ACTION,PROVIDE"]);
    }

    #[test]
    fn failed_write_reports_record_update_error_to_sender() {
        let mut rig = Rig::new();
        let (writer, rx) = SocketRef::pair();
        rig.handler.on_storage_done(StorageDone::Set {
            name: "a".to_string(),
            sender: writer.clone(),
            result: Err(StorageError::set("a", "disk on fire")),
        });
        assert_eq!(
            frames(&rx),
            vec!["ERROR:RECORD_UPDATE_ERROR,a,disk on fire"]
        );
    }

    #[test]
    fn failed_load_clears_placeholder_for_retry() {
        let mut rig = Rig::new();
        let (reader, _rx) = SocketRef::pair();
        rig.handle(&reader, Action::Read, &["a"]);
        let _ = rig.op_rx.try_recv();
        rig.handler.on_storage_done(StorageDone::Get {
            name: "a".to_string(),
            result: Err(StorageError::get("a", "timeout")),
        });
        assert!(!rig.handler.cache().contains("a"));
    }

    #[test]
    fn sender_does_not_receive_its_own_update() {
        let mut rig = Rig::new();
        let (alice, alice_rx) = SocketRef::pair();
        let (bob, bob_rx) = SocketRef::pair();
        rig.handle(&alice, Action::Read, &["a"]);
        rig.handle(&bob, Action::Read, &["a"]);
        rig.pump_storage();
        let _ = (frames(&alice_rx), frames(&bob_rx));

        rig.handle(&alice, Action::Update, &["a", "1-t", "{\"x\":1}"]);
        rig.pump_storage();
        assert!(frames(&alice_rx).is_empty());
        assert_eq!(frames(&bob_rx), vec!["UPDATE:a,1-t,{\"x\":1}"]);
    }

    #[test]
    fn changefeed_refreshes_subscribed_records() {
        let mut rig = Rig::new();
        let (reader, rx) = SocketRef::pair();
        rig.handle(&reader, Action::Read, &["a"]);
        rig.pump_storage();
        let _ = frames(&rx);

        // A remote process wrote a newer version.
        rig.storage.emit_change(StoredRecord {
            name: "a".to_string(),
            version: RecordVersion::parse("7-zz").unwrap(),
            body: serde_json::json!({"x": 7}),
        });
        rig.handler.on_storage_change(ChangeNotice {
            name: "a".to_string(),
            version: RecordVersion::parse("7-zz").unwrap(),
        });
        rig.pump_storage();
        assert_eq!(frames(&rx), vec!["UPDATE:a,7-zz,{\"x\":7}"]);
    }

    #[test]
    fn changefeed_drops_stale_notices() {
        let mut rig = Rig::new();
        let (writer, _rx) = SocketRef::pair();
        rig.handle(&writer, Action::Update, &["a", "5-t", "{}"]);
        rig.pump_storage();

        rig.handler.on_storage_change(ChangeNotice {
            name: "a".to_string(),
            version: RecordVersion::parse("4-t").unwrap(),
        });
        assert!(rig.op_rx.try_recv().is_err());
    }

    #[test]
    fn changefeed_evicts_unwatched_records() {
        let mut rig = Rig::new();
        let (writer, _rx) = SocketRef::pair();
        rig.handle(&writer, Action::Update, &["a", "5-t", "{}"]);
        rig.pump_storage();
        assert!(rig.handler.cache().contains("a"));

        rig.handler.on_storage_change(ChangeNotice {
            name: "a".to_string(),
            version: RecordVersion::parse("9-t").unwrap(),
        });
        assert!(!rig.handler.cache().contains("a"));
        assert!(rig.op_rx.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_unpins_and_allows_eviction() {
        let mut rig = Rig::new();
        let (reader, _rx) = SocketRef::pair();
        rig.handle(&reader, Action::Read, &["a"]);
        rig.pump_storage();
        rig.handle(&reader, Action::Unsubscribe, &["a"]);

        // Fill the cache well past capacity; "a" is now evictable.
        let (writer, _writer_rx) = SocketRef::pair();
        for i in 0..16 {
            let name = format!("filler/{i}");
            rig.handle(&writer, Action::Update, &[&name, "1-t", "{}"]);
        }
        assert!(!rig.handler.cache().contains("a"));
    }

    #[test]
    fn connection_lost_unsubscribes_silently() {
        let mut rig = Rig::new();
        let (reader, rx) = SocketRef::pair();
        rig.handle(&reader, Action::Read, &["a"]);
        rig.pump_storage();
        let _ = frames(&rx);

        reader.mark_closed();
        rig.handler.connection_lost(&reader, rig.now);
        assert!(frames(&rx).is_empty());

        let (writer, _writer_rx) = SocketRef::pair();
        rig.handle(&writer, Action::Update, &["a", "1-t", "{}"]);
        rig.handler.flush_broadcasts();
        assert!(frames(&rx).is_empty());
    }

    #[test]
    fn loaded_record_yields_round_trippable_version() {
        let mut rig = Rig::new();
        let (writer, _rx) = SocketRef::pair();
        rig.handle(&writer, Action::Update, &["a", "12-tag", "{\"deep\":[1,2]}"]);
        rig.pump_storage();

        let (reader, reader_rx) = SocketRef::pair();
        rig.handle(&reader, Action::Read, &["a"]);
        let got = frames(&reader_rx);
        assert_eq!(got.len(), 1);
        let parts: Vec<&str> = got[0].splitn(2, ':').collect();
        assert_eq!(parts[0], "UPDATE");
        let data: Vec<&str> = parts[1].split(',').collect();
        assert_eq!(data[0], "a");
        let version = RecordVersion::parse(data[1]).unwrap();
        assert_eq!(version.num, VersionNum::Finite(12));
        assert_eq!(version.tag, "tag");
    }
}
