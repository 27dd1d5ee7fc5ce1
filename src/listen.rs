//! Listener registry: cluster-wide provider assignment for record patterns.
//!
//! Clients LISTEN with a regex; whenever a record name matching one of those
//! patterns has subscribers, the fleet agrees (through the provider map's
//! CAS upserts) on exactly one listener to provide it. Offers carry a
//! deadline; listeners that reject or let an offer lapse go into the entry's
//! history so the next pass rotates to a fresh candidate.
//!
//! Reconciliation is queue-driven: every change source (subscriptions,
//! listener churn, cluster watch events, offer expiries) enqueues a name,
//! and a short dispatch timer flushes the queue so one pass at a time
//! decides add-or-remove per name.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use regex::Regex;
use uuid::Uuid;

use crate::cluster::{Provider, ProviderEntry, ProviderMap, UpsertAction, UpsertOutcome};
use crate::config::Options;
use crate::error::ClusterError;
use crate::protocol::{build_frame, Action, ErrorCode, Topic};
use crate::scheduler::Scheduler;
use crate::socket::SocketRef;
use crate::subscription::SubscriptionRegistry;

/// Delay between a change being queued and the reconcile pass that acts on
/// it, so bursts collapse into one pass.
pub const RECONCILE_DISPATCH_MS: u64 = 10;
/// Backoff before re-reconciling every subscribed name after a cluster
/// state error.
pub const RECONCILE_RECOVERY_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum ListenTimer {
    /// An outstanding offer for a name; fires if the listener never answers.
    Offer(String),
    Dispatch,
    Recover,
}

struct Listener {
    socket: SocketRef,
    patterns: Vec<(String, Regex)>,
}

pub struct ListenerRegistry {
    server_name: String,
    providers: Arc<dyn ProviderMap>,
    listeners: HashMap<Uuid, Listener>,
    pending: HashSet<String>,
    timers: Scheduler<ListenTimer>,
    listen_response_timeout: Duration,
    listen_response_timeout_ms: u64,
    rng: StdRng,
}

impl ListenerRegistry {
    pub fn new(options: &Options, providers: Arc<dyn ProviderMap>) -> Self {
        Self::with_rng(options, providers, StdRng::from_entropy())
    }

    pub fn with_rng(options: &Options, providers: Arc<dyn ProviderMap>, rng: StdRng) -> Self {
        Self {
            server_name: options.server_name.clone(),
            providers,
            listeners: HashMap::new(),
            pending: HashSet::new(),
            timers: Scheduler::new(),
            listen_response_timeout: options.listen_response_timeout(),
            listen_response_timeout_ms: options.listen_response_timeout_ms,
            rng,
        }
    }

    // ---- client actions -------------------------------------------------

    pub fn handle_listen(
        &mut self,
        socket: &SocketRef,
        pattern: &str,
        registry: &SubscriptionRegistry,
        now: Instant,
    ) {
        let compiled = match Regex::new(pattern) {
            Ok(re) => re,
            Err(_) => {
                socket.send_error(Topic::Record, ErrorCode::InvalidMessageData, &[pattern]);
                return;
            }
        };
        let listener = self
            .listeners
            .entry(socket.uuid())
            .or_insert_with(|| Listener {
                socket: socket.clone(),
                patterns: Vec::new(),
            });
        if listener.patterns.iter().any(|(raw, _)| raw == pattern) {
            socket.send_error(Topic::Record, ErrorCode::MultipleSubscriptions, &[pattern]);
            return;
        }
        let re = compiled.clone();
        listener.patterns.push((pattern.to_string(), compiled));

        let matching: Vec<String> = registry
            .names()
            .filter(|name| re.is_match(name))
            .map(str::to_string)
            .collect();
        for name in matching {
            self.enqueue(name, now);
        }
    }

    pub fn handle_unlisten(
        &mut self,
        socket: &SocketRef,
        pattern: &str,
        registry: &SubscriptionRegistry,
        now: Instant,
    ) {
        let removed = match self.listeners.get_mut(&socket.uuid()) {
            Some(listener) => {
                match listener.patterns.iter().position(|(raw, _)| raw == pattern) {
                    Some(pos) => {
                        let (_, re) = listener.patterns.remove(pos);
                        if listener.patterns.is_empty() {
                            self.listeners.remove(&socket.uuid());
                        }
                        Some(re)
                    }
                    None => None,
                }
            }
            None => None,
        };
        let Some(re) = removed else {
            socket.send_error(Topic::Record, ErrorCode::NotSubscribed, &[pattern]);
            return;
        };
        let matching: Vec<String> = registry
            .names()
            .filter(|name| re.is_match(name))
            .map(str::to_string)
            .collect();
        for name in matching {
            self.enqueue(name, now);
        }
    }

    /// LISTEN_ACCEPT: the offered listener takes the name. If the offer was
    /// already rescinded the listener is told the subscription is gone.
    pub fn handle_accept(
        &mut self,
        socket: &SocketRef,
        pattern: &str,
        name: &str,
        registry: &mut SubscriptionRegistry,
        now: Instant,
    ) {
        let uuid = socket.uuid().to_string();
        let server_name = self.server_name.clone();
        let mut decide = |prev: Option<&ProviderEntry>| -> UpsertAction {
            match prev {
                Some(entry)
                    if entry
                        .provider
                        .as_ref()
                        .is_some_and(|p| p.deadline.is_some()) =>
                {
                    UpsertAction::Put(ProviderEntry {
                        provider: Some(Provider {
                            uuid: uuid.clone(),
                            pattern: pattern.to_string(),
                            server_name: server_name.clone(),
                            deadline: None,
                        }),
                        history: entry.history.clone(),
                    })
                }
                _ => UpsertAction::Keep,
            }
        };
        match self.providers.upsert(name, &mut decide) {
            Err(err) => self.cluster_error(err, now),
            Ok(UpsertOutcome::Unchanged) => {
                socket.send_frame(&pattern_removed_frame(pattern, name));
            }
            Ok(UpsertOutcome::Updated { .. }) => {
                self.timers.cancel(&ListenTimer::Offer(name.to_string()));
                registry.send_to_subscribers(name, &has_provider_frame(name, true), None);
            }
        }
    }

    /// LISTEN_REJECT: clear the offer but keep it in history so the next
    /// pass rotates to a different candidate.
    pub fn handle_reject(&mut self, socket: &SocketRef, pattern: &str, name: &str, now: Instant) {
        let uuid = socket.uuid().to_string();
        let mut decide = |prev: Option<&ProviderEntry>| -> UpsertAction {
            match prev {
                Some(entry)
                    if entry
                        .provider
                        .as_ref()
                        .is_some_and(|p| p.uuid == uuid && p.pattern == pattern) =>
                {
                    UpsertAction::Put(ProviderEntry {
                        provider: None,
                        history: entry.history.clone(),
                    })
                }
                _ => UpsertAction::Keep,
            }
        };
        match self.providers.upsert(name, &mut decide) {
            Err(err) => self.cluster_error(err, now),
            Ok(_) => {
                self.timers.cancel(&ListenTimer::Offer(name.to_string()));
                self.enqueue(name.to_string(), now);
            }
        }
    }

    // ---- subscription hooks ---------------------------------------------

    /// A subscriber arrived. The first one triggers reconciliation; any
    /// subscriber joining an already-provided name is told so directly.
    pub fn on_subscription_added(
        &mut self,
        name: &str,
        socket: &SocketRef,
        count: usize,
        now: Instant,
        now_ms: u64,
    ) {
        match self.providers.get(name) {
            Ok(entry) => {
                let provider = entry.as_ref().and_then(|e| e.provider.as_ref());
                if self.provider_alive(provider, now_ms) {
                    socket.send_frame(&has_provider_frame(name, true));
                }
            }
            Err(err) => self.cluster_error(err, now),
        }
        if count == 1 {
            self.enqueue(name.to_string(), now);
        }
    }

    pub fn on_subscription_removed(&mut self, name: &str, remaining: usize, now: Instant) {
        if remaining == 0 {
            self.enqueue(name.to_string(), now);
        }
    }

    /// A provider-map change observed from any node.
    pub fn on_watch_event(&mut self, name: String, now: Instant) {
        self.enqueue(name, now);
    }

    pub fn connection_lost(
        &mut self,
        socket: &SocketRef,
        registry: &SubscriptionRegistry,
        now: Instant,
    ) {
        let Some(listener) = self.listeners.remove(&socket.uuid()) else {
            return;
        };
        let matching: Vec<String> = registry
            .names()
            .filter(|name| listener.patterns.iter().any(|(_, re)| re.is_match(name)))
            .map(str::to_string)
            .collect();
        for name in matching {
            self.enqueue(name, now);
        }
    }

    // ---- reconciliation -------------------------------------------------

    fn enqueue(&mut self, name: String, now: Instant) {
        self.pending.insert(name);
        if !self.timers.is_pending(&ListenTimer::Dispatch) {
            self.timers.schedule_at(
                ListenTimer::Dispatch,
                now + Duration::from_millis(RECONCILE_DISPATCH_MS),
            );
        }
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn fire_due(&mut self, now: Instant, now_ms: u64, registry: &mut SubscriptionRegistry) {
        for timer in self.timers.drain_due(now) {
            match timer {
                ListenTimer::Dispatch => self.flush(now, now_ms, registry),
                ListenTimer::Offer(name) => {
                    // The offer lapsed; its deadline makes the provider dead
                    // and the offer is already in history, so the next pass
                    // rotates onward.
                    self.enqueue(name, now);
                }
                ListenTimer::Recover => {
                    let names: Vec<String> = registry.names().map(str::to_string).collect();
                    for name in names {
                        self.enqueue(name, now);
                    }
                }
            }
        }
    }

    /// One reconcile pass: every queued name either gets a provider
    /// (subscribers present) or loses its entry (none left).
    fn flush(&mut self, now: Instant, now_ms: u64, registry: &mut SubscriptionRegistry) {
        for name in std::mem::take(&mut self.pending) {
            if registry.has_name(&name) {
                self.try_add(&name, now, now_ms, registry);
            } else {
                self.try_remove(&name, now);
            }
        }
    }

    fn try_add(
        &mut self,
        name: &str,
        now: Instant,
        now_ms: u64,
        registry: &mut SubscriptionRegistry,
    ) {
        let remotes = match self.providers.remote_servers() {
            Ok(remotes) => remotes,
            Err(err) => {
                self.cluster_error(err, now);
                return;
            }
        };
        let matching: Vec<(String, String)> = self
            .listeners
            .iter()
            .flat_map(|(uuid, listener)| {
                listener
                    .patterns
                    .iter()
                    .filter(|(_, re)| re.is_match(name))
                    .map(move |(raw, _)| (uuid.to_string(), raw.clone()))
            })
            .collect();

        let listeners = &self.listeners;
        let server_name = self.server_name.as_str();
        let deadline = now_ms + self.listen_response_timeout_ms;
        let rng = &mut self.rng;
        let mut decide = |prev: Option<&ProviderEntry>| -> UpsertAction {
            let entry = prev.cloned().unwrap_or_default();
            if alive(
                entry.provider.as_ref(),
                now_ms,
                listeners,
                &remotes,
                server_name,
            ) {
                return UpsertAction::Keep;
            }
            let mut history = entry.history;
            history.dedup();
            // Forget offers to local listeners that no longer hold the
            // pattern; their slots can be reused.
            history.retain(|(uuid, pattern)| {
                match Uuid::parse_str(uuid).ok().and_then(|u| listeners.get(&u)) {
                    Some(listener) => listener.patterns.iter().any(|(raw, _)| raw == pattern),
                    None => true,
                }
            });

            let mut untried: Vec<&(String, String)> = matching
                .iter()
                .filter(|candidate| !history.contains(candidate))
                .collect();
            if untried.is_empty() && !matching.is_empty() {
                // Every candidate already had its turn: start the rotation
                // over rather than leaving the name unprovided forever.
                history.clear();
                untried = matching.iter().collect();
            }
            match untried.choose(rng) {
                None => {
                    let next = ProviderEntry::with_history(history);
                    if prev == Some(&next) {
                        UpsertAction::Keep
                    } else {
                        UpsertAction::Put(next)
                    }
                }
                Some((uuid, pattern)) => {
                    history.push((uuid.clone(), pattern.clone()));
                    UpsertAction::Put(ProviderEntry {
                        provider: Some(Provider {
                            uuid: uuid.clone(),
                            pattern: pattern.clone(),
                            server_name: server_name.to_string(),
                            deadline: Some(deadline),
                        }),
                        history,
                    })
                }
            }
        };
        let outcome = match self.providers.upsert(name, &mut decide) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.cluster_error(err, now);
                return;
            }
        };

        if let UpsertOutcome::Updated { prev, next } = outcome {
            if prev.as_ref().is_some_and(|e| e.provider.is_some()) {
                registry.send_to_subscribers(name, &has_provider_frame(name, false), None);
            }
            let offered = next.and_then(|e| e.provider);
            if let Some(provider) = offered {
                if let Some(listener) = self.local_listener(&provider.uuid) {
                    listener
                        .socket
                        .send_frame(&pattern_found_frame(&provider.pattern, name));
                }
                self.timers.schedule_at(
                    ListenTimer::Offer(name.to_string()),
                    now + self.listen_response_timeout,
                );
            }
        }
    }

    fn try_remove(&mut self, name: &str, now: Instant) {
        let remotes = match self.providers.remote_servers() {
            Ok(remotes) => remotes,
            Err(err) => {
                self.cluster_error(err, now);
                return;
            }
        };
        let server_name = self.server_name.clone();
        let mut decide = |prev: Option<&ProviderEntry>| -> UpsertAction {
            match prev {
                None => UpsertAction::Keep,
                Some(entry) => match &entry.provider {
                    None => UpsertAction::Clear,
                    Some(provider) => {
                        let local = provider.server_name == server_name;
                        if local || !remotes.contains(&provider.server_name) {
                            UpsertAction::Clear
                        } else {
                            UpsertAction::Keep
                        }
                    }
                },
            }
        };
        match self.providers.upsert(name, &mut decide) {
            Err(err) => self.cluster_error(err, now),
            Ok(UpsertOutcome::Unchanged) => {}
            Ok(UpsertOutcome::Updated { prev, .. }) => {
                self.timers.cancel(&ListenTimer::Offer(name.to_string()));
                let local_provider = prev
                    .and_then(|e| e.provider)
                    .filter(|p| p.server_name == self.server_name);
                if let Some(provider) = local_provider {
                    if let Some(listener) = self.local_listener(&provider.uuid) {
                        listener
                            .socket
                            .send_frame(&pattern_removed_frame(&provider.pattern, name));
                    }
                }
            }
        }
    }

    // ---- helpers --------------------------------------------------------

    fn local_listener(&self, uuid: &str) -> Option<&Listener> {
        Uuid::parse_str(uuid)
            .ok()
            .and_then(|uuid| self.listeners.get(&uuid))
    }

    fn provider_alive(&self, provider: Option<&Provider>, now_ms: u64) -> bool {
        let remotes = self.providers.remote_servers().unwrap_or_default();
        alive(
            provider,
            now_ms,
            &self.listeners,
            &remotes,
            &self.server_name,
        )
    }

    fn cluster_error(&mut self, err: ClusterError, now: Instant) {
        tracing::warn!(error = %err, "cluster state unavailable, scheduling recovery pass");
        self.timers.schedule_at(
            ListenTimer::Recover,
            now + Duration::from_millis(RECONCILE_RECOVERY_MS),
        );
    }
}

/// A provider counts as alive while its offer deadline (if any) has not
/// passed and its listener is still reachable: locally, the socket must
/// still hold the pattern; remotely, the server must still be connected.
fn alive(
    provider: Option<&Provider>,
    now_ms: u64,
    listeners: &HashMap<Uuid, Listener>,
    remotes: &[String],
    server_name: &str,
) -> bool {
    let Some(provider) = provider else {
        return false;
    };
    if provider.deadline.is_some_and(|deadline| deadline <= now_ms) {
        return false;
    }
    if provider.server_name == server_name {
        Uuid::parse_str(&provider.uuid)
            .ok()
            .and_then(|uuid| listeners.get(&uuid))
            .is_some_and(|listener| {
                listener
                    .patterns
                    .iter()
                    .any(|(raw, _)| *raw == provider.pattern)
            })
    } else {
        remotes.iter().any(|remote| *remote == provider.server_name)
    }
}

fn pattern_found_frame(pattern: &str, name: &str) -> Bytes {
    build_frame(
        Topic::Record,
        Action::SubscriptionForPatternFound,
        &[pattern, name],
    )
}

fn pattern_removed_frame(pattern: &str, name: &str) -> Bytes {
    build_frame(
        Topic::Record,
        Action::SubscriptionForPatternRemoved,
        &[pattern, name],
    )
}

fn has_provider_frame(name: &str, has: bool) -> Bytes {
    build_frame(
        Topic::Record,
        Action::SubscriptionHasProvider,
        &[name, if has { "T" } else { "F" }],
    )
}
