//! RPC routing: request → accept → response with two timeout stages.
//!
//! Providers register under a name; each request is forwarded to one
//! provider picked uniformly at random. The invocation state machine admits
//! each frame kind at most once and answers anything out of order with
//! `INVALID_RPC_CORRELATION_ID`, so late or duplicated provider frames can
//! never reach the requestor twice.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use uuid::Uuid;

use crate::config::Options;
use crate::protocol::{Action, ErrorCode, Message, Topic};
use crate::scheduler::Scheduler;
use crate::socket::SocketRef;
use crate::subscription::SubscriptionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RpcState {
    AwaitAccept,
    AwaitResponse,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum RpcTimer {
    Ack(String),
    Response(String),
    /// Terminal invocations linger briefly so late frames are rejected with
    /// a correlation-id error instead of vanishing.
    Purge(String),
}

struct Invocation {
    name: String,
    requestor: SocketRef,
    provider: SocketRef,
    state: RpcState,
    /// Providers already offered this request (by uuid), excluded from
    /// re-selection after REJECT or disconnect.
    tried: Vec<Uuid>,
    request_frame: bytes::Bytes,
}

pub struct RpcHandler {
    registry: SubscriptionRegistry,
    invocations: HashMap<String, Invocation>,
    timers: Scheduler<RpcTimer>,
    ack_timeout: Duration,
    response_timeout: Duration,
    rng: StdRng,
}

impl RpcHandler {
    pub fn new(options: &Options) -> Self {
        Self::with_rng(options, StdRng::from_entropy())
    }

    pub fn with_rng(options: &Options, rng: StdRng) -> Self {
        Self {
            registry: SubscriptionRegistry::new(Topic::Rpc),
            invocations: HashMap::new(),
            timers: Scheduler::new(),
            ack_timeout: options.rpc_ack_timeout(),
            response_timeout: options.rpc_timeout(),
            rng,
        }
    }

    pub fn handle(&mut self, socket: &SocketRef, msg: &Message, now: Instant) {
        match msg.action {
            Action::Provide => self.provide(socket, msg),
            Action::Unprovide => self.unprovide(socket, msg),
            Action::Request => self.request(socket, msg, now),
            Action::Accept => self.accept(socket, msg, now),
            Action::Reject => self.reject(socket, msg, now),
            Action::Response | Action::Error => self.response(socket, msg, now),
            _ => {
                socket.send_error(Topic::Rpc, ErrorCode::UnknownAction, &[msg.action.as_str()]);
            }
        }
    }

    fn provide(&mut self, socket: &SocketRef, msg: &Message) {
        let Some(name) = msg.data.first() else {
            socket.send_error(Topic::Rpc, ErrorCode::InvalidMessageData, &[]);
            return;
        };
        self.registry.subscribe(name, socket);
    }

    fn unprovide(&mut self, socket: &SocketRef, msg: &Message) {
        let Some(name) = msg.data.first() else {
            socket.send_error(Topic::Rpc, ErrorCode::InvalidMessageData, &[]);
            return;
        };
        self.registry.unsubscribe(name, socket, false);
    }

    fn request(&mut self, socket: &SocketRef, msg: &Message, now: Instant) {
        let (Some(name), Some(correlation_id)) = (msg.data.first(), msg.data.get(1)) else {
            socket.send_error(Topic::Rpc, ErrorCode::InvalidMessageData, &[]);
            return;
        };
        let (name, correlation_id) = (name.as_str(), correlation_id.as_str());
        if self.invocations.contains_key(correlation_id) {
            socket.send_error(
                Topic::Rpc,
                ErrorCode::InvalidRpcCorrelationId,
                &[name, correlation_id],
            );
            return;
        }
        let Some(provider) = self.pick_provider(name, &[]) else {
            socket.send_error(
                Topic::Rpc,
                ErrorCode::NoRpcProvider,
                &[name, correlation_id],
            );
            return;
        };

        provider.send_frame(&msg.raw);
        self.invocations.insert(
            correlation_id.to_string(),
            Invocation {
                name: name.to_string(),
                requestor: socket.clone(),
                provider: provider.clone(),
                state: RpcState::AwaitAccept,
                tried: vec![provider.uuid()],
                request_frame: msg.raw.clone(),
            },
        );
        self.timers.schedule_at(
            RpcTimer::Ack(correlation_id.to_string()),
            now + self.ack_timeout,
        );
    }

    fn accept(&mut self, socket: &SocketRef, msg: &Message, now: Instant) {
        let (Some(name), Some(correlation_id)) = (msg.data.first(), msg.data.get(1)) else {
            socket.send_error(Topic::Rpc, ErrorCode::InvalidMessageData, &[]);
            return;
        };
        let (name, correlation_id) = (name.as_str(), correlation_id.as_str());
        let Some(invocation) = self.invocations.get_mut(correlation_id) else {
            socket.send_error(
                Topic::Rpc,
                ErrorCode::InvalidRpcCorrelationId,
                &[name, correlation_id],
            );
            return;
        };
        match invocation.state {
            RpcState::AwaitAccept if *socket == invocation.provider => {
                self.timers.cancel(&RpcTimer::Ack(correlation_id.to_string()));
                invocation.requestor.send_frame(&msg.raw);
                invocation.state = RpcState::AwaitResponse;
                self.timers.schedule_at(
                    RpcTimer::Response(correlation_id.to_string()),
                    now + self.response_timeout,
                );
            }
            RpcState::AwaitResponse => {
                // Someone already accepted: reject the duplicate and hand
                // the request back so the late accepter can unwind it.
                socket.send_error(
                    Topic::Rpc,
                    ErrorCode::MultipleAccept,
                    &[name, correlation_id],
                );
                socket.send_frame(&invocation.request_frame);
            }
            _ => {
                socket.send_error(
                    Topic::Rpc,
                    ErrorCode::InvalidRpcCorrelationId,
                    &[name, correlation_id],
                );
            }
        }
    }

    fn response(&mut self, socket: &SocketRef, msg: &Message, now: Instant) {
        let (Some(name), Some(correlation_id)) = (msg.data.first(), msg.data.get(1)) else {
            socket.send_error(Topic::Rpc, ErrorCode::InvalidMessageData, &[]);
            return;
        };
        let (name, correlation_id) = (name.as_str(), correlation_id.as_str());
        let valid = self
            .invocations
            .get(correlation_id)
            .is_some_and(|inv| inv.state == RpcState::AwaitResponse && *socket == inv.provider);
        if !valid {
            socket.send_error(
                Topic::Rpc,
                ErrorCode::InvalidRpcCorrelationId,
                &[name, correlation_id],
            );
            return;
        }
        self.timers
            .cancel(&RpcTimer::Response(correlation_id.to_string()));
        if let Some(invocation) = self.invocations.get(correlation_id) {
            invocation.requestor.send_frame(&msg.raw);
        }
        self.finish(correlation_id, now);
    }

    fn reject(&mut self, socket: &SocketRef, msg: &Message, now: Instant) {
        let (Some(name), Some(correlation_id)) = (msg.data.first(), msg.data.get(1)) else {
            socket.send_error(Topic::Rpc, ErrorCode::InvalidMessageData, &[]);
            return;
        };
        let (name, correlation_id) = (name.as_str(), correlation_id.as_str());
        let valid = self
            .invocations
            .get(correlation_id)
            .is_some_and(|inv| inv.state == RpcState::AwaitAccept && *socket == inv.provider);
        if !valid {
            socket.send_error(
                Topic::Rpc,
                ErrorCode::InvalidRpcCorrelationId,
                &[name, correlation_id],
            );
            return;
        }
        self.reassign(correlation_id, now);
    }

    /// Hand the request to an untried provider, or give up with
    /// `NO_RPC_PROVIDER`.
    fn reassign(&mut self, correlation_id: &str, now: Instant) {
        let Some((name, tried)) = self
            .invocations
            .get(correlation_id)
            .map(|inv| (inv.name.clone(), inv.tried.clone()))
        else {
            return;
        };
        match self.pick_provider(&name, &tried) {
            Some(next) => {
                if let Some(invocation) = self.invocations.get_mut(correlation_id) {
                    invocation.tried.push(next.uuid());
                    invocation.provider = next.clone();
                    next.send_frame(&invocation.request_frame);
                    self.timers.schedule_at(
                        RpcTimer::Ack(correlation_id.to_string()),
                        now + self.ack_timeout,
                    );
                }
            }
            None => {
                if let Some(invocation) = self.invocations.get(correlation_id) {
                    invocation.requestor.send_error(
                        Topic::Rpc,
                        ErrorCode::NoRpcProvider,
                        &[name.as_str(), correlation_id],
                    );
                }
                self.finish(correlation_id, now);
            }
        }
    }

    fn pick_provider(&mut self, name: &str, excluded: &[Uuid]) -> Option<SocketRef> {
        let candidates: Vec<SocketRef> = self
            .registry
            .subscribers(name)
            .iter()
            .filter(|s| !excluded.contains(&s.uuid()))
            .cloned()
            .collect();
        candidates.choose(&mut self.rng).cloned()
    }

    /// Move an invocation to its terminal state. The correlation id sticks
    /// around until the purge timer so stragglers get a proper error.
    fn finish(&mut self, correlation_id: &str, now: Instant) {
        self.timers.cancel(&RpcTimer::Ack(correlation_id.to_string()));
        self.timers
            .cancel(&RpcTimer::Response(correlation_id.to_string()));
        if let Some(invocation) = self.invocations.get_mut(correlation_id) {
            invocation.state = RpcState::Done;
        }
        self.timers.schedule_at(
            RpcTimer::Purge(correlation_id.to_string()),
            now + self.response_timeout,
        );
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn fire_due(&mut self, now: Instant) {
        for timer in self.timers.drain_due(now) {
            match timer {
                RpcTimer::Ack(correlation_id) => {
                    self.expire(&correlation_id, ErrorCode::AcceptTimeout, now);
                }
                RpcTimer::Response(correlation_id) => {
                    self.expire(&correlation_id, ErrorCode::ResponseTimeout, now);
                }
                RpcTimer::Purge(correlation_id) => {
                    self.invocations.remove(&correlation_id);
                }
            }
        }
    }

    fn expire(&mut self, correlation_id: &str, code: ErrorCode, now: Instant) {
        let Some(invocation) = self.invocations.get(correlation_id) else {
            return;
        };
        invocation
            .requestor
            .send_error(Topic::Rpc, code, &[invocation.name.as_str(), correlation_id]);
        self.finish(correlation_id, now);
    }

    /// Drop every role the closed socket held: provider registrations,
    /// in-flight requests it issued, in-flight requests assigned to it.
    pub fn connection_lost(&mut self, socket: &SocketRef, now: Instant) {
        self.registry.connection_lost(socket);

        let as_requestor: Vec<String> = self
            .invocations
            .iter()
            .filter(|(_, inv)| inv.requestor == *socket)
            .map(|(cid, _)| cid.clone())
            .collect();
        for correlation_id in as_requestor {
            self.timers.cancel(&RpcTimer::Ack(correlation_id.to_string()));
            self.timers
                .cancel(&RpcTimer::Response(correlation_id.clone()));
            self.timers.cancel(&RpcTimer::Purge(correlation_id.clone()));
            self.invocations.remove(&correlation_id);
        }

        let as_provider: Vec<(String, RpcState)> = self
            .invocations
            .iter()
            .filter(|(_, inv)| inv.provider == *socket)
            .map(|(cid, inv)| (cid.clone(), inv.state))
            .collect();
        for (correlation_id, state) in as_provider {
            match state {
                RpcState::AwaitAccept => self.reassign(&correlation_id, now),
                RpcState::AwaitResponse => {
                    self.timers
                        .cancel(&RpcTimer::Response(correlation_id.clone()));
                    if let Some(invocation) = self.invocations.get(&correlation_id) {
                        invocation.requestor.send_error(
                            Topic::Rpc,
                            ErrorCode::NoRpcProvider,
                            &[invocation.name.as_str(), correlation_id.as_str()],
                        );
                    }
                    self.finish(&correlation_id, now);
                }
                RpcState::Done => {}
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn active_invocations(&self) -> usize {
        self.invocations
            .values()
            .filter(|inv| inv.state != RpcState::Done)
            .count()
    }
}
