//! Protocol vocabulary: topics, actions, error codes, parsed messages.

mod codec;

pub use codec::{build_frame, error_frame, parse_frame, CodecError, FRAME_SEPARATOR, PART_SEPARATOR};

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Record,
    Rpc,
    /// Cluster-internal namespace for listen-pattern provider state.
    ListenPatterns,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Record => "RECORD",
            Topic::Rpc => "RPC",
            Topic::ListenPatterns => "LISTEN_PATTERNS",
        }
    }

    pub fn parse(raw: &str) -> Option<Topic> {
        match raw {
            "RECORD" => Some(Topic::Record),
            "RPC" => Some(Topic::Rpc),
            "LISTEN_PATTERNS" => Some(Topic::ListenPatterns),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    // Records
    Read,
    Update,
    Unsubscribe,
    Listen,
    Unlisten,
    ListenAccept,
    ListenReject,
    SubscriptionForPatternFound,
    SubscriptionForPatternRemoved,
    SubscriptionHasProvider,
    // RPC
    Provide,
    Unprovide,
    Request,
    Accept,
    Reject,
    Response,
    // Shared
    Error,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Read => "READ",
            Action::Update => "UPDATE",
            Action::Unsubscribe => "UNSUBSCRIBE",
            Action::Listen => "LISTEN",
            Action::Unlisten => "UNLISTEN",
            Action::ListenAccept => "LISTEN_ACCEPT",
            Action::ListenReject => "LISTEN_REJECT",
            Action::SubscriptionForPatternFound => "SUBSCRIPTION_FOR_PATTERN_FOUND",
            Action::SubscriptionForPatternRemoved => "SUBSCRIPTION_FOR_PATTERN_REMOVED",
            Action::SubscriptionHasProvider => "SUBSCRIPTION_HAS_PROVIDER",
            Action::Provide => "PROVIDE",
            Action::Unprovide => "UNPROVIDE",
            Action::Request => "REQUEST",
            Action::Accept => "ACCEPT",
            Action::Reject => "REJECT",
            Action::Response => "RESPONSE",
            Action::Error => "ERROR",
        }
    }

    pub fn parse(raw: &str) -> Option<Action> {
        match raw {
            "READ" => Some(Action::Read),
            "UPDATE" => Some(Action::Update),
            "UNSUBSCRIBE" => Some(Action::Unsubscribe),
            "LISTEN" => Some(Action::Listen),
            "UNLISTEN" => Some(Action::Unlisten),
            "LISTEN_ACCEPT" => Some(Action::ListenAccept),
            "LISTEN_REJECT" => Some(Action::ListenReject),
            "SUBSCRIPTION_FOR_PATTERN_FOUND" => Some(Action::SubscriptionForPatternFound),
            "SUBSCRIPTION_FOR_PATTERN_REMOVED" => Some(Action::SubscriptionForPatternRemoved),
            "SUBSCRIPTION_HAS_PROVIDER" => Some(Action::SubscriptionHasProvider),
            "PROVIDE" => Some(Action::Provide),
            "UNPROVIDE" => Some(Action::Unprovide),
            "REQUEST" => Some(Action::Request),
            "ACCEPT" => Some(Action::Accept),
            "REJECT" => Some(Action::Reject),
            "RESPONSE" => Some(Action::Response),
            "ERROR" => Some(Action::Error),
            _ => None,
        }
    }
}

/// Protocol error codes carried in ERROR frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidMessageData,
    InvalidVersion,
    UnknownAction,
    RecordLoadError,
    RecordUpdateError,
    MultipleSubscriptions,
    NotSubscribed,
    MultipleAccept,
    InvalidRpcCorrelationId,
    AcceptTimeout,
    ResponseTimeout,
    NoRpcProvider,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidMessageData => "INVALID_MESSAGE_DATA",
            ErrorCode::InvalidVersion => "INVALID_VERSION",
            ErrorCode::UnknownAction => "UNKNOWN_ACTION",
            ErrorCode::RecordLoadError => "RECORD_LOAD_ERROR",
            ErrorCode::RecordUpdateError => "RECORD_UPDATE_ERROR",
            ErrorCode::MultipleSubscriptions => "MULTIPLE_SUBSCRIPTIONS",
            ErrorCode::NotSubscribed => "NOT_SUBSCRIBED",
            ErrorCode::MultipleAccept => "MULTIPLE_ACCEPT",
            ErrorCode::InvalidRpcCorrelationId => "INVALID_RPC_CORRELATION_ID",
            ErrorCode::AcceptTimeout => "ACCEPT_TIMEOUT",
            ErrorCode::ResponseTimeout => "RESPONSE_TIMEOUT",
            ErrorCode::NoRpcProvider => "NO_RPC_PROVIDER",
        }
    }
}

/// One parsed inbound frame. `raw` is the frame exactly as received, without
/// the trailing record separator; it is replayed verbatim when a message is
/// forwarded or broadcast.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: Topic,
    pub action: Action,
    pub data: Vec<String>,
    pub raw: Bytes,
}

impl Message {
    pub fn new(topic: Topic, action: Action, data: Vec<String>) -> Self {
        let raw = build_frame(
            topic,
            action,
            &data.iter().map(String::as_str).collect::<Vec<_>>(),
        );
        Self {
            topic,
            action,
            data,
            raw,
        }
    }
}
