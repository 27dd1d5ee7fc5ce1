//! Wire framing: `TOPIC \x1F ACTION \x1F PART… \x1E`, ASCII only.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use super::{Action, ErrorCode, Message, Topic};

/// Unit separator between frame parts.
pub const PART_SEPARATOR: u8 = 0x1F;
/// Record separator terminating a frame on the wire.
pub const FRAME_SEPARATOR: u8 = 0x1E;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame is empty")]
    EmptyFrame,
    #[error("frame is not valid utf-8")]
    NotUtf8,
    #[error("frame has no action part")]
    MissingAction,
    #[error("unknown topic `{raw}`")]
    UnknownTopic { raw: String },
    #[error("unknown action `{raw}` on topic {topic:?}")]
    UnknownAction { topic: Topic, raw: String },
}

/// Build an outbound frame without the trailing record separator.
pub fn build_frame(topic: Topic, action: Action, parts: &[&str]) -> Bytes {
    let mut buf = BytesMut::with_capacity(
        topic.as_str().len()
            + action.as_str().len()
            + parts.iter().map(|p| p.len() + 1).sum::<usize>()
            + 1,
    );
    buf.extend_from_slice(topic.as_str().as_bytes());
    buf.extend_from_slice(&[PART_SEPARATOR]);
    buf.extend_from_slice(action.as_str().as_bytes());
    for part in parts {
        buf.extend_from_slice(&[PART_SEPARATOR]);
        buf.extend_from_slice(part.as_bytes());
    }
    buf.freeze()
}

/// Build an ERROR frame: `TOPIC \x1F ERROR \x1F CODE \x1F context…`.
pub fn error_frame(topic: Topic, code: ErrorCode, context: &[&str]) -> Bytes {
    let mut parts = Vec::with_capacity(context.len() + 1);
    parts.push(code.as_str());
    parts.extend_from_slice(context);
    build_frame(topic, Action::Error, &parts)
}

/// Parse one frame (without its trailing record separator).
pub fn parse_frame(raw: &[u8]) -> Result<Message, CodecError> {
    if raw.is_empty() {
        return Err(CodecError::EmptyFrame);
    }
    let text = std::str::from_utf8(raw).map_err(|_| CodecError::NotUtf8)?;
    let mut parts = text.split(PART_SEPARATOR as char);
    let topic_raw = parts.next().unwrap_or_default();
    let topic = Topic::parse(topic_raw).ok_or_else(|| CodecError::UnknownTopic {
        raw: topic_raw.to_string(),
    })?;
    let action_raw = parts.next().ok_or(CodecError::MissingAction)?;
    let action = Action::parse(action_raw).ok_or_else(|| CodecError::UnknownAction {
        topic,
        raw: action_raw.to_string(),
    })?;
    let data: Vec<String> = parts.map(str::to_string).collect();
    Ok(Message {
        topic,
        action,
        data,
        raw: Bytes::copy_from_slice(raw),
    })
}
