//! Text wire format for protocol messages.
//!
//! ```text
//! Id: 1, Timestamp: 5, Type: REQUEST, Content: Requesting CS
//! ```
//!
//! Fields appear in this fixed order. `Content` is always last and runs
//! to the end of the payload unescaped, so it may contain commas,
//! colons or even the label text itself.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::types::{Message, MessageKind, NodeId};

const ID_LABEL: &str = "Id: ";
const TIMESTAMP_LABEL: &str = ", Timestamp: ";
const TYPE_LABEL: &str = ", Type: ";
const CONTENT_LABEL: &str = ", Content: ";

/// Why an inbound payload could not be decoded. The receive loop drops
/// such payloads without touching coordinator state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedMessage {
    #[error("missing `{0}` field")]
    MissingField(&'static str),
    #[error("unrecognized message type `{0}`")]
    UnknownKind(String),
    #[error("`{field}` is not a valid value: `{value}`")]
    InvalidInteger { field: &'static str, value: String },
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
}

pub fn encode(message: &Message) -> Vec<u8> {
    message.to_string().into_bytes()
}

pub fn decode(payload: &[u8]) -> Result<Message, MalformedMessage> {
    std::str::from_utf8(payload)
        .map_err(|_| MalformedMessage::InvalidUtf8)?
        .parse()
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{ID_LABEL}{}{TIMESTAMP_LABEL}{}{TYPE_LABEL}{}{CONTENT_LABEL}{}",
            self.sender, self.timestamp, self.kind, self.content
        )
    }
}

impl FromStr for Message {
    type Err = MalformedMessage;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let rest = text
            .strip_prefix(ID_LABEL)
            .ok_or(MalformedMessage::MissingField("Id"))?;
        let (id, rest) = rest
            .split_once(TIMESTAMP_LABEL)
            .ok_or(MalformedMessage::MissingField("Timestamp"))?;
        let (timestamp, rest) = rest
            .split_once(TYPE_LABEL)
            .ok_or(MalformedMessage::MissingField("Type"))?;
        // First occurrence after `Type`: anything further right belongs to the content.
        let (kind, content) = rest
            .split_once(CONTENT_LABEL)
            .ok_or(MalformedMessage::MissingField("Content"))?;

        let sender = id
            .parse::<u32>()
            .ok()
            .and_then(NodeId::new)
            .ok_or_else(|| MalformedMessage::InvalidInteger {
                field: "Id",
                value: id.to_string(),
            })?;
        let timestamp = timestamp
            .parse()
            .map_err(|_| MalformedMessage::InvalidInteger {
                field: "Timestamp",
                value: timestamp.to_string(),
            })?;
        let kind = MessageKind::from_token(kind)
            .ok_or_else(|| MalformedMessage::UnknownKind(kind.to_string()))?;

        Ok(Message::new(sender, timestamp, kind, content))
    }
}
