use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A Lamport timestamp. Every protocol message carries one.
pub type Timestamp = u64;

/// Content carried by the messages the coordinator emits.
pub const REQUEST_CONTENT: &str = "Requesting CS";
pub const REPLY_CONTENT: &str = "OK";
pub const RELEASE_CONTENT: &str = "Releasing CS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("node id must be a positive integer")]
pub struct InvalidNodeId;

/// Identity of a peer. Ids are small positive integers, fixed for the
/// lifetime of the process and shared by every peer through the
/// address table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct NodeId(u32);

impl NodeId {
    /// Returns `None` for zero, which never names a peer.
    pub const fn new(raw: u32) -> Option<Self> {
        if raw == 0 { None } else { Some(Self(raw)) }
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for NodeId {
    type Error = InvalidNodeId;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Self::new(raw).ok_or(InvalidNodeId)
    }
}

impl From<NodeId> for u32 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three protocol verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    /// A peer asks for the critical section
    Request,
    /// Acknowledges a peer's request
    Reply,
    /// A peer left the critical section (or withdrew its request)
    Release,
}

impl MessageKind {
    /// Token used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Request => "REQUEST",
            MessageKind::Reply => "REPLY",
            MessageKind::Release => "RELEASE",
        }
    }

    /// Human-readable content sent with this kind. Receivers ignore it.
    pub fn default_content(self) -> &'static str {
        match self {
            MessageKind::Request => REQUEST_CONTENT,
            MessageKind::Reply => REPLY_CONTENT,
            MessageKind::Release => RELEASE_CONTENT,
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "REQUEST" => Some(MessageKind::Request),
            "REPLY" => Some(MessageKind::Reply),
            "RELEASE" => Some(MessageKind::Release),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol message. `(timestamp, sender)` orders every message in
/// the system; ties on timestamp are broken by the lower sender id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender: NodeId,
    pub timestamp: Timestamp,
    pub kind: MessageKind,
    /// Free text. Always the last field on the wire.
    pub content: String,
}

impl Message {
    pub fn new(
        sender: NodeId,
        timestamp: Timestamp,
        kind: MessageKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            sender,
            timestamp,
            kind,
            content: content.into(),
        }
    }

    /// The queue key this message would occupy if it were a request.
    pub fn entry(&self) -> super::RequestEntry {
        super::RequestEntry::new(self.timestamp, self.sender)
    }
}
