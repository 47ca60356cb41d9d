//! Observable coordinator events and the sinks that record them.
//!
//! Nothing in the coordinator depends on a sink succeeding.

use serde::{Deserialize, Serialize};

use crate::types::{MessageKind, NodeId, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    RequestIssued {
        timestamp: Timestamp,
    },
    MessageSent {
        to: NodeId,
        kind: MessageKind,
        timestamp: Timestamp,
    },
    SendFailed {
        to: NodeId,
        kind: MessageKind,
        reason: String,
    },
    MessageReceived {
        from: NodeId,
        kind: MessageKind,
        timestamp: Timestamp,
    },
    EntryGranted {
        timestamp: Timestamp,
    },
    Released {
        timestamp: Timestamp,
    },
}

impl CoordinatorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CoordinatorEvent::RequestIssued { .. } => "request_issued",
            CoordinatorEvent::MessageSent { .. } => "message_sent",
            CoordinatorEvent::SendFailed { .. } => "send_failed",
            CoordinatorEvent::MessageReceived { .. } => "message_received",
            CoordinatorEvent::EntryGranted { .. } => "entry_granted",
            CoordinatorEvent::Released { .. } => "released",
        }
    }
}

/// Destination for coordinator events.
///
/// `record` is called with the coordinator's state lock held, so
/// implementations must be quick and must not call back into the
/// coordinator.
pub trait EventSink: Send + Sync {
    /// `clock` is the node's logical clock when the event was recorded.
    fn record(&self, node: NodeId, clock: Timestamp, event: &CoordinatorEvent);
}

/// Emits every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, node: NodeId, clock: Timestamp, event: &CoordinatorEvent) {
        match event {
            CoordinatorEvent::RequestIssued { timestamp } => {
                tracing::info!(node = %node, clock, timestamp, "Critical section requested");
            }
            CoordinatorEvent::MessageSent { to, kind, timestamp } => {
                tracing::debug!(node = %node, clock, to = %to, kind = %kind, timestamp, "Message sent");
            }
            CoordinatorEvent::SendFailed { to, kind, reason } => {
                tracing::warn!(node = %node, clock, to = %to, kind = %kind, reason = %reason, "Send failed");
            }
            CoordinatorEvent::MessageReceived { from, kind, timestamp } => {
                tracing::debug!(node = %node, clock, from = %from, kind = %kind, timestamp, "Message received");
            }
            CoordinatorEvent::EntryGranted { timestamp } => {
                tracing::info!(node = %node, clock, timestamp, "Entered critical section");
            }
            CoordinatorEvent::Released { timestamp } => {
                tracing::info!(node = %node, clock, timestamp, "Released critical section");
            }
        }
    }
}
