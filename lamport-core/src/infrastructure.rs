use thiserror::Error;

use crate::types::NodeId;

/// Failure at the transport boundary. Never fatal to the coordinator: a
/// failed send is logged and looks exactly like a slow peer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no route to node {0}")]
    Unreachable(NodeId),
    #[error("link to node {0} is down")]
    Disconnected(NodeId),
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound half of a peer transport.
///
/// Sends are best effort and must not block on the receiving side's
/// progress: the coordinator calls `send` while holding its state lock.
/// Payloads to the same peer must be delivered in send order.
pub trait Transport: Send + Sync {
    fn send(&self, peer: NodeId, payload: &[u8]) -> Result<(), TransportError>;
}

/// Inbound half of a peer transport.
pub trait Inbound {
    /// Blocks until a payload arrives. `None` once the transport is closed.
    fn next_inbound(&mut self) -> Option<Vec<u8>>;
}
