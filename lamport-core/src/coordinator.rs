//! The mutual-exclusion state machine.
//!
//! `IDLE -> REQUESTING -> HELD -> IDLE`. A node may enter once every
//! other peer has replied to its current request and its own entry heads
//! the request queue. All queue, quorum and state mutation, and every
//! send, happens under one lock: an interleaving such as a REPLY landing
//! between `push` and `reset_for` of a fresh request would break the
//! entry rule, and sending under the lock keeps per-peer send order
//! equal to logical order.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::clock::{ClockExhausted, LogicalClock};
use crate::codec;
use crate::config::{AddressTable, ConfigError};
use crate::events::{CoordinatorEvent, EventSink};
use crate::infrastructure::Transport;
use crate::queue::RequestQueue;
use crate::quorum::ReplyQuorum;
use crate::types::{
    CoordinatorState, Message, MessageKind, NodeId, RELEASE_CONTENT, REPLY_CONTENT,
    REQUEST_CONTENT, RequestEntry, Timestamp,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    /// Caller bug: the operation is not valid in the current state.
    #[error("`{operation}` is not valid in state {state}")]
    InvalidState {
        operation: &'static str,
        state: CoordinatorState,
    },
    #[error("message from unknown sender {0}")]
    UnknownSender(NodeId),
    /// The deadline passed before every peer replied or the own request
    /// reached the head of the queue. The request stays outstanding.
    #[error("timed out waiting for the critical section (no reply yet from {pending:?})")]
    QuorumTimeout { pending: Vec<NodeId> },
    /// Nothing was changed or sent.
    #[error(transparent)]
    ClockExhausted(#[from] ClockExhausted),
}

/// Point-in-time view of a coordinator, for status endpoints and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorStatus {
    pub node: NodeId,
    pub state: CoordinatorState,
    pub clock: Timestamp,
    pub request: Option<RequestEntry>,
    pub queue: Vec<RequestEntry>,
    pub pending_replies: Vec<NodeId>,
    pub can_enter: bool,
}

/// Clock advances kept back so a holder can always stamp its RELEASE.
const RELEASE_RESERVE: u64 = 1;

#[derive(Debug, Default)]
struct Inner {
    state: CoordinatorState,
    queue: RequestQueue,
    quorum: ReplyQuorum,
    /// Own outstanding request, if any.
    request: Option<RequestEntry>,
}

pub struct MutualExclusionCoordinator {
    id: NodeId,
    /// Every other peer, ascending.
    peers: Vec<NodeId>,
    clock: LogicalClock,
    inner: Mutex<Inner>,
    transport: Arc<dyn Transport>,
    events: Arc<dyn EventSink>,
}

impl MutualExclusionCoordinator {
    /// `peers` may include `id`; it is filtered out.
    pub fn new(
        id: NodeId,
        peers: impl IntoIterator<Item = NodeId>,
        transport: Arc<dyn Transport>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let mut peers: Vec<NodeId> = peers.into_iter().filter(|peer| *peer != id).collect();
        peers.sort();
        peers.dedup();

        Self {
            id,
            peers,
            clock: LogicalClock::new(),
            inner: Mutex::new(Inner::default()),
            transport,
            events,
        }
    }

    /// Build from the cluster address table. Fails if `id` is not listed.
    pub fn from_table(
        id: NodeId,
        table: &AddressTable,
        transport: Arc<dyn Transport>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, ConfigError> {
        table.get(id)?;
        Ok(Self::new(id, table.peers_of(id), transport, events))
    }

    /// Start the logical clock at `value` instead of zero.
    pub fn with_initial_clock(mut self, value: Timestamp) -> Self {
        self.clock = LogicalClock::starting_at(value);
        self
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn clock(&self) -> Timestamp {
        self.clock.current()
    }

    pub fn state(&self) -> CoordinatorState {
        self.inner.lock().state
    }

    /// Ask for the critical section. Returns the request timestamp
    /// without waiting for any reply; poll [`can_enter`](Self::can_enter).
    pub fn request_entry(&self) -> Result<Timestamp, CoordinatorError> {
        let mut inner = self.inner.lock();
        if inner.state != CoordinatorState::Idle {
            return Err(CoordinatorError::InvalidState {
                operation: "request_entry",
                state: inner.state,
            });
        }

        if !self.clock.has_room(0, 1 + RELEASE_RESERVE) {
            return Err(ClockExhausted {
                current: self.clock.current(),
            }
            .into());
        }

        let timestamp = self.clock.tick()?;
        let own = RequestEntry::new(timestamp, self.id);
        inner.queue.push(own);
        inner.quorum.reset_for(self.peers.iter().copied());
        inner.request = Some(own);
        inner.state = CoordinatorState::Requesting;
        self.record(CoordinatorEvent::RequestIssued { timestamp });

        let request = Message::new(self.id, timestamp, MessageKind::Request, REQUEST_CONTENT);
        for &peer in &self.peers {
            self.send(peer, &request);
        }

        Ok(timestamp)
    }

    /// Apply one inbound message. Callable from any state.
    ///
    /// A REQUEST is always answered at once, even while this node holds
    /// the critical section; it is enqueued before the REPLY goes out.
    ///
    /// A message whose timestamp leaves no room to handle it (and still
    /// stamp a later RELEASE) is rejected before anything changes.
    pub fn on_message(&self, message: &Message) -> Result<(), CoordinatorError> {
        if self.peers.binary_search(&message.sender).is_err() {
            return Err(CoordinatorError::UnknownSender(message.sender));
        }

        let mut inner = self.inner.lock();
        let steps = match message.kind {
            MessageKind::Request => 3,
            MessageKind::Reply | MessageKind::Release => 2,
        };
        if !self.clock.has_room(message.timestamp, steps + RELEASE_RESERVE) {
            return Err(ClockExhausted {
                current: self.clock.current().max(message.timestamp),
            }
            .into());
        }

        self.clock.observe(message.timestamp)?;
        self.clock.tick()?;
        self.record(CoordinatorEvent::MessageReceived {
            from: message.sender,
            kind: message.kind,
            timestamp: message.timestamp,
        });

        match message.kind {
            MessageKind::Request => {
                inner.queue.push(message.entry());
                let timestamp = self.clock.tick()?;
                let reply = Message::new(self.id, timestamp, MessageKind::Reply, REPLY_CONTENT);
                self.send(message.sender, &reply);
            }
            MessageKind::Reply => {
                if !inner.quorum.mark_replied(message.sender) {
                    tracing::debug!(node = %self.id, from = %message.sender, "Reply outside the current quorum");
                }
            }
            MessageKind::Release => {
                inner.queue.remove_by_owner(message.sender);
            }
        }

        Ok(())
    }

    /// True iff this node is requesting, every peer has replied, and its
    /// own entry heads the queue. Pure; safe to poll.
    pub fn can_enter(&self) -> bool {
        self.ready(&self.inner.lock())
    }

    /// Mark the critical section as occupied. Only valid when
    /// [`can_enter`](Self::can_enter) holds. Sends nothing.
    pub fn enter(&self) -> Result<(), CoordinatorError> {
        let mut inner = self.inner.lock();
        if !self.ready(&inner) {
            return Err(CoordinatorError::InvalidState {
                operation: "enter",
                state: inner.state,
            });
        }

        inner.state = CoordinatorState::Held;
        if let Some(own) = inner.request {
            self.record(CoordinatorEvent::EntryGranted {
                timestamp: own.timestamp,
            });
        }
        Ok(())
    }

    /// Leave the critical section and tell every peer.
    pub fn release_entry(&self) -> Result<Timestamp, CoordinatorError> {
        let mut inner = self.inner.lock();
        if inner.state != CoordinatorState::Held {
            return Err(CoordinatorError::InvalidState {
                operation: "release_entry",
                state: inner.state,
            });
        }

        let timestamp = self.clock.tick()?;
        inner.queue.remove_by_owner(self.id);
        inner.request = None;
        inner.state = CoordinatorState::Idle;

        self.record(CoordinatorEvent::Released { timestamp });
        let release = Message::new(self.id, timestamp, MessageKind::Release, RELEASE_CONTENT);
        for &peer in &self.peers {
            self.send(peer, &release);
        }

        Ok(timestamp)
    }

    /// Peers that have not replied to the current request.
    pub fn pending_replies(&self) -> Vec<NodeId> {
        let inner = self.inner.lock();
        match inner.state {
            CoordinatorState::Requesting => inner.quorum.pending(),
            _ => Vec::new(),
        }
    }

    pub fn status(&self) -> CoordinatorStatus {
        let inner = self.inner.lock();
        CoordinatorStatus {
            node: self.id,
            state: inner.state,
            clock: self.clock.current(),
            request: inner.request,
            queue: inner.queue.snapshot(),
            pending_replies: match inner.state {
                CoordinatorState::Requesting => inner.quorum.pending(),
                _ => Vec::new(),
            },
            can_enter: self.ready(&inner),
        }
    }

    fn ready(&self, inner: &Inner) -> bool {
        inner.state == CoordinatorState::Requesting
            && inner.quorum.all_replied()
            && inner.queue.peek_min().is_some_and(|head| head.owner == self.id)
    }

    fn send(&self, to: NodeId, message: &Message) {
        match self.transport.send(to, &codec::encode(message)) {
            Ok(()) => self.record(CoordinatorEvent::MessageSent {
                to,
                kind: message.kind,
                timestamp: message.timestamp,
            }),
            Err(err) => self.record(CoordinatorEvent::SendFailed {
                to,
                kind: message.kind,
                reason: err.to_string(),
            }),
        }
    }

    fn record(&self, event: CoordinatorEvent) {
        self.events.record(self.id, self.clock.current(), &event);
    }
}

impl std::fmt::Debug for MutualExclusionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutualExclusionCoordinator")
            .field("id", &self.id)
            .field("peers", &self.peers)
            .field("clock", &self.clock.current())
            .finish_non_exhaustive()
    }
}
