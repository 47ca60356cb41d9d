//! In-process transport and event log.
//!
//! `InMemoryNetwork` wires nodes together with crossbeam channels, one
//! unbounded inbox per node, so delivery is FIFO per sender. Links can be
//! cut to simulate an unreachable peer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use parking_lot::Mutex;
use serde::Serialize;

use crate::events::{CoordinatorEvent, EventSink};
use crate::infrastructure::{Inbound, Transport, TransportError};
use crate::types::{NodeId, Timestamp};

type Link = Arc<AtomicBool>;

pub struct InMemoryNetwork {
    nodes: Vec<NodeId>,
    inboxes: HashMap<NodeId, Sender<Vec<u8>>>,
    receivers: HashMap<NodeId, Receiver<Vec<u8>>>,
    /// Keyed by (from, to).
    links: HashMap<(NodeId, NodeId), Link>,
    /// Dropping these wakes every inbound half with `None`.
    shutdown: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl InMemoryNetwork {
    pub fn new(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        let mut nodes: Vec<NodeId> = nodes.into_iter().collect();
        nodes.sort();
        nodes.dedup();

        let mut inboxes = HashMap::new();
        let mut receivers = HashMap::new();
        for &node in &nodes {
            let (tx, rx) = unbounded();
            inboxes.insert(node, tx);
            receivers.insert(node, rx);
        }

        let mut links = HashMap::new();
        for &from in &nodes {
            for &to in &nodes {
                if from != to {
                    links.insert((from, to), Arc::new(AtomicBool::new(true)));
                }
            }
        }

        let (shutdown_tx, shutdown_rx) = bounded(0);

        Self {
            nodes,
            inboxes,
            receivers,
            links,
            shutdown: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
        }
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Both halves of `node`'s endpoint, or `None` for an unknown node.
    /// Every call hands out a new receiver on the same inbox.
    pub fn endpoint(&self, node: NodeId) -> Option<(InMemoryTransport, InMemoryInbound)> {
        let inbox = self.receivers.get(&node)?.clone();

        let mut routes = HashMap::new();
        for (&peer, tx) in &self.inboxes {
            if peer == node {
                continue;
            }
            let link = self.links.get(&(node, peer))?.clone();
            routes.insert(peer, (tx.clone(), link));
        }

        Some((
            InMemoryTransport { routes },
            InMemoryInbound {
                inbox,
                shutdown: self.shutdown_rx.clone(),
            },
        ))
    }

    /// Cut the one-way link `from -> to`.
    pub fn disconnect(&self, from: NodeId, to: NodeId) {
        self.set_link(from, to, false);
    }

    pub fn reconnect(&self, from: NodeId, to: NodeId) {
        self.set_link(from, to, true);
    }

    /// Cut every link into and out of `node`.
    pub fn isolate(&self, node: NodeId) {
        for &peer in &self.nodes {
            if peer != node {
                self.set_link(node, peer, false);
                self.set_link(peer, node, false);
            }
        }
    }

    pub fn heal(&self) {
        for link in self.links.values() {
            link.store(true, Ordering::SeqCst);
        }
    }

    /// Close every inbound half; blocked `next_inbound` calls return `None`.
    pub fn shutdown(&self) {
        self.shutdown.lock().take();
    }

    fn set_link(&self, from: NodeId, to: NodeId, up: bool) {
        if let Some(link) = self.links.get(&(from, to)) {
            link.store(up, Ordering::SeqCst);
        }
    }
}

/// Outbound half of an in-memory endpoint.
pub struct InMemoryTransport {
    routes: HashMap<NodeId, (Sender<Vec<u8>>, Link)>,
}

impl Transport for InMemoryTransport {
    fn send(&self, peer: NodeId, payload: &[u8]) -> Result<(), TransportError> {
        let (tx, link) = self
            .routes
            .get(&peer)
            .ok_or(TransportError::Unreachable(peer))?;
        if !link.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected(peer));
        }
        tx.send(payload.to_vec())
            .map_err(|_| TransportError::Disconnected(peer))
    }
}

/// Inbound half of an in-memory endpoint.
pub struct InMemoryInbound {
    inbox: Receiver<Vec<u8>>,
    shutdown: Receiver<()>,
}

impl InMemoryInbound {
    /// Non-blocking receive.
    pub fn try_next(&self) -> Option<Vec<u8>> {
        self.inbox.try_recv().ok()
    }
}

impl Inbound for InMemoryInbound {
    fn next_inbound(&mut self) -> Option<Vec<u8>> {
        select! {
            recv(self.inbox) -> payload => payload.ok(),
            recv(self.shutdown) -> _ => None,
        }
    }
}

/// One recorded coordinator event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedEvent {
    pub node: NodeId,
    pub clock: Timestamp,
    pub event: CoordinatorEvent,
}

/// Keeps every event in memory, in record order. Shareable between all
/// nodes of a simulated cluster.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn events_for(&self, node: NodeId) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.node == node)
            .cloned()
            .collect()
    }

    /// Nodes in the order they entered the critical section.
    pub fn entry_order(&self) -> Vec<NodeId> {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e.event, CoordinatorEvent::EntryGranted { .. }))
            .map(|e| e.node)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemoryEventLog {
    fn record(&self, node: NodeId, clock: Timestamp, event: &CoordinatorEvent) {
        self.events.lock().push(RecordedEvent {
            node,
            clock,
            event: event.clone(),
        });
    }
}
