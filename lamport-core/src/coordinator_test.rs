#[cfg(test)]
mod tests {
    use crate::codec;
    use crate::coordinator::{CoordinatorError, MutualExclusionCoordinator};
    use crate::events::{CoordinatorEvent, EventSink};
    use crate::infrastructure::{Transport, TransportError};
    use crate::infrastructure_in_memory::MemoryEventLog;
    use crate::node::dispatch_frame;
    use crate::types::{CoordinatorState, Message, MessageKind, NodeId, RequestEntry};
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashSet, VecDeque};
    use std::sync::Arc;

    fn id(n: u32) -> NodeId {
        NodeId::new(n).unwrap()
    }

    type Outbox = Arc<Mutex<VecDeque<(NodeId, NodeId, Vec<u8>)>>>;

    /// Queues every payload in one global FIFO so the test decides when
    /// it is delivered. Sends to peers in `down` fail.
    struct QueuedTransport {
        from: NodeId,
        outbox: Outbox,
        down: Arc<Mutex<HashSet<NodeId>>>,
    }

    impl Transport for QueuedTransport {
        fn send(&self, peer: NodeId, payload: &[u8]) -> Result<(), TransportError> {
            if self.down.lock().contains(&peer) {
                return Err(TransportError::Disconnected(peer));
            }
            self.outbox.lock().push_back((self.from, peer, payload.to_vec()));
            Ok(())
        }
    }

    struct Cluster {
        nodes: BTreeMap<NodeId, MutualExclusionCoordinator>,
        outbox: Outbox,
        down: Arc<Mutex<HashSet<NodeId>>>,
        events: Arc<MemoryEventLog>,
    }

    impl Cluster {
        fn new(size: u32) -> Self {
            Self::with_clocks(&vec![0; size as usize])
        }

        fn with_clocks(clocks: &[u64]) -> Self {
            let outbox: Outbox = Arc::default();
            let down = Arc::new(Mutex::new(HashSet::new()));
            let events = Arc::new(MemoryEventLog::new());
            let ids: Vec<NodeId> = (1..=clocks.len() as u32).map(id).collect();

            let nodes = ids
                .iter()
                .zip(clocks)
                .map(|(&node, &clock)| {
                    let transport = Arc::new(QueuedTransport {
                        from: node,
                        outbox: Arc::clone(&outbox),
                        down: Arc::clone(&down),
                    });
                    let coordinator = MutualExclusionCoordinator::new(
                        node,
                        ids.clone(),
                        transport,
                        Arc::clone(&events) as Arc<dyn EventSink>,
                    )
                    .with_initial_clock(clock);
                    (node, coordinator)
                })
                .collect();

            Self {
                nodes,
                outbox,
                down,
                events,
            }
        }

        fn node(&self, n: u32) -> &MutualExclusionCoordinator {
            &self.nodes[&id(n)]
        }

        /// Payloads currently in flight, decoded.
        fn in_flight(&self) -> Vec<(NodeId, NodeId, Message)> {
            self.outbox
                .lock()
                .iter()
                .map(|(from, to, payload)| (*from, *to, codec::decode(payload).unwrap()))
                .collect()
        }

        fn deliver_one(&self) -> bool {
            let next = self.outbox.lock().pop_front();
            match next {
                Some((_, to, payload)) => {
                    assert!(dispatch_frame(&self.nodes[&to], &payload));
                    true
                }
                None => false,
            }
        }

        fn deliver_all(&self) {
            while self.deliver_one() {}
        }

        /// Deliver everything, tolerating payloads the receiver rejects.
        /// Returns how many were rejected.
        fn deliver_all_counting_drops(&self) -> usize {
            let mut dropped = 0;
            loop {
                let next = self.outbox.lock().pop_front();
                let Some((_, to, payload)) = next else {
                    return dropped;
                };
                if !dispatch_frame(&self.nodes[&to], &payload) {
                    dropped += 1;
                }
            }
        }

        fn held(&self) -> Vec<NodeId> {
            self.nodes
                .values()
                .filter(|c| c.state() == CoordinatorState::Held)
                .map(|c| c.id())
                .collect()
        }
    }

    #[test]
    fn test_three_node_request_enter_release() {
        let cluster = Cluster::new(3);

        let ts = cluster.node(1).request_entry().unwrap();
        assert_eq!(ts, 1);
        assert_eq!(cluster.node(1).clock(), 1);
        assert_eq!(cluster.node(1).state(), CoordinatorState::Requesting);

        let requests = cluster.in_flight();
        assert_eq!(requests.len(), 2);
        for (from, _, msg) in &requests {
            assert_eq!(*from, id(1));
            assert_eq!(msg.kind, MessageKind::Request);
            assert_eq!(msg.timestamp, 1);
        }
        assert!(!cluster.node(1).can_enter());

        // Peers receive the REQUEST and answer.
        cluster.deliver_one();
        cluster.deliver_one();
        for n in [2, 3] {
            let status = cluster.node(n).status();
            assert_eq!(status.queue, vec![RequestEntry::new(1, id(1))]);
            assert!(status.clock >= 2);
            assert_eq!(status.state, CoordinatorState::Idle);
        }

        let replies = cluster.in_flight();
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|(_, to, m)| *to == id(1) && m.kind == MessageKind::Reply));

        cluster.deliver_one();
        assert!(!cluster.node(1).can_enter());
        assert_eq!(cluster.node(1).pending_replies().len(), 1);
        cluster.deliver_one();
        assert!(cluster.node(1).can_enter());

        cluster.node(1).enter().unwrap();
        assert_eq!(cluster.held(), vec![id(1)]);
        assert!(cluster.in_flight().is_empty(), "enter sends nothing");

        cluster.node(1).release_entry().unwrap();
        assert_eq!(cluster.node(1).state(), CoordinatorState::Idle);
        assert!(cluster.node(1).status().queue.is_empty());

        let releases = cluster.in_flight();
        assert_eq!(releases.len(), 2);
        assert!(releases.iter().all(|(_, _, m)| m.kind == MessageKind::Release));

        cluster.deliver_all();
        assert!(cluster.node(2).status().queue.is_empty());
        assert!(cluster.node(3).status().queue.is_empty());
    }

    #[test]
    fn test_reply_timestamp_follows_observe_then_tick() {
        let cluster = Cluster::new(2);
        cluster.node(1).request_entry().unwrap();
        cluster.deliver_one();

        // observe(1) -> 2, tick -> 3, reply stamped with tick -> 4
        let reply = &cluster.in_flight()[0].2;
        assert_eq!(reply.kind, MessageKind::Reply);
        assert_eq!(reply.timestamp, 4);
        assert_eq!(reply.content, "OK");
        assert_eq!(cluster.node(2).clock(), 4);
    }

    #[test]
    fn test_tied_timestamps_go_to_lower_node_id() {
        let cluster = Cluster::with_clocks(&[4, 4, 0]);

        assert_eq!(cluster.node(1).request_entry().unwrap(), 5);
        assert_eq!(cluster.node(2).request_entry().unwrap(), 5);
        cluster.deliver_all();

        assert!(cluster.node(1).can_enter());
        assert!(!cluster.node(2).can_enter());
        assert!(cluster.node(2).pending_replies().is_empty(), "node 2 has every reply");
        assert_eq!(
            cluster.node(2).status().queue,
            vec![RequestEntry::new(5, id(1)), RequestEntry::new(5, id(2))]
        );

        cluster.node(1).enter().unwrap();
        assert!(!cluster.node(2).can_enter());
        cluster.node(1).release_entry().unwrap();
        assert!(!cluster.node(2).can_enter(), "RELEASE not yet observed");

        cluster.deliver_all();
        assert!(cluster.node(2).can_enter());
        cluster.node(2).enter().unwrap();
        assert_eq!(cluster.held(), vec![id(2)]);
    }

    #[test]
    fn test_reply_sent_even_while_holding() {
        let cluster = Cluster::new(2);
        cluster.node(1).request_entry().unwrap();
        cluster.deliver_all();
        cluster.node(1).enter().unwrap();

        cluster.node(2).request_entry().unwrap();
        cluster.deliver_one();

        let in_flight = cluster.in_flight();
        assert_eq!(in_flight.len(), 1);
        assert_eq!(in_flight[0].0, id(1));
        assert_eq!(in_flight[0].2.kind, MessageKind::Reply);

        cluster.deliver_all();
        assert!(!cluster.node(2).can_enter(), "node 1 still heads node 2's queue");
        assert_eq!(cluster.held(), vec![id(1)]);
    }

    #[test]
    fn test_request_outside_idle_is_rejected() {
        let cluster = Cluster::new(2);
        cluster.node(1).request_entry().unwrap();
        let err = cluster.node(1).request_entry().unwrap_err();
        assert_eq!(
            err,
            CoordinatorError::InvalidState {
                operation: "request_entry",
                state: CoordinatorState::Requesting,
            }
        );
    }

    #[test]
    fn test_enter_before_ready_is_rejected() {
        let cluster = Cluster::new(2);
        assert!(matches!(
            cluster.node(1).enter(),
            Err(CoordinatorError::InvalidState { state: CoordinatorState::Idle, .. })
        ));

        cluster.node(1).request_entry().unwrap();
        assert!(matches!(
            cluster.node(1).enter(),
            Err(CoordinatorError::InvalidState { operation: "enter", .. })
        ));
        assert_eq!(cluster.node(1).state(), CoordinatorState::Requesting);
    }

    #[test]
    fn test_release_outside_held_is_rejected() {
        let cluster = Cluster::new(2);
        assert!(matches!(
            cluster.node(1).release_entry(),
            Err(CoordinatorError::InvalidState { operation: "release_entry", state: CoordinatorState::Idle })
        ));
        cluster.node(1).request_entry().unwrap();
        assert!(cluster.node(1).release_entry().is_err());
        assert!(cluster.in_flight().iter().all(|(_, _, m)| m.kind == MessageKind::Request));
    }

    #[test]
    fn test_single_node_cluster_enters_immediately() {
        let cluster = Cluster::new(1);
        cluster.node(1).request_entry().unwrap();
        assert!(cluster.in_flight().is_empty());
        assert!(cluster.node(1).can_enter());
        cluster.node(1).enter().unwrap();
        cluster.node(1).release_entry().unwrap();
        assert_eq!(cluster.node(1).state(), CoordinatorState::Idle);
    }

    #[test]
    fn test_unknown_sender_is_rejected_without_mutation() {
        let cluster = Cluster::new(2);
        let before = cluster.node(1).status();

        let stranger = Message::new(id(9), 50, MessageKind::Request, "hi");
        assert_eq!(
            cluster.node(1).on_message(&stranger),
            Err(CoordinatorError::UnknownSender(id(9)))
        );
        let echo = Message::new(id(1), 50, MessageKind::Request, "hi");
        assert!(cluster.node(1).on_message(&echo).is_err());

        assert_eq!(cluster.node(1).status(), before);
        assert!(cluster.in_flight().is_empty());
    }

    #[test]
    fn test_malformed_payload_does_not_mutate_state() {
        let cluster = Cluster::new(2);
        cluster.node(1).request_entry().unwrap();
        let before = cluster.node(2).status();

        assert!(!dispatch_frame(cluster.node(2), b"Id: 1, Timestamp: 9, Content: no type"));
        assert!(!dispatch_frame(cluster.node(2), b"Id: 1, Timestamp: 9, Type: BOGUS, Content: "));
        assert!(!dispatch_frame(cluster.node(2), b"garbage"));

        assert_eq!(cluster.node(2).status(), before);
        assert_eq!(cluster.in_flight().len(), 1, "only node 1's REQUEST");
    }

    #[test]
    fn test_failed_send_stalls_requester() {
        let cluster = Cluster::new(3);
        cluster.down.lock().insert(id(3));

        cluster.node(1).request_entry().unwrap();
        cluster.deliver_all();

        assert!(!cluster.node(1).can_enter());
        assert_eq!(cluster.node(1).pending_replies(), vec![id(3)]);

        let failures: Vec<_> = cluster
            .events
            .events_for(id(1))
            .into_iter()
            .filter(|e| matches!(e.event, CoordinatorEvent::SendFailed { to, .. } if to == id(3)))
            .collect();
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn test_events_trace_the_lifecycle() {
        let cluster = Cluster::new(2);
        cluster.node(1).request_entry().unwrap();
        cluster.deliver_all();
        cluster.node(1).enter().unwrap();
        cluster.node(1).release_entry().unwrap();
        cluster.deliver_all();

        let names: Vec<&str> = cluster
            .events
            .events_for(id(1))
            .iter()
            .map(|e| e.event.name())
            .collect();
        assert_eq!(
            names,
            vec![
                "request_issued",
                "message_sent",
                "message_received",
                "entry_granted",
                "released",
                "message_sent",
            ]
        );
        assert_eq!(cluster.events.entry_order(), vec![id(1)]);
    }

    #[test]
    fn test_status_snapshot() {
        let cluster = Cluster::new(3);
        cluster.node(2).request_entry().unwrap();

        let status = cluster.node(2).status();
        assert_eq!(status.node, id(2));
        assert_eq!(status.state, CoordinatorState::Requesting);
        assert_eq!(status.request, Some(RequestEntry::new(1, id(2))));
        assert_eq!(status.pending_replies, vec![id(1), id(3)]);
        assert!(!status.can_enter);
    }

    #[test]
    fn test_requests_alternate_between_two_nodes() {
        let cluster = Cluster::new(2);
        for round in 0..5 {
            let first = if round % 2 == 0 { 1 } else { 2 };
            cluster.node(first).request_entry().unwrap();
            cluster.deliver_all();
            cluster.node(first).enter().unwrap();
            assert_eq!(cluster.held().len(), 1);
            cluster.node(first).release_entry().unwrap();
            cluster.deliver_all();
        }
        assert_eq!(cluster.events.entry_order().len(), 5);
        assert!(cluster.nodes.values().all(|c| c.status().queue.is_empty()));
    }

    #[test]
    fn test_max_timestamp_message_rejected_without_mutation() {
        let cluster = Cluster::new(2);
        cluster.node(1).request_entry().unwrap();
        let before = cluster.node(2).status();

        let hostile = Message::new(id(1), u64::MAX, MessageKind::Request, "Requesting CS");
        assert!(matches!(
            cluster.node(2).on_message(&hostile),
            Err(CoordinatorError::ClockExhausted(_))
        ));
        assert!(!dispatch_frame(cluster.node(2), &codec::encode(&hostile)));

        assert_eq!(cluster.node(2).status(), before);
        assert_eq!(cluster.in_flight().len(), 1, "only node 1's REQUEST");
    }

    #[test]
    fn test_request_refused_when_clock_cannot_cover_release() {
        let cluster = Cluster::with_clocks(&[u64::MAX - 1, u64::MAX - 1]);

        assert!(matches!(
            cluster.node(2).request_entry(),
            Err(CoordinatorError::ClockExhausted(_))
        ));
        assert_eq!(cluster.node(2).state(), CoordinatorState::Idle);
        assert_eq!(cluster.node(2).clock(), u64::MAX - 1);
        assert!(cluster.in_flight().is_empty());
    }

    #[test]
    fn test_clock_near_exhaustion_never_admits_two_holders() {
        let start = u64::MAX - 8;
        let cluster = Cluster::with_clocks(&[start, start]);

        cluster.node(2).request_entry().unwrap();
        assert_eq!(cluster.deliver_all_counting_drops(), 0);
        cluster.node(2).enter().unwrap();

        // Node 2 has no room left to answer this request.
        cluster.node(1).request_entry().unwrap();
        assert_eq!(cluster.deliver_all_counting_drops(), 1);
        assert!(!cluster.node(1).can_enter());
        assert_eq!(cluster.held(), vec![id(2)]);

        let released = cluster.node(2).release_entry().unwrap();
        assert!(released > cluster.node(1).status().request.unwrap().timestamp);
        cluster.deliver_all_counting_drops();
        assert!(!cluster.node(1).can_enter());
        assert!(cluster.held().is_empty());
    }
}
