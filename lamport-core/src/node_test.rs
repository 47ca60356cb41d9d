#[cfg(test)]
mod tests {
    use crate::codec;
    use crate::coordinator::{CoordinatorError, MutualExclusionCoordinator};
    use crate::events::EventSink;
    use crate::infrastructure::{Inbound, Transport};
    use crate::infrastructure_in_memory::{InMemoryNetwork, MemoryEventLog};
    use crate::node::LamportNode;
    use crate::types::{CoordinatorState, MessageKind, NodeId};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn id(n: u32) -> NodeId {
        NodeId::new(n).unwrap()
    }

    fn start_cluster(
        size: u32,
        network: &InMemoryNetwork,
        events: &Arc<MemoryEventLog>,
    ) -> Vec<Arc<LamportNode>> {
        let ids: Vec<NodeId> = (1..=size).map(id).collect();
        ids.iter()
            .map(|&node| {
                let (transport, inbound) = network.endpoint(node).unwrap();
                let coordinator = Arc::new(MutualExclusionCoordinator::new(
                    node,
                    ids.clone(),
                    Arc::new(transport),
                    Arc::clone(events) as Arc<dyn EventSink>,
                ));
                Arc::new(LamportNode::start(coordinator, inbound).unwrap())
            })
            .collect()
    }

    #[test]
    fn test_threads_never_share_the_critical_section() {
        let network = InMemoryNetwork::new((1..=3).map(id));
        let events = Arc::new(MemoryEventLog::new());
        let nodes = start_cluster(3, &network, &events);

        let occupancy = Arc::new(AtomicUsize::new(0));
        let violations = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = nodes
            .iter()
            .map(|node| {
                let node = Arc::clone(node);
                let occupancy = Arc::clone(&occupancy);
                let violations = Arc::clone(&violations);
                thread::spawn(move || {
                    for _ in 0..15 {
                        node.with_critical_section(Some(Duration::from_secs(10)), || {
                            if occupancy.fetch_add(1, Ordering::SeqCst) != 0 {
                                violations.fetch_add(1, Ordering::SeqCst);
                            }
                            thread::sleep(Duration::from_micros(200));
                            occupancy.fetch_sub(1, Ordering::SeqCst);
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(events.entry_order().len(), 45);

        network.shutdown();
        for node in nodes {
            Arc::try_unwrap(node).ok().unwrap().join().unwrap();
        }
    }

    #[test]
    fn test_acquire_times_out_when_a_peer_is_unreachable() {
        let network = InMemoryNetwork::new((1..=3).map(id));
        let events = Arc::new(MemoryEventLog::new());
        let nodes = start_cluster(3, &network, &events);
        network.isolate(id(3));

        let err = nodes[0].acquire(Some(Duration::from_millis(50))).unwrap_err();
        assert_eq!(err, CoordinatorError::QuorumTimeout { pending: vec![id(3)] });
        assert_eq!(nodes[0].coordinator().state(), CoordinatorState::Requesting);

        // The request stays outstanding; a second attempt keeps waiting on it.
        let err = nodes[0].acquire(Some(Duration::from_millis(20))).unwrap_err();
        assert!(matches!(err, CoordinatorError::QuorumTimeout { .. }));
        assert_eq!(nodes[0].coordinator().status().queue.len(), 1);

        network.shutdown();
    }

    #[test]
    fn test_acquire_while_holding_is_rejected() {
        let network = InMemoryNetwork::new((1..=2).map(id));
        let events = Arc::new(MemoryEventLog::new());
        let nodes = start_cluster(2, &network, &events);

        nodes[0].acquire(Some(Duration::from_secs(5))).unwrap();
        assert!(matches!(
            nodes[0].acquire(None),
            Err(CoordinatorError::InvalidState { operation: "acquire", state: CoordinatorState::Held })
        ));
        nodes[0].release().unwrap();
        assert!(nodes[0].release().is_err());

        network.shutdown();
    }

    #[test]
    fn test_dispatch_loop_survives_malformed_input() {
        let network = InMemoryNetwork::new((1..=2).map(id));
        let events = Arc::new(MemoryEventLog::new());

        // Node 2 is driven by hand through its raw endpoint.
        let (raw, mut raw_inbound) = network.endpoint(id(2)).unwrap();
        let (transport, inbound) = network.endpoint(id(1)).unwrap();
        let coordinator = Arc::new(MutualExclusionCoordinator::new(
            id(1),
            [id(1), id(2)],
            Arc::new(transport),
            Arc::clone(&events) as Arc<dyn EventSink>,
        ));
        let node = LamportNode::start(Arc::clone(&coordinator), inbound).unwrap();

        raw.send(id(1), b"not a message").unwrap();
        raw.send(id(1), b"Id: 2, Timestamp: 3, Type: SHOUT, Content: ").unwrap();
        raw.send(id(1), b"Id: 2, Timestamp: 3, Type: REQUEST, Content: hello").unwrap();

        let reply = raw_inbound.next_inbound().unwrap();
        let reply = codec::decode(&reply).unwrap();
        assert_eq!(reply.sender, id(1));
        assert_eq!(reply.kind, MessageKind::Reply);
        assert_eq!(coordinator.status().queue.len(), 1);

        network.shutdown();
        node.join().unwrap();
    }
}
