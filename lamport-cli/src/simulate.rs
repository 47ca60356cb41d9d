//! In-process cluster run: every node acquires and releases the critical
//! section `rounds` times over the in-memory network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, ensure, Context};

use lamport_core::coordinator::MutualExclusionCoordinator;
use lamport_core::events::CoordinatorEvent;
use lamport_core::infrastructure_in_memory::{InMemoryNetwork, MemoryEventLog};
use lamport_core::node::LamportNode;
use lamport_core::types::NodeId;

/// Generous; a healthy in-memory cluster never gets close.
const ROUND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct SimulationReport {
    pub entry_order: Vec<NodeId>,
    pub messages: usize,
    pub elapsed: Duration,
}

pub fn run(nodes: u32, rounds: usize) -> anyhow::Result<SimulationReport> {
    ensure!(nodes > 0, "a cluster needs at least one node");

    let ids: Vec<NodeId> = (1..=nodes).filter_map(NodeId::new).collect();
    let network = InMemoryNetwork::new(ids.iter().copied());
    let events = Arc::new(MemoryEventLog::new());

    let mut members = Vec::with_capacity(ids.len());
    for &id in &ids {
        let (transport, inbound) = network
            .endpoint(id)
            .with_context(|| format!("node {} missing from the network", id))?;
        let coordinator =
            MutualExclusionCoordinator::new(id, ids.clone(), Arc::new(transport), events.clone());
        let node = LamportNode::start(Arc::new(coordinator), inbound)
            .with_context(|| format!("failed to start node {}", id))?;
        members.push(Arc::new(node));
    }

    let occupancy = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    let workers: Vec<_> = members
        .iter()
        .map(|node| {
            let node = Arc::clone(node);
            let occupancy = Arc::clone(&occupancy);
            let overlaps = Arc::clone(&overlaps);
            thread::spawn(move || {
                for _ in 0..rounds {
                    node.with_critical_section(Some(ROUND_TIMEOUT), || {
                        if occupancy.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        thread::yield_now();
                        occupancy.fetch_sub(1, Ordering::SeqCst);
                    })?;
                }
                Ok::<_, lamport_core::coordinator::CoordinatorError>(())
            })
        })
        .collect();

    let mut outcome = Ok(());
    for worker in workers {
        let result = worker
            .join()
            .map_err(|_| anyhow!("simulation worker panicked"))
            .and_then(|r| r.map_err(anyhow::Error::from));
        if outcome.is_ok() {
            outcome = result;
        }
    }
    let elapsed = started.elapsed();

    network.shutdown();
    for node in members {
        if let Ok(node) = Arc::try_unwrap(node) {
            if node.join().is_err() {
                tracing::warn!("dispatch thread panicked");
            }
        }
    }
    outcome?;

    let overlaps = overlaps.load(Ordering::SeqCst);
    ensure!(
        overlaps == 0,
        "mutual exclusion violated: {} overlapping entries",
        overlaps
    );

    let messages = events
        .events()
        .iter()
        .filter(|e| matches!(e.event, CoordinatorEvent::MessageSent { .. }))
        .count();

    Ok(SimulationReport {
        entry_order: events.entry_order(),
        messages,
        elapsed,
    })
}
