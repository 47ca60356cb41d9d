use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::types::Timestamp;

/// The clock cannot advance past `Timestamp::MAX`. It is left unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("logical clock exhausted at {current}")]
pub struct ClockExhausted {
    pub current: Timestamp,
}

/// Lamport logical clock.
///
/// A single atomic counter, so `tick`, `observe` and `current` are
/// linearizable when called from the dispatch loop and application
/// threads at the same time. The value never decreases and every
/// successful mutating call strictly increases it; a call that would
/// overflow fails with [`ClockExhausted`] instead.
#[derive(Debug, Default)]
pub struct LogicalClock {
    value: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(value: Timestamp) -> Self {
        Self {
            value: AtomicU64::new(value),
        }
    }

    /// Local event. Returns the post-increment value.
    pub fn tick(&self) -> Result<Timestamp, ClockExhausted> {
        self.value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_add(1))
            .map(|v| v + 1)
            .map_err(|current| ClockExhausted { current })
    }

    /// Merge a remote timestamp: `max(current, remote) + 1`.
    pub fn observe(&self, remote: Timestamp) -> Result<Timestamp, ClockExhausted> {
        self.value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                v.max(remote).checked_add(1)
            })
            .map(|v| v.max(remote) + 1)
            .map_err(|current| ClockExhausted { current })
    }

    /// True if the clock can advance `steps` times, the first advance
    /// merging `remote`.
    pub fn has_room(&self, remote: Timestamp, steps: u64) -> bool {
        self.current().max(remote).checked_add(steps).is_some()
    }

    pub fn current(&self) -> Timestamp {
        self.value.load(Ordering::SeqCst)
    }
}
