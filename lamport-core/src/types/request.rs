use serde::{Deserialize, Serialize};
use std::fmt;

use super::{NodeId, Timestamp};

/// A pending critical-section request, reduced to its ordering key.
///
/// Field order matters: the derived `Ord` compares `timestamp` first and
/// falls back to `owner`, so the lowest timestamp wins and equal
/// timestamps go to the lowest node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestEntry {
    pub timestamp: Timestamp,
    pub owner: NodeId,
}

impl RequestEntry {
    pub fn new(timestamp: Timestamp, owner: NodeId) -> Self {
        Self { timestamp, owner }
    }
}

impl fmt::Display for RequestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.timestamp, self.owner)
    }
}

/// Coordinator states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordinatorState {
    /// No outstanding request
    #[default]
    Idle,
    /// Own request broadcast, waiting for replies and queue head
    Requesting,
    /// Inside the critical section
    Held,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorState::Idle => write!(f, "IDLE"),
            CoordinatorState::Requesting => write!(f, "REQUESTING"),
            CoordinatorState::Held => write!(f, "HELD"),
        }
    }
}
