use std::collections::BTreeMap;

use crate::types::NodeId;

/// Which peers have replied to the current own request.
///
/// Reset once per `request_entry`; the epoch is implicit.
#[derive(Debug, Clone, Default)]
pub struct ReplyQuorum {
    replied: BTreeMap<NodeId, bool>,
}

impl ReplyQuorum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track exactly `peers`, none of which has replied yet.
    pub fn reset_for(&mut self, peers: impl IntoIterator<Item = NodeId>) {
        self.replied = peers.into_iter().map(|peer| (peer, false)).collect();
    }

    /// Returns `false` if `peer` is not tracked in this epoch.
    pub fn mark_replied(&mut self, peer: NodeId) -> bool {
        match self.replied.get_mut(&peer) {
            Some(flag) => {
                *flag = true;
                true
            }
            None => false,
        }
    }

    /// Vacuously true for an empty peer set.
    pub fn all_replied(&self) -> bool {
        self.replied.values().all(|replied| *replied)
    }

    /// Peers that still owe a reply, ascending.
    pub fn pending(&self) -> Vec<NodeId> {
        self.replied
            .iter()
            .filter(|(_, replied)| !**replied)
            .map(|(peer, _)| *peer)
            .collect()
    }

    pub fn tracked(&self) -> usize {
        self.replied.len()
    }
}
