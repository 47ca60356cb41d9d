use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::types::{NodeId, RequestEntry};

/// Pending critical-section requests in `(timestamp, owner)` order.
///
/// Min-heap: the entry with the lowest timestamp is at the head, and on
/// equal timestamps the lowest node id. The coordinator serializes all
/// access, so the queue itself is not thread-safe.
#[derive(Debug, Clone, Default)]
pub struct RequestQueue {
    heap: BinaryHeap<Reverse<RequestEntry>>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: RequestEntry) {
        self.heap.push(Reverse(entry));
    }

    pub fn peek_min(&self) -> Option<RequestEntry> {
        self.heap.peek().map(|Reverse(entry)| *entry)
    }

    pub fn pop(&mut self) -> Option<RequestEntry> {
        self.heap.pop().map(|Reverse(entry)| entry)
    }

    /// Removes the earliest entry owned by `owner`. At most one entry is
    /// removed; a missing owner is a no-op.
    pub fn remove_by_owner(&mut self, owner: NodeId) -> Option<RequestEntry> {
        let position = self
            .heap
            .iter()
            .enumerate()
            .filter(|(_, Reverse(entry))| entry.owner == owner)
            .min_by_key(|(_, Reverse(entry))| *entry)
            .map(|(index, _)| index)?;

        let mut entries = std::mem::take(&mut self.heap).into_vec();
        let Reverse(removed) = entries.swap_remove(position);
        self.heap = BinaryHeap::from(entries);
        Some(removed)
    }

    pub fn contains_owner(&self, owner: NodeId) -> bool {
        self.heap.iter().any(|Reverse(entry)| entry.owner == owner)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// All entries, head first.
    pub fn snapshot(&self) -> Vec<RequestEntry> {
        let mut entries: Vec<RequestEntry> =
            self.heap.iter().map(|Reverse(entry)| *entry).collect();
        entries.sort();
        entries
    }
}
