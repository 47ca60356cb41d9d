//! # lamport-core
//!
//! Decentralised mutual exclusion for a fixed set of peers, using
//! Lamport's logical clock. Provides the clock, the wire codec, the
//! totally ordered request queue, reply-quorum tracking and the
//! coordinator state machine, plus pluggable transport and event-log
//! backends.

pub mod clock;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod infrastructure;
#[path = "infrastructure_in_memory.rs"]
pub mod infrastructure_in_memory;
#[cfg(feature = "sqlite")]
#[path = "infrastructure_sqlite.rs"]
pub mod infrastructure_sqlite;
pub mod node;
pub mod queue;
pub mod quorum;
pub mod types;

#[cfg(test)]
mod coordinator_test;
#[cfg(test)]
mod node_test;
