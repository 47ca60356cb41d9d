//! High-level node runtime: a coordinator, its transport and a dispatch
//! thread feeding inbound messages to it.
//!
//! The coordinator never blocks. `LamportNode::acquire` is the blocking
//! convenience on top: it polls `can_enter` with backoff, forever by
//! default, or until an optional deadline.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::codec;
use crate::coordinator::{CoordinatorError, MutualExclusionCoordinator};
use crate::infrastructure::Inbound;
use crate::types::CoordinatorState;

const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// Decode one payload and apply it. Returns `false` if it was dropped.
pub fn dispatch_frame(coordinator: &MutualExclusionCoordinator, payload: &[u8]) -> bool {
    let message = match codec::decode(payload) {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!(
                node = %coordinator.id(),
                error = %err,
                payload = %String::from_utf8_lossy(payload),
                "Dropping malformed message"
            );
            return false;
        }
    };

    match coordinator.on_message(&message) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(node = %coordinator.id(), error = %err, "Dropping message");
            false
        }
    }
}

/// Feed every inbound payload to the coordinator until the transport
/// closes. Bad payloads are dropped; the loop never stops on them.
pub fn dispatch_loop<I: Inbound>(coordinator: &MutualExclusionCoordinator, mut inbound: I) {
    while let Some(payload) = inbound.next_inbound() {
        dispatch_frame(coordinator, &payload);
    }
    tracing::debug!(node = %coordinator.id(), "Inbound transport closed");
}

pub struct LamportNode {
    coordinator: Arc<MutualExclusionCoordinator>,
    dispatcher: Option<JoinHandle<()>>,
}

impl LamportNode {
    /// Spawn the dispatch thread for `coordinator`.
    pub fn start<I>(coordinator: Arc<MutualExclusionCoordinator>, inbound: I) -> io::Result<Self>
    where
        I: Inbound + Send + 'static,
    {
        let worker = Arc::clone(&coordinator);
        let dispatcher = thread::Builder::new()
            .name(format!("lamport-dispatch-{}", coordinator.id()))
            .spawn(move || dispatch_loop(&worker, inbound))?;

        tracing::info!(node = %coordinator.id(), peers = coordinator.peers().len(), "Node started");

        Ok(Self {
            coordinator,
            dispatcher: Some(dispatcher),
        })
    }

    pub fn coordinator(&self) -> &Arc<MutualExclusionCoordinator> {
        &self.coordinator
    }

    /// Request the critical section (unless a request is already
    /// outstanding) and block until it is entered.
    ///
    /// With `timeout`, gives up with [`CoordinatorError::QuorumTimeout`]
    /// and leaves the request outstanding, so a later call keeps waiting
    /// on the same request.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<(), CoordinatorError> {
        match self.coordinator.state() {
            CoordinatorState::Idle => {
                self.coordinator.request_entry()?;
            }
            CoordinatorState::Requesting => {}
            state @ CoordinatorState::Held => {
                return Err(CoordinatorError::InvalidState {
                    operation: "acquire",
                    state,
                });
            }
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if self.coordinator.can_enter() {
                return self.coordinator.enter();
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let pending = self.coordinator.pending_replies();
                        tracing::warn!(node = %self.coordinator.id(), ?pending, "Gave up waiting for the critical section");
                        return Err(CoordinatorError::QuorumTimeout { pending });
                    }
                    backoff.min(deadline - now)
                }
                None => backoff,
            };
            thread::sleep(pause);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    pub fn release(&self) -> Result<(), CoordinatorError> {
        self.coordinator.release_entry().map(|_| ())
    }

    /// Acquire, run `f`, release.
    pub fn with_critical_section<T>(
        &self,
        timeout: Option<Duration>,
        f: impl FnOnce() -> T,
    ) -> Result<T, CoordinatorError> {
        self.acquire(timeout)?;
        let value = f();
        self.release()?;
        Ok(value)
    }

    /// Wait for the dispatch thread to finish. It finishes once the
    /// inbound transport is closed.
    pub fn join(mut self) -> thread::Result<()> {
        match self.dispatcher.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}
