//! Client-abort signalling.
//!
//! Streaming exports check the signal between records (a disconnected
//! client should not keep the generator pulling pages); the worker daemon
//! checks it between queue polls during shutdown. Job-row cancellation is
//! a different mechanism — that one is store-polled via
//! [`crate::engine::CancelWatch`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One-way latch shared between the triggering side (transport disconnect
/// handler, signal handler) and the polling side. Once triggered it never
/// resets. Relaxed ordering suffices: no data is published through the
/// latch, it only stops a loop.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    latch: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the signal. Idempotent.
    pub fn trigger(&self) {
        self.latch.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.latch.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_is_shared_and_one_way() {
        let signal = AbortSignal::new();
        let observer = signal.clone();
        assert!(!observer.is_aborted());

        signal.trigger();
        assert!(observer.is_aborted());

        // Triggering again changes nothing.
        signal.trigger();
        assert!(observer.is_aborted());
    }
}
