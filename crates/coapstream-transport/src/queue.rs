//! Per-session outbound queue with an at-most-one-active-drain guarantee.
//!
//! Any number of producers may push payloads; a drain loop claims the
//! write-in-progress flag with a test-and-set so only one logical drain ever
//! writes to the stream. A finishing drain re-checks the queue under
//! [`OutboundQueue::end_drain`] and reclaims the flag when new items arrived
//! meanwhile, so no enqueued payload is ever stranded.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::lock;

/// FIFO queue of opaque byte payloads plus the drain flag.
pub struct OutboundQueue {
    items: Mutex<VecDeque<Vec<u8>>>,
    draining: AtomicBool,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
        }
    }

    /// Append a payload at the tail. Safe from any thread.
    pub fn push(&self, payload: Vec<u8>) {
        lock(&self.items).push_back(payload);
    }

    /// Remove and return the head payload, if any.
    pub fn pop(&self) -> Option<Vec<u8>> {
        lock(&self.items).pop_front()
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.items).is_empty()
    }

    /// Discard all pending payloads.
    pub fn clear(&self) {
        lock(&self.items).clear();
    }

    /// Try to claim the write-in-progress flag.
    ///
    /// Returns `true` when the caller is now the active drain; `false` when
    /// another drain is already running and the caller should return at once.
    pub fn begin_drain(&self) -> bool {
        self.draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Release the flag after a drain pass.
    ///
    /// Returns `true` when payloads arrived while the drain was finishing and
    /// the caller successfully reclaimed the flag; it must then run another
    /// pass.
    pub fn end_drain(&self) -> bool {
        self.draining.store(false, Ordering::SeqCst);
        !self.is_empty() && self.begin_drain()
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}
