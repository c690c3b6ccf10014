//! Bounded, drop-oldest frame queue
//!
//! Producers never block: a push into a full queue evicts the oldest entry.
//! The single consumer (the target worker) waits with a timeout so it can
//! observe cancellation while idle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use contracts::Frame;
use ringbuf::{traits::*, HeapRb};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Queue entry
#[derive(Debug, Clone)]
pub struct QueuedFrame {
    /// Shared with every target the frame was fanned out to
    pub frame: Arc<Frame>,
    pub enqueued_at: Instant,
}

impl QueuedFrame {
    pub fn new(frame: Arc<Frame>) -> Self {
        Self {
            frame,
            enqueued_at: Instant::now(),
        }
    }
}

/// Result of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    /// The new frame is in the queue
    pub accepted: bool,
    /// An old frame was evicted to make room
    pub evicted: bool,
}

/// FIFO of frames with fixed capacity
pub struct FrameQueue {
    ring: Mutex<HeapRb<QueuedFrame>>,
    notify: Notify,
    capacity: usize,
}

impl std::fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(HeapRb::new(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    fn ring(&self) -> MutexGuard<'_, HeapRb<QueuedFrame>> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ring().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring().is_empty()
    }

    /// Insert without blocking, evicting the oldest entry if full
    pub fn push(&self, entry: QueuedFrame) -> PushOutcome {
        let outcome = {
            let mut ring = self.ring();
            let evicted = ring.is_full() && ring.try_pop().is_some();
            let accepted = ring.try_push(entry).is_ok();
            PushOutcome { accepted, evicted }
        };
        if outcome.accepted {
            self.notify.notify_one();
        }
        outcome
    }

    pub fn try_pop(&self) -> Option<QueuedFrame> {
        self.ring().try_pop()
    }

    /// Pop the oldest entry, waiting at most `wait` for one to arrive
    pub async fn pop_timeout(&self, wait: Duration) -> Option<QueuedFrame> {
        if let Some(entry) = self.try_pop() {
            return Some(entry);
        }
        let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        self.try_pop()
    }

    /// Event tags currently queued, oldest first
    pub fn events(&self) -> Vec<String> {
        self.ring()
            .iter()
            .map(|entry| entry.frame.event.clone())
            .collect()
    }
}
