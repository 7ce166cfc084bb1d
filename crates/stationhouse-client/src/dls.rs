//! Dead-letter buffer.
//!
//! Messages that arrive on a consumer's dead-letter subscription while no
//! DLS listener is registered are parked here until the next `fetch`.
//! The buffer is bounded: pushing onto a full buffer evicts the oldest entry.

use crate::message::StationMessage;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::warn;

/// Default number of buffered dead-letter messages per consumer.
pub const DEFAULT_DLS_BUFFER_CAPACITY: usize = 10_000;

/// Bounded FIFO with drop-oldest overflow.
#[derive(Debug)]
pub struct DeadLetterBuffer<T = StationMessage> {
    capacity: usize,
    entries: Mutex<VecDeque<T>>,
}

impl<T> DeadLetterBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a message, returning the evicted one if the buffer was full.
    pub fn push(&self, message: T) -> Option<T> {
        let mut entries = self.lock();
        let evicted = if entries.len() >= self.capacity {
            entries.pop_front()
        } else {
            None
        };
        entries.push_back(message);

        if evicted.is_some() {
            warn!(
                capacity = self.capacity,
                "Dead-letter buffer full, dropped oldest message"
            );
        }
        evicted
    }

    /// Remove up to `max` messages from the front.
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut entries = self.lock();
        let take = max.min(entries.len());
        entries.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> Default for DeadLetterBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_DLS_BUFFER_CAPACITY)
    }
}
