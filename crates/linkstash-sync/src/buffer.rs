//! # Change Stream Buffer
//!
//! Holds change events that arrive while the snapshot is loading, then
//! replays them once the snapshot is in place.
//!
//! ## Buffer Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Change Stream Buffer                                 │
//! │                                                                         │
//! │  subscribe ──► BUFFERING ──── drain_in_order() ────► BYPASSED          │
//! │                   │                                      │              │
//! │   offer(e): push e in arrival order        offer(e): hand e back       │
//! │                                             for direct apply           │
//! │                   ▲                                      │              │
//! │                   └────────────── rearm() ───────────────┘              │
//! │                        (resubscribe after disconnect)                   │
//! │                                                                         │
//! │  WHY: the snapshot read and the subscription are not one transaction. │
//! │  A change committed in between can be in the snapshot, in the stream,  │
//! │  in both, or in neither at the instant of transition. Buffer + the     │
//! │  version gate turn that race into convergence.                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Events are ordered by arrival, not by their `sequence` hint.

use std::collections::VecDeque;
use tracing::{debug, warn};

use linkstash_core::ChangeEvent;

/// Arrival-ordered buffer in front of the apply path.
#[derive(Debug)]
pub struct ChangeStreamBuffer {
    events: VecDeque<ChangeEvent>,
    capacity: usize,
    ready: bool,
    dropped: u64,
}

impl ChangeStreamBuffer {
    /// Creates a buffer in buffering mode.
    pub fn new(capacity: usize) -> Self {
        ChangeStreamBuffer {
            events: VecDeque::new(),
            capacity: capacity.max(1),
            ready: false,
            dropped: 0,
        }
    }

    /// Appends an event while not ready.
    ///
    /// When full, the oldest event is discarded and counted in
    /// [`Self::dropped`].
    pub fn buffer(&mut self, event: ChangeEvent) {
        debug_assert!(!self.ready, "buffer() called after drain");

        if self.events.len() >= self.capacity {
            if let Some(oldest) = self.events.pop_front() {
                self.dropped += 1;
                warn!(
                    record_id = %oldest.record_id(),
                    capacity = self.capacity,
                    "Change buffer full, dropping oldest event"
                );
            }
        }

        debug!(
            record_id = %event.record_id(),
            kind = %event.kind(),
            sequence = ?event.sequence(),
            buffered = self.events.len() + 1,
            "Buffered change event"
        );
        self.events.push_back(event);
    }

    /// Buffers the event when not ready; hands it back when bypassed.
    pub fn offer(&mut self, event: ChangeEvent) -> Option<ChangeEvent> {
        if self.ready {
            Some(event)
        } else {
            self.buffer(event);
            None
        }
    }

    /// Returns buffered events in arrival order and switches to bypass.
    ///
    /// Called once per ready transition. A second call returns nothing.
    pub fn drain_in_order(&mut self) -> Vec<ChangeEvent> {
        if self.ready {
            return Vec::new();
        }
        self.ready = true;
        self.events.drain(..).collect()
    }

    /// Returns to buffering mode, discarding any history.
    pub fn rearm(&mut self) {
        self.events.clear();
        self.ready = false;
        self.dropped = 0;
    }

    /// Events discarded due to overflow since the last rearm.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Discards everything (session close).
    pub fn clear(&mut self) {
        self.events.clear();
        self.dropped = 0;
    }
}
