//! Processor recycling
//!
//! Finished processors are parked in a lock-free queue so the next
//! connection can reuse them instead of allocating carriers and codec
//! buffers again.
//!
//! | `processor_cache` | Storage | Behaviour |
//! |-------------------|---------|-----------|
//! | `Some(0)` | none | every push is rejected |
//! | `Some(n)` | `ArrayQueue` | push rejected once `n` are parked |
//! | `None` | `SegQueue` | unbounded |

use crate::processor::{Processor, ProtocolProcessor};
use crate::stats::RequestGroupInfo;
use crossbeam::queue::{ArrayQueue, SegQueue};
use std::sync::Arc;
use tracing::{debug, warn};

enum Slots {
    Disabled,
    Bounded(ArrayQueue<ProtocolProcessor>),
    Unbounded(SegQueue<ProtocolProcessor>),
}

/// Pool of idle processors owned by one connection handler.
pub struct RecycledProcessors {
    slots: Slots,
    global: Arc<RequestGroupInfo>,
}

impl RecycledProcessors {
    pub fn new(capacity: Option<usize>, global: Arc<RequestGroupInfo>) -> Self {
        let slots = match capacity {
            Some(0) => Slots::Disabled,
            Some(n) => Slots::Bounded(ArrayQueue::new(n)),
            None => Slots::Unbounded(SegQueue::new()),
        };
        Self { slots, global }
    }

    /// Park a processor for reuse.
    ///
    /// Returns `false` when the pool is full; the processor's statistics are
    /// then rolled into the connector totals and it is dropped.
    pub fn push(&self, processor: ProtocolProcessor) -> bool {
        let rejected = match &self.slots {
            Slots::Disabled => Some(processor),
            Slots::Bounded(queue) => queue.push(processor).err(),
            Slots::Unbounded(queue) => {
                queue.push(processor);
                None
            }
        };

        match rejected {
            None => true,
            Some(processor) => {
                debug!(processor = %processor.id(), "processor pool full, discarding");
                if let Some(info) = processor.request_info() {
                    self.global.unregister(&info);
                }
                false
            }
        }
    }

    /// Take an idle processor, if any.
    pub fn pop(&self) -> Option<ProtocolProcessor> {
        match &self.slots {
            Slots::Disabled => None,
            Slots::Bounded(queue) => queue.pop(),
            Slots::Unbounded(queue) => queue.pop(),
        }
    }

    pub fn len(&self) -> usize {
        match &self.slots {
            Slots::Disabled => 0,
            Slots::Bounded(queue) => queue.len(),
            Slots::Unbounded(queue) => queue.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> Option<usize> {
        match &self.slots {
            Slots::Disabled => Some(0),
            Slots::Bounded(queue) => Some(queue.capacity()),
            Slots::Unbounded(_) => None,
        }
    }

    /// Drop every parked processor, keeping their statistics.
    pub fn clear(&self) {
        let mut dropped = 0usize;
        while let Some(processor) = self.pop() {
            if let Some(info) = processor.request_info() {
                self.global.unregister(&info);
            }
            dropped += 1;
        }
        if dropped > 0 {
            warn!(dropped, "cleared processor pool");
        }
    }
}

impl std::fmt::Debug for RecycledProcessors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecycledProcessors")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
