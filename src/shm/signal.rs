//! Per-core signal queues
//!
//! Each core can interrupt the other, and several signals may pile up while
//! one interrupt is being serviced, so every destination core owns a
//! circular log of them. The producer only writes the tail, the owning core
//! only writes the head: the indices need ordering, not a lock. Producers on
//! one core still have to be serialized among themselves, which the MCC code
//! does by enqueueing with the gate held.

use core::sync::atomic::{AtomicU32, Ordering};

use super::MAX_OUTSTANDING_SIGNALS;
use crate::error::{MccError, MccResult};
use crate::sema4::Held;
use crate::types::{CoreId, Endpoint};

// ============================================================================
// Signals
// ============================================================================

/// What happened to a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SignalKind {
    /// A buffer was queued to the destination endpoint
    BufferQueued = 0,
    /// A buffer was returned to the free pool
    BufferFreed = 1,
}

impl SignalKind {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(SignalKind::BufferQueued),
            1 => Some(SignalKind::BufferFreed),
            _ => None,
        }
    }
}

/// Notification of a buffer state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal {
    pub kind: SignalKind,
    pub destination: Endpoint,
}

impl Signal {
    pub const fn queued(destination: Endpoint) -> Self {
        Self {
            kind: SignalKind::BufferQueued,
            destination,
        }
    }

    /// Buffer freed; only the destination core matters
    pub const fn freed(core: CoreId) -> Self {
        Self {
            kind: SignalKind::BufferFreed,
            destination: Endpoint::new(core, 0, 0),
        }
    }
}

#[repr(C)]
struct SignalSlot {
    kind: AtomicU32,
    core: AtomicU32,
    node: AtomicU32,
    port: AtomicU32,
}

impl SignalSlot {
    const fn new() -> Self {
        Self {
            kind: AtomicU32::new(0),
            core: AtomicU32::new(0),
            node: AtomicU32::new(0),
            port: AtomicU32::new(0),
        }
    }
}

// ============================================================================
// Queue
// ============================================================================

/// Circular signal log of one destination core
#[repr(C)]
pub struct SignalQueue {
    head: AtomicU32,
    tail: AtomicU32,
    slots: [SignalSlot; MAX_OUTSTANDING_SIGNALS],
}

const CAPACITY: u32 = MAX_OUTSTANDING_SIGNALS as u32;

const fn advance(index: u32) -> u32 {
    (index + 1) % CAPACITY
}

impl SignalQueue {
    pub const fn new() -> Self {
        Self {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            slots: [const { SignalSlot::new() }; MAX_OUTSTANDING_SIGNALS],
        }
    }

    pub(crate) fn reset(&self) {
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
    }

    /// Head and tail, if both lie inside the ring
    fn checked_indices(&self) -> Option<(u32, u32)> {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head < CAPACITY && tail < CAPACITY).then_some((head, tail))
    }

    /// Indices usable for indexing the slots; a ring the other core left
    /// out of range is logged and emptied
    fn indices_or_reset(&self) -> (u32, u32) {
        match self.checked_indices() {
            Some(indices) => indices,
            None => {
                let (head, tail) = self.indices();
                log::error!("corrupt signal queue indices {}/{}, resetting", head, tail);
                self.reset();
                (0, 0)
            }
        }
    }

    /// Producer side: append at the tail
    pub fn enqueue(&self, signal: Signal) -> MccResult<()> {
        let (head, tail) = self.indices_or_reset();
        let next = advance(tail);
        if next == head {
            return Err(MccError::SignalQueueFull {
                core: signal.destination.core.0,
            });
        }
        let slot = &self.slots[tail as usize];
        slot.kind.store(signal.kind as u32, Ordering::Relaxed);
        slot.core.store(signal.destination.core.0, Ordering::Relaxed);
        slot.node.store(signal.destination.node, Ordering::Relaxed);
        slot.port.store(signal.destination.port, Ordering::Relaxed);
        // publishes the slot contents
        self.tail.store(next, Ordering::Release);
        Ok(())
    }

    /// Consumer side: take signals from the head until it meets the tail
    pub fn drain<'a>(&'a self, _held: &'a Held) -> Drain<'a> {
        Drain { queue: self }
    }

    /// Signals currently queued
    pub fn len(&self) -> usize {
        match self.checked_indices() {
            Some((head, tail)) => ((tail + CAPACITY - head) % CAPACITY) as usize,
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw indices, for diagnostics
    pub fn indices(&self) -> (u32, u32) {
        (
            self.head.load(Ordering::Acquire),
            self.tail.load(Ordering::Acquire),
        )
    }
}

/// Iterator returned by [`SignalQueue::drain`]
///
/// Advances the head one entry per item, so stopping early leaves the rest
/// queued.
pub struct Drain<'a> {
    queue: &'a SignalQueue,
}

impl Iterator for Drain<'_> {
    type Item = Signal;

    fn next(&mut self) -> Option<Signal> {
        loop {
            let (head, tail) = self.queue.indices_or_reset();
            if head == tail {
                return None;
            }
            let slot = &self.queue.slots[head as usize];
            let raw_kind = slot.kind.load(Ordering::Relaxed);
            let destination = Endpoint::new(
                CoreId(slot.core.load(Ordering::Relaxed)),
                slot.node.load(Ordering::Relaxed),
                slot.port.load(Ordering::Relaxed),
            );
            // hands the slot back to the producer
            self.queue.head.store(advance(head), Ordering::Release);

            match SignalKind::from_raw(raw_kind) {
                Some(kind) => return Some(Signal { kind, destination }),
                None => log::warn!("dropping signal of unknown type {}", raw_kind),
            }
        }
    }
}
