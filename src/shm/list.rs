//! Singly linked buffer lists in shared memory
//!
//! Used for the free pool and for every endpoint's receive queue. Links are
//! physical addresses stored in the buffers themselves; every operation
//! needs the gate held, which the [`Held`] argument proves.

use core::sync::atomic::{AtomicU32, Ordering};

use super::{ShmView, NUM_BUFFERS};
use crate::sema4::Held;
use crate::types::PhysAddr;

/// Head/tail pair of a buffer list
#[repr(C)]
pub struct ReceiveList {
    head: AtomicU32,
    tail: AtomicU32,
}

impl ReceiveList {
    pub const fn new() -> Self {
        Self {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }

    pub(crate) fn reset(&self) {
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
    }

    pub fn head(&self, _held: &Held) -> PhysAddr {
        PhysAddr(self.head.load(Ordering::Relaxed))
    }

    pub fn tail(&self, _held: &Held) -> PhysAddr {
        PhysAddr(self.tail.load(Ordering::Relaxed))
    }

    pub fn is_empty(&self, held: &Held) -> bool {
        self.head(held).is_null()
    }

    /// Append a buffer at the tail
    pub fn push_back(&self, view: &ShmView<'_>, _held: &Held, phys: PhysAddr) {
        let Ok(rb) = view.translate(phys) else {
            log::error!("refusing to link foreign address {}", phys);
            return;
        };
        rb.next.store(0, Ordering::Relaxed);

        let tail = PhysAddr(self.tail.load(Ordering::Relaxed));
        match view.translate(tail) {
            Ok(last) if !tail.is_null() => last.next.store(phys.0, Ordering::Relaxed),
            _ => self.head.store(phys.0, Ordering::Relaxed),
        }
        self.tail.store(phys.0, Ordering::Relaxed);
    }

    /// Unlink the buffer at the head
    pub fn pop_front(&self, view: &ShmView<'_>, _held: &Held) -> Option<PhysAddr> {
        let head = PhysAddr(self.head.load(Ordering::Relaxed));
        if head.is_null() {
            return None;
        }
        let rb = match view.translate(head) {
            Ok(rb) => rb,
            Err(e) => {
                log::error!("corrupt list head: {}", e);
                self.reset();
                return None;
            }
        };
        let next = rb.next.load(Ordering::Relaxed);
        self.head.store(next, Ordering::Relaxed);
        if next == 0 {
            self.tail.store(0, Ordering::Relaxed);
        }
        rb.next.store(0, Ordering::Relaxed);
        Some(head)
    }

    /// Number of linked buffers
    ///
    /// Stops after [`NUM_BUFFERS`] links, so a cycle cannot hang the
    /// caller while it holds the gate.
    pub fn len(&self, view: &ShmView<'_>, _held: &Held) -> usize {
        let mut count = 0;
        let mut cur = PhysAddr(self.head.load(Ordering::Relaxed));
        while let Ok(rb) = view.translate(cur) {
            if count == NUM_BUFFERS {
                log::error!("buffer list longer than the pool, links form a cycle");
                break;
            }
            count += 1;
            cur = PhysAddr(rb.next.load(Ordering::Relaxed));
        }
        count
    }
}
