//! Hardware semaphore gate protecting the shared bookkeeping
//!
//! Both cores serialize every access to the free pool and the endpoint
//! receive lists through one gate. The gate only offers try-lock/unlock:
//! the interrupt path must never spin on it. Task context spins, but first
//! masks the local doorbell interrupt, otherwise the interrupt path could
//! preempt the lock holder on the same core and fail its try-lock forever.

use alloc::sync::Arc;
use core::ops::Deref;
use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::types::CoreId;

// ============================================================================
// Contracts
// ============================================================================

/// Cross-core mutual exclusion primitive
pub trait HwSemaphore: Send + Sync {
    /// Take the gate if it is free; never blocks
    fn try_lock(&self) -> bool;

    /// Release a gate taken by this core
    fn unlock(&self);
}

/// Local interrupt source that must stay quiet while a task holds the gate
pub trait InterruptMask {
    fn mask(&self);
    fn unmask(&self);
}

// ============================================================================
// Atomic Gate
// ============================================================================

const GATE_FREE: u32 = 0;

/// Gate register emulated with compare-and-swap
///
/// Holds the owning core number plus one, zero when free. Both cores share
/// one instance through [`GateHandle`]s.
#[derive(Debug, Default)]
pub struct AtomicGate {
    owner: AtomicU32,
}

impl AtomicGate {
    pub const fn new() -> Self {
        Self {
            owner: AtomicU32::new(GATE_FREE),
        }
    }

    /// Core currently holding the gate
    pub fn owner(&self) -> Option<CoreId> {
        match self.owner.load(Ordering::Relaxed) {
            GATE_FREE => None,
            tag => Some(CoreId(tag - 1)),
        }
    }

    /// Handle through which `core` takes the gate
    pub fn handle(self: &Arc<Self>, core: CoreId) -> GateHandle {
        GateHandle {
            gate: Arc::clone(self),
            core,
        }
    }
}

/// One core's view of an [`AtomicGate`]
#[derive(Debug, Clone)]
pub struct GateHandle {
    gate: Arc<AtomicGate>,
    core: CoreId,
}

impl GateHandle {
    pub fn gate(&self) -> &AtomicGate {
        &self.gate
    }
}

impl HwSemaphore for GateHandle {
    fn try_lock(&self) -> bool {
        self.gate
            .owner
            .compare_exchange(GATE_FREE, self.core.0 + 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self) {
        if self
            .gate
            .owner
            .compare_exchange(self.core.0 + 1, GATE_FREE, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            log::error!("{} released a gate it does not hold", self.core);
        }
    }
}

// ============================================================================
// SEMA4 Gate
// ============================================================================

/// One byte-wide gate of a memory-mapped SEMA4 block
///
/// Writing the domain number plus one to a free gate locks it; reading it
/// back tells whether the write won. Writing zero frees it.
#[derive(Debug)]
pub struct Sema4Mmio {
    gate_addr: usize,
    tag: u8,
}

impl Sema4Mmio {
    /// # Safety
    ///
    /// `gate_addr` must map the gate register for the lifetime of the value.
    pub const unsafe fn new(gate_addr: usize, domain: u8) -> Self {
        Self {
            gate_addr,
            tag: domain + 1,
        }
    }
}

impl HwSemaphore for Sema4Mmio {
    fn try_lock(&self) -> bool {
        let gate = self.gate_addr as *mut u8;
        unsafe {
            write_volatile(gate, self.tag);
            read_volatile(gate) == self.tag
        }
    }

    fn unlock(&self) {
        unsafe { write_volatile(self.gate_addr as *mut u8, 0) }
    }
}

// ============================================================================
// Gate
// ============================================================================

/// Proof that the gate is held, required by the shared-list operations
#[derive(Debug)]
pub struct Held {
    _priv: (),
}

/// The subsystem-wide gate of one core
pub struct Gate<S> {
    sema: S,
    /// Number of tasks inside `lock`; the doorbell stays masked while > 0
    masked: Mutex<usize>,
}

impl<S: HwSemaphore> Gate<S> {
    pub fn new(sema: S) -> Self {
        Self {
            sema,
            masked: Mutex::new(0),
        }
    }

    pub fn semaphore(&self) -> &S {
        &self.sema
    }

    /// Interrupt-context acquisition: one attempt, no masking
    pub fn try_lock(&self) -> Option<GateGuard<'_, S>> {
        if self.sema.try_lock() {
            Some(GateGuard {
                gate: self,
                mask: None,
                held: Held { _priv: () },
            })
        } else {
            None
        }
    }

    /// Task-context acquisition
    ///
    /// Masks `irq` (nesting with other local tasks), then spins on the gate
    /// calling `relax` between attempts.
    pub fn lock<'a>(&'a self, irq: &'a dyn InterruptMask, relax: impl Fn()) -> GateGuard<'a, S> {
        {
            let mut depth = self.masked.lock();
            if *depth == 0 {
                irq.mask();
            }
            *depth += 1;
        }
        while !self.sema.try_lock() {
            relax();
        }
        GateGuard {
            gate: self,
            mask: Some(irq),
            held: Held { _priv: () },
        }
    }
}

/// Held gate; releases (and unmasks, for task holders) on drop
pub struct GateGuard<'a, S: HwSemaphore> {
    gate: &'a Gate<S>,
    mask: Option<&'a dyn InterruptMask>,
    held: Held,
}

impl<S: HwSemaphore> Deref for GateGuard<'_, S> {
    type Target = Held;

    fn deref(&self) -> &Held {
        &self.held
    }
}

impl<S: HwSemaphore> Drop for GateGuard<'_, S> {
    fn drop(&mut self) {
        self.gate.sema.unlock();
        if let Some(irq) = self.mask {
            let mut depth = self.gate.masked.lock();
            *depth -= 1;
            if *depth == 0 {
                irq.unmask();
            }
        }
    }
}
