//! Platform services consumed by the MCC core
//!
//! Time, delays and cache maintenance come from the surrounding system, as
//! do the wait conditions blocking tasks sleep on. The conditions are
//! level-triggered and broadcast: every waiter wakes on each raise and must
//! re-check what it was waiting for.

use core::time::Duration;

// ============================================================================
// Wait Events
// ============================================================================

/// Broadcast wait condition with a pending flag
///
/// `raise` sets the flag, advances the generation and wakes every waiter.
/// Waiters capture [`generation`](Self::generation) before checking their
/// predicate and sleep until it moves, so a raise between the check and the
/// sleep is never lost.
pub trait WaitEvent: Send + Sync {
    fn new() -> Self
    where
        Self: Sized;

    /// Current generation, bumped by every raise
    fn generation(&self) -> u64;

    /// Set the flag and wake all waiters
    fn raise(&self);

    /// Reset the flag after a waiter found nothing to take
    fn clear(&self);

    fn is_raised(&self) -> bool;

    /// Sleep until the generation differs from `seen` or `timeout` elapsed
    ///
    /// Returns true when woken by a raise.
    fn wait_since(&self, seen: u64, timeout: Duration) -> bool;
}

// ============================================================================
// Platform
// ============================================================================

/// Clock, delay and cache services of one core
pub trait Platform: Send + Sync {
    type Event: WaitEvent;

    /// Monotonic time since an arbitrary origin
    fn now(&self) -> Duration;

    /// Sleeping delay, only called from task context
    fn delay(&self, d: Duration);

    /// Back-off inside busy-wait loops
    fn relax(&self) {
        core::hint::spin_loop();
    }

    /// Drop stale cache lines before reading memory the peer may have written
    fn dcache_invalidate(&self, _addr: *const u8, _len: usize) {}

    /// Write back local modifications so the peer observes them
    fn dcache_flush(&self, _addr: *const u8, _len: usize) {}

    /// Mask this core's interrupts; returns whether they were enabled
    ///
    /// Must nest: a call while already masked returns false and the
    /// matching restore leaves them masked.
    fn disable_local_irqs(&self) -> bool;

    /// Undo the [`disable_local_irqs`](Self::disable_local_irqs) call that
    /// returned `was_enabled`
    fn restore_local_irqs(&self, was_enabled: bool);

    /// Run `f` with this core's interrupts masked
    ///
    /// State shared between task context and the interrupt handler is only
    /// touched in here, never under a lock the handler could spin on.
    fn without_irqs<T>(&self, f: impl FnOnce() -> T) -> T
    where
        Self: Sized,
    {
        let was_enabled = self.disable_local_irqs();
        let out = f();
        self.restore_local_irqs(was_enabled);
        out
    }
}

// ============================================================================
// Host implementation
// ============================================================================

#[cfg(feature = "std")]
pub use self::host::{StdEvent, StdPlatform};

#[cfg(feature = "std")]
mod host {
    use super::{Platform, WaitEvent};
    use core::time::Duration;
    use std::cell::Cell;
    use std::sync::{Condvar, Mutex, OnceLock};
    use std::thread::{self, ThreadId};
    use std::time::Instant;

    /// [`WaitEvent`] over a std mutex and condition variable
    #[derive(Debug, Default)]
    pub struct StdEvent {
        state: Mutex<EventState>,
        cond: Condvar,
    }

    #[derive(Debug, Default)]
    struct EventState {
        raised: bool,
        generation: u64,
    }

    impl StdEvent {
        fn state(&self) -> std::sync::MutexGuard<'_, EventState> {
            // A panicking waiter cannot leave the state inconsistent.
            self.state.lock().unwrap_or_else(|e| e.into_inner())
        }
    }

    impl WaitEvent for StdEvent {
        fn new() -> Self {
            Self::default()
        }

        fn generation(&self) -> u64 {
            self.state().generation
        }

        fn raise(&self) {
            let mut st = self.state();
            st.raised = true;
            st.generation = st.generation.wrapping_add(1);
            drop(st);
            self.cond.notify_all();
        }

        fn clear(&self) {
            self.state().raised = false;
        }

        fn is_raised(&self) -> bool {
            self.state().raised
        }

        fn wait_since(&self, seen: u64, timeout: Duration) -> bool {
            let st = self.state();
            let (st, _) = self
                .cond
                .wait_timeout_while(st, timeout, |st| st.generation == seen)
                .unwrap_or_else(|e| e.into_inner());
            st.generation != seen
        }
    }

    /// Host platform: wall clock from [`Instant`], sleeping delays,
    /// yielding back-off and coherent memory
    #[derive(Debug, Clone, Copy, Default)]
    pub struct StdPlatform;

    fn origin() -> Instant {
        static ORIGIN: OnceLock<Instant> = OnceLock::new();
        *ORIGIN.get_or_init(Instant::now)
    }

    /// Interrupt masking on the host
    ///
    /// Simulated interrupt handlers run on their own threads, so masking is
    /// one process-wide lock. The owning thread may re-enter it.
    struct IrqMask {
        owner: Mutex<Option<ThreadId>>,
        released: Condvar,
    }

    fn irq_mask() -> &'static IrqMask {
        static MASK: OnceLock<IrqMask> = OnceLock::new();
        MASK.get_or_init(|| IrqMask {
            owner: Mutex::new(None),
            released: Condvar::new(),
        })
    }

    thread_local! {
        static MASK_DEPTH: Cell<usize> = const { Cell::new(0) };
    }

    impl Platform for StdPlatform {
        type Event = StdEvent;

        fn disable_local_irqs(&self) -> bool {
            let depth = MASK_DEPTH.with(Cell::get);
            if depth == 0 {
                let mask = irq_mask();
                let owner = mask.owner.lock().unwrap_or_else(|e| e.into_inner());
                let mut owner = mask
                    .released
                    .wait_while(owner, |o| o.is_some())
                    .unwrap_or_else(|e| e.into_inner());
                *owner = Some(thread::current().id());
            }
            MASK_DEPTH.with(|d| d.set(depth + 1));
            depth == 0
        }

        fn restore_local_irqs(&self, was_enabled: bool) {
            let depth = MASK_DEPTH.with(Cell::get).saturating_sub(1);
            MASK_DEPTH.with(|d| d.set(depth));
            if was_enabled && depth == 0 {
                let mask = irq_mask();
                *mask.owner.lock().unwrap_or_else(|e| e.into_inner()) = None;
                mask.released.notify_one();
            }
        }

        fn now(&self) -> Duration {
            origin().elapsed()
        }

        fn delay(&self, d: Duration) {
            std::thread::sleep(d);
        }

        fn relax(&self) {
            std::thread::yield_now();
        }
    }
}
