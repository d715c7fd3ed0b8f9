//! The MCC core of one participant
//!
//! Ties the shared region, the hardware gate and the MU doorbell together.
//! Buffers move between the free pool, endpoint receive lists and local
//! [`Buffer`] handles. Every move happens under the gate and is announced to
//! the other core through its signal queue plus the doorbell.
//!
//! Blocking calls sleep on two local wait events, one for freed buffers and
//! one for queued messages. The interrupt handler raises them after draining
//! this core's signal queue; local releases and sends raise them directly.
//! A woken waiter retakes the gate and re-checks, and losing the race for a
//! buffer simply means waiting again.

use core::fmt::Write as _;
use core::mem::size_of_val;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;

use alloc::sync::Arc;
use heapless::{Deque, String, Vec};
use spin::Mutex;

use crate::config::MccConfig;
use crate::error::{MccError, MccResult};
use crate::lpm::Handshake;
use crate::mu::{Mu, MuRegisters, ACR_RIE, ASR_GIP, ASR_RF_HANDSHAKE, LPM_HANDSHAKE_INDEX};
use crate::platform::{Platform, WaitEvent};
use crate::sema4::{Gate, GateGuard, Held, HwSemaphore};
use crate::shm::{
    Buffer, ReceiveList, SharedMemory, ShmView, Signal, SignalKind, BUFFER_SIZE, LAYOUT_VERSION,
    MAX_ENDPOINTS,
};
use crate::types::{CoreId, Endpoint, PhysAddr, Timeout};

/// Handshake words kept for a core without a [`Handshake`] attached
const CONTROL_INBOX: usize = 4;

// ============================================================================
// Reports
// ============================================================================

/// Version and identity of a running instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MccInfo {
    /// Layout version as `"MMM.mmm"`
    pub version: String<16>,
    pub core: CoreId,
    pub node: u32,
}

/// What one pass of [`Mcc::handle_interrupt`] did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IrqOutcome {
    /// A handshake word waits for [`Mcc::run_deferred_work`]
    pub deferred_work: bool,
    /// Signals drained from this core's queue
    pub signals: usize,
    /// The doorbell was pending but the other core held the gate; the
    /// interrupt stays asserted and must be serviced again
    pub retry: bool,
}

// ============================================================================
// MCC
// ============================================================================

/// One core's MCC instance
pub struct Mcc<R, S, P: Platform> {
    config: MccConfig,
    shm: Arc<SharedMemory>,
    mu: Mu<R, P>,
    gate: Gate<S>,
    freed: P::Event,
    queued: P::Event,
    lpm: Option<Handshake>,
    /// Shared with the interrupt handler, only locked with local
    /// interrupts masked
    control_words: Mutex<Deque<u32, CONTROL_INBOX>>,
    /// Endpoints created through this instance
    endpoints: Mutex<Vec<Endpoint, MAX_ENDPOINTS>>,
    initialized: AtomicBool,
}

impl<R: MuRegisters, S: HwSemaphore, P: Platform> Mcc<R, S, P> {
    pub fn new(config: MccConfig, shm: Arc<SharedMemory>, regs: R, sema: S, platform: P) -> Self {
        let mu = Mu::new(regs, platform)
            .with_send_timeout(config.send_timeout)
            .with_doorbell_polls(config.doorbell_polls, config.doorbell_poll_interval);
        Self {
            config,
            shm,
            mu,
            gate: Gate::new(sema),
            freed: WaitEvent::new(),
            queued: WaitEvent::new(),
            lpm: None,
            control_words: Mutex::new(Deque::new()),
            endpoints: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Serve the peer's low-power handshake on this core
    pub fn with_handshake(mut self, handshake: Handshake) -> Self {
        self.lpm = Some(handshake);
        self
    }

    pub fn config(&self) -> &MccConfig {
        &self.config
    }

    pub fn core(&self) -> CoreId {
        self.config.core
    }

    pub fn mu(&self) -> &Mu<R, P> {
        &self.mu
    }

    pub fn gate(&self) -> &Gate<S> {
        &self.gate
    }

    pub fn handshake(&self) -> Option<&Handshake> {
        self.lpm.as_ref()
    }

    pub fn shared_memory(&self) -> &Arc<SharedMemory> {
        &self.shm
    }

    /// Raised whenever a buffer may have returned to the pool
    pub fn freed_event(&self) -> &P::Event {
        &self.freed
    }

    /// Raised whenever a message may have arrived for a local endpoint
    pub fn queued_event(&self) -> &P::Event {
        &self.queued
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// The shared region as this core addresses it
    pub fn view(&self) -> ShmView<'_> {
        ShmView::new(&self.shm, self.config.shm_phys_base)
    }

    fn platform(&self) -> &P {
        self.mu.platform()
    }

    fn ensure_initialized(&self) -> MccResult<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(MccError::NotInitialized)
        }
    }

    /// Task-context gate acquisition with the doorbell masked
    fn lock(&self) -> GateGuard<'_, S> {
        self.gate.lock(&self.mu, || self.mu.platform().relax())
    }

    fn invalidate<T: ?Sized>(&self, v: &T) {
        self.platform()
            .dcache_invalidate(v as *const T as *const u8, size_of_val(v));
    }

    fn flush<T: ?Sized>(&self, v: &T) {
        self.platform()
            .dcache_flush(v as *const T as *const u8, size_of_val(v));
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Attach to the shared region, formatting it if nobody has yet, and
    /// unmask the MU interrupts
    pub fn init(&self) -> MccResult<()> {
        if self.is_initialized() {
            return Ok(());
        }
        {
            let held = self.lock();
            let view = self.view();
            self.invalidate(view.bookkeeping());
            if view.check_layout(&held)? {
                log::debug!("{}: shared region already formatted", self.core());
            } else {
                view.format(&held);
                self.flush(view.shm());
                log::info!(
                    "{}: formatted shared region at {:#010x}",
                    self.core(),
                    self.config.shm_phys_base
                );
            }
        }

        self.mu.enable_interrupts();
        if let (Some(hs), Some(irq)) = (&self.lpm, self.config.mu_irq) {
            hs.irq_controller().register_wake_irq(irq, true);
        }
        self.initialized.store(true, Ordering::Release);
        log::info!("{}: MU is ready for cross core communication", self.core());
        Ok(())
    }

    /// Destroy the endpoints created here and mask the MU interrupts
    pub fn shutdown(&self) {
        if !self.is_initialized() {
            return;
        }
        let local = self.endpoints.lock().clone();
        for ep in local {
            if let Err(e) = self.destroy_endpoint(ep) {
                log::warn!("{}: destroying {} on shutdown: {}", self.core(), ep, e);
            }
        }
        self.mu.disable_interrupts();
        if let (Some(hs), Some(irq)) = (&self.lpm, self.config.mu_irq) {
            hs.irq_controller().register_wake_irq(irq, false);
        }
        self.initialized.store(false, Ordering::Release);
        log::info!("{}: MCC shut down", self.core());
    }

    pub fn info(&self) -> MccInfo {
        let mut version = String::new();
        let _ = write!(
            version,
            "{:03}.{:03}",
            LAYOUT_VERSION >> 16,
            LAYOUT_VERSION & 0xFFFF
        );
        MccInfo {
            version,
            core: self.core(),
            node: self.config.node,
        }
    }

    // ========================================================================
    // Shared List Access
    // ========================================================================

    /// Unlink the head of `list`, pulling in the other core's writes first
    fn take_from(&self, held: &Held, list: &ReceiveList) -> Option<Buffer> {
        let view = self.view();
        self.invalidate(list);
        if let Ok(rb) = view.translate(list.head(held)) {
            self.invalidate(rb);
        }
        let phys = list.pop_front(&view, held)?;
        self.flush(list);
        Some(Buffer::from_phys(phys))
    }

    /// Append `phys` to `list` and write everything it touched back
    fn put_on(&self, held: &Held, list: &ReceiveList, phys: PhysAddr) -> MccResult<()> {
        let view = self.view();
        let rb = view.translate(phys)?;
        self.invalidate(list);
        let prev = view.translate(list.tail(held)).ok();
        if let Some(prev) = prev {
            self.invalidate(prev);
        }
        list.push_back(&view, held, phys);
        self.flush(rb);
        if let Some(prev) = prev {
            self.flush(prev);
        }
        self.flush(list);
        Ok(())
    }

    /// Queue `signal` for `core`; the doorbell is rung after unlocking
    fn notify(&self, _held: &Held, core: CoreId, signal: Signal) -> MccResult<()> {
        let queue = self.shm.signal_queue(core);
        self.invalidate(queue);
        queue.enqueue(signal)?;
        self.flush(queue);
        Ok(())
    }

    fn ring_doorbell(&self) {
        if let Err(e) = self.mu.trigger_doorbell() {
            // the signal stays queued and goes out with the next doorbell
            log::warn!("{}: {}", self.core(), e);
        }
    }

    /// Retry `attempt` until it yields a value or `timeout` expires
    ///
    /// The generation is captured before each attempt, so a raise that
    /// lands between a failed attempt and the sleep ends the sleep at once.
    /// Sleeps never exceed the configured wait slice.
    fn wait_for<T>(
        &self,
        event: &P::Event,
        timeout: Timeout,
        mut attempt: impl FnMut() -> MccResult<Option<T>>,
    ) -> MccResult<T> {
        let deadline = timeout.deadline(self.platform().now());
        loop {
            let seen = event.generation();
            if let Some(found) = attempt()? {
                return Ok(found);
            }
            event.clear();
            match self.next_slice(deadline) {
                Some(slice) => {
                    event.wait_since(seen, slice);
                }
                None => return Err(MccError::Timeout),
            }
        }
    }

    /// Length of the next sleep, `None` once the deadline passed
    fn next_slice(&self, deadline: Option<Duration>) -> Option<Duration> {
        let slice = self.config.wait_slice;
        match deadline {
            None => Some(slice),
            Some(deadline) => {
                let now = self.platform().now();
                if now >= deadline {
                    None
                } else {
                    Some((deadline - now).min(slice))
                }
            }
        }
    }

    // ========================================================================
    // Buffer Pool
    // ========================================================================

    /// Take a buffer from the shared free pool
    ///
    /// Blocks up to `timeout` while the pool is empty. With several
    /// waiters every release wakes all of them and at most one wins the
    /// buffer; the rest go back to sleep.
    pub fn acquire_buffer(&self, timeout: impl Into<Timeout>) -> MccResult<Buffer> {
        self.ensure_initialized()?;
        let buf = self.wait_for(&self.freed, timeout.into(), || {
            let held = self.lock();
            Ok(self.take_from(&held, &self.shm.bookkeeping.free_list))
        })?;
        log::trace!("{}: acquired {}", self.core(), buf.phys());
        Ok(buf)
    }

    /// Return a buffer to the pool and tell both cores about it
    ///
    /// A full signal queue on the other core is logged and not reported:
    /// the buffer is back in the pool either way, and the other core's
    /// waiters find it on their next wait slice.
    pub fn release_buffer(&self, buf: Buffer) -> MccResult<()> {
        self.ensure_initialized()?;
        let phys = buf.into_phys();
        let peer = self.core().other();
        let notified = {
            let held = self.lock();
            self.put_on(&held, &self.shm.bookkeeping.free_list, phys)?;
            self.notify(&held, peer, Signal::freed(peer))
        };
        self.freed.raise();
        match notified {
            Ok(()) => self.ring_doorbell(),
            Err(e) => log::warn!("{}: release of {} not announced: {}", self.core(), phys, e),
        }
        log::trace!("{}: released {}", self.core(), phys);
        Ok(())
    }

    /// Buffers currently in the free pool
    pub fn free_buffer_count(&self) -> MccResult<usize> {
        self.ensure_initialized()?;
        let held = self.lock();
        let view = self.view();
        self.invalidate(view.shm());
        Ok(view.bookkeeping().free_list.len(&view, &held))
    }

    // ========================================================================
    // Endpoints
    // ========================================================================

    fn check_local(&self, ep: Endpoint) -> MccResult<()> {
        if !ep.is_valid() || ep.core != self.core() {
            return Err(MccError::InvalidEndpoint(ep));
        }
        Ok(())
    }

    /// Register `port` on this core and node
    pub fn create_endpoint(&self, port: u32) -> MccResult<Endpoint> {
        self.ensure_initialized()?;
        let ep = Endpoint::new(self.core(), self.config.node, port);
        self.check_local(ep)?;
        {
            let held = self.lock();
            let view = self.view();
            let table = &view.bookkeeping().endpoints;
            self.invalidate(table);
            view.register_endpoint(&held, ep)?;
            self.flush(table);
        }
        // bounded by the shared table, which just accepted it
        let _ = self.endpoints.lock().push(ep);
        log::debug!("{}: endpoint {} created", self.core(), ep);
        Ok(ep)
    }

    /// Unregister a local endpoint; undelivered buffers return to the pool
    pub fn destroy_endpoint(&self, ep: Endpoint) -> MccResult<()> {
        self.ensure_initialized()?;
        self.check_local(ep)?;
        let peer = self.core().other();
        let (reclaimed, notified) = {
            let held = self.lock();
            let view = self.view();
            self.invalidate(view.shm());
            let reclaimed = view.unregister_endpoint(&held, ep)?;
            self.flush(view.shm());
            let notified = if reclaimed > 0 {
                self.notify(&held, peer, Signal::freed(peer))
            } else {
                Ok(())
            };
            (reclaimed, notified)
        };
        self.endpoints.lock().retain(|e| *e != ep);

        if reclaimed > 0 {
            self.freed.raise();
            match notified {
                Ok(()) => self.ring_doorbell(),
                Err(e) => log::warn!("{}: reclaim from {} not announced: {}", self.core(), ep, e),
            }
        }
        // receivers blocked on the endpoint re-check and see it gone
        self.queued.raise();
        log::debug!("{}: endpoint {} destroyed, {} buffers reclaimed", self.core(), ep, reclaimed);
        Ok(())
    }

    /// Queue an owned buffer on `dest`'s receive list
    ///
    /// On failure the buffer comes back with the error, still owned by the
    /// caller. A remote destination is told through its signal queue and
    /// the doorbell; a local one by raising the queued event.
    pub fn send_to_endpoint(&self, dest: Endpoint, buf: Buffer) -> Result<(), (MccError, Buffer)> {
        if let Err(e) = self.ensure_initialized() {
            return Err((e, buf));
        }
        if !dest.is_valid() {
            return Err((MccError::InvalidEndpoint(dest), buf));
        }
        let delivered = {
            let held = self.lock();
            self.deliver(&held, dest, buf.phys())
        };
        if let Err(e) = delivered {
            return Err((e, buf));
        }

        let phys = buf.into_phys();
        log::trace!("{}: {} queued to {}", self.core(), phys, dest);
        if dest.core == self.core() {
            self.queued.raise();
        } else {
            self.ring_doorbell();
        }
        Ok(())
    }

    fn deliver(&self, held: &Held, dest: Endpoint, phys: PhysAddr) -> MccResult<()> {
        let view = self.view();
        view.translate(phys)?;
        self.invalidate(&view.bookkeeping().endpoints);
        let list = view
            .endpoint_list(held, dest)
            .ok_or(MccError::EndpointNotFound(dest))?;
        if dest.core != self.core() {
            // a full queue must fail before the buffer is linked
            self.notify(held, dest.core, Signal::queued(dest))?;
        }
        self.put_on(held, list, phys)
    }

    /// Take the oldest buffer queued on a local endpoint
    ///
    /// Blocks up to `timeout` while the list is empty.
    pub fn receive_from_endpoint(
        &self,
        ep: Endpoint,
        timeout: impl Into<Timeout>,
    ) -> MccResult<Buffer> {
        self.ensure_initialized()?;
        self.check_local(ep)?;
        self.wait_for(&self.queued, timeout.into(), || {
            let held = self.lock();
            let view = self.view();
            self.invalidate(&view.bookkeeping().endpoints);
            let list = view
                .endpoint_list(&held, ep)
                .ok_or(MccError::EndpointNotFound(ep))?;
            Ok(self.take_from(&held, list))
        })
    }

    /// Messages waiting on a local endpoint
    pub fn msgs_available(&self, ep: Endpoint) -> MccResult<usize> {
        self.ensure_initialized()?;
        self.check_local(ep)?;
        let held = self.lock();
        let view = self.view();
        self.invalidate(view.shm());
        let list = view
            .endpoint_list(&held, ep)
            .ok_or(MccError::EndpointNotFound(ep))?;
        Ok(list.len(&view, &held))
    }

    // ========================================================================
    // Payloads
    // ========================================================================

    pub fn payload<'b>(&'b self, buf: &'b Buffer) -> MccResult<&'b [u8]> {
        self.view().payload(buf)
    }

    pub fn payload_mut<'b>(&'b self, buf: &'b mut Buffer) -> MccResult<&'b mut [u8]> {
        self.view().payload_mut(buf)
    }

    pub fn set_payload_len(&self, buf: &mut Buffer, len: usize) -> MccResult<()> {
        self.view().set_payload_len(buf, len)
    }

    /// Copy `data` into the buffer and set its length
    pub fn write_payload(&self, buf: &mut Buffer, data: &[u8]) -> MccResult<()> {
        if data.len() > BUFFER_SIZE {
            return Err(MccError::MessageTooLarge {
                len: data.len(),
                max: BUFFER_SIZE,
            });
        }
        self.payload_mut(buf)?[..data.len()].copy_from_slice(data);
        self.set_payload_len(buf, data.len())
    }

    /// Copying send: acquire, fill and queue a buffer in one call
    ///
    /// `timeout` bounds the wait for a free buffer.
    pub fn send(&self, dest: Endpoint, data: &[u8], timeout: impl Into<Timeout>) -> MccResult<()> {
        if data.len() > BUFFER_SIZE {
            return Err(MccError::MessageTooLarge {
                len: data.len(),
                max: BUFFER_SIZE,
            });
        }
        let mut buf = self.acquire_buffer(timeout)?;
        if let Err(e) = self.write_payload(&mut buf, data) {
            self.release_buffer(buf)?;
            return Err(e);
        }
        self.send_to_endpoint(dest, buf).or_else(|(e, buf)| {
            self.release_buffer(buf)?;
            Err(e)
        })
    }

    /// Copying receive: the message is copied into `out` and its buffer
    /// released
    ///
    /// Returns the number of bytes copied. A message longer than `out` is
    /// truncated.
    pub fn recv(&self, ep: Endpoint, out: &mut [u8], timeout: impl Into<Timeout>) -> MccResult<usize> {
        let buf = self.receive_from_endpoint(ep, timeout)?;
        let copied = self.payload(&buf).map(|data| {
            let n = data.len().min(out.len());
            if n < data.len() {
                log::warn!("{}: {} byte message truncated to {}", self.core(), data.len(), n);
            }
            out[..n].copy_from_slice(&data[..n]);
            n
        });
        self.release_buffer(buf)?;
        copied
    }

    // ========================================================================
    // Interrupt Path
    // ========================================================================

    /// MU interrupt handler
    ///
    /// Never blocks: a handshake word is captured for
    /// [`run_deferred_work`](Self::run_deferred_work), and the signal
    /// queue is drained only if the gate can be taken at the first try.
    pub fn handle_interrupt(&self) -> IrqOutcome {
        let mut outcome = IrqOutcome::default();
        let status = self.mu.status();

        // a masked receive interrupt means the previous word is still being
        // handled; the next one waits in the receive register
        if status & ASR_RF_HANDSHAKE != 0 && self.mu.control() & ACR_RIE != 0 {
            let word = self.mu.receive(LPM_HANDSHAKE_INDEX);
            match &self.lpm {
                Some(hs) => {
                    self.mu.set_receive_irq(false);
                    if !hs.capture(word) {
                        log::warn!("{}: unprocessed handshake word replaced", self.core());
                    }
                    outcome.deferred_work = true;
                }
                None => self.stash_control_word(word),
            }
        }

        if status & ASR_GIP != 0 {
            match self.gate.try_lock() {
                Some(held) => {
                    let queue = self.shm.signal_queue(self.core());
                    self.invalidate(queue);
                    for signal in queue.drain(&held) {
                        self.route(signal);
                        outcome.signals += 1;
                    }
                    self.flush(queue);
                    self.mu.clear_doorbell();
                }
                None => {
                    log::trace!("{}: {}, doorbell left pending", self.core(), MccError::MutexUnavailable);
                    outcome.retry = true;
                }
            }
        }
        outcome
    }

    fn route(&self, signal: Signal) {
        match signal.kind {
            SignalKind::BufferQueued if signal.destination.core == self.core() => {
                self.queued.raise();
            }
            SignalKind::BufferQueued => {
                log::warn!("{}: signal for {} on the wrong queue", self.core(), signal.destination);
            }
            SignalKind::BufferFreed => self.freed.raise(),
        }
    }

    fn stash_control_word(&self, word: u32) {
        let lost = self.platform().without_irqs(|| {
            let mut inbox = self.control_words.lock();
            let lost = if inbox.is_full() { inbox.pop_front() } else { None };
            let _ = inbox.push_back(word);
            lost
        });
        if let Some(lost) = lost {
            log::warn!("{}: control word {:#x} dropped", self.core(), lost);
        }
    }

    /// Oldest handshake word received while no [`Handshake`] is attached
    pub fn take_control_word(&self) -> Option<u32> {
        self.platform()
            .without_irqs(|| self.control_words.lock().pop_front())
    }

    /// Write a handshake word to the other core
    pub fn send_control_word(&self, word: u32) {
        self.mu.send(LPM_HANDSHAKE_INDEX, word);
    }

    /// Process the captured handshake word, then unmask the receive
    /// interrupt again
    ///
    /// Runs in a context that may sleep. Returns whether a word was
    /// processed.
    pub fn run_deferred_work(&self) -> bool {
        let Some(hs) = &self.lpm else {
            return false;
        };
        let handled = match hs.take_pending() {
            Some(word) => {
                hs.process(word, |ack| self.mu.send(LPM_HANDSHAKE_INDEX, ack));
                true
            }
            None => false,
        };
        self.mu.set_receive_irq(true);
        handled
    }

    /// Whether the peer last released the high-frequency bus
    pub fn peer_in_low_freq(&self) -> bool {
        self.lpm.as_ref().is_some_and(|hs| hs.peer_in_low_freq())
    }

    /// Let the peer's registered wake sources through, or block them
    pub fn set_peer_wake_irqs(&self, enable: bool) {
        if let Some(hs) = &self.lpm {
            hs.set_peer_wake_irqs(enable);
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::mu::{asr_te, ACR_GIR, MU_ACR, MU_ASR};
    use crate::platform::StdPlatform;
    use crate::sema4::{AtomicGate, GateHandle};
    use crate::shm::NUM_BUFFERS;
    use core::sync::atomic::AtomicU32;
    use std::thread;
    use std::time::Instant;

    /// MU side whose transmit registers always drain and whose doorbell
    /// requests are acknowledged at once
    #[derive(Default)]
    struct Loopback {
        acr: AtomicU32,
    }

    impl MuRegisters for Loopback {
        fn read(&self, offset: usize) -> u32 {
            match offset {
                MU_ASR => asr_te(0) | asr_te(1) | asr_te(2) | asr_te(3),
                MU_ACR => self.acr.load(Ordering::Relaxed),
                _ => 0,
            }
        }

        fn write(&self, offset: usize, value: u32) {
            if offset == MU_ACR {
                self.acr.store(value & !ACR_GIR, Ordering::Relaxed);
            }
        }
    }

    type TestMcc = Mcc<Loopback, GateHandle, StdPlatform>;

    const NOW: Timeout = Timeout::NoWait;

    fn local_mcc() -> TestMcc {
        let gate = Arc::new(AtomicGate::new());
        let cfg = MccConfig::new(CoreId::HOST).with_wait_slice(Duration::from_millis(20));
        let mcc = Mcc::new(
            cfg,
            Arc::new(SharedMemory::new()),
            Loopback::default(),
            gate.handle(CoreId::HOST),
            StdPlatform,
        );
        mcc.init().unwrap();
        mcc
    }

    #[test]
    fn test_calls_before_init_fail() {
        let gate = Arc::new(AtomicGate::new());
        let mcc: TestMcc = Mcc::new(
            MccConfig::default(),
            Arc::new(SharedMemory::new()),
            Loopback::default(),
            gate.handle(CoreId::HOST),
            StdPlatform,
        );
        assert_eq!(mcc.acquire_buffer(NOW).err(), Some(MccError::NotInitialized));
        assert_eq!(mcc.create_endpoint(1).err(), Some(MccError::NotInitialized));
    }

    #[test]
    fn test_init_formats_pool() {
        let mcc = local_mcc();
        assert_eq!(mcc.free_buffer_count(), Ok(NUM_BUFFERS));
        assert_eq!(mcc.info().version.as_str(), "002.000");

        // a second participant attaches without reformatting
        let ep = mcc.create_endpoint(1).unwrap();
        let gate = Arc::new(AtomicGate::new());
        let other: TestMcc = Mcc::new(
            MccConfig::new(CoreId::PEER),
            Arc::clone(mcc.shared_memory()),
            Loopback::default(),
            gate.handle(CoreId::PEER),
            StdPlatform,
        );
        other.init().unwrap();
        assert!(other.view().endpoint_list(&*other.gate().try_lock().unwrap(), ep).is_some());
    }

    #[test]
    fn test_acquire_timeouts() {
        let mcc = local_mcc();
        let held: std::vec::Vec<_> = (0..NUM_BUFFERS)
            .map(|_| mcc.acquire_buffer(NOW).unwrap())
            .collect();
        assert_eq!(mcc.free_buffer_count(), Ok(0));

        let start = Instant::now();
        assert_eq!(mcc.acquire_buffer(NOW).err(), Some(MccError::Timeout));
        assert!(start.elapsed() < Duration::from_millis(50));

        let start = Instant::now();
        assert_eq!(mcc.acquire_buffer(Timeout::from_millis(50)).err(), Some(MccError::Timeout));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_secs(2));

        for buf in held {
            mcc.release_buffer(buf).unwrap();
        }
        assert_eq!(mcc.free_buffer_count(), Ok(NUM_BUFFERS));
    }

    #[test]
    fn test_local_send_receive_in_order() {
        let mcc = local_mcc();
        let ep = mcc.create_endpoint(5).unwrap();
        for byte in 0..3u8 {
            mcc.send(ep, &[byte; 4], NOW).unwrap();
        }
        assert_eq!(mcc.msgs_available(ep), Ok(3));
        assert_eq!(mcc.free_buffer_count(), Ok(NUM_BUFFERS - 3));

        let mut out = [0u8; 8];
        for byte in 0..3u8 {
            assert_eq!(mcc.recv(ep, &mut out, NOW), Ok(4));
            assert_eq!(&out[..4], &[byte; 4]);
        }
        assert_eq!(mcc.recv(ep, &mut out, NOW).err(), Some(MccError::Timeout));
        assert_eq!(mcc.free_buffer_count(), Ok(NUM_BUFFERS));
    }

    #[test]
    fn test_send_failure_returns_buffer() {
        let mcc = local_mcc();
        let buf = mcc.acquire_buffer(NOW).unwrap();
        let phys = buf.phys();
        let nowhere = Endpoint::new(CoreId::PEER, 0, 9);
        let (err, buf) = mcc.send_to_endpoint(nowhere, buf).unwrap_err();
        assert_eq!(err, MccError::EndpointNotFound(nowhere));
        assert_eq!(buf.phys(), phys);

        let reserved = Endpoint::new(CoreId::PEER, 0, 0);
        let (err, buf) = mcc.send_to_endpoint(reserved, buf).unwrap_err();
        assert_eq!(err, MccError::InvalidEndpoint(reserved));
        mcc.release_buffer(buf).unwrap();
    }

    #[test]
    fn test_receive_requires_local_endpoint() {
        let mcc = local_mcc();
        let remote = Endpoint::new(CoreId::PEER, 0, 1);
        assert_eq!(
            mcc.receive_from_endpoint(remote, NOW).err(),
            Some(MccError::InvalidEndpoint(remote))
        );
        let missing = Endpoint::new(CoreId::HOST, 0, 7);
        assert_eq!(
            mcc.receive_from_endpoint(missing, NOW).err(),
            Some(MccError::EndpointNotFound(missing))
        );
    }

    #[test]
    fn test_destroy_reclaims_queued_buffers() {
        let mcc = local_mcc();
        let ep = mcc.create_endpoint(2).unwrap();
        mcc.send(ep, b"one", NOW).unwrap();
        mcc.send(ep, b"two", NOW).unwrap();
        mcc.destroy_endpoint(ep).unwrap();
        assert_eq!(mcc.free_buffer_count(), Ok(NUM_BUFFERS));
        assert_eq!(mcc.msgs_available(ep).err(), Some(MccError::EndpointNotFound(ep)));
        // the port can be reused
        assert_eq!(mcc.create_endpoint(2), Ok(ep));
    }

    #[test]
    fn test_recv_truncates() {
        let mcc = local_mcc();
        let ep = mcc.create_endpoint(3).unwrap();
        mcc.send(ep, b"abcdef", NOW).unwrap();
        let mut out = [0u8; 4];
        assert_eq!(mcc.recv(ep, &mut out, NOW), Ok(4));
        assert_eq!(&out, b"abcd");
        assert_eq!(
            mcc.send(ep, &[0; BUFFER_SIZE + 1], NOW),
            Err(MccError::MessageTooLarge {
                len: BUFFER_SIZE + 1,
                max: BUFFER_SIZE
            })
        );
    }

    #[test]
    fn test_local_release_wakes_waiter() {
        let mcc = Arc::new(local_mcc());
        let held: std::vec::Vec<_> = (0..NUM_BUFFERS)
            .map(|_| mcc.acquire_buffer(NOW).unwrap())
            .collect();

        let waiter = {
            let mcc = Arc::clone(&mcc);
            thread::spawn(move || mcc.acquire_buffer(Timeout::Forever).map(|b| b.phys()))
        };
        thread::sleep(Duration::from_millis(30));
        let mut held = held.into_iter();
        let first = held.next().unwrap();
        let phys = first.phys();
        mcc.release_buffer(first).unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(phys));
    }

    #[test]
    fn test_control_inbox_keeps_newest_words() {
        let mcc = local_mcc();
        // nested inside a masked section, as when the handler runs there
        mcc.platform().without_irqs(|| {
            for word in 1..=6 {
                mcc.stash_control_word(word);
            }
            assert_eq!(mcc.take_control_word(), Some(3));
        });
        let rest: std::vec::Vec<_> = core::iter::from_fn(|| mcc.take_control_word()).collect();
        assert_eq!(rest, [4, 5, 6]);
    }

    #[test]
    fn test_shutdown_destroys_endpoints() {
        let mcc = local_mcc();
        let ep = mcc.create_endpoint(4).unwrap();
        mcc.send(ep, b"x", NOW).unwrap();
        mcc.shutdown();
        assert!(!mcc.is_initialized());
        mcc.init().unwrap();
        assert_eq!(mcc.free_buffer_count(), Ok(NUM_BUFFERS));
        assert_eq!(mcc.msgs_available(ep).err(), Some(MccError::EndpointNotFound(ep)));
    }
}
