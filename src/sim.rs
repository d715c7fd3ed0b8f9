//! Two-core simulation on host threads
//!
//! [`SimMu`] models both register banks of one Messaging Unit with the
//! cross-side effects of the hardware: a transmit write fills the other
//! side's receive register, reading a receive register drains the sender's
//! transmit register, and a general interrupt request pends on the other
//! side until it is cleared there.
//!
//! [`TwoCore`] runs a host and a peer [`Mcc`] over one shared region, each
//! with an interrupt thread and a deferred-work thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use std::vec::Vec;

use crate::config::MccConfig;
use crate::error::MccResult;
use crate::lpm::Handshake;
use crate::mcc::Mcc;
use crate::mu::{
    asr_rf, asr_te, MuRegisters, ACR_GIE, ACR_GIR, ACR_RIE, ASR_GIP, ASR_RF_HANDSHAKE, MU_ACR,
    MU_ARR0_OFFSET, MU_ASR, MU_ATR0_OFFSET, MU_SLOTS,
};
use crate::platform::StdPlatform;
use crate::sema4::{AtomicGate, GateHandle};
use crate::shm::{SharedMemory, NUM_CORES};
use crate::types::CoreId;

/// How long the interrupt threads sleep between checks of the stop flag
const IRQ_POLL: Duration = Duration::from_millis(10);

// ============================================================================
// Register Banks
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Bank {
    atr: [u32; MU_SLOTS],
    arr: [u32; MU_SLOTS],
    asr: u32,
    acr: u32,
}

impl Bank {
    fn reset() -> Self {
        let te = (0..MU_SLOTS).fold(0, |acc, slot| acc | asr_te(slot));
        Self {
            atr: [0; MU_SLOTS],
            arr: [0; MU_SLOTS],
            asr: te,
            acr: 0,
        }
    }

    fn line_asserted(&self) -> bool {
        (self.asr & ASR_GIP != 0 && self.acr & ACR_GIE != 0)
            || (self.asr & ASR_RF_HANDSHAKE != 0 && self.acr & ACR_RIE != 0)
    }
}

/// Both sides of one Messaging Unit
#[derive(Debug)]
pub struct SimMu {
    banks: Mutex<[Bank; NUM_CORES]>,
    changed: Condvar,
}

impl SimMu {
    pub fn new() -> Self {
        Self {
            banks: Mutex::new([Bank::reset(); NUM_CORES]),
            changed: Condvar::new(),
        }
    }

    fn banks(&self) -> MutexGuard<'_, [Bank; NUM_CORES]> {
        self.banks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register access as seen from `core`
    pub fn port(self: &Arc<Self>, core: CoreId) -> SimPort {
        SimPort {
            mu: Arc::clone(self),
            core,
        }
    }

    /// Whether `core`'s MU interrupt line is asserted
    pub fn line_asserted(&self, core: CoreId) -> bool {
        self.banks()[core.index()].line_asserted()
    }

    /// Block until `core`'s interrupt line is asserted or `timeout` elapsed
    pub fn wait_line(&self, core: CoreId, timeout: Duration) -> bool {
        let banks = self.banks();
        let (banks, _) = self
            .changed
            .wait_timeout_while(banks, timeout, |b| !b[core.index()].line_asserted())
            .unwrap_or_else(|e| e.into_inner());
        banks[core.index()].line_asserted()
    }

    fn read(&self, core: CoreId, offset: usize) -> u32 {
        let (me, other) = (core.index(), core.other().index());
        let mut banks = self.banks();
        match offset {
            MU_ASR => banks[me].asr,
            MU_ACR => banks[me].acr,
            o if (MU_ATR0_OFFSET..MU_ARR0_OFFSET).contains(&o) => banks[me].atr[(o - MU_ATR0_OFFSET) / 4],
            o if (MU_ARR0_OFFSET..MU_ASR).contains(&o) => {
                let slot = (o - MU_ARR0_OFFSET) / 4;
                if banks[me].asr & asr_rf(slot) != 0 {
                    banks[me].asr &= !asr_rf(slot);
                    banks[other].asr |= asr_te(slot);
                    self.changed.notify_all();
                }
                banks[me].arr[slot]
            }
            _ => 0,
        }
    }

    fn write(&self, core: CoreId, offset: usize, value: u32) {
        let (me, other) = (core.index(), core.other().index());
        let mut banks = self.banks();
        match offset {
            MU_ASR => {
                // only GIP is writable, and it is write-1-to-clear
                if value & ASR_GIP != 0 && banks[me].asr & ASR_GIP != 0 {
                    banks[me].asr &= !ASR_GIP;
                    banks[other].acr &= !ACR_GIR;
                }
            }
            MU_ACR => {
                if value & ACR_GIR != 0 && banks[me].acr & ACR_GIR == 0 {
                    banks[me].acr |= ACR_GIR;
                    banks[other].asr |= ASR_GIP;
                }
                banks[me].acr = (banks[me].acr & ACR_GIR) | (value & !ACR_GIR);
            }
            o if (MU_ATR0_OFFSET..MU_ARR0_OFFSET).contains(&o) => {
                let slot = (o - MU_ATR0_OFFSET) / 4;
                banks[me].atr[slot] = value;
                banks[me].asr &= !asr_te(slot);
                banks[other].arr[slot] = value;
                banks[other].asr |= asr_rf(slot);
            }
            _ => log::warn!("{}: write to read-only MU offset {:#x}", core, offset),
        }
        self.changed.notify_all();
    }
}

impl Default for SimMu {
    fn default() -> Self {
        Self::new()
    }
}

/// One core's side of a [`SimMu`]
#[derive(Debug, Clone)]
pub struct SimPort {
    mu: Arc<SimMu>,
    core: CoreId,
}

impl MuRegisters for SimPort {
    fn read(&self, offset: usize) -> u32 {
        self.mu.read(self.core, offset)
    }

    fn write(&self, offset: usize, value: u32) {
        self.mu.write(self.core, offset, value)
    }
}

// ============================================================================
// Two-Core Harness
// ============================================================================

pub type SimMcc = Mcc<SimPort, GateHandle, StdPlatform>;

/// Host and peer instances wired to one region, one gate and one MU
pub struct TwoCore {
    mu: Arc<SimMu>,
    gate: Arc<AtomicGate>,
    host: Arc<SimMcc>,
    peer: Arc<SimMcc>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl TwoCore {
    /// Build, start the interrupt threads and initialize both cores
    ///
    /// `handshake`, when given, serves the peer's low-power requests on
    /// the host.
    pub fn start(
        host_cfg: MccConfig,
        peer_cfg: MccConfig,
        handshake: Option<Handshake>,
    ) -> MccResult<Self> {
        let mu = Arc::new(SimMu::new());
        let gate = Arc::new(AtomicGate::new());
        let shm = Arc::new(SharedMemory::new());

        let mut host = Mcc::new(
            host_cfg,
            Arc::clone(&shm),
            mu.port(CoreId::HOST),
            gate.handle(CoreId::HOST),
            StdPlatform,
        );
        if let Some(hs) = handshake {
            host = host.with_handshake(hs);
        }
        let peer = Mcc::new(
            peer_cfg,
            shm,
            mu.port(CoreId::PEER),
            gate.handle(CoreId::PEER),
            StdPlatform,
        );

        let mut sim = Self {
            mu,
            gate,
            host: Arc::new(host),
            peer: Arc::new(peer),
            stop: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
        };
        for mcc in [Arc::clone(&sim.host), Arc::clone(&sim.peer)] {
            sim.spawn_core(mcc);
        }
        sim.host.init()?;
        sim.peer.init()?;
        Ok(sim)
    }

    /// Both cores with default settings and a short wait slice
    pub fn with_defaults() -> MccResult<Self> {
        let slice = Duration::from_millis(100);
        Self::start(
            MccConfig::new(CoreId::HOST).with_wait_slice(slice),
            MccConfig::new(CoreId::PEER).with_wait_slice(slice),
            None,
        )
    }

    fn spawn_core(&mut self, mcc: Arc<SimMcc>) {
        let core = mcc.core();
        let (work_tx, work_rx) = mpsc::channel::<()>();

        let worker = {
            let mcc = Arc::clone(&mcc);
            thread::Builder::new()
                .name(std::format!("{}-work", core))
                .spawn(move || {
                    while work_rx.recv().is_ok() {
                        mcc.run_deferred_work();
                    }
                })
        };

        let mu = Arc::clone(&self.mu);
        let stop = Arc::clone(&self.stop);
        let irq = thread::Builder::new()
            .name(std::format!("{}-irq", core))
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    if !mu.wait_line(core, IRQ_POLL) {
                        continue;
                    }
                    let outcome = mcc.handle_interrupt();
                    if outcome.deferred_work && work_tx.send(()).is_err() {
                        break;
                    }
                    if outcome.retry {
                        thread::yield_now();
                    }
                }
                // dropping `work_tx` ends the worker
            });

        for handle in [irq, worker] {
            match handle {
                Ok(handle) => self.threads.push(handle),
                Err(e) => log::error!("{}: spawning simulation thread failed: {}", core, e),
            }
        }
    }

    pub fn host(&self) -> &Arc<SimMcc> {
        &self.host
    }

    pub fn peer(&self) -> &Arc<SimMcc> {
        &self.peer
    }

    pub fn mu(&self) -> &Arc<SimMu> {
        &self.mu
    }

    pub fn gate(&self) -> &Arc<AtomicGate> {
        &self.gate
    }
}

impl Drop for TwoCore {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("simulation thread panicked");
            }
        }
    }
}
