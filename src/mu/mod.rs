//! Messaging Unit transport
//!
//! The MU is a pair of register banks, one per core. Writing a transmit
//! register on one side fills the matching receive register on the other
//! and raises its "receive full" status; the general-purpose interrupt
//! request bits ring the peer's doorbell without carrying data.
//!
//! Slot 0 carries low-power handshake words, the doorbell carries MCC
//! signals. [`Mu`] layers the polling and masking rules of both protocols
//! over any [`MuRegisters`] implementation.

pub mod mmio;

use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;

use crate::error::{MccError, MccResult};
use crate::platform::Platform;
use crate::sema4::InterruptMask;

pub use self::mmio::MmioMu;

// ============================================================================
// Register Map
// ============================================================================

/// Transmit register 0, followed by three more at 4-byte stride
pub const MU_ATR0_OFFSET: usize = 0x00;
/// Receive register 0, followed by three more at 4-byte stride
pub const MU_ARR0_OFFSET: usize = 0x10;
/// Status register
pub const MU_ASR: usize = 0x20;
/// Control register
pub const MU_ACR: usize = 0x24;

/// Number of transmit/receive register pairs
pub const MU_SLOTS: usize = 4;

/// Slot carrying low-power handshake words
pub const LPM_HANDSHAKE_INDEX: usize = 0;

/// Status: general interrupt pending (MCC doorbell), write 1 to clear
pub const ASR_GIP: u32 = 1 << 31;
/// Status: handshake receive register full
pub const ASR_RF_HANDSHAKE: u32 = 1 << 27;

/// Control: general interrupt enable (MCC doorbell)
pub const ACR_GIE: u32 = 1 << 31;
/// Control: handshake receive interrupt enable
pub const ACR_RIE: u32 = 1 << 27;
/// Control: general interrupt request towards the peer
pub const ACR_GIR: u32 = 1 << 19;

/// Status: transmit register `slot` is empty
pub const fn asr_te(slot: usize) -> u32 {
    1 << (20 + slot)
}

/// Status: receive register `slot` is full
pub const fn asr_rf(slot: usize) -> u32 {
    1 << (27 - slot)
}

/// Byte offset of transmit register `slot`
pub const fn atr_offset(slot: usize) -> usize {
    MU_ATR0_OFFSET + slot * 4
}

/// Byte offset of receive register `slot`
pub const fn arr_offset(slot: usize) -> usize {
    MU_ARR0_OFFSET + slot * 4
}

// ============================================================================
// Raw Register Access
// ============================================================================

/// Raw 32-bit access to this core's side of the MU
///
/// Implementations only move words; the side effects on the peer bank
/// belong to the hardware (or its simulation).
pub trait MuRegisters: Send + Sync {
    fn read(&self, offset: usize) -> u32;
    fn write(&self, offset: usize, value: u32);
}

// ============================================================================
// Transport
// ============================================================================

/// Counters of the transport
#[derive(Debug, Default)]
pub struct MuStats {
    /// Words written although the transmit register never drained
    pub send_timeouts: AtomicU32,
    pub words_sent: AtomicU32,
    pub doorbells: AtomicU32,
}

/// Messaging Unit transport of one core
pub struct Mu<R, P> {
    regs: R,
    platform: P,
    send_timeout: Duration,
    doorbell_polls: u32,
    doorbell_poll_interval: Duration,
    stats: MuStats,
}

impl<R: MuRegisters, P: Platform> Mu<R, P> {
    pub fn new(regs: R, platform: P) -> Self {
        Self {
            regs,
            platform,
            send_timeout: crate::config::DEFAULT_SEND_TIMEOUT,
            doorbell_polls: crate::config::DEFAULT_DOORBELL_POLLS,
            doorbell_poll_interval: crate::config::DEFAULT_DOORBELL_POLL_INTERVAL,
            stats: MuStats::default(),
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_doorbell_polls(mut self, polls: u32, interval: Duration) -> Self {
        self.doorbell_polls = polls;
        self.doorbell_poll_interval = interval;
        self
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn stats(&self) -> &MuStats {
        &self.stats
    }

    /// Interrupt status bits of this side
    pub fn status(&self) -> u32 {
        self.regs.read(MU_ASR)
    }

    /// Control bits of this side
    pub fn control(&self) -> u32 {
        self.regs.read(MU_ACR)
    }

    /// Read-modify-write of the control register with local interrupts
    /// masked
    ///
    /// The interrupt handler toggles RIE on the same register. GIR is
    /// write-1-to-set, so a pending request read back here is never
    /// written again unless `set` asks for it.
    fn modify_control(&self, set: u32, clear: u32) {
        self.platform.without_irqs(|| {
            let val = self.regs.read(MU_ACR);
            self.regs.write(MU_ACR, (val & !clear & !ACR_GIR) | set);
            // read back to post the write
            let _ = self.regs.read(MU_ACR);
        })
    }

    /// Write `word` to transmit register `slot`
    ///
    /// Polls for the register to drain for at most the send timeout. When
    /// it does not, the error is logged and counted and the word is written
    /// anyway, overwriting whatever the peer has not read yet.
    pub fn send(&self, slot: usize, word: u32) {
        let deadline = self.platform.now() + self.send_timeout;
        while self.regs.read(MU_ASR) & asr_te(slot) == 0 {
            if self.platform.now() > deadline {
                self.stats.send_timeouts.fetch_add(1, Ordering::Relaxed);
                log::error!("{}", MccError::TransportTimeout { slot });
                break;
            }
            self.platform.relax();
        }
        self.regs.write(atr_offset(slot), word);
        self.stats.words_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the word delivered to receive register `slot`
    pub fn receive(&self, slot: usize) -> u32 {
        self.regs.read(arr_offset(slot))
    }

    /// Acknowledge the MCC doorbell on this side
    pub fn clear_doorbell(&self) {
        let val = self.regs.read(MU_ASR);
        self.regs.write(MU_ASR, val | ASR_GIP);
    }

    /// Ring the peer's MCC doorbell
    ///
    /// A previous request still pending means the peer has not serviced
    /// it; poll for it to clear before asserting a new one. Sleeps between
    /// polls, so only call from task context.
    pub fn trigger_doorbell(&self) -> MccResult<()> {
        let mut polls = 0;
        while self.regs.read(MU_ACR) & ACR_GIR != 0 {
            if polls >= self.doorbell_polls {
                log::info!("mcc doorbell still pending after {} polls", polls);
                return Err(MccError::DoorbellBusy);
            }
            self.platform.delay(self.doorbell_poll_interval);
            polls += 1;
        }
        self.modify_control(ACR_GIR, 0);
        self.stats.doorbells.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Enable both the doorbell and the handshake receive interrupts
    pub fn enable_interrupts(&self) {
        self.modify_control(ACR_GIE | ACR_RIE, 0);
    }

    pub fn disable_interrupts(&self) {
        self.modify_control(0, ACR_GIE | ACR_RIE);
    }

    /// Gate the doorbell interrupt
    pub fn set_doorbell_irq(&self, enable: bool) {
        if enable {
            self.modify_control(ACR_GIE, 0);
        } else {
            self.modify_control(0, ACR_GIE);
        }
    }

    /// Gate the handshake receive interrupt
    pub fn set_receive_irq(&self, enable: bool) {
        if enable {
            self.modify_control(ACR_RIE, 0);
        } else {
            self.modify_control(0, ACR_RIE);
        }
    }
}

impl<R: MuRegisters, P: Platform> InterruptMask for Mu<R, P> {
    fn mask(&self) {
        self.set_doorbell_irq(false);
    }

    fn unmask(&self) {
        self.set_doorbell_irq(true);
    }
}
