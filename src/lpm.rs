//! Low-power handshake with the peer core
//!
//! The peer negotiates bus frequency and wake-up interrupt routing by
//! writing control words to MU slot 0. The interrupt handler only captures
//! the word and masks the receive interrupt; the work here runs later in a
//! context that may sleep, and the receive interrupt is unmasked once the
//! word is fully handled, so the peer cannot send a second word early.

use alloc::boxed::Box;
use heapless::Vec;
use spin::Mutex;

use crate::error::MccError;

// ============================================================================
// Wire Encoding
// ============================================================================

/// Ack: the bus runs at high frequency for the peer
pub const BUS_HIGH_READY_FOR_PEER: u32 = 0xFFFF_6666;
/// Ack: the bus was released and the peer may lower its clock
pub const PEER_FREQ_CHANGE_READY: u32 = 0xFFFF_7777;
pub const PEER_REQUEST_HIGH_BUS: u32 = 0x2222_CCCC;
pub const PEER_RELEASE_HIGH_BUS: u32 = 0x2222_BBBB;

pub const WAKEUP_SRC_VAL: u32 = 0x5555_5000;
pub const WAKEUP_SRC_MASK: u32 = 0xFFFF_F000;
pub const WAKEUP_IRQ_MASK: u32 = 0xFF0;
pub const WAKEUP_IRQ_SHIFT: u32 = 4;
pub const WAKEUP_ENABLE_MASK: u32 = 0xF;
pub const WAKEUP_ENABLE_SHIFT: u32 = 0;

/// Shared peripheral interrupts start here; the wake bitmap covers the
/// next 128 lines
pub const SPI_BASE: u32 = 32;
const WAKE_WORDS: usize = 4;

/// Most IRQs with an installed placeholder handler
pub const MAX_WAKE_IRQS: usize = WAKE_WORDS * 32;

/// A decoded handshake word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LpmMessage {
    RequestHighBus,
    ReleaseHighBus,
    WakeSource { irq: u32, enable: bool },
}

impl LpmMessage {
    pub fn decode(word: u32) -> Result<Self, MccError> {
        match word {
            PEER_REQUEST_HIGH_BUS => Ok(LpmMessage::RequestHighBus),
            PEER_RELEASE_HIGH_BUS => Ok(LpmMessage::ReleaseHighBus),
            w if w & WAKEUP_SRC_MASK == WAKEUP_SRC_VAL => Ok(LpmMessage::WakeSource {
                irq: (w & WAKEUP_IRQ_MASK) >> WAKEUP_IRQ_SHIFT,
                enable: (w & WAKEUP_ENABLE_MASK) >> WAKEUP_ENABLE_SHIFT != 0,
            }),
            w => Err(MccError::ProtocolViolation(w)),
        }
    }

    /// The word the peer writes for this message
    pub fn encode(self) -> u32 {
        match self {
            LpmMessage::RequestHighBus => PEER_REQUEST_HIGH_BUS,
            LpmMessage::ReleaseHighBus => PEER_RELEASE_HIGH_BUS,
            LpmMessage::WakeSource { irq, enable } => {
                WAKEUP_SRC_VAL
                    | ((irq << WAKEUP_IRQ_SHIFT) & WAKEUP_IRQ_MASK)
                    | ((enable as u32) << WAKEUP_ENABLE_SHIFT)
            }
        }
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// Bus-frequency scaling of the host
pub trait BusFreq: Send + Sync {
    fn request_bus_high(&self);
    fn release_bus_high(&self);
    /// Tell the clock code whether the peer currently needs a fast bus
    fn set_peer_high_freq(&self, _high: bool) {}
}

/// Host interrupt controller and wake-up routing
pub trait IrqController: Send + Sync {
    /// Whether `irq` has no handler yet
    fn can_request(&self, irq: u32) -> bool;
    /// Install a handler that only acknowledges `irq`
    fn request_placeholder(&self, irq: u32) -> Result<(), i32>;
    fn enable_irq(&self, irq: u32);
    fn disable_irq(&self, irq: u32);
    /// Route `irq` as a wake-up source for low-power mode
    fn register_wake_irq(&self, irq: u32, enable: bool);
}

// ============================================================================
// State Machine
// ============================================================================

/// Bus negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LpmState {
    Idle,
    /// Bus scaling requested, ack not sent yet
    AwaitingBusHighAck,
    BusHigh,
}

struct Inner {
    state: LpmState,
    peer_low_freq: bool,
    /// Bit `j` of word `i` set: IRQ `(i + 1) * 32 + j` wakes the peer
    wake_irqs: [u32; WAKE_WORDS],
    placeholders: Vec<u32, MAX_WAKE_IRQS>,
}

/// Host side of the low-power handshake
pub struct Handshake {
    bus: Box<dyn BusFreq>,
    irqc: Box<dyn IrqController>,
    inner: Mutex<Inner>,
    /// Word captured by the interrupt handler, not processed yet
    pending: Mutex<Option<u32>>,
}

impl Handshake {
    pub fn new(bus: Box<dyn BusFreq>, irqc: Box<dyn IrqController>) -> Self {
        Self {
            bus,
            irqc,
            inner: Mutex::new(Inner {
                state: LpmState::Idle,
                peer_low_freq: false,
                wake_irqs: [0; WAKE_WORDS],
                placeholders: Vec::new(),
            }),
            pending: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LpmState {
        self.inner.lock().state
    }

    /// Whether the peer last released the high-frequency bus
    pub fn peer_in_low_freq(&self) -> bool {
        self.inner.lock().peer_low_freq
    }

    pub fn wake_irqs(&self) -> [u32; WAKE_WORDS] {
        self.inner.lock().wake_irqs
    }

    pub fn irq_controller(&self) -> &dyn IrqController {
        &*self.irqc
    }

    /// Interrupt side: remember the word for deferred processing
    ///
    /// Returns false if an earlier word was still pending and got replaced.
    pub fn capture(&self, word: u32) -> bool {
        self.pending.lock().replace(word).is_none()
    }

    pub fn take_pending(&self) -> Option<u32> {
        self.pending.lock().take()
    }

    /// Deferred side: act on one word, sending acks through `ack`
    pub fn process(&self, word: u32, mut ack: impl FnMut(u32)) {
        log::debug!("receive peer message {:#x}", word);
        let msg = match LpmMessage::decode(word) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("{}", e);
                return;
            }
        };

        match msg {
            LpmMessage::RequestHighBus => self.bus_high(&mut ack),
            LpmMessage::ReleaseHighBus => self.bus_release(&mut ack),
            LpmMessage::WakeSource { irq, enable } => self.wake_source(irq, enable),
        }
    }

    /// Every request reaches the bus code, which counts its users; a
    /// repeated request is only logged
    fn bus_high(&self, ack: &mut impl FnMut(u32)) {
        let previous = core::mem::replace(
            &mut self.inner.lock().state,
            LpmState::AwaitingBusHighAck,
        );
        if previous == LpmState::BusHigh {
            log::warn!("peer requested the high bus twice");
        }
        self.bus.request_bus_high();
        self.bus.set_peer_high_freq(true);
        ack(BUS_HIGH_READY_FOR_PEER);
        let mut inner = self.inner.lock();
        inner.state = LpmState::BusHigh;
        inner.peer_low_freq = false;
    }

    fn bus_release(&self, ack: &mut impl FnMut(u32)) {
        if self.inner.lock().state == LpmState::Idle {
            log::warn!("{}", MccError::ProtocolViolation(PEER_RELEASE_HIGH_BUS));
        }
        self.bus.release_bus_high();
        self.bus.set_peer_high_freq(false);
        ack(PEER_FREQ_CHANGE_READY);
        let mut inner = self.inner.lock();
        inner.state = LpmState::Idle;
        inner.peer_low_freq = true;
    }

    /// Routing always reaches the interrupt controller; only IRQs the wake
    /// bitmap covers get a placeholder handler
    fn wake_source(&self, irq: u32, enable: bool) {
        if enable && self.irqc.can_request(irq) {
            if (SPI_BASE..SPI_BASE + MAX_WAKE_IRQS as u32).contains(&irq) {
                if let Err(rc) = self.irqc.request_placeholder(irq) {
                    log::error!("register interrupt {} failed, rc {}", irq, rc);
                    return;
                }
                // only fires once the host decides to let it through
                self.irqc.disable_irq(irq);
                let mut inner = self.inner.lock();
                inner.wake_irqs[(irq / 32 - 1) as usize] |= 1 << (irq % 32);
                if !inner.placeholders.contains(&irq) {
                    let _ = inner.placeholders.push(irq);
                }
            } else {
                log::warn!("wake-up irq {} outside the wake bitmap", irq);
            }
        }
        self.irqc.register_wake_irq(irq, enable);
    }

    /// Enable or disable every IRQ the peer registered as a wake source
    ///
    /// Called around host suspend so the peer's wake sources can reach the
    /// interrupt controller.
    pub fn set_peer_wake_irqs(&self, enable: bool) {
        let words = self.wake_irqs();
        for (i, word) in words.iter().enumerate() {
            for j in 0..32 {
                if word & (1 << j) == 0 {
                    continue;
                }
                let irq = (i as u32 + 1) * 32 + j;
                if enable {
                    self.irqc.enable_irq(irq);
                } else {
                    self.irqc.disable_irq(irq);
                }
            }
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::vec::Vec as StdVec;

    #[derive(Default)]
    struct Log(StdMutex<StdVec<String>>);

    impl Log {
        fn push(&self, s: String) {
            self.0.lock().unwrap().push(s);
        }
        fn entries(&self) -> StdVec<String> {
            self.0.lock().unwrap().clone()
        }
        fn count(&self, prefix: &str) -> usize {
            self.entries().iter().filter(|e| e.starts_with(prefix)).count()
        }
    }

    struct Bus(Arc<Log>);

    impl BusFreq for Bus {
        fn request_bus_high(&self) {
            self.0.push("request".into());
        }
        fn release_bus_high(&self) {
            self.0.push("release".into());
        }
    }

    struct Irqc {
        log: Arc<Log>,
        fail: bool,
    }

    impl IrqController for Irqc {
        fn can_request(&self, irq: u32) -> bool {
            !self.log.entries().contains(&format!("placeholder {}", irq))
        }
        fn request_placeholder(&self, irq: u32) -> Result<(), i32> {
            if self.fail {
                return Err(-16);
            }
            self.log.push(format!("placeholder {}", irq));
            Ok(())
        }
        fn enable_irq(&self, irq: u32) {
            self.log.push(format!("enable {}", irq));
        }
        fn disable_irq(&self, irq: u32) {
            self.log.push(format!("disable {}", irq));
        }
        fn register_wake_irq(&self, irq: u32, enable: bool) {
            self.log.push(format!("wake {} {}", irq, enable));
        }
    }

    fn handshake(fail: bool) -> (Handshake, Arc<Log>) {
        let log = Arc::new(Log::default());
        let hs = Handshake::new(
            Box::new(Bus(Arc::clone(&log))),
            Box::new(Irqc {
                log: Arc::clone(&log),
                fail,
            }),
        );
        (hs, log)
    }

    #[test]
    fn test_decode_words() {
        assert_eq!(LpmMessage::decode(0x2222_CCCC), Ok(LpmMessage::RequestHighBus));
        assert_eq!(LpmMessage::decode(0x2222_BBBB), Ok(LpmMessage::ReleaseHighBus));
        assert_eq!(
            LpmMessage::decode(0x5555_5591),
            Ok(LpmMessage::WakeSource { irq: 0x59, enable: true })
        );
        assert_eq!(
            LpmMessage::decode(0x5555_5590),
            Ok(LpmMessage::WakeSource { irq: 0x59, enable: false })
        );
        assert_eq!(
            LpmMessage::decode(0xDEAD_BEEF),
            Err(MccError::ProtocolViolation(0xDEAD_BEEF))
        );
    }

    #[test]
    fn test_request_then_release_balances() {
        let (hs, log) = handshake(false);
        let mut acks = StdVec::new();
        hs.process(PEER_REQUEST_HIGH_BUS, |w| acks.push(w));
        assert_eq!(hs.state(), LpmState::BusHigh);
        assert!(!hs.peer_in_low_freq());
        hs.process(PEER_RELEASE_HIGH_BUS, |w| acks.push(w));

        assert_eq!(hs.state(), LpmState::Idle);
        assert!(hs.peer_in_low_freq());
        assert_eq!(log.count("request"), 1);
        assert_eq!(log.count("release"), 1);
        assert_eq!(acks, [BUS_HIGH_READY_FOR_PEER, PEER_FREQ_CHANGE_READY]);
    }

    #[test]
    fn test_ack_sent_while_awaiting() {
        let (hs, _log) = handshake(false);
        let mut seen = None;
        hs.process(PEER_REQUEST_HIGH_BUS, |_| seen = Some(hs.state()));
        assert_eq!(seen, Some(LpmState::AwaitingBusHighAck));
    }

    #[test]
    fn test_unbalanced_release_still_acked() {
        let (hs, log) = handshake(false);
        let mut acks = StdVec::new();
        hs.process(PEER_RELEASE_HIGH_BUS, |w| acks.push(w));
        assert_eq!(log.count("release"), 1);
        assert_eq!(acks, [PEER_FREQ_CHANGE_READY]);
        assert_eq!(hs.state(), LpmState::Idle);
    }

    #[test]
    fn test_repeated_request_reaches_bus_code() {
        let (hs, log) = handshake(false);
        let mut acks = StdVec::new();
        hs.process(PEER_REQUEST_HIGH_BUS, |w| acks.push(w));
        hs.process(PEER_REQUEST_HIGH_BUS, |w| acks.push(w));
        assert_eq!(log.count("request"), 2);
        assert_eq!(acks, [BUS_HIGH_READY_FOR_PEER; 2]);
        assert_eq!(hs.state(), LpmState::BusHigh);

        hs.process(PEER_RELEASE_HIGH_BUS, |_| {});
        hs.process(PEER_RELEASE_HIGH_BUS, |_| {});
        assert_eq!(log.count("release"), 2);
    }

    #[test]
    fn test_unknown_word_ignored() {
        let (hs, log) = handshake(false);
        let mut acks = 0;
        hs.process(0x1234_5678, |_| acks += 1);
        assert_eq!(acks, 0);
        assert!(log.entries().is_empty());
        assert_eq!(hs.state(), LpmState::Idle);
    }

    #[test]
    fn test_wake_source_first_enable_installs_placeholder() {
        let (hs, log) = handshake(false);
        let word = LpmMessage::WakeSource { irq: 71, enable: true }.encode();
        hs.process(word, |_| panic!("no ack expected"));
        hs.process(word, |_| panic!("no ack expected"));

        assert_eq!(log.count("placeholder 71"), 1);
        assert_eq!(log.count("disable 71"), 1);
        assert_eq!(log.count("wake 71 true"), 2);
        assert_eq!(hs.wake_irqs(), [0, 1 << (71 - 64), 0, 0]);

        hs.process(LpmMessage::WakeSource { irq: 71, enable: false }.encode(), |_| {});
        assert_eq!(log.count("wake 71 false"), 1);
    }

    #[test]
    fn test_wake_source_failed_request_skips_routing() {
        let (hs, log) = handshake(true);
        hs.process(LpmMessage::WakeSource { irq: 40, enable: true }.encode(), |_| {});
        assert_eq!(log.count("wake"), 0);
        assert_eq!(hs.wake_irqs(), [0; 4]);
    }

    #[test]
    fn test_wake_source_out_of_range_still_routed() {
        let (hs, log) = handshake(false);
        hs.process(LpmMessage::WakeSource { irq: 12, enable: true }.encode(), |_| {});
        hs.process(LpmMessage::WakeSource { irq: 200, enable: false }.encode(), |_| {});
        assert_eq!(log.entries(), ["wake 12 true", "wake 200 false"]);
        assert_eq!(hs.wake_irqs(), [0; 4]);
    }

    #[test]
    fn test_set_peer_wake_irqs() {
        let (hs, log) = handshake(false);
        for irq in [33, 100] {
            hs.process(LpmMessage::WakeSource { irq, enable: true }.encode(), |_| {});
        }
        hs.set_peer_wake_irqs(true);
        assert_eq!(log.count("enable 33"), 1);
        assert_eq!(log.count("enable 100"), 1);
    }

    #[test]
    fn test_capture_replaces_pending() {
        let (hs, _log) = handshake(false);
        assert!(hs.capture(1));
        assert!(!hs.capture(2));
        assert_eq!(hs.take_pending(), Some(2));
        assert_eq!(hs.take_pending(), None);
    }
}
