//! Runtime configuration of one MCC participant
//!
//! The shared-memory geometry is fixed at build time (see [`crate::shm`]);
//! everything here may differ between the two cores.

use core::time::Duration;

use crate::types::CoreId;

// ============================================================================
// Defaults
// ============================================================================

/// Physical base of the shared MCC region on i.MX6SoloX
pub const DEFAULT_SHM_PHYS_BASE: u32 = 0xBFF0_0000;

/// How long `send` polls for an empty transmit register
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound on a single wait slice of a blocking acquire/receive
pub const DEFAULT_WAIT_SLICE: Duration = Duration::from_secs(1);

/// Number of polls before giving up on an unacknowledged doorbell
pub const DEFAULT_DOORBELL_POLLS: u32 = 100;

/// Delay between doorbell polls
pub const DEFAULT_DOORBELL_POLL_INTERVAL: Duration = Duration::from_millis(1);

// ============================================================================
// Configuration
// ============================================================================

/// Per-core MCC configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MccConfig {
    /// Core this instance runs on
    pub core: CoreId,
    /// Node number of local endpoints
    pub node: u32,
    /// Physical address of the start of the shared region
    pub shm_phys_base: u32,
    /// Transmit-empty polling bound for handshake words
    pub send_timeout: Duration,
    /// Re-check period of blocking waits
    pub wait_slice: Duration,
    pub doorbell_polls: u32,
    pub doorbell_poll_interval: Duration,
    /// Interrupt line of the MU, registered as a wake-up source when set
    pub mu_irq: Option<u32>,
}

impl MccConfig {
    pub fn new(core: CoreId) -> Self {
        Self {
            core,
            node: 0,
            shm_phys_base: DEFAULT_SHM_PHYS_BASE,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            wait_slice: DEFAULT_WAIT_SLICE,
            doorbell_polls: DEFAULT_DOORBELL_POLLS,
            doorbell_poll_interval: DEFAULT_DOORBELL_POLL_INTERVAL,
            mu_irq: None,
        }
    }

    pub fn with_node(mut self, node: u32) -> Self {
        self.node = node;
        self
    }

    pub fn with_shm_phys_base(mut self, base: u32) -> Self {
        self.shm_phys_base = base;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_wait_slice(mut self, slice: Duration) -> Self {
        self.wait_slice = slice;
        self
    }

    pub fn with_doorbell_polls(mut self, polls: u32, interval: Duration) -> Self {
        self.doorbell_polls = polls;
        self.doorbell_poll_interval = interval;
        self
    }

    pub fn with_mu_irq(mut self, irq: u32) -> Self {
        self.mu_irq = Some(irq);
        self
    }
}

impl Default for MccConfig {
    fn default() -> Self {
        Self::new(CoreId::HOST)
    }
}
