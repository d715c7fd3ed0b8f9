//! Common types used across mcc_mu
//!
//! Addresses, endpoint identifiers and timeouts shared by the transport,
//! the shared-memory layout and the MCC API.

use core::fmt;
use core::time::Duration;

// ============================================================================
// Cores
// ============================================================================

/// Identifier of one of the two cores sharing the MCC region
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CoreId(pub u32);

impl CoreId {
    /// The general-purpose core running the full OS
    pub const HOST: Self = Self(0);
    /// The companion real-time core
    pub const PEER: Self = Self(1);

    /// The other participant of the point-to-point link
    pub const fn other(self) -> Self {
        Self(self.0 ^ 1)
    }

    /// Index into per-core tables of the shared layout
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "core{}", self.0)
    }
}

// ============================================================================
// Endpoints
// ============================================================================

/// Port number reserved to mark unused endpoint table slots
pub const RESERVED_PORT: u32 = 0;

/// Destination address for delivered buffers
///
/// An endpoint lives on one core; `node` and `port` select the receive
/// queue there. The core is carried along so signals can be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub core: CoreId,
    pub node: u32,
    pub port: u32,
}

impl Endpoint {
    pub const fn new(core: CoreId, node: u32, port: u32) -> Self {
        Self { core, node, port }
    }

    /// Whether the endpoint addresses a usable port
    pub fn is_valid(&self) -> bool {
        self.port != RESERVED_PORT && self.core.index() < crate::shm::NUM_CORES
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.core.0, self.node, self.port)
    }
}

// ============================================================================
// Physical addresses
// ============================================================================

/// Physical address of a shared buffer as both cores see it
///
/// Stored in the shared structures instead of pointers. Zero is the list
/// terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysAddr(pub u32);

impl PhysAddr {
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

// ============================================================================
// Timeouts
// ============================================================================

/// Millisecond value meaning "wait forever" in the numeric API
pub const TIME_INFINITE: u32 = 0xFFFF_FFFF;

/// Bound on a blocking wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Check once and return
    NoWait,
    /// Give up after the duration elapsed
    After(Duration),
    /// Block until the condition holds
    Forever,
}

impl Timeout {
    pub const fn from_millis(ms: u32) -> Self {
        match ms {
            0 => Timeout::NoWait,
            TIME_INFINITE => Timeout::Forever,
            ms => Timeout::After(Duration::from_millis(ms as u64)),
        }
    }

    /// Absolute deadline given the current time, `None` when unbounded
    pub fn deadline(self, now: Duration) -> Option<Duration> {
        match self {
            Timeout::NoWait => Some(now),
            Timeout::After(d) => Some(now.saturating_add(d)),
            Timeout::Forever => None,
        }
    }
}

impl From<u32> for Timeout {
    fn from(ms: u32) -> Self {
        Self::from_millis(ms)
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            Timeout::NoWait
        } else {
            Timeout::After(d)
        }
    }
}
