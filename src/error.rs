//! Error types for the MCC subsystem using thiserror

use thiserror::Error;

use crate::types::{Endpoint, PhysAddr};

/// Errors reported by the transport, the shared-memory bookkeeping and the
/// MCC API
///
/// None of them is fatal: timeouts are retried by the caller, interrupt-side
/// contention by the hardware re-raising the doorbell.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MccError {
    #[error("timed out waiting for a buffer")]
    Timeout,

    #[error("hardware semaphore held by another context")]
    MutexUnavailable,

    #[error("transmit register {slot} not empty before timeout")]
    TransportTimeout { slot: usize },

    #[error("peer did not acknowledge the previous doorbell")]
    DoorbellBusy,

    #[error("unexpected handshake word {0:#010x}")]
    ProtocolViolation(u32),

    #[error("signal queue of core {core} is full")]
    SignalQueueFull { core: u32 },

    #[error("endpoint {0} is not registered")]
    EndpointNotFound(Endpoint),

    #[error("endpoint {0} is already registered")]
    EndpointExists(Endpoint),

    #[error("invalid endpoint {0}")]
    InvalidEndpoint(Endpoint),

    #[error("endpoint table is full")]
    EndpointTableFull,

    #[error("address {0} is not a shared buffer")]
    InvalidBuffer(PhysAddr),

    #[error("message of {len} bytes exceeds buffer size {max}")]
    MessageTooLarge { len: usize, max: usize },

    #[error("shared memory layout version {found:#x} does not match {expected:#x}")]
    LayoutMismatch { expected: u32, found: u32 },

    #[error("subsystem not initialized")]
    NotInitialized,
}

/// Result type for MCC operations
pub type MccResult<T> = Result<T, MccError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CoreId;
    use std::string::ToString;

    #[test]
    fn test_error_display() {
        let ep = Endpoint::new(CoreId::PEER, 0, 2);
        assert_eq!(
            MccError::EndpointNotFound(ep).to_string(),
            "endpoint 1:0:2 is not registered"
        );
        assert_eq!(
            MccError::ProtocolViolation(0x1234).to_string(),
            "unexpected handshake word 0x00001234"
        );
    }
}
