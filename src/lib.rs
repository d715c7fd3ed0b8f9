//! mcc_mu - Multicore Communication over the i.MX Messaging Unit
//!
//! Two cores exchange fixed-size buffers through a shared memory region.
//! A hardware semaphore gate serializes access to the region's bookkeeping,
//! per-core signal queues describe what changed, and the Messaging Unit's
//! general interrupt rings the other core's doorbell. The same MU carries
//! the peer's low-power handshake (bus frequency and wake-up sources).
//!
//! The crate is `no_std` with `alloc`; the `std` feature adds a host
//! platform and a threaded two-core simulation.

#![cfg_attr(not(feature = "std"), no_std)]
// Shared-layout types have const constructors for static placement
#![allow(clippy::new_without_default)]
// Hardware register code often uses explicit bit shifts for documentation
#![allow(clippy::identity_op)]
// Sends hand the buffer back on failure
#![allow(clippy::result_large_err)]

extern crate alloc;

#[cfg(all(test, not(feature = "std")))]
extern crate std;

// Core types
pub mod config;
pub mod error;
pub mod types;

// Hardware and platform contracts
pub mod mu;
pub mod platform;
pub mod sema4;

// Shared region and protocol
pub mod lpm;
pub mod mcc;
pub mod shm;

#[cfg(feature = "std")]
pub mod sim;

pub use config::MccConfig;
pub use error::{MccError, MccResult};
pub use lpm::{BusFreq, Handshake, IrqController, LpmMessage, LpmState};
pub use mcc::{IrqOutcome, Mcc, MccInfo};
pub use mu::{Mu, MuRegisters};
pub use platform::{Platform, WaitEvent};
pub use sema4::{AtomicGate, GateHandle, HwSemaphore};
pub use shm::{Buffer, SharedMemory, BUFFER_SIZE, NUM_BUFFERS};
pub use types::{CoreId, Endpoint, PhysAddr, Timeout, TIME_INFINITE};

#[cfg(feature = "std")]
pub use platform::{StdEvent, StdPlatform};
