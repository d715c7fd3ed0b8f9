//! Memory-mapped MU register bank

use core::ptr::{read_volatile, write_volatile};

use super::MuRegisters;

/// MU register bank at a fixed virtual address
#[derive(Debug)]
pub struct MmioMu {
    base: usize,
}

impl MmioMu {
    /// # Safety
    ///
    /// `base` must map this core's MU register bank (or 0x28 bytes of
    /// memory standing in for it) for the lifetime of the value.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    pub fn base(&self) -> usize {
        self.base
    }
}

impl MuRegisters for MmioMu {
    fn read(&self, offset: usize) -> u32 {
        unsafe { read_volatile((self.base + offset) as *const u32) }
    }

    fn write(&self, offset: usize, value: u32) {
        unsafe {
            write_volatile((self.base + offset) as *mut u32, value);
        }
    }
}
