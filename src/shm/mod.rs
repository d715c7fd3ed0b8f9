//! Shared-memory layout of the MCC region
//!
//! Both cores compile the same geometry and access the region through their
//! own mapping, so nothing in it is a pointer: buffers link to each other
//! by physical address, and every core converts those through its
//! [`ShmView`] before touching a buffer.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Bookkeeping                                  │
//! │   signature, version                         │
//! │   free list            head/tail             │
//! │   endpoint table       [MAX_ENDPOINTS]       │
//! │   signal queues        [NUM_CORES]           │
//! ├──────────────────────────────────────────────┤
//! │ Receive buffers        [NUM_BUFFERS]         │
//! │   next, data_len, data[BUFFER_SIZE]          │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Field order and sizes are shared with the peer firmware. Any change must
//! bump [`LAYOUT_VERSION`].

pub mod list;
pub mod signal;

use core::cell::UnsafeCell;
use core::mem::{offset_of, size_of};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{MccError, MccResult};
use crate::sema4::Held;
use crate::types::{CoreId, Endpoint, PhysAddr, RESERVED_PORT};

pub use self::list::ReceiveList;
pub use self::signal::{Signal, SignalKind, SignalQueue};

// ============================================================================
// Geometry
// ============================================================================

/// Participants sharing the region
pub const NUM_CORES: usize = 2;

/// Entries of the endpoint table
pub const MAX_ENDPOINTS: usize = 5;

/// Buffers in the region
pub const NUM_BUFFERS: usize = 10;

/// Payload bytes per buffer
pub const BUFFER_SIZE: usize = 1024;

/// Slots per signal queue; one stays empty to tell full from empty
pub const MAX_OUTSTANDING_SIGNALS: usize = 10;

/// Marks an initialized region
pub const LAYOUT_SIGNATURE: u32 = u32::from_le_bytes(*b"MCCI");

/// Major in the upper half, minor in the lower half
pub const LAYOUT_VERSION: u32 = 0x0002_0000;

// ============================================================================
// Shared Structures
// ============================================================================

/// One fixed-size buffer
#[repr(C)]
pub struct ReceiveBuffer {
    /// Physical address of the next buffer in whichever list holds this one
    pub(crate) next: AtomicU32,
    pub(crate) data_len: AtomicU32,
    data: UnsafeCell<[u8; BUFFER_SIZE]>,
}

impl ReceiveBuffer {
    pub const fn new() -> Self {
        Self {
            next: AtomicU32::new(0),
            data_len: AtomicU32::new(0),
            data: UnsafeCell::new([0; BUFFER_SIZE]),
        }
    }
}

/// Endpoint table entry; a reserved port marks it unused
#[repr(C)]
pub struct EndpointSlot {
    core: AtomicU32,
    node: AtomicU32,
    port: AtomicU32,
    pub(crate) list: ReceiveList,
}

impl EndpointSlot {
    pub const fn new() -> Self {
        Self {
            core: AtomicU32::new(0),
            node: AtomicU32::new(0),
            port: AtomicU32::new(RESERVED_PORT),
            list: ReceiveList::new(),
        }
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        let port = self.port.load(Ordering::Relaxed);
        if port == RESERVED_PORT {
            return None;
        }
        Some(Endpoint::new(
            CoreId(self.core.load(Ordering::Relaxed)),
            self.node.load(Ordering::Relaxed),
            port,
        ))
    }

    fn set(&self, ep: Endpoint) {
        self.core.store(ep.core.0, Ordering::Relaxed);
        self.node.store(ep.node, Ordering::Relaxed);
        self.port.store(ep.port, Ordering::Relaxed);
    }

    fn clear(&self) {
        self.port.store(RESERVED_PORT, Ordering::Relaxed);
        self.list.reset();
    }
}

/// Bookkeeping header at the start of the region
#[repr(C)]
pub struct Bookkeeping {
    signature: AtomicU32,
    version: AtomicU32,
    pub(crate) free_list: ReceiveList,
    pub(crate) endpoints: [EndpointSlot; MAX_ENDPOINTS],
    pub(crate) signals: [SignalQueue; NUM_CORES],
}

impl Bookkeeping {
    pub const fn new() -> Self {
        Self {
            signature: AtomicU32::new(0),
            version: AtomicU32::new(0),
            free_list: ReceiveList::new(),
            endpoints: [const { EndpointSlot::new() }; MAX_ENDPOINTS],
            signals: [const { SignalQueue::new() }; NUM_CORES],
        }
    }
}

/// The whole shared region
#[repr(C)]
pub struct SharedMemory {
    pub(crate) bookkeeping: Bookkeeping,
    buffers: [ReceiveBuffer; NUM_BUFFERS],
}

// Buffer payloads are only touched by the holder of the unique `Buffer`
// handle for that address; everything else is atomic.
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    pub const fn new() -> Self {
        Self {
            bookkeeping: Bookkeeping::new(),
            buffers: [const { ReceiveBuffer::new() }; NUM_BUFFERS],
        }
    }

    pub fn signal_queue(&self, core: CoreId) -> &SignalQueue {
        &self.bookkeeping.signals[core.index()]
    }
}

impl Default for SharedMemory {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Buffer Handle
// ============================================================================

/// Exclusive ownership of one shared buffer
///
/// Neither `Clone` nor `Copy`: a buffer is in exactly one place
/// at a time, the free list, an endpoint list, or one of these handles.
#[derive(Debug, PartialEq, Eq)]
pub struct Buffer {
    phys: PhysAddr,
}

impl Buffer {
    pub(crate) fn from_phys(phys: PhysAddr) -> Self {
        Self { phys }
    }

    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    pub(crate) fn into_phys(self) -> PhysAddr {
        self.phys
    }
}

// ============================================================================
// Local View
// ============================================================================

/// The region as mapped by one core
#[derive(Clone, Copy)]
pub struct ShmView<'a> {
    shm: &'a SharedMemory,
    phys_base: u32,
}

impl<'a> ShmView<'a> {
    pub fn new(shm: &'a SharedMemory, phys_base: u32) -> Self {
        Self { shm, phys_base }
    }

    pub fn shm(&self) -> &'a SharedMemory {
        self.shm
    }

    pub fn bookkeeping(&self) -> &'a Bookkeeping {
        &self.shm.bookkeeping
    }

    pub fn free_list(&self) -> &'a ReceiveList {
        &self.shm.bookkeeping.free_list
    }

    /// Physical address of buffer `index`
    pub fn phys_of(&self, index: usize) -> PhysAddr {
        let offset = offset_of!(SharedMemory, buffers) + index * size_of::<ReceiveBuffer>();
        PhysAddr(self.phys_base + offset as u32)
    }

    /// Translate a physical buffer address into this core's mapping
    pub fn translate(&self, phys: PhysAddr) -> MccResult<&'a ReceiveBuffer> {
        let start = self.phys_base as usize + offset_of!(SharedMemory, buffers);
        let addr = phys.0 as usize;
        if addr < start {
            return Err(MccError::InvalidBuffer(phys));
        }
        let rel = addr - start;
        let index = rel / size_of::<ReceiveBuffer>();
        if rel % size_of::<ReceiveBuffer>() != 0 || index >= NUM_BUFFERS {
            return Err(MccError::InvalidBuffer(phys));
        }
        Ok(&self.shm.buffers[index])
    }

    /// Payload of an owned buffer, `data_len` bytes long
    pub fn payload<'b>(&self, buf: &'b Buffer) -> MccResult<&'b [u8]>
    where
        'a: 'b,
    {
        let rb = self.translate(buf.phys())?;
        let len = (rb.data_len.load(Ordering::Acquire) as usize).min(BUFFER_SIZE);
        // SAFETY: `buf` is the only handle to this buffer.
        let data = unsafe { &*rb.data.get() };
        Ok(&data[..len])
    }

    /// Whole payload area of an owned buffer
    pub fn payload_mut<'b>(&self, buf: &'b mut Buffer) -> MccResult<&'b mut [u8]>
    where
        'a: 'b,
    {
        let rb = self.translate(buf.phys())?;
        // SAFETY: `buf` is the only handle to this buffer and is borrowed
        // mutably for the lifetime of the slice.
        Ok(unsafe { &mut *rb.data.get() })
    }

    pub fn set_payload_len(&self, buf: &mut Buffer, len: usize) -> MccResult<()> {
        if len > BUFFER_SIZE {
            return Err(MccError::MessageTooLarge {
                len,
                max: BUFFER_SIZE,
            });
        }
        let rb = self.translate(buf.phys())?;
        rb.data_len.store(len as u32, Ordering::Release);
        Ok(())
    }

    // ========================================================================
    // Initialization
    // ========================================================================

    /// Check the header written by whichever core formatted the region
    ///
    /// `Ok(false)` means nobody has formatted it yet.
    pub fn check_layout(&self, _held: &Held) -> MccResult<bool> {
        let bk = self.bookkeeping();
        if bk.signature.load(Ordering::Acquire) != LAYOUT_SIGNATURE {
            return Ok(false);
        }
        let found = bk.version.load(Ordering::Relaxed);
        if found != LAYOUT_VERSION {
            return Err(MccError::LayoutMismatch {
                expected: LAYOUT_VERSION,
                found,
            });
        }
        Ok(true)
    }

    /// Reset all bookkeeping and put every buffer on the free list
    pub fn format(&self, held: &Held) {
        let bk = self.bookkeeping();
        for slot in bk.endpoints.iter() {
            slot.clear();
        }
        for queue in bk.signals.iter() {
            queue.reset();
        }
        bk.free_list.reset();
        for index in 0..NUM_BUFFERS {
            self.shm.buffers[index].data_len.store(0, Ordering::Relaxed);
            bk.free_list.push_back(self, held, self.phys_of(index));
        }
        bk.version.store(LAYOUT_VERSION, Ordering::Relaxed);
        bk.signature.store(LAYOUT_SIGNATURE, Ordering::Release);
    }

    // ========================================================================
    // Endpoint Table
    // ========================================================================

    /// Receive list of a registered endpoint
    pub fn endpoint_list(&self, _held: &Held, ep: Endpoint) -> Option<&'a ReceiveList> {
        self.bookkeeping()
            .endpoints
            .iter()
            .find(|slot| slot.endpoint() == Some(ep))
            .map(|slot| &slot.list)
    }

    pub fn register_endpoint(&self, held: &Held, ep: Endpoint) -> MccResult<()> {
        if self.endpoint_list(held, ep).is_some() {
            return Err(MccError::EndpointExists(ep));
        }
        let slot = self
            .bookkeeping()
            .endpoints
            .iter()
            .find(|slot| slot.endpoint().is_none())
            .ok_or(MccError::EndpointTableFull)?;
        slot.list.reset();
        slot.set(ep);
        Ok(())
    }

    /// Remove an endpoint, returning its undelivered buffers to the free list
    ///
    /// Returns the number of buffers reclaimed.
    pub fn unregister_endpoint(&self, held: &Held, ep: Endpoint) -> MccResult<usize> {
        let slot = self
            .bookkeeping()
            .endpoints
            .iter()
            .find(|slot| slot.endpoint() == Some(ep))
            .ok_or(MccError::EndpointNotFound(ep))?;
        let mut reclaimed = 0;
        while let Some(phys) = slot.list.pop_front(self, held) {
            self.bookkeeping().free_list.push_back(self, held, phys);
            reclaimed += 1;
        }
        slot.clear();
        Ok(reclaimed)
    }
}
