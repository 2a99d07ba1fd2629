//! Mmaps of the four kernel rings and the cached-head protocol driving them.
//!
//! Producer rings (fill, tx) are written by us and read by the kernel;
//! consumer rings (rx, completion) the other way around. Both sides keep
//! cached copies of the opposite head so the shared atomics are only touched
//! when the cache runs dry.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::nic::{ptr_len, MmapOffsets, SocketFd};
use crate::xdp::{self, XdpDesc, XdpRingOffsets};
use crate::{Errno, LastErrno};

/// An index into a kernel ring.
///
/// This is _not_ a pure offset; a masking with the ring size is needed to
/// reach the slot. The kernel requires power-of-two ring sizes so producer
/// and consumer heads can run freely over the 32-bit range, silently mapping
/// onto the same slots.
#[repr(transparent)]
#[derive(Debug, Copy, Clone)]
pub(crate) struct SlotIdx(pub(crate) u32);

struct RingMap {
    addr: NonNull<[u8]>,
}

impl Drop for RingMap {
    fn drop(&mut self) {
        let len = ptr_len(self.addr.as_ptr());
        unsafe { libc::munmap(self.addr.as_ptr() as *mut _, len) };
    }
}

pub(crate) struct RingInner {
    /// _owned_ version of the producer head, may lag.
    cached_producer: u32,
    /// _owned_ version of the consumer head, may lag.
    cached_consumer: u32,
    /// Bit mask to map head values onto slot indices.
    mask: u32,
    /// Number of entries (= mask + 1).
    size: u32,
    /// The mmaped producer head.
    ///
    /// Lifetime static, but points into the mmap area; the `map` field below
    /// keeps that mapping alive for as long as this struct.
    producer: &'static AtomicU32,
    /// The mmaped consumer head.
    consumer: &'static AtomicU32,
    /// Base of the slot array.
    slots: NonNull<libc::c_void>,
    /// The mmaped flags word.
    flags: NonNull<u32>,
    map: RingMap,
}

impl RingInner {
    /// Map one ring of the socket.
    ///
    /// # Safety
    ///
    /// `off` must be the offsets the kernel returned for `fd` and the
    /// matching ring sizes must have been configured on the socket, otherwise
    /// the computed mapping length lies about the kernel's layout.
    unsafe fn map(
        fd: &SocketFd,
        off: &XdpRingOffsets,
        count: u32,
        slot_size: u64,
        pgoff: libc::off_t,
    ) -> Result<Self, Errno> {
        debug_assert!(count.is_power_of_two());
        let len = (off.desc + u64::from(count) * slot_size) as usize;

        let mmap = libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_POPULATE,
            fd.0,
            pgoff,
        );

        if mmap == libc::MAP_FAILED {
            return Err(LastErrno)?;
        }

        let base = mmap as *mut u8;
        let trust_offset = |off: u64| NonNull::new_unchecked(base.offset(off as isize));

        let producer: &'static AtomicU32 = trust_offset(off.producer).cast().as_ref();
        let consumer: &'static AtomicU32 = trust_offset(off.consumer).cast().as_ref();

        let map = RingMap {
            addr: NonNull::new_unchecked(core::ptr::slice_from_raw_parts_mut(base, len)),
        };

        Ok(RingInner {
            cached_producer: producer.load(Ordering::Relaxed),
            cached_consumer: consumer.load(Ordering::Relaxed),
            mask: count - 1,
            size: count,
            producer,
            consumer,
            slots: trust_offset(off.desc).cast(),
            flags: trust_offset(off.flags).cast(),
            map,
        })
    }

    fn check_flags(&self) -> u32 {
        unsafe { self.flags.as_ptr().read_volatile() }
    }
}

/// A ring we produce into; the kernel consumes (fill, tx).
pub(crate) struct ProdRing {
    inner: RingInner,
}

/// A ring the kernel produces into; we consume (rx, completion).
pub(crate) struct ConsRing {
    inner: RingInner,
}

// Each ring end is owned by exactly one worker thread; the kernel side is
// synchronized by the acquire/release edges of the head updates.
unsafe impl Send for ProdRing {}
unsafe impl Send for ConsRing {}

impl ProdRing {
    pub(crate) fn fill(fd: &SocketFd, off: &MmapOffsets, count: u32) -> Result<Self, Errno> {
        let inner = unsafe {
            RingInner::map(
                fd,
                &off.inner.fr,
                count,
                core::mem::size_of::<u64>() as u64,
                xdp::XDP_UMEM_PGOFF_FILL_RING,
            )
        }?;
        Ok(ProdRing { inner })
    }

    pub(crate) fn tx(fd: &SocketFd, off: &MmapOffsets, count: u32) -> Result<Self, Errno> {
        let inner = unsafe {
            RingInner::map(
                fd,
                &off.inner.tx,
                count,
                core::mem::size_of::<XdpDesc>() as u64,
                xdp::XDP_PGOFF_TX_RING,
            )
        }?;
        Ok(ProdRing { inner })
    }

    /// Address of the `u64` frame slot behind `idx` (fill ring layout).
    ///
    /// # Safety
    ///
    /// `idx` must come from a `reserve` on this very ring.
    pub(crate) unsafe fn addr_slot(&self, idx: SlotIdx) -> NonNull<u64> {
        let offset = (idx.0 & self.inner.mask) as isize;
        let base = self.inner.slots.cast::<u64>().as_ptr();
        NonNull::new_unchecked(base.offset(offset))
    }

    /// Address of the descriptor slot behind `idx` (tx ring layout).
    ///
    /// # Safety
    ///
    /// `idx` must come from a `reserve` on this very ring.
    pub(crate) unsafe fn desc_slot(&self, idx: SlotIdx) -> NonNull<XdpDesc> {
        let offset = (idx.0 & self.inner.mask) as isize;
        let base = self.inner.slots.cast::<XdpDesc>().as_ptr();
        NonNull::new_unchecked(base.offset(offset))
    }

    /// Query for up to `nb` free entries.
    ///
    /// Small requests are answered from the cached consumer head; larger ones
    /// refresh it from the shared atomic.
    fn count_free(&mut self, nb: u32) -> u32 {
        let free = self
            .inner
            .cached_consumer
            .wrapping_sub(self.inner.cached_producer);

        if free >= nb {
            return free;
        }

        self.inner.cached_consumer = self.inner.consumer.load(Ordering::Acquire);
        // The kernel consumer trails our producer by at most `size`; shifting
        // the cached copy up by the ring size turns the difference below into
        // the exact count of free slots, wrap-around included.
        self.inner.cached_consumer = self.inner.cached_consumer.wrapping_add(self.inner.size);

        self.inner
            .cached_consumer
            .wrapping_sub(self.inner.cached_producer)
    }

    /// Reserve up to `nb` slots; returns the base index and the count (which
    /// may be zero, never partial below `min`).
    pub(crate) fn reserve(&mut self, min: u32, nb: u32) -> (SlotIdx, u32) {
        let free = self.count_free(nb).min(nb);
        if free < min {
            return (SlotIdx(self.inner.cached_producer), 0);
        }

        let base = SlotIdx(self.inner.cached_producer);
        self.inner.cached_producer = self.inner.cached_producer.wrapping_add(free);
        (base, free)
    }

    /// Roll back part of a reservation.
    pub(crate) fn cancel(&mut self, nb: u32) {
        self.inner.cached_producer = self.inner.cached_producer.wrapping_sub(nb);
    }

    /// Publish `nb` written slots to the kernel.
    pub(crate) fn submit(&mut self, nb: u32) {
        // We are the only writer, all other writes are ordered before.
        let cur = self.inner.producer.load(Ordering::Relaxed);
        // When the kernel reads it, all writes to slots must be ordered
        // before this write to the head; this is the synchronization edge.
        self.inner
            .producer
            .store(cur.wrapping_add(nb), Ordering::Release);
    }

    pub(crate) fn needs_wakeup(&self) -> bool {
        self.inner.check_flags() & xdp::XDP_RING_NEED_WAKEUP != 0
    }
}

impl ConsRing {
    pub(crate) fn comp(fd: &SocketFd, off: &MmapOffsets, count: u32) -> Result<Self, Errno> {
        let inner = unsafe {
            RingInner::map(
                fd,
                &off.inner.cr,
                count,
                core::mem::size_of::<u64>() as u64,
                xdp::XDP_UMEM_PGOFF_COMPLETION_RING,
            )
        }?;
        Ok(ConsRing { inner })
    }

    pub(crate) fn rx(fd: &SocketFd, off: &MmapOffsets, count: u32) -> Result<Self, Errno> {
        let inner = unsafe {
            RingInner::map(
                fd,
                &off.inner.rx,
                count,
                core::mem::size_of::<XdpDesc>() as u64,
                xdp::XDP_PGOFF_RX_RING,
            )
        }?;
        Ok(ConsRing { inner })
    }

    /// Address of the `u64` frame slot behind `idx` (completion ring layout).
    ///
    /// # Safety
    ///
    /// `idx` must come from a `peek` on this very ring.
    pub(crate) unsafe fn addr_slot(&self, idx: SlotIdx) -> NonNull<u64> {
        let offset = (idx.0 & self.inner.mask) as isize;
        let base = self.inner.slots.cast::<u64>().as_ptr();
        NonNull::new_unchecked(base.offset(offset))
    }

    /// Address of the descriptor slot behind `idx` (rx ring layout).
    ///
    /// # Safety
    ///
    /// `idx` must come from a `peek` on this very ring.
    pub(crate) unsafe fn desc_slot(&self, idx: SlotIdx) -> NonNull<XdpDesc> {
        let offset = (idx.0 & self.inner.mask) as isize;
        let base = self.inner.slots.cast::<XdpDesc>().as_ptr();
        NonNull::new_unchecked(base.offset(offset))
    }

    fn count_available(&mut self, nb: u32) -> u32 {
        let mut available = self
            .inner
            .cached_producer
            .wrapping_sub(self.inner.cached_consumer);

        if available == 0 {
            self.inner.cached_producer = self.inner.producer.load(Ordering::Acquire);
            available = self
                .inner
                .cached_producer
                .wrapping_sub(self.inner.cached_consumer);
        }

        available.min(nb)
    }

    /// Claim up to `nb` filled slots; returns the base index and the count.
    pub(crate) fn peek(&mut self, nb: u32) -> (SlotIdx, u32) {
        let count = self.count_available(nb);
        let base = SlotIdx(self.inner.cached_consumer);
        self.inner.cached_consumer = self.inner.cached_consumer.wrapping_add(count);
        (base, count)
    }

    /// Roll back part of a peek.
    pub(crate) fn cancel(&mut self, nb: u32) {
        self.inner.cached_consumer = self.inner.cached_consumer.wrapping_sub(nb);
    }

    /// Return `nb` consumed slots to the kernel.
    pub(crate) fn release(&mut self, nb: u32) {
        // We are the only writer, all other writes are ordered before.
        let cur = self.inner.consumer.load(Ordering::Relaxed);
        // All our reads from slots must be ordered before this write to the
        // head; this is the synchronization edge.
        self.inner
            .consumer
            .store(cur.wrapping_add(nb), Ordering::Release);
    }
}
