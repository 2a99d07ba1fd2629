//! The receive mempool: a page-aligned umem carved into fixed-size frames.

use core::alloc::Layout;
use core::ptr::NonNull;
use std::sync::Arc;

use crate::nic::SocketFd;
use crate::xdp::{self, XdpUmemReg};
use crate::Error;

#[derive(Debug, Clone, Copy)]
pub struct FramePoolConfig {
    /// Total number of frames, a power of two.
    pub frame_count: u32,
    /// Size of one frame in bytes, a power of two (the "mbuf length").
    pub frame_size: u32,
    /// Reserved area at the start of each kernel-owned frame.
    pub headroom: u32,
    /// Frames held back from the fill ring, for PAUSE templates.
    pub reserve_tx: u32,
}

/// One pipeline's umem: the DMA target area registered with the socket.
///
/// The pool allocates its own area and keeps it for the whole run; the
/// kernel scribbles into whatever frames currently sit on the fill ring, we
/// read frames handed back through the rx ring. The last `reserve_tx` frames
/// never enter the fill ring and stay under user control.
pub struct FramePool {
    area: NonNull<u8>,
    len: usize,
    layout: Layout,
    config: FramePoolConfig,
    fd: Arc<SocketFd>,
}

// The pool is handed to exactly one capture worker; the kernel's concurrent
// frame writes are fenced by the ring protocol, not by `&mut`.
unsafe impl Send for FramePool {}

impl FramePool {
    /// Allocate the frame area and register it with a fresh AF_XDP socket.
    pub fn new(config: FramePoolConfig) -> Result<Self, Error> {
        assert!(config.frame_count.is_power_of_two());
        assert!(config.frame_size.is_power_of_two());
        assert!(config.reserve_tx < config.frame_count);

        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let len = config.frame_count as usize * config.frame_size as usize;
        let layout = Layout::from_size_align(len, page)
            .map_err(|_| Error::Provision(format!("umem of {} bytes is not layoutable", len)))?;

        // Zeroed so never-filled frames can not leak heap garbage to disk.
        let area = unsafe { std::alloc::alloc_zeroed(layout) };
        let area = NonNull::new(area)
            .ok_or_else(|| Error::Provision(format!("cannot allocate {} byte umem", len)))?;

        let fd = SocketFd::new().map_err(|e| e.context("cannot create AF_XDP socket"))?;

        let reg = XdpUmemReg {
            addr: area.as_ptr() as u64,
            len: len as u64,
            chunk_size: config.frame_size,
            headroom: config.headroom,
            ..XdpUmemReg::default()
        };

        if let Err(err) = fd.set_opt(xdp::XDP_UMEM_REG, &reg) {
            unsafe { std::alloc::dealloc(area.as_ptr(), layout) };
            return Err(err.context("cannot register umem"));
        }

        Ok(FramePool {
            area,
            len,
            layout,
            config,
            fd: Arc::new(fd),
        })
    }

    pub fn fd(&self) -> &Arc<SocketFd> {
        &self.fd
    }

    pub fn frame_size(&self) -> u32 {
        self.config.frame_size
    }

    /// Frame addresses available to the fill ring.
    pub fn rx_frames(&self) -> impl Iterator<Item = u64> {
        let size = self.config.frame_size as u64;
        (0..u64::from(self.config.frame_count - self.config.reserve_tx)).map(move |i| i * size)
    }

    /// Frame addresses of the reserved transmit tail.
    pub fn tx_frames(&self) -> impl Iterator<Item = u64> {
        let size = self.config.frame_size as u64;
        let first = u64::from(self.config.frame_count - self.config.reserve_tx);
        (first..u64::from(self.config.frame_count)).map(move |i| i * size)
    }

    /// Read the bytes of a received descriptor.
    ///
    /// # Safety
    ///
    /// `(addr, len)` must come from a descriptor the kernel just handed over
    /// on the rx ring (the frame is then owned by us until refilled), or from
    /// the reserved tx tail.
    pub unsafe fn bytes(&self, addr: u64, len: u32) -> &[u8] {
        debug_assert!(addr as usize + len as usize <= self.len);
        core::slice::from_raw_parts(self.area.as_ptr().add(addr as usize), len as usize)
    }

    /// Mutable access to one whole frame.
    ///
    /// # Safety
    ///
    /// The frame must be one the kernel can not currently write: a reserved
    /// tx frame, or one that is neither on the fill ring nor in flight.
    pub unsafe fn frame_mut(&self, addr: u64) -> &mut [u8] {
        debug_assert_eq!(addr % u64::from(self.config.frame_size), 0);
        debug_assert!(addr as usize + self.config.frame_size as usize <= self.len);
        core::slice::from_raw_parts_mut(
            self.area.as_ptr().add(addr as usize),
            self.config.frame_size as usize,
        )
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.area.as_ptr(), self.layout) };
    }
}
