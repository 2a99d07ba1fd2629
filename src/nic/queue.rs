//! Queue binding and the burst-level ring access used on the data path.

use std::sync::Arc;

use crate::nic::ring::{ConsRing, ProdRing, SlotIdx};
use crate::nic::{FramePool, MmapOffsets, PortInfo, QueueClaim, SocketFd};
use crate::xdp::{self, BindFlags, SockAddrXdp, XdpDesc};
use crate::{Errno, Error, LastErrno};

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Entries in the rx ring (the "rx descriptor" depth).
    pub rx_size: u32,
    /// Entries in the tx ring; `None` for capture-only queues.
    pub tx_size: Option<u32>,
    /// Entries in the fill ring.
    pub fill_size: u32,
    /// Entries in the completion ring.
    pub complete_size: u32,
    pub bind_flags: BindFlags,
}

/// The fill/completion pair: frame ownership to and from the driver.
pub struct DeviceRings {
    fill: ProdRing,
    comp: ConsRing,
    fd: Arc<SocketFd>,
}

/// The receive ring of one bound queue.
pub struct RxQueue {
    ring: ConsRing,
    #[allow(dead_code)]
    fd: Arc<SocketFd>,
}

/// The transmit ring of one bound queue (PAUSE emission only).
pub struct TxQueue {
    ring: ProdRing,
    fd: Arc<SocketFd>,
}

/// Everything one pipeline needs from its bound socket.
pub struct BoundQueue {
    pub dev: DeviceRings,
    pub rx: RxQueue,
    pub tx: Option<TxQueue>,
    /// Held for the lifetime of the pipeline; dropping it releases the queue.
    pub claim: QueueClaim,
}

/// Configure all rings of the pool's socket and bind it to `info`'s queue.
pub fn bind_queue(pool: &FramePool, info: &PortInfo, cfg: &QueueConfig) -> Result<BoundQueue, Error> {
    let claim = QueueClaim::take(info.ctx).map_err(|e| {
        if e.raw_os_error() == libc::EBUSY {
            Error::Provision(format!(
                "queue {} of {} is already claimed by another pipeline",
                info.queue_id(),
                info.name()
            ))
        } else {
            e.context("cannot claim queue")
        }
    })?;

    let fd = pool.fd();

    fd.set_opt(xdp::XDP_UMEM_FILL_RING, &cfg.fill_size)
        .map_err(|e| e.context("cannot size fill ring"))?;
    fd.set_opt(xdp::XDP_UMEM_COMPLETION_RING, &cfg.complete_size)
        .map_err(|e| e.context("cannot size completion ring"))?;

    let off = MmapOffsets::new(fd).map_err(|e| e.context("cannot query ring offsets"))?;
    let fill = ProdRing::fill(fd, &off, cfg.fill_size).map_err(|e| e.context("cannot map fill ring"))?;
    let comp =
        ConsRing::comp(fd, &off, cfg.complete_size).map_err(|e| e.context("cannot map completion ring"))?;

    fd.set_opt(xdp::XDP_RX_RING, &cfg.rx_size)
        .map_err(|e| e.context("cannot size rx ring"))?;
    if let Some(tx_size) = cfg.tx_size {
        fd.set_opt(xdp::XDP_TX_RING, &tx_size)
            .map_err(|e| e.context("cannot size tx ring"))?;
    }

    let sxdp = SockAddrXdp {
        ifindex: info.ifindex(),
        queue_id: info.queue_id(),
        flags: cfg.bind_flags.bits(),
        ..SockAddrXdp::default()
    };

    if unsafe {
        libc::bind(
            fd.0,
            (&sxdp) as *const _ as *const libc::sockaddr,
            core::mem::size_of_val(&sxdp) as libc::socklen_t,
        )
    } != 0
    {
        return Err(Errno::from(LastErrno).context("cannot bind XDP socket to queue"));
    }

    // Ring offsets may move once the socket is bound (the kernel finalizes
    // the layout); query again before mapping rx/tx.
    let off = MmapOffsets::new(fd).map_err(|e| e.context("cannot query ring offsets"))?;
    let rx = ConsRing::rx(fd, &off, cfg.rx_size).map_err(|e| e.context("cannot map rx ring"))?;
    let tx = match cfg.tx_size {
        Some(tx_size) => {
            Some(ProdRing::tx(fd, &off, tx_size).map_err(|e| e.context("cannot map tx ring"))?)
        }
        None => None,
    };

    Ok(BoundQueue {
        dev: DeviceRings {
            fill,
            comp,
            fd: fd.clone(),
        },
        rx: RxQueue {
            ring: rx,
            fd: fd.clone(),
        },
        tx: tx.map(|ring| TxQueue {
            ring,
            fd: fd.clone(),
        }),
        claim,
    })
}

impl DeviceRings {
    /// Start a batch of up to `n` fill-ring insertions.
    pub fn fill(&mut self, n: u32) -> FillBatch<'_> {
        let (base, count) = self.fill.reserve(1, n);
        FillBatch {
            ring: &mut self.fill,
            base,
            count,
            written: 0,
        }
    }

    /// Reap up to `n` completed transmissions.
    pub fn complete(&mut self, n: u32) -> Completions<'_> {
        let (base, count) = self.comp.peek(n);
        Completions {
            ring: &mut self.comp,
            base,
            count,
            taken: 0,
        }
    }

    pub fn needs_wakeup(&self) -> bool {
        self.fill.needs_wakeup()
    }

    /// Poll the socket once to kick the fill ring, without sleeping.
    pub fn wake(&self) {
        let mut poll = libc::pollfd {
            fd: self.fd.0,
            events: 0,
            revents: 0,
        };
        let _err = unsafe { libc::poll(&mut poll as *mut _, 1, 0) };
    }
}

impl RxQueue {
    /// Receive up to `n` descriptors.
    ///
    /// The returned burst yields descriptors and releases the consumed ring
    /// slots when dropped. The frames themselves stay ours until their
    /// addresses are pushed back through the fill ring.
    pub fn receive(&mut self, n: u32) -> RxBurst<'_> {
        let (base, count) = self.ring.peek(n);
        RxBurst {
            ring: &mut self.ring,
            base,
            count,
            taken: 0,
        }
    }
}

impl TxQueue {
    /// Start a batch of up to `n` transmit descriptors.
    pub fn transmit(&mut self, n: u32) -> TxBatch<'_> {
        let (base, count) = self.ring.reserve(1, n);
        TxBatch {
            ring: &mut self.ring,
            base,
            count,
            written: 0,
        }
    }

    pub fn needs_wakeup(&self) -> bool {
        self.ring.needs_wakeup()
    }

    /// Send a message (with `MSG_DONTWAIT`) to wake up the transmit queue.
    pub fn wake(&self) {
        let _ = unsafe {
            libc::sendto(
                self.fd.0,
                core::ptr::null_mut(),
                0,
                libc::MSG_DONTWAIT,
                core::ptr::null_mut(),
                0,
            )
        };
    }
}

/// A claimed span of rx descriptors; iterate to read them.
///
/// Dropping the burst releases what was read and rolls back the rest, so an
/// abandoned iteration never loses descriptors.
pub struct RxBurst<'q> {
    ring: &'q mut ConsRing,
    base: SlotIdx,
    count: u32,
    taken: u32,
}

impl RxBurst<'_> {
    /// The total number of descriptors claimed for this burst.
    pub fn capacity(&self) -> u32 {
        self.count
    }

    /// Give back the last `n` descriptors read; they will be peeked again.
    ///
    /// Used when a segment chain runs off the end of the burst: its head
    /// descriptors return to the ring so the whole chain arrives together
    /// next time.
    pub fn rewind(&mut self, n: u32) {
        debug_assert!(n <= self.taken);
        self.taken -= n;
    }
}

impl Iterator for RxBurst<'_> {
    type Item = XdpDesc;

    fn next(&mut self) -> Option<XdpDesc> {
        if self.taken == self.count {
            return None;
        }
        let idx = SlotIdx(self.base.0.wrapping_add(self.taken));
        self.taken += 1;
        // Safety: the index is within the peeked span of this ring.
        Some(unsafe { *self.ring.desc_slot(idx).as_ptr() })
    }
}

impl Drop for RxBurst<'_> {
    fn drop(&mut self) {
        self.ring.release(self.taken);
        self.ring.cancel(self.count - self.taken);
    }
}

/// A claimed span of completion entries; iterate to read frame addresses.
pub struct Completions<'q> {
    ring: &'q mut ConsRing,
    base: SlotIdx,
    count: u32,
    taken: u32,
}

impl Iterator for Completions<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.taken == self.count {
            return None;
        }
        let idx = SlotIdx(self.base.0.wrapping_add(self.taken));
        self.taken += 1;
        // Safety: the index is within the peeked span of this ring.
        Some(unsafe { *self.ring.addr_slot(idx).as_ptr() })
    }
}

impl Drop for Completions<'_> {
    fn drop(&mut self) {
        self.ring.release(self.taken);
        self.ring.cancel(self.count - self.taken);
    }
}

/// A reserved span of fill-ring slots; push frame addresses into it.
///
/// Dropping the batch submits what was pushed and rolls back the rest.
pub struct FillBatch<'q> {
    ring: &'q mut ProdRing,
    base: SlotIdx,
    count: u32,
    written: u32,
}

impl FillBatch<'_> {
    /// The number of slots still writable.
    pub fn capacity(&self) -> u32 {
        self.count - self.written
    }

    /// Hand one frame back to the driver. Returns false once full.
    pub fn push(&mut self, addr: u64) -> bool {
        if self.written == self.count {
            return false;
        }
        let idx = SlotIdx(self.base.0.wrapping_add(self.written));
        // Safety: the index is within the reserved span of this ring.
        unsafe { *self.ring.addr_slot(idx).as_ptr() = addr };
        self.written += 1;
        true
    }
}

impl Drop for FillBatch<'_> {
    fn drop(&mut self) {
        self.ring.submit(self.written);
        self.ring.cancel(self.count - self.written);
    }
}

/// A reserved span of tx-ring slots; push descriptors into it.
pub struct TxBatch<'q> {
    ring: &'q mut ProdRing,
    base: SlotIdx,
    count: u32,
    written: u32,
}

impl TxBatch<'_> {
    pub fn capacity(&self) -> u32 {
        self.count - self.written
    }

    /// Queue one descriptor for transmission. Returns false once full.
    pub fn push(&mut self, desc: XdpDesc) -> bool {
        if self.written == self.count {
            return false;
        }
        let idx = SlotIdx(self.base.0.wrapping_add(self.written));
        // Safety: the index is within the reserved span of this ring.
        unsafe { *self.ring.desc_slot(idx).as_ptr() = desc };
        self.written += 1;
        true
    }
}

impl Drop for TxBatch<'_> {
    fn drop(&mut self) {
        self.ring.submit(self.written);
        self.ring.cancel(self.count - self.written);
    }
}
