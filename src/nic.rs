//! The poll-mode NIC layer.
//!
//! Each capture pipeline owns one AF_XDP socket whose fd carries everything:
//! the registered umem (the receive mempool), the fill and completion rings
//! through which frame ownership passes to and from the driver, and the rx
//! (and optionally tx) ring bound to one hardware queue. There is no sharing
//! between pipelines; exclusivity per (interface, queue) is enforced
//! process-wide.

mod pool;
mod port;
mod queue;
mod ring;

pub use pool::{FramePool, FramePoolConfig};
pub use port::{bring_up_port, PortConfig};
pub use queue::{bind_queue, BoundQueue, DeviceRings, QueueConfig, RxQueue, TxQueue};

use alloc_set::claimed_queues;
use core::ffi::CStr;
use std::sync::Arc;

use crate::xdp::{XdpMmapOffsets, XdpMmapOffsetsV1, XdpRingOffsets, XdpStatistics};
use crate::{Errno, LastErrno};

pub(crate) fn ptr_len(ptr: *mut [u8]) -> usize {
    (ptr as *mut [()]).len()
}

/// File descriptor of one AF_XDP socket.
///
/// Shared (`Arc`) between the owning worker and the stats reader; the kernel
/// side of every ring hangs off this one fd.
pub struct SocketFd(pub(crate) libc::c_int);

impl SocketFd {
    pub(crate) fn new() -> Result<Self, Errno> {
        let fd = unsafe { libc::socket(libc::AF_XDP, libc::SOCK_RAW, 0) };
        if fd < 0 {
            return Err(LastErrno)?;
        }
        Ok(SocketFd(fd))
    }

    pub fn as_raw_fd(&self) -> libc::c_int {
        self.0
    }

    pub(crate) fn set_opt<T>(&self, name: libc::c_int, val: &T) -> Result<(), Errno> {
        let err = unsafe {
            libc::setsockopt(
                self.0,
                crate::xdp::SOL_XDP,
                name,
                val as *const T as *const libc::c_void,
                core::mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if err != 0 {
            return Err(LastErrno)?;
        }
        Ok(())
    }

    pub(crate) fn get_opt<T>(&self, name: libc::c_int, val: &mut T) -> Result<libc::socklen_t, Errno> {
        let mut len = core::mem::size_of::<T>() as libc::socklen_t;
        let err = unsafe {
            libc::getsockopt(
                self.0,
                crate::xdp::SOL_XDP,
                name,
                val as *mut T as *mut libc::c_void,
                &mut len,
            )
        };
        if err != 0 {
            return Err(LastErrno)?;
        }
        Ok(len)
    }

    /// Read the kernel-side drop counters of this socket.
    ///
    /// On kernels that predate the extended statistics, the short form is
    /// accepted and the newer counters read zero.
    pub fn statistics(&self) -> Result<XdpStatistics, Errno> {
        let mut stats = XdpStatistics::default();
        let len = self.get_opt(crate::xdp::XDP_STATISTICS, &mut stats)?;
        if (len as usize) < core::mem::size_of::<XdpStatistics>() {
            stats.rx_ring_full = 0;
            stats.rx_fill_ring_empty_descs = 0;
            stats.tx_ring_empty_descs = 0;
        }
        Ok(stats)
    }
}

impl Drop for SocketFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

/// Identity of one hardware queue: interface index plus queue id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortQueue {
    pub ifindex: u32,
    pub queue_id: u32,
}

/// A named interface and the queue a pipeline binds on it.
#[derive(Clone, Copy)]
pub struct PortInfo {
    pub(crate) ctx: PortQueue,
    pub(crate) ifname: [libc::c_char; libc::IFNAMSIZ],
}

impl PortInfo {
    /// Resolve an interface by name, queue 0.
    ///
    /// Common interface names may be `enp8s0`, `lo`, `wg0`, etc. The
    /// name-to-index pair will be very similar to what would be returned by
    /// `ip link show`.
    pub fn from_name(st: &CStr) -> Result<Self, Errno> {
        let bytes = st.to_bytes_with_nul();

        let mut ifname = [b'\0' as libc::c_char; libc::IFNAMSIZ];
        if bytes.len() > ifname.len() {
            return Err(Errno::raw(libc::EINVAL));
        }

        let index = unsafe { libc::if_nametoindex(st.as_ptr()) };
        if index == 0 {
            return Err(LastErrno)?;
        }

        let bytes = unsafe { &*(bytes as *const _ as *const [libc::c_char]) };
        ifname[..bytes.len()].copy_from_slice(bytes);

        Ok(PortInfo {
            ctx: PortQueue {
                ifindex: index,
                queue_id: 0,
            },
            ifname,
        })
    }

    /// Configure the queue id.
    ///
    /// This does _not_ guarantee that this queue is valid, or actually
    /// exists. You'll find out during the bind call. Most other ways of
    /// querying such information could suffer from TOCTOU issues in any case.
    pub fn set_queue(&mut self, queue_id: u32) {
        self.ctx.queue_id = queue_id;
    }

    /// The `ifindex`, numeric ID of the interface in the kernel.
    pub fn ifindex(&self) -> u32 {
        self.ctx.ifindex
    }

    /// The queue ID previously set with `set_queue`.
    pub fn queue_id(&self) -> u32 {
        self.ctx.queue_id
    }

    /// The interface name as handed in at construction.
    pub fn name(&self) -> String {
        let cstr = unsafe { CStr::from_ptr(self.ifname.as_ptr()) };
        cstr.to_string_lossy().into_owned()
    }
}

mod alloc_set {
    use super::PortQueue;
    use spin::RwLock;
    use std::collections::BTreeSet;

    static CLAIMED: RwLock<BTreeSet<PortQueue>> = RwLock::new(BTreeSet::new());

    pub(super) fn claimed_queues() -> &'static RwLock<BTreeSet<PortQueue>> {
        &CLAIMED
    }
}

/// Exclusive claim on one (interface, queue) pair.
///
/// Two pipelines on the same queue would tear each other's rings apart; the
/// claim set refuses the second binder with `EBUSY`.
pub struct QueueClaim {
    ctx: PortQueue,
}

impl QueueClaim {
    pub fn take(ctx: PortQueue) -> Result<Self, Errno> {
        let mut lock = claimed_queues().write();
        if !lock.insert(ctx) {
            return Err(Errno::raw(libc::EBUSY));
        }
        Ok(QueueClaim { ctx })
    }
}

impl Drop for QueueClaim {
    fn drop(&mut self) {
        let mut lock = claimed_queues().write();
        lock.remove(&self.ctx);
    }
}

/// The socket's ring mmap offsets as returned by the kernel.
#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct MmapOffsets {
    pub(crate) inner: XdpMmapOffsets,
}

impl MmapOffsets {
    const OPT_V1: libc::socklen_t = core::mem::size_of::<XdpMmapOffsetsV1>() as libc::socklen_t;
    const OPT_LATEST: libc::socklen_t = core::mem::size_of::<XdpMmapOffsets>() as libc::socklen_t;

    /// Query the mmap offsets of an XDP socket, fixing up the pre-5.4 layout.
    pub(crate) fn new(sock: &SocketFd) -> Result<Self, Errno> {
        // The flags offset was implicit, directly behind the consumer.
        fn fixup_v1(v1: crate::xdp::XdpRingOffsetsV1) -> XdpRingOffsets {
            XdpRingOffsets {
                producer: v1.producer,
                consumer: v1.consumer,
                desc: v1.desc,
                flags: v1.consumer + core::mem::size_of::<u32>() as u64,
            }
        }

        #[repr(C)]
        union Offsets {
            v1: XdpMmapOffsetsV1,
            latest: XdpMmapOffsets,
            init: (),
        }

        let mut off = Offsets { init: () };
        match sock.get_opt(crate::xdp::XDP_MMAP_OFFSETS, &mut off)? {
            Self::OPT_V1 => {
                let v1 = unsafe { off.v1 };
                Ok(MmapOffsets {
                    inner: XdpMmapOffsets {
                        rx: fixup_v1(v1.rx),
                        tx: fixup_v1(v1.tx),
                        fr: fixup_v1(v1.fr),
                        cr: fixup_v1(v1.cr),
                    },
                })
            }
            Self::OPT_LATEST => Ok(MmapOffsets {
                inner: unsafe { off.latest },
            }),
            _ => Err(Errno::raw(libc::EINVAL)),
        }
    }
}

/// Convenience: a shared fd for use by the stats display.
pub type SharedFd = Arc<SocketFd>;
