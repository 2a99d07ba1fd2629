// Please see the respective Linux documentation (if_xdp.h) instead.
#![allow(missing_docs)]

pub const SOL_XDP: libc::c_int = 283;

/* Socket options for SOL_XDP. */
pub const XDP_MMAP_OFFSETS: libc::c_int = 1;
pub const XDP_RX_RING: libc::c_int = 2;
pub const XDP_TX_RING: libc::c_int = 3;
pub const XDP_UMEM_REG: libc::c_int = 4;
pub const XDP_UMEM_FILL_RING: libc::c_int = 5;
pub const XDP_UMEM_COMPLETION_RING: libc::c_int = 6;
pub const XDP_STATISTICS: libc::c_int = 7;
pub const XDP_OPTIONS: libc::c_int = 8;

/* Mmap page offsets selecting the ring behind an XDP socket fd. */
pub const XDP_PGOFF_RX_RING: libc::off_t = 0;
pub const XDP_PGOFF_TX_RING: libc::off_t = 0x80000000;
pub const XDP_UMEM_PGOFF_FILL_RING: libc::off_t = 0x100000000;
pub const XDP_UMEM_PGOFF_COMPLETION_RING: libc::off_t = 0x180000000;

/// Flag in a ring's mmaped flags word: the kernel wants a wakeup syscall.
pub const XDP_RING_NEED_WAKEUP: u32 = 1 << 0;

bitflags::bitflags! {
    /// Flags for the `sockaddr_xdp` passed to `bind`.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct BindFlags: u16 {
        const XDP_SHARED_UMEM = 1 << 0;
        /// Force copy mode between kernel frames and the umem.
        const XDP_COPY = 1 << 1;
        /// Force zerocopy mode; bind fails if the driver can not.
        const XDP_ZEROCOPY = 1 << 2;
        /// Only wake the kernel rings when it asks for it.
        const XDP_USE_NEED_WAKEUP = 1 << 3;
        /// Opt into multi-buffer (segmented jumbo) packets.
        const XDP_USE_SG = 1 << 4;
    }
}

/// Rx/Tx descriptor.
///
/// The layout of this struct is part of the kernel interface.
#[repr(C)]
#[derive(Default, Debug, Copy, Clone)]
pub struct XdpDesc {
    /// Full address of this descriptor.
    pub addr: u64,
    /// Logical length of the buffer referenced by the descriptor.
    pub len: u32,
    /// A bitfield of options.
    pub options: u32,
}

impl XdpDesc {
    /// Option bit: a non-final segment of a multi-buffer packet. The chain
    /// ends with the first descriptor that does not carry this bit.
    pub const PKT_CONTD: u32 = 1 << 0;
}

/// Argument to `setsockopt(_, SOL_XDP, XDP_UMEM_REG)`.
///
/// Note that this struct's size determines the kernel interpretation of the
/// option. In particular, padding passes garbage to the kernel while
/// indicating said garbage as values!
#[repr(C)]
#[derive(Default, Debug, Copy, Clone)]
pub struct XdpUmemReg {
    pub addr: u64,
    pub len: u64,
    pub chunk_size: u32,
    pub headroom: u32,
    pub flags: u32,
    pub tx_metadata_len: u32,
}

const _NO_PADDING: () = {
    assert!(
        core::mem::size_of::<XdpUmemReg>()
        // For each field. Keep in sync.
            == (core::mem::size_of::<u64>()
                + core::mem::size_of::<u64>()
                + core::mem::size_of::<u32>()
                + core::mem::size_of::<u32>()
                + core::mem::size_of::<u32>()
                + core::mem::size_of::<u32>())
    );
};

/// The mmap-offsets to use for mapping one ring of an XDP socket.
#[repr(C)]
#[derive(Default, Debug, Copy, Clone)]
pub struct XdpRingOffsets {
    /// the relative address of the producer.
    pub producer: u64,
    /// the relative address of the consumer.
    pub consumer: u64,
    /// the relative address of the descriptor.
    pub desc: u64,
    /// the relative address of the flags area.
    pub flags: u64,
}

/// The different offsets as returned by the kernel, for all rings of a socket.
#[repr(C)]
#[derive(Default, Debug, Copy, Clone)]
pub struct XdpMmapOffsets {
    pub rx: XdpRingOffsets,
    pub tx: XdpRingOffsets,
    /// Fill ring offset.
    pub fr: XdpRingOffsets,
    /// Completion ring offset.
    pub cr: XdpRingOffsets,
}

/// Prior version of XdpRingOffsets (<= Linux 5.3).
#[repr(C)]
#[derive(Default, Debug, Copy, Clone)]
pub struct XdpRingOffsetsV1 {
    /// the relative address of the producer.
    pub producer: u64,
    /// the relative address of the consumer.
    pub consumer: u64,
    /// the relative address of the descriptor.
    pub desc: u64,
}

/// Prior version of XdpMmapOffsets (<= Linux 5.3).
#[repr(C)]
#[derive(Default, Debug, Copy, Clone)]
pub struct XdpMmapOffsetsV1 {
    /// Offsets for the receive ring (kernel produced).
    pub rx: XdpRingOffsetsV1,
    /// Offsets for the transmit ring (user produced).
    pub tx: XdpRingOffsetsV1,
    /// Offsets for the fill ring (user produced).
    pub fr: XdpRingOffsetsV1,
    /// Offsets for the completion ring (kernel produced).
    pub cr: XdpRingOffsetsV1,
}

#[repr(C)]
#[doc(alias = "sockaddr_xdp")]
#[derive(Debug, Copy, Clone)]
pub struct SockAddrXdp {
    #[doc(alias = "sxdp_family")]
    pub family: u16,
    #[doc(alias = "sxdp_flags")]
    pub flags: u16,
    #[doc(alias = "sxdp_ifindex")]
    pub ifindex: u32,
    #[doc(alias = "sxdp_queue_id")]
    pub queue_id: u32,
    #[doc(alias = "sxdp_shared_umem_fd")]
    pub shared_umem_fd: u32,
}

impl Default for SockAddrXdp {
    fn default() -> Self {
        SockAddrXdp {
            family: libc::AF_XDP as u16,
            flags: 0,
            ifindex: 0,
            queue_id: 0,
            shared_umem_fd: 0,
        }
    }
}

/// Per-socket counters as filled in by `XDP_STATISTICS`.
///
/// Kernels before 5.9 only know the first three fields; the accessor zeroes
/// the remainder in that case.
#[repr(C)]
#[doc(alias = "xdp_statistics")]
#[derive(Debug, Default, Copy, Clone)]
pub struct XdpStatistics {
    /// Dropped for reasons other than invalid descriptors, e.g. a full rx
    /// ring. The closest analog of a NIC's `imissed` counter.
    pub rx_dropped: u64,
    pub rx_invalid_descs: u64,
    pub tx_invalid_descs: u64,
    // Only set on >= Linux 5.9
    pub rx_ring_full: u64,
    // Only set on >= Linux 5.9
    pub rx_fill_ring_empty_descs: u64,
    // Only set on >= Linux 5.9
    pub tx_ring_empty_descs: u64,
}
