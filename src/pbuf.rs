//! Staging buffers ("PBUFs").
//!
//! A PBUF is a large block-aligned byte region packet records are packed
//! into before a single vectored write. Exactly one owner at any instant:
//! the free ring, a capture worker, the full ring, or a writer worker; the
//! `Box` handle is the ownership token and hops between them.

use core::alloc::Layout;
use core::ptr::NonNull;

use crate::pcap::{PacketHeader, PACKET_HEADER_LEN};
use crate::{pcap, Error};

/// Start of an in-progress record; resolves to the header position.
#[derive(Debug, Copy, Clone)]
pub struct RecordMark {
    at: usize,
}

#[derive(Debug)]
pub struct PacketBuffer {
    data: NonNull<u8>,
    cap: usize,
    layout: Layout,
    /// Next free byte. Monotonically non-decreasing between resets.
    offset: usize,
    /// Records finished since the last reset.
    packets: u32,
}

// A PBUF is owned by exactly one worker at a time; the rings transfer it.
unsafe impl Send for PacketBuffer {}

impl PacketBuffer {
    /// Allocate a zeroed buffer of `cap` bytes, aligned to `align` (the disk
    /// logical block size, so vectored direct I/O accepts the base address).
    pub fn new(cap: usize, align: usize) -> Result<Box<Self>, Error> {
        let layout = Layout::from_size_align(cap, align)
            .map_err(|_| Error::Provision(format!("cannot lay out {} byte PBUF", cap)))?;

        let data = unsafe { std::alloc::alloc_zeroed(layout) };
        let data = NonNull::new(data)
            .ok_or_else(|| Error::Provision(format!("cannot allocate {} byte PBUF", cap)))?;

        Ok(Box::new(PacketBuffer {
            data,
            cap,
            layout,
            offset: 0,
            packets: 0,
        }))
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Bytes packed so far.
    pub fn len(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    pub fn packets(&self) -> u32 {
        self.packets
    }

    /// Stamp the packet count carried to the writer at handoff.
    pub fn set_packets(&mut self, packets: u32) {
        self.packets = packets;
    }

    /// The packed region, for the writer's scatter-gather list.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.data.as_ptr(), self.offset) }
    }

    /// The whole region, regardless of fill level.
    ///
    /// Used for the writer's header-block scratch, which is a PBUF of one
    /// disk block so it shares the alignment guarantee.
    pub fn whole_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.data.as_ptr(), self.cap) }
    }

    /// Shared view of the whole region.
    pub fn whole(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.data.as_ptr(), self.cap) }
    }

    fn region_mut(&mut self, from: usize, len: usize) -> &mut [u8] {
        debug_assert!(from + len <= self.cap);
        unsafe { core::slice::from_raw_parts_mut(self.data.as_ptr().add(from), len) }
    }

    /// Reserve header space for a record whose length is not yet known.
    pub fn begin_record(&mut self) -> RecordMark {
        let at = self.offset;
        self.offset += PACKET_HEADER_LEN;
        RecordMark { at }
    }

    /// Append payload bytes to the open record.
    ///
    /// The watermark policy guarantees a burst always fits; this is checked,
    /// not handled.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(self.offset + bytes.len() <= self.cap);
        self.region_mut(self.offset, bytes.len()).copy_from_slice(bytes);
        self.offset += bytes.len();
    }

    /// Abandon an open record (a segment chain that could not complete).
    pub fn truncate_to(&mut self, mark: RecordMark) {
        debug_assert!(mark.at <= self.offset);
        self.offset = mark.at;
    }

    /// Close the open record with a wall-clock timestamp.
    pub fn finish_record(&mut self, mark: RecordMark, seconds: u32, nanoseconds: u32) {
        let len = (self.offset - mark.at - PACKET_HEADER_LEN) as u32;
        let header = PacketHeader {
            seconds,
            nanoseconds,
            captured_len: len,
            wire_len: len,
        };
        header.write_to(self.region_mut(mark.at, PACKET_HEADER_LEN));
        self.packets += 1;
    }

    /// Close the open record from the hardware trailer: the last 12 bytes of
    /// the packet carry big-endian seconds, big-endian nanoseconds and 4
    /// reserved bytes. The trailer stays part of the record.
    pub fn finish_record_trailer(&mut self, mark: RecordMark) {
        let len = self.offset - mark.at - PACKET_HEADER_LEN;
        debug_assert!(len >= 12, "frame too short for a timestamp trailer");

        let (seconds, nanoseconds) = if len >= 12 {
            let trailer = self.region_mut(self.offset - 12, 8);
            (
                u32::from_be_bytes(trailer[0..4].try_into().unwrap()),
                u32::from_be_bytes(trailer[4..8].try_into().unwrap()),
            )
        } else {
            (0, 0)
        };

        self.finish_record(mark, seconds, nanoseconds);
    }

    /// Round the buffer down to a block boundary for handoff, moving the
    /// unaligned tail into `stash` (cleared first). The stashed bytes belong
    /// to the next buffer; the stashed packets stay accounted here.
    pub fn split_tail(&mut self, block: usize, stash: &mut Vec<u8>) {
        stash.clear();
        let overrun = self.offset % block;
        if overrun > 0 {
            let start = self.offset - overrun;
            stash.extend_from_slice(&self.as_slice()[start..]);
            self.offset = start;
        }
    }

    /// Start a fresh buffer from a stashed tail.
    pub fn replay_tail(&mut self, stash: &[u8]) {
        debug_assert_eq!(self.offset, 0);
        self.region_mut(0, stash.len()).copy_from_slice(stash);
        self.offset = stash.len();
    }

    /// Final-flush padding: zero-fill up to the next block boundary and lay
    /// a pad record over the fill if it is large enough to hold a header.
    ///
    /// A buffer that is already aligned still gains one full pad block, as
    /// the underrun of an aligned offset is `block`, not zero.
    pub fn pad_to_block(&mut self, block: usize) {
        let underrun = block - (self.offset % block);
        let at = self.offset;
        debug_assert!(at + underrun <= self.cap);

        self.region_mut(at, underrun).fill(0);
        if underrun > PACKET_HEADER_LEN {
            pcap::write_pad_packet(self.region_mut(at, underrun));
        }
        self.offset += underrun;
    }

    /// Ready the buffer for the next fill cycle (writer side, after the
    /// bytes left through `writev`).
    pub fn reset(&mut self) {
        self.offset = 0;
        self.packets = 0;
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.data.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_at(buf: &PacketBuffer, at: usize) -> (u32, u32, u32, u32) {
        let b = buf.as_slice();
        (
            u32::from_ne_bytes(b[at..at + 4].try_into().unwrap()),
            u32::from_ne_bytes(b[at + 4..at + 8].try_into().unwrap()),
            u32::from_ne_bytes(b[at + 8..at + 12].try_into().unwrap()),
            u32::from_ne_bytes(b[at + 12..at + 16].try_into().unwrap()),
        )
    }

    #[test]
    fn record_roundtrip() {
        let mut buf = PacketBuffer::new(4096, 4096).unwrap();
        let mark = buf.begin_record();
        buf.push_bytes(&[0xaa; 100]);
        buf.finish_record(mark, 7, 500);

        assert_eq!(buf.len(), 116);
        assert_eq!(buf.packets(), 1);
        let (sec, nsec, cap, wire) = header_at(&buf, 0);
        assert_eq!((sec, nsec, cap, wire), (7, 500, 100, 100));
        assert!(buf.as_slice()[16..116].iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn segmented_record_is_contiguous() {
        let mut buf = PacketBuffer::new(1 << 16, 4096).unwrap();
        let mark = buf.begin_record();
        buf.push_bytes(&vec![0x11; 5000]);
        buf.push_bytes(&vec![0x22; 3000]);
        buf.finish_record(mark, 1, 2);

        let (_, _, cap, wire) = header_at(&buf, 0);
        assert_eq!(cap, 8000);
        assert_eq!(wire, 8000);
        assert!(buf.as_slice()[16..16 + 5000].iter().all(|&b| b == 0x11));
        assert!(buf.as_slice()[16 + 5000..16 + 8000].iter().all(|&b| b == 0x22));
    }

    #[test]
    fn trailer_timestamps_are_big_endian() {
        let mut buf = PacketBuffer::new(4096, 4096).unwrap();
        let mark = buf.begin_record();
        let mut frame = vec![0u8; 60];
        frame[48..52].copy_from_slice(&0x0102_0304u32.to_be_bytes());
        frame[52..56].copy_from_slice(&1_000_000u32.to_be_bytes());
        buf.push_bytes(&frame);
        buf.finish_record_trailer(mark);

        let (sec, nsec, cap, _) = header_at(&buf, 0);
        assert_eq!(sec, 0x0102_0304);
        assert_eq!(nsec, 1_000_000);
        // The trailer is not stripped.
        assert_eq!(cap, 60);
    }

    #[test]
    fn split_tail_and_replay() {
        let mut buf = PacketBuffer::new(4096 * 4, 4096).unwrap();
        let mark = buf.begin_record();
        buf.push_bytes(&vec![0x33; 5000]);
        buf.finish_record(mark, 0, 0);
        assert_eq!(buf.len(), 5016);

        let mut stash = Vec::new();
        buf.split_tail(4096, &mut stash);
        assert_eq!(buf.len(), 4096);
        assert_eq!(stash.len(), 5016 - 4096);

        let mut next = PacketBuffer::new(4096 * 4, 4096).unwrap();
        next.replay_tail(&stash);
        assert_eq!(next.len(), 920);
        // Continuation bytes line up with where the old buffer stopped.
        assert_eq!(next.as_slice()[0], 0x33);
    }

    #[test]
    fn split_tail_noop_when_aligned() {
        let mut buf = PacketBuffer::new(4096 * 2, 4096).unwrap();
        let mark = buf.begin_record();
        buf.push_bytes(&vec![0u8; 4096 - 16]);
        buf.finish_record(mark, 0, 0);

        let mut stash = vec![0xde];
        buf.split_tail(4096, &mut stash);
        assert!(stash.is_empty());
        assert_eq!(buf.len(), 4096);
    }

    #[test]
    fn pad_to_block_writes_pad_record() {
        let mut buf = PacketBuffer::new(4096 * 2, 4096).unwrap();
        let mark = buf.begin_record();
        buf.push_bytes(&[1; 100]);
        buf.finish_record(mark, 0, 0);

        buf.pad_to_block(4096);
        assert_eq!(buf.len(), 4096);

        let (_, _, cap, _) = header_at(&buf, 116);
        assert_eq!(cap as usize, 4096 - 116 - 16);
        let text_at = 116 + 16 + 14;
        assert_eq!(
            &buf.as_slice()[text_at..text_at + crate::pcap::PAD_TEXT.len()],
            crate::pcap::PAD_TEXT
        );
    }

    #[test]
    fn pad_to_block_on_aligned_buffer_adds_full_block() {
        let mut buf = PacketBuffer::new(4096 * 2, 4096).unwrap();
        let mark = buf.begin_record();
        buf.push_bytes(&vec![0u8; 4096 - 16]);
        buf.finish_record(mark, 0, 0);
        assert_eq!(buf.len() % 4096, 0);

        buf.pad_to_block(4096);
        assert_eq!(buf.len(), 4096 * 2);
    }

    #[test]
    fn reset_clears_counters() {
        let mut buf = PacketBuffer::new(4096, 4096).unwrap();
        let mark = buf.begin_record();
        buf.push_bytes(&[0; 32]);
        buf.finish_record(mark, 0, 0);
        buf.set_packets(9);

        buf.reset();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.packets(), 0);
    }
}
