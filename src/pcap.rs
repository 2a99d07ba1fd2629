//! The classic capture-file layout, nanosecond flavor.
//!
//! Fields are written in host byte order; the magic tells readers which way
//! around the file is. Block alignment for direct I/O is kept by well-formed
//! padding records that any compliant reader will skip over.

/// Magic selecting nanosecond fractional timestamps.
pub const MAGIC_NSEC: u32 = 0xa1b23c4d;
/// Link type of every file we produce.
pub const LINKTYPE_ETHERNET: u32 = 1;

pub const FILE_HEADER_LEN: usize = 24;
pub const PACKET_HEADER_LEN: usize = 16;

/// Filler for padding records, repeated over the payload.
pub const PAD_TEXT: &[u8] = b"Padding packet, please ignore. ";

/// The 24-byte file preface.
///
/// The layout of this struct is the on-disk format.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct FileHeader {
    pub magic: u32,
    pub version_major: u16,
    pub version_minor: u16,
    /// GMT to local correction; always 0.
    pub thiszone: i32,
    /// Accuracy of timestamps; always 0.
    pub sigfigs: u32,
    /// Advertised capture cap. Nothing is truncated; the MTU bounds packets.
    pub snaplen: u32,
    /// Data link type.
    pub network: u32,
}

/// The 16-byte per-packet preface.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct PacketHeader {
    pub seconds: u32,
    pub nanoseconds: u32,
    /// Bytes present in the file.
    pub captured_len: u32,
    /// Bytes on the wire; always equal to `captured_len`.
    pub wire_len: u32,
}

const _NO_PADDING: () = {
    assert!(core::mem::size_of::<FileHeader>() == FILE_HEADER_LEN);
    assert!(core::mem::size_of::<PacketHeader>() == PACKET_HEADER_LEN);
};

impl FileHeader {
    pub fn new(snaplen: u32) -> Self {
        FileHeader {
            magic: MAGIC_NSEC,
            version_major: 2,
            version_minor: 4,
            thiszone: 0,
            sigfigs: 0,
            snaplen,
            network: LINKTYPE_ETHERNET,
        }
    }

    pub fn write_to(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.magic.to_ne_bytes());
        out[4..6].copy_from_slice(&self.version_major.to_ne_bytes());
        out[6..8].copy_from_slice(&self.version_minor.to_ne_bytes());
        out[8..12].copy_from_slice(&self.thiszone.to_ne_bytes());
        out[12..16].copy_from_slice(&self.sigfigs.to_ne_bytes());
        out[16..20].copy_from_slice(&self.snaplen.to_ne_bytes());
        out[20..24].copy_from_slice(&self.network.to_ne_bytes());
    }
}

impl PacketHeader {
    pub fn write_to(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.seconds.to_ne_bytes());
        out[4..8].copy_from_slice(&self.nanoseconds.to_ne_bytes());
        out[8..12].copy_from_slice(&self.captured_len.to_ne_bytes());
        out[12..16].copy_from_slice(&self.wire_len.to_ne_bytes());
    }
}

/// Turn `region` into one padding record covering it exactly.
///
/// The record's length fields count everything behind the 16-byte header.
/// Payload bytes beyond the 14-byte link-header minimum are filled with
/// whole copies of [`PAD_TEXT`]; a shorter remainder stays zero.
pub fn write_pad_packet(region: &mut [u8]) {
    debug_assert!(region.len() >= PACKET_HEADER_LEN);
    let payload_len = (region.len() - PACKET_HEADER_LEN) as u32;

    let header = PacketHeader {
        seconds: 0,
        nanoseconds: 0,
        captured_len: payload_len,
        wire_len: payload_len,
    };
    header.write_to(region);

    let text_start = PACKET_HEADER_LEN + 14;
    if region.len() > text_start {
        for chunk in region[text_start..].chunks_mut(PAD_TEXT.len()) {
            if chunk.len() == PAD_TEXT.len() {
                chunk.copy_from_slice(PAD_TEXT);
            }
        }
    }
}

/// Build the first block of a file: header plus a pad record rounding it out
/// to `block.len()` bytes. A bare 24-byte block (buffered mode) gets no pad.
pub fn build_header_block(block: &mut [u8], snaplen: u32) {
    debug_assert!(block.len() >= FILE_HEADER_LEN);
    FileHeader::new(snaplen).write_to(block);

    if block.len() > FILE_HEADER_LEN {
        write_pad_packet(&mut block[FILE_HEADER_LEN..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_header_layout() {
        let mut buf = [0u8; FILE_HEADER_LEN];
        FileHeader::new(65535).write_to(&mut buf);

        assert_eq!(u32::from_ne_bytes(buf[0..4].try_into().unwrap()), 0xa1b23c4d);
        assert_eq!(u16::from_ne_bytes(buf[4..6].try_into().unwrap()), 2);
        assert_eq!(u16::from_ne_bytes(buf[6..8].try_into().unwrap()), 4);
        assert_eq!(i32::from_ne_bytes(buf[8..12].try_into().unwrap()), 0);
        assert_eq!(u32::from_ne_bytes(buf[12..16].try_into().unwrap()), 0);
        assert_eq!(u32::from_ne_bytes(buf[16..20].try_into().unwrap()), 65535);
        assert_eq!(u32::from_ne_bytes(buf[20..24].try_into().unwrap()), 1);
    }

    #[test]
    fn pad_packet_lengths_cover_region() {
        let mut buf = [0xffu8; 512];
        write_pad_packet(&mut buf);

        let captured = u32::from_ne_bytes(buf[8..12].try_into().unwrap());
        let wire = u32::from_ne_bytes(buf[12..16].try_into().unwrap());
        assert_eq!(captured, 512 - 16);
        assert_eq!(wire, captured);
        assert_eq!(u32::from_ne_bytes(buf[0..4].try_into().unwrap()), 0);
    }

    #[test]
    fn pad_packet_payload_repeats_filler() {
        let mut buf = [0xffu8; 256];
        write_pad_packet(&mut buf);

        let payload = &buf[16 + 14..];
        for chunk in payload.chunks(PAD_TEXT.len()) {
            if chunk.len() == PAD_TEXT.len() {
                assert_eq!(chunk, PAD_TEXT);
            } else {
                // Remainder shorter than the literal stays as-is (callers
                // zero the region first).
                assert!(chunk.iter().all(|&b| b == 0xff));
            }
        }
    }

    #[test]
    fn tiny_pad_packet_has_no_text() {
        // 20 bytes: header plus a 4-byte payload, below the 14-byte minimum.
        let mut buf = [0u8; 20];
        write_pad_packet(&mut buf);
        assert_eq!(u32::from_ne_bytes(buf[8..12].try_into().unwrap()), 4);
        assert!(buf[16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn header_block_is_header_plus_pad() {
        let mut block = vec![0u8; 4096];
        build_header_block(&mut block, 65535);

        assert_eq!(u32::from_ne_bytes(block[0..4].try_into().unwrap()), MAGIC_NSEC);
        let pad_captured = u32::from_ne_bytes(block[24 + 8..24 + 12].try_into().unwrap());
        assert_eq!(pad_captured as usize, 4096 - 24 - 16);
        assert_eq!(&block[24 + 16 + 14..24 + 16 + 14 + PAD_TEXT.len()], PAD_TEXT);
    }

    #[test]
    fn bare_header_block_for_buffered_mode() {
        let mut block = vec![0u8; FILE_HEADER_LEN];
        build_header_block(&mut block, 1500);
        assert_eq!(u32::from_ne_bytes(block[16..20].try_into().unwrap()), 1500);
    }
}
