//! The writer worker: drain full staging buffers to disk, rotate files.
//!
//! All bytes leave through a single vectored write per batch, in whole disk
//! blocks, so `O_DIRECT` stays happy. Write failures are logged and counted;
//! the capture side never learns about them and never stops.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, info, warn};

use crate::pbuf::PacketBuffer;
use crate::pcap::{self, FILE_HEADER_LEN};
use crate::ring::{Consumer, Producer};
use crate::stats::WriterStats;
use crate::Error;

/// Fallback when the logical block size can not be discovered.
pub const DISK_BLOCK_DEFAULT: usize = 4096;

/// Bound on a rendered output filename. Enforced here after every
/// `strftime` and probed once at configuration time, since expansion-prone
/// directives (`%A`, `%B`) can grow a template well past its literal length.
pub const RENDERED_NAME_MAX: usize = 192;

/// Consecutive observed-stop iterations before the drain gives up.
const DRAIN_BOUND: u32 = 9_999_999;

#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Logical core this worker is pinned to; rendered into `%COREID`.
    pub core_id: usize,
    /// Token-normalized template, `.pcap` included.
    pub output_template: String,
    pub snaplen: u32,
    pub disk_block: usize,
    /// Buffers dequeued per batch; the staging pool size.
    pub batch: usize,
    /// Start a new file every this many seconds (0: off).
    pub rotate_seconds: u64,
    /// Start a new file once the current one reaches this size (0: off).
    pub file_size_limit: u64,
}

fn now_sec() -> libc::time_t {
    unsafe { libc::time(core::ptr::null_mut()) }
}

/// Render the output filename: `%COREID` (2 digits), `%FCOUNT` (3 digits),
/// then the remainder through `strftime` with the file's start time.
pub fn render_filename(
    template: &str,
    core_id: usize,
    file_count: u32,
    start_sec: libc::time_t,
) -> Result<String, Error> {
    let name = template.replace("%COREID", &format!("{:02}", core_id));
    let name = name.replace("%FCOUNT", &format!("{:03}", file_count));

    let fmt = CString::new(name)
        .map_err(|_| Error::Config("output template contains a NUL byte".into()))?;

    let mut tm: libc::tm = unsafe { core::mem::zeroed() };
    unsafe { libc::localtime_r(&start_sec, &mut tm) };

    // The buffer is deliberately larger than the limit so an overlong
    // render is seen as such instead of as a bare strftime failure.
    let mut buf = [0u8; 2 * RENDERED_NAME_MAX];
    let n = unsafe {
        libc::strftime(
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            fmt.as_ptr(),
            &tm,
        )
    };
    if n == 0 || n > RENDERED_NAME_MAX {
        return Err(Error::Config(format!(
            "rendered output filename is empty or longer than {} bytes",
            RENDERED_NAME_MAX
        )));
    }

    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}

/// Discover the logical block size of the disk behind the output directory.
///
/// A temporary file next to the output reveals `st_dev`; sysfs then knows
/// the queue's logical block size. Anything that fails along the way keeps
/// the 4096 default (a device major of 0, e.g. tmpfs, silently so).
pub fn disk_block_size(template: &str) -> usize {
    let tmp_path = format!("{}_tmp_file", template);

    let dev = match OpenOptions::new()
        .create(true)
        .write(true)
        .mode(0o644)
        .open(&tmp_path)
        .and_then(|f| f.metadata())
    {
        Ok(meta) => meta.dev(),
        Err(err) => {
            warn!(
                "Could not open temporary file to read disk block size: {}",
                err
            );
            return DISK_BLOCK_DEFAULT;
        }
    };
    let _ = std::fs::remove_file(&tmp_path);

    let major = unsafe { libc::major(dev) };
    if major == 0 {
        return DISK_BLOCK_DEFAULT;
    }

    let sysfs = format!("/sys/dev/block/{}:0/queue/logical_block_size", major);
    match std::fs::read_to_string(&sysfs) {
        Ok(text) => match text.trim().parse::<usize>() {
            Ok(size) if size > 0 => size,
            _ => {
                warn!("Unparsable {}; using {}", sysfs, DISK_BLOCK_DEFAULT);
                DISK_BLOCK_DEFAULT
            }
        },
        Err(err) => {
            warn!("Could not read disk block size: {}", err);
            DISK_BLOCK_DEFAULT
        }
    }
}

/// Open a capture file and write its first block.
///
/// Opens with `O_DIRECT` first; if the filesystem refuses, falls back to
/// buffered writes for the rest of this worker's life (`direct` is cleared)
/// and only the bare 24-byte header is written, no padding record.
fn open_pcap(path: &str, header_block: &[u8], direct: &mut bool) -> Result<File, Error> {
    let mut opts = OpenOptions::new();
    opts.create(true).write(true).truncate(true).mode(0o644);

    let file = if *direct {
        match opts
            .clone()
            .custom_flags(libc::O_DIRECT | libc::O_NOATIME)
            .open(path)
        {
            Ok(file) => Some(file),
            Err(err) => {
                warn!("Could not open {} in direct write mode: {}", path, err);
                info!("Using normal write mode");
                *direct = false;
                None
            }
        }
    } else {
        None
    };

    let mut file = match file {
        Some(file) => file,
        None => opts
            .custom_flags(libc::O_NOATIME)
            .open(path)
            .map_err(|e| Error::Io("cannot open output file", e))?,
    };

    let head = if *direct {
        header_block
    } else {
        &header_block[..FILE_HEADER_LEN]
    };
    file.write_all(head)
        .map_err(|e| Error::Io("unable to write pcap file header", e))?;

    Ok(file)
}

/// Write the packets from full staging buffers into a file.
pub fn writer_loop(
    cfg: &WriterConfig,
    mut full_ring: Consumer<Box<PacketBuffer>>,
    mut free_ring: Producer<Box<PacketBuffer>>,
    stats: &WriterStats,
    stop: &AtomicBool,
) -> Result<(), Error> {
    info!(
        "Core {} is writing using file template: {}.",
        cfg.core_id, cfg.output_template
    );

    stats.core_id.store(cfg.core_id, Ordering::Relaxed);

    // The first block is built once, in block-aligned scratch (a one-block
    // PBUF), and reused across rotations.
    let mut header_block = PacketBuffer::new(cfg.disk_block, cfg.disk_block)?;
    pcap::build_header_block(header_block.whole_mut(), cfg.snaplen);

    let mut direct = true;
    let mut file_start = now_sec();
    let mut file_count: u32 = 0;

    let mut file_name = render_filename(&cfg.output_template, cfg.core_id, file_count, file_start)?;
    *stats.output_file.write() = file_name.clone();

    let mut file = open_pcap(&file_name, header_block.whole(), &mut direct)?;

    let mut file_size: u64 = 0;
    let mut file_changed = false;
    let mut stop_count: u32 = 0;

    let mut batch: Vec<Box<PacketBuffer>> = Vec::with_capacity(cfg.batch);
    let mut iov: Vec<libc::iovec> = Vec::with_capacity(cfg.batch);

    loop {
        if stop_count > DRAIN_BOUND {
            break;
        }
        if stop.load(Ordering::Relaxed) {
            stop_count += 1;
        }

        if full_ring.pop_bulk(&mut batch, cfg.batch) == 0 {
            continue;
        }

        iov.clear();
        let mut batch_packets: u64 = 0;
        for buf in &batch {
            iov.push(libc::iovec {
                iov_base: buf.as_slice().as_ptr() as *mut libc::c_void,
                iov_len: buf.len(),
            });
            batch_packets += u64::from(buf.packets());
        }
        stats.packets.fetch_add(batch_packets, Ordering::Relaxed);

        let written = unsafe { libc::writev(file.as_raw_fd(), iov.as_ptr(), iov.len() as libc::c_int) };

        // Buffers go back only after the kernel is done with their bytes.
        for mut buf in batch.drain(..) {
            buf.reset();
            let mut item = buf;
            loop {
                match free_ring.push(item) {
                    Ok(()) => break,
                    Err(back) => {
                        item = back;
                        if stop.load(Ordering::Relaxed) {
                            // Shutdown with a wedged free ring; let it go.
                            break;
                        }
                        std::hint::spin_loop();
                    }
                }
            }
        }

        if written < 0 {
            error!(
                "Could not write into file: {}",
                std::io::Error::last_os_error()
            );
            stats.write_errors.fetch_add(1, Ordering::Relaxed);
        } else {
            file_size += written as u64;
            stats.current_file_bytes.store(file_size, Ordering::Relaxed);
            stats.bytes.fetch_add(written as u64, Ordering::Relaxed);
        }

        // Create a new file according to limits.
        if cfg.rotate_seconds > 0 {
            let now = now_sec();
            if (now - file_start) as u64 >= cfg.rotate_seconds {
                file_start = now;
                file_count += 1;
                file_changed = true;
            }
        }

        if cfg.file_size_limit > 0 && file_size >= cfg.file_size_limit {
            file_count += 1;
            file_changed = true;
        }

        if file_changed {
            file_name = render_filename(&cfg.output_template, cfg.core_id, file_count, file_start)?;

            stats.current_file_bytes.store(0, Ordering::Relaxed);
            *stats.output_file.write() = file_name.clone();

            drop(file);
            file = open_pcap(&file_name, header_block.whole(), &mut direct)?;

            file_changed = false;
            file_size = 0;
        }
    }

    info!("Closed writing core {}", cfg.core_id);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring;
    use crate::stats::WriterStats;

    fn packed_buffer(block: usize, payload: &[u8], ts: (u32, u32)) -> Box<PacketBuffer> {
        let mut buf = PacketBuffer::new(block * 16, block).unwrap();
        let mark = buf.begin_record();
        buf.push_bytes(payload);
        buf.finish_record(mark, ts.0, ts.1);
        buf.set_packets(1);
        buf.pad_to_block(block);
        buf
    }

    #[test]
    fn filename_tokens_are_zero_padded() {
        let name = render_filename("cap_%COREID_%FCOUNT", 3, 7, 0).unwrap();
        assert_eq!(name, "cap_03_007");
    }

    #[test]
    fn filename_tokens_replace_all_occurrences() {
        let name = render_filename("%COREID/%COREID", 12, 0, 0).unwrap();
        assert_eq!(name, "12/12");
    }

    #[test]
    fn filename_strftime_applies() {
        let name = render_filename("cap_%Y", 0, 0, 0).unwrap();
        assert!(name.starts_with("cap_"));
        let year = &name[4..];
        assert_eq!(year.len(), 4);
        assert!(year.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn overlong_rendered_filename_is_refused() {
        let template = "x".repeat(300);
        assert!(render_filename(&template, 0, 0, 0).is_err());
    }

    #[test]
    fn strftime_expansion_past_the_bound_is_refused() {
        // 120 template bytes render to 240: each %Y becomes four digits.
        let template = "%Y".repeat(60);
        assert!(render_filename(&template, 0, 0, 0).is_err());

        let template = "%Y".repeat(40);
        let name = render_filename(&template, 0, 0, 0).unwrap();
        assert_eq!(name.len(), 160);
    }

    #[test]
    fn block_size_discovery_yields_something_sane() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("out").to_str().unwrap().to_string();
        let size = disk_block_size(&template);
        assert!(size >= 512);
        assert!(size.is_power_of_two());
    }

    #[test]
    fn open_pcap_writes_a_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hdr.pcap");
        let path = path.to_str().unwrap();

        let mut header_block = PacketBuffer::new(4096, 4096).unwrap();
        pcap::build_header_block(header_block.whole_mut(), 65535);

        let mut direct = true;
        let file = open_pcap(path, header_block.whole(), &mut direct).unwrap();
        drop(file);

        let bytes = std::fs::read(path).unwrap();
        // Direct mode writes the padded first block, buffered only the bare
        // header; which one depends on the filesystem under the tempdir.
        assert!(bytes.len() == 4096 || bytes.len() == FILE_HEADER_LEN);
        assert_eq!(
            u32::from_ne_bytes(bytes[0..4].try_into().unwrap()),
            pcap::MAGIC_NSEC
        );
    }

    #[test]
    fn writer_rotates_on_size() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir
            .path()
            .join("rot_%FCOUNT.pcap")
            .to_str()
            .unwrap()
            .to_string();

        let cfg = WriterConfig {
            core_id: 2,
            output_template: template,
            snaplen: 65535,
            disk_block: 4096,
            batch: 4,
            rotate_seconds: 0,
            file_size_limit: 1, // every batch trips the limit
        };

        let (mut full_tx, full_rx) = ring::ring::<Box<PacketBuffer>>(8);
        let (free_tx, mut free_rx) = ring::ring::<Box<PacketBuffer>>(8);
        let stats = WriterStats::default();
        let stop = AtomicBool::new(false);

        full_tx.push(packed_buffer(4096, &[1u8; 100], (0, 0))).unwrap();
        full_tx.push(packed_buffer(4096, &[2u8; 100], (0, 0))).unwrap();

        std::thread::scope(|scope| {
            let handle = scope.spawn(|| writer_loop(&cfg, full_rx, free_tx, &stats, &stop));

            // Both buffers must come back recycled before we stop.
            let mut got = 0;
            while got < 2 {
                if let Some(buf) = free_rx.pop() {
                    assert!(buf.is_empty());
                    got += 1;
                } else {
                    std::thread::yield_now();
                }
            }
            stop.store(true, Ordering::Relaxed);
            handle.join().unwrap().unwrap();
        });

        // One file per buffer: the first write already exceeds the limit.
        let file0 = dir.path().join("rot_000.pcap");
        let file1 = dir.path().join("rot_001.pcap");
        assert!(file0.exists(), "first file missing");
        assert!(file1.exists(), "rotated file missing");
        assert_eq!(stats.packets.load(Ordering::Relaxed), 2);
    }
}
