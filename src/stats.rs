//! Worker statistics and the periodic display.
//!
//! Counters are cache-aligned per worker and written only by their owner
//! with relaxed stores; readers (the display and the final summary) issue
//! relaxed loads and tolerate whatever mix of old and new they observe.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::nic::SharedFd;

/// Counters owned by one capture worker.
#[repr(align(64))]
#[derive(Default)]
pub struct CaptureStats {
    pub core_id: AtomicUsize,
    /// Packets successfully staged.
    pub packets: AtomicU64,
    /// PAUSE frames sent for flow control; `u64::MAX` when flow control is
    /// off (the display prints a dash).
    pub pause_frames: AtomicU64,
    /// Segment chains dropped because they exceeded a whole burst.
    pub chain_drops: AtomicU64,
}

/// Counters owned by one writer worker.
#[repr(align(64))]
#[derive(Default)]
pub struct WriterStats {
    pub core_id: AtomicUsize,
    /// Packets whose buffers reached `writev`.
    pub packets: AtomicU64,
    /// Bytes written across all files.
    pub bytes: AtomicU64,
    /// Bytes written to the file currently open.
    pub current_file_bytes: AtomicU64,
    /// Failed `writev` calls; the capture keeps running regardless.
    pub write_errors: AtomicU64,
    /// Path of the file currently open.
    pub output_file: spin::RwLock<String>,
}

/// One queue's kernel-side counters, readable from the supervisor.
pub struct QueueHandle {
    pub port: String,
    pub queue_id: u32,
    pub fd: SharedFd,
}

pub struct StatsView<'a> {
    pub capture: &'a [CaptureStats],
    pub writer: &'a [WriterStats],
    pub queues: &'a [QueueHandle],
}

const ROTATING_CHAR: [char; 4] = ['-', '\\', '|', '/'];
const STATS_PERIOD: Duration = Duration::from_secs(1);

/// Format a byte count the way humans read dashboards.
pub fn bytes_format(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

fn print_view(view: &StatsView<'_>, tick: usize) {
    let mut total_packets = 0u64;
    let mut total_bytes = 0u64;
    for w in view.writer {
        total_packets += w.packets.load(Ordering::Relaxed);
        total_bytes += w.bytes.load(Ordering::Relaxed);
    }

    print!("\x1b[1;1H\x1b[2J");
    println!(
        "=== Packet capture stats {} ===",
        ROTATING_CHAR[tick % ROTATING_CHAR.len()]
    );

    println!("-- GLOBAL --");
    println!("Total packets written: {}", total_packets);
    println!("Total bytes written: {}", bytes_format(total_bytes));

    println!("-- PER WRITING CORE --");
    for w in view.writer {
        let file = w.output_file.read();
        println!(
            "Writing core {}: {} ({})",
            w.core_id.load(Ordering::Relaxed),
            *file,
            bytes_format(w.current_file_bytes.load(Ordering::Relaxed)),
        );
        drop(file);
        let errors = w.write_errors.load(Ordering::Relaxed);
        if errors > 0 {
            println!("  write errors: {}", errors);
        }
    }

    println!("-- PER CAPTURE CORE --");
    for c in view.capture {
        let pause = c.pause_frames.load(Ordering::Relaxed);
        println!(
            "Capture core {}: {} packets, pause frames: {}",
            c.core_id.load(Ordering::Relaxed),
            c.packets.load(Ordering::Relaxed),
            if pause == u64::MAX {
                "-".to_string()
            } else {
                pause.to_string()
            },
        );
    }

    println!("-- PER QUEUE (kernel) --");
    for q in view.queues {
        match q.fd.statistics() {
            Ok(stats) => println!(
                "{} queue {}: dropped {} invalid {} ring-full {} fill-empty {}",
                q.port,
                q.queue_id,
                stats.rx_dropped,
                stats.rx_invalid_descs,
                stats.rx_ring_full,
                stats.rx_fill_ring_empty_descs,
            ),
            Err(err) => println!("{} queue {}: <{}>", q.port, q.queue_id, err),
        }
    }

    println!("===================================");
}

/// Run the display until the stop flag is raised. Hosted by the supervisor
/// thread; workers never print.
pub fn display_loop(view: &StatsView<'_>, stop: &AtomicBool) {
    let mut tick = 0;
    while !stop.load(Ordering::Relaxed) {
        print_view(view, tick);
        tick += 1;

        // Sleep in small slices so a signal is honored promptly.
        let mut slept = Duration::ZERO;
        while slept < STATS_PERIOD && !stop.load(Ordering::Relaxed) {
            let slice = Duration::from_millis(100);
            std::thread::sleep(slice);
            slept += slice;
        }
    }
}

/// One final plain (non-clearing) summary for the log.
pub fn log_summary(view: &StatsView<'_>) {
    let mut total_packets = 0u64;
    let mut total_bytes = 0u64;
    for w in view.writer {
        total_packets += w.packets.load(Ordering::Relaxed);
        total_bytes += w.bytes.load(Ordering::Relaxed);
    }
    log::info!(
        "captured {} packets, wrote {}",
        total_packets,
        bytes_format(total_bytes)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_format_scales() {
        assert_eq!(bytes_format(512), "512 B");
        assert_eq!(bytes_format(2048), "2.00 KiB");
        assert_eq!(bytes_format(5 * 1024 * 1024), "5.00 MiB");
        assert_eq!(bytes_format(3 * 1024 * 1024 * 1024), "3.00 GiB");
    }
}
