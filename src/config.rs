//! The command line surface and capture geometry.
//!
//! Option names and defaults follow the original tool; sizes that feed
//! rings or the umem are rounded or validated to powers of two up front so
//! nothing deeper ever has to re-check.

use std::path::PathBuf;

use crate::Error;

pub const RX_DESC_DEFAULT: u32 = 1024;
pub const BURST_SIZE_DEFAULT: u32 = 128;
pub const PAUSE_BURST_SIZE: u32 = 128;
pub const NUM_MBUFS_DEFAULT: u32 = 65536;
pub const MBUF_LEN_DEFAULT: u32 = 2048;
pub const NUM_PBUFS_DEFAULT: u32 = 4;
pub const PBUF_LEN_DEFAULT: usize = 128 * 1024 * 1024;
pub const SNAPLEN_DEFAULT: u32 = 65535;

pub const TEMPLATE_TOKEN_COREID: &str = "%COREID";
pub const TEMPLATE_TOKEN_FCOUNT: &str = "%FCOUNT";
pub const OUTPUT_TEMPLATE_DEFAULT: &str = "output_%COREID";

/// Bound on the normalized template's literal length. The rendered name is
/// bounded separately ([`crate::writer::RENDERED_NAME_MAX`]); a probe render
/// at validation time enforces that before any pipeline starts.
const TEMPLATE_MAX: usize = 160;

/// An AF_XDP-based packet capture tool.
#[derive(Debug, clap::Parser)]
#[command(name = "xskcap", version, about = "An AF_XDP-based packet capture tool")]
pub struct Args {
    /// Interfaces ("ports") to capture on.
    pub ifname: Vec<String>,

    /// Output FILE template (don't add the extension). Use %COREID for the
    /// writer's core id (automatically added if missing).
    #[arg(short = 'w', long = "output", default_value = OUTPUT_TEMPLATE_DEFAULT)]
    pub output_template: String,

    /// Print stats every second.
    #[arg(short = 'S', long = "stats")]
    pub stats: bool,

    /// Number of memory buffers (umem frames) per queue used to store the
    /// DMA'd packets. Rounded up to a power of 2.
    #[arg(short = 'm', long = "nb-mbuf", default_value_t = NUM_MBUFS_DEFAULT)]
    pub nb_mbufs: u32,

    /// Size in bytes of each mbuf (umem frame). Must be a power of 2
    /// between 2048 and the page size.
    #[arg(short = 'i', long = "mbuf-len", default_value_t = MBUF_LEN_DEFAULT)]
    pub mbuf_len: u32,

    /// Number of staging buffers (PBUFs) per queue holding packets before
    /// they are flushed to disk. Rounded up to a power of 2.
    #[arg(short = 'n', long = "nb-pbuf", default_value_t = NUM_PBUFS_DEFAULT)]
    pub nb_pbufs: u32,

    /// Size in bytes of each PBUF. Rounded up to a power of 2.
    #[arg(short = 'j', long = "pbuf-len", default_value_t = PBUF_LEN_DEFAULT)]
    pub pbuf_len: usize,

    /// Number of queues per port.
    #[arg(short = 'q', long = "nb-queues-per-port", default_value_t = 1)]
    pub queues_per_port: u32,

    /// Rx descriptor count, a single value or a per-port matrix like
    /// `0.256,1-2.512`. Values must be powers of 2.
    #[arg(short = 'd', long = "rx-desc")]
    pub rx_desc_matrix: Option<String>,

    /// Size of receive burst.
    #[arg(short = 'b', long = "burst-size", default_value_t = BURST_SIZE_DEFAULT)]
    pub burst_size: u32,

    /// Create a new set of files every SECS seconds; use strftime formats
    /// within the output template to tell them apart.
    #[arg(short = 'r', long = "rotate-seconds", default_value_t = 0)]
    pub rotate_seconds: u64,

    /// Start a new file once the current one reaches SIZE bytes; %FCOUNT in
    /// the template indexes the files (automatically added if missing).
    #[arg(short = 'f', long = "file-size-limit", default_value_t = 0)]
    pub file_size_limit: u64,

    /// Hexadecimal mask selecting ports from the interface list.
    #[arg(short = 'p', long = "portmask", value_parser = parse_portmask, default_value = "0x1")]
    pub portmask: u64,

    /// Enable PAUSE-frame flow control.
    #[arg(short = 'z', long = "flow-control")]
    pub flow_control: bool,

    /// Write the logs into FILE instead of stderr.
    #[arg(long = "logs")]
    pub log_file: Option<PathBuf>,

    /// Trust the NIC's 12-byte big-endian timestamp trailer instead of the
    /// wall clock.
    #[arg(long = "hw-timestamp")]
    pub hw_timestamp: bool,

    /// Bind with XDP_ZEROCOPY (default is copy mode, which any driver
    /// accepts).
    #[arg(long = "zerocopy")]
    pub zerocopy: bool,

    /// Advertised snaplen in file headers. Nothing is truncated; the MTU
    /// bounds packet sizes.
    #[arg(long = "snaplen", default_value_t = SNAPLEN_DEFAULT)]
    pub snaplen: u32,
}

fn parse_portmask(arg: &str) -> Result<u64, String> {
    let trimmed = arg.trim_start_matches("0x").trim_start_matches("0X");
    match u64::from_str_radix(trimmed, 16) {
        Ok(0) | Err(_) => Err(format!("invalid portmask '{}', no port used", arg)),
        Ok(mask) => Ok(mask),
    }
}

/// The derived per-queue sizes everything downstream works with.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub nb_mbufs: u32,
    pub mbuf_len: u32,
    pub nb_pbufs: u32,
    pub pbuf_len: usize,
    /// Fill level beyond which one more burst could overflow the PBUF:
    /// `pbuf_len - burst * (mbuf_len + packet header)`.
    pub watermark: usize,
    pub pause_burst: u32,
}

impl Args {
    pub fn geometry(&self) -> Result<Geometry, Error> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u32;

        if !self.mbuf_len.is_power_of_two() || self.mbuf_len < 2048 || self.mbuf_len > page {
            return Err(Error::Config(format!(
                "mbuf length {} must be a power of 2 between 2048 and {}",
                self.mbuf_len, page
            )));
        }

        if self.burst_size == 0 {
            return Err(Error::Config("burst size must be positive".into()));
        }

        if self.queues_per_port == 0 {
            return Err(Error::Config("at least one queue per port".into()));
        }

        let nb_mbufs = self.nb_mbufs.next_power_of_two();
        let nb_pbufs = self.nb_pbufs.next_power_of_two();
        let pbuf_len = self.pbuf_len.next_power_of_two();

        let rx_burst_len = self.burst_size as usize * self.mbuf_len as usize;
        if pbuf_len < 2 * rx_burst_len {
            return Err(Error::Config(format!(
                "packet buffer length should be at least {} B",
                2 * rx_burst_len
            )));
        }

        let headers = self.burst_size as usize * crate::pcap::PACKET_HEADER_LEN;
        let watermark = pbuf_len - rx_burst_len - headers;

        Ok(Geometry {
            nb_mbufs,
            mbuf_len: self.mbuf_len,
            nb_pbufs,
            pbuf_len,
            watermark,
            pause_burst: PAUSE_BURST_SIZE,
        })
    }

    /// Normalize the output template: auto-append missing tokens and the
    /// `.pcap` extension, bound its length.
    ///
    /// A probe render against the current time catches templates whose
    /// strftime expansion blows past the rendered-name bound, so the
    /// failure is a configuration error here rather than a surprise in a
    /// running writer.
    pub fn normalized_template(&self) -> Result<String, Error> {
        let mut template = self.output_template.clone();

        if !template.contains(TEMPLATE_TOKEN_COREID) {
            template.push('_');
            template.push_str(TEMPLATE_TOKEN_COREID);
        }
        if self.file_size_limit > 0 && !template.contains(TEMPLATE_TOKEN_FCOUNT) {
            template.push('_');
            template.push_str(TEMPLATE_TOKEN_FCOUNT);
        }
        template.push_str(".pcap");

        if template.len() > TEMPLATE_MAX {
            return Err(Error::Config(format!(
                "output template longer than {} bytes",
                TEMPLATE_MAX
            )));
        }

        let now = unsafe { libc::time(core::ptr::null_mut()) };
        crate::writer::render_filename(&template, 99, 999, now)?;

        Ok(template)
    }

    /// Interfaces selected by the portmask: bit k picks the k-th name.
    pub fn selected_ports(&self) -> Result<Vec<String>, Error> {
        if self.ifname.is_empty() {
            return Err(Error::Config("no interface given".into()));
        }

        let ports: Vec<String> = self
            .ifname
            .iter()
            .enumerate()
            .filter(|(i, _)| *i < 64 && self.portmask & (1u64 << i) != 0)
            .map(|(_, name)| name.clone())
            .collect();

        if ports.is_empty() {
            return Err(Error::Config(
                "found no usable port, check the portmask option".into(),
            ));
        }

        Ok(ports)
    }
}

/// Parse the rx descriptor matrix: either one value for every port, or a
/// comma list of `key.value` with `key` a port or a `lower-upper` range.
/// Unmentioned ports stay 0 and later fall back to [`RX_DESC_DEFAULT`].
pub fn parse_rx_desc_matrix(arg: &str, nb_ports: usize) -> Result<Vec<u32>, Error> {
    let invalid = || Error::Config(format!("invalid rx descriptor matrix '{}'", arg));
    let mut matrix = vec![0u32; nb_ports];

    let check_desc = |value: u32| -> Result<u32, Error> {
        if value != 0 && !value.is_power_of_two() {
            return Err(Error::Config(format!(
                "rx descriptor count {} must be a power of 2",
                value
            )));
        }
        Ok(value)
    };

    // Case with a single value.
    if !arg.contains('.') && !arg.contains(',') {
        let value = check_desc(arg.trim().parse().map_err(|_| invalid())?)?;
        matrix.fill(value);
        return Ok(matrix);
    }

    for entry in arg.split(',') {
        let (key, value) = entry.trim().split_once('.').ok_or_else(invalid)?;
        let value = check_desc(value.parse().map_err(|_| invalid())?)?;

        let (lower, upper) = match key.split_once('-') {
            None => {
                let port: usize = key.parse().map_err(|_| invalid())?;
                (port, port)
            }
            Some((lo, hi)) => (
                lo.parse().map_err(|_| invalid())?,
                hi.parse().map_err(|_| invalid())?,
            ),
        };

        if upper < lower || upper >= nb_ports {
            return Err(invalid());
        }
        for slot in &mut matrix[lower..=upper] {
            *slot = value;
        }
    }

    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["xskcap", "eth0"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn matrix_single_value_fills_all_ports() {
        let matrix = parse_rx_desc_matrix("512", 4).unwrap();
        assert_eq!(matrix, vec![512, 512, 512, 512]);
    }

    #[test]
    fn matrix_key_values_and_ranges() {
        let matrix = parse_rx_desc_matrix("0.256, 1-2.512", 4).unwrap();
        assert_eq!(matrix, vec![256, 512, 512, 0]);
    }

    #[test]
    fn matrix_rejects_garbage() {
        assert!(parse_rx_desc_matrix("1024x", 2).is_err());
        assert!(parse_rx_desc_matrix("0.", 2).is_err());
        assert!(parse_rx_desc_matrix("5.256", 2).is_err());
        assert!(parse_rx_desc_matrix("2-1.256", 4).is_err());
        assert!(parse_rx_desc_matrix("0.300", 2).is_err(), "non power of two");
    }

    #[test]
    fn portmask_selects_interfaces() {
        let mut a = args(&[]);
        a.ifname = vec!["eth0".into(), "eth1".into(), "eth2".into()];
        a.portmask = 0x5;
        assert_eq!(a.selected_ports().unwrap(), vec!["eth0", "eth2"]);
    }

    #[test]
    fn portmask_with_no_match_is_an_error() {
        let mut a = args(&[]);
        a.portmask = 0x2;
        assert!(a.selected_ports().is_err());
    }

    #[test]
    fn portmask_parses_hex_with_or_without_prefix() {
        assert_eq!(parse_portmask("0x3").unwrap(), 3);
        assert_eq!(parse_portmask("f").unwrap(), 15);
        assert!(parse_portmask("0").is_err());
        assert!(parse_portmask("zz").is_err());
    }

    #[test]
    fn template_tokens_are_auto_appended() {
        let a = args(&["-w", "trace", "-f", "1000000"]);
        let template = a.normalized_template().unwrap();
        assert_eq!(template, "trace_%COREID_%FCOUNT.pcap");
    }

    #[test]
    fn template_with_tokens_is_kept() {
        let a = args(&["-w", "t_%COREID_%FCOUNT"]);
        assert_eq!(a.normalized_template().unwrap(), "t_%COREID_%FCOUNT.pcap");
    }

    #[test]
    fn overlong_template_is_refused() {
        let long = "x".repeat(200);
        let a = args(&["-w", &long]);
        assert!(a.normalized_template().is_err());
    }

    #[test]
    fn template_whose_render_outgrows_the_bound_is_refused() {
        // 110 literal bytes pass the template check but render to 228
        // (every %Y expands to four digits), past the rendered-name bound.
        let expanding = "%Y".repeat(55);
        let a = args(&["-w", &expanding]);
        assert!(a.normalized_template().is_err());
    }

    #[test]
    fn geometry_rounds_and_computes_watermark() {
        let a = args(&["-m", "1000", "-j", "1048576", "-b", "64", "-i", "2048"]);
        let g = a.geometry().unwrap();
        assert_eq!(g.nb_mbufs, 1024);
        assert_eq!(g.pbuf_len, 1048576);
        assert_eq!(g.watermark, 1048576 - 64 * (2048 + 16));
    }

    #[test]
    fn geometry_rejects_undersized_pbuf() {
        let a = args(&["-j", "4096", "-b", "128", "-i", "2048"]);
        assert!(a.geometry().is_err());
    }

    #[test]
    fn geometry_rejects_odd_mbuf_len() {
        let a = args(&["-i", "3000"]);
        assert!(a.geometry().is_err());
    }
}
