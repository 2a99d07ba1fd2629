//! Multicore packet capture over AF_XDP sockets.
//!
//! One capture pipeline per (interface, queue): a capture worker drains the
//! kernel's rx ring into large block-aligned staging buffers, a writer worker
//! flushes those buffers to a pcap file with direct I/O. The two exchange
//! buffer ownership over a pair of bounded single-producer/single-consumer
//! rings, so the data path never takes a lock and never blocks on the kernel
//! scheduler.

pub mod capture;
pub mod config;
pub mod nic;
pub mod pbuf;
pub mod pcap;
pub mod ring;
pub mod stats;
pub mod writer;
/// Bindings for XDP (kernel-interface).
pub mod xdp;

pub(crate) struct LastErrno;

/// A saved `errno` value.
pub struct Errno(libc::c_int);

impl From<LastErrno> for Errno {
    fn from(LastErrno: LastErrno) -> Self {
        Errno::new()
    }
}

impl Errno {
    pub(crate) fn new() -> Self {
        Errno(unsafe { *libc::__errno_location() })
    }

    pub(crate) fn raw(code: libc::c_int) -> Self {
        Errno(code)
    }

    /// The raw `errno` code.
    pub fn raw_os_error(&self) -> i32 {
        self.0
    }

    pub fn context(self, what: &'static str) -> Error {
        Error::Sys(what, self)
    }
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let st = unsafe { libc::strerror(self.0) };
        let cstr = unsafe { core::ffi::CStr::from_ptr(st) };
        write!(f, "{}", cstr.to_string_lossy())
    }
}

impl core::fmt::Debug for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Errno({}: {})", self.0, self)
    }
}

/// Failures of the setup phase.
///
/// Once a pipeline runs, its workers never return errors upward; runtime
/// problems are logged and counted instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Rejected command line or geometry.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A syscall refused us during bring-up.
    #[error("{0}: {1}")]
    Sys(&'static str, Errno),
    /// File or directory level failure during bring-up.
    #[error("{0}: {1}")]
    Io(&'static str, #[source] std::io::Error),
    /// Resources could not be provisioned (pools, rings, buffers).
    #[error("{0}")]
    Provision(String),
}
