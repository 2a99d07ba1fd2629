//! Port bring-up: promiscuous mode, jumbo MTU, link flow control.
//!
//! Everything here is plain ioctl plumbing against the interface; the data
//! path never comes back. Queue/RSS distribution is the NIC driver's
//! business (`ethtool -X` territory) and deliberately not configured here.

use log::{info, warn};

use crate::nic::PortInfo;
use crate::{Errno, Error, LastErrno};

/// Jumbo frames of 9.5kb, minus Ethernet header and CRC.
pub const JUMBO_MTU: u32 = 0x2600 - 14 - 4;

const SIOCETHTOOL: libc::c_ulong = 0x8946;
const ETHTOOL_SPAUSEPARAM: u32 = 0x13;

/// Argument to `SIOCETHTOOL`/`ETHTOOL_SPAUSEPARAM`.
///
/// The layout of this struct is part of the kernel interface.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct EthtoolPauseParam {
    cmd: u32,
    autoneg: u32,
    rx_pause: u32,
    tx_pause: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct PortConfig {
    /// Requested MTU; applied best-effort (drivers cap it at their max).
    pub mtu: u32,
    /// Negotiate full-duplex link flow control and keep MAC-control frames.
    pub flow_control: bool,
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig {
            mtu: JUMBO_MTU,
            flow_control: false,
        }
    }
}

/// A plain socket to run interface ioctls against.
struct CtlSocket(libc::c_int);

impl CtlSocket {
    fn new() -> Result<Self, Errno> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(LastErrno)?;
        }
        Ok(CtlSocket(fd))
    }

    fn ifreq(&self, info: &PortInfo) -> libc::ifreq {
        let mut req: libc::ifreq = unsafe { core::mem::zeroed() };
        req.ifr_name.copy_from_slice(&info.ifname[..libc::IFNAMSIZ]);
        req
    }

    fn ioctl(&self, request: libc::c_ulong, req: &mut libc::ifreq) -> Result<(), Errno> {
        if unsafe { libc::ioctl(self.0, request as _, req as *mut libc::ifreq) } < 0 {
            return Err(LastErrno)?;
        }
        Ok(())
    }
}

impl Drop for CtlSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

/// Read the port's MAC address.
pub fn port_mac(info: &PortInfo) -> Result<[u8; 6], Errno> {
    let ctl = CtlSocket::new()?;
    let mut req = ctl.ifreq(info);
    ctl.ioctl(libc::SIOCGIFHWADDR, &mut req)?;

    let sa = unsafe { req.ifr_ifru.ifru_hwaddr };
    let mut mac = [0u8; 6];
    for (dst, src) in mac.iter_mut().zip(sa.sa_data.iter()) {
        *dst = *src as u8;
    }
    Ok(mac)
}

fn enable_promiscuous(ctl: &CtlSocket, info: &PortInfo) -> Result<(), Errno> {
    let mut req = ctl.ifreq(info);
    ctl.ioctl(libc::SIOCGIFFLAGS, &mut req)?;
    unsafe {
        req.ifr_ifru.ifru_flags |= libc::IFF_PROMISC as libc::c_short;
    }
    ctl.ioctl(libc::SIOCSIFFLAGS, &mut req)
}

fn link_is_up(ctl: &CtlSocket, info: &PortInfo) -> Result<bool, Errno> {
    let mut req = ctl.ifreq(info);
    ctl.ioctl(libc::SIOCGIFFLAGS, &mut req)?;
    let flags = unsafe { req.ifr_ifru.ifru_flags } as libc::c_int;
    Ok(flags & libc::IFF_UP != 0 && flags & libc::IFF_RUNNING != 0)
}

fn set_mtu(ctl: &CtlSocket, info: &PortInfo, mtu: u32) -> Result<(), Errno> {
    let mut req = ctl.ifreq(info);
    req.ifr_ifru.ifru_mtu = mtu as libc::c_int;
    ctl.ioctl(libc::SIOCSIFMTU, &mut req)
}

fn set_pause(ctl: &CtlSocket, info: &PortInfo) -> Result<(), Errno> {
    let mut pause = EthtoolPauseParam {
        cmd: ETHTOOL_SPAUSEPARAM,
        autoneg: 0,
        rx_pause: 1,
        tx_pause: 1,
    };

    let mut req = ctl.ifreq(info);
    req.ifr_ifru.ifru_data = (&mut pause) as *mut EthtoolPauseParam as *mut libc::c_char;
    ctl.ioctl(SIOCETHTOOL, &mut req)
}

/// Configure the interface itself, once per port, before any queue binds.
///
/// Returns the port MAC for PAUSE-frame synthesis. Promiscuous mode and the
/// jumbo MTU are best-effort (logged); a dead link or, when flow control was
/// requested, a driver refusing pause configuration are fatal.
pub fn bring_up_port(info: &PortInfo, cfg: &PortConfig) -> Result<[u8; 6], Error> {
    let ctl = CtlSocket::new().map_err(|e| e.context("cannot open control socket"))?;

    let mac = port_mac(info).map_err(|e| e.context("cannot read port MAC"))?;
    info!(
        "Port {}: MAC={:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        info.name(),
        mac[0],
        mac[1],
        mac[2],
        mac[3],
        mac[4],
        mac[5]
    );

    if let Err(err) = enable_promiscuous(&ctl, info) {
        warn!("Port {}: cannot enable promiscuous mode: {}", info.name(), err);
    }

    if let Err(err) = set_mtu(&ctl, info, cfg.mtu) {
        warn!(
            "Port {}: cannot raise MTU to {}: {} (driver limit?)",
            info.name(),
            cfg.mtu,
            err
        );
    }

    // Wait for the link, as the original did: a handful of retries, then
    // give up and refuse the port.
    let mut retry = 5;
    loop {
        if link_is_up(&ctl, info).map_err(|e| e.context("cannot read link state"))? {
            break;
        }
        if retry == 0 {
            return Err(Error::Provision(format!(
                "cannot detect valid link for port {}",
                info.name()
            )));
        }
        retry -= 1;
        std::thread::sleep(std::time::Duration::from_secs(1));
    }

    if cfg.flow_control {
        set_pause(&ctl, info).map_err(|e| e.context("cannot set link flow control"))?;
        info!("Port {}: full-duplex flow control on", info.name());
    }

    Ok(mac)
}
