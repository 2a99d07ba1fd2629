//! The capture worker: one core, one rx queue, one staging buffer at a time.
//!
//! A tight busy-poll loop: burst-receive descriptors, pack each frame as a
//! record into the held staging buffer, hand the buffer to the writer at the
//! watermark and grab a fresh one. When either ring blocks the worker spins,
//! and with flow control enabled it spends the spin transmitting PAUSE
//! frames so the peer holds off instead of overrunning the NIC.

use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};

use crate::nic::{DeviceRings, FramePool, PortInfo, RxQueue, TxQueue};
use crate::pbuf::PacketBuffer;
use crate::ring::{Consumer, Producer};
use crate::stats::CaptureStats;
use crate::xdp::XdpDesc;
use crate::Error;

pub const ETHER_TYPE_FLOW_CONTROL: u16 = 0x8808;
pub const OPCODE_PAUSE: u16 = 0x0001;
/// Quanta the peer is asked to hold off for.
pub const PAUSE_TIME: u16 = 0xffff;
/// Minimum Ethernet frame length (without CRC), zero-padded up to here.
pub const PAUSE_FRAME_LEN: u32 = 60;
/// IEEE reserved MAC-control multicast.
pub const PAUSE_DST: [u8; 6] = [0x01, 0x80, 0xc2, 0x00, 0x00, 0x01];

/// How many empty polls before a partially filled buffer is flushed anyway.
const IDLE_FLUSH_POLLS: u32 = 9_999_999;

/// Build the 60-byte PAUSE template for a port.
pub fn pause_frame(src_mac: &[u8; 6]) -> [u8; PAUSE_FRAME_LEN as usize] {
    let mut frame = [0u8; PAUSE_FRAME_LEN as usize];
    frame[0..6].copy_from_slice(&PAUSE_DST);
    frame[6..12].copy_from_slice(src_mac);
    frame[12..14].copy_from_slice(&ETHER_TYPE_FLOW_CONTROL.to_be_bytes());
    frame[14..16].copy_from_slice(&OPCODE_PAUSE.to_be_bytes());
    frame[16..18].copy_from_slice(&PAUSE_TIME.to_be_bytes());
    frame
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureConfig {
    /// Logical core this worker is pinned to.
    pub core_id: usize,
    /// Descriptors polled per loop iteration.
    pub burst_size: u32,
    /// PAUSE frames transmitted per blocked spin.
    pub pause_burst: u32,
    pub flow_control: bool,
    /// Trust the big-endian NIC trailer instead of the wall clock.
    pub hw_timestamp: bool,
    pub disk_block: usize,
    /// Fill level beyond which the next burst risks overflow.
    pub watermark: usize,
}

/// The reserved umem tail, preloaded with PAUSE frames.
///
/// Frames cycle: ready list -> tx ring -> completion ring -> ready list.
/// The bytes never change after initialization, so "cloning" the template
/// (as the original did per send) reduces to reusing the frame.
struct PauseGun {
    ready: Vec<u64>,
}

impl PauseGun {
    fn new(pool: &FramePool, src_mac: &[u8; 6]) -> Self {
        let template = pause_frame(src_mac);
        let ready: Vec<u64> = pool.tx_frames().collect();
        for &addr in &ready {
            // Safety: reserved tx frames never enter the fill ring.
            let frame = unsafe { pool.frame_mut(addr) };
            frame[..template.len()].copy_from_slice(&template);
        }
        PauseGun { ready }
    }

    /// Transmit up to one burst of PAUSE frames; returns how many went out.
    fn fire(&mut self, tx: &mut TxQueue, dev: &mut DeviceRings, burst: u32) -> u64 {
        for addr in dev.complete(burst) {
            self.ready.push(addr);
        }

        let want = (self.ready.len() as u32).min(burst);
        if want == 0 {
            if tx.needs_wakeup() {
                tx.wake();
            }
            return 0;
        }

        let mut sent = 0u64;
        {
            let mut batch = tx.transmit(want);
            while batch.capacity() > 0 {
                let addr = match self.ready.pop() {
                    Some(addr) => addr,
                    None => break,
                };
                batch.push(XdpDesc {
                    addr,
                    len: PAUSE_FRAME_LEN,
                    options: 0,
                });
                sent += 1;
            }
        }

        if tx.needs_wakeup() {
            tx.wake();
        }
        sent
    }
}

fn blocked_pause(
    gun: &mut Option<PauseGun>,
    tx: &mut Option<TxQueue>,
    dev: &mut DeviceRings,
    stats: &CaptureStats,
    burst: u32,
) {
    if let (Some(gun), Some(tx)) = (gun.as_mut(), tx.as_mut()) {
        let sent = gun.fire(tx, dev, burst);
        if sent > 0 {
            stats.pause_frames.fetch_add(sent, Ordering::Relaxed);
        }
    } else {
        std::hint::spin_loop();
    }
}

fn coarse_clock() -> (u32, u32) {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME_COARSE, &mut ts) };
    (ts.tv_sec as u32, ts.tv_nsec as u32)
}

enum Handoff {
    /// Flushed; a fresh buffer is in hand.
    Fresh(Box<PacketBuffer>),
    /// Stop hit while the full ring was wedged; the old buffer comes back.
    StopWithOld(Box<PacketBuffer>),
    /// Stop hit while waiting for a fresh buffer; nothing in hand.
    StopEmpty,
}

#[allow(clippy::too_many_arguments)]
fn hand_off(
    full_ring: &mut Producer<Box<PacketBuffer>>,
    free_ring: &mut Consumer<Box<PacketBuffer>>,
    mut outgoing: Box<PacketBuffer>,
    stop: &AtomicBool,
    gun: &mut Option<PauseGun>,
    tx: &mut Option<TxQueue>,
    dev: &mut DeviceRings,
    stats: &CaptureStats,
    pause_burst: u32,
) -> Handoff {
    loop {
        match full_ring.push(outgoing) {
            Ok(()) => break,
            Err(back) => {
                outgoing = back;
                if stop.load(Ordering::Relaxed) {
                    return Handoff::StopWithOld(outgoing);
                }
                blocked_pause(gun, tx, dev, stats, pause_burst);
            }
        }
    }

    loop {
        if let Some(fresh) = free_ring.pop() {
            return Handoff::Fresh(fresh);
        }
        if stop.load(Ordering::Relaxed) {
            return Handoff::StopEmpty;
        }
        blocked_pause(gun, tx, dev, stats, pause_burst);
    }
}

/// Capture the traffic from the given port/queue tuple.
#[allow(clippy::too_many_arguments)]
pub fn capture_loop(
    cfg: &CaptureConfig,
    info: &PortInfo,
    port_mac: [u8; 6],
    pool: FramePool,
    mut dev: DeviceRings,
    mut rx: RxQueue,
    mut tx: Option<TxQueue>,
    mut free_ring: Consumer<Box<PacketBuffer>>,
    mut full_ring: Producer<Box<PacketBuffer>>,
    stats: &CaptureStats,
    stop: &AtomicBool,
) -> Result<(), Error> {
    info!(
        "Core {} is capturing packets for port {} queue {}",
        cfg.core_id,
        info.name(),
        info.queue_id()
    );

    stats.core_id.store(cfg.core_id, Ordering::Relaxed);

    let mut gun = if cfg.flow_control {
        if tx.is_none() {
            return Err(Error::Provision(
                "flow control requested but the queue has no tx ring".into(),
            ));
        }
        stats.pause_frames.store(0, Ordering::Relaxed);
        Some(PauseGun::new(&pool, &port_mac))
    } else {
        stats.pause_frames.store(u64::MAX, Ordering::Relaxed);
        None
    };

    // Prime the fill ring. Frames beyond its capacity stay spare, the way a
    // DPDK mempool is allowed to outsize the rx descriptor ring.
    let mut spare: Vec<u64> = pool.rx_frames().collect();
    spare.reverse();
    loop {
        let mut batch = dev.fill(spare.len() as u32);
        while let Some(&addr) = spare.last() {
            if !batch.push(addr) {
                break;
            }
            spare.pop();
        }
        if batch.capacity() == 0 {
            break;
        }
        drop(batch);
        if spare.is_empty() || stop.load(Ordering::Relaxed) {
            break;
        }
        if dev.needs_wakeup() {
            dev.wake();
        }
    }

    let mut buffer = free_ring.pop().ok_or_else(|| {
        Error::Provision(format!(
            "no empty packet buffer (PBUF) on core {}",
            cfg.core_id
        ))
    })?;

    let mut stash: Vec<u8> = Vec::with_capacity(cfg.disk_block);
    let mut refill: Vec<u64> = Vec::with_capacity(cfg.burst_size as usize * 2);
    let mut chain: Vec<u64> = Vec::new();
    let mut buffer_packets: u32 = 0;
    let mut idle: u32 = 0;

    // Run until the application is quit or killed.
    while !stop.load(Ordering::Relaxed) {
        refill.clear();
        let mut finished: u32 = 0;

        {
            let mut burst = rx.receive(cfg.burst_size);
            if burst.capacity() > 0 {
                let clock = if cfg.hw_timestamp {
                    None
                } else {
                    // One coarse sample per burst; packets within a burst
                    // share a timestamp.
                    Some(coarse_clock())
                };

                let mut open = None;
                let mut in_chain: u32 = 0;
                chain.clear();

                while let Some(desc) = burst.next() {
                    if open.is_none() {
                        open = Some(buffer.begin_record());
                        chain.clear();
                        in_chain = 0;
                    }
                    in_chain += 1;
                    chain.push(desc.addr);

                    // Safety: the descriptor was just handed over by the rx
                    // ring; the frame is ours until refilled.
                    let bytes = unsafe { pool.bytes(desc.addr, desc.len) };
                    buffer.push_bytes(bytes);

                    if desc.options & XdpDesc::PKT_CONTD != 0 {
                        continue;
                    }

                    let mark = open.take().unwrap();
                    match clock {
                        Some((sec, nsec)) => buffer.finish_record(mark, sec, nsec),
                        None => buffer.finish_record_trailer(mark),
                    }
                    refill.extend_from_slice(&chain);
                    finished += 1;
                }

                if let Some(mark) = open.take() {
                    // The chain ran off the end of the burst; put its
                    // descriptors back so the whole chain arrives together
                    // on a later poll.
                    buffer.truncate_to(mark);
                    if in_chain >= cfg.burst_size {
                        // Longer than a whole burst; unrecoverable at this
                        // burst size, drop the frames and move on.
                        refill.extend_from_slice(&chain);
                        stats.chain_drops.fetch_add(1, Ordering::Relaxed);
                    } else {
                        burst.rewind(in_chain);
                    }
                }
            }
        }

        if finished > 0 {
            stats.packets.fetch_add(u64::from(finished), Ordering::Relaxed);
            buffer_packets += finished;
            idle = 0;
        } else {
            idle = idle.saturating_add(1);
        }

        // Hand consumed frames (and any spares) back to the driver.
        if !refill.is_empty() || !spare.is_empty() {
            let mut batch = dev.fill((refill.len() + spare.len()) as u32);
            for &addr in &refill {
                if !batch.push(addr) {
                    // Fill ring full. Cannot happen while frame accounting
                    // holds, but frames must never leak; park it.
                    spare.push(addr);
                }
            }
            while batch.capacity() > 0 {
                match spare.pop() {
                    Some(addr) => {
                        batch.push(addr);
                    }
                    None => break,
                }
            }
            drop(batch);
            if dev.needs_wakeup() {
                dev.wake();
            }
        }

        // Enqueue buffer to be flushed if full, and get a new one.
        if buffer.len() > cfg.watermark
            || (idle > IDLE_FLUSH_POLLS && buffer.len() > cfg.disk_block)
        {
            buffer.set_packets(buffer_packets);
            buffer.split_tail(cfg.disk_block, &mut stash);

            match hand_off(
                &mut full_ring,
                &mut free_ring,
                buffer,
                stop,
                &mut gun,
                &mut tx,
                &mut dev,
                stats,
                cfg.pause_burst,
            ) {
                Handoff::Fresh(mut fresh) => {
                    if !stash.is_empty() {
                        fresh.replay_tail(&stash);
                    }
                    buffer = fresh;
                    buffer_packets = 0;
                }
                Handoff::StopWithOld(mut old) => {
                    // Writer wedged at shutdown; reattach the tail and let
                    // the final flush try once more.
                    if !stash.is_empty() {
                        old.push_bytes(&stash);
                    }
                    buffer = old;
                    break;
                }
                Handoff::StopEmpty => {
                    // Everything we held is already on the full ring; only
                    // an unaligned tail can be left behind.
                    if !stash.is_empty() {
                        warn!(
                            "Core {}: dropping {} unaligned tail bytes at shutdown",
                            cfg.core_id,
                            stash.len()
                        );
                    }
                    info!("Closed capture core {} (port {})", cfg.core_id, info.name());
                    return Ok(());
                }
            }
        }
    }

    if !buffer.is_empty() {
        buffer.set_packets(buffer_packets);
        buffer.pad_to_block(cfg.disk_block);
        if full_ring.push(buffer).is_err() {
            warn!(
                "Core {}: full ring saturated at shutdown, final buffer lost",
                cfg.core_id
            );
        }
    }

    info!(
        "Closed capture core {} (port {})",
        cfg.core_id,
        info.name()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_frame_layout() {
        let mac = [0x02, 0x00, 0x00, 0xaa, 0xbb, 0xcc];
        let frame = pause_frame(&mac);

        assert_eq!(frame.len(), 60);
        assert_eq!(&frame[0..6], &[0x01, 0x80, 0xc2, 0x00, 0x00, 0x01]);
        assert_eq!(&frame[6..12], &mac);
        // Ethertype, opcode and quanta are big-endian on the wire.
        assert_eq!(&frame[12..14], &[0x88, 0x08]);
        assert_eq!(&frame[14..16], &[0x00, 0x01]);
        assert_eq!(&frame[16..18], &[0xff, 0xff]);
        assert!(frame[18..].iter().all(|&b| b == 0));
    }
}
