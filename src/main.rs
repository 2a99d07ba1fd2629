//! The supervisor: provisioning, worker launch, signal handling, stats.
//!
//! One capture and one writer thread per (port, queue), each pinned to its
//! own core; the supervisor itself stays on whatever core the scheduler
//! likes, hosts the signal handlers and, on request, the stats display.

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use log::{error, info, warn};

use xskcap::capture::{self, CaptureConfig};
use xskcap::config::{self, Args};
use xskcap::nic::{self, FramePool, FramePoolConfig, PortConfig, PortInfo, QueueConfig};
use xskcap::pbuf::PacketBuffer;
use xskcap::ring::{self, Consumer, Producer};
use xskcap::stats::{self, CaptureStats, QueueHandle, StatsView, WriterStats};
use xskcap::writer::{self, WriterConfig};
use xskcap::xdp::BindFlags;
use xskcap::Error;

/// Tx descriptors per queue when flow control needs a tx ring.
const TX_DESC_DEFAULT: u32 = 1024;

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_sig: libc::c_int) {
    // The only async-signal-safe thing worth doing.
    STOP.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        let mut action: libc::sigaction = core::mem::zeroed();
        action.sa_sigaction = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGINT, &action, core::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &action, core::ptr::null_mut());
    }
}

fn pin_to_core(core: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = core::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, core::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            warn!("Cannot pin to core {}; running unpinned", core);
        }
    }
}

fn init_logging(args: &Args) -> Result<(), Error> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = &args.log_file {
        let file =
            std::fs::File::create(path).map_err(|e| Error::Io("could not open log file", e))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

/// Everything one (port, queue) pipeline takes into its two threads.
struct Pipeline {
    info: PortInfo,
    mac: [u8; 6],
    pool: FramePool,
    bound: nic::BoundQueue,
    free_rx: Consumer<Box<PacketBuffer>>,
    full_tx: Producer<Box<PacketBuffer>>,
    full_rx: Consumer<Box<PacketBuffer>>,
    free_tx: Producer<Box<PacketBuffer>>,
    capture_core: usize,
    writer_core: usize,
}

fn run(args: &Args) -> Result<(), Error> {
    let template = args.normalized_template()?;
    let geometry = args.geometry()?;
    let ports = args.selected_ports()?;

    // The raw (untokenized) template points at the output directory.
    let disk_block = writer::disk_block_size(&args.output_template);

    let nb_queues = ports.len() * args.queues_per_port as usize;
    let rx_burst_len = args.burst_size as usize * geometry.mbuf_len as usize;

    info!("Using {} ports to listen on", ports.len());
    info!(
        "Cores/Queues Per Port: {} Burst Size: {}",
        args.queues_per_port, args.burst_size
    );
    info!(
        "MBufs: Num: {} Len: {} B  PBufs: Num: {} Len: {} B",
        geometry.nb_mbufs, geometry.mbuf_len, geometry.nb_pbufs, geometry.pbuf_len
    );
    info!(
        "RX Burst Len: {} Watermark: {}",
        rx_burst_len, geometry.watermark
    );
    info!(
        "Flow control: {} Pause Burst Size: {}",
        if args.flow_control { "ON" } else { "OFF" },
        geometry.pause_burst
    );
    info!("Disk block size = {}", disk_block);

    let required_cores = 2 * nb_queues + 1;
    let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if online < required_cores as libc::c_long {
        return Err(Error::Config(format!(
            "assign at least {} cores to xskcap, {} found",
            required_cores, online
        )));
    }
    info!("Using {} cores out of {} online", required_cores, online);

    let rx_desc = match &args.rx_desc_matrix {
        Some(matrix) => config::parse_rx_desc_matrix(matrix, ports.len())?,
        None => vec![0; ports.len()],
    };

    let bind_flags = BindFlags::XDP_USE_NEED_WAKEUP
        | BindFlags::XDP_USE_SG
        | if args.zerocopy {
            BindFlags::XDP_ZEROCOPY
        } else {
            BindFlags::XDP_COPY
        };

    let capture_stats: Vec<CaptureStats> = (0..nb_queues).map(|_| Default::default()).collect();
    let writer_stats: Vec<WriterStats> = (0..nb_queues).map(|_| Default::default()).collect();
    let mut queue_handles: Vec<QueueHandle> = Vec::with_capacity(nb_queues);

    let mut pipelines: Vec<Pipeline> = Vec::with_capacity(nb_queues);
    let mut next_core = 1usize;

    for (port_idx, name) in ports.iter().enumerate() {
        let cname = CString::new(name.as_str())
            .map_err(|_| Error::Config(format!("invalid interface name '{}'", name)))?;
        let base = PortInfo::from_name(&cname)
            .map_err(|e| e.context("cannot resolve interface"))?;

        let mac = nic::bring_up_port(
            &base,
            &PortConfig {
                flow_control: args.flow_control,
                ..PortConfig::default()
            },
        )?;

        let desc = match rx_desc[port_idx] {
            0 => config::RX_DESC_DEFAULT,
            n => n,
        };

        for queue in 0..args.queues_per_port {
            let mut info = base;
            info.set_queue(queue);

            let pool = FramePool::new(FramePoolConfig {
                frame_count: geometry.nb_mbufs,
                frame_size: geometry.mbuf_len,
                headroom: 0,
                reserve_tx: if args.flow_control {
                    geometry.pause_burst
                } else {
                    0
                },
            })?;

            let qcfg = QueueConfig {
                rx_size: desc,
                tx_size: args.flow_control.then_some(TX_DESC_DEFAULT),
                fill_size: desc * 2,
                complete_size: if args.flow_control {
                    (geometry.pause_burst * 2).next_power_of_two()
                } else {
                    64
                },
                bind_flags,
            };

            let bound = nic::bind_queue(&pool, &info, &qcfg)?;

            queue_handles.push(QueueHandle {
                port: name.clone(),
                queue_id: queue,
                fd: pool.fd().clone(),
            });

            let (mut free_tx, free_rx) = ring::ring(2 * geometry.nb_pbufs);
            let (full_tx, full_rx) = ring::ring(2 * geometry.nb_pbufs);

            for _ in 0..geometry.nb_pbufs {
                let buf = PacketBuffer::new(geometry.pbuf_len, disk_block)?;
                free_tx
                    .push(buf)
                    .map_err(|_| Error::Provision("cannot seed the free ring".into()))?;
            }

            pipelines.push(Pipeline {
                info,
                mac,
                pool,
                bound,
                free_rx,
                full_tx,
                full_rx,
                free_tx,
                capture_core: next_core,
                writer_core: next_core + 1,
            });
            next_core += 2;
        }
    }

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(2 * nb_queues);

        for (k, pipeline) in pipelines.into_iter().enumerate() {
            let Pipeline {
                info,
                mac,
                pool,
                bound,
                free_rx,
                full_tx,
                full_rx,
                free_tx,
                capture_core,
                writer_core,
            } = pipeline;
            let nic::BoundQueue { dev, rx, tx, claim } = bound;

            let cap_stats = &capture_stats[k];
            let wr_stats = &writer_stats[k];

            let ccfg = CaptureConfig {
                core_id: capture_core,
                burst_size: args.burst_size,
                pause_burst: geometry.pause_burst,
                flow_control: args.flow_control,
                hw_timestamp: args.hw_timestamp,
                disk_block,
                watermark: geometry.watermark,
            };
            let wcfg = WriterConfig {
                core_id: writer_core,
                output_template: template.clone(),
                snaplen: args.snaplen,
                disk_block,
                batch: geometry.nb_pbufs as usize,
                rotate_seconds: args.rotate_seconds,
                file_size_limit: args.file_size_limit,
            };

            info!(
                "Launching capture process: worker={}, port={}, core={}, queue={}",
                k,
                info.name(),
                capture_core,
                info.queue_id()
            );
            handles.push(scope.spawn(move || {
                pin_to_core(ccfg.core_id);
                let _claim = claim;
                capture::capture_loop(
                    &ccfg, &info, mac, pool, dev, rx, tx, free_rx, full_tx, cap_stats, &STOP,
                )
            }));

            info!(
                "Launching write process: worker={}, core={}",
                k, writer_core
            );
            handles.push(scope.spawn(move || {
                pin_to_core(wcfg.core_id);
                writer::writer_loop(&wcfg, full_rx, free_tx, wr_stats, &STOP)
            }));
        }

        let view = StatsView {
            capture: &capture_stats,
            writer: &writer_stats,
            queues: &queue_handles,
        };

        if args.stats {
            stats::display_loop(&view, &STOP);
        } else {
            while !STOP.load(Ordering::Relaxed) {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
        }

        info!("Waiting for all cores to exit");
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!("Worker did not stop correctly: {}", err),
                Err(_) => error!("Worker panicked"),
            }
        }

        stats::log_summary(&view);
    });

    Ok(())
}

fn main() {
    let args = Args::parse();

    if let Err(err) = init_logging(&args) {
        eprintln!("{}", err);
        std::process::exit(1);
    }

    install_signal_handlers();

    match run(&args) {
        Ok(()) => {}
        Err(err @ Error::Config(_)) => {
            error!("{}", err);
            std::process::exit(2);
        }
        Err(err) => {
            error!("{}", err);
            std::process::exit(1);
        }
    }
}
