use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use etherparse::{NetHeaders, PacketBuilder, PacketHeaders};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use psio_rs::config::{MAX_PACKET_SIZE, SEND_MIN, WINDOW_BITS};
use psio_rs::device::{ETH_FRAME_LEN, SoftBed};
use psio_rs::{Canceller, Chunk, Context, EngineConfig, Error, PacketInfo, QueueRef, RingConfig};

/// Command line options.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Number of soft NICs, cabled in pairs (0-1, 2-3, ...).
    #[clap(long, default_value_t = 2)]
    devices: usize,

    /// Queues per device (default: one per CPU, at most 8).
    #[clap(short, long)]
    queues: Option<u16>,

    /// Descriptors per ring.
    #[clap(long, default_value_t = 1024)]
    descriptors: u32,

    /// log2 of slots per buffer window.
    #[clap(long, default_value_t = WINDOW_BITS)]
    window_bits: u32,

    /// Packets per chunk.
    #[clap(short, long, default_value_t = 64)]
    chunk: usize,

    /// Log engine lifecycle events.
    #[clap(short, long)]
    verbose: bool,

    /// Log everything and print parsed addresses.
    #[clap(short, long)]
    debug: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the device table.
    List,
    /// Generate UDP traffic on one device.
    Gen(GenArgs),
    /// Receive and count packets.
    Dump(DumpArgs),
    /// Send every received chunk back out of the peer device.
    Echo,
}

#[derive(Parser, Debug)]
struct GenArgs {
    /// Device to send on.
    #[clap(long, default_value_t = 0)]
    device: usize,

    /// Frame length in bytes.
    #[clap(short, long, default_value_t = 60)]
    len: usize,

    /// Stop after this many packets per queue.
    #[clap(long)]
    count: Option<u64>,
}

#[derive(Parser, Debug)]
struct DumpArgs {
    /// Only receive from this device.
    #[clap(long)]
    device: Option<usize>,
}

#[derive(Default)]
struct Meter {
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl Meter {
    fn add(&self, packets: u64, bytes: u64) {
        self.packets.fetch_add(packets, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

fn init_tracing(args: &Args) {
    let level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Try to parse Ethernet/IP headers using etherparse and return a formatted string.
fn print_addrs(frame: &[u8]) -> Result<String> {
    let headers = PacketHeaders::from_ethernet_slice(frame)?;
    match headers.net.context("IP header not found")? {
        NetHeaders::Ipv4(hdr, _) => Ok(format!(
            "IP: {} > {}",
            Ipv4Addr::from(hdr.source),
            Ipv4Addr::from(hdr.destination)
        )),
        NetHeaders::Ipv6(hdr, _) => Ok(format!(
            "IP: {} > {}",
            Ipv6Addr::from(hdr.source),
            Ipv6Addr::from(hdr.destination)
        )),
        _ => bail!("IP header not found"),
    }
}

fn peer_of(device: usize, devices: usize) -> usize {
    if device ^ 1 < devices { device ^ 1 } else { device }
}

/// A UDP frame from `device` to its peer, `len` bytes on the wire.
fn udp_frame(bed: &SoftBed, device: usize, len: usize) -> Result<Vec<u8>> {
    const HEADERS: usize = 14 + 20 + 8;
    if !(HEADERS..=ETH_FRAME_LEN).contains(&len) {
        bail!("frame length must be in {HEADERS}..={ETH_FRAME_LEN}");
    }
    let src = bed.registry.device(device)?.info();
    let dst = bed
        .registry
        .device(peer_of(device, bed.registry.len()))?
        .info();
    let payload: Vec<u8> = (0..len - HEADERS).map(|i| i as u8).collect();
    let builder = PacketBuilder::ethernet2(src.mac.to_array(), dst.mac.to_array())
        .ipv4(src.ip.octets(), dst.ip.octets(), 64)
        .udp(rand::random::<u16>() | 0x8000, 9);
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, &payload)?;
    Ok(frame)
}

fn gen_worker(
    mut ctx: Context,
    queue: QueueRef,
    frame: &[u8],
    batch: usize,
    limit: Option<u64>,
    term: &AtomicBool,
    meter: &Meter,
) -> Result<()> {
    let buf = ctx.register_buffer(batch * MAX_PACKET_SIZE)?;
    let mut chunk = Chunk::new(buf, batch).on(queue);
    let data = ctx.buffer_mut(buf)?;
    for (i, info) in chunk.info.iter_mut().enumerate() {
        let offset = i * MAX_PACKET_SIZE;
        data[offset..offset + frame.len()].copy_from_slice(frame);
        *info = PacketInfo {
            offset: offset as u32,
            len: frame.len() as u16,
            ..Default::default()
        };
    }

    let mut total = 0u64;
    while !term.load(Ordering::Relaxed) {
        if let Some(limit) = limit {
            if total >= limit {
                break;
            }
            chunk.count = batch.min((limit - total) as usize);
        }
        let sent = ctx.send_chunk(&chunk)? as u64;
        if sent == 0 {
            thread::yield_now();
            continue;
        }
        total += sent;
        meter.add(sent, sent * frame.len() as u64);
    }
    Ok(())
}

fn recv_worker(
    mut ctx: Context,
    queues: &[QueueRef],
    batch: usize,
    echo: bool,
    debug: bool,
    term: &AtomicBool,
    meter: &Meter,
) -> Result<()> {
    for &q in queues {
        ctx.attach_rx(q)?;
    }
    let devices = ctx.registry().len();
    let buf = ctx.register_buffer(batch * MAX_PACKET_SIZE)?;
    let mut chunk = Chunk::new(buf, batch).blocking(true);
    while !term.load(Ordering::Relaxed) {
        chunk.count = batch;
        let n = match ctx.recv_chunk(&mut chunk) {
            Ok(n) => n,
            Err(Error::Interrupted) => break,
            Err(e) => return Err(e.into()),
        };
        meter.add(n as u64, chunk.info[..n].iter().map(|p| p.len as u64).sum());

        if debug {
            let data = ctx.buffer(buf)?;
            for p in &chunk.info[..n] {
                let frame = &data[p.offset as usize..p.offset as usize + p.len as usize];
                if let Ok(info) = print_addrs(frame) {
                    println!("{}:{} {} ({:?})", chunk.queue.device, chunk.queue.queue, info, p.checksum);
                }
            }
        }
        if echo {
            let from = chunk.queue;
            chunk.count = n;
            chunk.queue = QueueRef::new(peer_of(from.device as usize, devices) as u16, from.queue);
            ctx.send_chunk(&chunk)?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let queues = args
        .queues
        .unwrap_or_else(|| num_cpus::get().clamp(1, 8) as u16);
    let config = EngineConfig {
        ring: RingConfig {
            rx_descriptors: args.descriptors,
            tx_descriptors: args.descriptors,
            window_bits: args.window_bits,
            ..RingConfig::default()
        },
        send_min: SEND_MIN.min(args.descriptors as usize / 2),
        ..EngineConfig::default()
    };
    let bed = SoftBed::new(config, args.devices, queues, true)?;

    if let Command::List = args.command {
        for d in bed.registry.list() {
            println!(
                "{:>2} {:<8} {} {:<15} rx {} tx {}",
                d.index,
                d.name,
                d.mac.to_hex_string(),
                d.ip,
                d.rx_queues,
                d.tx_queues
            );
        }
        return Ok(());
    }

    println!("Test {:?} started with parameters:", args.command);
    println!("* devices: {}", args.devices);
    println!("* queues: {}", queues);
    println!("* chunk: {}", args.chunk);
    println!("* debug: {}", if args.debug { "ON" } else { "OFF" });

    // Setup a termination flag (triggered on Ctrl+C).
    let term = Arc::new(AtomicBool::new(false));
    let cancellers: Arc<Mutex<Vec<Canceller>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let term = term.clone();
        let cancellers = cancellers.clone();
        ctrlc::set_handler(move || {
            term.store(true, Ordering::SeqCst);
            for c in cancellers.lock().iter() {
                c.cancel();
            }
        })
        .context("Error setting Ctrl-C handler")?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let nic_workers: Vec<JoinHandle<()>> = bed.nics.iter().map(|n| n.spawn_worker(stop.clone())).collect();

    let meter = Arc::new(Meter::default());
    let stats_handle = {
        let (term, meter) = (term.clone(), meter.clone());
        thread::spawn(move || {
            let (mut old_packets, mut old_bytes) = (0, 0);
            while !term.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_secs(1));
                let p = meter.packets.load(Ordering::Relaxed);
                let b = meter.bytes.load(Ordering::Relaxed);
                println!(
                    "Aggregated pkt/sec: {} ({:.2} Mbps)",
                    p - old_packets,
                    (b - old_bytes) as f64 * 8.0 / 1e6
                );
                (old_packets, old_bytes) = (p, b);
            }
        })
    };

    let mut handles: Vec<JoinHandle<Result<()>>> = Vec::new();
    for q in 0..queues {
        let ctx = Context::new(bed.registry.clone());
        cancellers.lock().push(ctx.canceller());
        let (term, meter) = (term.clone(), meter.clone());
        let all: Vec<QueueRef> = (0..args.devices).map(|d| QueueRef::new(d as u16, q)).collect();
        let (targets, echo) = match &args.command {
            Command::Gen(gen_args) => {
                let frame = udp_frame(&bed, gen_args.device, gen_args.len)?;
                let queue = QueueRef::new(gen_args.device as u16, q);
                let (batch, limit) = (args.chunk, gen_args.count);
                handles.push(thread::spawn(move || {
                    gen_worker(ctx, queue, &frame, batch, limit, &term, &meter)
                }));
                continue;
            }
            Command::Dump(DumpArgs { device: Some(d) }) => (vec![QueueRef::new(*d as u16, q)], false),
            Command::Dump(_) | Command::List => (all, false),
            Command::Echo => (all, true),
        };
        let (batch, debug) = (args.chunk, args.debug);
        let handle = thread::spawn(move || recv_worker(ctx, &targets, batch, echo, debug, &term, &meter));
        handles.push(handle);
    }

    for h in handles {
        match h.join() {
            Ok(Err(e)) => tracing::error!("worker failed: {e:#}"),
            Err(_) => tracing::error!("worker panicked"),
            Ok(Ok(())) => {}
        }
    }
    term.store(true, Ordering::SeqCst);
    let _ = stats_handle.join();
    stop.store(true, Ordering::SeqCst);
    for w in nic_workers {
        let _ = w.join();
    }

    println!(
        "Total: {} packets, {} frames on the kernel path",
        meter.packets.load(Ordering::SeqCst),
        bed.kernel.len()
    );
    Ok(())
}
