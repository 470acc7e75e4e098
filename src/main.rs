//! Multi-threaded packet generator and receiver.
//!
//! Example:
//! ```bash
//! cargo run --release -- -i mem:4 -f tx -p 4 -n 100000000 -l 60
//! cargo run --release --features netmap -- \
//!     -i netmap:eth0 -p 2 -a rr -R 1000000 -b 64 \
//!     -s 10.0.0.1-10.0.0.10:1000-1010 -d 10.1.0.1 -D 11:22:33:44:55:66
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use pktgen_rs::affinity::AffinityPolicy;
use pktgen_rs::config::{Device, GlobalConfig, Mode, Options, parse_mac};
use pktgen_rs::coordinator::{Coordinator, backend_for};
use pktgen_rs::packet::Protocol;
use pktgen_rs::rotate::AddrRange;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Device: mem[:rings], netmap:<if>, vale<x>:<port>, tap:<path> or pcap:<if>.
    #[clap(short = 'i', long)]
    interface: Device,

    /// Function: tx or rx.
    #[clap(short = 'f', long, default_value = "tx")]
    function: Mode,

    /// Packets to send or receive over all threads (0 = unlimited).
    #[clap(short = 'n', long, default_value_t = 0)]
    count: u64,

    /// Frame length in bytes, without CRC.
    #[clap(short = 'l', long, default_value_t = 60)]
    len: usize,

    /// Worker threads.
    #[clap(short = 'p', long, default_value_t = 1)]
    threads: usize,

    /// Packets per batch.
    #[clap(short = 'b', long, default_value_t = 512)]
    burst: usize,

    /// Packets per second per thread (0 = flat-out).
    #[clap(short = 'R', long, default_value_t = 0)]
    rate: u64,

    /// Slots per packet.
    #[clap(short = 'F', long, default_value_t = 1)]
    frags: usize,

    /// CPU affinity: none, rr or a core number.
    #[clap(short = 'a', long, default_value = "none")]
    affinity: AffinityPolicy,

    /// Report interval in milliseconds.
    #[clap(short = 'T', long, default_value_t = 1000)]
    report_interval: u64,

    /// Bound on each ring wait in milliseconds.
    #[clap(long, default_value_t = 2000)]
    poll_timeout: u64,

    /// Source range, a.b.c.d[-e.f.g.h][:port[-port]].
    #[clap(short = 's', long, default_value = "10.0.0.1")]
    src: AddrRange,

    /// Destination range, a.b.c.d[-e.f.g.h][:port[-port]].
    #[clap(short = 'd', long, default_value = "10.1.0.1")]
    dst: AddrRange,

    /// Source MAC address.
    #[clap(short = 'S', long, value_parser = parse_mac, default_value = "00:00:00:00:00:00")]
    src_mac: [u8; 6],

    /// Destination MAC address.
    #[clap(short = 'D', long, value_parser = parse_mac, default_value = "ff:ff:ff:ff:ff:ff")]
    dst_mac: [u8; 6],

    /// Protocol of the generated packets.
    #[clap(long, default_value = "udp")]
    proto: Protocol,

    /// Virtio-net header length in front of each frame (0, 10 or 12).
    #[clap(long, default_value_t = 0)]
    virt_header: usize,

    /// Copy the frame into every slot for the whole run.
    #[clap(long)]
    copy: bool,

    /// Point slots at the frame instead of copying it.
    #[clap(long)]
    indirect: bool,

    /// Prefetch slot buffers.
    #[clap(long)]
    prefetch: bool,

    /// Hex dump every packet at debug level.
    #[clap(long)]
    dump: bool,

    /// Log filter, overridden by RUST_LOG.
    #[clap(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn config(&self) -> GlobalConfig {
        GlobalConfig {
            mode: self.function,
            nthreads: self.threads,
            npackets: self.count,
            pkt_size: self.len,
            virt_header: self.virt_header,
            protocol: self.proto,
            tx_rate: self.rate,
            burst: self.burst,
            frags: self.frags,
            report_interval: Duration::from_millis(self.report_interval),
            poll_timeout: Duration::from_millis(self.poll_timeout),
            affinity: self.affinity,
            transport: self.interface.transport(),
            options: Options {
                copy: self.copy,
                indirect: self.indirect,
                prefetch: self.prefetch,
                dump: self.dump,
            },
            src_mac: self.src_mac,
            dst_mac: self.dst_mac,
            src: self.src,
            dst: self.dst,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cfg = args.config();
    let backend = backend_for(&args.interface).with_context(|| format!("device {}", args.interface))?;
    info!(
        device = %args.interface,
        mode = ?cfg.mode,
        threads = cfg.nthreads,
        len = cfg.pkt_size,
        rate = cfg.tx_rate,
        burst = cfg.burst,
        "starting"
    );

    let mut coordinator = Coordinator::new(cfg, backend.as_ref())?;
    let canceller = coordinator.canceller();
    ctrlc::set_handler(move || canceller.cancel()).context("Error setting Ctrl-C handler")?;
    coordinator.launch(backend.as_ref());

    coordinator.monitor();
    let summary = coordinator.join();
    if summary.completed < summary.workers {
        info!(completed = summary.completed, workers = summary.workers, "some workers failed");
    }
    println!("{summary}");
    Ok(())
}
