//! Run configuration shared read-only by every worker.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::affinity::AffinityPolicy;
use crate::errors::{Error, Result};
use crate::packet::{MAX_PKT_SIZE, PacketTemplate, Protocol, UDP_HEADERS_LEN};
use crate::rotate::{AddrRange, AddressRotator, DEFAULT_PORT};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Tx,
    Rx,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tx" => Ok(Mode::Tx),
            "rx" => Ok(Mode::Rx),
            other => Err(Error::Config(format!("unknown function {other:?}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    /// Shared-memory slot rings.
    Ring,
    /// `write(2)` on a file descriptor.
    RawWrite,
    /// Injection through a capture-library handle.
    CaptureInject,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Options {
    /// Copy the frame into every slot for the whole run.
    pub copy: bool,
    /// Point slots at the frame instead of copying it.
    pub indirect: bool,
    pub prefetch: bool,
    pub dump: bool,
}

/// Where packets go, as given on the command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Device {
    /// Built-in software rings, `mem` or `mem:<rings>`. With several
    /// threads every worker gets a single ring of its own.
    Mem { rings: usize },
    /// Any netmap port spec (`netmap:eth0`, `vale0:1`, ...).
    Netmap(String),
    /// `tap:<path>`
    Tap(PathBuf),
    /// `pcap:<device>`
    Pcap(String),
}

impl Device {
    pub fn transport(&self) -> TransportKind {
        match self {
            Device::Mem { .. } | Device::Netmap(_) => TransportKind::Ring,
            Device::Tap(_) => TransportKind::RawWrite,
            Device::Pcap(_) => TransportKind::CaptureInject,
        }
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "mem" {
            return Ok(Device::Mem { rings: 1 });
        }
        if let Some(rings) = s.strip_prefix("mem:") {
            let rings = rings
                .parse::<usize>()
                .ok()
                .filter(|&r| r > 0)
                .ok_or_else(|| Error::Config(format!("bad ring count in {s:?}")))?;
            return Ok(Device::Mem { rings });
        }
        if let Some(path) = s.strip_prefix("tap:") {
            return Ok(Device::Tap(PathBuf::from(path)));
        }
        if let Some(dev) = s.strip_prefix("pcap:") {
            return Ok(Device::Pcap(dev.to_owned()));
        }
        if s.starts_with("netmap:") || s.starts_with("vale") {
            return Ok(Device::Netmap(s.to_owned()));
        }
        Err(Error::Config(format!(
            "unknown device {s:?} (expected mem, netmap:, vale, tap: or pcap:)"
        )))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Mem { rings } => write!(f, "mem:{rings}"),
            Device::Netmap(spec) => write!(f, "{spec}"),
            Device::Tap(path) => write!(f, "tap:{}", path.display()),
            Device::Pcap(dev) => write!(f, "pcap:{dev}"),
        }
    }
}

/// Parse a MAC address in "aa:bb:cc:dd:ee:ff" or "aa-bb-cc-dd-ee-ff" form.
pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let parts = s
        .split([':', '-'])
        .map(|p| u8::from_str_radix(p, 16))
        .collect::<std::result::Result<Vec<u8>, _>>()
        .map_err(|_| Error::Config(format!("invalid MAC address {s:?}")))?;
    <[u8; 6]>::try_from(parts).map_err(|_| Error::Config(format!("invalid MAC address {s:?}")))
}

#[derive(Clone, Debug)]
pub struct GlobalConfig {
    pub mode: Mode,
    pub nthreads: usize,
    /// Total over all workers, 0 for unbounded.
    pub npackets: u64,
    /// Frame length without CRC.
    pub pkt_size: usize,
    /// Length of the virtio-net header in front of each frame (0, 10 or 12).
    pub virt_header: usize,
    pub protocol: Protocol,
    /// Packets per second per worker, 0 for unlimited.
    pub tx_rate: u64,
    pub burst: usize,
    pub frags: usize,
    pub report_interval: Duration,
    /// Bound on each ring readiness wait.
    pub poll_timeout: Duration,
    pub affinity: AffinityPolicy,
    pub transport: TransportKind,
    pub options: Options,
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub src: AddrRange,
    pub dst: AddrRange,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Tx,
            nthreads: 1,
            npackets: 0,
            pkt_size: 60,
            virt_header: 0,
            protocol: Protocol::Udp,
            tx_rate: 0,
            burst: 512,
            frags: 1,
            report_interval: Duration::from_millis(1000),
            poll_timeout: Duration::from_millis(2000),
            affinity: AffinityPolicy::None,
            transport: TransportKind::Ring,
            options: Options::default(),
            src_mac: [0; 6],
            dst_mac: [0xff; 6],
            src: AddrRange::single(Ipv4Addr::new(10, 0, 0, 1), DEFAULT_PORT),
            dst: AddrRange::single(Ipv4Addr::new(10, 1, 0, 1), DEFAULT_PORT),
        }
    }
}

impl GlobalConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(msg));
        if self.nthreads == 0 {
            return fail("at least one thread is required".into());
        }
        if self.burst == 0 {
            return fail("burst must be positive".into());
        }
        if self.frags == 0 || self.frags > self.burst {
            return fail(format!(
                "fragments ({}) must be between 1 and the burst size ({})",
                self.frags, self.burst
            ));
        }
        if self.mode == Mode::Tx && self.pkt_size < UDP_HEADERS_LEN {
            return fail(format!(
                "packet size {} is below the {UDP_HEADERS_LEN} header bytes",
                self.pkt_size
            ));
        }
        if self.pkt_size + self.virt_header > MAX_PKT_SIZE {
            return Err(Error::TooBigPacket(self.pkt_size + self.virt_header));
        }
        if !matches!(self.virt_header, 0 | 10 | 12) {
            return fail(format!("virtual header length {} is not 0, 10 or 12", self.virt_header));
        }
        if self.report_interval.is_zero() {
            return fail("report interval must be positive".into());
        }
        if !self.src.is_valid() || !self.dst.is_valid() {
            return fail("address range ends before it starts".into());
        }
        Ok(())
    }

    /// Packets each worker sends before stopping, 0 for unbounded.
    pub fn per_worker_target(&self) -> u64 {
        self.npackets / self.nthreads as u64
    }

    /// Bytes handed to the transport for every packet.
    pub fn tx_size(&self) -> usize {
        self.pkt_size + self.virt_header
    }

    pub fn rotator(&self) -> AddressRotator {
        AddressRotator::new(self.src, self.dst)
    }

    pub fn template(&self) -> Result<PacketTemplate> {
        PacketTemplate::build(
            self.protocol,
            self.src_mac,
            self.dst_mac,
            self.rotator().first(),
            self.pkt_size,
            self.virt_header,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        GlobalConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects() {
        let bad = [
            GlobalConfig { nthreads: 0, ..Default::default() },
            GlobalConfig { burst: 0, ..Default::default() },
            GlobalConfig { frags: 0, ..Default::default() },
            GlobalConfig { frags: 8, burst: 4, ..Default::default() },
            GlobalConfig { pkt_size: 20, ..Default::default() },
            GlobalConfig { pkt_size: 70_000, ..Default::default() },
            GlobalConfig { virt_header: 4, ..Default::default() },
            GlobalConfig { report_interval: Duration::ZERO, ..Default::default() },
        ];
        for cfg in bad {
            assert!(cfg.validate().is_err(), "{cfg:?}");
        }
    }

    #[test]
    fn test_short_packets_are_fine_for_rx() {
        let cfg = GlobalConfig { mode: Mode::Rx, pkt_size: 20, ..Default::default() };
        cfg.validate().unwrap();
    }

    #[test]
    fn test_per_worker_target() {
        let cfg = GlobalConfig { npackets: 1000, nthreads: 3, ..Default::default() };
        assert_eq!(cfg.per_worker_target(), 333);
        let cfg = GlobalConfig { npackets: 0, nthreads: 3, ..Default::default() };
        assert_eq!(cfg.per_worker_target(), 0);
    }

    #[test]
    fn test_device_parsing() {
        assert_eq!("mem".parse::<Device>().unwrap(), Device::Mem { rings: 1 });
        assert_eq!("mem:4".parse::<Device>().unwrap(), Device::Mem { rings: 4 });
        assert!("mem:0".parse::<Device>().is_err());
        assert_eq!(
            "netmap:eth0".parse::<Device>().unwrap(),
            Device::Netmap("netmap:eth0".into())
        );
        assert_eq!("vale0:1".parse::<Device>().unwrap().transport(), TransportKind::Ring);
        assert_eq!(
            "tap:/dev/null".parse::<Device>().unwrap().transport(),
            TransportKind::RawWrite
        );
        assert_eq!(
            "pcap:eth0".parse::<Device>().unwrap().transport(),
            TransportKind::CaptureInject
        );
        assert!("eth0".parse::<Device>().is_err());
    }

    #[test]
    fn test_mac_parsing() {
        assert_eq!(parse_mac("11:22:33:44:55:66").unwrap(), [0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        assert_eq!(parse_mac("aa-bb-cc-dd-ee-ff").unwrap(), [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert!(parse_mac("11:22:33").is_err());
        assert!(parse_mac("zz:22:33:44:55:66").is_err());
    }
}
