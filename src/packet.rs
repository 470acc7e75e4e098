//! Packet template construction and the per-worker mutable frame.

use std::fmt::{self, Write as _};
use std::str::FromStr;

use etherparse::PacketBuilder;

use crate::errors::{Error, Result};
use crate::rotate::{AddressRotator, Endpoints};

const ETH_HLEN: usize = 14;
const IP_SRC: usize = ETH_HLEN + 12;
const IP_DST: usize = ETH_HLEN + 16;
const UDP_SPORT: usize = ETH_HLEN + 20;
const UDP_DPORT: usize = ETH_HLEN + 22;

/// Ethernet + IPv4 + UDP.
pub const UDP_HEADERS_LEN: usize = ETH_HLEN + 20 + 8;

/// Frames longer than this do not fit a slot length field.
pub const MAX_PKT_SIZE: usize = u16::MAX as usize;

const PAYLOAD: &[u8] = b"pktgen_rs payload\n";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    /// Declared but not generated yet.
    Icmp,
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Protocol::Udp),
            "icmp" => Ok(Protocol::Icmp),
            other => Err(Error::Config(format!("unknown protocol {other:?}"))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::Icmp => write!(f, "icmp"),
        }
    }
}

/// Immutable template built once before the workers start.
#[derive(Clone, Debug)]
pub struct PacketTemplate {
    data: Vec<u8>,
    virt_header: usize,
    protocol: Protocol,
}

impl PacketTemplate {
    /// Builds a `pkt_size`-byte frame (without CRC) preceded by
    /// `virt_header` zero bytes.
    pub fn build(
        protocol: Protocol,
        src_mac: [u8; 6],
        dst_mac: [u8; 6],
        ends: Endpoints,
        pkt_size: usize,
        virt_header: usize,
    ) -> Result<Self> {
        match protocol {
            Protocol::Udp => {}
            Protocol::Icmp => return Err(Error::Unsupported("icmp")),
        }
        if pkt_size > MAX_PKT_SIZE {
            return Err(Error::TooBigPacket(pkt_size));
        }

        let builder = PacketBuilder::ethernet2(src_mac, dst_mac)
            .ipv4(ends.src_ip.to_be_bytes(), ends.dst_ip.to_be_bytes(), 64)
            .udp(ends.src_port, ends.dst_port);

        let header_len = builder.size(0);
        if header_len > pkt_size {
            return Err(Error::Template(format!(
                "requested frame length ({pkt_size}) is smaller than headers ({header_len})"
            )));
        }
        let payload: Vec<u8> = PAYLOAD
            .iter()
            .copied()
            .cycle()
            .take(pkt_size - header_len)
            .collect();

        let mut data = vec![0u8; virt_header];
        data.reserve(pkt_size);
        builder
            .write(&mut data, &payload)
            .map_err(|e| Error::Template(e.to_string()))?;

        Ok(Self {
            data,
            virt_header,
            protocol,
        })
    }

    /// Whole buffer handed to the transport, virtual header included.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
}

/// A worker's private copy of the template, rotated in place.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    l2: usize,
    protocol: Protocol,
    rotator: AddressRotator,
    cur: Endpoints,
}

impl Frame {
    pub fn new(template: &PacketTemplate, rotator: AddressRotator) -> Self {
        let mut frame = Self {
            data: template.data.clone(),
            l2: template.virt_header,
            protocol: template.protocol,
            rotator,
            cur: rotator.first(),
        };
        frame.store();
        frame
    }

    #[inline(always)]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Address of the frame, for slots that reference it instead of
    /// holding a copy.
    pub fn addr(&self) -> u64 {
        self.data.as_ptr() as u64
    }

    pub fn endpoints(&self) -> Endpoints {
        self.cur
    }

    pub fn rotator(&self) -> &AddressRotator {
        &self.rotator
    }

    /// Moves to the next source/destination tuple. Only UDP frames rotate.
    #[inline]
    pub fn rotate(&mut self) {
        if self.protocol != Protocol::Udp {
            return;
        }
        self.rotator.step(&mut self.cur);
        self.store();
    }

    #[inline(always)]
    fn store(&mut self) {
        let l2 = self.l2;
        let d = &mut self.data;
        d[l2 + IP_SRC..l2 + IP_SRC + 4].copy_from_slice(&self.cur.src_ip.to_be_bytes());
        d[l2 + IP_DST..l2 + IP_DST + 4].copy_from_slice(&self.cur.dst_ip.to_be_bytes());
        d[l2 + UDP_SPORT..l2 + UDP_SPORT + 2].copy_from_slice(&self.cur.src_port.to_be_bytes());
        d[l2 + UDP_DPORT..l2 + UDP_DPORT + 2].copy_from_slice(&self.cur.dst_port.to_be_bytes());
    }
}

/// Hex and ASCII dump, 16 bytes per line.
pub fn hexdump(p: &[u8]) -> String {
    let mut out = String::with_capacity(p.len() * 4 + 16);
    for (line, chunk) in p.chunks(16).enumerate() {
        let _ = write!(out, "{:5}: ", line * 16);
        for b in chunk {
            let _ = write!(out, "{b:02x} ");
        }
        for _ in chunk.len()..16 {
            out.push_str("   ");
        }
        for &b in chunk {
            out.push(if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' });
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotate::AddrRange;
    use etherparse::{NetHeaders, PacketHeaders, TransportHeader};
    use std::net::Ipv4Addr;

    fn rotator() -> AddressRotator {
        AddressRotator::new(
            "10.0.0.1-10.0.0.2:1000-1001".parse().unwrap(),
            "10.1.0.1:2000".parse().unwrap(),
        )
    }

    fn udp_template(size: usize, vh: usize) -> PacketTemplate {
        let rot = rotator();
        PacketTemplate::build(Protocol::Udp, [2; 6], [4; 6], rot.first(), size, vh).unwrap()
    }

    #[test]
    fn test_template_length_and_headers() {
        let t = udp_template(60, 0);
        assert_eq!(t.len(), 60);
        let headers = PacketHeaders::from_ethernet_slice(t.bytes()).unwrap();
        match headers.net {
            Some(NetHeaders::Ipv4(ip, _)) => {
                assert_eq!(Ipv4Addr::from(ip.source), Ipv4Addr::new(10, 0, 0, 1));
                assert_eq!(Ipv4Addr::from(ip.destination), Ipv4Addr::new(10, 1, 0, 1));
            }
            _ => panic!("expected ipv4"),
        }
        match headers.transport {
            Some(TransportHeader::Udp(udp)) => {
                assert_eq!(udp.source_port, 1000);
                assert_eq!(udp.destination_port, 2000);
            }
            _ => panic!("expected udp"),
        }
    }

    #[test]
    fn test_virt_header_is_prepended() {
        let t = udp_template(60, 10);
        assert_eq!(t.len(), 70);
        assert!(t.bytes()[..10].iter().all(|&b| b == 0));
        assert!(PacketHeaders::from_ethernet_slice(&t.bytes()[10..]).is_ok());
    }

    #[test]
    fn test_too_short_frame_is_rejected() {
        let rot = rotator();
        let res = PacketTemplate::build(Protocol::Udp, [0; 6], [0; 6], rot.first(), 30, 0);
        assert!(matches!(res, Err(Error::Template(_))));
    }

    #[test]
    fn test_icmp_is_not_implemented() {
        let rot = rotator();
        let res = PacketTemplate::build(Protocol::Icmp, [0; 6], [0; 6], rot.first(), 60, 0);
        assert!(matches!(res, Err(Error::Unsupported("icmp"))));
    }

    #[test]
    fn test_frame_rotation_rewrites_headers() {
        let t = udp_template(64, 12);
        let mut f = Frame::new(&t, rotator());
        f.rotate();
        f.rotate();
        let headers = PacketHeaders::from_ethernet_slice(&f.bytes()[12..]).unwrap();
        let Some(NetHeaders::Ipv4(ip, _)) = headers.net else {
            panic!("expected ipv4");
        };
        assert_eq!(Ipv4Addr::from(ip.source), Ipv4Addr::new(10, 0, 0, 2));
        let Some(TransportHeader::Udp(udp)) = headers.transport else {
            panic!("expected udp");
        };
        assert_eq!(udp.source_port, 1000);
        assert_eq!(f.endpoints().src_ip, u32::from(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn test_frames_rotate_independently() {
        let t = udp_template(60, 0);
        let mut a = Frame::new(&t, rotator());
        let b = Frame::new(&t, rotator());
        a.rotate();
        assert_ne!(a.endpoints(), b.endpoints());
        assert_eq!(b.endpoints(), rotator().first());
    }

    #[test]
    fn test_hexdump_layout() {
        let dump = hexdump(b"0123456789abcdefXY");
        let lines: Vec<_> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("    0: 30 31 32"));
        assert!(lines[0].ends_with("0123456789abcdef"));
        assert!(lines[1].starts_with("   16: 58 59"));
        assert!(lines[1].ends_with("XY"));
    }

    #[test]
    fn test_static_range_keeps_frame() {
        let r = AddrRange::single(Ipv4Addr::new(1, 1, 1, 1), 7);
        let t = PacketTemplate::build(Protocol::Udp, [0; 6], [0; 6], AddressRotator::new(r, r).first(), 60, 0).unwrap();
        let mut f = Frame::new(&t, AddressRotator::new(r, r));
        let before = f.bytes().to_vec();
        f.rotate();
        assert_eq!(before, f.bytes());
    }
}
