//! Deterministic source/destination rotation.
//!
//! The four fields behave like the digits of an odometer, least significant
//! first: source port, source address, destination port, destination
//! address. Every digit has its own inclusive range.

use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::errors::Error;

pub const DEFAULT_PORT: u16 = 1234;

/// An inclusive IPv4 address range paired with an inclusive port range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddrRange {
    pub start: u32,
    pub end: u32,
    pub port0: u16,
    pub port1: u16,
}

impl AddrRange {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr, port0: u16, port1: u16) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            port0,
            port1,
        }
    }

    pub fn single(addr: Ipv4Addr, port: u16) -> Self {
        Self::new(addr, addr, port, port)
    }

    pub fn is_static(&self) -> bool {
        self.start == self.end && self.port0 == self.port1
    }

    /// Number of distinct (address, port) pairs in the range.
    pub fn count(&self) -> u64 {
        let addrs = u64::from(self.end.saturating_sub(self.start)) + 1;
        let ports = u64::from(self.port1.saturating_sub(self.port0)) + 1;
        addrs * ports
    }

    pub fn is_valid(&self) -> bool {
        self.start <= self.end && self.port0 <= self.port1
    }
}

/// Parses `a.b.c.d[-e.f.g.h][:port0[-port1]]`.
impl FromStr for AddrRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |what: &str| Error::Config(format!("bad address range {s:?}: {what}"));
        let (addrs, ports) = match s.split_once(':') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let (start, end) = match addrs.split_once('-') {
            Some((a, b)) => (a, b),
            None => (addrs, addrs),
        };
        let start = Ipv4Addr::from_str(start.trim()).map_err(|_| bad("start address"))?;
        let end = Ipv4Addr::from_str(end.trim()).map_err(|_| bad("end address"))?;
        let (port0, port1) = match ports {
            Some(p) => {
                let (p0, p1) = p.split_once('-').unwrap_or((p, p));
                let p0 = p0.trim().parse::<u16>().map_err(|_| bad("first port"))?;
                let p1 = p1.trim().parse::<u16>().map_err(|_| bad("last port"))?;
                (p0, p1)
            }
            None => (DEFAULT_PORT, DEFAULT_PORT),
        };
        let range = AddrRange::new(start, end, port0, port1);
        if !range.is_valid() {
            return Err(bad("range ends before it starts"));
        }
        Ok(range)
    }
}

/// Host-order view of the rotated header fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Endpoints {
    pub src_ip: u32,
    pub src_port: u16,
    pub dst_ip: u32,
    pub dst_port: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressRotator {
    src: AddrRange,
    dst: AddrRange,
}

impl AddressRotator {
    pub fn new(src: AddrRange, dst: AddrRange) -> Self {
        Self { src, dst }
    }

    /// The starting point every worker begins from.
    pub fn first(&self) -> Endpoints {
        Endpoints {
            src_ip: self.src.start,
            src_port: self.src.port0,
            dst_ip: self.dst.start,
            dst_port: self.dst.port0,
        }
    }

    /// Rotation never changes anything.
    pub fn is_static(&self) -> bool {
        self.src.is_static() && self.dst.is_static()
    }

    /// Number of steps before the sequence repeats.
    pub fn period(&self) -> u128 {
        u128::from(self.src.count()) * u128::from(self.dst.count())
    }

    /// Advances `cur` by one position. A field outside its range counts as
    /// overflowed and restarts from its first value.
    #[inline]
    pub fn step(&self, cur: &mut Endpoints) {
        let (src, dst) = (&self.src, &self.dst);

        if (src.port0..src.port1).contains(&cur.src_port) {
            cur.src_port += 1;
            return;
        }
        cur.src_port = src.port0;

        if (src.start..src.end).contains(&cur.src_ip) {
            cur.src_ip += 1;
            return;
        }
        cur.src_ip = src.start;

        if (dst.port0..dst.port1).contains(&cur.dst_port) {
            cur.dst_port += 1;
            return;
        }
        cur.dst_port = dst.port0;

        if (dst.start..dst.end).contains(&cur.dst_ip) {
            cur.dst_ip += 1;
            return;
        }
        cur.dst_ip = dst.start;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn range(start: u32, addrs: u32, port0: u16, ports: u16) -> AddrRange {
        AddrRange {
            start,
            end: start + addrs - 1,
            port0,
            port1: port0 + ports - 1,
        }
    }

    #[test]
    fn test_parse_full_range() {
        let r: AddrRange = "10.0.0.1-10.0.0.4:1000-1003".parse().unwrap();
        assert_eq!(r.start, u32::from(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(r.end, u32::from(Ipv4Addr::new(10, 0, 0, 4)));
        assert_eq!((r.port0, r.port1), (1000, 1003));
        assert_eq!(r.count(), 16);
    }

    #[test]
    fn test_parse_defaults() {
        let r: AddrRange = "192.168.1.7".parse().unwrap();
        assert_eq!(r.start, r.end);
        assert_eq!((r.port0, r.port1), (DEFAULT_PORT, DEFAULT_PORT));
        assert!(r.is_static());

        let r: AddrRange = "192.168.1.7:80".parse().unwrap();
        assert_eq!((r.port0, r.port1), (80, 80));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("10.0.0.9-10.0.0.1".parse::<AddrRange>().is_err());
        assert!("10.0.0.1:90-80".parse::<AddrRange>().is_err());
        assert!("10.0.0".parse::<AddrRange>().is_err());
        assert!("10.0.0.1:http".parse::<AddrRange>().is_err());
    }

    #[test]
    fn test_source_port_moves_fastest() {
        let rot = AddressRotator::new(range(100, 2, 10, 2), range(200, 1, 20, 1));
        let mut cur = rot.first();
        let mut seen = vec![cur];
        for _ in 0..4 {
            rot.step(&mut cur);
            seen.push(cur);
        }
        let pairs: Vec<_> = seen.iter().map(|e| (e.src_ip, e.src_port)).collect();
        assert_eq!(pairs, [(100, 10), (100, 11), (101, 10), (101, 11), (100, 10)]);
    }

    #[test]
    fn test_out_of_range_field_wraps() {
        let rot = AddressRotator::new(range(100, 2, 10, 2), range(200, 2, 20, 1));
        let mut cur = rot.first();
        cur.src_port = 5;
        rot.step(&mut cur);
        assert_eq!(cur.src_port, 10);
        assert_eq!(cur.src_ip, 101);
    }

    #[test]
    fn test_static_rotation_is_identity() {
        let r = AddrRange::single(Ipv4Addr::new(10, 0, 0, 1), 9);
        let rot = AddressRotator::new(r, r);
        assert!(rot.is_static());
        let mut cur = rot.first();
        rot.step(&mut cur);
        assert_eq!(cur, rot.first());
    }

    proptest! {
        #[test]
        fn odometer_visits_cartesian_product(
            s_ip in 0u32..1000, s_n in 1u32..4, s_p in 1000u16..2000, s_pn in 1u16..4,
            d_ip in 0u32..1000, d_n in 1u32..4, d_p in 1000u16..2000, d_pn in 1u16..4,
        ) {
            let src = range(s_ip, s_n, s_p, s_pn);
            let dst = range(d_ip, d_n, d_p, d_pn);
            let rot = AddressRotator::new(src, dst);
            let period = rot.period() as u64;

            let mut cur = rot.first();
            let mut seen = HashSet::new();
            for k in 0..period {
                // digit-priority order: src port, src ip, dst port, dst ip
                let mut q = k;
                let expect = Endpoints {
                    src_port: s_p + (q % u64::from(s_pn)) as u16,
                    src_ip: { q /= u64::from(s_pn); s_ip + (q % u64::from(s_n)) as u32 },
                    dst_port: { q /= u64::from(s_n); d_p + (q % u64::from(d_pn)) as u16 },
                    dst_ip: { q /= u64::from(d_pn); d_ip + (q % u64::from(d_n)) as u32 },
                };
                prop_assert_eq!(cur, expect);
                prop_assert!(cur.src_ip >= src.start && cur.src_ip <= src.end);
                prop_assert!(cur.src_port >= src.port0 && cur.src_port <= src.port1);
                prop_assert!(cur.dst_ip >= dst.start && cur.dst_ip <= dst.end);
                prop_assert!(cur.dst_port >= dst.port0 && cur.dst_port <= dst.port1);
                prop_assert!(seen.insert(cur));
                rot.step(&mut cur);
            }
            prop_assert_eq!(cur, rot.first());
            prop_assert_eq!(seen.len() as u64, period);
        }
    }
}
