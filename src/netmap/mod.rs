//! netmap ports as ring sets.

use std::time::Duration;

use netmap_rs::{Port, RawRing};
use nix::poll::PollFlags;
use tracing::{error, info};

use crate::api::{Backend, Direction, Error, Readiness, Result, Ring, RingSet, Slot, Transport};
use crate::batch::RingTransport;
use crate::config::{GlobalConfig, TransportKind};

pub struct NetmapRing {
    raw: RawRing,
}

impl Ring for NetmapRing {
    #[inline(always)]
    fn num_slots(&self) -> usize {
        self.raw.num_slots() as usize
    }

    #[inline(always)]
    fn cursor(&self) -> usize {
        self.raw.cur() as usize
    }

    #[inline(always)]
    fn space(&self) -> usize {
        self.raw.space() as usize
    }

    #[inline(always)]
    fn slot_at(&mut self, idx: usize) -> Slot<'_> {
        let s = self.raw.slot(idx as u32);
        Slot {
            buf: s.buf,
            len: s.len,
            flags: s.flags,
            ptr: s.ptr,
        }
    }

    #[inline(always)]
    fn advance(&mut self, n: usize) {
        self.raw.advance(n as u32);
    }

    #[inline(always)]
    fn pending(&self) -> bool {
        self.raw.tx_pending()
    }
}

/// The rings one worker owns on a netmap port.
pub struct NetmapPort {
    // rings point into the port's mapping
    tx: Vec<NetmapRing>,
    rx: Vec<NetmapRing>,
    port: Port,
    worker: usize,
}

impl NetmapPort {
    /// Opens `spec` for worker `worker`. With more than one thread every
    /// worker gets hardware ring `worker`, which requires a spec that does
    /// not already pick its rings.
    pub fn open(spec: &str, nthreads: usize, worker: usize) -> Result<Self> {
        let mut port = Port::prepare(spec)?;
        if nthreads > 1 {
            if !port.binds_all_rings() {
                return Err(Error::RingPerThread(spec.to_owned()));
            }
            port.select_ring(worker as u16);
        }
        port.register()?;
        let tx = port
            .tx_rings()
            .map(|i| port.tx_ring(i).map(|raw| NetmapRing { raw }))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let rx = port
            .rx_rings()
            .map(|i| port.rx_ring(i).map(|raw| NetmapRing { raw }))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        info!(
            worker,
            port = port.spec(),
            tx_rings = tx.len(),
            rx_rings = rx.len(),
            "netmap port open"
        );
        Ok(Self { tx, rx, port, worker })
    }

    pub fn buf_size(&self) -> usize {
        self.tx.first().map_or(0, |r| r.raw.buf_size())
    }
}

impl RingSet for NetmapPort {
    type Ring = NetmapRing;

    fn rings(&mut self, dir: Direction) -> &mut [NetmapRing] {
        match dir {
            Direction::Tx => &mut self.tx,
            Direction::Rx => &mut self.rx,
        }
    }

    fn sync(&mut self, dir: Direction) -> Result<()> {
        match dir {
            Direction::Tx => self.port.tx_sync()?,
            Direction::Rx => self.port.rx_sync()?,
        }
        Ok(())
    }

    fn poll(&mut self, dir: Direction, timeout: Duration) -> Result<Readiness> {
        let events = match dir {
            Direction::Tx => PollFlags::POLLOUT,
            Direction::Rx => PollFlags::POLLIN,
        };
        let ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let (ready, revents) = self.port.poll(events, ms)?;
        if revents.contains(PollFlags::POLLERR) {
            error!(worker = self.worker, "poll error on queue {}", self.worker);
            return Err(Error::Poll(self.worker));
        }
        Ok(match ready {
            netmap_rs::Readiness::Ready => Readiness::Ready,
            netmap_rs::Readiness::Timeout => Readiness::Timeout,
        })
    }
}

#[derive(Debug)]
pub struct NetmapBackend {
    spec: String,
}

impl NetmapBackend {
    pub fn new(spec: impl Into<String>) -> Self {
        Self { spec: spec.into() }
    }
}

impl Backend for NetmapBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::Ring
    }

    fn open(&self, cfg: &GlobalConfig, worker: usize) -> Result<Box<dyn Transport>> {
        let port = NetmapPort::open(&self.spec, cfg.nthreads, worker)?;
        if cfg.tx_size() > port.buf_size() && !cfg.options.indirect {
            return Err(Error::TooBigPacket(cfg.tx_size()));
        }
        Ok(Box::new(RingTransport::new(port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // needs the netmap module and a VALE switch
    #[test]
    #[ignore]
    fn test_vale_roundtrip() {
        let cfg = GlobalConfig::default();
        let mut rx = NetmapPort::open("vale0:rx", 1, 0).unwrap();
        let backend = NetmapBackend::new("vale0:tx");
        let mut tx = backend.open(&cfg, 0).unwrap();
        assert!(tx.send_one(&[0xab; 60]).unwrap());
        tx.flush().unwrap();
        rx.poll(Direction::Rx, Duration::from_millis(100)).unwrap();
        rx.sync(Direction::Rx).unwrap();
        let received: usize = rx.rings(Direction::Rx).iter().map(|r| r.space()).sum();
        assert_eq!(received, 1);
    }

    #[test]
    #[ignore]
    fn test_pinned_spec_rejected_with_threads() {
        let res = NetmapPort::open("vale0:pinned-0", 2, 1);
        assert!(matches!(res, Err(Error::RingPerThread(_)) | Err(Error::Netmap(_))));
    }
}
