//! In-process slot rings with the netmap head/cursor/tail discipline.
//!
//! A TX sync completes every slot handed over so far; an RX sync delivers
//! copies of a configured packet into the free slots. Useful for measuring
//! the generator itself and for exercising the engine without a NIC.

use std::thread;
use std::time::Duration;

use tracing::trace;

use crate::api::{Backend, Direction, Error, Readiness, Result, Ring, RingSet, Slot};
use crate::batch::RingTransport;
use crate::config::{GlobalConfig, Mode, TransportKind};

pub const DEFAULT_SLOTS: usize = 1024;
pub const DEFAULT_BUF_SIZE: usize = 2048;

#[derive(Debug)]
pub struct MemRing {
    num_slots: usize,
    buf_size: usize,
    data: Vec<u8>,
    lens: Vec<u16>,
    flags: Vec<u16>,
    ptrs: Vec<u64>,
    head: usize,
    cur: usize,
    tail: usize,
    /// First slot not yet processed by the transport side.
    hwcur: usize,
}

impl MemRing {
    /// An empty TX ring: every slot but one is free.
    pub fn new(num_slots: usize, buf_size: usize) -> Self {
        let mut ring = Self::rx(num_slots, buf_size);
        ring.tail = num_slots - 1;
        ring
    }

    /// An RX ring with nothing received yet.
    pub fn rx(num_slots: usize, buf_size: usize) -> Self {
        assert!(num_slots >= 2, "a ring needs at least two slots");
        Self {
            num_slots,
            buf_size,
            data: vec![0; num_slots * buf_size],
            lens: vec![0; num_slots],
            flags: vec![0; num_slots],
            ptrs: vec![0; num_slots],
            head: 0,
            cur: 0,
            tail: 0,
            hwcur: 0,
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    #[inline(always)]
    fn dist(&self, from: usize, to: usize) -> usize {
        (to + self.num_slots - from) % self.num_slots
    }

    #[inline(always)]
    fn prev(&self, idx: usize) -> usize {
        if idx == 0 { self.num_slots - 1 } else { idx - 1 }
    }

    /// Completes every slot released by the caller and returns how many.
    fn tx_complete(&mut self) -> usize {
        let done = self.dist(self.hwcur, self.head);
        self.hwcur = self.head;
        self.tail = self.prev(self.head);
        done
    }

    /// Takes back consumed slots and fills up to `max` free ones with
    /// `pkt`. Returns how many were filled.
    fn rx_fill(&mut self, pkt: &[u8], max: u64) -> usize {
        self.hwcur = self.head;
        let free = self.dist(self.tail, self.prev(self.head));
        let n = free.min(usize::try_from(max).unwrap_or(usize::MAX));
        let len = pkt.len().min(self.buf_size);
        for _ in 0..n {
            let idx = self.tail;
            let off = idx * self.buf_size;
            self.data[off..off + len].copy_from_slice(&pkt[..len]);
            self.lens[idx] = len as u16;
            self.flags[idx] = 0;
            self.tail = self.next(idx);
        }
        n
    }
}

impl Ring for MemRing {
    #[inline(always)]
    fn num_slots(&self) -> usize {
        self.num_slots
    }

    #[inline(always)]
    fn cursor(&self) -> usize {
        self.cur
    }

    #[inline(always)]
    fn space(&self) -> usize {
        self.dist(self.cur, self.tail)
    }

    fn slot_at(&mut self, idx: usize) -> Slot<'_> {
        let off = idx * self.buf_size;
        Slot {
            buf: &mut self.data[off..off + self.buf_size],
            len: &mut self.lens[idx],
            flags: &mut self.flags[idx],
            ptr: &mut self.ptrs[idx],
        }
    }

    #[inline(always)]
    fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.space());
        self.cur = (self.cur + n) % self.num_slots;
        self.head = self.cur;
    }

    #[inline(always)]
    fn pending(&self) -> bool {
        self.next(self.tail) != self.head
    }
}

/// The rings of one open `mem` device.
#[derive(Debug)]
pub struct MemPort {
    tx: Vec<MemRing>,
    rx: Vec<MemRing>,
    /// TX syncs left that complete nothing.
    stall_syncs: usize,
    /// Polls left before the port reports a hardware error.
    polls_before_error: Option<usize>,
    worker: usize,
    rx_packet: Option<Vec<u8>>,
    /// Packets left to deliver, `None` for an endless source.
    rx_left: Option<u64>,
    transmitted: u64,
    received: u64,
}

impl MemPort {
    pub fn new(rings: usize, slots: usize, buf_size: usize) -> Self {
        Self {
            tx: (0..rings).map(|_| MemRing::new(slots, buf_size)).collect(),
            rx: (0..rings).map(|_| MemRing::rx(slots, buf_size)).collect(),
            stall_syncs: 0,
            polls_before_error: None,
            worker: 0,
            rx_packet: None,
            rx_left: None,
            transmitted: 0,
            received: 0,
        }
    }

    /// The next `n` TX syncs complete nothing.
    pub fn with_stall(mut self, n: usize) -> Self {
        self.stall_syncs = n;
        self
    }

    /// Every poll after the first `polls` fails with [`Error::Poll`] for
    /// `worker`.
    pub fn with_poll_error(mut self, worker: usize, polls: usize) -> Self {
        self.worker = worker;
        self.polls_before_error = Some(polls);
        self
    }

    /// RX syncs deliver copies of `pkt`, `count` in total (0 for no limit).
    pub fn with_rx_source(mut self, pkt: Vec<u8>, count: u64) -> Self {
        self.rx_packet = Some(pkt);
        self.rx_left = (count > 0).then_some(count);
        self
    }

    /// Slots completed by TX syncs so far.
    pub fn transmitted(&self) -> u64 {
        self.transmitted
    }

    /// Slots delivered by RX syncs so far.
    pub fn delivered(&self) -> u64 {
        self.received
    }
}

impl RingSet for MemPort {
    type Ring = MemRing;

    fn rings(&mut self, dir: Direction) -> &mut [MemRing] {
        match dir {
            Direction::Tx => &mut self.tx,
            Direction::Rx => &mut self.rx,
        }
    }

    fn sync(&mut self, dir: Direction) -> Result<()> {
        match dir {
            Direction::Tx => {
                if self.stall_syncs > 0 {
                    self.stall_syncs -= 1;
                    trace!(left = self.stall_syncs, "tx sync stalled");
                    return Ok(());
                }
                for ring in &mut self.tx {
                    self.transmitted += ring.tx_complete() as u64;
                }
            }
            Direction::Rx => {
                let Some(pkt) = self.rx_packet.as_deref() else {
                    return Ok(());
                };
                for ring in &mut self.rx {
                    let max = self.rx_left.unwrap_or(u64::MAX);
                    if max == 0 {
                        break;
                    }
                    let n = ring.rx_fill(pkt, max) as u64;
                    self.received += n;
                    if let Some(left) = self.rx_left.as_mut() {
                        *left -= n;
                    }
                }
            }
        }
        Ok(())
    }

    fn poll(&mut self, dir: Direction, timeout: Duration) -> Result<Readiness> {
        if let Some(left) = self.polls_before_error.as_mut() {
            if *left == 0 {
                return Err(Error::Poll(self.worker));
            }
            *left -= 1;
        }
        self.sync(dir)?;
        if self.rings(dir).iter().any(|r| !r.is_empty()) {
            return Ok(Readiness::Ready);
        }
        thread::sleep(timeout);
        Ok(Readiness::Timeout)
    }
}

/// Opens a private [`MemPort`] for every worker.
#[derive(Clone, Debug)]
pub struct MemBackend {
    pub rings: usize,
    pub slots: usize,
    pub buf_size: usize,
    /// Stalled TX syncs at the start of every port.
    pub stall_syncs: usize,
    /// `(worker, polls)`: that worker's port fails every poll after the
    /// first `polls`.
    pub poll_error: Option<(usize, usize)>,
}

impl MemBackend {
    pub fn new(rings: usize) -> Self {
        Self {
            rings: rings.max(1),
            slots: DEFAULT_SLOTS,
            buf_size: DEFAULT_BUF_SIZE,
            stall_syncs: 0,
            poll_error: None,
        }
    }

    pub fn open_port(&self, cfg: &GlobalConfig, worker: usize) -> Result<MemPort> {
        if cfg.tx_size() > self.buf_size {
            return Err(Error::TooBigPacket(cfg.tx_size()));
        }
        // one ring per worker when the rings are split across threads
        let rings = if cfg.nthreads > 1 { 1 } else { self.rings };
        let mut port = MemPort::new(rings, self.slots, self.buf_size).with_stall(self.stall_syncs);
        if let Some((w, polls)) = self.poll_error {
            if w == worker {
                port = port.with_poll_error(worker, polls);
            }
        }
        if cfg.mode == Mode::Rx {
            let pkt = cfg
                .template()
                .map(|t| t.bytes().to_vec())
                .unwrap_or_else(|_| vec![0; cfg.tx_size()]);
            return Ok(port.with_rx_source(pkt, 0));
        }
        Ok(port)
    }
}

impl Backend for MemBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::Ring
    }

    fn open(&self, cfg: &GlobalConfig, worker: usize) -> Result<Box<dyn crate::api::Transport>> {
        let port = self.open_port(cfg, worker)?;
        trace!(worker, rings = self.rings, slots = self.slots, "mem port open");
        Ok(Box::new(RingTransport::new(port)))
    }
}
