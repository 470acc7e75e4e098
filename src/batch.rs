//! Filling and draining ring slots in batches.

use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::api::{
    Direction, Readiness, Result, Ring, RingSet, SlotFlags, Transport, likely, unlikely,
};
use crate::config::{Options, TransportKind};
use crate::packet::{Frame, hexdump};

/// Delay between syncs while waiting for the transport to drain.
const DRAIN_DELAY: Duration = Duration::from_micros(1);

/// How many packets the current loop iteration may still enqueue.
#[derive(Clone, Copy, Debug)]
pub struct Budget {
    burst: usize,
    /// Rate limiter tokens, when limited.
    tokens: Option<usize>,
    /// Packets left before the worker target, when bounded.
    remaining: Option<u64>,
    frags: usize,
    opts: Options,
}

impl Budget {
    pub fn new(burst: usize, frags: usize, opts: Options) -> Self {
        Self {
            burst,
            tokens: None,
            remaining: None,
            frags: frags.max(1),
            opts,
        }
    }

    pub fn with_tokens(mut self, tokens: usize) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_remaining(mut self, remaining: u64) -> Self {
        self.remaining = Some(remaining);
        self
    }

    /// Packets the next ring may take: the burst (or the tokens left)
    /// capped by the remaining target. The remaining target is rounded up
    /// to whole packets, so a bounded run may end up to `frags - 1` slots
    /// past it.
    pub fn limit(&self) -> usize {
        let limit = self.tokens.unwrap_or(self.burst);
        match self.remaining {
            Some(r) => {
                let r = usize::try_from(r).unwrap_or(usize::MAX);
                limit.min(r.div_ceil(self.frags).saturating_mul(self.frags))
            }
            None => limit,
        }
    }

    pub fn consume(&mut self, n: usize) {
        if let Some(t) = self.tokens.as_mut() {
            *t = t.saturating_sub(n);
        }
        if let Some(r) = self.remaining.as_mut() {
            *r = r.saturating_sub(n as u64);
        }
    }

    /// Whether nothing more may be sent: the target is reached or the
    /// tokens left cannot cover a whole packet.
    pub fn exhausted(&self) -> bool {
        self.tokens.is_some_and(|t| t < self.frags) || self.remaining == Some(0)
    }

    pub fn frags(&self) -> usize {
        self.frags
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }
}

#[inline(always)]
fn prefetch(buf: &[u8]) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_MM_HINT_T0, _mm_prefetch};
        _mm_prefetch::<_MM_HINT_T0>(buf.as_ptr() as *const i8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = buf;
}

/// Writes up to `limit` packets into consecutive slots from the cursor and
/// returns how many slots were handed to the transport.
///
/// With `frags > 1` every packet spans `frags` slots, all but the last one
/// flagged [`SlotFlags::MOREFRAG`], and the count is rounded down to whole
/// packets. The last slot of the batch carries [`SlotFlags::REPORT`].
pub fn send_packets<R: Ring + ?Sized>(
    ring: &mut R,
    frame: &mut Frame,
    limit: usize,
    frags: usize,
    opts: &Options,
) -> usize {
    let frags = frags.max(1);
    let space = ring.space();
    let mut count = limit.min(space);
    if frags > 1 {
        count -= count % frags;
    }
    if unlikely(count == 0) {
        if limit > 0 && frags > 1 {
            warn!(limit, space, frags, "truncating packet, no room for frags");
        }
        return 0;
    }

    let size = frame.len();
    let mut cur = ring.cursor();
    let mut fcnt = frags;
    for sent in 0..count {
        let next = ring.next(cur);
        let mut slot = ring.slot_at(cur);
        let mut flags = SlotFlags::empty();
        if opts.indirect {
            flags.insert(SlotFlags::INDIRECT);
            *slot.ptr = frame.addr();
        } else if opts.copy {
            let n = size.min(slot.buf.len());
            slot.buf[..n].copy_from_slice(&frame.bytes()[..n]);
            if fcnt == frags {
                frame.rotate();
            }
        } else if opts.prefetch {
            prefetch(slot.buf);
        }
        if opts.dump {
            let n = size.min(slot.buf.len());
            debug!(slot = cur, "tx\n{}", hexdump(&slot.buf[..n]));
        }
        *slot.len = size as u16;
        fcnt -= 1;
        if fcnt > 0 {
            flags.insert(SlotFlags::MOREFRAG);
        } else {
            fcnt = frags;
        }
        if sent == count - 1 {
            flags.remove(SlotFlags::MOREFRAG);
            flags.insert(SlotFlags::REPORT);
        }
        slot.set_flags(flags);
        cur = next;
    }
    ring.advance(count);
    count
}

/// Offers a batch to every ring with room, charging `budget` as it goes.
pub fn fill_rings<R: Ring>(rings: &mut [R], frame: &mut Frame, budget: &mut Budget) -> usize {
    let mut sent = 0;
    for ring in rings.iter_mut() {
        if budget.exhausted() {
            break;
        }
        if ring.is_empty() {
            continue;
        }
        let m = send_packets(ring, frame, budget.limit(), budget.frags(), &budget.opts);
        budget.consume(m);
        sent += m;
    }
    sent
}

/// Consumes up to `limit` received slots across `rings`.
pub fn drain_rx<R: Ring>(rings: &mut [R], limit: usize, dump: bool) -> usize {
    let mut received = 0;
    for ring in rings.iter_mut() {
        if received >= limit {
            break;
        }
        let n = ring.space().min(limit - received);
        if n == 0 {
            continue;
        }
        if dump {
            let mut cur = ring.cursor();
            for _ in 0..n {
                let next = ring.next(cur);
                let slot = ring.slot_at(cur);
                let len = usize::from(*slot.len).min(slot.buf.len());
                debug!(slot = cur, flags = ?slot.flags(), "rx\n{}", hexdump(&slot.buf[..len]));
                cur = next;
            }
        }
        ring.advance(n);
        received += n;
    }
    received
}

/// Syncs and then waits, one short delay per retry, until no TX ring has
/// transmissions pending.
pub fn drain_tx<S: RingSet + ?Sized>(set: &mut S) -> Result<()> {
    set.sync(Direction::Tx)?;
    let n = set.rings(Direction::Tx).len();
    for i in 0..n {
        while set.rings(Direction::Tx)[i].pending() {
            set.sync(Direction::Tx)?;
            thread::sleep(DRAIN_DELAY);
        }
    }
    Ok(())
}

/// [`Transport`] over any [`RingSet`].
pub struct RingTransport<S> {
    set: S,
}

impl<S: RingSet> RingTransport<S> {
    pub fn new(set: S) -> Self {
        Self { set }
    }

    pub fn get_ref(&self) -> &S {
        &self.set
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.set
    }

    pub fn into_inner(self) -> S {
        self.set
    }
}

impl<S: RingSet> Transport for RingTransport<S> {
    fn kind(&self) -> TransportKind {
        TransportKind::Ring
    }

    fn poll_ready(&mut self, dir: Direction, timeout: Duration) -> Result<Readiness> {
        self.set.poll(dir, timeout)
    }

    fn send_one(&mut self, frame: &[u8]) -> Result<bool> {
        let Some(ring) = self
            .set
            .rings(Direction::Tx)
            .iter_mut()
            .find(|r| !r.is_empty())
        else {
            return Ok(false);
        };
        let cur = ring.cursor();
        let mut slot = ring.slot_at(cur);
        let n = frame.len().min(slot.buf.len());
        slot.buf[..n].copy_from_slice(&frame[..n]);
        *slot.len = frame.len() as u16;
        slot.set_flags(SlotFlags::REPORT);
        ring.advance(1);
        Ok(true)
    }

    fn send_batch(&mut self, frame: &mut Frame, budget: &mut Budget) -> Result<usize> {
        let rings = self.set.rings(Direction::Tx);
        let sent = fill_rings(rings, frame, budget);
        Ok(sent)
    }

    fn recv_batch(&mut self, limit: usize, dump: bool) -> Result<usize> {
        let received = drain_rx(self.set.rings(Direction::Rx), limit, dump);
        if likely(received > 0) {
            self.set.sync(Direction::Rx)?;
        }
        Ok(received)
    }

    fn flush(&mut self) -> Result<()> {
        drain_tx(&mut self.set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalConfig;
    use crate::mem::{MemPort, MemRing};

    fn frame() -> Frame {
        let cfg = GlobalConfig {
            src: "10.0.0.1:1000-1003".parse().unwrap(),
            ..Default::default()
        };
        Frame::new(&cfg.template().unwrap(), cfg.rotator())
    }

    fn copy() -> Options {
        Options {
            copy: true,
            ..Default::default()
        }
    }

    fn flags_of(ring: &mut MemRing, from: usize, n: usize) -> Vec<SlotFlags> {
        (0..n)
            .map(|i| ring.slot_at((from + i) % ring.num_slots()).flags())
            .collect()
    }

    #[test]
    fn test_batch_never_exceeds_space() {
        let mut ring = MemRing::new(16, 2048);
        let mut f = frame();
        assert_eq!(ring.space(), 15);
        let sent = send_packets(&mut ring, &mut f, 100, 1, &copy());
        assert_eq!(sent, 15);
        assert_eq!(ring.space(), 0);
        assert_eq!(send_packets(&mut ring, &mut f, 100, 1, &copy()), 0);
    }

    #[test]
    fn test_batch_respects_limit() {
        let mut ring = MemRing::new(64, 2048);
        let mut f = frame();
        assert_eq!(send_packets(&mut ring, &mut f, 10, 1, &copy()), 10);
        assert_eq!(ring.cursor(), 10);
        assert_eq!(ring.space(), 53);
    }

    #[test]
    fn test_report_only_on_last_slot() {
        let mut ring = MemRing::new(64, 2048);
        let mut f = frame();
        let sent = send_packets(&mut ring, &mut f, 5, 1, &copy());
        let flags = flags_of(&mut ring, 0, sent);
        for fl in &flags[..4] {
            assert!(!fl.contains(SlotFlags::REPORT));
            assert!(!fl.contains(SlotFlags::MOREFRAG));
        }
        assert!(flags[4].contains(SlotFlags::REPORT));
    }

    #[test]
    fn test_fragments_round_down_and_flag() {
        let mut ring = MemRing::new(16, 2048);
        let mut f = frame();
        // 15 free slots, 4 fragments per packet: 3 packets = 12 slots
        let sent = send_packets(&mut ring, &mut f, 100, 4, &copy());
        assert_eq!(sent, 12);
        let flags = flags_of(&mut ring, 0, sent);
        for (i, fl) in flags.iter().enumerate() {
            let terminal = i % 4 == 3;
            assert_eq!(fl.contains(SlotFlags::MOREFRAG), !terminal, "slot {i}");
            assert_eq!(fl.contains(SlotFlags::REPORT), i == sent - 1, "slot {i}");
        }
    }

    #[test]
    fn test_fragments_do_not_fit() {
        let mut ring = MemRing::new(4, 2048);
        let mut f = frame();
        assert_eq!(ring.space(), 3);
        assert_eq!(send_packets(&mut ring, &mut f, 8, 4, &copy()), 0);
        assert_eq!(ring.cursor(), 0);
        assert_eq!(ring.space(), 3);
    }

    #[test]
    fn test_copy_rotates_once_per_packet() {
        let mut ring = MemRing::new(16, 2048);
        let mut f = frame();
        let first = f.endpoints();
        // 2 packets of 2 fragments each
        send_packets(&mut ring, &mut f, 4, 2, &copy());
        assert_eq!(f.endpoints().src_port, first.src_port + 2);
        let port = |ring: &mut MemRing, i: usize| {
            let s = ring.slot_at(i);
            u16::from_be_bytes([s.buf[34], s.buf[35]])
        };
        assert_eq!(port(&mut ring, 0), 1000);
        assert_eq!(port(&mut ring, 1), 1001);
        assert_eq!(port(&mut ring, 2), 1001);
        assert_eq!(port(&mut ring, 3), 1002);
    }

    #[test]
    fn test_indirect_points_at_frame() {
        let mut ring = MemRing::new(8, 2048);
        let mut f = frame();
        let opts = Options {
            indirect: true,
            ..Default::default()
        };
        send_packets(&mut ring, &mut f, 2, 1, &opts);
        let slot = ring.slot_at(0);
        assert!(slot.flags().contains(SlotFlags::INDIRECT));
        assert_eq!(*slot.ptr, f.addr());
        assert_eq!(usize::from(*slot.len), f.len());
    }

    #[test]
    fn test_budget_limits() {
        let b = Budget::new(512, 1, Options::default());
        assert_eq!(b.limit(), 512);
        let mut b = b.with_tokens(10).with_remaining(4);
        assert_eq!(b.limit(), 4);
        b.consume(4);
        assert!(b.exhausted());
        let mut b = Budget::new(512, 1, Options::default()).with_tokens(10);
        b.consume(3);
        assert_eq!(b.limit(), 7);
    }

    #[test]
    fn test_fragment_budget_whole_packets() {
        // one slot left of the target still buys a whole packet
        let b = Budget::new(30, 3, Options::default()).with_remaining(1);
        assert_eq!(b.limit(), 3);
        assert!(!b.exhausted());
        let b = Budget::new(30, 3, Options::default()).with_remaining(4);
        assert_eq!(b.limit(), 6);

        // 10 tokens in groups of 3: the last token cannot cover a packet
        let mut port = MemPort::new(2, 64, 2048);
        let mut f = frame();
        let mut budget = Budget::new(10, 3, copy()).with_tokens(10);
        let sent = fill_rings(port.rings(Direction::Tx), &mut f, &mut budget);
        assert_eq!(sent, 9);
        assert!(budget.exhausted());
    }

    #[test]
    fn test_fill_rings_spreads_over_rings() {
        let mut port = MemPort::new(2, 8, 2048);
        let mut f = frame();
        let mut budget = Budget::new(10, 1, copy());
        let sent = fill_rings(port.rings(Direction::Tx), &mut f, &mut budget);
        // the burst caps each ring, not the whole pass
        assert_eq!(sent, 14);
        let mut budget = Budget::new(10, 1, copy()).with_tokens(9);
        port.sync(Direction::Tx).unwrap();
        let sent = fill_rings(port.rings(Direction::Tx), &mut f, &mut budget);
        assert_eq!(sent, 9);
        assert!(budget.exhausted());
    }

    #[test]
    fn test_drain_rx_counts_and_advances() {
        let mut port = MemPort::new(1, 16, 2048).with_rx_source(frame().bytes().to_vec(), 5);
        port.sync(Direction::Rx).unwrap();
        let rings = port.rings(Direction::Rx);
        assert_eq!(rings[0].space(), 5);
        assert_eq!(drain_rx(rings, 3, true), 3);
        assert_eq!(drain_rx(rings, 100, false), 2);
        assert_eq!(drain_rx(rings, 100, false), 0);
    }

    #[test]
    fn test_flush_drains_pending() {
        let mut t = RingTransport::new(MemPort::new(1, 32, 2048));
        let mut f = frame();
        let mut budget = Budget::new(20, 1, copy());
        assert_eq!(t.send_batch(&mut f, &mut budget).unwrap(), 20);
        assert!(t.get_mut().rings(Direction::Tx)[0].pending());
        t.flush().unwrap();
        assert!(!t.get_mut().rings(Direction::Tx)[0].pending());
        assert_eq!(t.get_ref().transmitted(), 20);
    }
}
