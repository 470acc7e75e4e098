//! Per-thread send and receive loops.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use nix::sys::time::TimeSpec;
use tracing::{debug, error, info, warn};
use triomphe::Arc;

use crate::affinity;
use crate::api::{Direction, Readiness, Result, Transport, unlikely};
use crate::batch::Budget;
use crate::config::{GlobalConfig, Mode, TransportKind};
use crate::packet::{Frame, PacketTemplate};
use crate::rate::{self, RateLimiter};

/// Packets sent with the copy option forced on, so that every ring buffer
/// holds the frame before copying may stop.
pub const COPY_WARMUP_PACKETS: u64 = 100_000;

/// Single-packet transports publish their counter this often.
const PUBLISH_EVERY: u32 = 10_000;

/// State shared between a worker and the coordinator.
///
/// The flags and the counter are progress indicators: they are read with
/// relaxed ordering and may lag behind the worker.
#[derive(Debug)]
pub struct WorkerState {
    pub index: usize,
    /// Core to bind to, if any.
    pub affinity: Option<usize>,
    count: AtomicU64,
    used: AtomicBool,
    cancel: AtomicBool,
    completed: AtomicBool,
}

impl WorkerState {
    pub fn new(index: usize, affinity: Option<usize>) -> Self {
        Self {
            index,
            affinity,
            count: AtomicU64::new(0),
            used: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            completed: AtomicBool::new(false),
        }
    }

    /// Packets handled so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn publish(&self, n: u64) {
        self.count.store(n, Ordering::Relaxed);
    }

    /// Whether the worker is (still) running.
    pub fn used(&self) -> bool {
        self.used.load(Ordering::Relaxed)
    }

    pub(crate) fn set_used(&self, used: bool) {
        self.used.store(used, Ordering::Relaxed);
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Whether the worker ran its loop to the end and drained.
    pub fn completed(&self) -> bool {
        self.completed.load(Ordering::Relaxed)
    }
}

/// Timestamps a worker returns through its join handle.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WorkerReport {
    pub tic: Option<TimeSpec>,
    pub toc: Option<TimeSpec>,
}

pub struct Worker {
    state: std::sync::Arc<WorkerState>,
    cfg: Arc<GlobalConfig>,
    transport: Box<dyn Transport>,
    frame: Option<Frame>,
}

impl Worker {
    /// A worker owning `transport`. Sending workers get their own copy of
    /// `template`.
    pub fn new(
        state: std::sync::Arc<WorkerState>,
        cfg: Arc<GlobalConfig>,
        transport: Box<dyn Transport>,
        template: Option<&PacketTemplate>,
    ) -> Self {
        let frame = template.map(|t| Frame::new(t, cfg.rotator()));
        Self {
            state,
            cfg,
            transport,
            frame,
        }
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Runs to completion, cancellation or failure. `used` is cleared on
    /// every path.
    pub fn run(mut self) -> WorkerReport {
        let idx = self.state.index;
        let mut report = WorkerReport::default();
        let res = self.run_inner(&mut report);
        match res {
            Ok(()) => {
                self.state.completed.store(true, Ordering::Relaxed);
                debug!(worker = idx, packets = self.state.count(), "worker done");
            }
            Err(e) => {
                error!(worker = idx, "worker failed: {e}");
                report.toc = None;
            }
        }
        self.state.set_used(false);
        report
    }

    fn run_inner(&mut self, report: &mut WorkerReport) -> Result<()> {
        if let Some(core) = self.state.affinity {
            affinity::bind_current(core)?;
        }
        info!(
            worker = self.state.index,
            core = ?self.state.affinity,
            mode = ?self.cfg.mode,
            "worker started"
        );
        report.tic = Some(rate::now());
        match self.cfg.mode {
            Mode::Tx => self.send_loop(report)?,
            Mode::Rx => self.recv_loop()?,
        }
        report.toc = Some(rate::now());
        Ok(())
    }

    fn send_loop(&mut self, report: &mut WorkerReport) -> Result<()> {
        let Some(mut frame) = self.frame.take() else {
            return Ok(());
        };
        let cfg = &*self.cfg;
        let target = cfg.per_worker_target();
        let state = self.state.clone();
        let stop = || state.cancelled();
        let mut limiter = RateLimiter::new(cfg.tx_rate, cfg.burst);
        if let Some(l) = limiter.as_mut() {
            report.tic = Some(l.start(stop).unwrap_or_else(rate::now));
        }

        let mut opts = cfg.options;
        opts.copy = true;
        let keep_copy = cfg.options.copy || !frame.rotator().is_static();

        let ring = self.transport.kind() == TransportKind::Ring;
        let mut sent = 0u64;
        let mut iter = 0u32;
        while !self.state.cancelled() && (target == 0 || sent < target) {
            let tokens = match limiter.as_mut() {
                Some(l) => match l.acquire(cfg.frags, stop) {
                    Some(t) => Some(t),
                    None => break,
                },
                None => None,
            };

            if ring {
                if self.transport.poll_ready(Direction::Tx, cfg.poll_timeout)? == Readiness::Timeout {
                    if self.state.cancelled() {
                        break;
                    }
                    warn!(worker = self.state.index, "poll timeout on queue {}", self.state.index);
                    continue;
                }
            }

            let mut budget = Budget::new(cfg.burst, cfg.frags, opts);
            if let Some(t) = tokens {
                budget = budget.with_tokens(t);
            }
            if target > 0 {
                budget = budget.with_remaining(target - sent);
            }
            let m = self.transport.send_batch(&mut frame, &mut budget)?;
            if let Some(l) = limiter.as_mut() {
                l.consume(m);
            }
            sent += m as u64;

            if ring {
                self.state.publish(sent);
            } else {
                iter += 1;
                if iter > PUBLISH_EVERY {
                    self.state.publish(sent);
                    iter = 0;
                }
            }
            if unlikely(opts.copy && !keep_copy && sent > COPY_WARMUP_PACKETS) {
                debug!(worker = self.state.index, "ring buffers warm, copy off");
                opts.copy = false;
            }
        }
        self.state.publish(sent);
        self.frame = Some(frame);

        self.transport.flush()
    }

    fn recv_loop(&mut self) -> Result<()> {
        let cfg = &*self.cfg;
        let target = cfg.per_worker_target();
        let mut received = 0u64;
        while !self.state.cancelled() && (target == 0 || received < target) {
            if self.transport.poll_ready(Direction::Rx, cfg.poll_timeout)? == Readiness::Timeout {
                debug!(worker = self.state.index, "rx poll timeout");
                continue;
            }
            let limit = if target == 0 {
                usize::MAX
            } else {
                usize::try_from(target - received).unwrap_or(usize::MAX)
            };
            let n = self.transport.recv_batch(limit, cfg.options.dump)?;
            received += n as u64;
            self.state.publish(received);
        }
        self.state.publish(received);
        Ok(())
    }
}
