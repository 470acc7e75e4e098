//! Transport capability and backend factory.

use std::fmt::Debug;
use std::time::Duration;

use super::Result;
use super::ring::Direction;
use crate::batch::Budget;
use crate::config::{GlobalConfig, TransportKind};
use crate::packet::Frame;

/// Outcome of a bounded readiness wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Timeout,
}

/// What a worker can do with its packet path.
///
/// Ring transports implement [`send_batch`](Transport::send_batch) over their
/// rings; single-packet transports (raw fd, capture injection) implement
/// [`send_one`](Transport::send_one) and inherit the one-packet batch.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Waits up to `timeout` for room (TX) or data (RX).
    ///
    /// A hardware-reported error on the waited descriptor is returned as
    /// `Err` and is fatal to the calling worker.
    fn poll_ready(&mut self, dir: Direction, timeout: Duration) -> Result<Readiness>;

    /// Sends a single frame. `Ok(false)` means the transport was busy and the
    /// caller should retry.
    fn send_one(&mut self, frame: &[u8]) -> Result<bool>;

    /// Enqueues as many packets as `budget` allows, rotating `frame` between
    /// logical packets. Returns the number of slots handed to the transport.
    fn send_batch(&mut self, frame: &mut Frame, budget: &mut Budget) -> Result<usize> {
        if budget.limit() == 0 {
            return Ok(0);
        }
        let sent = usize::from(self.send_one(frame.bytes())?);
        frame.rotate();
        budget.consume(sent);
        Ok(sent)
    }

    /// Consumes up to `limit` received packets and returns how many were read.
    fn recv_batch(&mut self, limit: usize, dump: bool) -> Result<usize>;

    /// Pushes out everything queued and waits for the transport to drain it.
    fn flush(&mut self) -> Result<()>;
}

/// Per-worker transport initializer.
pub trait Backend: Send + Sync + Debug {
    fn kind(&self) -> TransportKind;

    /// Opens the transport for worker `worker`. Failure keeps that worker
    /// from ever running.
    fn open(&self, cfg: &GlobalConfig, worker: usize) -> Result<Box<dyn Transport>>;
}
