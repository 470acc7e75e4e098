//! Throughput arithmetic and the human-readable run summary.

use std::fmt;
use std::time::Duration;

use crate::config::Mode;

/// Frames shorter than this still occupy a minimum-size slot on the wire.
const MIN_WIRE_SIZE: usize = 60;
/// CRC plus preamble, start delimiter and inter-frame gap.
const WIRE_OVERHEAD: usize = 24;

/// `val` scaled by powers of 1000, e.g. `1.50 M`.
pub fn norm(mut val: f64) -> String {
    const UNITS: [&str; 5] = ["", "K", "M", "G", "T"];
    let mut i = 0;
    while val >= 1000.0 && i < UNITS.len() - 1 {
        val /= 1000.0;
        i += 1;
    }
    format!("{val:.2} {}", UNITS[i])
}

/// Rounded packets per second for `npkts` packets in `usec` microseconds.
pub fn live_pps(npkts: u64, usec: u64) -> u64 {
    if usec == 0 {
        return 0;
    }
    ((npkts as u128 * 1_000_000 + usec as u128 / 2) / usec as u128) as u64
}

/// Totals over every worker that ran to completion.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub mode: Mode,
    pub packets: u64,
    /// Frame size as configured, without virtual header.
    pub pkt_size: usize,
    pub elapsed: Duration,
    pub workers: usize,
    pub completed: usize,
}

impl RunSummary {
    fn seconds(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }

    /// The divisor for rates; an empty interval counts as one microsecond.
    fn rate_seconds(&self) -> f64 {
        let s = self.seconds();
        if s == 0.0 { 1e-6 } else { s }
    }

    pub fn pps(&self) -> f64 {
        self.packets as f64 / self.rate_seconds()
    }

    /// Payload bandwidth in bits per second.
    pub fn bandwidth(&self) -> f64 {
        let size = self.pkt_size.max(MIN_WIRE_SIZE) as f64;
        8.0 * size * self.packets as f64 / self.rate_seconds()
    }

    /// Bandwidth including per-frame wire overhead.
    pub fn raw_bandwidth(&self) -> f64 {
        let size = (self.pkt_size.max(MIN_WIRE_SIZE) + WIRE_OVERHEAD) as f64;
        8.0 * size * self.packets as f64 / self.rate_seconds()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            Mode::Tx => {
                writeln!(
                    f,
                    "Sent {} packets, {} bytes each, in {:.2} seconds.",
                    self.packets,
                    self.pkt_size,
                    self.seconds()
                )?;
                write!(
                    f,
                    "Speed: {}pps Bandwidth: {}bps (raw {}bps)",
                    norm(self.pps()),
                    norm(self.bandwidth()),
                    norm(self.raw_bandwidth())
                )
            }
            Mode::Rx => {
                writeln!(
                    f,
                    "Received {} packets, in {:.2} seconds.",
                    self.packets,
                    self.seconds()
                )?;
                write!(f, "Speed: {}pps", norm(self.pps()))
            }
        }
    }
}
