//! Burst rate limiting on the realtime clock.
//!
//! Deadlines are absolute `CLOCK_REALTIME` instants so that every worker
//! started with the same configuration releases its first burst at the same
//! wall-clock second.

use std::hint;
use std::thread;
use std::time::Duration;

use nix::sys::time::{TimeSpec, TimeValLike};
use nix::time::{ClockId, clock_gettime};

/// Rate-limited workers start on the first whole second at least this far
/// in the future.
pub const START_DELAY_SECS: i64 = 2;

/// Waits longer than this sleep instead of spinning.
const SPIN_THRESHOLD_NS: i64 = 1_000_000;
const SLEEP_STEP: Duration = Duration::from_millis(1);

#[inline]
pub fn now() -> TimeSpec {
    clock_gettime(ClockId::CLOCK_REALTIME).unwrap_or(TimeSpec::new(0, 0))
}

/// Blocks until `deadline` and returns the wake-up time.
///
/// While more than a millisecond remains the thread sleeps in 1 ms steps;
/// the last millisecond is spent spinning on the clock. Wake-up lands within
/// a few microseconds of the deadline on an idle core, and at worst one
/// scheduler quantum late when the core is contended.
pub fn wait_until(deadline: TimeSpec) -> TimeSpec {
    match wait_until_or(deadline, || false) {
        Some(woke) => woke,
        None => now(),
    }
}

/// Like [`wait_until`], but gives up and returns `None` as soon as `stop`
/// returns true. `stop` is checked at least once per sleep step.
pub fn wait_until_or(deadline: TimeSpec, stop: impl Fn() -> bool) -> Option<TimeSpec> {
    loop {
        let cur = now();
        if cur >= deadline {
            return Some(cur);
        }
        if stop() {
            return None;
        }
        if (deadline - cur).num_nanoseconds() > SPIN_THRESHOLD_NS {
            thread::sleep(SLEEP_STEP);
        } else {
            hint::spin_loop();
        }
    }
}

/// First whole second at least [`START_DELAY_SECS`] after `now`.
pub fn aligned_start(now: TimeSpec) -> TimeSpec {
    TimeSpec::new(now.tv_sec() + START_DELAY_SECS, 0)
}

/// Per-worker burst limiter.
///
/// Every `period = burst / rate` the worker may release `burst` packets. The
/// next deadline is always the previous one plus `period`, so late wake-ups
/// do not accumulate into drift.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    period: TimeSpec,
    period_ns: u64,
    burst: usize,
    next: TimeSpec,
    tokens: usize,
}

impl RateLimiter {
    /// `None` when `rate` is zero (unlimited).
    pub fn new(rate: u64, burst: usize) -> Option<Self> {
        if rate == 0 || burst == 0 {
            return None;
        }
        let period_ns = (burst as u128 * 1_000_000_000 / rate as u128).clamp(1, i64::MAX as u128) as u64;
        Some(Self {
            period: TimeSpec::nanoseconds(period_ns as i64),
            period_ns,
            burst,
            next: TimeSpec::new(0, 0),
            tokens: 0,
        })
    }

    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.period_ns)
    }

    pub fn burst(&self) -> usize {
        self.burst
    }

    /// Packets still allowed before the next deadline.
    pub fn tokens(&self) -> usize {
        self.tokens
    }

    pub fn deadline(&self) -> TimeSpec {
        self.next
    }

    /// Sets the reference instant without waiting. The first burst is
    /// released one period after `start`.
    pub fn start_at(&mut self, start: TimeSpec) {
        self.next = start;
        self.tokens = 0;
    }

    /// Waits for the aligned start instant and returns it, or `None` if
    /// `stop` fired first.
    pub fn start(&mut self, stop: impl Fn() -> bool) -> Option<TimeSpec> {
        let start = aligned_start(now());
        self.start_at(start);
        wait_until_or(start, stop)?;
        Some(start)
    }

    /// Moves the deadline forward by one period and refills the burst.
    pub fn advance(&mut self) -> TimeSpec {
        self.next = self.next + self.period;
        self.tokens = self.burst;
        self.next
    }

    /// Returns the available tokens, first waiting for the next deadline
    /// when fewer than `min` are left. The leftover tokens of the old burst
    /// are dropped. `None` if `stop` fired during the wait.
    pub fn acquire(&mut self, min: usize, stop: impl Fn() -> bool) -> Option<usize> {
        if self.tokens < min.max(1) {
            let deadline = self.advance();
            wait_until_or(deadline, stop)?;
        }
        Some(self.tokens)
    }

    #[inline]
    pub fn consume(&mut self, n: usize) {
        self.tokens = self.tokens.saturating_sub(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_from_rate_and_burst() {
        let rl = RateLimiter::new(1000, 10).unwrap();
        assert_eq!(rl.period(), Duration::from_millis(10));
        let rl = RateLimiter::new(3, 1).unwrap();
        assert_eq!(rl.period(), Duration::from_nanos(333_333_333));
        let rl = RateLimiter::new(u64::MAX, 1).unwrap();
        assert_eq!(rl.period(), Duration::from_nanos(1));
    }

    #[test]
    fn test_unlimited_has_no_limiter() {
        assert!(RateLimiter::new(0, 10).is_none());
    }

    #[test]
    fn test_aligned_start_clears_subsecond() {
        let t = aligned_start(TimeSpec::new(100, 700_000_000));
        assert_eq!(t.tv_sec(), 102);
        assert_eq!(t.tv_nsec(), 0);
    }

    #[test]
    fn test_bursts_per_interval() {
        // 1000 pps in bursts of 10 over 1 s => 100 bursts
        let mut rl = RateLimiter::new(1000, 10).unwrap();
        let t0 = TimeSpec::new(50, 0);
        let end = t0 + TimeSpec::seconds(1);
        rl.start_at(t0);
        let mut prev = rl.deadline();
        let mut bursts = 0u64;
        loop {
            let d = rl.advance();
            assert!(d > prev);
            prev = d;
            if d > end {
                break;
            }
            bursts += 1;
        }
        assert!(bursts.abs_diff(100) <= 1, "bursts = {bursts}");
    }

    #[test]
    fn test_deadlines_do_not_drift() {
        let mut rl = RateLimiter::new(7, 3).unwrap();
        let t0 = TimeSpec::new(10, 0);
        rl.start_at(t0);
        for _ in 0..7000 {
            rl.advance();
        }
        // 7000 periods of 3/7 s = 3000 s, minus sub-ns truncation per period
        let elapsed = rl.deadline() - t0;
        assert!((elapsed.num_milliseconds() - 3_000_000).abs() <= 1);
    }

    #[test]
    fn test_tokens_are_consumed_and_refilled() {
        let mut rl = RateLimiter::new(1_000_000, 8).unwrap();
        rl.start_at(now());
        assert_eq!(rl.acquire(1, || false), Some(8));
        rl.consume(5);
        assert_eq!(rl.acquire(1, || false), Some(3));
        rl.consume(10);
        assert_eq!(rl.tokens(), 0);
        assert_eq!(rl.acquire(1, || false), Some(8));
    }

    #[test]
    fn test_partial_group_starts_next_burst() {
        // bursts of 10 in groups of 3 leave one token behind
        let mut rl = RateLimiter::new(1_000_000, 10).unwrap();
        rl.start_at(now());
        assert_eq!(rl.acquire(3, || false), Some(10));
        let first = rl.deadline();
        rl.consume(9);
        assert_eq!(rl.acquire(3, || false), Some(10));
        assert!(rl.deadline() > first);
    }

    #[test]
    fn test_stop_interrupts_waits() {
        let far = now() + TimeSpec::seconds(30);
        let t0 = std::time::Instant::now();
        assert_eq!(wait_until_or(far, || true), None);

        let mut rl = RateLimiter::new(1, 512).unwrap();
        rl.start_at(now());
        assert_eq!(rl.acquire(1, || true), None);
        assert_eq!(rl.start(|| true), None);
        assert!(t0.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_until_reaches_deadline() {
        let deadline = now() + TimeSpec::milliseconds(3);
        let woke = wait_until(deadline);
        assert!(woke >= deadline);
        assert!((woke - deadline).num_milliseconds() < 50);
    }

    #[test]
    fn test_wait_until_past_deadline_returns_immediately() {
        let past = now() - TimeSpec::seconds(1);
        assert!(wait_until(past) > past);
    }
}
