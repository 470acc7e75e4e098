//! Ring trait and slot access.

use std::fmt;
use std::time::Duration;

use super::Result;
use super::transport::Readiness;

/// Per-slot flags. Bit values match netmap's `NS_*` so they can be written
/// straight into a mapped slot.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotFlags(u16);

impl SlotFlags {
    /// Ask the transport to signal once this slot has been consumed.
    pub const REPORT: SlotFlags = SlotFlags(0x0002);
    /// The slot buffer is the address stored in the slot pointer.
    pub const INDIRECT: SlotFlags = SlotFlags(0x0010);
    /// More fragments of the same packet follow in the next slot.
    pub const MOREFRAG: SlotFlags = SlotFlags(0x0020);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: SlotFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: SlotFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: SlotFlags) {
        self.0 &= !other.0;
    }
}

impl fmt::Debug for SlotFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Mutable view of one ring slot.
pub struct Slot<'a> {
    pub buf: &'a mut [u8],
    pub len: &'a mut u16,
    pub flags: &'a mut u16,
    pub ptr: &'a mut u64,
}

impl Slot<'_> {
    #[inline(always)]
    pub fn flags(&self) -> SlotFlags {
        SlotFlags::from_bits(*self.flags)
    }

    #[inline(always)]
    pub fn set_flags(&mut self, flags: SlotFlags) {
        *self.flags = flags.bits();
    }
}

/// Transfer direction of a ring or of a readiness wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

/// A circular buffer of packet slots shared with the underlying transport.
///
/// Slots between [`cursor`](Ring::cursor) and the transport-owned tail
/// belong to the caller: on a TX ring they are free to fill, on an RX ring
/// they hold received packets. Exactly one thread drives a given ring.
pub trait Ring: Send {
    /// Total number of slots in the ring.
    fn num_slots(&self) -> usize;

    /// Index of the first slot owned by the caller.
    fn cursor(&self) -> usize;

    /// Number of slots currently owned by the caller.
    fn space(&self) -> usize;

    /// Access the slot at `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx >= num_slots()`.
    fn slot_at(&mut self, idx: usize) -> Slot<'_>;

    /// Hand `n` slots starting at the cursor back to the transport.
    fn advance(&mut self, n: usize);

    /// Whether the transport still has work queued on this ring.
    fn pending(&self) -> bool;

    /// Slot index following `idx`.
    #[inline(always)]
    fn next(&self, idx: usize) -> usize {
        if idx + 1 == self.num_slots() { 0 } else { idx + 1 }
    }

    #[inline(always)]
    fn is_empty(&self) -> bool {
        self.space() == 0
    }
}

/// The rings a transport exposes to one worker, plus the operations that
/// act on all of them at once.
pub trait RingSet: Send {
    type Ring: Ring;

    fn rings(&mut self, dir: Direction) -> &mut [Self::Ring];

    /// Tells the transport about advanced cursors and picks up slots it has
    /// completed.
    fn sync(&mut self, dir: Direction) -> Result<()>;

    /// Bounded wait until some ring in `dir` has room or data.
    fn poll(&mut self, dir: Direction, timeout: Duration) -> Result<Readiness>;
}
