//! Branch hints for the per-slot loops.

#[inline]
#[cold]
fn cold() {}

/// The condition is expected to hold on the fast path.
#[inline(always)]
pub fn likely(b: bool) -> bool {
    if !b {
        cold()
    }
    b
}

/// The condition is expected to fail on the fast path.
#[inline(always)]
pub fn unlikely(b: bool) -> bool {
    if b {
        cold()
    }
    b
}
