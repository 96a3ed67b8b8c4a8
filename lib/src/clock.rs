//! Monotonic tick clock.
//!
//! One counter is the time base for everything: packet timestamps, CBQ
//! virtual time, watchdog deadlines, and the timer wheel. The embedder (or
//! a test harness) advances it; the core only reads it. A tick is one
//! microsecond by convention, so a rate table for R bytes/sec charges
//! `TICKS_PER_SEC / R` ticks per byte.

use core::sync::atomic::{AtomicU64, Ordering};

/// Ticks per second; fixes the microsecond convention.
pub const TICKS_PER_SEC: u64 = 1_000_000;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Current monotonic tick count.
#[inline]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

/// Advance the clock by `n` ticks. Called from the embedder's tick source.
#[inline]
pub fn advance(n: u64) -> u64 {
    TICKS.fetch_add(n, Ordering::AcqRel) + n
}

/// Rewind to zero. Test harness use only; running schedulers tolerate a
/// rewind as a burst of zero elapsed time.
pub fn reset() {
    TICKS.store(0, Ordering::Release);
}
