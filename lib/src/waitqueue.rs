//! Wait queue primitive for blocking and waking.
//!
//! A sequence counter provides lost-wakeup protection: a waiter snapshots
//! the counter *before* re-checking its condition, then sleeps only until
//! the counter moves past the snapshot. A wake between the check and the
//! sleep is therefore never missed. There is no scheduler here to park
//! tasks in, so "sleeping" spins through the registered relax hook; an
//! embedder with real threads installs a yielding hook.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::task;

/// Marker error: a signal interrupted the wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interrupted;

/// Why a wait ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The wake counter moved.
    Woken,
    /// A pending signal ended the wait first.
    Interrupted,
}

/// A wake-counter wait queue.
pub struct WaitQueue {
    seq: AtomicU64,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self { seq: AtomicU64::new(0) }
    }

    /// Snapshot the wake counter. Take this *before* checking the condition.
    #[inline]
    pub fn prepare(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Wake every current and in-flight waiter.
    #[inline]
    pub fn wake_all(&self) {
        self.seq.fetch_add(1, Ordering::AcqRel);
    }

    /// Wake waiters. With counter semantics a single wake is indistinguishable
    /// from a broadcast; kept separate so call sites document intent.
    #[inline]
    pub fn wake_one(&self) {
        self.wake_all();
    }

    /// Spin until the counter moves past `snapshot` or a signal arrives.
    pub fn wait(&self, snapshot: u64) -> WaitOutcome {
        loop {
            if self.seq.load(Ordering::Acquire) != snapshot {
                return WaitOutcome::Woken;
            }
            if task::signal_pending() {
                return WaitOutcome::Interrupted;
            }
            task::relax();
        }
    }

    /// Block until `cond` is true, ignoring signals.
    pub fn wait_event(&self, mut cond: impl FnMut() -> bool) {
        loop {
            let snap = self.prepare();
            if cond() {
                return;
            }
            while self.seq.load(Ordering::Acquire) == snap {
                task::relax();
            }
        }
    }

    /// Block until `cond` is true or a signal is pending.
    pub fn wait_event_interruptible(
        &self,
        mut cond: impl FnMut() -> bool,
    ) -> Result<(), Interrupted> {
        loop {
            let snap = self.prepare();
            if cond() {
                return Ok(());
            }
            if task::signal_pending() {
                return Err(Interrupted);
            }
            if self.wait(snap) == WaitOutcome::Interrupted {
                return Err(Interrupted);
            }
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
