//! Timer wheel for the scheduler's one-shot callbacks.
//!
//! The queueing disciplines need two kinds of deferred work: the watchdog
//! that unthrottles a discipline when the earliest `undertime` passes, and
//! the undelay scan that restores penalised classes. Both are typed entries
//! in one 256-slot wheel keyed by device index — no bare function-pointer
//! callbacks.
//!
//! The wheel runs at millisecond granularity over the microsecond tick
//! clock. On each wheel tick it drains the current slot's due entries;
//! cancelled entries are skipped. Delays longer than one rotation are
//! carried by the absolute deadline.
//!
//! # Concurrency
//!
//! Internal state sits behind a spin mutex. Expired entries are collected
//! under the lock and dispatched outside it, so handlers are free to
//! schedule or cancel timers without deadlocking.

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use rill_lib::clock;
use spin::Mutex;

/// Number of slots in the wheel.
const NUM_SLOTS: usize = 256;

/// Clock ticks per wheel tick (1 ms of the microsecond clock).
pub const WHEEL_TICK: u64 = 1_000;

/// Maximum entries fired per `tick()` call; the rest defer to the next tick.
pub const MAX_TIMERS_PER_TICK: usize = 32;

/// Which subsystem a timer belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    /// A discipline's watchdog deadline passed: unthrottle and kick the
    /// device.
    QdiscWatchdog,
    /// A discipline's penalty slots may have expired: run the undelay scan.
    QdiscDelay,
}

/// Opaque, never-reused cancellation handle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerToken(u64);

impl TimerToken {
    /// Sentinel that never matches a scheduled timer.
    pub const INVALID: Self = Self(0);
}

struct TimerEntry {
    deadline: u64,
    kind: TimerKind,
    /// Device index the entry targets.
    key: u32,
    token: TimerToken,
    cancelled: bool,
}

/// An expired entry handed to the dispatcher.
#[derive(Clone, Copy, Debug)]
pub struct FiredTimer {
    pub kind: TimerKind,
    /// Device index; the dispatcher must tolerate the device being gone.
    pub key: u32,
}

struct WheelInner {
    slots: [Vec<TimerEntry>; NUM_SLOTS],
    current_tick: u64,
}

/// The timer wheel.
pub struct TimerWheel {
    inner: Mutex<WheelInner>,
    next_token: AtomicU64,
}

impl TimerWheel {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(WheelInner {
                slots: [const { Vec::new() }; NUM_SLOTS],
                current_tick: 0,
            }),
            next_token: AtomicU64::new(1),
        }
    }

    /// Schedule an entry `delay_ticks` clock ticks from now, rounded up to
    /// wheel granularity with a minimum of one wheel tick.
    pub fn schedule(&self, delay_ticks: u64, kind: TimerKind, key: u32) -> TimerToken {
        let token = TimerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let wheel_delay = (delay_ticks.div_ceil(WHEEL_TICK)).max(1);
        let mut inner = self.inner.lock();
        let deadline = inner.current_tick.wrapping_add(wheel_delay);
        let slot = (deadline % NUM_SLOTS as u64) as usize;
        inner.slots[slot].push(TimerEntry { deadline, kind, key, token, cancelled: false });
        token
    }

    /// Cancel an entry; `true` if it had not fired yet.
    pub fn cancel(&self, token: TimerToken) -> bool {
        if token == TimerToken::INVALID {
            return false;
        }
        let mut inner = self.inner.lock();
        for slot in inner.slots.iter_mut() {
            for entry in slot.iter_mut() {
                if entry.token == token && !entry.cancelled {
                    entry.cancelled = true;
                    return true;
                }
            }
        }
        false
    }

    /// Advance one wheel tick, collecting due entries.
    pub fn tick(&self) -> Vec<FiredTimer> {
        let mut inner = self.inner.lock();
        inner.current_tick = inner.current_tick.wrapping_add(1);
        let current = inner.current_tick;
        let slot_idx = (current % NUM_SLOTS as u64) as usize;
        let slot = &mut inner.slots[slot_idx];

        let mut fired = Vec::new();
        let mut i = 0;
        while i < slot.len() {
            if fired.len() >= MAX_TIMERS_PER_TICK {
                break;
            }
            let entry = &slot[i];
            if entry.cancelled {
                slot.swap_remove(i);
                continue;
            }
            if entry.deadline <= current {
                let (kind, key) = (entry.kind, entry.key);
                slot.swap_remove(i);
                fired.push(FiredTimer { kind, key });
            } else {
                i += 1;
            }
        }
        fired
    }

    /// Catch up to `target_tick` (wheel ticks), bounded to one rotation per
    /// call to keep latecomers from stalling the caller.
    pub fn advance_to(&self, target_tick: u64) -> Vec<FiredTimer> {
        let current = self.inner.lock().current_tick;
        if target_tick <= current {
            return Vec::new();
        }
        let behind = target_tick - current;
        let steps = behind.min(NUM_SLOTS as u64);

        let mut all = Vec::new();
        for _ in 0..steps {
            all.append(&mut self.tick());
        }
        if behind > NUM_SLOTS as u64 {
            self.inner.lock().current_tick = target_tick;
        }
        all
    }

    /// Pending (non-cancelled) entry count; diagnostic.
    pub fn pending_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.iter().map(|s| s.iter().filter(|e| !e.cancelled).count()).sum()
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

/// The global wheel all disciplines schedule through.
pub static NET_TIMERS: TimerWheel = TimerWheel::new();

/// Advance the wheel to the clock's current position and dispatch whatever
/// expired. Call from the softirq pump and from idle loops.
pub fn net_timer_process() {
    let target = clock::ticks() / WHEEL_TICK;
    let fired = NET_TIMERS.advance_to(target);
    for timer in &fired {
        crate::qdisc::timer_dispatch(timer);
    }
}
