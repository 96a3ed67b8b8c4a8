//! The receive backlog and the net softirq.
//!
//! Drivers hand received packets to [`netif_rx`], which never fails the
//! caller: the packet is either queued on the global backlog or counted as
//! dropped. [`net_bh`] is the single-threaded cooperative drainer — it
//! flushes pending output first, then demultiplexes the backlog into the
//! packet-type registry within a bounded budget, re-arming itself if work
//! remains.
//!
//! Admission is governed by a soft cap and a congestion flag: an empty
//! queue always admits (and clears congestion), a non-empty queue admits
//! while under the cap and uncongested, everything else drops and latches
//! the flag. Subsystems may register flow-control slots whose callbacks
//! fire when congestion clears.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use rill_lib::{clock, klog_error};
use spin::Mutex;

use crate::dev::{DeviceRef, dev_queue_xmit};
use crate::pkt::Pkt;
use crate::ptype;
use crate::qdisc::{qdisc_pending, qdisc_run_queues};
use crate::types::PktType;

/// Soft cap on queued-but-unprocessed received packets.
pub const DEFAULT_MAX_BACKLOG: usize = 300;

/// Budget for one `net_bh` pass, in clock ticks (one scheduler tick).
const NET_BH_BUDGET: u64 = 1_000;

static BACKLOG: Mutex<VecDeque<Pkt>> = Mutex::new(VecDeque::new());
static MAX_BACKLOG: AtomicUsize = AtomicUsize::new(DEFAULT_MAX_BACKLOG);
static DROPPING: AtomicBool = AtomicBool::new(false);
static RX_DROPPED: AtomicU64 = AtomicU64::new(0);
static NET_BH_PENDING: AtomicBool = AtomicBool::new(false);
static NET_BH_RUNNING: AtomicBool = AtomicBool::new(false);

/// Change the backlog admission cap.
pub fn set_max_backlog(cap: usize) {
    MAX_BACKLOG.store(cap.max(1), Ordering::Release);
}

pub fn max_backlog() -> usize {
    MAX_BACKLOG.load(Ordering::Acquire)
}

/// Packets refused at admission since start.
pub fn rx_dropped() -> u64 {
    RX_DROPPED.load(Ordering::Acquire)
}

/// Whether the admission path is currently congested.
pub fn is_dropping() -> bool {
    DROPPING.load(Ordering::Acquire)
}

/// Queued backlog length; diagnostic.
pub fn backlog_len() -> usize {
    BACKLOG.lock().len()
}

/// Raise the net softirq: `net_bh` has work.
#[inline]
pub fn mark_net_bh() {
    NET_BH_PENDING.store(true, Ordering::Release);
}

/// Whether the net softirq has been raised and not yet serviced.
#[inline]
pub fn net_bh_pending() -> bool {
    NET_BH_PENDING.load(Ordering::Acquire)
}

// =============================================================================
// Flow-control slots
// =============================================================================

/// Callback invoked when receive congestion clears.
pub type FcStimul = fn(&DeviceRef);

const FC_SLOTS: usize = 32;

struct FcState {
    slots: [Option<(DeviceRef, FcStimul)>; FC_SLOTS],
}

static FC: Mutex<FcState> = Mutex::new(FcState { slots: [const { None }; FC_SLOTS] });
static FC_XOFF: AtomicU32 = AtomicU32::new(0);

/// Claim a flow-control slot. Returns its bit, or `None` if all 32 slots
/// are taken.
pub fn register_fc(dev: &DeviceRef, stimul: FcStimul) -> Option<usize> {
    let mut fc = FC.lock();
    for (bit, slot) in fc.slots.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some((dev.clone(), stimul));
            FC_XOFF.fetch_and(!(1 << bit), Ordering::AcqRel);
            return Some(bit);
        }
    }
    None
}

/// Give a slot back.
pub fn unregister_fc(bit: usize) {
    if bit >= FC_SLOTS {
        return;
    }
    FC.lock().slots[bit] = None;
    FC_XOFF.fetch_and(!(1 << bit), Ordering::AcqRel);
}

/// Mark a slot flow-stopped; its callback fires at the next congestion
/// clearing.
pub fn fc_xoff(bit: usize) {
    if bit < FC_SLOTS {
        FC_XOFF.fetch_or(1 << bit, Ordering::AcqRel);
    }
}

/// Congestion cleared: reset the flag and stimulate every xoff'd slot.
fn netdev_wakeup() {
    DROPPING.store(false, Ordering::Release);
    let xoff = FC_XOFF.swap(0, Ordering::AcqRel);
    if xoff == 0 {
        return;
    }
    let stimulate: Vec<(DeviceRef, FcStimul)> = {
        let fc = FC.lock();
        (0..FC_SLOTS)
            .filter(|bit| xoff & (1 << bit) != 0)
            .filter_map(|bit| fc.slots[bit].clone())
            .collect()
    };
    for (dev, stimul) in stimulate {
        stimul(&dev);
    }
}

// =============================================================================
// netif_rx
// =============================================================================

/// Receive a packet from a driver. Never fails the caller; refused packets
/// are freed and counted.
///
/// The code is arranged so the path is shortest when the CPU is congested
/// but still operating.
pub fn netif_rx(mut pkt: Pkt) {
    if pkt.timestamp == 0 {
        pkt.timestamp = clock::ticks();
    }

    let mut q = BACKLOG.lock();
    if q.len() <= max_backlog() {
        if !q.is_empty() {
            if !DROPPING.load(Ordering::Acquire) {
                q.push_back(pkt);
                drop(q);
                mark_net_bh();
                return;
            }
            drop(q);
            RX_DROPPED.fetch_add(1, Ordering::Relaxed);
            return;
        }
        // Empty queue: always admit, and congestion is over.
        q.push_back(pkt);
        drop(q);
        netdev_wakeup();
        mark_net_bh();
        return;
    }
    drop(q);
    DROPPING.store(true, Ordering::Release);
    RX_DROPPED.fetch_add(1, Ordering::Relaxed);
}

/// Purge a closing device's packets from the backlog.
pub fn clear_backlog(dev: &DeviceRef) {
    let mut garbage: Vec<Pkt> = Vec::new();
    {
        let mut q = BACKLOG.lock();
        let mut keep: VecDeque<Pkt> = VecDeque::with_capacity(q.len());
        while let Some(pkt) = q.pop_front() {
            let doomed = pkt.dev().map(|d| d.ifindex() == dev.ifindex()).unwrap_or(false);
            if doomed {
                garbage.push(pkt);
            } else {
                keep.push_back(pkt);
            }
        }
        *q = keep;
    }
    if !garbage.is_empty() && DROPPING.load(Ordering::Acquire) {
        netdev_wakeup();
    }
    // Freed outside the queue lock.
    drop(garbage);
}

// =============================================================================
// net_bh
// =============================================================================

/// The net softirq body. Single-instance: a second caller while one runs
/// returns immediately (the running instance will observe the pending
/// mark). Cooperative: yields after [`NET_BH_BUDGET`] ticks and re-arms.
pub fn net_bh() {
    if NET_BH_RUNNING.swap(true, Ordering::AcqRel) {
        return;
    }
    NET_BH_PENDING.store(false, Ordering::Release);

    // Clear the decks for output first; this keeps transmit latency low
    // and makes room for replies generated below.
    if qdisc_pending() {
        qdisc_run_queues();
    }

    let start = clock::ticks();
    loop {
        if clock::ticks().wrapping_sub(start) > NET_BH_BUDGET {
            // Budget spent with work remaining: hand the CPU back and
            // re-arm.
            mark_net_bh();
            break;
        }

        let Some(mut pkt) = BACKLOG.lock().pop_front() else { break };

        // Forwarded frames skip protocol processing entirely.
        if pkt.pkt_type == PktType::Fastroute {
            let _ = dev_queue_xmit(pkt);
            continue;
        }

        let Some(dev) = pkt.dev().cloned() else {
            // A backlogged packet with no receiving device cannot be
            // demultiplexed.
            continue;
        };

        // On entry to the protocol layer the payload starts at the
        // encapsulated data; both upper markers point there.
        let data = pkt.data_offset();
        pkt.set_nh(data);
        pkt.set_th(data);

        if pkt.mac_offset() > data {
            klog_error!(
                "{}: wrong mac offset, proto={:04x}",
                dev.name(),
                pkt.protocol
            );
            continue;
        }

        // Taps first, then the hashed chain. Every handler but the last
        // gets a logical copy; the last takes the original.
        let handlers = ptype::matches_for(&pkt, &dev);
        if handlers.is_empty() {
            continue;
        }
        let last = handlers.len() - 1;
        for handler in handlers.iter().take(last) {
            handler.receive(pkt.clone_shared(), &dev);
        }
        handlers[last].receive(pkt, &dev);
    }

    // One last output flush.
    if qdisc_pending() {
        qdisc_run_queues();
    }

    if DROPPING.load(Ordering::Acquire) {
        netdev_wakeup();
    }
    NET_BH_RUNNING.store(false, Ordering::Release);
}

/// Test hygiene: drop everything queued and reset the congestion state.
pub fn drain_backlog() {
    BACKLOG.lock().clear();
    DROPPING.store(false, Ordering::Release);
    NET_BH_PENDING.store(false, Ordering::Release);
}
