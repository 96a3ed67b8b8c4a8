//! Queueing-discipline framework.
//!
//! A discipline is attached to every queue-owning device and decides the
//! order (and fate) of outgoing packets. The contract is
//! `{enqueue, dequeue, requeue, drop_one, reset}` plus hooks for the timer
//! wheel and classful control. Two stock disciplines ship here: `noop`
//! (drops everything; the safe placeholder during teardown) and `pfifo`
//! (single FIFO bounded by the device's txqueuelen).
//!
//! The pump: `qdisc_run` pulls packets from the discipline and feeds the
//! driver until it reports busy, the discipline throttles, or the queue
//! drains. Devices that could not be drained are parked on a run list that
//! the softirq flushes via `qdisc_run_queues`.
//!
//! # Locking
//!
//! The device queue lock guards the discipline. It is strictly inner to
//! nothing and outer to nothing here: the pump *releases* it before taking
//! the transmit lock, re-acquiring it only to requeue a refused packet.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use rill_abi::{FOpt, LssOpt, NetError, OvlOpt, PoliceAction, RateSpec, WrrOpt};
use rill_lib::{klog_debug, task};
use spin::Mutex;

use crate::cls::Classifier;
use crate::dev::{DeviceRef, XMIT_OWNER_NONE};
use crate::pkt::Pkt;
use crate::ptype;
use crate::timer::{FiredTimer, TimerKind};
use crate::types::Ifindex;

/// What became of an enqueued packet.
pub enum EnqueueOutcome {
    /// Accepted; it will come back out of `dequeue`.
    Queued,
    /// Refused and handed back; the caller owns (and usually frees) it.
    Dropped(Pkt),
    /// Refused under congestion: the discipline shed load (possibly this
    /// packet, possibly another).
    Congested(Pkt),
}

/// Basic per-discipline statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcStats {
    pub packets: u64,
    pub bytes: u64,
    pub drops: u64,
    pub overlimits: u64,
}

/// Extended per-class statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClassXstats {
    pub borrows: u64,
    pub overactions: u64,
    pub avgidle: i64,
    pub undertime: i64,
}

/// A queueing discipline.
pub trait Qdisc: Send {
    fn enqueue(&mut self, pkt: Pkt) -> EnqueueOutcome;
    fn dequeue(&mut self) -> Option<Pkt>;
    /// Return a dequeued packet to the head after the driver refused it.
    fn requeue(&mut self, pkt: Pkt);
    /// Drop one queued packet under memory pressure; `true` if one went.
    fn drop_one(&mut self) -> bool;
    /// Free everything queued and return to the initial state.
    fn reset(&mut self);
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the discipline is waiting on its watchdog; the pump skips
    /// throttled disciplines.
    fn throttled(&self) -> bool {
        false
    }

    /// Bind to the device the discipline now serves.
    fn attach(&mut self, _dev: &DeviceRef) {}

    /// A wheel entry targeting this discipline fired.
    fn timer_fire(&mut self, _kind: TimerKind) {}

    /// Classful control surface, for disciplines that have one.
    fn class_ops(&mut self) -> Option<&mut dyn ClassfulQdisc> {
        None
    }

    /// Whether this is the teardown placeholder. Activation replaces a
    /// placeholder with the default FIFO.
    fn is_noop(&self) -> bool {
        false
    }

    /// Read-only statistics.
    fn stats(&self) -> TcStats {
        TcStats::default()
    }
}

/// Class parameter bundle carried by the control plane.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClassConfig {
    pub rate: Option<RateSpec>,
    pub lss: Option<LssOpt>,
    pub wrr: Option<WrrOpt>,
    pub ovl: Option<OvlOpt>,
    pub fopt: Option<FOpt>,
    pub police: Option<PoliceAction>,
}

/// Snapshot of one class for the control plane.
#[derive(Clone, Copy, Debug)]
pub struct ClassInfo {
    pub classid: u32,
    pub parent: Option<u32>,
    pub level: u8,
    pub priority: u8,
    pub weight: u32,
    pub allot: i64,
    pub quantum: i64,
    pub avpkt: u32,
    pub qlen: usize,
    pub stats: TcStats,
    pub xstats: ClassXstats,
}

/// Control surface of a classful discipline.
pub trait ClassfulQdisc {
    /// Create a class. A zero `classid` asks for an auto-generated one;
    /// the chosen id is returned.
    fn class_create(&mut self, classid: u32, parentid: u32, cfg: &ClassConfig)
    -> Result<u32, NetError>;
    fn class_modify(&mut self, classid: u32, cfg: &ClassConfig) -> Result<(), NetError>;
    fn class_delete(&mut self, classid: u32) -> Result<(), NetError>;
    fn class_list(&self) -> Vec<ClassInfo>;
    fn class_stats(&self, classid: u32) -> Option<ClassInfo>;
    /// Swap a class's inner discipline, returning the old one (already
    /// reset).
    fn class_graft(&mut self, classid: u32, new: Box<dyn Qdisc>)
    -> Result<Box<dyn Qdisc>, NetError>;
    /// Append a filter to a class's chain; returns a handle for detach.
    fn class_attach_filter(
        &mut self,
        classid: u32,
        filter: Box<dyn Classifier>,
    ) -> Result<u64, NetError>;
    fn class_detach_filter(&mut self, classid: u32, filter_id: u64) -> Result<(), NetError>;
}

// =============================================================================
// noop
// =============================================================================

/// The placeholder discipline: accepts nothing, holds nothing.
#[derive(Default)]
pub struct NoopQdisc;

impl Qdisc for NoopQdisc {
    fn enqueue(&mut self, pkt: Pkt) -> EnqueueOutcome {
        EnqueueOutcome::Dropped(pkt)
    }

    fn dequeue(&mut self) -> Option<Pkt> {
        None
    }

    fn requeue(&mut self, _pkt: Pkt) {}

    fn drop_one(&mut self) -> bool {
        false
    }

    fn reset(&mut self) {}

    fn len(&self) -> usize {
        0
    }

    fn is_noop(&self) -> bool {
        true
    }
}

// =============================================================================
// pfifo
// =============================================================================

/// Single bounded FIFO.
pub struct PfifoQdisc {
    queue: VecDeque<Pkt>,
    limit: usize,
    stats: TcStats,
}

impl PfifoQdisc {
    pub fn new(limit: usize) -> Self {
        Self { queue: VecDeque::new(), limit: limit.max(1), stats: TcStats::default() }
    }
}

impl Qdisc for PfifoQdisc {
    fn enqueue(&mut self, pkt: Pkt) -> EnqueueOutcome {
        if self.queue.len() >= self.limit {
            self.stats.drops += 1;
            return EnqueueOutcome::Dropped(pkt);
        }
        self.stats.packets += 1;
        self.stats.bytes += pkt.len() as u64;
        self.queue.push_back(pkt);
        EnqueueOutcome::Queued
    }

    fn dequeue(&mut self) -> Option<Pkt> {
        self.queue.pop_front()
    }

    fn requeue(&mut self, pkt: Pkt) {
        self.queue.push_front(pkt);
    }

    fn drop_one(&mut self) -> bool {
        if self.queue.pop_back().is_some() {
            self.stats.drops += 1;
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.queue.clear();
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn stats(&self) -> TcStats {
        self.stats
    }
}

// =============================================================================
// Attachment and the transmit pump
// =============================================================================

/// Devices with pending output, flushed by `qdisc_run_queues`.
static RUN_LIST: Mutex<Vec<DeviceRef>> = Mutex::new(Vec::new());

/// Swap a device's discipline under the queue lock. The old discipline is
/// reset (freeing its backlog) and returned.
pub fn qdisc_graft(dev: &DeviceRef, mut new: Box<dyn Qdisc>) -> Box<dyn Qdisc> {
    new.attach(dev);
    let mut slot = dev.queue.lock();
    core::mem::swap(&mut *slot, &mut new);
    new.reset();
    new
}

/// Park `dev` on the run list and raise the net softirq.
pub fn netif_schedule(dev: &DeviceRef) {
    if !dev.sched_mark() {
        RUN_LIST.lock().push(dev.clone());
        crate::softnet::mark_net_bh();
    }
}

/// Driver notification: transmit resources are available again.
pub fn netif_wake_queue(dev: &DeviceRef) {
    dev.set_tbusy(false);
    netif_schedule(dev);
}

/// Driver notification: stop feeding the driver.
pub fn netif_stop_queue(dev: &DeviceRef) {
    dev.set_tbusy(true);
}

/// Whether any device is parked waiting for output service.
pub fn qdisc_pending() -> bool {
    !RUN_LIST.lock().is_empty()
}

/// Flush the run list. Called from the softirq before and after input
/// processing to keep transmit latency low.
pub fn qdisc_run_queues() {
    loop {
        let Some(dev) = RUN_LIST.lock().pop() else { break };
        dev.sched_clear();
        qdisc_run(&dev);
    }
}

/// Pull one packet out of the discipline and into the driver.
///
/// Returns `true` if a packet moved. Called with no locks held; takes the
/// queue lock for the dequeue, drops it, then takes the transmit lock for
/// the driver call (the order §5 requires).
fn qdisc_restart(dev: &DeviceRef) -> bool {
    let pkt = {
        let mut q = dev.queue.lock();
        match q.dequeue() {
            Some(pkt) => pkt,
            None => return false,
        }
    };

    let me = task::current_task_id();
    if dev.xmit_owner() == me {
        // Recursive transmit through the queued path; dropping is the only
        // safe move.
        klog_debug!("qdisc: dead loop on {}, packet dropped", dev.name());
        return true;
    }

    let _xmit = dev.xmit_lock.lock();
    dev.set_xmit_owner(me);

    let mut pkt = pkt;
    if ptype::ntaps() > 0 {
        ptype::send_to_taps(&mut pkt, dev);
    }

    let sent = match dev.driver().hard_start_xmit(pkt, dev) {
        Ok(()) => true,
        Err(refused) => {
            dev.set_tbusy(true);
            dev.queue.lock().requeue(refused);
            netif_schedule(dev);
            false
        }
    };
    dev.set_xmit_owner(XMIT_OWNER_NONE);
    sent
}

/// Drain the device's discipline until the driver is busy, the discipline
/// throttles, or the queue empties.
pub fn qdisc_run(dev: &DeviceRef) {
    if !dev.is_up() {
        return;
    }
    loop {
        if dev.tbusy() {
            if dev.queue.lock().len() > 0 {
                netif_schedule(dev);
            }
            return;
        }
        if dev.queue.lock().throttled() {
            return;
        }
        if !qdisc_restart(dev) {
            return;
        }
    }
}

/// Wheel dispatch: route a fired entry to its device's discipline, then
/// pump the device.
pub(crate) fn timer_dispatch(timer: &FiredTimer) {
    let Some(dev) = crate::dev::dev_get_by_index(Ifindex(timer.key)) else {
        return;
    };
    dev.queue.lock().timer_fire(timer.kind);
    qdisc_run(&dev);
}

/// Drop `count` packets from a device's discipline under memory pressure.
/// Returns how many were actually released.
pub fn qdisc_reclaim(dev: &DeviceRef, count: usize) -> usize {
    let mut q = dev.queue.lock();
    let mut freed = 0;
    while freed < count && q.drop_one() {
        freed += 1;
    }
    freed
}
