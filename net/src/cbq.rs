//! Class-Based Queueing.
//!
//! The discipline maintains a class tree with two parallel link structures:
//! the *tree* links (parent/children) that define levels, and the
//! *link-sharing* links (`share` for idle accounting, `borrow` for
//! bandwidth borrowing). Scheduling is weighted round-robin inside
//! priority bands; rate enforcement estimates each class's idle time with
//! an EWMA and suspends classes whose average goes negative.
//!
//! There is no end-of-transmission event available, so the next dequeue is
//! taken as the sign that the previous packet finished. Combined with the
//! clock integrator (virtual time advances by at least real time, and by
//! the known work when there is one) this tracks a loaded link closely.
//!
//! Classes are kept in a slot arena: tree, sharing and active-ring links
//! are slot indices, and a classid map resolves control-plane handles.
//! Slot 0 is always the root link class and lives exactly as long as the
//! discipline.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;

use hashbrown::HashMap;
use rill_abi::{
    CBQ_DEF_EWMA, CBQ_MAXLEVEL, CBQ_MAXPRIO, LssChange, LssFlags, NetError, OvlStrategy,
    PoliceAction, RateSpec, TC_PRIO_BESTEFFORT, TC_PRIO_MAX,
};
use rill_lib::{clock, klog_warn};

use crate::cls::{ClsVerdict, Classifier};
use crate::dev::DeviceRef;
use crate::pkt::Pkt;
use crate::qdisc::{
    ClassConfig, ClassInfo, ClassXstats, ClassfulQdisc, EnqueueOutcome, PfifoQdisc, Qdisc,
    TcStats,
};
use crate::ratetab::RateTable;
use crate::timer::{NET_TIMERS, TimerKind, TimerToken};
use crate::types::{th_major, th_make};

/// `undertime` sentinel: the class has never been over limit.
const PAST_PERFECT: i64 = 0;

#[inline]
fn is_past_perfect(t: i64) -> bool {
    t == PAST_PERFECT
}

/// Idle gaps above this are stale state, not credit.
const STALE_IDLE: i64 = 128 * 1024 * 1024;

const ROOT: usize = 0;

struct CbqClass {
    classid: u32,

    // Parameters
    priority: usize,
    priority2: usize,
    ewma_log: u8,
    ovl_strategy: OvlStrategy,
    police: PoliceAction,
    defmap: u32,

    maxidle: i64,
    offtime: i64,
    minidle: i64,
    avpkt: u32,
    rtab: RateTable,
    penalty: u64,

    allot: i64,
    quantum: i64,
    weight: i64,

    split: Option<usize>,
    share: Option<usize>,
    tparent: Option<usize>,
    borrow: Option<usize>,
    children: Vec<usize>,

    q: Box<dyn Qdisc>,

    // Variables
    cpriority: usize,
    delayed: bool,
    level: u8,

    last: i64,
    undertime: i64,
    avgidle: i64,
    deficit: i64,
    penalized: u64,
    stats: TcStats,
    xstats: ClassXstats,

    filters: Vec<(u64, Box<dyn Classifier>)>,
    /// References to this class held by filters elsewhere in the tree.
    filter_refs: u32,

    defaults: [Option<usize>; TC_PRIO_MAX + 1],
    next_alive: Option<usize>,
}

impl CbqClass {
    fn info(&self, parent: Option<u32>) -> ClassInfo {
        ClassInfo {
            classid: self.classid,
            parent,
            level: self.level,
            priority: self.priority as u8,
            weight: self.weight as u32,
            allot: self.allot,
            quantum: self.quantum,
            avpkt: self.avpkt,
            qlen: self.q.len(),
            stats: self.stats,
            xstats: ClassXstats {
                avgidle: self.avgidle,
                undertime: self.undertime,
                ..self.xstats
            },
        }
    }
}

/// The CBQ scheduler state.
pub struct CbqSched {
    handle: u32,
    ifindex: u32,
    dev: Option<alloc::sync::Weak<crate::dev::Device>>,
    mtu: u32,
    txq: usize,

    classes: Vec<Option<CbqClass>>,
    free_slots: Vec<usize>,
    index: HashMap<u32, usize>,

    nclasses: [i64; CBQ_MAXPRIO + 1],
    quanta: [i64; CBQ_MAXPRIO + 1],

    activemask: u16,
    active: [Option<usize>; CBQ_MAXPRIO + 1],

    tx_class: Option<usize>,
    tx_borrowed: Option<usize>,
    tx_len: u32,
    now: i64,
    now_rt: i64,
    pmask: u16,

    wd_expires: i64,
    wd_token: TimerToken,
    delay_token: TimerToken,
    delay_expires: u64,
    throttle: bool,

    toplevel: u8,
    hgenerator: u32,

    qlen: usize,
    stats: TcStats,
    next_filter_id: u64,
}

impl CbqSched {
    /// Build a discipline rooted at a link class of the given rate.
    ///
    /// `mtu` and `txq` size the root allotment and the default inner FIFOs
    /// until the discipline is attached to a device.
    pub fn new(
        handle: u32,
        rate: RateSpec,
        lss: Option<rill_abi::LssOpt>,
        mtu: u32,
        txq: usize,
    ) -> Result<Self, NetError> {
        let rtab = RateTable::new(rate)?;
        let allot = mtu.max(1) as i64;
        let now = clock::ticks() as i64;

        let link = CbqClass {
            classid: handle,
            priority: CBQ_MAXPRIO - 1,
            priority2: CBQ_MAXPRIO - 1,
            ewma_log: CBQ_DEF_EWMA,
            ovl_strategy: OvlStrategy::Classic,
            police: PoliceAction::Ok,
            defmap: 0,
            maxidle: 0,
            offtime: 0,
            minidle: -0x7FFF_FFFF,
            avpkt: (allot / 2) as u32,
            weight: rtab.rate() as i64,
            rtab,
            penalty: 0,
            allot,
            quantum: allot,
            split: None,
            share: None,
            tparent: None,
            borrow: None,
            children: Vec::new(),
            q: Box::new(PfifoQdisc::new(txq.max(1))),
            cpriority: CBQ_MAXPRIO - 1,
            delayed: false,
            level: 0,
            last: now,
            undertime: PAST_PERFECT,
            avgidle: 0,
            deficit: 0,
            penalized: 0,
            stats: TcStats::default(),
            xstats: ClassXstats::default(),
            filters: Vec::new(),
            filter_refs: 0,
            defaults: [None; TC_PRIO_MAX + 1],
            next_alive: None,
        };

        let mut sched = Self {
            handle,
            ifindex: 0,
            dev: None,
            mtu: mtu.max(1),
            txq: txq.max(1),
            classes: alloc::vec![Some(link)],
            free_slots: Vec::new(),
            index: HashMap::new(),
            nclasses: [0; CBQ_MAXPRIO + 1],
            quanta: [0; CBQ_MAXPRIO + 1],
            activemask: 0,
            active: [None; CBQ_MAXPRIO + 1],
            tx_class: None,
            tx_borrowed: None,
            tx_len: 0,
            now,
            now_rt: now,
            pmask: 0,
            wd_expires: 0,
            wd_token: TimerToken::INVALID,
            delay_token: TimerToken::INVALID,
            delay_expires: 0,
            throttle: false,
            toplevel: CBQ_MAXLEVEL,
            hgenerator: 0,
            qlen: 0,
            stats: TcStats::default(),
            next_filter_id: 1,
        };

        sched.index.insert(handle, ROOT);
        if let Some(lss) = lss {
            sched.set_lss(ROOT, &lss);
        }
        sched.addprio(ROOT);
        Ok(sched)
    }

    /// The discipline's identity; the high half of every class handle.
    pub fn handle(&self) -> u32 {
        self.handle
    }

    #[inline]
    fn cl(&self, slot: usize) -> &CbqClass {
        self.classes[slot].as_ref().expect("dangling class slot")
    }

    #[inline]
    fn cl_mut(&mut self, slot: usize) -> &mut CbqClass {
        self.classes[slot].as_mut().expect("dangling class slot")
    }

    fn class_lookup(&self, classid: u32) -> Option<usize> {
        self.index.get(&classid).copied()
    }

    /// Every live slot, root first.
    fn slots(&self) -> Vec<usize> {
        (0..self.classes.len()).filter(|&s| self.classes[s].is_some()).collect()
    }

    fn dev_tbusy(&self) -> bool {
        self.dev
            .as_ref()
            .and_then(|w| w.upgrade())
            .map(|d| d.tbusy())
            .unwrap_or(false)
    }

    // =========================================================================
    // Classification
    // =========================================================================

    /// Ancestors' best-effort default, skipping `this`. Policing routes
    /// reclassified packets here.
    fn reclassify_from(&self, this: usize) -> Option<usize> {
        let mut cl = self.cl(this).tparent;
        while let Some(s) = cl {
            if let Some(new) = self.cl(s).defaults[TC_PRIO_BESTEFFORT]
                && new != this
            {
                return Some(new);
            }
            cl = self.cl(s).tparent;
        }
        None
    }

    fn classify_chain(&self, head: usize, pkt: &Pkt) -> Option<crate::cls::ClsResult> {
        for (_, filter) in &self.cl(head).filters {
            if let Some(res) = filter.classify(pkt) {
                return Some(res);
            }
        }
        None
    }

    /// Classify a packet to a class. `None` drops the packet.
    ///
    /// The procedure combines link sharing and priority scheduling: link
    /// sharing rules at the root resolve to split nodes, below which
    /// packets fall to logical priority or to a more specific classifier
    /// attached at the split node.
    fn classify(&self, pkt: &Pkt) -> Option<usize> {
        let prio = pkt.priority;

        // Step 1: a priority that carries one of our class handles wins.
        if th_major(prio ^ self.handle) == 0
            && let Some(slot) = self.class_lookup(prio)
        {
            return Some(slot);
        }

        let mut head = ROOT;
        loop {
            // Step 2+n: apply the head's classifier chain.
            let Some(res) = self.classify_chain(head, pkt) else { break };

            let resolved = if th_major(res.classid) != 0 {
                self.class_lookup(res.classid)
            } else {
                let idx = (res.classid as usize) & TC_PRIO_MAX;
                self.cl(head).defaults[idx].or(self.cl(head).defaults[TC_PRIO_BESTEFFORT])
            };
            let Some(cl) = resolved else { break };
            if self.cl(cl).level >= self.cl(head).level {
                break;
            }

            match res.verdict {
                ClsVerdict::Reclassify => return self.reclassify_from(cl),
                ClsVerdict::Shot => return None,
                ClsVerdict::Ok => {}
            }

            if self.cl(cl).level == 0 {
                return Some(cl);
            }

            // Step 3+n: a link-sharing class was selected; apply its own
            // classifier until a leaf is hit.
            head = cl;
        }

        // Step 4: no success. Fall back over the head's defaults.
        let mut cl = head;
        if th_major(prio) == 0 {
            if let Some(d) = self.cl(head).defaults[(prio as usize) & TC_PRIO_MAX] {
                cl = d;
            } else if let Some(d) = self.cl(head).defaults[TC_PRIO_BESTEFFORT] {
                cl = d;
            }
        }
        Some(cl)
    }

    // =========================================================================
    // Active rings
    // =========================================================================

    /// A packet was enqueued on an empty class: append it to the tail of
    /// its band's active ring.
    fn activate_class(&mut self, slot: usize) {
        let prio = self.cl(slot).cpriority;
        let tail = self.active[prio];
        self.active[prio] = Some(slot);
        match tail {
            Some(tail) => {
                let after = self.cl(tail).next_alive;
                self.cl_mut(slot).next_alive = after;
                self.cl_mut(tail).next_alive = Some(slot);
            }
            None => {
                self.cl_mut(slot).next_alive = Some(slot);
                self.activemask |= 1 << prio;
            }
        }
    }

    /// Unlink a class from its ring. The round-robin loop performs the
    /// same surgery inline while it holds the ring cursors.
    fn deactivate_class(&mut self, slot: usize) {
        let prio = self.cl(slot).cpriority;
        let Some(start) = self.active[prio] else { return };
        let mut cl_prev = start;
        loop {
            let Some(cl) = self.cl(cl_prev).next_alive else { return };
            if cl == slot {
                let after = self.cl(cl).next_alive;
                self.cl_mut(cl_prev).next_alive = after;
                self.cl_mut(cl).next_alive = None;

                if Some(cl) == self.active[prio] {
                    self.active[prio] = Some(cl_prev);
                    if cl == cl_prev {
                        self.active[prio] = None;
                        self.activemask &= !(1 << prio);
                    }
                }
                return;
            }
            cl_prev = cl;
            if cl_prev == start {
                return;
            }
        }
    }

    // =========================================================================
    // Toplevel accounting
    // =========================================================================

    /// Raise the borrowing cutoff towards `slot` if some ancestor on its
    /// borrow chain is already eligible.
    fn mark_toplevel(&mut self, slot: usize) {
        let toplevel = self.toplevel;
        if toplevel > self.cl(slot).level && !self.cl(slot).q.throttled() {
            let now = self.now + (clock::ticks() as i64 - self.now_rt);
            let mut s = slot;
            loop {
                if self.cl(s).undertime < now {
                    self.toplevel = self.cl(s).level;
                    return;
                }
                match self.cl(s).borrow {
                    Some(b) if toplevel > self.cl(b).level => s = b,
                    _ => break,
                }
            }
        }
    }

    /// Regenerate the cutoff after a transmission if the sender still has
    /// backlog and is not being regulated.
    fn update_toplevel(&mut self, this: usize, borrowed: Option<usize>) {
        let Some(mut borrowed) = borrowed else { return };
        if self.toplevel >= self.cl(borrowed).level && self.cl(this).q.len() > 1 {
            loop {
                if is_past_perfect(self.cl(borrowed).undertime) {
                    self.toplevel = self.cl(borrowed).level;
                    return;
                }
                match self.cl(borrowed).borrow {
                    Some(b) => borrowed = b,
                    None => return,
                }
            }
        }
    }

    // =========================================================================
    // Idle-time accounting
    // =========================================================================

    /// Charge the just-finished transmission along the sender's share
    /// chain, updating each ancestor's idle average and eligibility time.
    fn update(&mut self) {
        let Some(this) = self.tx_class.take() else { return };
        let len = self.tx_len;
        let link_cost = self.cl(ROOT).rtab.l2t(len);
        let now = self.now;
        let borrowed = self.tx_borrowed;

        let mut cursor = Some(this);
        while let Some(s) = cursor {
            let cost = self.cl(s).rtab.l2t(len);
            let c = self.cl_mut(s);

            c.stats.packets += 1;
            c.stats.bytes += len as u64;

            // (now - last) is the time between packet right edges;
            // len/rate is the virtual busy time, so
            //     idle = (now - last) - len/rate
            let mut avgidle = c.avgidle;
            let mut idle = now - c.last;
            if idle > STALE_IDLE {
                avgidle = c.maxidle;
            } else {
                idle -= cost;
                // true_avgidle := (1-W)*true_avgidle + W*idle with
                // W = 2^-ewma_log; avgidle is scaled by 1/W, hence:
                avgidle += idle - (avgidle >> c.ewma_log);
            }

            if avgidle <= 0 {
                // Overlimit or at limit.
                if avgidle < c.minidle {
                    avgidle = c.minidle;
                }
                c.avgidle = avgidle;

                // The class may send again when
                // (1-W)*true_avgidle + W*delay = 0, i.e.
                //     idle = (1-W)*(-avgidle)
                let mut wait = (-avgidle) - ((-avgidle) >> c.ewma_log);

                // Maintaining the allocated rate also means charging the
                // difference between the class cost and the link cost
                // already folded into the virtual clock.
                wait -= link_cost;
                wait += cost;

                c.undertime = now + wait;
            } else {
                // Under limit.
                c.undertime = PAST_PERFECT;
                c.avgidle = if avgidle > c.maxidle { c.maxidle } else { avgidle };
            }
            c.last = now;

            cursor = self.cl(s).share;
        }

        self.update_toplevel(this, borrowed);
    }

    /// Walk the borrow chain for a class that may transmit now.
    ///
    /// Returns the class itself when it is within limits, an eligible
    /// ancestor when borrowing is allowed, or `None` after invoking the
    /// class's overlimit action.
    fn under_limit(&mut self, slot: usize) -> Option<usize> {
        if self.cl(slot).tparent.is_none() {
            return Some(slot);
        }

        if is_past_perfect(self.cl(slot).undertime) || self.now >= self.cl(slot).undertime {
            self.cl_mut(slot).delayed = false;
            return Some(slot);
        }

        let mut cl = slot;
        loop {
            // Overlimit actions fire for unbounded classes only when the
            // link is completely congested; in agreement with the
            // ancestor-only paradigm, if nothing else.
            match self.cl(cl).borrow {
                Some(b) => cl = b,
                None => {
                    self.cl_mut(slot).stats.overlimits += 1;
                    self.overlimit(slot);
                    return None;
                }
            }
            if self.cl(cl).level > self.toplevel {
                return None;
            }
            if is_past_perfect(self.cl(cl).undertime) || self.now >= self.cl(cl).undertime {
                break;
            }
        }
        self.cl_mut(cl).delayed = false;
        Some(cl)
    }

    // =========================================================================
    // Overlimit actions
    // =========================================================================

    fn overlimit(&mut self, slot: usize) {
        match self.cl(slot).ovl_strategy {
            OvlStrategy::Classic => self.ovl_classic(slot),
            OvlStrategy::RClassic => self.ovl_rclassic(slot),
            OvlStrategy::Delay => self.ovl_delay(slot),
            OvlStrategy::LowPrio => self.ovl_lowprio(slot),
            OvlStrategy::Drop => self.ovl_drop(slot),
        }
    }

    /// Penalise the class by `offtime` and let the watchdog wake it.
    fn ovl_classic(&mut self, slot: usize) {
        let now = self.now;
        let mut delay = self.cl(slot).undertime - now;

        if !self.cl(slot).delayed {
            delay += self.cl(slot).offtime;

            // The class goes to sleep and will have no chance to work off
            // avgidle there; forgive the accumulated debt.
            let (avgidle, ewma_log, minidle) = {
                let c = self.cl(slot);
                (c.avgidle, c.ewma_log, c.minidle)
            };
            if avgidle < 0 {
                delay -= (-avgidle) - ((-avgidle) >> ewma_log);
            }
            if avgidle < minidle {
                self.cl_mut(slot).avgidle = minidle;
            }
            if delay <= 0 {
                delay = 1;
            }
            self.cl_mut(slot).undertime = now + delay;
            self.cl_mut(slot).xstats.overactions += 1;
            self.cl_mut(slot).delayed = true;
        }

        if self.wd_expires == 0 || self.wd_expires > delay {
            self.wd_expires = delay;
        }

        // Wakeups must track the real available rate, not the leaf rate,
        // which may be tiny or zero: with no cutoff in force, take the
        // nearest deadline along the borrow path.
        if self.toplevel == CBQ_MAXLEVEL {
            let mut base_delay = self.wd_expires;
            let mut b = self.cl(slot).borrow;
            while let Some(s) = b {
                let mut d = self.cl(s).undertime - now;
                if d < base_delay {
                    if d <= 0 {
                        d = 1;
                    }
                    base_delay = d;
                }
                b = self.cl(s).borrow;
            }
            self.wd_expires = base_delay;
        }
    }

    /// Apply the classic penalty at the shallowest borrowable ancestor.
    fn ovl_rclassic(&mut self, slot: usize) {
        let mut cl = slot;
        let target = loop {
            if self.cl(cl).level <= self.toplevel {
                break cl;
            }
            match self.cl(cl).borrow {
                Some(b) => cl = b,
                None => break slot,
            }
        };
        self.ovl_classic(target);
    }

    /// Park the class in the reserved band until an explicit undelay.
    fn ovl_delay(&mut self, slot: usize) {
        let now = self.now;
        let mut delay = self.cl(slot).undertime - now;

        if !self.cl(slot).delayed {
            let sched = clock::ticks();

            delay += self.cl(slot).offtime;
            let (avgidle, ewma_log, minidle) = {
                let c = self.cl(slot);
                (c.avgidle, c.ewma_log, c.minidle)
            };
            if avgidle < 0 {
                delay -= (-avgidle) - ((-avgidle) >> ewma_log);
            }
            if avgidle < minidle {
                self.cl_mut(slot).avgidle = minidle;
            }
            self.cl_mut(slot).undertime = now + delay;

            if delay > 0 {
                let penalty = self.cl(slot).penalty;
                let when = sched + delay as u64 + penalty;
                self.cl_mut(slot).penalized = when;
                self.cl_mut(slot).cpriority = CBQ_MAXPRIO;
                self.pmask |= 1 << CBQ_MAXPRIO;
                self.delay_timer_at(when);
                self.cl_mut(slot).delayed = true;
                self.cl_mut(slot).xstats.overactions += 1;
                return;
            }
            delay = 1;
        }
        if self.wd_expires == 0 || self.wd_expires > delay {
            self.wd_expires = delay;
        }
    }

    /// Demote the class to its secondary band for `penalty` ticks.
    fn ovl_lowprio(&mut self, slot: usize) {
        let when = clock::ticks() + self.cl(slot).penalty;
        self.cl_mut(slot).penalized = when;

        if self.cl(slot).cpriority != self.cl(slot).priority2 {
            let p2 = self.cl(slot).priority2;
            self.cl_mut(slot).cpriority = p2;
            self.pmask |= 1 << p2;
            self.cl_mut(slot).xstats.overactions += 1;
            self.delay_timer_at(when);
        }
        self.ovl_classic(slot);
    }

    /// Shed one packet, then penalise classically.
    fn ovl_drop(&mut self, slot: usize) {
        if self.cl_mut(slot).q.drop_one() {
            self.qlen = self.qlen.saturating_sub(1);
        }
        self.cl_mut(slot).xstats.overactions += 1;
        self.ovl_classic(slot);
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Arm (or advance) the delay timer to fire at absolute tick `when`.
    fn delay_timer_at(&mut self, when: u64) {
        if self.delay_expires != 0 && self.delay_expires <= when {
            return;
        }
        NET_TIMERS.cancel(self.delay_token);
        let now = clock::ticks();
        let delta = when.saturating_sub(now).max(1);
        self.delay_token = NET_TIMERS.schedule(delta, TimerKind::QdiscDelay, self.ifindex);
        self.delay_expires = when;
    }

    /// Scan one band for penalty expiries; restore what is due. Returns
    /// the nearest remaining deadline delta, or 0 when the band is clean.
    fn undelay_prio(&mut self, prio: usize) -> u64 {
        let now = clock::ticks();
        let mut sched: u64 = 0;

        let Some(start_tail) = self.active[prio] else { return 0 };
        let mut cl_tail = start_tail;
        let mut cl_prev = cl_tail;

        loop {
            let Some(cl) = self.cl(cl_prev).next_alive else { return 0 };
            // Only parked classes are candidates; classes resident in
            // this band at their own priority are left alone.
            let parked = self.cl(cl).cpriority != self.cl(cl).priority;
            if parked && now >= self.cl(cl).penalized {
                // Due: unlink here and reinsert at the original priority.
                let after = self.cl(cl).next_alive;
                self.cl_mut(cl_prev).next_alive = after;
                self.cl_mut(cl).next_alive = None;
                let prio0 = self.cl(cl).priority;
                self.cl_mut(cl).cpriority = prio0;
                self.cl_mut(cl).delayed = false;
                self.activate_class(cl);

                if cl == cl_tail {
                    cl_tail = cl_prev;
                    self.active[prio] = Some(cl_prev);
                    if cl == cl_prev {
                        self.active[prio] = None;
                        self.activemask &= !(1 << prio);
                        return 0;
                    }
                }
                continue;
            }
            if parked {
                let deadline = self.cl(cl).penalized;
                if sched == 0 || deadline < sched {
                    sched = deadline;
                }
            }
            cl_prev = cl;
            if cl_prev == cl_tail {
                break;
            }
        }

        sched.saturating_sub(now)
    }

    /// The delay timer body: service every band with penalty bits set,
    /// re-arming for the earliest remaining deadline.
    fn undelay(&mut self) {
        let mut pmask = self.pmask;
        self.pmask = 0;
        self.delay_expires = 0;
        let mut delay: u64 = 0;

        while pmask != 0 {
            let prio = pmask.trailing_zeros() as usize;
            pmask &= !(1 << prio);

            let tmp = self.undelay_prio(prio);
            if tmp > 0 {
                self.pmask |= 1 << prio;
                if delay == 0 || tmp < delay {
                    delay = tmp;
                }
            }
        }

        if delay > 0 {
            let when = clock::ticks() + delay;
            self.delay_token = NET_TIMERS.schedule(delay, TimerKind::QdiscDelay, self.ifindex);
            self.delay_expires = when;
        }
        self.throttle = false;
    }

    // =========================================================================
    // Dequeue
    // =========================================================================

    /// One weighted round-robin pass over a band's active ring.
    fn dequeue_prio(&mut self, prio: usize) -> Option<Pkt> {
        let mut cl_tail = self.active[prio]?;
        let mut cl_prev = cl_tail;
        let mut cl = self.cl(cl_prev).next_alive?;

        loop {
            let mut deficit_advanced = false;

            loop {
                let mut borrow = None;
                let backlog = self.cl(cl).q.len();
                let mut skip = false;

                if backlog > 0 {
                    borrow = self.under_limit(cl);
                    if borrow.is_none() {
                        skip = true;
                    }
                }

                if !skip {
                    if self.cl(cl).deficit <= 0 {
                        // Allotment for this round exhausted; move on.
                        deficit_advanced = true;
                        let quantum = self.cl(cl).quantum;
                        self.cl_mut(cl).deficit += quantum;
                        cl_prev = cl;
                        cl = self.cl(cl).next_alive?;
                        if cl_prev != cl_tail {
                            continue;
                        }
                        break;
                    }

                    match self.cl_mut(cl).q.dequeue() {
                        Some(pkt) => {
                            let len = pkt.len() as i64;
                            self.cl_mut(cl).deficit -= len;
                            self.tx_class = Some(cl);
                            self.tx_borrowed = borrow;
                            if borrow != Some(cl)
                                && let Some(b) = borrow
                            {
                                self.cl_mut(b).xstats.borrows += 1;
                                self.cl_mut(cl).xstats.borrows += 1;
                            }
                            self.tx_len = pkt.len() as u32;

                            if self.cl(cl).deficit <= 0 {
                                self.active[prio] = Some(cl);
                                if let Some(next) = self.cl(cl).next_alive {
                                    let quantum = self.cl(next).quantum;
                                    self.cl_mut(next).deficit += quantum;
                                }
                            }
                            return Some(pkt);
                        }
                        None => {
                            // The inner discipline gave us nothing even
                            // with backlog (it may shape internally).
                            skip = true;
                        }
                    }
                }

                if skip && (self.cl(cl).q.len() == 0 || prio != self.cl(cl).cpriority) {
                    // Empty or penalised: unlink from this ring.
                    let after = self.cl(cl).next_alive;
                    self.cl_mut(cl_prev).next_alive = after;
                    self.cl_mut(cl).next_alive = None;

                    if cl == cl_tail {
                        cl_tail = cl_prev;
                        if cl == cl_tail {
                            // The band is gone.
                            self.active[prio] = None;
                            self.activemask &= !(1 << prio);
                            if self.cl(cl).q.len() > 0 {
                                self.activate_class(cl);
                            }
                            return None;
                        }
                        self.active[prio] = Some(cl_tail);
                    }
                    if self.cl(cl).q.len() > 0 {
                        self.activate_class(cl);
                    }
                    cl = cl_prev;
                }

                cl_prev = cl;
                cl = self.cl(cl).next_alive?;
                if cl_prev == cl_tail {
                    break;
                }
            }

            if !deficit_advanced {
                break;
            }
        }

        self.active[prio] = Some(cl_prev);
        None
    }

    fn dequeue_1(&mut self) -> Option<Pkt> {
        let mut activemask = self.activemask & 0xFF;
        while activemask != 0 {
            let prio = activemask.trailing_zeros() as usize;
            activemask &= !(1 << prio);
            if let Some(pkt) = self.dequeue_prio(prio) {
                return Some(pkt);
            }
        }
        None
    }

    // =========================================================================
    // Class bookkeeping
    // =========================================================================

    fn adjust_levels(&mut self, from: Option<usize>) {
        let mut this = from;
        while let Some(s) = this {
            let mut level = 0;
            for &c in self.cl(s).children.clone().iter() {
                level = level.max(self.cl(c).level);
            }
            self.cl_mut(s).level = level + 1;
            this = self.cl(s).tparent;
        }
    }

    fn normalize_quanta(&mut self, prio: usize) {
        if self.quanta[prio] == 0 {
            return;
        }
        let nclasses = self.nclasses[prio];
        let quanta = self.quanta[prio];
        let mtu = self.mtu as i64;

        for slot in self.slots() {
            let (cprio, weight, allot) = {
                let c = self.cl(slot);
                (c.priority, c.weight, c.allot)
            };
            if cprio == prio {
                self.cl_mut(slot).quantum = weight * allot * nclasses / quanta;
            }
            let quantum = self.cl(slot).quantum;
            if quantum <= 0 || quantum > 32 * mtu {
                klog_warn!(
                    "cbq: class {:08x} has bad quantum {}, repaired",
                    self.cl(slot).classid,
                    quantum
                );
                self.cl_mut(slot).quantum = mtu / 2 + 1;
            }
        }
    }

    fn addprio(&mut self, slot: usize) {
        let prio = self.cl(slot).priority;
        self.nclasses[prio] += 1;
        self.quanta[prio] += self.cl(slot).weight;
        self.normalize_quanta(prio);
    }

    fn rmprio(&mut self, slot: usize) {
        let prio = self.cl(slot).priority;
        self.nclasses[prio] -= 1;
        self.quanta[prio] -= self.cl(slot).weight;
        self.normalize_quanta(prio);
    }

    fn set_lss(&mut self, slot: usize, lss: &rill_abi::LssOpt) {
        if lss.change.contains(LssChange::FLAGS) {
            let tparent = self.cl(slot).tparent;
            self.cl_mut(slot).share =
                if lss.flags.contains(LssFlags::ISOLATED) { None } else { tparent };
            self.cl_mut(slot).borrow =
                if lss.flags.contains(LssFlags::BOUNDED) { None } else { tparent };
        }
        if lss.change.contains(LssChange::EWMA) {
            self.cl_mut(slot).ewma_log = lss.ewma_log;
        }
        if lss.change.contains(LssChange::AVPKT) {
            self.cl_mut(slot).avpkt = lss.avpkt;
        }
        if lss.change.contains(LssChange::MINIDLE) {
            self.cl_mut(slot).minidle = -(lss.minidle as i64);
        }
        if lss.change.contains(LssChange::MAXIDLE) {
            self.cl_mut(slot).maxidle = lss.maxidle as i64;
            self.cl_mut(slot).avgidle = lss.maxidle as i64;
        }
        if lss.change.contains(LssChange::OFFTIME) {
            self.cl_mut(slot).offtime = lss.offtime;
        }
    }

    fn set_wrr(&mut self, slot: usize, wrr: &rill_abi::WrrOpt) {
        if wrr.allot != 0 {
            self.cl_mut(slot).allot = wrr.allot as i64;
        }
        if wrr.weight != 0 {
            self.cl_mut(slot).weight = wrr.weight as i64;
        }
        if wrr.priority != 0 {
            let prio = (wrr.priority - 1) as usize;
            self.cl_mut(slot).priority = prio;
            self.cl_mut(slot).cpriority = prio;
            if prio >= self.cl(slot).priority2 {
                self.cl_mut(slot).priority2 = CBQ_MAXPRIO - 1;
            }
        }
        self.addprio(slot);
    }

    fn set_overlimit(&mut self, slot: usize, ovl: &rill_abi::OvlOpt) -> Result<(), NetError> {
        match ovl.strategy {
            OvlStrategy::LowPrio => {
                if ovl.priority2 == 0
                    || (ovl.priority2 - 1) as usize >= CBQ_MAXPRIO
                    || (ovl.priority2 - 1) as usize <= self.cl(slot).priority
                {
                    return Err(NetError::Inval);
                }
                self.cl_mut(slot).priority2 = (ovl.priority2 - 1) as usize;
            }
            OvlStrategy::Classic
            | OvlStrategy::RClassic
            | OvlStrategy::Delay
            | OvlStrategy::Drop => {}
        }
        self.cl_mut(slot).ovl_strategy = ovl.strategy;
        self.cl_mut(slot).penalty = ovl.penalty;
        Ok(())
    }

    fn sync_defmap(&mut self, slot: usize) {
        let Some(split) = self.cl(slot).split else { return };

        for i in 0..=TC_PRIO_MAX {
            if self.cl(split).defaults[i] == Some(slot) && self.cl(slot).defmap & (1 << i) == 0 {
                self.cl_mut(split).defaults[i] = None;
            }
        }

        let slots = self.slots();
        for i in 0..=TC_PRIO_MAX {
            if self.cl(split).defaults[i].is_some() {
                continue;
            }
            let mut level = self.cl(split).level;
            let mut best = None;
            for &c in &slots {
                if self.cl(c).split == Some(split)
                    && self.cl(c).level < level
                    && self.cl(c).defmap & (1 << i) != 0
                {
                    best = Some(c);
                    level = self.cl(c).level;
                }
            }
            self.cl_mut(split).defaults[i] = best;
        }
    }

    fn change_defmap(&mut self, slot: usize, splitid: u32, def: u32, mask: u32) {
        let mut split = None;
        let mut splitid = splitid;

        if splitid == 0 {
            match self.cl(slot).split {
                Some(s) => {
                    split = Some(s);
                    splitid = self.cl(s).classid;
                }
                None => return,
            }
        }

        if split.map(|s| self.cl(s).classid) != Some(splitid) {
            split = None;
            let mut p = self.cl(slot).tparent;
            while let Some(s) = p {
                if self.cl(s).classid == splitid {
                    split = Some(s);
                    break;
                }
                p = self.cl(s).tparent;
            }
        }

        let Some(split) = split else { return };

        if self.cl(slot).split != Some(split) {
            self.cl_mut(slot).defmap = 0;
            self.sync_defmap(slot);
            self.cl_mut(slot).split = Some(split);
            self.cl_mut(slot).defmap = def & mask;
        } else {
            let dm = self.cl(slot).defmap;
            self.cl_mut(slot).defmap = (dm & !mask) | (def & mask);
        }
        self.sync_defmap(slot);
    }

    fn link_class(&mut self, slot: usize) {
        let classid = self.cl(slot).classid;
        self.index.insert(classid, slot);
        if let Some(parent) = self.cl(slot).tparent {
            self.cl_mut(parent).children.push(slot);
        }
    }

    fn unlink_class(&mut self, slot: usize) {
        let classid = self.cl(slot).classid;
        self.index.remove(&classid);
        if let Some(parent) = self.cl(slot).tparent {
            self.cl_mut(parent).children.retain(|&c| c != slot);
        }
    }

    fn alloc_slot(&mut self, class: CbqClass) -> usize {
        match self.free_slots.pop() {
            Some(slot) => {
                self.classes[slot] = Some(class);
                slot
            }
            None => {
                self.classes.push(Some(class));
                self.classes.len() - 1
            }
        }
    }

    /// Pick an unused minor id in the auto-generation window.
    fn generate_classid(&mut self) -> Result<u32, NetError> {
        let base = th_make(self.handle, 0x8000);
        for _ in 0..0x8000 {
            self.hgenerator += 1;
            if self.hgenerator >= 0x8000 {
                self.hgenerator = 1;
            }
            let candidate = base | self.hgenerator;
            if self.class_lookup(candidate).is_none() {
                return Ok(candidate);
            }
        }
        Err(NetError::AddrNotAvail)
    }

    /// Reclassify-on-reject: when a leaf queue refuses a packet and the
    /// class is policed with `Reclassify`, feed the packet to an
    /// ancestor's best-effort default instead. Depth is bounded by the
    /// tree height at entry so repeated rejections cannot loop.
    fn reshape(&mut self, from: usize, pkt: Pkt, len: usize) -> Result<(), Pkt> {
        let mut pkt = pkt;
        let mut cur = from;
        for _ in 0..=self.cl(ROOT).level {
            let Some(new) = self.reclassify_from(cur) else { return Err(pkt) };
            self.mark_toplevel(new);
            match self.cl_mut(new).q.enqueue(pkt) {
                EnqueueOutcome::Queued => {
                    self.qlen += 1;
                    self.stats.packets += 1;
                    self.stats.bytes += len as u64;
                    if self.cl(new).next_alive.is_none() {
                        self.activate_class(new);
                    }
                    return Ok(());
                }
                EnqueueOutcome::Dropped(p) | EnqueueOutcome::Congested(p) => {
                    pkt = p;
                    cur = new;
                }
            }
        }
        Err(pkt)
    }
}

// =============================================================================
// Qdisc implementation
// =============================================================================

impl Qdisc for CbqSched {
    fn enqueue(&mut self, pkt: Pkt) -> EnqueueOutcome {
        let len = pkt.len();
        let Some(cl) = self.classify(&pkt) else {
            self.stats.drops += 1;
            return EnqueueOutcome::Dropped(pkt);
        };

        match self.cl_mut(cl).q.enqueue(pkt) {
            EnqueueOutcome::Queued => {
                self.qlen += 1;
                self.stats.packets += 1;
                self.stats.bytes += len as u64;
                self.mark_toplevel(cl);
                if self.cl(cl).next_alive.is_none() {
                    self.activate_class(cl);
                }
                EnqueueOutcome::Queued
            }
            EnqueueOutcome::Dropped(p) | EnqueueOutcome::Congested(p) => {
                let mut p = p;
                if self.cl(cl).police == PoliceAction::Reclassify {
                    match self.reshape(cl, p, len) {
                        Ok(()) => return EnqueueOutcome::Queued,
                        Err(back) => p = back,
                    }
                }
                self.stats.drops += 1;
                self.mark_toplevel(cl);
                self.cl_mut(cl).stats.drops += 1;
                EnqueueOutcome::Dropped(p)
            }
        }
    }

    fn dequeue(&mut self) -> Option<Pkt> {
        let now_rt = clock::ticks() as i64;
        let mut incr = now_rt - self.now_rt;

        if self.tx_class.is_some() {
            // Clock integrator: estimate end-of-service by adding the
            // expected transmission time, warping virtual time so that
            // cbq_time = max(real_time, work).
            let incr2 = self.cl(ROOT).rtab.l2t(self.tx_len);
            self.now += incr2;
            self.update();
            incr -= incr2;
            if incr < 0 {
                incr = 0;
            }
        }
        self.now += incr;
        self.now_rt = now_rt;

        loop {
            self.wd_expires = 0;

            if let Some(pkt) = self.dequeue_1() {
                self.qlen = self.qlen.saturating_sub(1);
                self.throttle = false;
                return Some(pkt);
            }

            // All classes are over limit. That happens when the scheduler
            // is empty, the toplevel cutoff inhibited borrowing, or the
            // root itself is over limit. Reset the last two and retry;
            // peeking an arbitrary class would suit ancestor-only sharing
            // but not the toplevel algorithm, so two passes it is.
            if self.toplevel == CBQ_MAXLEVEL && is_past_perfect(self.cl(ROOT).undertime) {
                break;
            }
            self.toplevel = CBQ_MAXLEVEL;
            self.cl_mut(ROOT).undertime = PAST_PERFECT;
        }

        // Nothing to send, or nobody was willing: start the watchdog if
        // there is backlog to wake up for.
        if self.qlen > 0 {
            self.stats.overlimits += 1;
            if self.wd_expires > 0 && !self.dev_tbusy() {
                NET_TIMERS.cancel(self.wd_token);
                self.wd_token = NET_TIMERS.schedule(
                    self.wd_expires as u64,
                    TimerKind::QdiscWatchdog,
                    self.ifindex,
                );
                self.throttle = true;
            }
        }
        None
    }

    fn requeue(&mut self, pkt: Pkt) {
        let Some(cl) = self.tx_class.take() else {
            self.stats.drops += 1;
            return;
        };
        self.mark_toplevel(cl);
        self.cl_mut(cl).q.requeue(pkt);
        self.qlen += 1;
        if self.cl(cl).next_alive.is_none() {
            self.activate_class(cl);
        }
    }

    fn drop_one(&mut self) -> bool {
        for prio in (0..=CBQ_MAXPRIO).rev() {
            let Some(head) = self.active[prio] else { continue };
            let mut cl = head;
            loop {
                if self.cl_mut(cl).q.drop_one() {
                    self.qlen = self.qlen.saturating_sub(1);
                    return true;
                }
                match self.cl(cl).next_alive {
                    Some(next) if next != head => cl = next,
                    _ => break,
                }
            }
        }
        false
    }

    fn reset(&mut self) {
        self.activemask = 0;
        self.pmask = 0;
        self.tx_class = None;
        self.tx_borrowed = None;
        NET_TIMERS.cancel(self.wd_token);
        NET_TIMERS.cancel(self.delay_token);
        self.wd_token = TimerToken::INVALID;
        self.delay_token = TimerToken::INVALID;
        self.delay_expires = 0;
        self.throttle = false;
        self.toplevel = CBQ_MAXLEVEL;
        self.now = clock::ticks() as i64;
        self.now_rt = self.now;
        self.active = [None; CBQ_MAXPRIO + 1];

        for slot in self.slots() {
            let c = self.cl_mut(slot);
            c.q.reset();
            c.next_alive = None;
            c.undertime = PAST_PERFECT;
            c.avgidle = c.maxidle;
            c.deficit = c.quantum;
            c.cpriority = c.priority;
        }
        self.qlen = 0;
    }

    fn len(&self) -> usize {
        self.qlen
    }

    fn throttled(&self) -> bool {
        self.throttle
    }

    fn attach(&mut self, dev: &DeviceRef) {
        self.dev = Some(alloc::sync::Arc::downgrade(dev));
        self.ifindex = dev.ifindex().0;
        self.mtu = dev.mtu().max(1);
        self.txq = dev.txqueuelen().max(1);
    }

    fn timer_fire(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::QdiscWatchdog => {
                self.throttle = false;
            }
            TimerKind::QdiscDelay => {
                self.undelay();
            }
        }
    }

    fn class_ops(&mut self) -> Option<&mut dyn ClassfulQdisc> {
        Some(self)
    }

    fn stats(&self) -> TcStats {
        self.stats
    }
}

// =============================================================================
// Classful control surface
// =============================================================================

impl ClassfulQdisc for CbqSched {
    fn class_create(
        &mut self,
        classid: u32,
        parentid: u32,
        cfg: &ClassConfig,
    ) -> Result<u32, NetError> {
        if parentid == crate::types::TH_ROOT {
            return Err(NetError::Inval);
        }
        let (Some(rate), Some(wrr), Some(lss)) = (cfg.rate, cfg.wrr, cfg.lss) else {
            return Err(NetError::Inval);
        };
        if wrr.priority == 0 || wrr.priority as usize > CBQ_MAXPRIO {
            return Err(NetError::Inval);
        }
        let rtab = RateTable::new(rate)?;

        let classid = if classid != 0 {
            if th_major(classid ^ self.handle) != 0 || self.class_lookup(classid).is_some() {
                return Err(NetError::Inval);
            }
            classid
        } else {
            self.generate_classid()?
        };

        let parent = if parentid != 0 {
            self.class_lookup(parentid).ok_or(NetError::Inval)?
        } else {
            ROOT
        };

        let (allot, link_ewma, link_maxidle, link_avpkt) = {
            let p = self.cl(parent);
            let l = self.cl(ROOT);
            (p.allot, l.ewma_log, l.maxidle, l.avpkt)
        };

        let class = CbqClass {
            classid,
            priority: 0,
            priority2: 0,
            ewma_log: 0,
            ovl_strategy: OvlStrategy::Classic,
            police: PoliceAction::Ok,
            defmap: 0,
            maxidle: 0,
            offtime: 0,
            minidle: -0x7FFF_FFFF,
            avpkt: 0,
            weight: rtab.rate() as i64,
            rtab,
            penalty: 0,
            allot,
            quantum: allot,
            split: None,
            share: None,
            tparent: Some(parent),
            borrow: None,
            children: Vec::new(),
            q: Box::new(PfifoQdisc::new(self.txq)),
            cpriority: 0,
            delayed: false,
            level: 0,
            last: self.now,
            undertime: PAST_PERFECT,
            avgidle: 0,
            deficit: 0,
            penalized: 0,
            stats: TcStats::default(),
            xstats: ClassXstats::default(),
            filters: Vec::new(),
            filter_refs: 0,
            defaults: [None; TC_PRIO_MAX + 1],
            next_alive: None,
        };

        let slot = self.alloc_slot(class);
        self.link_class(slot);
        self.cl_mut(slot).borrow = Some(parent);
        if parent != ROOT {
            self.cl_mut(slot).share = Some(parent);
        }
        self.adjust_levels(Some(parent));
        self.set_lss(slot, &lss);
        self.set_wrr(slot, &wrr);
        if self.cl(slot).ewma_log == 0 {
            self.cl_mut(slot).ewma_log = link_ewma;
        }
        if self.cl(slot).maxidle == 0 {
            self.cl_mut(slot).maxidle = link_maxidle;
        }
        if self.cl(slot).avpkt == 0 {
            self.cl_mut(slot).avpkt = link_avpkt;
        }
        if let Some(ovl) = &cfg.ovl
            && self.set_overlimit(slot, ovl).is_err()
        {
            // Roll the half-made class back out.
            self.rmprio(slot);
            self.unlink_class(slot);
            self.adjust_levels(Some(parent));
            self.classes[slot] = None;
            self.free_slots.push(slot);
            return Err(NetError::Inval);
        }
        if let Some(police) = cfg.police {
            self.cl_mut(slot).police = police;
        }
        if let Some(fopt) = &cfg.fopt {
            self.change_defmap(slot, fopt.split, fopt.defmap, fopt.defchange);
        }
        Ok(classid)
    }

    fn class_modify(&mut self, classid: u32, cfg: &ClassConfig) -> Result<(), NetError> {
        let slot = self.class_lookup(classid).ok_or(NetError::NoEnt)?;

        let rtab = match cfg.rate {
            Some(rate) => Some(RateTable::new(rate)?),
            None => None,
        };
        if let Some(wrr) = &cfg.wrr
            && wrr.priority as usize > CBQ_MAXPRIO
        {
            return Err(NetError::Inval);
        }

        // The class sits out while its parameters move under it.
        if self.cl(slot).next_alive.is_some() {
            self.deactivate_class(slot);
        }

        if let Some(rtab) = rtab {
            self.cl_mut(slot).rtab = rtab;
        }
        if let Some(lss) = &cfg.lss {
            self.set_lss(slot, lss);
        }
        if let Some(wrr) = &cfg.wrr {
            self.rmprio(slot);
            self.set_wrr(slot, wrr);
        }
        if let Some(ovl) = &cfg.ovl {
            self.set_overlimit(slot, ovl)?;
        }
        if let Some(police) = cfg.police {
            self.cl_mut(slot).police = police;
        }
        if let Some(fopt) = &cfg.fopt {
            self.change_defmap(slot, fopt.split, fopt.defmap, fopt.defchange);
        }

        if self.cl(slot).q.len() > 0 {
            self.activate_class(slot);
        }
        Ok(())
    }

    fn class_delete(&mut self, classid: u32) -> Result<(), NetError> {
        let slot = self.class_lookup(classid).ok_or(NetError::NoEnt)?;
        if slot == ROOT
            || self.cl(slot).filter_refs != 0
            || !self.cl(slot).filters.is_empty()
            || !self.cl(slot).children.is_empty()
        {
            return Err(NetError::Busy);
        }

        if self.cl(slot).next_alive.is_some() {
            self.deactivate_class(slot);
        }

        if self.tx_borrowed == Some(slot) {
            self.tx_borrowed = self.tx_class;
        }
        if self.tx_class == Some(slot) {
            self.tx_class = None;
            self.tx_borrowed = None;
        }

        let tparent = self.cl(slot).tparent;
        self.unlink_class(slot);
        self.adjust_levels(tparent);
        self.cl_mut(slot).defmap = 0;
        self.sync_defmap(slot);
        self.rmprio(slot);

        // Release the filter references this class held on others.
        let bound: Vec<u32> = self
            .cl(slot)
            .filters
            .iter()
            .filter_map(|(_, f)| f.bound_classid())
            .collect();
        for target in bound {
            if let Some(t) = self.class_lookup(target) {
                self.cl_mut(t).filter_refs = self.cl(t).filter_refs.saturating_sub(1);
            }
        }

        self.qlen = self.qlen.saturating_sub(self.cl(slot).q.len());
        self.classes[slot] = None;
        self.free_slots.push(slot);
        Ok(())
    }

    fn class_list(&self) -> Vec<ClassInfo> {
        self.slots()
            .into_iter()
            .map(|slot| {
                let parent = self.cl(slot).tparent.map(|p| self.cl(p).classid);
                self.cl(slot).info(parent)
            })
            .collect()
    }

    fn class_stats(&self, classid: u32) -> Option<ClassInfo> {
        let slot = self.class_lookup(classid)?;
        let parent = self.cl(slot).tparent.map(|p| self.cl(p).classid);
        Some(self.cl(slot).info(parent))
    }

    fn class_graft(
        &mut self,
        classid: u32,
        mut new: Box<dyn Qdisc>,
    ) -> Result<Box<dyn Qdisc>, NetError> {
        let slot = self.class_lookup(classid).ok_or(NetError::NoEnt)?;
        if self.cl(slot).next_alive.is_some() {
            self.deactivate_class(slot);
        }
        core::mem::swap(&mut self.cl_mut(slot).q, &mut new);
        self.qlen = self.qlen.saturating_sub(new.len());
        new.reset();
        if self.cl(slot).q.len() > 0 {
            self.activate_class(slot);
        }
        Ok(new)
    }

    fn class_attach_filter(
        &mut self,
        classid: u32,
        filter: Box<dyn Classifier>,
    ) -> Result<u64, NetError> {
        let owner = self.class_lookup(classid).ok_or(NetError::NoEnt)?;
        if let Some(target_id) = filter.bound_classid() {
            let target = self.class_lookup(target_id).ok_or(NetError::NoEnt)?;
            // A filter may only select classes below its attachment point.
            if self.cl(target).level >= self.cl(owner).level && target != owner {
                return Err(NetError::Inval);
            }
            self.cl_mut(target).filter_refs += 1;
        }
        let id = self.next_filter_id;
        self.next_filter_id += 1;
        self.cl_mut(owner).filters.push((id, filter));
        Ok(id)
    }

    fn class_detach_filter(&mut self, classid: u32, filter_id: u64) -> Result<(), NetError> {
        let owner = self.class_lookup(classid).ok_or(NetError::NoEnt)?;
        let pos = self
            .cl(owner)
            .filters
            .iter()
            .position(|(id, _)| *id == filter_id)
            .ok_or(NetError::NoEnt)?;
        let (_, filter) = self.cl_mut(owner).filters.remove(pos);
        if let Some(target_id) = filter.bound_classid()
            && let Some(target) = self.class_lookup(target_id)
        {
            self.cl_mut(target).filter_refs = self.cl(target).filter_refs.saturating_sub(1);
        }
        Ok(())
    }
}
