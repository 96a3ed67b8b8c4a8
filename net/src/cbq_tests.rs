//! CBQ tests: weighted round-robin sharing, bounded-class rate limiting
//! with overlimit actions and the watchdog, classification through
//! filters and default maps, penalty strategies, and class lifecycle.
//!
//! The harness drives the discipline directly: it enqueues tagged packets,
//! dequeues in a loop, and advances the tick clock by the root-rate
//! transmission time of whatever was sent, so virtual time tracks a
//! saturated link.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use rill_abi::{
    LssChange, LssFlags, LssOpt, NetError, OvlOpt, OvlStrategy, RateSpec, WrrOpt,
};
use rill_lib::clock;
use rill_lib::testing::TestResult;
use rill_lib::{assert_eq_test, assert_test, fail, pass, run_test};

use crate::cls::{ClsVerdict, MatchClassifier};
use crate::ctrl::{self, QdiscKind};
use crate::dev::{DeviceRef, unregister_netdevice};
use crate::qdisc::{ClassConfig, EnqueueOutcome};
use crate::testutil::{RecordingDriver, test_device, test_pkt};
use crate::timer::net_timer_process;
use crate::types::{ETH_P_IP, th_make};

const HANDLE: u32 = 0x0001_0000;
const CELL_LOG: u8 = 4;

/// 10 Mbit/s in bytes per second.
const LINK_RATE: u32 = 1_250_000;

fn rate(bytes_per_sec: u32) -> RateSpec {
    RateSpec { rate: bytes_per_sec, cell_log: CELL_LOG, mpu: 0, overhead: 0 }
}

/// Ticks one `len`-byte packet occupies a link of `bps`.
fn xmit_ticks(bps: u32, len: usize) -> u64 {
    let cells = ((len >> CELL_LOG) as u64 + 1) << CELL_LOG;
    cells * rill_lib::clock::TICKS_PER_SEC / bps as u64
}

fn cbq_device() -> Result<(DeviceRef, Arc<RecordingDriver>), NetError> {
    let (dev, drv) = test_device(true, 1500, 1000);
    // The harness dequeues by hand; a refusing driver keeps the transmit
    // pump (kicked by timer dispatch) from competing for packets.
    drv.set_refuse(true);
    ctrl::qdisc_create(&dev.name(), HANDLE, QdiscKind::Cbq { rate: rate(LINK_RATE), lss: None })?;
    Ok((dev, drv))
}

struct ClassSpec {
    minor: u32,
    rate: u32,
    /// 1-based band.
    priority: u8,
    weight: u32,
    bounded: bool,
    maxidle: u32,
    offtime: i64,
    ovl: Option<OvlOpt>,
}

fn mk_class(dev: &DeviceRef, spec: &ClassSpec) -> Result<u32, NetError> {
    let mut change = LssChange::FLAGS | LssChange::MAXIDLE;
    if spec.offtime != 0 {
        change |= LssChange::OFFTIME;
    }
    let cfg = ClassConfig {
        rate: Some(rate(spec.rate)),
        lss: Some(LssOpt {
            change,
            flags: if spec.bounded { LssFlags::BOUNDED } else { LssFlags::empty() },
            ewma_log: 0,
            avpkt: 0,
            maxidle: spec.maxidle,
            minidle: 0,
            offtime: spec.offtime,
        }),
        wrr: Some(WrrOpt { allot: 0, priority: spec.priority, weight: spec.weight }),
        ovl: spec.ovl,
        fopt: None,
        police: None,
    };
    ctrl::class_create(&dev.name(), 0, th_make(HANDLE, spec.minor), &cfg)
}

/// Enqueue `count` packets of `len` bytes classified to `classid` via the
/// priority fast path.
fn offer(dev: &DeviceRef, classid: u32, count: usize, len: usize) -> usize {
    let mut queued = 0;
    for _ in 0..count {
        let pkt = test_pkt(dev, ETH_P_IP, len, classid);
        match dev.queue.lock().enqueue(pkt) {
            EnqueueOutcome::Queued => queued += 1,
            _ => break,
        }
    }
    queued
}

/// Dequeue until `max_packets` came out or the discipline stays silent
/// while empty. Returns `(classid, len)` per sent packet and the elapsed
/// ticks.
fn drive(dev: &DeviceRef, max_packets: usize) -> (Vec<(u32, usize)>, u64) {
    let start = clock::ticks();
    let mut sent = Vec::new();
    let mut idle_rounds = 0;

    while sent.len() < max_packets && idle_rounds < 10_000 {
        net_timer_process();
        let pkt = dev.queue.lock().dequeue();
        match pkt {
            Some(p) => {
                sent.push((p.priority, p.len()));
                clock::advance(xmit_ticks(LINK_RATE, p.len()));
                idle_rounds = 0;
            }
            None => {
                if dev.queue.lock().len() == 0 {
                    break;
                }
                clock::advance(500);
                idle_rounds += 1;
            }
        }
    }
    (sent, clock::ticks() - start)
}

fn bytes_of(sent: &[(u32, usize)], classid: u32) -> usize {
    sent.iter().filter(|(c, _)| *c == classid).map(|(_, l)| l).sum()
}

/// S2: two same-band classes with weights 1:3 split a saturated link 1:3,
/// and the aggregate tracks the link rate.
pub fn test_wrr_weight_split() -> TestResult {
    let Ok((dev, _drv)) = cbq_device() else { return fail!("cbq setup") };
    let c1 = ClassSpec {
        minor: 1,
        rate: LINK_RATE,
        priority: 4,
        weight: 1,
        bounded: false,
        maxidle: 1_000_000,
        offtime: 0,
        ovl: None,
    };
    let c2 = ClassSpec { minor: 2, weight: 3, ..c1 };
    let (Ok(id1), Ok(id2)) = (mk_class(&dev, &c1), mk_class(&dev, &c2)) else {
        return fail!("class creation");
    };

    assert_eq_test!(offer(&dev, id1, 400, 1000), 400, "c1 backlog accepted");
    assert_eq_test!(offer(&dev, id2, 400, 1000), 400, "c2 backlog accepted");

    // Measure while both classes stay backlogged.
    let (sent, elapsed) = drive(&dev, 400);
    let b1 = bytes_of(&sent, id1);
    let b2 = bytes_of(&sent, id2);
    unregister_netdevice(&dev).ok();

    assert_eq_test!(sent.len(), 400, "the link stayed busy");
    assert_test!(b1 > 0 && b2 > 0, "both classes progressed");
    let ratio_x100 = (b2 * 100) / b1;
    assert_test!((285..=315).contains(&ratio_x100), "byte split within 5% of 1:3");

    let total = (b1 + b2) as u64;
    let achieved = total * rill_lib::clock::TICKS_PER_SEC / elapsed.max(1);
    let lo = LINK_RATE as u64 * 95 / 100;
    let hi = LINK_RATE as u64 * 105 / 100;
    assert_test!(achieved >= lo && achieved <= hi, "aggregate within 5% of the link rate");
    pass!()
}

/// S3: a bounded high-priority class is clamped near its own rate with
/// overlimit actions counted, while the low band soaks up the rest.
pub fn test_bounded_class_rate_clamp() -> TestResult {
    let Ok((dev, _drv)) = cbq_device() else { return fail!("cbq setup") };
    let hi = ClassSpec {
        minor: 1,
        rate: 125_000,
        priority: 1,
        weight: 1,
        bounded: true,
        maxidle: 1_000,
        offtime: 2_000,
        ovl: None,
    };
    let lo = ClassSpec {
        minor: 2,
        rate: LINK_RATE,
        priority: 6,
        weight: 1,
        bounded: false,
        maxidle: 1_000_000,
        offtime: 0,
        ovl: None,
    };
    let (Ok(hi_id), Ok(lo_id)) = (mk_class(&dev, &hi), mk_class(&dev, &lo)) else {
        return fail!("class creation");
    };

    assert_eq_test!(offer(&dev, hi_id, 200, 500), 200);
    assert_eq_test!(offer(&dev, lo_id, 400, 1000), 400);

    let (sent, elapsed) = drive(&dev, 600);
    let hi_bytes = bytes_of(&sent, hi_id);
    let lo_bytes = bytes_of(&sent, lo_id);

    let stats = ctrl::class_stats(&dev.name(), hi_id);
    unregister_netdevice(&dev).ok();

    let Ok(stats) = stats else { return fail!("hi class stats") };
    assert_test!(stats.xstats.overactions > 0, "overlimit actions were taken");
    assert_test!(lo_bytes > hi_bytes, "the unbounded band soaked up the slack");

    // The bounded class stays in the neighbourhood of its configured
    // rate; generous bounds absorb the offtime sleep cycles.
    let hi_rate = hi_bytes as u64 * rill_lib::clock::TICKS_PER_SEC / elapsed.max(1);
    assert_test!(hi_rate <= 250_000, "bounded class cannot double its rate");
    assert_test!(hi_rate >= 40_000, "bounded class still progresses");
    pass!()
}

/// The watchdog throttles a discipline whose only backlog is overlimit
/// and unthrottles it when the deadline passes.
pub fn test_watchdog_throttle_cycle() -> TestResult {
    let Ok((dev, _drv)) = cbq_device() else { return fail!("cbq setup") };
    let hi = ClassSpec {
        minor: 1,
        rate: 50_000,
        priority: 1,
        weight: 1,
        bounded: true,
        maxidle: 100,
        offtime: 1_000,
        ovl: None,
    };
    let Ok(hi_id) = mk_class(&dev, &hi) else { return fail!("class creation") };

    assert_eq_test!(offer(&dev, hi_id, 50, 1000), 50);

    // Pump without advancing the clock: the class exhausts its idle
    // credit, goes overlimit and the discipline throttles.
    let mut throttled = false;
    for _ in 0..60 {
        let pkt = dev.queue.lock().dequeue();
        if pkt.is_none() && dev.queue.lock().len() > 0 {
            throttled = dev.queue.lock().throttled();
            break;
        }
        clock::advance(10);
    }
    assert_test!(throttled, "backlogged overlimit class throttles the discipline");

    // Let the watchdog fire.
    clock::advance(1_000_000);
    net_timer_process();
    let unthrottled = !dev.queue.lock().throttled();
    let resumed = dev.queue.lock().dequeue().is_some();
    unregister_netdevice(&dev).ok();

    assert_test!(unthrottled, "watchdog clears the throttle");
    assert_test!(resumed, "transmission resumes after the deadline");
    pass!()
}

/// Classifier chain on the root selects a leaf; a `Shot` verdict drops.
pub fn test_filter_classification() -> TestResult {
    let Ok((dev, _drv)) = cbq_device() else { return fail!("cbq setup") };
    let spec = ClassSpec {
        minor: 1,
        rate: LINK_RATE,
        priority: 4,
        weight: 1,
        bounded: false,
        maxidle: 1_000_000,
        offtime: 0,
        ovl: None,
    };
    let Ok(c1) = mk_class(&dev, &spec) else { return fail!("class creation") };

    let filter = MatchClassifier::by_protocol(ETH_P_IP, c1);
    let Ok(fid) = ctrl::class_attach_filter(&dev.name(), HANDLE, alloc::boxed::Box::new(filter))
    else {
        return fail!("filter attach");
    };

    // Priority 0 carries no class handle, so the chain decides.
    let pkt = test_pkt(&dev, ETH_P_IP, 200, 0);
    assert_test!(
        matches!(dev.queue.lock().enqueue(pkt), EnqueueOutcome::Queued),
        "filtered packet accepted"
    );
    let qlen = ctrl::class_stats(&dev.name(), c1).map(|i| i.qlen);
    assert_eq_test!(qlen, Ok(1), "the filter routed the packet to its class");

    ctrl::class_detach_filter(&dev.name(), HANDLE, fid).ok();

    // A Shot verdict kills the packet during classification.
    let shot = MatchClassifier::by_protocol(ETH_P_IP, c1).with_verdict(ClsVerdict::Shot);
    let Ok(fid2) = ctrl::class_attach_filter(&dev.name(), HANDLE, alloc::boxed::Box::new(shot))
    else {
        return fail!("shot filter attach");
    };
    let drops_before = dev.queue.lock().stats().drops;
    let pkt = test_pkt(&dev, ETH_P_IP, 200, 0);
    assert_test!(
        matches!(dev.queue.lock().enqueue(pkt), EnqueueOutcome::Dropped(_)),
        "shot packet refused"
    );
    assert_test!(dev.queue.lock().stats().drops > drops_before, "drop counted");

    ctrl::class_detach_filter(&dev.name(), HANDLE, fid2).ok();
    unregister_netdevice(&dev).ok();
    pass!()
}

/// Default maps route priorities with no filter match.
pub fn test_defmap_routing() -> TestResult {
    let Ok((dev, _drv)) = cbq_device() else { return fail!("cbq setup") };
    let spec = ClassSpec {
        minor: 1,
        rate: LINK_RATE,
        priority: 4,
        weight: 1,
        bounded: false,
        maxidle: 1_000_000,
        offtime: 0,
        ovl: None,
    };
    let Ok(c1) = mk_class(&dev, &spec) else { return fail!("class creation") };

    // Make c1 the best-effort default at the root split.
    let cfg = ClassConfig {
        fopt: Some(rill_abi::FOpt { split: HANDLE, defmap: 1, defchange: 1 }),
        ..ClassConfig::default()
    };
    assert_test!(ctrl::class_modify(&dev.name(), c1, &cfg).is_ok(), "defmap update");

    let pkt = test_pkt(&dev, ETH_P_IP, 120, 0);
    assert_test!(matches!(dev.queue.lock().enqueue(pkt), EnqueueOutcome::Queued));
    let qlen = ctrl::class_stats(&dev.name(), c1).map(|i| i.qlen);
    unregister_netdevice(&dev).ok();

    assert_eq_test!(qlen, Ok(1), "priority fell back to the defmap class");
    pass!()
}

/// S4: deletion is refused while filters reference the class; after the
/// filter is gone and the queue drained it succeeds and the band quanta
/// renormalise.
pub fn test_delete_busy_class() -> TestResult {
    let Ok((dev, _drv)) = cbq_device() else { return fail!("cbq setup") };
    let base = ClassSpec {
        minor: 1,
        rate: LINK_RATE,
        priority: 4,
        weight: 1,
        bounded: false,
        maxidle: 1_000_000,
        offtime: 0,
        ovl: None,
    };
    let (Ok(c1), Ok(c2)) = (
        mk_class(&dev, &base),
        mk_class(&dev, &ClassSpec { minor: 2, weight: 3, ..base }),
    ) else {
        return fail!("class creation");
    };

    let quantum_before = match ctrl::class_stats(&dev.name(), c2) {
        Ok(info) => info.quantum,
        Err(_) => return fail!("c2 stats"),
    };
    assert_eq_test!(quantum_before, 2250, "normalised quantum before delete");

    let filter = MatchClassifier::by_protocol(ETH_P_IP, c1);
    let Ok(fid) = ctrl::class_attach_filter(&dev.name(), HANDLE, alloc::boxed::Box::new(filter))
    else {
        return fail!("filter attach");
    };
    assert_eq_test!(offer(&dev, c1, 1, 100), 1, "backlog one packet");

    assert_eq_test!(
        ctrl::class_delete(&dev.name(), c1),
        Err(NetError::Busy),
        "delete refused while referenced"
    );

    ctrl::class_detach_filter(&dev.name(), HANDLE, fid).ok();
    let (drained, _) = drive(&dev, 4);
    assert_eq_test!(drained.len(), 1, "queue drained");

    assert_eq_test!(ctrl::class_delete(&dev.name(), c1), Ok(()), "delete succeeds");

    let quantum_after = match ctrl::class_stats(&dev.name(), c2) {
        Ok(info) => info.quantum,
        Err(_) => return fail!("c2 stats after delete"),
    };
    unregister_netdevice(&dev).ok();
    assert_eq_test!(quantum_after, 1500, "quanta renormalised to the sole class");
    pass!()
}

/// The delay strategy parks a class and the undelay timer restores it.
pub fn test_delay_strategy_parks_and_restores() -> TestResult {
    let Ok((dev, _drv)) = cbq_device() else { return fail!("cbq setup") };
    let spec = ClassSpec {
        minor: 1,
        rate: 50_000,
        priority: 1,
        weight: 1,
        bounded: true,
        maxidle: 100,
        offtime: 1_000,
        ovl: Some(OvlOpt { strategy: OvlStrategy::Delay, priority2: 0, penalty: 3_000 }),
    };
    let Ok(c1) = mk_class(&dev, &spec) else { return fail!("class creation") };

    assert_eq_test!(offer(&dev, c1, 30, 1000), 30);

    // Exhaust the idle credit without letting time pass.
    for _ in 0..40 {
        if dev.queue.lock().dequeue().is_none() {
            break;
        }
        clock::advance(10);
    }
    let overactions = ctrl::class_stats(&dev.name(), c1)
        .map(|i| i.xstats.overactions)
        .unwrap_or(0);
    assert_test!(overactions > 0, "delay strategy fired");

    // Ride the undelay timer back to life.
    let mut resumed = false;
    for _ in 0..200 {
        clock::advance(5_000);
        net_timer_process();
        if dev.queue.lock().dequeue().is_some() {
            resumed = true;
            break;
        }
    }
    unregister_netdevice(&dev).ok();
    assert_test!(resumed, "parked class resumes after the penalty");
    pass!()
}

/// A requeued packet is the next one dequeued.
pub fn test_requeue_returns_head() -> TestResult {
    let Ok((dev, _drv)) = cbq_device() else { return fail!("cbq setup") };
    let spec = ClassSpec {
        minor: 1,
        rate: LINK_RATE,
        priority: 4,
        weight: 1,
        bounded: false,
        maxidle: 1_000_000,
        offtime: 0,
        ovl: None,
    };
    let Ok(c1) = mk_class(&dev, &spec) else { return fail!("class creation") };
    assert_eq_test!(offer(&dev, c1, 1, 300), 1);
    assert_eq_test!(offer(&dev, c1, 1, 500), 1);

    let first_len = {
        let mut q = dev.queue.lock();
        let Some(pkt) = q.dequeue() else { return fail!("first dequeue") };
        let len = pkt.len();
        q.requeue(pkt);
        len
    };
    assert_eq_test!(first_len, 300, "FIFO order inside the class");
    clock::advance(1000);
    let second = dev.queue.lock().dequeue().map(|p| p.len());
    let remaining = dev.queue.lock().len();
    unregister_netdevice(&dev).ok();

    assert_eq_test!(second, Some(first_len), "requeued packet came back first");
    assert_eq_test!(remaining, 1, "queue length accounts the requeue");
    pass!()
}

/// Reset empties every class and restarts the schedule state.
pub fn test_reset() -> TestResult {
    let Ok((dev, _drv)) = cbq_device() else { return fail!("cbq setup") };
    let spec = ClassSpec {
        minor: 1,
        rate: LINK_RATE,
        priority: 4,
        weight: 1,
        bounded: false,
        maxidle: 1_000_000,
        offtime: 0,
        ovl: None,
    };
    let Ok(c1) = mk_class(&dev, &spec) else { return fail!("class creation") };
    assert_eq_test!(offer(&dev, c1, 10, 500), 10);

    dev.queue.lock().reset();
    let len = dev.queue.lock().len();
    let qlen = ctrl::class_stats(&dev.name(), c1).map(|i| i.qlen);
    unregister_netdevice(&dev).ok();

    assert_eq_test!(len, 0, "discipline empty after reset");
    assert_eq_test!(qlen, Ok(0), "class queue empty after reset");
    pass!()
}

pub fn run() -> (u32, u32) {
    let mut passed = 0u32;
    let mut total = 0u32;
    run_test!(passed, total, test_wrr_weight_split);
    run_test!(passed, total, test_bounded_class_rate_clamp);
    run_test!(passed, total, test_watchdog_throttle_cycle);
    run_test!(passed, total, test_filter_classification);
    run_test!(passed, total, test_defmap_routing);
    run_test!(passed, total, test_delete_busy_class);
    run_test!(passed, total, test_delay_strategy_parks_and_restores);
    run_test!(passed, total, test_requeue_returns_head);
    run_test!(passed, total, test_reset);
    (passed, total)
}
