//! Queueing-framework tests: the pfifo default, the transmit pump with a
//! busy driver, head requeue ordering, graft, and the down-device path.

extern crate alloc;

use rill_lib::testing::TestResult;
use rill_lib::{assert_eq_test, assert_test, pass, run_test};

use crate::dev::{dev_queue_xmit, unregister_netdevice};
use crate::qdisc::{netif_wake_queue, qdisc_run};
use crate::softnet;
use crate::testutil::{test_device, test_pkt};
use crate::types::ETH_P_IP;

/// A queue-owning device drains straight through an eager driver.
pub fn test_xmit_drains_immediately() -> TestResult {
    let (dev, drv) = test_device(true, 1500, 16);

    for _ in 0..4 {
        let pkt = test_pkt(&dev, ETH_P_IP, 100, 0);
        assert_test!(dev_queue_xmit(pkt).is_ok(), "xmit accepted");
    }
    assert_eq_test!(drv.sent_count(), 4, "every packet reached the driver");
    assert_eq_test!(dev.queue.lock().len(), 0, "discipline drained");

    unregister_netdevice(&dev).ok();
    pass!()
}

/// A busy driver gets the packet back; it waits at the head until the
/// driver wakes the queue, and order is preserved.
pub fn test_busy_driver_requeues_at_head() -> TestResult {
    let (dev, drv) = test_device(true, 1500, 16);
    drv.set_refuse(true);

    for prio in 0..3u32 {
        let pkt = test_pkt(&dev, ETH_P_IP, 100, prio);
        let _ = dev_queue_xmit(pkt);
    }
    assert_eq_test!(drv.sent_count(), 0, "nothing transmitted while busy");
    assert_eq_test!(dev.queue.lock().len(), 3, "all three wait in the queue");

    drv.set_refuse(false);
    netif_wake_queue(&dev);
    qdisc_run(&dev);

    let sent = drv.sent.lock().clone();
    unregister_netdevice(&dev).ok();

    assert_eq_test!(sent.len(), 3, "wake drained the queue");
    let order: alloc::vec::Vec<u32> = sent.iter().map(|r| r.priority).collect();
    assert_eq_test!(order.as_slice(), &[0, 1, 2][..], "head requeue kept order");
    pass!()
}

/// pfifo tail-drops past its limit and the caller hears about it.
pub fn test_pfifo_bound() -> TestResult {
    let (dev, drv) = test_device(true, 1500, 2);
    drv.set_refuse(true);

    let mut failures = 0;
    for _ in 0..5 {
        if dev_queue_xmit(test_pkt(&dev, ETH_P_IP, 100, 0)).is_err() {
            failures += 1;
        }
    }
    assert_eq_test!(dev.queue.lock().len(), 2, "queue clamped at txqueuelen");
    assert_eq_test!(failures, 3, "overflow reported to the sender");

    unregister_netdevice(&dev).ok();
    pass!()
}

/// Grafting swaps disciplines and resets (frees) the old one's backlog.
pub fn test_graft_resets_old() -> TestResult {
    let (dev, drv) = test_device(true, 1500, 16);
    drv.set_refuse(true);

    for _ in 0..3 {
        let _ = dev_queue_xmit(test_pkt(&dev, ETH_P_IP, 100, 0));
    }
    assert_eq_test!(dev.queue.lock().len(), 3);

    let old = crate::qdisc::qdisc_graft(
        &dev,
        alloc::boxed::Box::new(crate::qdisc::PfifoQdisc::new(16)),
    );
    assert_eq_test!(old.len(), 0, "old discipline comes back reset");
    assert_eq_test!(dev.queue.lock().len(), 0, "new discipline starts empty");

    unregister_netdevice(&dev).ok();
    pass!()
}

/// Transmit on a down device fails `NetDown` and the packet is freed.
pub fn test_down_device_refuses() -> TestResult {
    let (dev, _drv) = test_device(true, 1500, 16);
    crate::dev::dev_close(&dev);

    let pkt = test_pkt(&dev, ETH_P_IP, 100, 0);
    assert_eq_test!(
        dev_queue_xmit(pkt),
        Err(rill_abi::NetError::NetDown),
        "down device refuses transmit"
    );

    unregister_netdevice(&dev).ok();
    pass!()
}

/// Closing a device purges its frames from the receive backlog.
pub fn test_close_clears_backlog() -> TestResult {
    softnet::drain_backlog();
    let (dev_a, _da) = test_device(true, 1500, 16);
    let (dev_b, _db) = test_device(true, 1500, 16);

    softnet::netif_rx(test_pkt(&dev_a, ETH_P_IP, 50, 0));
    softnet::netif_rx(test_pkt(&dev_b, ETH_P_IP, 50, 0));
    assert_eq_test!(softnet::backlog_len(), 2);

    crate::dev::dev_close(&dev_a);
    assert_eq_test!(softnet::backlog_len(), 1, "only the closing device's frame left");

    softnet::drain_backlog();
    unregister_netdevice(&dev_a).ok();
    unregister_netdevice(&dev_b).ok();
    pass!()
}

/// Name templating allocates distinct unit numbers.
pub fn test_name_templates() -> TestResult {
    let (dev_a, _da) = test_device(true, 1500, 16);
    let (dev_b, _db) = test_device(true, 1500, 16);
    assert_test!(dev_a.name() != dev_b.name(), "template names are distinct");
    assert_test!(dev_a.ifindex() != dev_b.ifindex(), "indices are distinct");

    unregister_netdevice(&dev_a).ok();
    unregister_netdevice(&dev_b).ok();
    pass!()
}

pub fn run() -> (u32, u32) {
    let mut passed = 0u32;
    let mut total = 0u32;
    run_test!(passed, total, test_xmit_drains_immediately);
    run_test!(passed, total, test_busy_driver_requeues_at_head);
    run_test!(passed, total, test_pfifo_bound);
    run_test!(passed, total, test_graft_resets_old);
    run_test!(passed, total, test_down_device_refuses);
    run_test!(passed, total, test_close_clears_backlog);
    run_test!(passed, total, test_name_templates);
    (passed, total)
}
