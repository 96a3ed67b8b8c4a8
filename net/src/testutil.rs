//! Shared fixtures for the in-tree tests: a recording driver and device
//! factories.

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::dev::{DevFlags, DeviceConfig, DeviceRef, Driver, register_netdevice};
use crate::pkt::Pkt;

/// One transmitted packet, as the driver saw it.
#[derive(Clone, Copy, Debug)]
pub struct SentRecord {
    pub protocol: u16,
    pub len: usize,
    pub priority: u32,
}

/// Driver that records what it transmits and can be told to refuse.
pub struct RecordingDriver {
    pub sent: Mutex<Vec<SentRecord>>,
    refuse: AtomicBool,
}

impl RecordingDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { sent: Mutex::new(Vec::new()), refuse: AtomicBool::new(false) })
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::Release);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn sent_bytes_with_priority(&self, priority: u32) -> usize {
        self.sent.lock().iter().filter(|r| r.priority == priority).map(|r| r.len).sum()
    }
}

/// `Driver` delegating to a shared recorder, so tests keep their handle.
pub struct SharedDriver(pub Arc<RecordingDriver>);

impl Driver for SharedDriver {
    fn hard_start_xmit(&self, pkt: Pkt, _dev: &DeviceRef) -> Result<(), Pkt> {
        if self.0.refuse.load(Ordering::Acquire) {
            return Err(pkt);
        }
        self.0.sent.lock().push(SentRecord {
            protocol: pkt.protocol,
            len: pkt.len(),
            priority: pkt.priority,
        });
        Ok(())
    }
}

/// Register (and open) a fresh test device with a recording driver.
pub fn test_device(has_queue: bool, mtu: u32, txqueuelen: usize) -> (DeviceRef, Arc<RecordingDriver>) {
    let recorder = RecordingDriver::new();
    let dev = register_netdevice(DeviceConfig {
        name: String::from("tst%d"),
        driver: alloc::boxed::Box::new(SharedDriver(recorder.clone())),
        mtu,
        hw_addr: alloc::vec![0x02, 0, 0, 0, 0, 1],
        flags: DevFlags::BROADCAST,
        txqueuelen,
        has_queue,
    })
    .expect("test device registration");
    crate::dev::dev_open(&dev).expect("test device open");
    (dev, recorder)
}

/// Build a payload packet bound for `dev`.
pub fn test_pkt(dev: &DeviceRef, protocol: u16, len: usize, priority: u32) -> Pkt {
    let mut pkt = Pkt::alloc(len + 64);
    let _ = pkt.reserve(32);
    let _ = pkt.put(len).map(|b| b.fill(0xA5));
    pkt.protocol = protocol;
    pkt.priority = priority;
    pkt.set_dev(dev.clone());
    pkt.set_mac(pkt.data_offset());
    pkt.set_nh(pkt.data_offset());
    pkt
}
