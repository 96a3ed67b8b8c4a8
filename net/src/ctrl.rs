//! The typed control plane.
//!
//! Embedders configure devices and disciplines through these commands
//! instead of an ioctl or netlink surface. Class-tree mutations run under
//! the owning device's queue lock, so they are exclusive with the data
//! path's enqueue and dequeue.

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use rill_abi::{LssOpt, NetError, RateSpec};

use crate::cbq::CbqSched;
use crate::cls::Classifier;
use crate::dev::{DevFlags, DeviceRef, dev_close, dev_get_by_name, dev_list, dev_open};
use crate::qdisc::{ClassConfig, ClassInfo, PfifoQdisc, Qdisc, TcStats, qdisc_graft};
use crate::types::Ifindex;

/// Snapshot of one device for `device_list`.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub ifindex: Ifindex,
    pub flags: DevFlags,
    pub mtu: u32,
    pub hw_addr: Vec<u8>,
    pub txqueuelen: usize,
    pub qdisc_len: usize,
    pub qdisc_stats: TcStats,
}

/// Mutations accepted by `device_set`.
pub enum DeviceSet {
    /// Desired flag word; toggling `UP` opens or closes the device.
    Flags(DevFlags),
    Mtu(u32),
    HwAddr(Vec<u8>),
    TxQLen(usize),
    Name(String),
}

/// Disciplines the control plane can instantiate by description.
pub enum QdiscKind {
    Pfifo { limit: usize },
    Cbq { rate: RateSpec, lss: Option<LssOpt> },
}

/// Enumerate all registered devices.
pub fn device_list() -> Vec<DeviceInfo> {
    dev_list()
        .into_iter()
        .map(|dev| {
            let (qdisc_len, qdisc_stats) = {
                let q = dev.queue.lock();
                (q.len(), q.stats())
            };
            let st = dev.state.read();
            DeviceInfo {
                name: dev.name(),
                ifindex: dev.ifindex(),
                flags: st.flags,
                mtu: st.mtu,
                hw_addr: st.hw_addr.clone(),
                txqueuelen: st.txqueuelen,
                qdisc_len,
                qdisc_stats,
            }
        })
        .collect()
}

fn lookup(name: &str) -> Result<DeviceRef, NetError> {
    dev_get_by_name(name).ok_or(NetError::NoDev)
}

/// Apply one mutation to a named device.
pub fn device_set(name: &str, op: DeviceSet) -> Result<(), NetError> {
    let dev = lookup(name)?;
    match op {
        DeviceSet::Flags(want) => {
            let have = dev.flags();
            if want.contains(DevFlags::UP) && !have.contains(DevFlags::UP) {
                dev_open(&dev)?;
            } else if !want.contains(DevFlags::UP) && have.contains(DevFlags::UP) {
                dev_close(&dev);
            }
            let managed = DevFlags::UP | DevFlags::RUNNING | DevFlags::LOOPBACK;
            let mut st = dev.state.write();
            st.flags = (st.flags & managed) | (want & !managed);
            Ok(())
        }
        DeviceSet::Mtu(mtu) => crate::dev::dev_set_mtu(&dev, mtu),
        DeviceSet::HwAddr(addr) => crate::dev::dev_set_hwaddr(&dev, &addr),
        DeviceSet::TxQLen(len) => {
            if len == 0 {
                return Err(NetError::Inval);
            }
            dev.state.write().txqueuelen = len;
            Ok(())
        }
        DeviceSet::Name(new_name) => crate::dev::dev_change_name(&dev, new_name),
    }
}

/// Build and attach a discipline described by `kind`, replacing whatever
/// is attached. The old discipline is reset and discarded.
pub fn qdisc_create(devname: &str, handle: u32, kind: QdiscKind) -> Result<(), NetError> {
    let dev = lookup(devname)?;
    let new: Box<dyn Qdisc> = match kind {
        QdiscKind::Pfifo { limit } => {
            if limit == 0 {
                return Err(NetError::Inval);
            }
            Box::new(PfifoQdisc::new(limit))
        }
        QdiscKind::Cbq { rate, lss } => {
            Box::new(CbqSched::new(handle, rate, lss, dev.mtu(), dev.txqueuelen())?)
        }
    };
    qdisc_graft(&dev, new);
    Ok(())
}

/// Detach the configured discipline and fall back to the default FIFO.
pub fn qdisc_delete(devname: &str) -> Result<(), NetError> {
    let dev = lookup(devname)?;
    let fifo: Box<dyn Qdisc> = Box::new(PfifoQdisc::new(dev.txqueuelen()));
    qdisc_graft(&dev, fifo);
    Ok(())
}

/// Swap in a caller-built discipline, returning the old one (reset).
pub fn qdisc_swap(devname: &str, new: Box<dyn Qdisc>) -> Result<Box<dyn Qdisc>, NetError> {
    let dev = lookup(devname)?;
    Ok(qdisc_graft(&dev, new))
}

fn with_class_ops<R>(
    devname: &str,
    f: impl FnOnce(&mut dyn crate::qdisc::ClassfulQdisc) -> Result<R, NetError>,
) -> Result<R, NetError> {
    let dev = lookup(devname)?;
    let mut q = dev.queue.lock();
    let ops = q.class_ops().ok_or(NetError::NotSupp)?;
    f(ops)
}

/// Create a class under `parentid` (0 = the root link class). Returns the
/// classid, which is auto-generated when 0 is passed.
pub fn class_create(
    devname: &str,
    parentid: u32,
    classid: u32,
    cfg: &ClassConfig,
) -> Result<u32, NetError> {
    with_class_ops(devname, |ops| ops.class_create(classid, parentid, cfg))
}

pub fn class_modify(devname: &str, classid: u32, cfg: &ClassConfig) -> Result<(), NetError> {
    with_class_ops(devname, |ops| ops.class_modify(classid, cfg))
}

pub fn class_delete(devname: &str, classid: u32) -> Result<(), NetError> {
    with_class_ops(devname, |ops| ops.class_delete(classid))
}

pub fn class_list(devname: &str) -> Result<Vec<ClassInfo>, NetError> {
    with_class_ops(devname, |ops| Ok(ops.class_list()))
}

pub fn class_stats(devname: &str, classid: u32) -> Result<ClassInfo, NetError> {
    with_class_ops(devname, |ops| ops.class_stats(classid).ok_or(NetError::NoEnt))
}

/// Swap a class's inner discipline.
pub fn class_graft(
    devname: &str,
    classid: u32,
    new: Box<dyn Qdisc>,
) -> Result<Box<dyn Qdisc>, NetError> {
    with_class_ops(devname, |ops| ops.class_graft(classid, new))
}

/// Attach a filter to a class's chain; the returned id detaches it.
pub fn class_attach_filter(
    devname: &str,
    classid: u32,
    filter: Box<dyn Classifier>,
) -> Result<u64, NetError> {
    with_class_ops(devname, |ops| ops.class_attach_filter(classid, filter))
}

pub fn class_detach_filter(devname: &str, classid: u32, filter_id: u64) -> Result<(), NetError> {
    with_class_ops(devname, |ops| ops.class_detach_filter(classid, filter_id))
}
