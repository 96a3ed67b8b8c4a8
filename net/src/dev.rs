//! Network devices: the `Driver` boundary, the device registry, and the
//! transmit entry point.
//!
//! A [`Device`] is the stack's view of an interface: a name, a stable
//! index, state under a lock, a queueing discipline under the queue lock,
//! and a transmit lock serialising the driver. Drivers implement
//! [`Driver`]; only [`Pkt`] crosses the boundary.
//!
//! # Locking
//!
//! The registry rwlock serialises registration, unregistration and
//! enumeration; it is the outermost lock of the subsystem. Per-device
//! state uses its own rwlock. The queue lock and the transmit lock are
//! documented in [`crate::qdisc`]; the transmit path never holds both at
//! once, and at most one task is inside `hard_start_xmit` per device.

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use rill_abi::NetError;
use rill_lib::{klog_debug, klog_info, task};
use spin::{Mutex, RwLock};

use crate::pkt::Pkt;
use crate::ptype;
use crate::qdisc::{self, EnqueueOutcome, NoopQdisc, PfifoQdisc, Qdisc};
use crate::types::{Ifindex, IFNAMSIZ, PktType};

bitflags! {
    /// Interface flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DevFlags: u32 {
        const UP        = 1 << 0;
        const RUNNING   = 1 << 1;
        const PROMISC   = 1 << 2;
        const ALLMULTI  = 1 << 3;
        const LOOPBACK  = 1 << 4;
        const NOARP     = 1 << 5;
        const BROADCAST = 1 << 6;
        const MULTICAST = 1 << 7;
    }
}

/// Outcome a driver cannot express through `Result`: it refused the packet
/// and wants it back. Encoded as the `Err` payload of `hard_start_xmit`.
pub type TxRefused = Pkt;

/// The driver side of a device.
///
/// All methods take `&self`; drivers use interior mutability for their own
/// state. `hard_start_xmit` is serialised by the device transmit lock.
pub trait Driver: Send + Sync {
    /// Transmit one packet. `Err` hands the packet back: the device cannot
    /// take it now and it will be requeued at the head of the discipline.
    fn hard_start_xmit(&self, pkt: Pkt, dev: &DeviceRef) -> Result<(), TxRefused>;

    /// Build the link-level header in the packet's headroom. Returns the
    /// number of bytes written; the default device has no link header.
    fn hard_header(
        &self,
        _pkt: &mut Pkt,
        _dev: &DeviceRef,
        _proto: u16,
        _daddr: &[u8],
        _saddr: &[u8],
    ) -> Result<usize, NetError> {
        Ok(0)
    }

    /// Length of the header `hard_header` would build.
    fn hard_header_len(&self) -> usize {
        0
    }

    /// Bring hardware up. Called from `dev_open` before flags change.
    fn open(&self, _dev: &DeviceRef) -> Result<(), NetError> {
        Ok(())
    }

    /// Quiesce hardware. Called from `dev_close` while still `Up`.
    fn stop(&self, _dev: &DeviceRef) {}

    fn change_mtu(&self, _dev: &DeviceRef, _mtu: u32) -> Result<(), NetError> {
        Ok(())
    }

    fn set_mac_address(&self, _dev: &DeviceRef, _addr: &[u8]) -> Result<(), NetError> {
        Ok(())
    }

    /// The device's multicast set changed; reprogram filters.
    fn set_multicast_list(&self, _dev: &DeviceRef) {}
}

/// Mutable device state behind the state lock.
pub struct DevState {
    pub flags: DevFlags,
    pub mtu: u32,
    pub hw_addr: Vec<u8>,
    pub txqueuelen: usize,
    /// Multicast set: (address, reference count).
    pub mcast: Vec<(Vec<u8>, u32)>,
}

/// Sentinel for "nobody holds the transmit lock".
pub(crate) const XMIT_OWNER_NONE: u64 = u64::MAX;

/// A registered network device. Shared by `Arc`; the registry holds one
/// reference, packets in flight hold more, and the allocation is freed
/// when the last reference goes after unregistration.
pub struct Device {
    ifindex: Ifindex,
    name: RwLock<String>,
    driver: Box<dyn Driver>,
    /// Whether outgoing packets go through a queueing discipline. Software
    /// devices (loopback, tunnels) say no and transmit directly.
    has_queue: bool,
    pub state: RwLock<DevState>,
    /// The queueing discipline, behind the device queue lock.
    pub(crate) queue: Mutex<Box<dyn Qdisc>>,
    /// Serialises `hard_start_xmit`.
    pub(crate) xmit_lock: Mutex<()>,
    xmit_owner: AtomicU64,
    tbusy: AtomicBool,
    scheduled: AtomicBool,
}

/// Shared handle to a device.
pub type DeviceRef = Arc<Device>;

impl Device {
    #[inline]
    pub fn ifindex(&self) -> Ifindex {
        self.ifindex
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    #[inline]
    pub fn driver(&self) -> &dyn Driver {
        &*self.driver
    }

    #[inline]
    pub fn has_queue(&self) -> bool {
        self.has_queue
    }

    pub fn flags(&self) -> DevFlags {
        self.state.read().flags
    }

    pub fn is_up(&self) -> bool {
        self.flags().contains(DevFlags::UP)
    }

    pub fn mtu(&self) -> u32 {
        self.state.read().mtu
    }

    pub fn txqueuelen(&self) -> usize {
        self.state.read().txqueuelen
    }

    pub fn hw_addr(&self) -> Vec<u8> {
        self.state.read().hw_addr.clone()
    }

    #[inline]
    pub(crate) fn tbusy(&self) -> bool {
        self.tbusy.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_tbusy(&self, busy: bool) {
        self.tbusy.store(busy, Ordering::Release);
    }

    #[inline]
    pub(crate) fn xmit_owner(&self) -> u64 {
        self.xmit_owner.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_xmit_owner(&self, owner: u64) {
        self.xmit_owner.store(owner, Ordering::Release);
    }

    /// Mark scheduled; returns the previous mark so callers enqueue once.
    #[inline]
    pub(crate) fn sched_mark(&self) -> bool {
        self.scheduled.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn sched_clear(&self) {
        self.scheduled.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({} {:?})", self.name(), self.ifindex)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Parameters for registering a device.
pub struct DeviceConfig {
    /// Name, at most [`IFNAMSIZ`] bytes; a `%d` is replaced by the lowest
    /// free unit number.
    pub name: String,
    pub driver: Box<dyn Driver>,
    pub mtu: u32,
    pub hw_addr: Vec<u8>,
    pub flags: DevFlags,
    pub txqueuelen: usize,
    /// `false` for software devices that transmit without a discipline.
    pub has_queue: bool,
}

/// Device lifecycle events delivered to notifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DevEvent {
    Register,
    Up,
    Down,
    Unregister,
    ChangeName,
    ChangeMtu,
    ChangeAddr,
}

type Notifier = fn(DevEvent, &DeviceRef);

static DEV_BASE: RwLock<Vec<DeviceRef>> = RwLock::new(Vec::new());
static NOTIFIERS: RwLock<Vec<Notifier>> = RwLock::new(Vec::new());
static NEXT_IFINDEX: AtomicU32 = AtomicU32::new(1);

/// Subscribe to device lifecycle events.
pub fn register_netdevice_notifier(nb: Notifier) {
    NOTIFIERS.write().push(nb);
}

/// Unsubscribe; matched by function identity.
pub fn unregister_netdevice_notifier(nb: Notifier) {
    NOTIFIERS.write().retain(|n| !core::ptr::fn_addr_eq(*n, nb));
}

fn notify(event: DevEvent, dev: &DeviceRef) {
    let chain = NOTIFIERS.read().clone();
    for nb in chain {
        nb(event, dev);
    }
}

/// Find a device by name.
pub fn dev_get_by_name(name: &str) -> Option<DeviceRef> {
    DEV_BASE.read().iter().find(|d| *d.name.read() == name).cloned()
}

/// Find a device by index.
pub fn dev_get_by_index(ifindex: Ifindex) -> Option<DeviceRef> {
    DEV_BASE.read().iter().find(|d| d.ifindex == ifindex).cloned()
}

/// Snapshot of all registered devices, in registration order.
pub fn dev_list() -> Vec<DeviceRef> {
    DEV_BASE.read().clone()
}

fn name_in_use(base: &[DeviceRef], name: &str) -> bool {
    base.iter().any(|d| *d.name.read() == name)
}

/// Resolve a `%d` template to the lowest free unit number.
fn alloc_name(base: &[DeviceRef], template: &str) -> Result<String, NetError> {
    if !template.contains("%d") {
        if name_in_use(base, template) {
            return Err(NetError::AddrInUse);
        }
        return Ok(String::from(template));
    }
    for unit in 0..100 {
        let mut candidate = String::new();
        let mut parts = template.splitn(2, "%d");
        if let Some(head) = parts.next() {
            candidate.push_str(head);
        }
        // u8 formatting keeps the candidate inside IFNAMSIZ for sane
        // templates.
        candidate.push_str(itoa(unit).as_str());
        if let Some(tail) = parts.next() {
            candidate.push_str(tail);
        }
        if !name_in_use(base, &candidate) {
            return Ok(candidate);
        }
    }
    Err(NetError::AddrNotAvail)
}

fn itoa(mut n: u32) -> String {
    let mut s = String::new();
    if n == 0 {
        s.push('0');
        return s;
    }
    let mut digits = [0u8; 10];
    let mut i = 0;
    while n > 0 {
        digits[i] = b'0' + (n % 10) as u8;
        n /= 10;
        i += 1;
    }
    while i > 0 {
        i -= 1;
        s.push(digits[i] as char);
    }
    s
}

/// Allocate, initialise and insert a device. The returned handle is live
/// until [`unregister_netdevice`]; the notifier chain sees `Register`.
pub fn register_netdevice(cfg: DeviceConfig) -> Result<DeviceRef, NetError> {
    let mut base = DEV_BASE.write();
    let name = alloc_name(&base, &cfg.name)?;
    if name.len() > IFNAMSIZ {
        return Err(NetError::Inval);
    }

    let dev: DeviceRef = Arc::new(Device {
        ifindex: Ifindex(NEXT_IFINDEX.fetch_add(1, Ordering::Relaxed)),
        name: RwLock::new(name),
        driver: cfg.driver,
        has_queue: cfg.has_queue,
        state: RwLock::new(DevState {
            flags: cfg.flags & !(DevFlags::UP | DevFlags::RUNNING),
            mtu: cfg.mtu,
            hw_addr: cfg.hw_addr,
            txqueuelen: cfg.txqueuelen.max(1),
            mcast: Vec::new(),
        }),
        queue: Mutex::new(Box::new(NoopQdisc)),
        xmit_lock: Mutex::new(()),
        xmit_owner: AtomicU64::new(XMIT_OWNER_NONE),
        tbusy: AtomicBool::new(false),
        scheduled: AtomicBool::new(false),
    });
    base.push(dev.clone());
    drop(base);

    klog_info!("dev: registered {} ({:?})", dev.name(), dev.ifindex());
    notify(DevEvent::Register, &dev);
    Ok(dev)
}

/// Tear a device down: close it, swap in the placeholder discipline, drop
/// the registry reference and announce `Unregister`. Outstanding packet
/// references keep the allocation alive until they drain; the last one
/// frees it.
pub fn unregister_netdevice(dev: &DeviceRef) -> Result<(), NetError> {
    if dev_get_by_index(dev.ifindex).is_none() {
        return Err(NetError::NoDev);
    }
    dev_close(dev);
    qdisc::qdisc_graft(dev, Box::new(NoopQdisc));
    DEV_BASE.write().retain(|d| !Arc::ptr_eq(d, dev));
    notify(DevEvent::Unregister, dev);
    klog_info!("dev: unregistered {}", dev.name());
    Ok(())
}

/// Bring an interface up: driver open, flags, multicast upload, default
/// discipline, notification.
pub fn dev_open(dev: &DeviceRef) -> Result<(), NetError> {
    if dev.is_up() {
        return Ok(());
    }
    dev.driver.open(dev)?;
    {
        let mut st = dev.state.write();
        st.flags |= DevFlags::UP | DevFlags::RUNNING;
    }
    dev.driver.set_multicast_list(dev);

    // Activate the transmit engine: a queue-owning device that still has
    // the placeholder gets the default FIFO sized by txqueuelen.
    if dev.has_queue {
        let limit = dev.txqueuelen();
        let mut q = dev.queue.lock();
        if q.is_noop() {
            let mut fifo: Box<dyn Qdisc> = Box::new(PfifoQdisc::new(limit));
            fifo.attach(dev);
            *q = fifo;
        }
    }

    notify(DevEvent::Up, dev);
    Ok(())
}

/// Shut an interface down: driver stop, flags cleared, its packets purged
/// from the receive backlog, notification.
pub fn dev_close(dev: &DeviceRef) {
    if !dev.is_up() {
        return;
    }
    dev.driver.stop(dev);
    crate::softnet::clear_backlog(dev);
    {
        let mut st = dev.state.write();
        st.flags &= !(DevFlags::UP | DevFlags::RUNNING);
    }
    dev.queue.lock().reset();
    notify(DevEvent::Down, dev);
}

/// Rename a device. Fails on empty, oversized, or already-taken names.
pub fn dev_change_name(dev: &DeviceRef, new_name: String) -> Result<(), NetError> {
    if new_name.is_empty() || new_name.len() > IFNAMSIZ {
        return Err(NetError::Inval);
    }
    if dev_get_by_name(&new_name).is_some() {
        return Err(NetError::AddrInUse);
    }
    *dev.name.write() = new_name;
    notify(DevEvent::ChangeName, dev);
    Ok(())
}

/// Change the MTU, giving the driver veto power.
pub fn dev_set_mtu(dev: &DeviceRef, mtu: u32) -> Result<(), NetError> {
    if mtu == 0 {
        return Err(NetError::Inval);
    }
    dev.driver.change_mtu(dev, mtu)?;
    dev.state.write().mtu = mtu;
    notify(DevEvent::ChangeMtu, dev);
    Ok(())
}

/// Change the hardware address, giving the driver veto power.
pub fn dev_set_hwaddr(dev: &DeviceRef, addr: &[u8]) -> Result<(), NetError> {
    dev.driver.set_mac_address(dev, addr)?;
    dev.state.write().hw_addr = addr.to_vec();
    notify(DevEvent::ChangeAddr, dev);
    Ok(())
}

// =============================================================================
// Multicast set
// =============================================================================

/// Add a multicast address (or bump its reference).
pub fn dev_mc_add(dev: &DeviceRef, addr: &[u8]) {
    {
        let mut st = dev.state.write();
        if let Some(entry) = st.mcast.iter_mut().find(|(a, _)| a == addr) {
            entry.1 += 1;
        } else {
            st.mcast.push((addr.to_vec(), 1));
        }
    }
    dev.driver.set_multicast_list(dev);
}

/// Drop one reference to a multicast address.
pub fn dev_mc_delete(dev: &DeviceRef, addr: &[u8]) -> Result<(), NetError> {
    {
        let mut st = dev.state.write();
        let Some(pos) = st.mcast.iter().position(|(a, _)| a == addr) else {
            return Err(NetError::AddrNotAvail);
        };
        st.mcast[pos].1 -= 1;
        if st.mcast[pos].1 == 0 {
            st.mcast.remove(pos);
        }
    }
    dev.driver.set_multicast_list(dev);
    Ok(())
}

// =============================================================================
// Transmit entry point
// =============================================================================

/// Route an outgoing packet through the device's discipline, or hand it
/// straight to the driver for software devices.
///
/// Ordering guarantees: the queue lock is not held across the driver call,
/// and at most one task runs `hard_start_xmit` per device at any time.
pub fn dev_queue_xmit(pkt: Pkt) -> Result<(), NetError> {
    let dev = pkt.dev().cloned().ok_or(NetError::NoDev)?;

    if !dev.is_up() {
        return Err(NetError::NetDown);
    }

    if dev.has_queue {
        let outcome = dev.queue.lock().enqueue(pkt);
        qdisc::qdisc_run(&dev);
        return match outcome {
            EnqueueOutcome::Queued => Ok(()),
            EnqueueOutcome::Dropped(dropped) => {
                drop(dropped);
                Err(NetError::NoMemory)
            }
            EnqueueOutcome::Congested(shed) => {
                drop(shed);
                Err(NetError::Busy)
            }
        };
    }

    // The device has no queue: loopback, tunnels. Serialise on the
    // transmit lock and detect recursive entry from the same task.
    let me = task::current_task_id();
    if dev.xmit_owner() == me {
        klog_debug!("dev: dead loop on virtual device {}, fix it urgently", dev.name());
        return Err(NetError::NetDown);
    }

    let _xmit = dev.xmit_lock.lock();
    dev.set_xmit_owner(me);
    let mut pkt = pkt;
    if ptype::ntaps() > 0 {
        ptype::send_to_taps(&mut pkt, &dev);
    }
    let res = match dev.driver.hard_start_xmit(pkt, &dev) {
        Ok(()) => Ok(()),
        Err(refused) => {
            klog_debug!("dev: virtual device {} asks to queue packet", dev.name());
            drop(refused);
            Err(NetError::NetDown)
        }
    };
    dev.set_xmit_owner(XMIT_OWNER_NONE);
    res
}

/// Fast path for frames addressed back at ourselves: clone, restore the
/// link framing view, tag as loopback and feed the input path.
pub fn dev_loopback_xmit(pkt: &Pkt) {
    let mut looped = pkt.clone_shared();
    looped.set_mac(looped.data_offset());
    let nh = looped.nh_offset();
    let data = looped.data_offset();
    if nh > data {
        let _ = looped.pull(nh - data);
    }
    looped.pkt_type = PktType::Loopback;
    crate::softnet::netif_rx(looped);
}

// =============================================================================
// Loopback
// =============================================================================

/// The software loopback driver: everything transmitted is received.
pub struct LoopbackDriver;

impl Driver for LoopbackDriver {
    fn hard_start_xmit(&self, mut pkt: Pkt, dev: &DeviceRef) -> Result<(), TxRefused> {
        pkt.pkt_type = PktType::Loopback;
        pkt.set_dev(dev.clone());
        crate::softnet::netif_rx(pkt);
        Ok(())
    }
}

/// Register the standard loopback interface. It owns no queue, so
/// transmit goes straight through the driver under the transmit lock.
pub fn register_loopback() -> Result<DeviceRef, NetError> {
    register_netdevice(DeviceConfig {
        name: String::from("lo"),
        driver: Box::new(LoopbackDriver),
        mtu: 65536,
        hw_addr: Vec::new(),
        flags: DevFlags::LOOPBACK,
        txqueuelen: 1,
        has_queue: false,
    })
}
