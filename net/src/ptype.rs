//! Packet-type registry: protocol handlers and taps.
//!
//! Receive handlers register against an ethertype and land in a 16-way
//! hashed chain; registering against [`ETH_P_ALL`](crate::types::ETH_P_ALL)
//! makes the entry a *tap* on the linear all-frames chain. Taps are walked
//! before the hashed chains — a tap may mutate its copy, and later
//! consumers must never see the mangled bytes, so taps always come first.
//!
//! Registration takes the registry writer lock; the hot paths take it as
//! readers.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use rill_lib::{clock, klog_debug, klog_warn};
use spin::RwLock;

use crate::dev::DeviceRef;
use crate::pkt::Pkt;
use crate::types::{ETH_P_ALL, PTYPE_HASH_SIZE, PktType};

/// A receive handler.
pub trait PacketHandler: Send + Sync {
    fn receive(&self, pkt: Pkt, dev: &DeviceRef);

    /// Identity of the socket owning this entry, if it is a raw-packet
    /// socket. Outgoing frames are never delivered back to their
    /// originating socket, and a device with socket-owned entries is
    /// ineligible for fast paths that skip softirq processing.
    fn owner_token(&self) -> Option<u64> {
        None
    }
}

/// Handle returned by [`add_pack`], consumed by [`remove_pack`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PtypeId(u64);

pub(crate) struct PtypeEntry {
    pub proto: u16,
    pub dev: Option<DeviceRef>,
    pub handler: Arc<dyn PacketHandler>,
    id: PtypeId,
}

impl PtypeEntry {
    /// Does this entry accept frames from `dev`?
    pub fn matches_dev(&self, dev: &DeviceRef) -> bool {
        match &self.dev {
            None => true,
            Some(filter) => filter.ifindex() == dev.ifindex(),
        }
    }
}

pub(crate) struct PtypeTable {
    pub base: [Vec<PtypeEntry>; PTYPE_HASH_SIZE],
    pub all: Vec<PtypeEntry>,
}

static PTYPE: RwLock<PtypeTable> = RwLock::new(PtypeTable {
    base: [const { Vec::new() }; PTYPE_HASH_SIZE],
    all: Vec::new(),
});

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static NTAPS: AtomicUsize = AtomicUsize::new(0);
static FASTROUTE_OBSTACLES: AtomicUsize = AtomicUsize::new(0);

#[inline]
fn bucket(proto: u16) -> usize {
    (proto & 0xF) as usize
}

/// Number of registered taps. The transmit path consults this to decide
/// whether outgoing packets need duplicating at all.
#[inline]
pub fn ntaps() -> usize {
    NTAPS.load(Ordering::Acquire)
}

/// Number of socket-owned entries; non-zero disables receive fast paths.
#[inline]
pub fn fastroute_obstacles() -> usize {
    FASTROUTE_OBSTACLES.load(Ordering::Acquire)
}

/// Register a protocol handler. `ETH_P_ALL` registers a tap; a `dev`
/// filter restricts delivery to frames from that device.
pub fn add_pack(
    proto: u16,
    dev: Option<DeviceRef>,
    handler: Arc<dyn PacketHandler>,
) -> PtypeId {
    let id = PtypeId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
    if handler.owner_token().is_some() {
        FASTROUTE_OBSTACLES.fetch_add(1, Ordering::AcqRel);
    }
    let entry = PtypeEntry { proto, dev, handler, id };
    let mut table = PTYPE.write();
    if proto == ETH_P_ALL {
        NTAPS.fetch_add(1, Ordering::AcqRel);
        table.all.push(entry);
    } else {
        let h = bucket(proto);
        table.base[h].push(entry);
    }
    id
}

/// Remove a previously registered handler.
pub fn remove_pack(id: PtypeId) {
    let mut table = PTYPE.write();
    let mut removed = None;
    if let Some(pos) = table.all.iter().position(|e| e.id == id) {
        NTAPS.fetch_sub(1, Ordering::AcqRel);
        removed = Some(table.all.remove(pos));
    } else {
        for chain in table.base.iter_mut() {
            if let Some(pos) = chain.iter().position(|e| e.id == id) {
                removed = Some(chain.remove(pos));
                break;
            }
        }
    }
    drop(table);
    match removed {
        Some(entry) => {
            if entry.handler.owner_token().is_some() {
                FASTROUTE_OBSTACLES.fetch_sub(1, Ordering::AcqRel);
            }
        }
        None => klog_warn!("ptype: remove_pack({:?}) not found", id),
    }
}

/// Duplicate an outgoing frame to every matching tap.
///
/// The packet is timestamped here. Each tap gets its own logical copy with
/// the mac marker reset to the current payload start; a network-header
/// marker outside the payload is repaired (and the buggy protocol logged)
/// before delivery.
pub fn send_to_taps(pkt: &mut Pkt, dev: &DeviceRef) {
    pkt.timestamp = clock::ticks();

    let taps: Vec<Arc<dyn PacketHandler>> = {
        let table = PTYPE.read();
        table
            .all
            .iter()
            .filter(|e| e.matches_dev(dev))
            .filter(|e| {
                match (e.handler.owner_token(), pkt.origin) {
                    (Some(owner), Some(origin)) => owner != origin,
                    _ => true,
                }
            })
            .map(|e| e.handler.clone())
            .collect()
    };

    for tap in taps {
        let mut copy = pkt.clone_shared();
        copy.set_mac(copy.data_offset());
        let nh = copy.nh_offset();
        if nh < copy.data_offset() || nh >= copy.tail_offset() {
            klog_debug!(
                "ptype: protocol {:04x} is buggy, dev {}",
                copy.protocol,
                dev.name()
            );
            let fixed = copy.data_offset() + dev.driver().hard_header_len();
            copy.set_nh(fixed);
        }
        copy.set_th(copy.nh_offset());
        copy.pkt_type = PktType::Outgoing;
        tap.receive(copy, dev);
    }
}

/// Collect the handlers a received frame must reach, taps first, then the
/// hashed chain for its protocol. Used by the input softirq.
pub(crate) fn matches_for(pkt: &Pkt, dev: &DeviceRef) -> Vec<Arc<dyn PacketHandler>> {
    let table = PTYPE.read();
    let mut out: Vec<Arc<dyn PacketHandler>> = Vec::new();
    for entry in table.all.iter() {
        if entry.matches_dev(dev) {
            out.push(entry.handler.clone());
        }
    }
    for entry in table.base[bucket(pkt.protocol)].iter() {
        if entry.proto == pkt.protocol && entry.matches_dev(dev) {
            out.push(entry.handler.clone());
        }
    }
    out
}
