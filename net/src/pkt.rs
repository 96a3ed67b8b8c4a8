//! Packet buffer.
//!
//! `Pkt` is the single currency every subsystem exchanges: a byte buffer
//! with reserved headroom, layer-offset markers, and per-packet metadata.
//!
//! # Layout
//!
//! ```text
//! |<-- headroom -->|<-- payload (data..tail) -->|<-- tailroom -->|
//! 0             data                         tail              end
//! ```
//!
//! * TX path: [`alloc`](Pkt::alloc) + [`reserve`](Pkt::reserve), headers are
//!   prepended with [`push`](Pkt::push), payload appended with
//!   [`append`](Pkt::append).
//! * RX path: [`from_bytes`](Pkt::from_bytes) starts with the whole frame as
//!   payload; headers are consumed with [`pull`](Pkt::pull).
//!
//! # Sharing
//!
//! The byte storage is reference-counted. [`clone_shared`](Pkt::clone_shared)
//! produces a new header over the same bytes without copying; a shared
//! packet must not be mutated until [`unshare`](Pkt::unshare) detaches it.
//! Mutating accessors detach implicitly, so the invariant cannot be broken,
//! only paid for.
//!
//! # Control block
//!
//! The owning subsystem keeps private per-packet state in [`PktCb`]. The cb
//! does not travel to clones: whoever receives a packet owns its cb and must
//! consider any previous interpretation gone.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use rill_abi::NetError;

use crate::dev::DeviceRef;
use crate::types::PktType;
use crate::unix::scm::UnixCb;

/// Per-subsystem private packet state.
///
/// Ownership of the cb transfers with the packet; a layer that hands a
/// packet on re-tags it (or leaves `None`) rather than trusting the old
/// contents.
#[derive(Default)]
pub enum PktCb {
    /// No subsystem claims the scratch area.
    #[default]
    None,
    /// AF_UNIX per-packet state: credentials, passed files, owner charge.
    Unix(UnixCb),
}

impl PktCb {
    /// The AF_UNIX view of the cb, if that is what it holds.
    pub fn unix(&self) -> Option<&UnixCb> {
        match self {
            PktCb::Unix(cb) => Some(cb),
            PktCb::None => None,
        }
    }

    /// Mutable AF_UNIX view.
    pub fn unix_mut(&mut self) -> Option<&mut UnixCb> {
        match self {
            PktCb::Unix(cb) => Some(cb),
            PktCb::None => None,
        }
    }
}

/// A network packet.
pub struct Pkt {
    storage: Arc<Vec<u8>>,
    data: usize,
    tail: usize,
    mac: usize,
    nh: usize,
    th: usize,
    /// Protocol id (ethertype) of the payload.
    pub protocol: u16,
    /// How the frame relates to this host.
    pub pkt_type: PktType,
    /// Scheduling priority; CBQ also accepts a full class handle here.
    pub priority: u32,
    /// Tick stamp of reception or tap duplication; 0 = never stamped.
    pub timestamp: u64,
    /// Identity of the originating socket, if any; taps owned by the same
    /// socket are skipped on transmit.
    pub origin: Option<u64>,
    dev: Option<DeviceRef>,
    /// Private state of the subsystem currently owning the packet.
    pub cb: PktCb,
}

impl Pkt {
    /// Allocate an empty packet with `capacity` bytes of storage.
    pub fn alloc(capacity: usize) -> Self {
        Self {
            storage: Arc::new(vec![0u8; capacity]),
            data: 0,
            tail: 0,
            mac: 0,
            nh: 0,
            th: 0,
            protocol: 0,
            pkt_type: PktType::Host,
            priority: 0,
            timestamp: 0,
            origin: None,
            dev: None,
            cb: PktCb::None,
        }
    }

    /// Allocate a packet holding a copy of `bytes`, payload spanning the
    /// whole buffer. The RX-path constructor.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut pkt = Self::alloc(bytes.len());
        pkt.tail = bytes.len();
        Arc::make_mut(&mut pkt.storage)[..bytes.len()].copy_from_slice(bytes);
        pkt
    }

    /// Total storage size (`end`).
    #[inline]
    pub fn end(&self) -> usize {
        self.storage.len()
    }

    /// Payload length (`tail - data`).
    #[inline]
    pub fn len(&self) -> usize {
        self.tail - self.data
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data == self.tail
    }

    /// Offset of the payload start within the storage.
    #[inline]
    pub fn data_offset(&self) -> usize {
        self.data
    }

    /// Offset one past the payload end.
    #[inline]
    pub fn tail_offset(&self) -> usize {
        self.tail
    }

    /// Bytes still available behind the payload.
    #[inline]
    pub fn tailroom(&self) -> usize {
        self.end() - self.tail
    }

    /// Bytes reserved in front of the payload.
    #[inline]
    pub fn headroom(&self) -> usize {
        self.data
    }

    /// Payload bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.storage[self.data..self.tail]
    }

    /// Mutable payload bytes. Detaches shared storage first.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let (data, tail) = (self.data, self.tail);
        &mut Arc::make_mut(&mut self.storage)[data..tail]
    }

    /// Shift the payload window forward to leave `n` bytes of headroom.
    /// Only legal on an empty packet.
    pub fn reserve(&mut self, n: usize) -> Result<(), NetError> {
        if !self.is_empty() || n > self.end() {
            return Err(NetError::Inval);
        }
        self.data = n;
        self.tail = n;
        Ok(())
    }

    /// Extend the payload by `n` bytes at the tail and return the new region.
    pub fn put(&mut self, n: usize) -> Result<&mut [u8], NetError> {
        if self.tailroom() < n {
            return Err(NetError::NoMemory);
        }
        let start = self.tail;
        self.tail += n;
        Ok(&mut Arc::make_mut(&mut self.storage)[start..start + n])
    }

    /// Append a copy of `src` at the tail.
    pub fn append(&mut self, src: &[u8]) -> Result<(), NetError> {
        self.put(src.len())?.copy_from_slice(src);
        Ok(())
    }

    /// Grow the payload downward into the headroom by `n` bytes and return
    /// the newly exposed region. `data` decreases, `len` increases.
    pub fn push(&mut self, n: usize) -> Result<&mut [u8], NetError> {
        if self.headroom() < n {
            return Err(NetError::NoMemory);
        }
        self.data -= n;
        let (start, end) = (self.data, self.data + n);
        Ok(&mut Arc::make_mut(&mut self.storage)[start..end])
    }

    /// Consume `n` bytes from the front of the payload, returning them.
    /// `data` increases, `len` decreases.
    pub fn pull(&mut self, n: usize) -> Result<&[u8], NetError> {
        if n > self.len() {
            return Err(NetError::Inval);
        }
        let start = self.data;
        self.data += n;
        Ok(&self.storage[start..start + n])
    }

    /// Shorten the payload to `len` bytes.
    pub fn trim(&mut self, len: usize) {
        if len < self.len() {
            self.tail = self.data + len;
        }
    }

    // -- layer markers --------------------------------------------------

    /// Record the link-header offset. Must lie in `[0, tail]`.
    #[inline]
    pub fn set_mac(&mut self, offset: usize) {
        self.mac = offset;
    }

    /// Record the network-header offset.
    #[inline]
    pub fn set_nh(&mut self, offset: usize) {
        self.nh = offset;
    }

    /// Record the transport-header offset.
    #[inline]
    pub fn set_th(&mut self, offset: usize) {
        self.th = offset;
    }

    #[inline]
    pub fn mac_offset(&self) -> usize {
        self.mac
    }

    #[inline]
    pub fn nh_offset(&self) -> usize {
        self.nh
    }

    #[inline]
    pub fn th_offset(&self) -> usize {
        self.th
    }

    // -- device backref -------------------------------------------------

    /// The device this packet was received on (or will leave through).
    #[inline]
    pub fn dev(&self) -> Option<&DeviceRef> {
        self.dev.as_ref()
    }

    #[inline]
    pub fn set_dev(&mut self, dev: DeviceRef) {
        self.dev = Some(dev);
    }

    #[inline]
    pub fn clear_dev(&mut self) {
        self.dev = None;
    }

    // -- sharing --------------------------------------------------------

    /// Number of packet headers sharing this storage.
    #[inline]
    pub fn users(&self) -> usize {
        Arc::strong_count(&self.storage)
    }

    /// Whether the byte storage is shared with another header.
    #[inline]
    pub fn is_shared(&self) -> bool {
        self.users() > 1
    }

    /// New header over the same bytes. No byte copy. The clone starts with
    /// an empty control block and no destructor obligations.
    pub fn clone_shared(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            data: self.data,
            tail: self.tail,
            mac: self.mac,
            nh: self.nh,
            th: self.th,
            protocol: self.protocol,
            pkt_type: self.pkt_type,
            priority: self.priority,
            timestamp: self.timestamp,
            origin: self.origin,
            dev: self.dev.clone(),
            cb: PktCb::None,
        }
    }

    /// Detach from shared storage by copying the bytes. After this the
    /// share count is 1 and mutation is free.
    pub fn unshare(&mut self) {
        let _ = Arc::make_mut(&mut self.storage);
    }
}

impl fmt::Debug for Pkt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pkt {{ len={}, data={}, tail={}, end={}, proto=0x{:04x}, type={:?}, users={} }}",
            self.len(),
            self.data,
            self.tail,
            self.end(),
            self.protocol,
            self.pkt_type,
            self.users()
        )
    }
}
