//! The AF_UNIX socket family.
//!
//! Stream and datagram sockets over in-memory queues. Sockets never touch
//! the device layer: a sender attaches packets directly to the receiver's
//! input queue. Names are filesystem paths (resolved through the
//! socket-node namespace) or abstract byte strings living only in the
//! socket table.
//!
//! # Locking
//!
//! The socket table rwlock is outermost; each socket's state rwlock nests
//! inside it; each receive queue's lock is innermost. Code holding a
//! socket's state lock must not take the table lock.
//!
//! Submodules: [`ops`] carries the verb implementations, [`scm`] the
//! ancillary data, [`fsnode`] the path namespace, [`garbage`] the
//! inflight-fd collector.

extern crate alloc;

pub mod fsnode;
pub mod garbage;
pub mod ops;
pub mod scm;

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use rill_abi::{NetError, Shutdown, SockType, UNIX_PATH_MAX, Ucred};
use rill_lib::WaitQueue;
use spin::{Mutex, RwLock};

use crate::pkt::Pkt;
use fsnode::FsNode;
use scm::ScmFile;

/// Socket-table bucket count; a power of two.
pub const UNIX_HASH_SIZE: usize = 256;

/// Default cap on a datagram/accept receive queue.
pub const DEFAULT_MAX_DGRAM_QLEN: usize = 10;

/// Default send-buffer budget, bytes.
pub const DEFAULT_SNDBUF: usize = 65536;

/// Accounting overhead charged per packet on top of its payload.
pub(crate) const PKT_OVERHEAD: usize = 256;

static MAX_DGRAM_QLEN: AtomicUsize = AtomicUsize::new(DEFAULT_MAX_DGRAM_QLEN);
static NEXT_SOCK_ID: AtomicU64 = AtomicU64::new(1);
static AUTOBIND_ORDERNUM: AtomicU32 = AtomicU32::new(1);

/// Change the default receive-queue cap inherited by new sockets.
pub fn set_max_dgram_qlen(qlen: usize) {
    MAX_DGRAM_QLEN.store(qlen.max(1), Ordering::Release);
}

/// Connection state of a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnixSockState {
    /// Fresh, disconnected, or fully closed.
    Unconnected,
    /// A bound stream socket accepting connections.
    Listening,
    /// A stream socket wired to a peer.
    Established,
}

/// A bound name.
pub struct UnixAddress {
    /// Raw name bytes: a leading zero byte selects the abstract namespace,
    /// anything else is a filesystem path.
    pub name: Vec<u8>,
    /// Abstract names remember their table bucket; filesystem binds store
    /// [`UNIX_HASH_SIZE`] and hash by inode instead.
    pub(crate) hash: usize,
}

impl UnixAddress {
    #[inline]
    pub fn is_abstract(&self) -> bool {
        self.hash != UNIX_HASH_SIZE
    }
}

/// Mutable socket state behind the per-socket rwlock.
pub(crate) struct UnixState {
    pub st: UnixSockState,
    pub dead: bool,
    pub shutdown: Shutdown,
    pub peer: Option<Arc<UnixSock>>,
    pub addr: Option<Arc<UnixAddress>>,
    pub node: Option<Arc<FsNode>>,
    pub passcred: bool,
    /// For a listener: the credentials accepted children will report.
    /// For an accepted child: inherited from the listener.
    pub peercred: Ucred,
}

/// An AF_UNIX socket.
pub struct UnixSock {
    id: u64,
    ty: SockType,
    pub(crate) state: RwLock<UnixState>,
    pub(crate) receive_queue: Mutex<VecDeque<Pkt>>,
    /// Data-ready and write-space waiters.
    pub(crate) wait: WaitQueue,
    /// Senders blocked on a full peer queue; connectors blocked on a full
    /// accept backlog.
    pub(crate) peer_wait: WaitQueue,
    /// Serialises stream readers so chunks cannot interleave.
    pub(crate) readsem: Mutex<()>,
    sndbuf: AtomicUsize,
    wmem: AtomicUsize,
    err: AtomicI32,
    max_ack_backlog: AtomicUsize,
    /// Bucket this socket is hashed in; `usize::MAX` when unhashed.
    hash_slot: AtomicUsize,
    /// Inflight fds referring to this socket.
    pub(crate) inflight: AtomicUsize,
    /// Canonical passable handle, created on first send of this socket.
    pub(crate) file: Mutex<Weak<ScmFile>>,
    /// Collector scratch.
    pub(crate) gc_marked: core::sync::atomic::AtomicBool,
}

const UNHASHED: usize = usize::MAX;

/// The unbound list lives in the extra bucket past the hash space.
const UNBOUND_SLOT: usize = UNIX_HASH_SIZE;

pub(crate) struct UnixTable {
    buckets: [Vec<Arc<UnixSock>>; UNIX_HASH_SIZE + 1],
}

static TABLE: RwLock<UnixTable> =
    RwLock::new(UnixTable { buckets: [const { Vec::new() }; UNIX_HASH_SIZE + 1] });

impl UnixSock {
    /// Allocate a socket and list it among the unbound.
    pub fn new(ty: SockType) -> Arc<Self> {
        let sock = Arc::new(Self {
            id: NEXT_SOCK_ID.fetch_add(1, Ordering::Relaxed),
            ty,
            state: RwLock::new(UnixState {
                st: UnixSockState::Unconnected,
                dead: false,
                shutdown: Shutdown::empty(),
                peer: None,
                addr: None,
                node: None,
                passcred: false,
                peercred: Ucred::default(),
            }),
            receive_queue: Mutex::new(VecDeque::new()),
            wait: WaitQueue::new(),
            peer_wait: WaitQueue::new(),
            readsem: Mutex::new(()),
            sndbuf: AtomicUsize::new(DEFAULT_SNDBUF),
            wmem: AtomicUsize::new(0),
            err: AtomicI32::new(0),
            max_ack_backlog: AtomicUsize::new(MAX_DGRAM_QLEN.load(Ordering::Acquire)),
            hash_slot: AtomicUsize::new(UNHASHED),
            inflight: AtomicUsize::new(0),
            file: Mutex::new(Weak::new()),
            gc_marked: core::sync::atomic::AtomicBool::new(false),
        });
        insert_socket(UNBOUND_SLOT, &sock);
        sock
    }

    /// Stable identity, usable as an origin token on packets.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn sock_type(&self) -> SockType {
        self.ty
    }

    pub fn set_passcred(&self, on: bool) {
        self.state.write().passcred = on;
    }

    pub fn set_sndbuf(&self, bytes: usize) {
        self.sndbuf.store(bytes.max(PKT_OVERHEAD * 2), Ordering::Release);
        self.wait.wake_all();
    }

    pub fn sndbuf(&self) -> usize {
        self.sndbuf.load(Ordering::Acquire)
    }

    pub fn set_backlog_cap(&self, qlen: usize) {
        self.max_ack_backlog.store(qlen.max(1), Ordering::Release);
    }

    pub(crate) fn backlog_cap(&self) -> usize {
        self.max_ack_backlog.load(Ordering::Acquire)
    }

    /// Bytes currently charged against the send budget.
    pub fn wmem(&self) -> usize {
        self.wmem.load(Ordering::Acquire)
    }

    /// A writer is writable while charged memory times four fits the
    /// budget.
    pub fn writable(&self) -> bool {
        (self.wmem() << 2) <= self.sndbuf()
    }

    pub(crate) fn charge(&self, bytes: usize) {
        self.wmem.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn uncharge(&self, bytes: usize) {
        if bytes > 0 {
            self.wmem.fetch_sub(bytes, Ordering::AcqRel);
            // Write space opened up.
            self.wait.wake_all();
        }
    }

    pub(crate) fn set_err(&self, err: NetError) {
        self.err.store(err.to_errno(), Ordering::Release);
        self.wait.wake_all();
    }

    /// Consume a pending asynchronous error.
    pub(crate) fn take_err(&self) -> Option<NetError> {
        let raw = self.err.swap(0, Ordering::AcqRel);
        NetError::from_errno(raw)
    }

    /// Peek whether an asynchronous error is pending.
    pub(crate) fn has_err(&self) -> bool {
        self.err.load(Ordering::Acquire) != 0
    }

    /// Queued receive bytes of the head message; 0 when empty.
    pub fn inq_len(&self) -> usize {
        self.receive_queue.lock().front().map(|p| p.len()).unwrap_or(0)
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.receive_queue.lock().len()
    }

    pub(crate) fn peer_get(&self) -> Option<Arc<UnixSock>> {
        self.state.read().peer.clone()
    }
}

impl core::fmt::Debug for UnixSock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "UnixSock(id={}, {:?})", self.id, self.ty)
    }
}

// =============================================================================
// Table maintenance
// =============================================================================

pub(crate) fn insert_socket(slot: usize, sock: &Arc<UnixSock>) {
    let mut table = TABLE.write();
    remove_socket_locked(&mut table, sock);
    table.buckets[slot].push(sock.clone());
    sock.hash_slot.store(slot, Ordering::Release);
}

pub(crate) fn remove_socket(sock: &Arc<UnixSock>) {
    let mut table = TABLE.write();
    remove_socket_locked(&mut table, sock);
}

fn remove_socket_locked(table: &mut UnixTable, sock: &Arc<UnixSock>) {
    let slot = sock.hash_slot.swap(UNHASHED, Ordering::AcqRel);
    if slot != UNHASHED {
        table.buckets[slot].retain(|s| !Arc::ptr_eq(s, sock));
    }
}

/// Atomically re-hash `sock` into `slot` unless `name` is already taken
/// there. The check and the insert share one writer section, so two racing
/// binds cannot claim the same name.
fn try_insert_named(slot: usize, sock: &Arc<UnixSock>, name: &[u8], ty: SockType) -> bool {
    let mut table = TABLE.write();
    if find_by_name_locked(&table, name, ty, slot).is_some() {
        return false;
    }
    remove_socket_locked(&mut table, sock);
    table.buckets[slot].push(sock.clone());
    sock.hash_slot.store(slot, Ordering::Release);
    true
}

/// Snapshot of every listed socket, for the collector.
pub(crate) fn all_sockets() -> Vec<Arc<UnixSock>> {
    let table = TABLE.read();
    table.buckets.iter().flatten().cloned().collect()
}

// =============================================================================
// Naming
// =============================================================================

/// A parsed socket name.
pub(crate) enum UnixName {
    /// Filesystem path (UTF-8, no interior NUL).
    Fs(alloc::string::String),
    /// Abstract name: raw bytes including the leading zero.
    Abstract(Vec<u8>),
}

/// Validate a name: non-empty, bounded, filesystem names terminated at
/// the first NUL.
pub(crate) fn mkname(name: &[u8]) -> Result<UnixName, NetError> {
    if name.is_empty() || name.len() > UNIX_PATH_MAX {
        return Err(NetError::Inval);
    }
    if name[0] != 0 {
        let path = match name.iter().position(|&b| b == 0) {
            Some(nul) => &name[..nul],
            None => name,
        };
        let path = core::str::from_utf8(path).map_err(|_| NetError::Inval)?;
        if path.is_empty() {
            return Err(NetError::Inval);
        }
        Ok(UnixName::Fs(alloc::string::String::from(path)))
    } else {
        Ok(UnixName::Abstract(name.to_vec()))
    }
}

/// One's-complement style sum over the name bytes, folded into the bucket
/// space.
pub(crate) fn hash_name(name: &[u8]) -> usize {
    let mut sum = 0u32;
    let mut i = 0;
    while i + 1 < name.len() {
        sum = sum.wrapping_add(u16::from_be_bytes([name[i], name[i + 1]]) as u32);
        i += 2;
    }
    if i < name.len() {
        sum = sum.wrapping_add((name[i] as u32) << 8);
    }
    let mut hash = sum;
    hash ^= hash >> 16;
    hash ^= hash >> 8;
    (hash as usize) & (UNIX_HASH_SIZE - 1)
}

/// Bucket of an abstract name of a given socket type.
pub(crate) fn abstract_bucket(name: &[u8], ty: SockType) -> usize {
    hash_name(name) ^ ty.as_hash_salt()
}

fn find_by_name_locked(
    table: &UnixTable,
    name: &[u8],
    ty: SockType,
    bucket: usize,
) -> Option<Arc<UnixSock>> {
    table.buckets[bucket]
        .iter()
        .find(|s| {
            s.ty == ty
                && s.state
                    .read()
                    .addr
                    .as_ref()
                    .map(|a| a.name.as_slice() == name)
                    .unwrap_or(false)
        })
        .cloned()
}

fn find_by_ino(table: &UnixTable, ino: u64, ty: SockType) -> Option<Arc<UnixSock>> {
    let bucket = (ino as usize) & (UNIX_HASH_SIZE - 1);
    table.buckets[bucket]
        .iter()
        .find(|s| {
            s.ty == ty
                && s.state
                    .read()
                    .node
                    .as_ref()
                    .map(|n| n.ino() == ino)
                    .unwrap_or(false)
        })
        .cloned()
}

/// Resolve a name to the socket bound to it.
///
/// Filesystem names resolve through the node namespace and must match the
/// socket type exactly ([`NetError::Proto`] otherwise); a resolvable name
/// with no listening/bound socket behind it refuses the connection.
pub(crate) fn find_other(name: &[u8], ty: SockType) -> Result<Arc<UnixSock>, NetError> {
    match mkname(name)? {
        UnixName::Fs(path) => {
            let node = fsnode::lookup(&path)?;
            let table = TABLE.read();
            // Type mismatch is detected against any-type binds first.
            let ino = node.ino();
            let bucket = (ino as usize) & (UNIX_HASH_SIZE - 1);
            let any = table.buckets[bucket].iter().find(|s| {
                s.state
                    .read()
                    .node
                    .as_ref()
                    .map(|n| n.ino() == ino)
                    .unwrap_or(false)
            });
            match any {
                Some(s) if s.ty != ty => Err(NetError::Proto),
                Some(_) => find_by_ino(&table, ino, ty).ok_or(NetError::ConnRefused),
                None => Err(NetError::ConnRefused),
            }
        }
        UnixName::Abstract(raw) => {
            let bucket = abstract_bucket(&raw, ty);
            let table = TABLE.read();
            find_by_name_locked(&table, &raw, ty, bucket).ok_or(NetError::ConnRefused)
        }
    }
}

// =============================================================================
// Binding
// =============================================================================

impl UnixSock {
    /// Bind to a name. An empty name requests auto-bind. A socket binds at
    /// most once.
    pub fn bind(self: &Arc<Self>, name: &[u8]) -> Result<(), NetError> {
        if name.is_empty() {
            return self.autobind();
        }

        let parsed = mkname(name)?;
        let _read_guard = self.readsem.lock();

        if self.state.read().addr.is_some() {
            return Err(NetError::Inval);
        }

        match parsed {
            UnixName::Fs(path) => {
                let node = fsnode::mknod_socket(&path)?;
                let addr = Arc::new(UnixAddress {
                    name: path.as_bytes().to_vec(),
                    hash: UNIX_HASH_SIZE,
                });
                let slot = (node.ino() as usize) & (UNIX_HASH_SIZE - 1);
                {
                    let mut st = self.state.write();
                    st.addr = Some(addr);
                    st.node = Some(node);
                }
                insert_socket(slot, self);
                Ok(())
            }
            UnixName::Abstract(raw) => {
                let bucket = abstract_bucket(&raw, self.ty);
                let addr = Arc::new(UnixAddress { name: raw.clone(), hash: bucket });
                self.state.write().addr = Some(addr);
                if !try_insert_named(bucket, self, &raw, self.ty) {
                    self.state.write().addr = None;
                    return Err(NetError::AddrInUse);
                }
                Ok(())
            }
        }
    }

    /// Pick sequential five-hex-digit abstract names until one is free.
    pub fn autobind(self: &Arc<Self>) -> Result<(), NetError> {
        let _read_guard = self.readsem.lock();

        if self.state.read().addr.is_some() {
            return Ok(());
        }

        for _ in 0..0x100000u32 {
            let ordernum = AUTOBIND_ORDERNUM.fetch_add(1, Ordering::Relaxed) & 0xFFFFF;
            let mut raw = Vec::with_capacity(6);
            raw.push(0u8);
            raw.extend_from_slice(format_hex5(ordernum).as_slice());

            let bucket = abstract_bucket(&raw, self.ty);
            let addr = Arc::new(UnixAddress { name: raw.clone(), hash: bucket });
            self.state.write().addr = Some(addr);
            if !try_insert_named(bucket, self, &raw, self.ty) {
                self.state.write().addr = None;
                continue;
            }
            return Ok(());
        }
        Err(NetError::AddrNotAvail)
    }
}

/// Five lowercase hex digits, zero padded.
fn format_hex5(n: u32) -> [u8; 5] {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = [b'0'; 5];
    let mut n = n & 0xFFFFF;
    let mut i = 5;
    while n > 0 {
        i -= 1;
        out[i] = DIGITS[(n & 0xF) as usize];
        n >>= 4;
    }
    out
}
