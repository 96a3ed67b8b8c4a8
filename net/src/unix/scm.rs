//! Ancillary data: credentials and passed file descriptors.
//!
//! Every queued AF_UNIX message carries the sender's credentials and,
//! optionally, a list of passed files. While a file sits on a receive
//! queue it is *in flight*: its only owner may be the packet itself.
//! Inflight counts are kept per file, per target socket, and globally;
//! the global count gates the garbage collector that breaks cycles of
//! sockets kept alive solely by files queued at each other.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use rill_abi::Ucred;
use rill_lib::task;

use super::UnixSock;

/// Files currently riding AF_UNIX queues, across all sockets.
pub static UNIX_TOT_INFLIGHT: AtomicUsize = AtomicUsize::new(0);

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(1);

/// A passable file handle.
///
/// A handle either wraps an AF_UNIX socket (the interesting case: these
/// can form reference cycles through receive queues) or names some
/// unrelated file by id.
pub struct ScmFile {
    id: u64,
    sock: Option<Arc<UnixSock>>,
    inflight: AtomicUsize,
}

impl ScmFile {
    /// A handle to a non-socket file.
    pub fn plain() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed),
            sock: None,
            inflight: AtomicUsize::new(0),
        })
    }

    /// The canonical handle for a socket endpoint, created on first use.
    pub fn for_socket(sock: &Arc<UnixSock>) -> Arc<Self> {
        let mut slot = sock.file.lock();
        if let Some(existing) = slot.upgrade() {
            return existing;
        }
        let file = Arc::new(Self {
            id: NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed),
            sock: Some(sock.clone()),
            inflight: AtomicUsize::new(0),
        });
        *slot = Arc::downgrade(&file);
        file
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The socket this handle wraps, if it wraps one.
    #[inline]
    pub fn sock(&self) -> Option<&Arc<UnixSock>> {
        self.sock.as_ref()
    }

    /// How many queued packets currently carry this file.
    #[inline]
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }
}

fn mark_inflight(file: &Arc<ScmFile>) {
    file.inflight.fetch_add(1, Ordering::AcqRel);
    if let Some(sock) = &file.sock {
        sock.inflight.fetch_add(1, Ordering::AcqRel);
    }
    UNIX_TOT_INFLIGHT.fetch_add(1, Ordering::AcqRel);
}

fn mark_not_inflight(file: &Arc<ScmFile>) {
    file.inflight.fetch_sub(1, Ordering::AcqRel);
    if let Some(sock) = &file.sock {
        sock.inflight.fetch_sub(1, Ordering::AcqRel);
    }
    UNIX_TOT_INFLIGHT.fetch_sub(1, Ordering::AcqRel);
}

/// Ancillary payload handed in by a sender or out to a receiver.
pub struct ScmData {
    pub creds: Ucred,
    pub files: Vec<Arc<ScmFile>>,
}

impl ScmData {
    /// Credentials of the calling task, no files.
    pub fn from_current() -> Self {
        Self { creds: current_creds(), files: Vec::new() }
    }

    pub fn with_files(mut self, files: Vec<Arc<ScmFile>>) -> Self {
        self.files = files;
        self
    }
}

impl Default for ScmData {
    fn default() -> Self {
        Self::from_current()
    }
}

/// Credentials the calling task would stamp on a message.
pub fn current_creds() -> Ucred {
    Ucred { pid: task::current_task_id() as u32, uid: 0, gid: 0 }
}

/// Per-packet AF_UNIX state living in the packet control block.
///
/// Dropping the cb releases everything it still owns: remaining files
/// leave the inflight accounting, and the charged bytes return to the
/// owning socket's write budget (waking writers).
pub struct UnixCb {
    pub creds: Ucred,
    files: Vec<Arc<ScmFile>>,
    sk: Option<Arc<UnixSock>>,
    charged: usize,
}

impl UnixCb {
    /// Fresh cb charged against `sk`'s write memory.
    pub(crate) fn new(creds: Ucred, sk: Arc<UnixSock>, charged: usize) -> Self {
        Self { creds, files: Vec::new(), sk: Some(sk), charged }
    }

    /// Attach passed files, moving them into flight.
    pub(crate) fn attach_fds(&mut self, files: Vec<Arc<ScmFile>>) {
        for file in &files {
            mark_inflight(file);
        }
        self.files = files;
    }

    /// Detach the files for delivery, taking them out of flight.
    pub(crate) fn detach_fds(&mut self) -> Vec<Arc<ScmFile>> {
        let files = core::mem::take(&mut self.files);
        for file in &files {
            mark_not_inflight(file);
        }
        files
    }

    /// Duplicate the files without consuming them; inflight counts stay
    /// until the queued original is consumed.
    pub(crate) fn peek_fds(&self) -> Vec<Arc<ScmFile>> {
        self.files.clone()
    }

    pub(crate) fn has_fds(&self) -> bool {
        !self.files.is_empty()
    }

    /// The socket this packet is charged to (sender, or the embryo on an
    /// accept packet).
    pub(crate) fn sk(&self) -> Option<&Arc<UnixSock>> {
        self.sk.as_ref()
    }

    /// Extract the embryo from an accept packet, settling its charge.
    pub(crate) fn take_sk(&mut self) -> Option<Arc<UnixSock>> {
        let sk = self.sk.take()?;
        sk.uncharge(core::mem::take(&mut self.charged));
        Some(sk)
    }

    /// Files riding this packet, for the collector's reachability scan.
    pub(crate) fn files(&self) -> &[Arc<ScmFile>] {
        &self.files
    }
}

impl Drop for UnixCb {
    fn drop(&mut self) {
        for file in &self.files {
            mark_not_inflight(file);
        }
        self.files.clear();
        if let Some(sk) = self.sk.take() {
            sk.uncharge(self.charged);
        }
    }
}
