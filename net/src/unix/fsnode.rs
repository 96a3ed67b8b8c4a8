//! Socket-typed filesystem nodes.
//!
//! Binding an AF_UNIX socket to a filesystem name creates a socket-typed
//! node under that path; connecting resolves the path back to the node.
//! The core has no VFS, so this is a single refcounted path→node table:
//! the node exists while someone (the bound socket, or a lookup in
//! flight) holds it, and the path frees up when the last holder lets go.
//!
//! Lookups hold the namespace lock for their duration, which serialises
//! them against concurrent binds the way the original serialised its
//! path walks under the big kernel lock.

extern crate alloc;

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use rill_abi::NetError;
use spin::Mutex;

/// A socket-typed node: an inode-like identity for one bound path.
pub struct FsNode {
    ino: u64,
}

impl FsNode {
    /// Stable inode number; the socket table hashes filesystem binds by
    /// this.
    #[inline]
    pub fn ino(&self) -> u64 {
        self.ino
    }
}

impl Drop for FsNode {
    fn drop(&mut self) {
        FS_TABLE.lock().retain(|(_, node)| node.strong_count() > 0);
    }
}

static FS_TABLE: Mutex<Vec<(String, Weak<FsNode>)>> = Mutex::new(Vec::new());
static NEXT_INO: AtomicU64 = AtomicU64::new(1);

/// Create a socket node at `path`. A live node at the same path means the
/// address is taken.
pub fn mknod_socket(path: &str) -> Result<Arc<FsNode>, NetError> {
    let mut table = FS_TABLE.lock();
    if table.iter().any(|(p, node)| p == path && node.strong_count() > 0) {
        return Err(NetError::AddrInUse);
    }
    let node = Arc::new(FsNode { ino: NEXT_INO.fetch_add(1, Ordering::Relaxed) });
    table.push((String::from(path), Arc::downgrade(&node)));
    Ok(node)
}

/// Resolve `path` to its socket node.
pub fn lookup(path: &str) -> Result<Arc<FsNode>, NetError> {
    let table = FS_TABLE.lock();
    table
        .iter()
        .find(|(p, _)| p == path)
        .and_then(|(_, node)| node.upgrade())
        .ok_or(NetError::NoEnt)
}
