//! Garbage collection for passed file descriptors.
//!
//! A socket sent over a socket can form a cycle: each endpoint's receive
//! queue holds a packet whose file list references the other endpoint.
//! Neither queue ever drains because no user-space reference remains to
//! read from either, so the cycle would live forever. The collector finds
//! sockets reachable only through inflight files and drops their
//! fd-bearing packets, which breaks every such cycle.
//!
//! Mark phase roots: every socket whose canonical file handle has
//! references beyond its inflight count (somebody other than queued
//! packets can still read it), and every socket that was never passed as
//! a file at all. Queues of reachable sockets extend reachability through
//! the files they carry. The sweep drops fd-bearing packets of unmarked
//! sockets with inflight references; packet destructors do the unlinking.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use rill_lib::klog_debug;

use crate::pkt::Pkt;

use super::{UnixSock, all_sockets};

/// Run one collection cycle. Called opportunistically at socket release
/// whenever any file is in flight; safe to call at any time.
pub fn collect() {
    let socks = all_sockets();

    for s in &socks {
        s.gc_marked.store(false, Ordering::Release);
    }

    // Roots: reachable from outside any receive queue.
    let mut scan: Vec<Arc<UnixSock>> = Vec::new();
    for s in &socks {
        let rooted = match s.file.lock().upgrade() {
            // One reference is the upgrade in our hand; anything beyond
            // the inflight copies means user space still holds it.
            Some(file) => Arc::strong_count(&file) > file.inflight() + 1,
            // Never passed as a file: only user space can reference it.
            None => true,
        };
        if rooted && !s.gc_marked.swap(true, Ordering::AcqRel) {
            scan.push(s.clone());
        }
    }

    // Propagate reachability through queued file lists.
    while let Some(s) = scan.pop() {
        let queue = s.receive_queue.lock();
        for pkt in queue.iter() {
            let Some(cb) = pkt.cb.unix() else { continue };
            for file in cb.files() {
                if let Some(target) = file.sock()
                    && !target.gc_marked.swap(true, Ordering::AcqRel)
                {
                    scan.push(target.clone());
                }
            }
        }
    }

    // Sweep: strip fd-bearing packets from unreachable sockets.
    let mut hitlist: Vec<Pkt> = Vec::new();
    for s in &socks {
        if s.gc_marked.load(Ordering::Acquire) {
            continue;
        }
        if s.inflight.load(Ordering::Acquire) == 0 {
            continue;
        }
        let mut queue = s.receive_queue.lock();
        let mut keep = alloc::collections::VecDeque::with_capacity(queue.len());
        while let Some(pkt) = queue.pop_front() {
            let carries_fds = pkt.cb.unix().map(|cb| !cb.files().is_empty()).unwrap_or(false);
            if carries_fds {
                hitlist.push(pkt);
            } else {
                keep.push_back(pkt);
            }
        }
        *queue = keep;
    }

    if !hitlist.is_empty() {
        klog_debug!("unix gc: breaking {} orphaned fd-carrying packets", hitlist.len());
    }
    // Freed outside every queue lock; the cb destructors decrement the
    // inflight counts and may free the cycle's sockets.
    drop(hitlist);
}
