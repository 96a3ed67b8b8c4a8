//! AF_UNIX operations: send, receive, connect, accept, shutdown, release.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use rill_abi::{MsgFlags, NetError, PollMask, Shutdown, SockType, Ucred};
use rill_lib::task;

use crate::pkt::{Pkt, PktCb};

use super::scm::{ScmData, ScmFile, UNIX_TOT_INFLIGHT, UnixCb, current_creds};
use super::{PKT_OVERHEAD, UnixSock, UnixSockState, find_other, garbage, remove_socket};

/// What a receive delivered.
pub struct RecvMsg {
    pub len: usize,
    pub creds: Ucred,
    pub files: Vec<Arc<ScmFile>>,
    /// Sender's bound name, when it has one.
    pub addr: Option<Vec<u8>>,
    /// The datagram was larger than the buffer.
    pub truncated: bool,
}

impl RecvMsg {
    fn new(len: usize) -> Self {
        Self { len, creds: Ucred::default(), files: Vec::new(), addr: None, truncated: false }
    }
}

/// Largest stream chunk: keep to page-sized allocations.
const STREAM_CHUNK_MAX: usize = 4096 - 16;

/// Bounded retries when a resolved datagram peer dies under us.
const DGRAM_RESTARTS: usize = 8;

fn only_flags(flags: MsgFlags, allowed: MsgFlags) -> Result<(), NetError> {
    if flags.contains(MsgFlags::OOB) {
        return Err(NetError::NotSupp);
    }
    if !allowed.contains(flags) {
        return Err(NetError::Inval);
    }
    Ok(())
}

impl UnixSock {
    // =========================================================================
    // Allocation with write-memory accounting
    // =========================================================================

    /// Allocate a packet charged against this socket's send budget,
    /// blocking until the budget admits it (or failing `Again`).
    fn alloc_send_pkt(
        self: &Arc<Self>,
        size: usize,
        creds: Ucred,
        nonblock: bool,
    ) -> Result<Pkt, NetError> {
        let truesize = size + PKT_OVERHEAD;
        loop {
            if let Some(err) = self.take_err() {
                return Err(err);
            }
            if self.state.read().shutdown.contains(Shutdown::SND) {
                return Err(NetError::Pipe);
            }
            if self.wmem() + truesize <= self.sndbuf() {
                self.charge(truesize);
                let mut pkt = Pkt::alloc(size);
                pkt.origin = Some(self.id());
                pkt.cb = PktCb::Unix(UnixCb::new(creds, self.clone(), truesize));
                return Ok(pkt);
            }
            if nonblock {
                return Err(NetError::Again);
            }
            self.wait
                .wait_event_interruptible(|| {
                    self.wmem() + truesize <= self.sndbuf()
                        || self.has_err()
                        || self.state.read().shutdown.contains(Shutdown::SND)
                })
                .map_err(|_| NetError::Interrupted)?;
        }
    }

    // =========================================================================
    // Datagram connect
    // =========================================================================

    /// Cache a peer for datagram traffic, or clear it with an empty name
    /// (the 1003.1g disconnect).
    pub fn connect_dgram(self: &Arc<Self>, name: Option<&[u8]>) -> Result<(), NetError> {
        let other = match name {
            Some(name) => {
                if self.state.read().passcred && self.state.read().addr.is_none() {
                    self.autobind()?;
                }
                let other = find_other(name, self.ty)?;
                if !unix_may_send(self, &other) {
                    return Err(NetError::Perm);
                }
                Some(other)
            }
            None => None,
        };

        let mut st = self.state.write();
        // Reconnecting drops the old peer reference.
        st.peer = other;
        Ok(())
    }

    // =========================================================================
    // Datagram send/receive
    // =========================================================================

    pub fn send_dgram(
        self: &Arc<Self>,
        to: Option<&[u8]>,
        data: &[u8],
        flags: MsgFlags,
        scm: ScmData,
    ) -> Result<usize, NetError> {
        only_flags(flags, MsgFlags::DONTWAIT | MsgFlags::NOSIGNAL)?;
        let nonblock = flags.contains(MsgFlags::DONTWAIT);

        let mut other = match to {
            Some(_) => None,
            None => Some(self.peer_get().ok_or(NetError::NotConn)?),
        };

        if self.state.read().passcred && self.state.read().addr.is_none() {
            self.autobind()?;
        }

        let mut pkt = self.alloc_send_pkt(data.len(), scm.creds, nonblock)?;
        if !scm.files.is_empty()
            && let Some(cb) = pkt.cb.unix_mut()
        {
            cb.attach_fds(scm.files);
        }
        pkt.append(data)?;

        let mut restarts = 0;
        loop {
            let target = match other.take() {
                Some(t) => t,
                None => {
                    let Some(name) = to else { return Err(NetError::ConnReset) };
                    find_other(name, self.ty)?
                }
            };

            if !unix_may_send(self, &target) {
                return Err(NetError::Perm);
            }

            {
                let tst = target.state.read();
                if tst.dead {
                    drop(tst);
                    // The peer vanished. If it was our cached peer, drop
                    // the cache and report refusal; a named target is
                    // re-resolved a bounded number of times.
                    let mut st = self.state.write();
                    if let Some(peer) = &st.peer
                        && Arc::ptr_eq(peer, &target)
                    {
                        st.peer = None;
                        return Err(NetError::ConnRefused);
                    }
                    drop(st);
                    restarts += 1;
                    if restarts > DGRAM_RESTARTS {
                        return Err(NetError::ConnRefused);
                    }
                    continue;
                }

                if tst.shutdown.contains(Shutdown::RCV) {
                    return Err(NetError::Pipe);
                }

                if target.queue_len() >= target.backlog_cap() {
                    drop(tst);
                    if nonblock {
                        return Err(NetError::Again);
                    }
                    wait_for_peer(&target)?;
                    other = Some(target);
                    continue;
                }

                // Queued under the peer's state lock so release cannot
                // slip between the liveness check and the queue append.
                target.receive_queue.lock().push_back(pkt);
            }
            target.wait.wake_all();
            return Ok(data.len());
        }
    }

    pub fn recv_dgram(
        self: &Arc<Self>,
        buf: &mut [u8],
        flags: MsgFlags,
    ) -> Result<RecvMsg, NetError> {
        only_flags(
            flags,
            MsgFlags::DONTWAIT | MsgFlags::NOSIGNAL | MsgFlags::PEEK | MsgFlags::WAITALL,
        )?;
        let peek = flags.contains(MsgFlags::PEEK);

        let Some(mut pkt) = self.recv_datagram(flags)? else {
            return Ok(RecvMsg::new(0));
        };

        if !peek && self.queue_len() <= self.backlog_cap() / 2 {
            self.peer_wait.wake_all();
        }

        let mut msg = RecvMsg::new(buf.len().min(pkt.len()));
        msg.truncated = pkt.len() > msg.len;
        buf[..msg.len].copy_from_slice(&pkt.data()[..msg.len]);

        if let Some(cb) = pkt.cb.unix_mut() {
            msg.creds = cb.creds;
            msg.addr = cb.sk().and_then(|sk| sk.state.read().addr.clone()).map(|a| a.name.clone());
            msg.files = if peek { cb.peek_fds() } else { cb.detach_fds() };
        }

        if peek {
            self.receive_queue.lock().push_front(pkt);
        }
        Ok(msg)
    }

    /// Pop one message, blocking per flags. `Ok(None)` is end-of-stream
    /// (receive side shut down with nothing queued).
    fn recv_datagram(self: &Arc<Self>, flags: MsgFlags) -> Result<Option<Pkt>, NetError> {
        let nonblock = flags.contains(MsgFlags::DONTWAIT);
        loop {
            if let Some(pkt) = self.receive_queue.lock().pop_front() {
                return Ok(Some(pkt));
            }
            if let Some(err) = self.take_err() {
                return Err(err);
            }
            if self.state.read().shutdown.contains(Shutdown::RCV) {
                return Ok(None);
            }
            if nonblock {
                return Err(NetError::Again);
            }
            self.wait
                .wait_event_interruptible(|| {
                    self.queue_len() > 0
                        || self.has_err()
                        || self.state.read().shutdown.contains(Shutdown::RCV)
                })
                .map_err(|_| NetError::Interrupted)?;
        }
    }

    // =========================================================================
    // Stream send/receive
    // =========================================================================

    pub fn send_stream(
        self: &Arc<Self>,
        data: &[u8],
        flags: MsgFlags,
        scm: ScmData,
    ) -> Result<usize, NetError> {
        only_flags(flags, MsgFlags::DONTWAIT | MsgFlags::NOSIGNAL)?;
        let nonblock = flags.contains(MsgFlags::DONTWAIT);

        let Some(other) = self.peer_get() else { return Err(NetError::NotConn) };

        let mut files = Some(scm.files).filter(|f| !f.is_empty());
        let mut sent = 0usize;

        if self.state.read().shutdown.contains(Shutdown::SND) {
            return pipe_error(sent, flags);
        }

        while sent < data.len() {
            // Keep two messages in the pipe so it schedules better, and
            // keep to page-sized allocations.
            let mut size = data.len() - sent;
            size = size.min(self.sndbuf() / 2 - 16);
            size = size.min(STREAM_CHUNK_MAX);

            let mut pkt = match self.alloc_send_pkt(size, scm.creds, nonblock) {
                Ok(pkt) => pkt,
                Err(NetError::Pipe) => return pipe_error(sent, flags),
                Err(e) => return if sent > 0 { Ok(sent) } else { Err(e) },
            };
            if let Some(fds) = files.take()
                && let Some(cb) = pkt.cb.unix_mut()
            {
                cb.attach_fds(fds);
            }
            pkt.append(&data[sent..sent + size])?;

            {
                let tst = other.state.read();
                if tst.dead || tst.shutdown.contains(Shutdown::RCV) {
                    drop(tst);
                    drop(pkt);
                    return pipe_error(sent, flags);
                }
                other.receive_queue.lock().push_back(pkt);
            }
            other.wait.wake_all();
            sent += size;
        }
        Ok(sent)
    }

    pub fn recv_stream(
        self: &Arc<Self>,
        buf: &mut [u8],
        flags: MsgFlags,
    ) -> Result<RecvMsg, NetError> {
        only_flags(
            flags,
            MsgFlags::DONTWAIT | MsgFlags::NOSIGNAL | MsgFlags::PEEK | MsgFlags::WAITALL,
        )?;
        if self.state.read().st != UnixSockState::Established {
            return Err(NetError::Inval);
        }
        let nonblock = flags.contains(MsgFlags::DONTWAIT);
        let peek = flags.contains(MsgFlags::PEEK);
        let target = if flags.contains(MsgFlags::WAITALL) { buf.len() } else { 1 };

        let mut msg = RecvMsg::new(0);
        let mut copied = 0usize;
        let mut checked_creds = false;
        let mut err = None;

        // The read semaphore keeps concurrent readers from interleaving
        // chunks of the byte stream.
        let mut readsem = self.readsem.lock();

        while copied < buf.len() {
            let Some(mut pkt) = self.receive_queue.lock().pop_front() else {
                if copied >= target {
                    break;
                }
                // 1003.1g mandates this order: error, then shutdown.
                if let Some(e) = self.take_err() {
                    err = Some(e);
                    break;
                }
                if self.state.read().shutdown.contains(Shutdown::RCV) {
                    break;
                }
                if nonblock {
                    err = Some(NetError::Again);
                    break;
                }
                drop(readsem);
                let waited = self.wait.wait_event_interruptible(|| {
                    self.queue_len() > 0
                        || self.has_err()
                        || self.state.read().shutdown.contains(Shutdown::RCV)
                });
                if waited.is_err() {
                    return if copied > 0 { finish(msg, copied) } else { Err(NetError::Interrupted) };
                }
                readsem = self.readsem.lock();
                continue;
            };

            let creds = pkt.cb.unix().map(|cb| cb.creds).unwrap_or_default();
            if checked_creds {
                // Never glue messages from different writers.
                if creds != msg.creds {
                    self.receive_queue.lock().push_front(pkt);
                    break;
                }
            } else {
                msg.creds = creds;
                checked_creds = true;
            }

            if msg.addr.is_none() {
                msg.addr = pkt
                    .cb
                    .unix()
                    .and_then(|cb| cb.sk().cloned())
                    .and_then(|sk| sk.state.read().addr.clone())
                    .map(|a| a.name.clone());
            }

            let chunk = pkt.len().min(buf.len() - copied);
            buf[copied..copied + chunk].copy_from_slice(&pkt.data()[..chunk]);
            copied += chunk;

            if !peek {
                let _ = pkt.pull(chunk);
                let mut got_fds = false;
                if let Some(cb) = pkt.cb.unix_mut()
                    && cb.has_fds()
                {
                    msg.files = cb.detach_fds();
                    got_fds = true;
                }
                if pkt.len() > 0 {
                    // Partly consumed: the remainder goes back to the head.
                    self.receive_queue.lock().push_front(pkt);
                    break;
                }
                drop(pkt);
                if got_fds {
                    break;
                }
            } else {
                if let Some(cb) = pkt.cb.unix()
                    && cb.has_fds()
                {
                    msg.files = cb.peek_fds();
                }
                self.receive_queue.lock().push_front(pkt);
                break;
            }
        }
        drop(readsem);

        if copied == 0
            && let Some(e) = err
        {
            return Err(e);
        }
        finish(msg, copied)
    }

    // =========================================================================
    // Listen / connect / accept
    // =========================================================================

    pub fn listen(self: &Arc<Self>, backlog: usize) -> Result<(), NetError> {
        if self.ty != SockType::Stream {
            return Err(NetError::NotSupp);
        }
        if self.state.read().addr.is_none() {
            // No listens on an unbound socket.
            return Err(NetError::Inval);
        }
        let mut st = self.state.write();
        match st.st {
            UnixSockState::Unconnected | UnixSockState::Listening => {}
            UnixSockState::Established => return Err(NetError::Inval),
        }
        if backlog > self.backlog_cap() {
            self.peer_wait.wake_all();
        }
        self.set_backlog_cap(backlog);
        st.st = UnixSockState::Listening;
        // Credentials are latched now so accepted children inherit them.
        st.peercred = current_creds();
        Ok(())
    }

    pub fn connect_stream(
        self: &Arc<Self>,
        name: &[u8],
        nonblock: bool,
    ) -> Result<(), NetError> {
        if self.state.read().passcred && self.state.read().addr.is_none() {
            self.autobind()?;
        }

        // Allocate everything first; after the states are latched there is
        // no room left for failure.
        let embryo = UnixSock::new(SockType::Stream);
        let mut accept_pkt = Pkt::alloc(0);
        embryo.charge(PKT_OVERHEAD);
        accept_pkt.cb =
            PktCb::Unix(UnixCb::new(current_creds(), embryo.clone(), PKT_OVERHEAD));

        let result = (|| {
            loop {
                let other = find_other(name, self.ty)?;

                {
                    let ost = other.state.read();
                    if ost.dead {
                        // The name table overslept a death; retry.
                        continue;
                    }
                    if ost.st != UnixSockState::Listening {
                        return Err(NetError::ConnRefused);
                    }
                }

                if other.queue_len() >= other.backlog_cap() {
                    if nonblock {
                        return Err(NetError::Again);
                    }
                    wait_for_peer(&other)?;
                    continue;
                }

                // Latch our state. Self-connect and simultaneous connects
                // are excluded by state checks: `other` is listening, and
                // we re-check ourselves under the write lock.
                let st_snapshot = self.state.read().st;
                match st_snapshot {
                    UnixSockState::Unconnected => {}
                    UnixSockState::Established => return Err(NetError::IsConn),
                    UnixSockState::Listening => return Err(NetError::Inval),
                }

                {
                    let mut my = self.state.write();
                    if my.st != st_snapshot {
                        continue;
                    }

                    let ost = other.state.read();
                    if ost.dead || ost.st != UnixSockState::Listening {
                        continue;
                    }

                    // The way is open. Wire everything up.
                    {
                        let mut est = embryo.state.write();
                        est.peer = Some(self.clone());
                        est.st = UnixSockState::Established;
                        est.peercred = current_creds();
                        // The child answers getsockname with the
                        // listener's name.
                        est.addr = ost.addr.clone();
                        est.node = ost.node.clone();
                    }
                    my.peercred = ost.peercred;
                    my.peer = Some(embryo.clone());
                    my.st = UnixSockState::Established;
                }

                other.receive_queue.lock().push_back(accept_pkt);
                other.wait.wake_all();
                return Ok(());
            }
        })();

        if result.is_err() {
            embryo.release();
        }
        result
    }

    /// Take one queued connection off a listener.
    pub fn accept(self: &Arc<Self>, nonblock: bool) -> Result<Arc<UnixSock>, NetError> {
        if self.ty != SockType::Stream {
            return Err(NetError::NotSupp);
        }
        if self.state.read().st != UnixSockState::Listening {
            return Err(NetError::Inval);
        }

        let flags = if nonblock { MsgFlags::DONTWAIT } else { MsgFlags::empty() };
        let Some(mut pkt) = self.recv_datagram(flags)? else {
            return Err(NetError::Inval);
        };

        let embryo = pkt.cb.unix_mut().and_then(|cb| cb.take_sk()).ok_or(NetError::Inval)?;
        if self.queue_len() <= self.backlog_cap() / 2 {
            self.peer_wait.wake_all();
        }
        drop(pkt);
        Ok(embryo)
    }

    /// Join two fresh sockets back to back.
    pub fn socketpair(a: &Arc<Self>, b: &Arc<Self>) -> Result<(), NetError> {
        if a.ty != b.ty {
            return Err(NetError::Proto);
        }
        {
            let mut ast = a.state.write();
            ast.peer = Some(b.clone());
            if a.ty != SockType::Dgram {
                ast.st = UnixSockState::Established;
            }
        }
        {
            let mut bst = b.state.write();
            bst.peer = Some(a.clone());
            if b.ty != SockType::Dgram {
                bst.st = UnixSockState::Established;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Names
    // =========================================================================

    /// The socket's own bound name.
    pub fn getsockname(&self) -> Option<Vec<u8>> {
        self.state.read().addr.as_ref().map(|a| a.name.clone())
    }

    /// The peer's bound name; `Err(NotConn)` without a peer.
    pub fn getpeername(&self) -> Result<Option<Vec<u8>>, NetError> {
        let peer = self.peer_get().ok_or(NetError::NotConn)?;
        Ok(peer.getsockname())
    }

    // =========================================================================
    // Shutdown / release
    // =========================================================================

    pub fn shutdown(self: &Arc<Self>, how: u8) -> Result<(), NetError> {
        let mode = Shutdown::from_how(how);
        if mode.is_empty() {
            return Ok(());
        }

        let peer = {
            let mut st = self.state.write();
            st.shutdown |= mode;
            st.peer.clone()
        };
        self.wait.wake_all();
        self.peer_wait.wake_all();

        if let Some(peer) = peer
            && self.ty == SockType::Stream
        {
            // The peer loses the complementary directions.
            let mut peer_mode = Shutdown::empty();
            if mode.contains(Shutdown::RCV) {
                peer_mode |= Shutdown::SND;
            }
            if mode.contains(Shutdown::SND) {
                peer_mode |= Shutdown::RCV;
            }
            peer.state.write().shutdown |= peer_mode;
            peer.wait.wake_all();
            peer.peer_wait.wake_all();
        }
        Ok(())
    }

    /// Close the socket. Public entry for the last reference holder.
    pub fn release(self: &Arc<Self>) {
        self.release_sock(false);
    }

    fn release_sock(self: &Arc<Self>, embryo: bool) {
        remove_socket(self);

        let (old_state, peer, node) = {
            let mut st = self.state.write();
            st.dead = true;
            st.shutdown = Shutdown::MASK;
            let old = st.st;
            st.st = UnixSockState::Unconnected;
            (old, st.peer.take(), st.node.take())
        };

        self.wait.wake_all();
        self.peer_wait.wake_all();

        // Our own peer reference is gone (taken above), so the reference
        // cycle is already broken; the survivor keeps its one-way pointer
        // and observes `dead` through it.
        if let Some(peer) = peer {
            if self.ty == SockType::Stream {
                let reset = self.queue_len() > 0 || embryo;
                peer.state.write().shutdown = Shutdown::MASK;
                if reset {
                    peer.set_err(NetError::ConnReset);
                }
                peer.wait.wake_all();
                peer.peer_wait.wake_all();
            }
            drop(peer);
        }

        // Flush the queue. A dying listener recursively releases every
        // embryo still waiting to be accepted; their connectors observe a
        // reset.
        loop {
            let Some(mut pkt) = self.receive_queue.lock().pop_front() else { break };
            if old_state == UnixSockState::Listening
                && let Some(child) = pkt.cb.unix_mut().and_then(|cb| cb.take_sk())
            {
                child.release_sock(true);
            }
            drop(pkt);
        }

        drop(node);

        if UNIX_TOT_INFLIGHT.load(core::sync::atomic::Ordering::Acquire) > 0 {
            garbage::collect();
        }
    }

    // =========================================================================
    // Readiness
    // =========================================================================

    /// Poll-style readiness snapshot.
    pub fn poll_mask(&self) -> PollMask {
        let mut mask = PollMask::empty();
        let st = self.state.read();

        if self.has_err() {
            mask |= PollMask::ERR;
        }
        if st.shutdown.contains(Shutdown::RCV) {
            mask |= PollMask::HUP;
        }
        if self.queue_len() > 0 {
            mask |= PollMask::IN;
        }
        if self.ty == SockType::Stream && st.st == UnixSockState::Unconnected {
            mask |= PollMask::HUP;
        }
        // Writable also when the peer went away, so writers unblock and
        // learn about it.
        if self.writable() {
            mask |= PollMask::OUT;
        }
        mask
    }
}

fn finish(mut msg: RecvMsg, copied: usize) -> Result<RecvMsg, NetError> {
    msg.len = copied;
    Ok(msg)
}

/// Whether `sk` may send to `other`: datagram sockets refuse traffic from
/// strangers once paired.
fn unix_may_send(sk: &Arc<UnixSock>, other: &Arc<UnixSock>) -> bool {
    let ost = other.state.read();
    match &ost.peer {
        None => true,
        Some(peer) => Arc::ptr_eq(peer, sk),
    }
}

/// Park until the peer's queue has room (or it dies, shuts down, or a
/// signal arrives).
fn wait_for_peer(other: &Arc<UnixSock>) -> Result<(), NetError> {
    other
        .peer_wait
        .wait_event_interruptible(|| {
            let st = other.state.read();
            st.dead
                || st.shutdown.contains(Shutdown::RCV)
                || other.queue_len() < other.backlog_cap()
        })
        .map_err(|_| NetError::Interrupted)
}

/// Stream write hit a broken pipe: raise SIGPIPE unless suppressed, report
/// partial progress if any.
fn pipe_error(sent: usize, flags: MsgFlags) -> Result<usize, NetError> {
    if sent == 0 && !flags.contains(MsgFlags::NOSIGNAL) {
        task::send_sigpipe();
    }
    if sent > 0 { Ok(sent) } else { Err(NetError::Pipe) }
}
