//! AF_UNIX tests: binding and lookup, datagram and stream transfer,
//! connection establishment, EOF/reset semantics, credential boundaries,
//! fd passing and the inflight collector.
//!
//! Everything here runs non-blocking; the host integration tests cover
//! the sleeping paths with real threads.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use rill_abi::{MsgFlags, NetError, SockType, Ucred};
use rill_lib::testing::TestResult;
use rill_lib::{assert_eq_test, assert_test, fail, pass, run_test};

use crate::unix::scm::{ScmData, ScmFile, UNIX_TOT_INFLIGHT};
use crate::unix::{UnixSock, find_other, garbage};

fn creds(uid: u32) -> Ucred {
    Ucred { pid: 1, uid, gid: uid }
}

fn scm(uid: u32) -> ScmData {
    ScmData { creds: creds(uid), files: Vec::new() }
}

const NB: MsgFlags = MsgFlags::DONTWAIT;

/// Establish a connected stream pair through a throwaway listener.
fn stream_pair(tag: &[u8]) -> Result<(Arc<UnixSock>, Arc<UnixSock>), NetError> {
    let mut name = vec![0u8];
    name.extend_from_slice(tag);

    let listener = UnixSock::new(SockType::Stream);
    listener.bind(&name)?;
    listener.listen(4)?;

    let client = UnixSock::new(SockType::Stream);
    client.connect_stream(&name, true)?;
    let accepted = listener.accept(true)?;
    listener.release();
    Ok((client, accepted))
}

/// S5: back-to-back auto-binds yield distinct abstract names, both
/// resolvable.
pub fn test_autobind_distinct_names() -> TestResult {
    let a = UnixSock::new(SockType::Dgram);
    let b = UnixSock::new(SockType::Dgram);
    assert_test!(a.bind(&[]).is_ok(), "first autobind");
    assert_test!(b.bind(&[]).is_ok(), "second autobind");

    let (Some(na), Some(nb)) = (a.getsockname(), b.getsockname()) else {
        return fail!("autobound sockets have names");
    };
    assert_eq_test!(na.len(), 6, "five hex digits behind the leading zero");
    assert_eq_test!(na[0], 0, "autobind goes to the abstract namespace");
    assert_test!(na != nb, "names are distinct");

    assert_test!(find_other(&na, SockType::Dgram).is_ok(), "first name resolves");
    assert_test!(find_other(&nb, SockType::Dgram).is_ok(), "second name resolves");

    a.release();
    b.release();
    pass!()
}

/// Abstract bind collisions are refused; rebinding a bound socket too.
pub fn test_bind_collisions() -> TestResult {
    let name = b"\0rill-bind-test".to_vec();
    let a = UnixSock::new(SockType::Dgram);
    let b = UnixSock::new(SockType::Dgram);

    assert_test!(a.bind(&name).is_ok(), "first bind");
    assert_eq_test!(b.bind(&name), Err(NetError::AddrInUse), "duplicate name refused");
    assert_eq_test!(a.bind(b"\0other"), Err(NetError::Inval), "rebinding refused");

    // The same name is free for the other socket type.
    let c = UnixSock::new(SockType::Stream);
    assert_test!(c.bind(&name).is_ok(), "type salts the hash");

    a.release();
    b.release();
    c.release();
    pass!()
}

/// Filesystem binds create socket nodes; mismatched types are
/// `EPROTOTYPE`, absent paths `ENOENT`.
pub fn test_filesystem_bind_and_lookup() -> TestResult {
    let path = b"/tmp/rill-sock-test".to_vec();
    let a = UnixSock::new(SockType::Dgram);
    assert_test!(a.bind(&path).is_ok(), "filesystem bind");

    let b = UnixSock::new(SockType::Dgram);
    assert_eq_test!(b.bind(&path), Err(NetError::AddrInUse), "path taken");

    assert_test!(find_other(&path, SockType::Dgram).is_ok(), "path resolves");
    assert_eq_test!(
        find_other(&path, SockType::Stream).err(),
        Some(NetError::Proto),
        "type mismatch on a path"
    );
    assert_eq_test!(
        find_other(b"/tmp/rill-no-such", SockType::Dgram).err(),
        Some(NetError::NoEnt),
        "unknown path"
    );

    a.release();
    b.release();
    // The node died with its socket; the path is free again.
    let c = UnixSock::new(SockType::Dgram);
    assert_test!(c.bind(&path).is_ok(), "path reusable after release");
    c.release();
    pass!()
}

/// Datagram delivery with sender address and boundaries preserved.
pub fn test_dgram_roundtrip() -> TestResult {
    let name = b"\0rill-dgram-rt".to_vec();
    let rx = UnixSock::new(SockType::Dgram);
    assert_test!(rx.bind(&name).is_ok());

    let tx = UnixSock::new(SockType::Dgram);
    assert_test!(tx.bind(&[]).is_ok(), "sender autobinds");
    assert_eq_test!(tx.send_dgram(Some(&name), b"hello", NB, scm(7)), Ok(5));
    assert_eq_test!(tx.send_dgram(Some(&name), b"world!", NB, scm(7)), Ok(6));

    let mut buf = [0u8; 16];
    let msg = match rx.recv_dgram(&mut buf, NB) {
        Ok(m) => m,
        Err(_) => return fail!("first datagram"),
    };
    assert_eq_test!(&buf[..msg.len], b"hello", "boundaries preserved");
    assert_eq_test!(msg.creds.uid, 7, "credentials stamped");
    assert_eq_test!(msg.addr, tx.getsockname(), "sender address attached");

    let msg2 = match rx.recv_dgram(&mut buf, NB) {
        Ok(m) => m,
        Err(_) => return fail!("second datagram"),
    };
    assert_eq_test!(&buf[..msg2.len], b"world!");

    assert_eq_test!(rx.recv_dgram(&mut buf, NB).err(), Some(NetError::Again), "queue empty");

    tx.release();
    rx.release();
    pass!()
}

/// Truncation reports `TRUNC` and drops the tail; `PEEK` leaves the
/// message queued.
pub fn test_dgram_trunc_and_peek() -> TestResult {
    let name = b"\0rill-dgram-tp".to_vec();
    let rx = UnixSock::new(SockType::Dgram);
    assert_test!(rx.bind(&name).is_ok());
    let tx = UnixSock::new(SockType::Dgram);
    assert_eq_test!(tx.send_dgram(Some(&name), b"0123456789", NB, scm(0)), Ok(10));

    let mut small = [0u8; 4];
    let peeked = match rx.recv_dgram(&mut small, NB | MsgFlags::PEEK) {
        Ok(m) => m,
        Err(_) => return fail!("peek"),
    };
    assert_test!(peeked.truncated, "peek reports truncation");
    assert_eq_test!(&small[..], b"0123", "peek copies the head");
    assert_eq_test!(rx.inq_len(), 10, "peek leaves the datagram queued");

    let mut buf = [0u8; 4];
    let msg = match rx.recv_dgram(&mut buf, NB) {
        Ok(m) => m,
        Err(_) => return fail!("recv"),
    };
    assert_test!(msg.truncated, "short buffer truncates");
    assert_eq_test!(msg.len, 4);
    assert_eq_test!(rx.inq_len(), 0, "consumed despite truncation");

    tx.release();
    rx.release();
    pass!()
}

/// Dgram connect caches a peer; `unix_may_send` rejects strangers once
/// the target is paired elsewhere.
pub fn test_dgram_connect_and_pairing() -> TestResult {
    let a = UnixSock::new(SockType::Dgram);
    let b = UnixSock::new(SockType::Dgram);
    assert_test!(UnixSock::socketpair(&a, &b).is_ok(), "socketpair");

    assert_eq_test!(a.send_dgram(None, b"x", NB, scm(0)), Ok(1));
    let mut buf = [0u8; 4];
    assert_test!(b.recv_dgram(&mut buf, NB).is_ok());

    // A stranger may not send to the paired b.
    let name = b"\0rill-paired".to_vec();
    assert_test!(b.bind(&name).is_ok());
    let stranger = UnixSock::new(SockType::Dgram);
    assert_eq_test!(
        stranger.send_dgram(Some(&name), b"y", NB, scm(0)),
        Err(NetError::Perm),
        "pairing rejects strangers"
    );

    // Unconnected send without a destination is `NotConn`.
    assert_eq_test!(
        stranger.send_dgram(None, b"y", NB, scm(0)),
        Err(NetError::NotConn)
    );

    stranger.release();
    a.release();
    b.release();
    pass!()
}

/// S6: listener backlog gates simultaneous connects; an accept reopens
/// the door.
pub fn test_stream_backlog() -> TestResult {
    let name = b"\0rill-backlog".to_vec();
    let listener = UnixSock::new(SockType::Stream);
    assert_test!(listener.bind(&name).is_ok());
    assert_test!(listener.listen(2).is_ok());

    let c1 = UnixSock::new(SockType::Stream);
    let c2 = UnixSock::new(SockType::Stream);
    let c3 = UnixSock::new(SockType::Stream);
    assert_eq_test!(c1.connect_stream(&name, true), Ok(()), "first connect");
    assert_eq_test!(c2.connect_stream(&name, true), Ok(()), "second connect");
    assert_eq_test!(
        c3.connect_stream(&name, true),
        Err(NetError::Again),
        "backlog full"
    );

    let accepted = match listener.accept(true) {
        Ok(s) => s,
        Err(_) => return fail!("accept"),
    };
    assert_eq_test!(c3.connect_stream(&name, true), Ok(()), "slot freed by accept");

    // Repeat connect on an established socket is refused.
    assert_eq_test!(c1.connect_stream(&name, true), Err(NetError::IsConn));

    accepted.release();
    c1.release();
    c2.release();
    c3.release();
    listener.release();
    pass!()
}

/// The accepted child reports the listener's name and credentials.
pub fn test_accept_inherits_name_and_creds() -> TestResult {
    let name = b"\0rill-inherit".to_vec();
    let listener = UnixSock::new(SockType::Stream);
    assert_test!(listener.bind(&name).is_ok());
    assert_test!(listener.listen(2).is_ok());

    let client = UnixSock::new(SockType::Stream);
    assert_test!(client.connect_stream(&name, true).is_ok());
    let child = match listener.accept(true) {
        Ok(s) => s,
        Err(_) => return fail!("accept"),
    };

    assert_eq_test!(child.getsockname(), Some(name.clone()), "child carries the name");
    assert_eq_test!(
        client.getpeername().ok().flatten(),
        Some(name),
        "peer name resolves through the child"
    );

    child.release();
    client.release();
    listener.release();
    pass!()
}

/// Stream bytes flow; zero-byte reads signal EOF after shutdown.
pub fn test_stream_transfer_and_shutdown() -> TestResult {
    let Ok((client, server)) = stream_pair(b"rill-xfer") else {
        return fail!("pair setup");
    };

    assert_eq_test!(client.send_stream(b"abcdef", NB, scm(0)), Ok(6));
    let mut buf = [0u8; 3];
    let msg = match server.recv_stream(&mut buf, NB) {
        Ok(m) => m,
        Err(_) => return fail!("partial read"),
    };
    assert_eq_test!(msg.len, 3, "short read");
    assert_eq_test!(&buf[..], b"abc");

    let mut rest = [0u8; 8];
    let msg2 = match server.recv_stream(&mut rest, NB) {
        Ok(m) => m,
        Err(_) => return fail!("remainder read"),
    };
    assert_eq_test!(msg2.len, 3, "remainder delivered from the queue head");
    assert_eq_test!(&rest[..3], b"def");

    // Shutdown write side: the peer reads EOF, further writes break.
    assert_test!(client.shutdown(1).is_ok(), "SHUT_WR");
    let eof = match server.recv_stream(&mut rest, NB) {
        Ok(m) => m,
        Err(_) => return fail!("eof read"),
    };
    assert_eq_test!(eof.len, 0, "clean EOF");
    assert_eq_test!(
        client.send_stream(b"zz", NB | MsgFlags::NOSIGNAL, scm(0)),
        Err(NetError::Pipe),
        "write after shutdown"
    );

    client.release();
    server.release();
    pass!()
}

/// P5: a peer closing with an empty queue reads as EOF; closing with
/// data queued (or as an unaccepted embryo) reads as reset.
pub fn test_close_eof_and_reset() -> TestResult {
    // Clean close: EOF.
    let Ok((a, b)) = stream_pair(b"rill-eof") else { return fail!("pair setup") };
    b.release();
    let mut buf = [0u8; 8];
    let eof = match a.recv_stream(&mut buf, NB) {
        Ok(m) => m,
        Err(e) => return fail!("expected EOF, got {:?}", e),
    };
    assert_eq_test!(eof.len, 0, "clean close reads as EOF");
    a.release();

    // Close with data queued at the dying socket: reset.
    let Ok((a, b)) = stream_pair(b"rill-rst") else { return fail!("pair setup") };
    assert_eq_test!(a.send_stream(b"pending", NB, scm(0)), Ok(7));
    b.release();
    assert_eq_test!(
        a.recv_stream(&mut buf, NB).err(),
        Some(NetError::ConnReset),
        "dirty close reads as reset"
    );
    a.release();

    // Listener dies with an unaccepted embryo: the connector resets.
    let name = b"\0rill-embryo".to_vec();
    let listener = UnixSock::new(SockType::Stream);
    assert_test!(listener.bind(&name).is_ok());
    assert_test!(listener.listen(2).is_ok());
    let client = UnixSock::new(SockType::Stream);
    assert_test!(client.connect_stream(&name, true).is_ok());
    listener.release();
    assert_eq_test!(
        client.recv_stream(&mut buf, NB).err(),
        Some(NetError::ConnReset),
        "unaccepted embryo resets the connector"
    );
    client.release();
    pass!()
}

/// P6: bytes from different writers never coalesce across a credential
/// boundary.
pub fn test_credential_boundary() -> TestResult {
    let Ok((client, server)) = stream_pair(b"rill-creds") else {
        return fail!("pair setup");
    };

    assert_eq_test!(client.send_stream(b"aaa", NB, scm(1)), Ok(3));
    assert_eq_test!(client.send_stream(b"bbb", NB, scm(2)), Ok(3));

    let mut buf = [0u8; 16];
    let first = match server.recv_stream(&mut buf, NB) {
        Ok(m) => m,
        Err(_) => return fail!("first read"),
    };
    assert_eq_test!(first.len, 3, "read stops at the credential boundary");
    assert_eq_test!(&buf[..3], b"aaa");
    assert_eq_test!(first.creds.uid, 1, "first writer's credentials");

    let second = match server.recv_stream(&mut buf, NB) {
        Ok(m) => m,
        Err(_) => return fail!("second read"),
    };
    assert_eq_test!(second.len, 3);
    assert_eq_test!(&buf[..3], b"bbb");
    assert_eq_test!(second.creds.uid, 2, "second writer's credentials");

    client.release();
    server.release();
    pass!()
}

/// P7: inflight accounting around send, peek and receive of passed fds.
pub fn test_fd_passing_inflight() -> TestResult {
    let a = UnixSock::new(SockType::Dgram);
    let b = UnixSock::new(SockType::Dgram);
    assert_test!(UnixSock::socketpair(&a, &b).is_ok());

    let f1 = ScmFile::plain();
    let f2 = ScmFile::plain();
    let base = UNIX_TOT_INFLIGHT.load(core::sync::atomic::Ordering::Acquire);

    let payload = ScmData { creds: creds(0), files: vec![f1.clone(), f2.clone()] };
    assert_eq_test!(a.send_dgram(None, b"fds", NB, payload), Ok(3));
    assert_eq_test!(f1.inflight(), 1, "first fd in flight after send");
    assert_eq_test!(f2.inflight(), 1, "second fd in flight after send");
    assert_eq_test!(
        UNIX_TOT_INFLIGHT.load(core::sync::atomic::Ordering::Acquire),
        base + 2,
        "global count tracks both"
    );

    // Peek duplicates the fds without consuming the inflight charge.
    let mut buf = [0u8; 8];
    let peeked = match b.recv_dgram(&mut buf, NB | MsgFlags::PEEK) {
        Ok(m) => m,
        Err(_) => return fail!("peek"),
    };
    assert_eq_test!(peeked.files.len(), 2, "peek returns duplicated fds");
    assert_eq_test!(f1.inflight(), 1, "peek leaves the charge in place");

    // The real receive settles the accounting.
    let msg = match b.recv_dgram(&mut buf, NB) {
        Ok(m) => m,
        Err(_) => return fail!("recv"),
    };
    assert_eq_test!(msg.files.len(), 2, "fds delivered");
    assert_eq_test!(f1.inflight(), 0, "charge released");
    assert_eq_test!(
        UNIX_TOT_INFLIGHT.load(core::sync::atomic::Ordering::Acquire),
        base,
        "global count restored"
    );

    a.release();
    b.release();
    pass!()
}

/// An undelivered fd-bearing packet releases its charge when the queue
/// dies with the socket.
pub fn test_fd_released_on_close() -> TestResult {
    let a = UnixSock::new(SockType::Dgram);
    let b = UnixSock::new(SockType::Dgram);
    assert_test!(UnixSock::socketpair(&a, &b).is_ok());

    let f = ScmFile::plain();
    let payload = ScmData { creds: creds(0), files: vec![f.clone()] };
    assert_eq_test!(a.send_dgram(None, b"x", NB, payload), Ok(1));
    assert_eq_test!(f.inflight(), 1);

    b.release();
    assert_eq_test!(f.inflight(), 0, "queue teardown released the fd");

    a.release();
    pass!()
}

/// The collector breaks a cycle of sockets reachable only through
/// inflight fds.
pub fn test_gc_breaks_fd_cycle() -> TestResult {
    let x = UnixSock::new(SockType::Dgram);
    let y = UnixSock::new(SockType::Dgram);
    assert_test!(UnixSock::socketpair(&x, &y).is_ok());

    // Cross-queue each endpoint's handle through the other.
    {
        let fx = ScmFile::for_socket(&x);
        let fy = ScmFile::for_socket(&y);
        let to_y = ScmData { creds: creds(0), files: vec![fx] };
        let to_x = ScmData { creds: creds(0), files: vec![fy] };
        assert_eq_test!(x.send_dgram(None, b"a", NB, to_y), Ok(1));
        assert_eq_test!(y.send_dgram(None, b"b", NB, to_x), Ok(1));
    }
    assert_eq_test!(x.inflight.load(core::sync::atomic::Ordering::Acquire), 1);
    assert_eq_test!(y.inflight.load(core::sync::atomic::Ordering::Acquire), 1);

    // No user reference to either handle survives: the cycle is garbage.
    garbage::collect();

    assert_eq_test!(
        x.inflight.load(core::sync::atomic::Ordering::Acquire),
        0,
        "cycle broken on x"
    );
    assert_eq_test!(
        y.inflight.load(core::sync::atomic::Ordering::Acquire),
        0,
        "cycle broken on y"
    );

    x.release();
    y.release();
    pass!()
}

/// SIGPIPE suppression: `NOSIGNAL` turns a broken pipe into a plain
/// error (the signal hook itself is exercised host-side).
pub fn test_pipe_error_plain() -> TestResult {
    let Ok((client, server)) = stream_pair(b"rill-pipe") else {
        return fail!("pair setup");
    };
    server.release();
    assert_eq_test!(
        client.send_stream(b"x", NB | MsgFlags::NOSIGNAL, scm(0)),
        Err(NetError::Pipe),
        "send into a dead peer"
    );
    client.release();
    pass!()
}

/// OOB is not a thing on AF_UNIX.
pub fn test_oob_rejected() -> TestResult {
    let a = UnixSock::new(SockType::Dgram);
    assert_eq_test!(
        a.send_dgram(None, b"x", MsgFlags::OOB, scm(0)),
        Err(NetError::NotSupp)
    );
    a.release();
    pass!()
}

pub fn run() -> (u32, u32) {
    let mut passed = 0u32;
    let mut total = 0u32;
    run_test!(passed, total, test_autobind_distinct_names);
    run_test!(passed, total, test_bind_collisions);
    run_test!(passed, total, test_filesystem_bind_and_lookup);
    run_test!(passed, total, test_dgram_roundtrip);
    run_test!(passed, total, test_dgram_trunc_and_peek);
    run_test!(passed, total, test_dgram_connect_and_pairing);
    run_test!(passed, total, test_stream_backlog);
    run_test!(passed, total, test_accept_inherits_name_and_creds);
    run_test!(passed, total, test_stream_transfer_and_shutdown);
    run_test!(passed, total, test_close_eof_and_reset);
    run_test!(passed, total, test_credential_boundary);
    run_test!(passed, total, test_fd_passing_inflight);
    run_test!(passed, total, test_fd_released_on_close);
    run_test!(passed, total, test_gc_breaks_fd_cycle);
    run_test!(passed, total, test_pipe_error_plain);
    run_test!(passed, total, test_oob_rejected);
    (passed, total)
}
