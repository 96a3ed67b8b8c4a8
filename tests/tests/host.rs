//! Host-side test entry points.
//!
//! One test drives every in-tree suite sequentially (they share
//! process-wide state: the clock, the device registry, the socket table).
//! The remaining tests cover the sleeping paths with real threads, which
//! the in-tree suites cannot do from `no_std`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use rill_abi::{MsgFlags, NetError, SockType};
use rill_lib::task::{self, TaskHooks};
use rill_net::unix::UnixSock;
use rill_net::unix::scm::ScmData;

static SIGPIPES: AtomicUsize = AtomicUsize::new(0);
static TASK_COUNTER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static TASK_ID: u64 = TASK_COUNTER.fetch_add(1, Ordering::Relaxed);
}

fn host_task_id() -> u64 {
    TASK_ID.with(|id| *id)
}

fn host_relax() {
    thread::yield_now();
}

fn host_no_signal() -> bool {
    false
}

fn host_sigpipe() {
    SIGPIPES.fetch_add(1, Ordering::Relaxed);
}

fn install_hooks() {
    task::register_hooks(TaskHooks {
        current_task_id: host_task_id,
        signal_pending: host_no_signal,
        send_sigpipe: host_sigpipe,
        relax: host_relax,
    });
}

#[test]
fn in_tree_suites() {
    install_hooks();
    let summary = rill_tests::run_all(|result| {
        println!(
            "suite {:<8} {:>3}/{:<3} {}",
            result.name,
            result.passed,
            result.total,
            if result.all_passed() { "ok" } else { "FAILED" }
        );
    });
    assert!(
        summary.all_passed(),
        "{} of {} tests failed",
        summary.total - summary.passed,
        summary.total
    );
}

#[test]
fn blocking_dgram_send_waits_for_reader() {
    install_hooks();

    let a = UnixSock::new(SockType::Dgram);
    let b = UnixSock::new(SockType::Dgram);
    UnixSock::socketpair(&a, &b).unwrap();
    b.set_backlog_cap(2);

    // Fill the peer's queue.
    for _ in 0..2 {
        a.send_dgram(None, b"x", MsgFlags::DONTWAIT, ScmData::default()).unwrap();
    }
    assert_eq!(
        a.send_dgram(None, b"x", MsgFlags::DONTWAIT, ScmData::default()),
        Err(NetError::Again)
    );

    // A blocking sender parks on the peer-wait queue until the reader
    // drains below the cap.
    let sender = {
        let a = a.clone();
        thread::spawn(move || a.send_dgram(None, b"y", MsgFlags::empty(), ScmData::default()))
    };

    thread::sleep(Duration::from_millis(20));
    let mut buf = [0u8; 4];
    b.recv_dgram(&mut buf, MsgFlags::DONTWAIT).unwrap();
    b.recv_dgram(&mut buf, MsgFlags::DONTWAIT).unwrap();

    let sent = sender.join().expect("sender thread");
    assert_eq!(sent, Ok(1), "blocked sender completed after the drain");

    a.release();
    b.release();
}

#[test]
fn blocking_stream_recv_woken_by_writer() {
    install_hooks();

    let name = b"\0rill-host-stream".to_vec();
    let listener = UnixSock::new(SockType::Stream);
    listener.bind(&name).unwrap();
    listener.listen(4).unwrap();

    let client = UnixSock::new(SockType::Stream);
    client.connect_stream(&name, true).unwrap();
    let server = listener.accept(true).unwrap();
    listener.release();

    let reader = {
        let server = server.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 16];
            server.recv_stream(&mut buf, MsgFlags::empty()).map(|m| {
                let mut out = [0u8; 16];
                out[..m.len].copy_from_slice(&buf[..m.len]);
                (m.len, out)
            })
        })
    };

    thread::sleep(Duration::from_millis(20));
    client.send_stream(b"wakeup", MsgFlags::DONTWAIT, ScmData::default()).unwrap();

    let got = reader.join().expect("reader thread").expect("recv");
    assert_eq!(got.0, 6);
    assert_eq!(&got.1[..6], b"wakeup");

    client.release();
    server.release();
}

#[test]
fn blocking_connect_waits_for_accept() {
    install_hooks();

    let name = b"\0rill-host-connect".to_vec();
    let listener = UnixSock::new(SockType::Stream);
    listener.bind(&name).unwrap();
    listener.listen(1).unwrap();

    // Occupy the single backlog slot.
    let first = UnixSock::new(SockType::Stream);
    first.connect_stream(&name, true).unwrap();

    let second = UnixSock::new(SockType::Stream);
    let connector = {
        let second = second.clone();
        let name = name.clone();
        thread::spawn(move || second.connect_stream(&name, false))
    };

    thread::sleep(Duration::from_millis(20));
    let child_a = listener.accept(true).unwrap();

    assert_eq!(connector.join().expect("connector thread"), Ok(()));
    let child_b = listener.accept(true).unwrap();

    child_a.release();
    child_b.release();
    first.release();
    second.release();
    listener.release();
}

#[test]
fn sigpipe_raised_unless_suppressed() {
    install_hooks();

    let name = b"\0rill-host-sigpipe".to_vec();
    let listener = UnixSock::new(SockType::Stream);
    listener.bind(&name).unwrap();
    listener.listen(2).unwrap();
    let client = UnixSock::new(SockType::Stream);
    client.connect_stream(&name, true).unwrap();
    let server = listener.accept(true).unwrap();
    listener.release();
    server.release();

    let before = SIGPIPES.load(Ordering::Relaxed);
    assert_eq!(
        client.send_stream(b"x", MsgFlags::DONTWAIT, ScmData::default()),
        Err(NetError::Pipe)
    );
    assert!(SIGPIPES.load(Ordering::Relaxed) > before, "SIGPIPE hook fired");

    client.release();
}
