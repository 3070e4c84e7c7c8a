//! Error-path tests: handler panics become exception events, failed
//! handler installation is surfaced and force-removed, and reset-class
//! errors close the channel after delivering what was read.

use std::sync::Arc;
use std::sync::mpsc;

use bytes::Bytes;
use weir::channel::{ChannelConfig, Initializer, SocketOptions};
use weir::transport::{ChildAcceptor, connect, listen};
use weir::{Channel, Context, EventLoopGroup, Handler, Message};
use weir_test::handlers::{EventLog, PanicOnRead};
use weir_test::{WAIT, init_tracing, local_addr, query};

fn echo_rig(
    boss: &EventLoopGroup,
    workers: Arc<EventLoopGroup>,
    child_init: Initializer,
) -> std::net::SocketAddr {
    let listener_init: Initializer = Arc::new(move |ch: &Channel| {
        ch.add_last(
            "acceptor",
            ChildAcceptor::new(workers.clone(), child_init.clone()),
        )
        .unwrap();
    });
    let (listener, bound) = listen(
        &boss.next(),
        "127.0.0.1:0".parse().unwrap(),
        ChannelConfig::default(),
        SocketOptions::default(),
        listener_init,
    );
    assert_eq!(bound.await_done(), Ok(()));
    local_addr(&listener)
}

#[test]
fn handler_panic_becomes_exception_event() {
    init_tracing();
    let boss = EventLoopGroup::new(1).unwrap();
    let workers = EventLoopGroup::new(1).unwrap();

    // Server children panic on the first read; an EventLog behind the
    // panicking handler must observe the exception instead of the read.
    let (log_tx, log_rx) = mpsc::channel();
    let child_init: Initializer = Arc::new(move |ch: &Channel| {
        ch.add_last("boom", PanicOnRead).unwrap();
        let (log, entries) = EventLog::new();
        ch.add_last("log", log).unwrap();
        let _ = log_tx.send(entries);
    });
    let addr = echo_rig(&boss, workers.clone(), child_init);

    let quiet: Initializer = Arc::new(|_ch: &Channel| {});
    let (client, connected) = connect(
        &workers.next(),
        addr,
        ChannelConfig::default(),
        SocketOptions::default(),
        quiet,
    );
    assert_eq!(connected.await_done(), Ok(()));
    let entries = log_rx.recv_timeout(WAIT).unwrap();

    client
        .write_and_flush(Message::Buf(Bytes::from_static(b"trigger")))
        .await_done()
        .unwrap();

    // The panic surfaces as exception_caught on the child pipeline; the
    // channel itself stays open.
    let deadline = std::time::Instant::now() + WAIT;
    loop {
        let log = entries.lock().clone();
        if log.iter().any(|e| e.starts_with("exception:handler panicked")) {
            assert!(
                !log.iter().any(|e| e.starts_with("read:")),
                "read must not pass the panicking handler: {log:?}"
            );
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "no exception event, log: {log:?}"
        );
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    assert_eq!(client.close().await_done(), Ok(()));
    boss.shutdown();
    workers.shutdown();
}

struct FailsToInstall;

impl Handler for FailsToInstall {
    fn handler_added(&mut self, _ctx: &Context) -> weir::Result<()> {
        Err("refusing to install".into())
    }
}

#[test]
fn failed_handler_added_is_force_removed() {
    init_tracing();
    let group = EventLoopGroup::new(1).unwrap();

    let quiet: Initializer = Arc::new(|_ch: &Channel| {});
    let (handle, bound) = weir::transport::bind_udp(
        &group.next(),
        "127.0.0.1:0".parse().unwrap(),
        ChannelConfig::default(),
        SocketOptions::default(),
        quiet,
    );
    assert_eq!(bound.await_done(), Ok(()));

    let (log, entries) = EventLog::new();
    handle.add_last("log", log).await_done().unwrap();
    // Install succeeds from the caller's view; the offender is evicted and
    // the failure travels the pipeline as an exception event.
    handle.add_last("bad", FailsToInstall).await_done().unwrap();

    let names = query(&handle, |ch| ch.handler_names());
    assert_eq!(names, vec!["log"]);

    let deadline = std::time::Instant::now() + WAIT;
    loop {
        let log = entries.lock().clone();
        if log.iter().any(|e| e.starts_with("exception:handler failed")) {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "no exception event, log: {log:?}"
        );
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    group.shutdown();
}
