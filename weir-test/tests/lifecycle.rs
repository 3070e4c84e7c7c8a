//! Channel lifecycle tests: registration events, close idempotence,
//! connect failure, and the fail-fast behavior of a closing channel's
//! handle.

use std::sync::Arc;
use std::sync::mpsc;

use bytes::Bytes;
use weir::channel::{ChannelConfig, Initializer, SocketOptions};
use weir::error::ChannelError;
use weir::transport::{ChildAcceptor, connect, listen};
use weir::{Channel, EventLoopGroup, Message};
use weir_test::handlers::EventLog;
use weir_test::{WAIT, init_tracing, local_addr};

#[test]
fn close_is_idempotent() {
    init_tracing();
    let group = EventLoopGroup::new(1).unwrap();
    let child_group = EventLoopGroup::new(1).unwrap();

    let (log_tx, log_rx) = mpsc::channel();
    let client_init: Initializer = Arc::new(move |ch: &Channel| {
        let (log, entries) = EventLog::new();
        ch.add_last("log", log).unwrap();
        let _ = log_tx.send(entries);
    });

    let server_init: Initializer = Arc::new(|_ch: &Channel| {});
    let acceptor_group = child_group.clone();
    let listener_init: Initializer = Arc::new(move |ch: &Channel| {
        ch.add_last(
            "acceptor",
            ChildAcceptor::new(acceptor_group.clone(), server_init.clone()),
        )
        .unwrap();
    });

    let (listener, bound) = listen(
        &group.next(),
        "127.0.0.1:0".parse().unwrap(),
        ChannelConfig::default(),
        SocketOptions::default(),
        listener_init,
    );
    assert_eq!(bound.await_done(), Ok(()));
    let addr = local_addr(&listener);

    let (client, connected) = connect(
        &group.next(),
        addr,
        ChannelConfig::default(),
        SocketOptions::default(),
        client_init,
    );
    assert_eq!(connected.await_done(), Ok(()));
    let entries = log_rx.recv_timeout(WAIT).unwrap();

    // Close three times; every promise succeeds, the close promise
    // completes once, and the event log shows exactly one
    // inactive/unregistered pair.
    let first = client.close();
    let second = client.close();
    let third = client.close();
    assert_eq!(first.await_done(), Ok(()));
    assert_eq!(second.await_done(), Ok(()));
    assert_eq!(third.await_done(), Ok(()));
    assert_eq!(client.close_promise().await_done(), Ok(()));

    let log = entries.lock().clone();
    assert_eq!(
        log.iter().filter(|e| e.as_str() == "inactive").count(),
        1,
        "log: {log:?}"
    );
    assert_eq!(
        log.iter().filter(|e| e.as_str() == "unregistered").count(),
        1,
        "log: {log:?}"
    );
    // Lifecycle order: registered before active, inactive before
    // unregistered.
    let pos = |needle: &str| log.iter().position(|e| e == needle).unwrap();
    assert!(pos("registered") < pos("active"));
    assert!(pos("inactive") < pos("unregistered"));

    group.shutdown();
    child_group.shutdown();
}

#[test]
fn closed_channel_handle_fails_fast() {
    init_tracing();
    let group = EventLoopGroup::new(1).unwrap();

    let init: Initializer = Arc::new(|_ch: &Channel| {});
    let (handle, bound) = weir::transport::bind_udp(
        &group.next(),
        "127.0.0.1:0".parse().unwrap(),
        ChannelConfig::default(),
        SocketOptions::default(),
        init,
    );
    assert_eq!(bound.await_done(), Ok(()));
    assert_eq!(handle.close().await_done(), Ok(()));

    let write = handle.write_and_flush(Message::Buf(Bytes::from_static(b"late")));
    assert_eq!(write.await_done(), Err(ChannelError::Closed));
    group.shutdown();
}

#[test]
fn connect_to_dead_port_fails_and_closes() {
    init_tracing();
    let group = EventLoopGroup::new(1).unwrap();

    // Grab a loopback port that nothing listens on.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = probe.local_addr().unwrap();
    drop(probe);

    let init: Initializer = Arc::new(|_ch: &Channel| {});
    let (client, connected) = connect(
        &group.next(),
        dead,
        ChannelConfig::default(),
        SocketOptions::default(),
        init,
    );
    assert!(connected.await_done().is_err());
    // A failed connect force-closes the channel.
    assert_eq!(client.close_promise().await_done(), Ok(()));
    group.shutdown();
}

#[test]
fn loop_rejects_work_after_shutdown() {
    init_tracing();
    let group = EventLoopGroup::new(1).unwrap();
    let handle = group.next();
    group.shutdown();

    let init: Initializer = Arc::new(|_ch: &Channel| {});
    let (_client, connected) = connect(
        &handle,
        "127.0.0.1:1".parse().unwrap(),
        ChannelConfig::default(),
        SocketOptions::default(),
        init,
    );
    assert_eq!(connected.await_done(), Err(ChannelError::LoopShutDown));
}
