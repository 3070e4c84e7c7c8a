//! Half-closure: a peer's output shutdown surfaces as a user event when
//! `allow_half_closure` is set, and the surviving direction keeps working.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use bytes::Bytes;
use weir::channel::{ChannelConfig, Initializer, SocketOptions};
use weir::transport::{ChildAcceptor, connect, listen};
use weir::{Channel, EventLoopGroup, Message};
use weir_test::handlers::{Collector, EventLog};
use weir_test::{WAIT, init_tracing, local_addr};

#[test]
fn output_shutdown_fires_user_event_and_keeps_writes() {
    init_tracing();
    let boss = EventLoopGroup::new(1).unwrap();
    let workers = EventLoopGroup::new(1).unwrap();

    let (server_tx, server_rx) = mpsc::channel();
    let child_init: Initializer = Arc::new(move |ch: &Channel| {
        let (log, entries) = EventLog::new();
        ch.add_last("log", log).unwrap();
        let _ = server_tx.send((ch.handle(), entries));
    });
    let half_close_cfg = ChannelConfig {
        allow_half_closure: true,
        ..ChannelConfig::default()
    };
    let acceptor_group = workers.clone();
    let listener_init: Initializer = Arc::new(move |ch: &Channel| {
        ch.add_last(
            "acceptor",
            ChildAcceptor::with_config(
                acceptor_group.clone(),
                half_close_cfg.clone(),
                SocketOptions::default(),
                child_init.clone(),
            ),
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
    let addr = local_addr(&listener);

    let (done_tx, done_rx) = mpsc::channel();
    let (buf_tx, buf_rx) = mpsc::channel();
    let client_init: Initializer = Arc::new(move |ch: &Channel| {
        let (collector, buf) = Collector::new(5, done_tx.clone());
        ch.add_last("collect", collector).unwrap();
        let _ = buf_tx.send(buf);
    });
    let (client, connected) = connect(
        &workers.next(),
        addr,
        ChannelConfig::default(),
        SocketOptions::default(),
        client_init,
    );
    assert_eq!(connected.await_done(), Ok(()));
    let (server, entries) = server_rx.recv_timeout(WAIT).unwrap();
    let echoed = buf_rx.recv_timeout(WAIT).unwrap();

    // Client stops writing; server must see the half-close signal, not a
    // teardown.
    assert_eq!(client.shutdown_output().await_done(), Ok(()));

    let deadline = std::time::Instant::now() + WAIT;
    loop {
        let log = entries.lock().clone();
        if log.iter().any(|e| e == "user_event") {
            assert!(
                !log.iter().any(|e| e == "inactive"),
                "half-close must not close: {log:?}"
            );
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "no half-close event, log: {log:?}"
        );
        std::thread::sleep(Duration::from_millis(5));
    }

    // The server → client direction still flows.
    server
        .write_and_flush(Message::Buf(Bytes::from_static(b"still!")))
        .await_done()
        .unwrap();
    assert!(done_rx.recv_timeout(WAIT).unwrap() >= 5);
    assert_eq!(&echoed.lock()[..6], b"still!");

    assert_eq!(client.close().await_done(), Ok(()));
    boss.shutdown();
    workers.shutdown();
}
