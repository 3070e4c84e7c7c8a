//! Watermark/backpressure behavior across threads.
//!
//! Three unflushed writes of 10, 20 and 30 bytes under a 25-byte high /
//! 8-byte low watermark: the channel must report unwritable exactly once
//! (after the cumulative 30 bytes cross 25) and writable exactly once
//! (after the flush drains below 8), with the pending counter honest at
//! every step, including before the cross-thread write tasks have run.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use bytes::Bytes;
use weir::channel::{ChannelConfig, Initializer, SocketOptions};
use weir::transport::{ChildAcceptor, connect, listen};
use weir::{Channel, EventLoopGroup, Message};
use weir_test::handlers::EventLog;
use weir_test::{WAIT, init_tracing, local_addr};

fn watermark_config() -> ChannelConfig {
    ChannelConfig {
        write_high_watermark: 25,
        write_low_watermark: 8,
        ..ChannelConfig::default()
    }
}

#[test]
fn writability_flips_once_per_edge() {
    init_tracing();
    let boss = EventLoopGroup::new(1).unwrap();
    let workers = EventLoopGroup::new(1).unwrap();

    let child_init: Initializer = Arc::new(|_ch: &Channel| {});
    let acceptor_group = workers.clone();
    let listener_init: Initializer = Arc::new(move |ch: &Channel| {
        ch.add_last(
            "acceptor",
            ChildAcceptor::new(acceptor_group.clone(), child_init.clone()),
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

    let (log_tx, log_rx) = mpsc::channel();
    let client_init: Initializer = Arc::new(move |ch: &Channel| {
        let (log, entries) = EventLog::new();
        ch.add_last("log", log).unwrap();
        let _ = log_tx.send(entries);
    });
    let (client, connected) = connect(
        &workers.next(),
        addr,
        watermark_config(),
        SocketOptions::default(),
        client_init,
    );
    assert_eq!(connected.await_done(), Ok(()));
    let entries = log_rx.recv_timeout(WAIT).unwrap();

    assert!(client.is_writable());

    // Writes queue without flushing; the pending counter grows from the
    // caller's side of the thread boundary.
    let p1 = client.write(Message::Buf(Bytes::from(vec![b'x'; 10])));
    assert!(client.is_writable(), "10 <= 25 stays writable");
    let p2 = client.write(Message::Buf(Bytes::from(vec![b'y'; 20])));
    assert!(!client.is_writable(), "30 > 25 flips unwritable");
    let p3 = client.write(Message::Buf(Bytes::from(vec![b'z'; 30])));
    assert!(!client.is_writable(), "still above; no second flip");

    client.flush();
    for (i, p) in [&p1, &p2, &p3].iter().enumerate() {
        assert_eq!(p.await_done(), Ok(()), "write {i}");
    }
    assert_eq!(client.pending_bytes(), 0);
    assert!(client.is_writable());

    // The loop saw exactly one event per edge, unwritable first. The
    // writable edge lands after the drain; give the loop a beat.
    let deadline = std::time::Instant::now() + WAIT;
    loop {
        let log = entries.lock().clone();
        let edges: Vec<&String> = log
            .iter()
            .filter(|e| e.starts_with("writability:"))
            .collect();
        if edges.len() == 2 {
            assert_eq!(edges[0].as_str(), "writability:false");
            assert_eq!(edges[1].as_str(), "writability:true");
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "expected 2 writability edges, log: {log:?}"
        );
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(client.close().await_done(), Ok(()));
    boss.shutdown();
    workers.shutdown();
}
