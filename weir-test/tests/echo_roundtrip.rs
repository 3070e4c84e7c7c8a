//! End-to-end echo over loopback TCP.
//!
//! A listener on one group accepts connections and hands them to a child
//! group whose pipelines echo every chunk. The client writes three messages
//! of sizes 10, 20 and 30 bytes and waits for all 60 to come back, in
//! order, with every write promise succeeding and the pending-byte counter
//! back at zero.

use std::sync::Arc;
use std::sync::mpsc;

use bytes::Bytes;
use weir::channel::{ChannelConfig, Initializer, SocketOptions};
use weir::transport::{ChildAcceptor, connect, listen};
use weir::{Channel, EventLoopGroup, Message};
use weir_test::handlers::{Collector, EchoHandler};
use weir_test::{WAIT, init_tracing, local_addr};

#[test]
fn echo_three_messages() {
    init_tracing();
    let boss = EventLoopGroup::new(1).unwrap();
    let workers = EventLoopGroup::new(2).unwrap();

    let child_init: Initializer = Arc::new(|ch: &Channel| {
        ch.add_last("echo", EchoHandler).unwrap();
    });
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

    let (done_tx, done_rx) = mpsc::channel();
    let (buf_tx, buf_rx) = mpsc::channel();
    let client_init: Initializer = Arc::new(move |ch: &Channel| {
        let (collector, buf) = Collector::new(60, done_tx.clone());
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
    let echoed = buf_rx.recv_timeout(WAIT).unwrap();

    let payloads: Vec<Bytes> = [10usize, 20, 30]
        .iter()
        .enumerate()
        .map(|(i, n)| Bytes::from(vec![b'a' + i as u8; *n]))
        .collect();

    let promises: Vec<_> = payloads
        .iter()
        .map(|p| client.write(Message::Buf(p.clone())))
        .collect();
    client.flush();

    // All 60 bytes echoed back.
    let total = done_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(total, 60);

    // Promises succeeded in submission order.
    for promise in &promises {
        assert_eq!(promise.await_done(), Ok(()));
    }
    assert_eq!(client.pending_bytes(), 0);

    // Byte-exact, in order: stream order preserved end to end.
    let mut expected = Vec::new();
    for p in &payloads {
        expected.extend_from_slice(p);
    }
    assert_eq!(&echoed.lock()[..], &expected[..]);

    assert_eq!(client.close().await_done(), Ok(()));
    boss.shutdown();
    workers.shutdown();
}

#[test]
fn many_clients_share_the_loops() {
    init_tracing();
    let boss = EventLoopGroup::new(1).unwrap();
    let workers = EventLoopGroup::new(2).unwrap();

    let child_init: Initializer = Arc::new(|ch: &Channel| {
        ch.add_last("echo", EchoHandler).unwrap();
    });
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

    const CLIENTS: usize = 5;
    const PAYLOAD: usize = 1024;

    let mut waiting = Vec::new();
    for i in 0..CLIENTS {
        let (done_tx, done_rx) = mpsc::channel();
        let client_init: Initializer = Arc::new(move |ch: &Channel| {
            let (collector, _buf) = Collector::new(PAYLOAD, done_tx.clone());
            ch.add_last("collect", collector).unwrap();
        });
        let (client, connected) = connect(
            &workers.next(),
            addr,
            ChannelConfig::default(),
            SocketOptions::default(),
            client_init,
        );
        assert_eq!(connected.await_done(), Ok(()), "client {i}");
        let data = Bytes::from(vec![i as u8; PAYLOAD]);
        client.write_and_flush(Message::Buf(data));
        waiting.push((client, done_rx));
    }

    for (i, (client, done_rx)) in waiting.into_iter().enumerate() {
        assert_eq!(done_rx.recv_timeout(WAIT).unwrap(), PAYLOAD, "client {i}");
        assert_eq!(client.close().await_done(), Ok(()));
    }

    boss.shutdown();
    workers.shutdown();
}
