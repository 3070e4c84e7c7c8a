//! Datagram channel tests over loopback UDP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};

use bytes::Bytes;
use weir::channel::{ChannelConfig, Initializer, SocketOptions};
use weir::transport::bind_udp;
use weir::{Channel, Context, EventLoopGroup, EventMask, Handler, Message};
use weir_test::{WAIT, init_tracing, local_addr};

struct DatagramSink {
    notify: Sender<(Bytes, SocketAddr)>,
}

impl Handler for DatagramSink {
    fn events(&self) -> EventMask {
        EventMask::READ
    }

    fn channel_read(&mut self, _ctx: &Context, msg: Message) {
        if let Message::Datagram { data, peer } = msg {
            let _ = self.notify.send((data, peer));
        }
    }
}

fn bind(
    group: &EventLoopGroup,
    init: Initializer,
) -> weir::ChannelHandle {
    let (handle, bound) = bind_udp(
        &group.next(),
        "127.0.0.1:0".parse().unwrap(),
        ChannelConfig::default(),
        SocketOptions::default(),
        init,
    );
    assert_eq!(bound.await_done(), Ok(()));
    handle
}

#[test]
fn datagram_round_trip() {
    init_tracing();
    let group = EventLoopGroup::new(2).unwrap();

    let (rx_tx, rx_rx) = mpsc::channel();
    let sink_init: Initializer = Arc::new(move |ch: &Channel| {
        ch.add_last(
            "sink",
            DatagramSink {
                notify: rx_tx.clone(),
            },
        )
        .unwrap();
    });
    let receiver = bind(&group, sink_init);
    let receiver_addr = local_addr(&receiver);

    let quiet: Initializer = Arc::new(|_ch: &Channel| {});
    let sender = bind(&group, quiet);
    let sender_addr = local_addr(&sender);

    let payload = Bytes::from_static(b"over the weir");
    let sent = sender.write_and_flush(Message::Datagram {
        data: payload.clone(),
        peer: receiver_addr,
    });
    assert_eq!(sent.await_done(), Ok(()));

    let (data, peer) = rx_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(data, payload);
    assert_eq!(peer, sender_addr);

    group.shutdown();
}

#[test]
fn connected_mode_sends_plain_buffers() {
    init_tracing();
    let group = EventLoopGroup::new(1).unwrap();

    let (rx_tx, rx_rx) = mpsc::channel();
    let sink_init: Initializer = Arc::new(move |ch: &Channel| {
        ch.add_last(
            "sink",
            DatagramSink {
                notify: rx_tx.clone(),
            },
        )
        .unwrap();
    });
    let receiver = bind(&group, sink_init);
    let receiver_addr = local_addr(&receiver);

    let quiet: Initializer = Arc::new(|_ch: &Channel| {});
    let sender = bind(&group, quiet);

    // Fix the peer, then send without an address.
    let (done_tx, done_rx) = mpsc::channel();
    sender.invoke(move |ch| {
        let p = ch.connect(receiver_addr);
        let done = done_tx.clone();
        p.add_listener(move |r| {
            let _ = done.send(r.clone());
        });
    });
    assert_eq!(done_rx.recv_timeout(WAIT).unwrap(), Ok(()));

    let sent = sender.write_and_flush(Message::Buf(Bytes::from_static(b"fixed peer")));
    assert_eq!(sent.await_done(), Ok(()));

    let (data, _) = rx_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(&data[..], b"fixed peer");

    group.shutdown();
}
