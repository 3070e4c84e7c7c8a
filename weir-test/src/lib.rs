//! Shared helpers for weir integration tests.
//!
//! Real loopback sockets stand in for traffic: every scenario binds to
//! `127.0.0.1:0` and discovers the assigned port through the channel, so
//! tests never collide on ports and never need the network.

pub mod handlers;

use std::net::SocketAddr;
use std::sync::mpsc;
use std::time::Duration;

use weir::ChannelHandle;

/// How long helpers wait before declaring a scenario stuck.
pub const WAIT: Duration = Duration::from_secs(5);

/// Install a subscriber honoring `RUST_LOG`; safe to call from every test.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The channel's bound local address, fetched from its loop.
pub fn local_addr(handle: &ChannelHandle) -> SocketAddr {
    let (tx, rx) = mpsc::channel();
    handle.invoke(move |ch| {
        let _ = tx.send(ch.local_addr());
    });
    rx.recv_timeout(WAIT)
        .expect("channel gone before reporting its address")
        .expect("channel has no local address")
}

/// Run `f` on the channel's loop and wait for its result.
pub fn query<T: Send + 'static>(
    handle: &ChannelHandle,
    f: impl FnOnce(&weir::Channel) -> T + Send + 'static,
) -> T {
    let (tx, rx) = mpsc::channel();
    handle.invoke(move |ch| {
        let _ = tx.send(f(ch));
    });
    rx.recv_timeout(WAIT).expect("channel query timed out")
}
