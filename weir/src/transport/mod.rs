//! Concrete epoll transports and the contract they implement.
//!
//! A [`Transport`] owns the descriptor and nothing else: no pipeline, no
//! buffering policy, no lifecycle. The channel drives it through the `do_*`
//! methods and interprets the errno taxonomy; the transport's only job is to
//! turn readiness into messages and flushed entries into syscalls.

mod listener;
mod tcp;
mod udp;

pub use listener::{AcceptedSocket, ChildAcceptor, listen};
pub use tcp::{connect, register_accepted};
pub use udp::bind_udp;

use std::net::SocketAddr;
use std::os::fd::BorrowedFd;

use crate::channel::{ChannelConfig, Message, OutboundBuffer, WritabilityEdge};
use crate::error::Errno;

/// One `do_read` step.
pub(crate) enum ReadResult {
    /// A message was produced. `more` hints whether another immediate read
    /// is likely to succeed (a full buffer, an accept, a datagram).
    Message { msg: Message, more: bool },
    /// Clean EOF from the peer.
    Eof,
    /// Nothing available right now.
    WouldBlock,
}

/// Outcome of one `do_write` call over the flushed range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    /// Every flushed entry hit the OS; write interest can be dropped.
    Flushed,
    /// The OS stopped accepting bytes (or the spin budget ran out); park on
    /// write readiness.
    Blocked,
}

/// The native-I/O contract between a channel and its descriptor.
pub(crate) trait Transport {
    fn kind(&self) -> &'static str;

    /// The live descriptor, `None` once closed.
    fn fd(&self) -> Option<BorrowedFd<'_>>;

    fn is_open(&self) -> bool;

    /// Bound/connected and able to move data.
    fn is_active(&self) -> bool;

    fn local_addr(&mut self) -> Option<SocketAddr>;

    fn remote_addr(&mut self) -> Option<SocketAddr>;

    /// Streams support independent input/output shutdown.
    fn supports_half_closure(&self) -> bool {
        false
    }

    /// Whether outbound data makes sense at all (listeners say no).
    fn writable_transport(&self) -> bool {
        true
    }

    fn do_bind(&mut self, addr: &SocketAddr) -> Result<(), Errno>;

    /// `Ok(true)`: connected immediately. `Ok(false)`: in progress, finish
    /// on write readiness.
    fn do_connect(&mut self, addr: &SocketAddr) -> Result<bool, Errno>;

    fn finish_connect(&mut self) -> Result<(), Errno>;

    /// `Ok(true)`: the association dissolved and the transport stays
    /// usable. `Ok(false)`: disconnect means close for this transport.
    fn do_disconnect(&mut self) -> Result<bool, Errno>;

    fn do_shutdown_input(&mut self) -> Result<(), Errno>;

    fn do_shutdown_output(&mut self) -> Result<(), Errno>;

    /// Drop the descriptor. Idempotent.
    fn do_close(&mut self);

    fn do_read(&mut self, cfg: &ChannelConfig) -> Result<ReadResult, Errno>;

    fn do_write(
        &mut self,
        outbound: &mut OutboundBuffer,
        cfg: &ChannelConfig,
    ) -> Result<(WriteOutcome, Vec<WritabilityEdge>), Errno>;
}
