//! The server transport: a listening socket whose "reads" are connections.
//!
//! Each accepted socket travels down the listener's pipeline as a
//! [`Message::Accepted`]; the stock [`ChildAcceptor`] handler picks those up
//! and registers child channels on a child group, so the listener loop never
//! does per-connection work beyond `accept4`.

use std::net::SocketAddr;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::channel::{
    Channel, ChannelConfig, ChannelHandle, Initializer, Message, OutboundBuffer, SocketOptions,
    WritabilityEdge, spawn_channel,
};
use crate::error::{ChannelError, Errno};
use crate::pipeline::{Context, EventMask, Handler};
use crate::promise::OpPromise;
use crate::runtime::{EventLoopGroup, EventLoopHandle};
use crate::sys::socket;

use super::{ReadResult, Transport, WriteOutcome};

/// A connection fresh off `accept4`: the owned descriptor plus the peer
/// address, ready to become a child channel on some loop.
#[derive(Debug)]
pub struct AcceptedSocket {
    pub(crate) fd: OwnedFd,
    pub peer: Option<SocketAddr>,
}

pub(crate) struct TcpListenerTransport {
    fd: Option<OwnedFd>,
    listening: bool,
    backlog: u32,
    local: Option<SocketAddr>,
}

impl TcpListenerTransport {
    pub(crate) fn new(addr: &SocketAddr, opts: &SocketOptions) -> Result<Self, Errno> {
        let fd = socket::tcp_socket(addr)?;
        if opts.reuse_addr {
            socket::set_reuseaddr(fd.as_fd(), true)?;
        }
        if let Some(bytes) = opts.recv_buffer {
            socket::set_recv_buffer(fd.as_fd(), bytes)?;
        }
        Ok(TcpListenerTransport {
            fd: Some(fd),
            listening: false,
            backlog: opts.backlog,
            local: None,
        })
    }
}

impl Transport for TcpListenerTransport {
    fn kind(&self) -> &'static str {
        "tcp-listener"
    }

    fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    fn is_active(&self) -> bool {
        self.fd.is_some() && self.listening
    }

    fn local_addr(&mut self) -> Option<SocketAddr> {
        if self.local.is_none() {
            self.local = self.fd.as_ref().and_then(|fd| socket::local_addr(fd.as_fd()));
        }
        self.local
    }

    fn remote_addr(&mut self) -> Option<SocketAddr> {
        None
    }

    fn writable_transport(&self) -> bool {
        false
    }

    fn do_bind(&mut self, addr: &SocketAddr) -> Result<(), Errno> {
        let fd = self.fd.as_ref().ok_or(Errno::EBADF)?;
        socket::bind(fd.as_fd(), addr)?;
        socket::listen(fd.as_fd(), self.backlog)?;
        self.listening = true;
        self.local = None;
        Ok(())
    }

    fn do_connect(&mut self, _addr: &SocketAddr) -> Result<bool, Errno> {
        Err(Errno::EOPNOTSUPP)
    }

    fn finish_connect(&mut self) -> Result<(), Errno> {
        Err(Errno::EOPNOTSUPP)
    }

    fn do_disconnect(&mut self) -> Result<bool, Errno> {
        Ok(false)
    }

    fn do_shutdown_input(&mut self) -> Result<(), Errno> {
        Err(Errno::EOPNOTSUPP)
    }

    fn do_shutdown_output(&mut self) -> Result<(), Errno> {
        Err(Errno::EOPNOTSUPP)
    }

    fn do_close(&mut self) {
        self.listening = false;
        self.fd.take();
    }

    fn do_read(&mut self, _cfg: &ChannelConfig) -> Result<ReadResult, Errno> {
        let fd = self.fd.as_ref().ok_or(Errno::EBADF)?;
        match socket::accept(fd.as_fd()) {
            Ok((sock, peer)) => Ok(ReadResult::Message {
                msg: Message::Accepted(AcceptedSocket { fd: sock, peer }),
                more: true,
            }),
            Err(Errno::EAGAIN) => Ok(ReadResult::WouldBlock),
            Err(e) => Err(e),
        }
    }

    fn do_write(
        &mut self,
        _outbound: &mut OutboundBuffer,
        _cfg: &ChannelConfig,
    ) -> Result<(WriteOutcome, Vec<WritabilityEdge>), Errno> {
        // Unreachable: write0 refuses before anything is queued.
        Ok((WriteOutcome::Flushed, Vec::new()))
    }
}

/// Bind a listener channel on `executor`. The returned promise completes
/// once the socket is bound and listening.
///
/// Pair with a [`ChildAcceptor`] in `init` to turn accepted connections
/// into child channels.
pub fn listen(
    executor: &EventLoopHandle,
    addr: SocketAddr,
    cfg: ChannelConfig,
    opts: SocketOptions,
    init: Initializer,
) -> (ChannelHandle, OpPromise) {
    let promise = OpPromise::with_executor(executor.clone());
    let build_opts = opts;
    let handle = spawn_channel(
        executor,
        cfg,
        None,
        move || {
            TcpListenerTransport::new(&addr, &build_opts)
                .map(|t| Box::new(t) as Box<dyn Transport>)
        },
        Some(init),
        move |ch: &Channel, p: OpPromise| {
            ch.bind(addr).add_listener(move |r| {
                match r {
                    Ok(()) => p.try_success(),
                    Err(e) => p.try_failure(e.clone()),
                };
            });
        },
        promise.clone(),
    );
    (handle, promise)
}

/// Terminal handler for listener pipelines: registers each accepted
/// connection as a child channel on the next loop of a child group, with a
/// caller-supplied pipeline initializer.
pub struct ChildAcceptor {
    group: Arc<EventLoopGroup>,
    cfg: ChannelConfig,
    opts: SocketOptions,
    init: Initializer,
}

impl ChildAcceptor {
    pub fn new(group: Arc<EventLoopGroup>, init: Initializer) -> Self {
        Self::with_config(group, ChannelConfig::default(), SocketOptions::default(), init)
    }

    pub fn with_config(
        group: Arc<EventLoopGroup>,
        cfg: ChannelConfig,
        opts: SocketOptions,
        init: Initializer,
    ) -> Self {
        ChildAcceptor {
            group,
            cfg,
            opts,
            init,
        }
    }
}

impl Handler for ChildAcceptor {
    fn events(&self) -> EventMask {
        EventMask::READ | EventMask::EXCEPTION_CAUGHT
    }

    fn channel_read(&mut self, ctx: &Context, msg: Message) {
        let sock = match msg {
            Message::Accepted(sock) => sock,
            other => {
                ctx.fire_channel_read(other);
                return;
            }
        };
        let parent = ctx.channel().map(|ch| ch.id());
        debug!(peer = ?sock.peer, "accepted connection; registering child");
        let (_child, registered) = super::tcp::register_accepted(
            &self.group.next(),
            sock,
            parent,
            self.cfg.clone(),
            self.opts.clone(),
            self.init.clone(),
        );
        registered.add_listener(|result| {
            if let Err(e) = result {
                warn!(error = %e, "child channel registration failed");
            }
        });
    }

    fn exception_caught(&mut self, ctx: &Context, error: ChannelError) {
        // Accept errors are transient for the listener itself (fd pressure,
        // aborted handshakes); log and keep listening.
        warn!(error = %error, "listener error");
        ctx.fire_exception_caught(error);
    }
}
