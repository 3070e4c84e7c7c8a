//! The datagram transport: nonblocking UDP over epoll.
//!
//! Reads surface as [`Message::Datagram`] with the sender's address; writes
//! are all-or-nothing per datagram (a partial datagram does not exist), so
//! the write loop completes or fails whole entries instead of advancing a
//! byte offset.

use std::net::SocketAddr;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use bytes::Bytes;
use tracing::trace;

use crate::channel::{
    Channel, ChannelConfig, ChannelHandle, Initializer, Message, OutboundBuffer, SocketOptions,
    WritabilityEdge, spawn_channel,
};
use crate::error::{ChannelError, Errno};
use crate::promise::OpPromise;
use crate::runtime::EventLoopHandle;
use crate::sys::socket;

use super::{ReadResult, Transport, WriteOutcome};

pub(crate) struct UdpTransport {
    fd: Option<OwnedFd>,
    bound: bool,
    /// Connected-mode peer; plain `Buf` writes go here.
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
}

impl UdpTransport {
    pub(crate) fn new(addr: &SocketAddr, opts: &SocketOptions) -> Result<Self, Errno> {
        let fd = socket::udp_socket(addr)?;
        if opts.reuse_addr {
            socket::set_reuseaddr(fd.as_fd(), true)?;
        }
        if let Some(bytes) = opts.send_buffer {
            socket::set_send_buffer(fd.as_fd(), bytes)?;
        }
        if let Some(bytes) = opts.recv_buffer {
            socket::set_recv_buffer(fd.as_fd(), bytes)?;
        }
        Ok(UdpTransport {
            fd: Some(fd),
            bound: false,
            peer: None,
            local: None,
        })
    }
}

impl Transport for UdpTransport {
    fn kind(&self) -> &'static str {
        "udp"
    }

    fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    fn is_active(&self) -> bool {
        self.fd.is_some() && self.bound
    }

    fn local_addr(&mut self) -> Option<SocketAddr> {
        if self.local.is_none() {
            self.local = self.fd.as_ref().and_then(|fd| socket::local_addr(fd.as_fd()));
        }
        self.local
    }

    fn remote_addr(&mut self) -> Option<SocketAddr> {
        self.peer
    }

    fn do_bind(&mut self, addr: &SocketAddr) -> Result<(), Errno> {
        let fd = self.fd.as_ref().ok_or(Errno::EBADF)?;
        socket::bind(fd.as_fd(), addr)?;
        self.bound = true;
        self.local = None;
        Ok(())
    }

    fn do_connect(&mut self, addr: &SocketAddr) -> Result<bool, Errno> {
        let fd = self.fd.as_ref().ok_or(Errno::EBADF)?;
        // UDP connect just fixes the peer; it cannot block.
        socket::connect(fd.as_fd(), addr)?;
        self.peer = Some(*addr);
        self.bound = true;
        self.local = None;
        Ok(true)
    }

    fn finish_connect(&mut self) -> Result<(), Errno> {
        Ok(())
    }

    fn do_disconnect(&mut self) -> Result<bool, Errno> {
        // Dissolve the association; the socket stays bound and usable.
        self.peer = None;
        Ok(true)
    }

    fn do_shutdown_input(&mut self) -> Result<(), Errno> {
        Err(Errno::EOPNOTSUPP)
    }

    fn do_shutdown_output(&mut self) -> Result<(), Errno> {
        Err(Errno::EOPNOTSUPP)
    }

    fn do_close(&mut self) {
        self.bound = false;
        self.fd.take();
    }

    fn do_read(&mut self, cfg: &ChannelConfig) -> Result<ReadResult, Errno> {
        let fd = self.fd.as_ref().ok_or(Errno::EBADF)?;
        let mut buf = vec![0u8; cfg.read_buffer_size.max(1)];
        match socket::recv_from(fd.as_fd(), &mut buf) {
            Ok((n, peer)) => {
                buf.truncate(n);
                let peer = peer
                    .or(self.peer)
                    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
                Ok(ReadResult::Message {
                    msg: Message::Datagram {
                        data: Bytes::from(buf),
                        peer,
                    },
                    more: true,
                })
            }
            Err(Errno::EAGAIN) => Ok(ReadResult::WouldBlock),
            Err(e) => Err(e),
        }
    }

    fn do_write(
        &mut self,
        outbound: &mut OutboundBuffer,
        cfg: &ChannelConfig,
    ) -> Result<(WriteOutcome, Vec<WritabilityEdge>), Errno> {
        let mut edges = Vec::new();
        for _ in 0..cfg.write_spin_count.max(1) {
            let Some((msg, _)) = outbound.first_flushed() else {
                return Ok((WriteOutcome::Flushed, edges));
            };
            let fd = self.fd.as_ref().ok_or(Errno::EBADF)?;
            let result = match msg {
                Message::Datagram { data, peer } => socket::send_to(fd.as_fd(), data, peer),
                Message::Buf(data) => match self.peer {
                    Some(peer) => socket::send_to(fd.as_fd(), data, &peer),
                    None => Err(Errno::EDESTADDRREQ),
                },
                Message::Accepted(_) => Err(Errno::EINVAL),
            };
            match result {
                Ok(n) => {
                    trace!(sent = n, "datagram sent");
                    edges.extend(outbound.remove_first(Ok(())));
                }
                Err(Errno::EAGAIN) => return Ok((WriteOutcome::Blocked, edges)),
                Err(Errno::EINTR) => continue,
                Err(Errno::EMSGSIZE) => {
                    // Only this datagram is hopeless; the queue keeps going.
                    edges.extend(
                        outbound.remove_first(Err(ChannelError::Io(Errno::EMSGSIZE))),
                    );
                }
                Err(Errno::EDESTADDRREQ) | Err(Errno::EINVAL) => {
                    edges.extend(
                        outbound.remove_first(Err(ChannelError::Io(Errno::EDESTADDRREQ))),
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(if outbound.has_flushed() {
            (WriteOutcome::Blocked, edges)
        } else {
            (WriteOutcome::Flushed, edges)
        })
    }
}

/// Bind a datagram channel on `executor`. The promise completes once the
/// socket is bound (and the channel therefore active).
pub fn bind_udp(
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
        move || UdpTransport::new(&addr, &build_opts).map(|t| Box::new(t) as Box<dyn Transport>),
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
