//! The byte-stream transport: nonblocking TCP over epoll.

use std::io::IoSlice;
use std::net::SocketAddr;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use arrayvec::ArrayVec;
use bytes::Bytes;
use tracing::trace;

use crate::channel::{
    Channel, ChannelConfig, ChannelHandle, Initializer, Message, OutboundBuffer, SocketOptions,
    WritabilityEdge, spawn_channel,
};
use crate::error::Errno;
use crate::promise::OpPromise;
use crate::runtime::EventLoopHandle;
use crate::sys::socket;

use super::listener::AcceptedSocket;
use super::{ReadResult, Transport, WriteOutcome};

/// Gathered slices per writev call.
const MAX_IOVECS: usize = 32;

pub(crate) struct TcpStreamTransport {
    fd: Option<OwnedFd>,
    connected: bool,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
}

impl TcpStreamTransport {
    /// A fresh, unconnected socket with `opts` applied.
    pub(crate) fn new(addr: &SocketAddr, opts: &SocketOptions) -> Result<Self, Errno> {
        let fd = socket::tcp_socket(addr)?;
        apply_stream_options(fd.as_fd(), opts)?;
        Ok(TcpStreamTransport {
            fd: Some(fd),
            connected: false,
            local: None,
            remote: None,
        })
    }

    /// Wrap a connection taken off a listener; already connected.
    pub(crate) fn from_accepted(sock: AcceptedSocket, opts: &SocketOptions) -> Result<Self, Errno> {
        apply_stream_options(sock.fd.as_fd(), opts)?;
        Ok(TcpStreamTransport {
            fd: Some(sock.fd),
            connected: true,
            local: None,
            remote: sock.peer,
        })
    }
}

fn apply_stream_options(fd: BorrowedFd<'_>, opts: &SocketOptions) -> Result<(), Errno> {
    socket::set_nodelay(fd, opts.nodelay)?;
    if opts.keepalive {
        socket::set_keepalive(fd, true)?;
    }
    if let Some(bytes) = opts.send_buffer {
        socket::set_send_buffer(fd, bytes)?;
    }
    if let Some(bytes) = opts.recv_buffer {
        socket::set_recv_buffer(fd, bytes)?;
    }
    if opts.linger.is_some() {
        socket::set_linger(fd, opts.linger)?;
    }
    Ok(())
}

impl Transport for TcpStreamTransport {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    fn is_active(&self) -> bool {
        self.fd.is_some() && self.connected
    }

    fn local_addr(&mut self) -> Option<SocketAddr> {
        if self.local.is_none() {
            self.local = self.fd.as_ref().and_then(|fd| socket::local_addr(fd.as_fd()));
        }
        self.local
    }

    fn remote_addr(&mut self) -> Option<SocketAddr> {
        if self.remote.is_none() {
            self.remote = self.fd.as_ref().and_then(|fd| socket::peer_addr(fd.as_fd()));
        }
        self.remote
    }

    fn supports_half_closure(&self) -> bool {
        true
    }

    fn do_bind(&mut self, addr: &SocketAddr) -> Result<(), Errno> {
        let fd = self.fd.as_ref().ok_or(Errno::EBADF)?;
        socket::bind(fd.as_fd(), addr)?;
        self.local = None;
        Ok(())
    }

    fn do_connect(&mut self, addr: &SocketAddr) -> Result<bool, Errno> {
        let fd = self.fd.as_ref().ok_or(Errno::EBADF)?;
        let immediate = socket::connect(fd.as_fd(), addr)?;
        self.remote = Some(*addr);
        self.local = None;
        self.connected = immediate;
        Ok(immediate)
    }

    fn finish_connect(&mut self) -> Result<(), Errno> {
        let fd = self.fd.as_ref().ok_or(Errno::EBADF)?;
        socket::finish_connect(fd.as_fd())?;
        self.connected = true;
        self.local = None;
        Ok(())
    }

    fn do_disconnect(&mut self) -> Result<bool, Errno> {
        // Streams cannot dissolve a connection; disconnect means close.
        Ok(false)
    }

    fn do_shutdown_input(&mut self) -> Result<(), Errno> {
        let fd = self.fd.as_ref().ok_or(Errno::EBADF)?;
        socket::shutdown_read(fd.as_fd())
    }

    fn do_shutdown_output(&mut self) -> Result<(), Errno> {
        let fd = self.fd.as_ref().ok_or(Errno::EBADF)?;
        socket::shutdown_write(fd.as_fd())
    }

    fn do_close(&mut self) {
        // Dropping the OwnedFd closes it.
        self.connected = false;
        self.fd.take();
    }

    fn do_read(&mut self, cfg: &ChannelConfig) -> Result<ReadResult, Errno> {
        let fd = self.fd.as_ref().ok_or(Errno::EBADF)?;
        let mut buf = vec![0u8; cfg.read_buffer_size.max(1)];
        match socket::read(fd.as_fd(), &mut buf) {
            Ok(0) => Ok(ReadResult::Eof),
            Ok(n) => {
                let full = n == buf.len();
                buf.truncate(n);
                Ok(ReadResult::Message {
                    msg: Message::Buf(Bytes::from(buf)),
                    more: full,
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
            if !outbound.has_flushed() {
                return Ok((WriteOutcome::Flushed, edges));
            }
            let fd = self.fd.as_ref().ok_or(Errno::EBADF)?;
            let written = {
                let mut iov: ArrayVec<IoSlice<'_>, MAX_IOVECS> = ArrayVec::new();
                for (msg, offset) in outbound.flushed_messages() {
                    if iov.is_full() {
                        break;
                    }
                    match msg {
                        Message::Buf(b) if b.len() > offset => {
                            iov.push(IoSlice::new(&b[offset..]));
                        }
                        // Zero-length or non-byte entries take the
                        // completion path below without a syscall.
                        _ => break,
                    }
                }
                if iov.is_empty() {
                    // The head entry carries no stream bytes: empty buffers
                    // complete trivially, anything else is a misdirected
                    // message and fails its promise.
                    drop(iov);
                    let result = match outbound.first_flushed() {
                        Some((Message::Buf(_), _)) => Ok(()),
                        _ => Err(crate::error::ChannelError::Io(Errno::EINVAL)),
                    };
                    edges.extend(outbound.remove_first(result));
                    continue;
                }
                match socket::writev(fd.as_fd(), &iov) {
                    Ok(n) => n,
                    Err(Errno::EAGAIN) => return Ok((WriteOutcome::Blocked, edges)),
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(e),
                }
            };
            trace!(written, "stream writev");
            edges.extend(outbound.advance(written));
        }
        // Spin budget exhausted with data left: yield to the loop and rely
        // on write readiness rather than monopolizing it here.
        Ok(if outbound.has_flushed() {
            (WriteOutcome::Blocked, edges)
        } else {
            (WriteOutcome::Flushed, edges)
        })
    }
}

/// Open a TCP connection as a channel on `executor`.
///
/// The returned promise completes when the connect finishes (or times out
/// per the config); the handle is usable immediately, and writes queue until
/// the channel becomes active.
pub fn connect(
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
            TcpStreamTransport::new(&addr, &build_opts).map(|t| Box::new(t) as Box<dyn Transport>)
        },
        Some(init),
        move |ch: &Channel, p: OpPromise| {
            ch.connect(addr).add_listener(move |r| {
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

/// Register a connection taken off a listener as a child channel on
/// `executor` (typically a loop from the child group).
pub fn register_accepted(
    executor: &EventLoopHandle,
    sock: AcceptedSocket,
    parent: Option<crate::id::ChannelId>,
    cfg: ChannelConfig,
    opts: SocketOptions,
    init: Initializer,
) -> (ChannelHandle, OpPromise) {
    let promise = OpPromise::with_executor(executor.clone());
    let build_opts = opts;
    let handle = spawn_channel(
        executor,
        cfg,
        parent,
        move || {
            TcpStreamTransport::from_accepted(sock, &build_opts)
                .map(|t| Box::new(t) as Box<dyn Transport>)
        },
        Some(init),
        |_ch: &Channel, p: OpPromise| {
            // Accepted children are active at registration; nothing to do.
            p.try_success();
        },
        promise.clone(),
    );
    (handle, promise)
}
