//! Nonblocking socket syscalls used by the epoll transports.
//!
//! All descriptors are created `SOCK_NONBLOCK | SOCK_CLOEXEC` and returned
//! as `OwnedFd`, so ownership is explicit from the first syscall on: a
//! socket moves into a channel transport, then out of scope (closing it) at
//! most once.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::socket::{
    self, AddressFamily, Backlog, SockFlag, SockType, SockaddrIn, SockaddrIn6, SockaddrLike,
    SockaddrStorage, sockopt,
};

/// Create a nonblocking TCP socket for `addr`'s family.
pub fn tcp_socket(addr: &SocketAddr) -> Result<OwnedFd, Errno> {
    new_socket(addr, SockType::Stream)
}

/// Create a nonblocking UDP socket for `addr`'s family.
pub fn udp_socket(addr: &SocketAddr) -> Result<OwnedFd, Errno> {
    new_socket(addr, SockType::Datagram)
}

fn new_socket(addr: &SocketAddr, ty: SockType) -> Result<OwnedFd, Errno> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    socket::socket(
        family,
        ty,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
}

pub fn bind(fd: BorrowedFd<'_>, addr: &SocketAddr) -> Result<(), Errno> {
    match addr {
        SocketAddr::V4(v4) => socket::bind(fd.as_raw_fd(), &SockaddrIn::from(*v4)),
        SocketAddr::V6(v6) => socket::bind(fd.as_raw_fd(), &SockaddrIn6::from(*v6)),
    }
}

pub fn listen(fd: BorrowedFd<'_>, backlog: u32) -> Result<(), Errno> {
    let backlog = Backlog::new(backlog.min(i32::MAX as u32) as i32).unwrap_or(Backlog::MAXCONN);
    socket::listen(&fd, backlog)
}

/// Begin a nonblocking connect. `Ok(true)` means connected immediately
/// (loopback does this); `Ok(false)` means in progress, finish on the next
/// write-ready notification.
pub fn connect(fd: BorrowedFd<'_>, addr: &SocketAddr) -> Result<bool, Errno> {
    let res = match addr {
        SocketAddr::V4(v4) => socket::connect(fd.as_raw_fd(), &SockaddrIn::from(*v4)),
        SocketAddr::V6(v6) => socket::connect(fd.as_raw_fd(), &SockaddrIn6::from(*v6)),
    };
    match res {
        Ok(()) => Ok(true),
        Err(Errno::EINPROGRESS) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Resolve the outcome of an in-progress connect after write readiness.
pub fn finish_connect(fd: BorrowedFd<'_>) -> Result<(), Errno> {
    let err = socket::getsockopt(&fd, sockopt::SocketError)?;
    if err == 0 {
        Ok(())
    } else {
        Err(Errno::from_raw(err))
    }
}

/// Accept one connection; the new socket inherits nonblocking + cloexec.
pub fn accept(fd: BorrowedFd<'_>) -> Result<(OwnedFd, Option<SocketAddr>), Errno> {
    let raw = socket::accept4(
        fd.as_raw_fd(),
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
    )?;
    // SAFETY: accept4 returned a brand-new descriptor that nothing else owns.
    let owned = unsafe { OwnedFd::from_raw_fd(raw) };
    let peer = socket::getpeername::<SockaddrStorage>(raw)
        .ok()
        .and_then(|s| storage_to_std(&s));
    Ok((owned, peer))
}

pub fn local_addr(fd: BorrowedFd<'_>) -> Option<SocketAddr> {
    socket::getsockname::<SockaddrStorage>(fd.as_raw_fd())
        .ok()
        .and_then(|s| storage_to_std(&s))
}

pub fn peer_addr(fd: BorrowedFd<'_>) -> Option<SocketAddr> {
    socket::getpeername::<SockaddrStorage>(fd.as_raw_fd())
        .ok()
        .and_then(|s| storage_to_std(&s))
}

pub fn read(fd: BorrowedFd<'_>, buf: &mut [u8]) -> Result<usize, Errno> {
    nix::unistd::read(fd, buf)
}

pub fn writev(fd: BorrowedFd<'_>, iov: &[std::io::IoSlice<'_>]) -> Result<usize, Errno> {
    nix::sys::uio::writev(fd, iov)
}

pub fn recv_from(
    fd: BorrowedFd<'_>,
    buf: &mut [u8],
) -> Result<(usize, Option<SocketAddr>), Errno> {
    let (n, addr) = socket::recvfrom::<SockaddrStorage>(fd.as_raw_fd(), buf)?;
    Ok((n, addr.as_ref().and_then(storage_to_std)))
}

pub fn send_to(fd: BorrowedFd<'_>, buf: &[u8], addr: &SocketAddr) -> Result<usize, Errno> {
    match addr {
        SocketAddr::V4(v4) => socket::sendto(
            fd.as_raw_fd(),
            buf,
            &SockaddrIn::from(*v4),
            socket::MsgFlags::empty(),
        ),
        SocketAddr::V6(v6) => socket::sendto(
            fd.as_raw_fd(),
            buf,
            &SockaddrIn6::from(*v6),
            socket::MsgFlags::empty(),
        ),
    }
}

/// Half-close the write side.
pub fn shutdown_write(fd: BorrowedFd<'_>) -> Result<(), Errno> {
    socket::shutdown(fd.as_raw_fd(), socket::Shutdown::Write)
}

/// Half-close the read side.
pub fn shutdown_read(fd: BorrowedFd<'_>) -> Result<(), Errno> {
    socket::shutdown(fd.as_raw_fd(), socket::Shutdown::Read)
}

pub fn set_reuseaddr(fd: BorrowedFd<'_>, on: bool) -> Result<(), Errno> {
    socket::setsockopt(&fd, sockopt::ReuseAddr, &on)
}

pub fn set_nodelay(fd: BorrowedFd<'_>, on: bool) -> Result<(), Errno> {
    socket::setsockopt(&fd, sockopt::TcpNoDelay, &on)
}

pub fn set_keepalive(fd: BorrowedFd<'_>, on: bool) -> Result<(), Errno> {
    socket::setsockopt(&fd, sockopt::KeepAlive, &on)
}

pub fn set_send_buffer(fd: BorrowedFd<'_>, bytes: usize) -> Result<(), Errno> {
    socket::setsockopt(&fd, sockopt::SndBuf, &bytes)
}

pub fn set_recv_buffer(fd: BorrowedFd<'_>, bytes: usize) -> Result<(), Errno> {
    socket::setsockopt(&fd, sockopt::RcvBuf, &bytes)
}

/// SO_LINGER with a zero timeout makes close send RST instead of blocking in
/// FIN teardown; the close path consults the config before using it.
pub fn set_linger(fd: BorrowedFd<'_>, seconds: Option<u16>) -> Result<(), Errno> {
    let linger = nix::libc::linger {
        l_onoff: i32::from(seconds.is_some()),
        l_linger: i32::from(seconds.unwrap_or(0)),
    };
    socket::setsockopt(&fd, sockopt::Linger, &linger)
}

fn storage_to_std(storage: &SockaddrStorage) -> Option<SocketAddr> {
    match storage.family() {
        Some(AddressFamily::Inet) => storage
            .as_sockaddr_in()
            .map(|addr| SocketAddr::V4((*addr).into())),
        Some(AddressFamily::Inet6) => storage
            .as_sockaddr_in6()
            .map(|addr| SocketAddr::V6((*addr).into())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[test]
    fn loopback_listen_connect_accept() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = tcp_socket(&any).unwrap();
        set_reuseaddr(server.as_fd(), true).unwrap();
        bind(server.as_fd(), &any).unwrap();
        listen(server.as_fd(), 16).unwrap();
        let bound = local_addr(server.as_fd()).unwrap();

        let client = tcp_socket(&any).unwrap();
        let _ = connect(client.as_fd(), &bound).unwrap();

        // Loopback accept is near-immediate; poll briefly for it.
        let mut accepted = None;
        for _ in 0..100 {
            match accept(server.as_fd()) {
                Ok(pair) => {
                    accepted = Some(pair);
                    break;
                }
                Err(Errno::EAGAIN) => std::thread::sleep(std::time::Duration::from_millis(1)),
                Err(e) => panic!("accept failed: {e}"),
            }
        }
        let (peer_fd, peer) = accepted.expect("no connection accepted");
        assert!(peer.is_some());
        assert!(peer_fd.as_raw_fd() >= 0);
    }

    #[test]
    fn nonblocking_read_reports_eagain() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let sock = udp_socket(&any).unwrap();
        bind(sock.as_fd(), &any).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(read(sock.as_fd(), &mut buf), Err(Errno::EAGAIN));
    }
}
