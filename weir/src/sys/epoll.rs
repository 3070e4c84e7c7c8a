//! The readiness poller: one epoll descriptor plus one wakeup eventfd.
//!
//! A [`Poller`] is owned by exactly one event loop thread. The eventfd is
//! permanently registered for read readiness under [`WAKE_TOKEN`]; foreign
//! threads arm it to break the loop out of a blocked `epoll_wait`, and the
//! loop drains it without ever forwarding that readiness to channel logic.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};

/// Epoll user-data value reserved for the wakeup eventfd. Real channels are
/// keyed by their raw fd, which can never be this large.
pub const WAKE_TOKEN: u64 = u64::MAX;

/// Readiness bits delivered for one descriptor, already separated into the
/// categories the channel layer dispatches on.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// EPOLLHUP or EPOLLERR: the descriptor is unusable.
    pub hangup: bool,
    /// EPOLLRDHUP: the peer shut down its write side.
    pub read_closed: bool,
}

impl Readiness {
    pub fn from_flags(flags: EpollFlags) -> Self {
        Readiness {
            readable: flags.contains(EpollFlags::EPOLLIN),
            writable: flags.contains(EpollFlags::EPOLLOUT),
            hangup: flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR),
            read_closed: flags.contains(EpollFlags::EPOLLRDHUP),
        }
    }
}

/// Interest set for a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
    pub edge_triggered: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        readable: false,
        writable: false,
        edge_triggered: false,
    };

    fn to_flags(self) -> EpollFlags {
        // RDHUP is always subscribed: half-close detection costs nothing and
        // the dispatch layer decides what to do with it.
        let mut flags = EpollFlags::EPOLLRDHUP;
        if self.readable {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.writable {
            flags |= EpollFlags::EPOLLOUT;
        }
        if self.edge_triggered {
            flags |= EpollFlags::EPOLLET;
        }
        flags
    }
}

pub struct Poller {
    epoll: Epoll,
    wakeup: EventFd,
}

impl Poller {
    pub fn new() -> Result<Self, Errno> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        let wakeup = EventFd::from_value_and_flags(
            0,
            EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC,
        )?;
        epoll.add(
            wakeup.as_fd(),
            EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN),
        )?;
        Ok(Poller { epoll, wakeup })
    }

    /// Register `fd` with user data `token` (the channel's raw fd).
    pub fn add(&self, fd: BorrowedFd<'_>, interest: Interest, token: u64) -> Result<(), Errno> {
        self.epoll
            .add(fd, EpollEvent::new(interest.to_flags(), token))
    }

    /// Replace the interest set of a registered descriptor.
    pub fn modify(&self, fd: BorrowedFd<'_>, interest: Interest, token: u64) -> Result<(), Errno> {
        let mut ev = EpollEvent::new(interest.to_flags(), token);
        self.epoll.modify(fd, &mut ev)
    }

    /// Remove a descriptor. EBADF/ENOENT are fine here: the fd may already
    /// have been closed by the transport.
    pub fn delete(&self, fd: BorrowedFd<'_>) -> Result<(), Errno> {
        match self.epoll.delete(fd) {
            Err(Errno::EBADF) | Err(Errno::ENOENT) => Ok(()),
            other => other,
        }
    }

    /// Wait for readiness. `None` blocks until woken.
    pub fn wait(
        &self,
        events: &mut [EpollEvent],
        timeout: Option<Duration>,
    ) -> Result<usize, Errno> {
        self.epoll.wait(events, to_epoll_timeout(timeout))
    }

    /// Arm the wakeup eventfd from any thread.
    pub fn raw_waker(&self) -> RawFd {
        self.wakeup.as_fd().as_raw_fd()
    }

    /// Consume pending wakeups; called by the loop when [`WAKE_TOKEN`] fires.
    pub fn drain_wakeup(&self) {
        // Counter semantics: one read clears however many arms happened.
        let _ = self.wakeup.read();
    }
}

/// Write one wakeup tick to an eventfd owned by another thread's poller.
///
/// Separate from [`Poller`] because the waking side only ever holds the raw
/// descriptor, never the poller itself.
pub fn wake(eventfd: RawFd) {
    // SAFETY: the fd comes from a live Poller whose lifetime is pinned by
    // the Arc'd loop state of the thread being woken.
    let fd = unsafe { BorrowedFd::borrow_raw(eventfd) };
    let buf = 1u64.to_ne_bytes();
    let _ = nix::unistd::write(fd, &buf);
}

fn to_epoll_timeout(timeout: Option<Duration>) -> EpollTimeout {
    match timeout {
        None => EpollTimeout::NONE,
        Some(d) => {
            let mut millis = d.as_millis();
            if millis == 0 && !d.is_zero() {
                // Round sub-millisecond deadlines up instead of spinning.
                millis = 1;
            }
            let millis = millis.min(i32::MAX as u128) as u64;
            EpollTimeout::try_from(Duration::from_millis(millis)).unwrap_or(EpollTimeout::NONE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wakeup_round_trip() {
        let poller = Poller::new().unwrap();
        wake(poller.raw_waker());

        let mut events = [EpollEvent::empty(); 4];
        let n = poller
            .wait(&mut events, Some(Duration::from_millis(100)))
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(events[0].data(), WAKE_TOKEN);
        poller.drain_wakeup();

        // Drained: the next wait times out empty.
        let n = poller
            .wait(&mut events, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(n, 0);
    }
}
