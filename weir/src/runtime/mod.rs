//! Single-threaded event loops and the group that spawns them.
//!
//! An [`EventLoop`] is one OS thread running a readiness poll plus a
//! run-to-completion task queue; it is the only thread that ever touches the
//! channels registered to it. [`EventLoopHandle`] is the `Send` face of a
//! loop: other threads use it to submit tasks (waking the loop out of a
//! blocked poll via its eventfd), schedule timers and ask `in_event_loop()`
//! when deciding between inline and deferred dispatch.
//!
//! # Loop iteration
//!
//! 1. Compute the poll timeout: zero when runnable tasks are pending,
//!    otherwise the nearest timer deadline, otherwise block.
//! 2. `epoll_wait`, then dispatch readiness to each channel.
//! 3. Run due timers.
//! 4. Drain tasks under a time budget derived from the io-ratio, so task
//!    floods cannot starve I/O and vice versa.
//!
//! Shutdown is cooperative: new submissions are rejected, queued work still
//! runs, remaining channels are closed, then the thread exits.

mod event_loop;
mod group;
mod task;
mod timer;

pub use event_loop::{EventLoopHandle, LoopConfig};
pub use group::EventLoopGroup;
pub use timer::ScheduleHandle;

pub(crate) use event_loop::{LoopCtx, current_ctx, panic_text};

use std::cell::Cell;

thread_local! {
    static ON_LOOP: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is an event loop thread (any loop, not a
/// specific one; use [`EventLoopHandle::in_event_loop`] for that).
pub fn on_loop_thread() -> bool {
    ON_LOOP.with(|f| f.get())
}

pub(crate) fn mark_loop_thread() {
    ON_LOOP.with(|f| f.set(true));
}
