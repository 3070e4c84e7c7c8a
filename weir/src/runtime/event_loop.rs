//! The event loop: poll, dispatch, run tasks, repeat.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;
use nix::errno::Errno;
use nix::sys::epoll::EpollEvent;
use tracing::{debug, error, trace, warn};

use crate::channel::Channel;
use crate::error::ChannelError;
use crate::id::ChannelId;
use crate::sys::epoll::{Poller, Readiness, wake};
use crate::sys::WAKE_TOKEN;

use super::task::{LocalTask, RemoteTask};
use super::timer::{ScheduleHandle, TimerHeap};

/// Tuning knobs for one loop, fixed at spawn time.
#[derive(Clone, Debug)]
pub struct LoopConfig {
    /// Share of each iteration spent on I/O versus queued tasks, in percent.
    /// 100 means "run every pending task after each poll, unbounded".
    pub io_ratio: u8,
    /// Capacity of the epoll event batch buffer.
    pub events_capacity: usize,
    /// Backoff applied after a loop-level poll failure.
    pub failure_backoff: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        LoopConfig {
            io_ratio: 50,
            events_capacity: 1024,
            failure_backoff: Duration::from_millis(100),
        }
    }
}

const STATE_RUNNING: u8 = 0;
const STATE_SHUTTING_DOWN: u8 = 1;
const STATE_TERMINATED: u8 = 2;

/// State shared between a loop thread and every handle to it.
pub(crate) struct LoopShared {
    index: usize,
    queue: SegQueue<RemoteTask>,
    wake_fd: RawFd,
    /// True while a wakeup tick is armed and not yet consumed; keeps
    /// concurrent submitters from writing the eventfd more than once per
    /// poll cycle.
    wake_pending: AtomicBool,
    state: AtomicU8,
    thread: OnceLock<ThreadId>,
}

/// `Send` face of an event loop.
#[derive(Clone)]
pub struct EventLoopHandle {
    pub(crate) shared: Arc<LoopShared>,
}

impl EventLoopHandle {
    /// Whether the calling thread is this loop's thread.
    pub fn in_event_loop(&self) -> bool {
        self.shared.thread.get() == Some(&std::thread::current().id())
    }

    /// Run `f` on the loop thread, waking the loop if it is blocked in poll.
    pub fn execute(
        &self,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<(), ChannelError> {
        self.submit(move |_| f())
    }

    /// Like [`execute`](Self::execute) but without the wakeup: the task runs
    /// whenever the loop next drains its queue. Used for continuations that
    /// do not need to preempt a blocked poll.
    pub fn execute_no_wake(
        &self,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<(), ChannelError> {
        self.submit_no_wake(move |_| f())
    }

    /// Run `f` after `delay` on the loop thread.
    ///
    /// The handle comes back immediately; the heap entry is created once the
    /// submission reaches the loop, so a cancel racing the submission still
    /// takes effect at fire time.
    pub fn schedule(
        &self,
        delay: Duration,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<ScheduleHandle, ChannelError> {
        let deadline = Instant::now() + delay;
        let handle = ScheduleHandle::detached();
        let entry_handle = handle.clone();
        self.submit(move |ctx| {
            let task: LocalTask = Box::new(move |_| f());
            ctx.timers
                .borrow_mut()
                .push_with_handle(deadline, task, &entry_handle);
        })?;
        Ok(handle)
    }

    /// Reject new work and let the loop wind down: pending tasks run,
    /// remaining channels close, then the thread exits.
    pub fn shutdown(&self) {
        let flipped = self
            .shared
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_SHUTTING_DOWN,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if flipped {
            debug!(loop_index = self.shared.index, "event loop shutting down");
            self.wake();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) >= STATE_SHUTTING_DOWN
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == STATE_TERMINATED
    }

    /// Loop index within its group, for logging.
    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub(crate) fn submit(
        &self,
        f: impl FnOnce(&Rc<LoopCtx>) + Send + 'static,
    ) -> Result<(), ChannelError> {
        self.submit_inner(Box::new(f), true)
    }

    pub(crate) fn submit_no_wake(
        &self,
        f: impl FnOnce(&Rc<LoopCtx>) + Send + 'static,
    ) -> Result<(), ChannelError> {
        self.submit_inner(Box::new(f), false)
    }

    fn submit_inner(&self, task: RemoteTask, wakeup: bool) -> Result<(), ChannelError> {
        if self.is_shutting_down() {
            return Err(ChannelError::LoopShutDown);
        }
        self.shared.queue.push(task);
        // Re-check: a racing shutdown may stop draining the queue. The task
        // either runs during wind-down or is dropped with the queue; the
        // caller's promise handling covers both.
        if wakeup && !self.in_event_loop() {
            self.wake();
        }
        Ok(())
    }

    pub(crate) fn wake(&self) {
        if self
            .shared
            .wake_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            wake(self.shared.wake_fd);
        }
    }
}

impl PartialEq for EventLoopHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for EventLoopHandle {}

impl std::fmt::Debug for EventLoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventLoopHandle({})", self.shared.index)
    }
}

/// Registered channels of one loop, keyed by raw fd (the epoll token) with a
/// secondary id index for cross-thread operations.
#[derive(Default)]
pub(crate) struct ChannelTable {
    by_fd: HashMap<RawFd, Channel>,
    by_id: HashMap<ChannelId, RawFd>,
}

impl ChannelTable {
    pub(crate) fn insert(&mut self, fd: RawFd, channel: Channel) {
        self.by_id.insert(channel.id(), fd);
        self.by_fd.insert(fd, channel);
    }

    pub(crate) fn remove(&mut self, fd: RawFd) -> Option<Channel> {
        let ch = self.by_fd.remove(&fd);
        if let Some(ch) = &ch {
            self.by_id.remove(&ch.id());
        }
        ch
    }

    pub(crate) fn by_fd(&self, fd: RawFd) -> Option<Channel> {
        self.by_fd.get(&fd).cloned()
    }

    pub(crate) fn by_id(&self, id: ChannelId) -> Option<Channel> {
        self.by_id.get(&id).and_then(|fd| self.by_fd.get(fd)).cloned()
    }

    pub(crate) fn all(&self) -> Vec<Channel> {
        self.by_fd.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_fd.len()
    }
}

/// Loop-local state. Only the loop thread ever sees this type; channels keep
/// an `Rc` to reach the poller, timers and task queue without going through
/// their own handle.
pub(crate) struct LoopCtx {
    pub(crate) shared: Arc<LoopShared>,
    pub(crate) poller: Poller,
    pub(crate) timers: RefCell<TimerHeap>,
    pub(crate) local: RefCell<VecDeque<LocalTask>>,
    pub(crate) channels: RefCell<ChannelTable>,
    pub(crate) config: LoopConfig,
}

impl LoopCtx {
    pub(crate) fn handle(&self) -> EventLoopHandle {
        EventLoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Queue a task on the loop's own thread; may capture `!Send` state.
    pub(crate) fn defer(&self, f: impl FnOnce(&Rc<LoopCtx>) + 'static) {
        self.local.borrow_mut().push_back(Box::new(f));
    }

    /// Schedule a loop-local task; used for connect timeouts.
    pub(crate) fn schedule_local(
        &self,
        delay: Duration,
        f: impl FnOnce(&Rc<LoopCtx>) + 'static,
    ) -> ScheduleHandle {
        self.timers
            .borrow_mut()
            .push(Instant::now() + delay, Box::new(f))
    }
}

/// The `Send` pieces of a loop, created on the spawning thread so the
/// handle (and its wakeup fd) exist before the loop thread starts. The
/// thread itself grows this into a [`LoopCtx`]; the task queues and channel
/// table hold `!Send` state and may only ever be built in place.
pub(crate) struct LoopSeed {
    shared: Arc<LoopShared>,
    poller: Poller,
    config: LoopConfig,
}

impl LoopSeed {
    pub(crate) fn into_ctx(self) -> LoopCtx {
        LoopCtx {
            shared: self.shared,
            poller: self.poller,
            timers: RefCell::new(TimerHeap::default()),
            local: RefCell::new(VecDeque::new()),
            channels: RefCell::new(ChannelTable::default()),
            config: self.config,
        }
    }
}

pub(crate) fn new_loop(
    index: usize,
    config: LoopConfig,
) -> Result<(EventLoopHandle, LoopSeed), Errno> {
    let poller = Poller::new()?;
    let shared = Arc::new(LoopShared {
        index,
        queue: SegQueue::new(),
        wake_fd: poller.raw_waker(),
        wake_pending: AtomicBool::new(false),
        state: AtomicU8::new(STATE_RUNNING),
        thread: OnceLock::new(),
    });
    let handle = EventLoopHandle {
        shared: shared.clone(),
    };
    Ok((
        handle,
        LoopSeed {
            shared,
            poller,
            config,
        },
    ))
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<LoopCtx>>> = const { RefCell::new(None) };
}

/// The loop-local state of the loop running on this thread, if any; lets
/// handles short-circuit to inline execution when already home.
pub(crate) fn current_ctx() -> Option<Rc<LoopCtx>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// The loop body; runs until cooperative shutdown completes.
pub(crate) fn run_loop(ctx: Rc<LoopCtx>) {
    let _ = ctx.shared.thread.set(std::thread::current().id());
    super::mark_loop_thread();
    CURRENT.with(|c| *c.borrow_mut() = Some(ctx.clone()));
    debug!(loop_index = ctx.shared.index, "event loop started");

    let mut events = vec![EpollEvent::empty(); ctx.config.events_capacity];
    let mut closing = false;

    loop {
        if !closing && ctx.handle().is_shutting_down() {
            closing = true;
            close_all(&ctx);
        }
        if closing && quiescent(&ctx) {
            break;
        }

        let timeout = poll_timeout(&ctx, closing);
        let n = match ctx.poller.wait(&mut events, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                // A failing poll is a loop-level problem; back off briefly
                // and keep serving rather than taking every channel down.
                error!(loop_index = ctx.shared.index, error = %e, "epoll_wait failed");
                std::thread::sleep(ctx.config.failure_backoff);
                continue;
            }
        };

        ctx.shared.wake_pending.store(false, Ordering::Release);
        let io_start = Instant::now();
        for ev in &events[..n] {
            let token = ev.data();
            if token == WAKE_TOKEN {
                ctx.poller.drain_wakeup();
                continue;
            }
            let ready = Readiness::from_flags(ev.events());
            let channel = ctx.channels.borrow().by_fd(token as RawFd);
            let Some(channel) = channel else {
                // Closed earlier in this same batch; stale readiness.
                trace!(fd = token, "readiness for unregistered fd ignored");
                continue;
            };
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| {
                channel.handle_readiness(ready);
            })) {
                error!(
                    loop_index = ctx.shared.index,
                    channel = %channel.id(),
                    panic = %panic_text(&panic),
                    "panic escaped readiness dispatch; closing channel"
                );
                channel.close(crate::promise::OpPromise::void());
            }
        }
        let io_time = io_start.elapsed();

        run_timers(&ctx);
        run_tasks(&ctx, task_budget(&ctx.config, io_time, closing));
    }

    ctx.timers.borrow_mut().clear();
    CURRENT.with(|c| c.borrow_mut().take());
    ctx.shared.state.store(STATE_TERMINATED, Ordering::Release);
    debug!(loop_index = ctx.shared.index, "event loop terminated");
}

fn poll_timeout(ctx: &LoopCtx, closing: bool) -> Option<Duration> {
    if !ctx.local.borrow().is_empty() || !ctx.shared.queue.is_empty() {
        return Some(Duration::ZERO);
    }
    if closing {
        // Bounded wait so quiescence is re-checked even with no traffic.
        return Some(Duration::from_millis(10));
    }
    ctx.timers
        .borrow_mut()
        .next_deadline()
        .map(|deadline| deadline.saturating_duration_since(Instant::now()))
}

fn task_budget(config: &LoopConfig, io_time: Duration, closing: bool) -> Option<Duration> {
    if closing || config.io_ratio >= 100 {
        return None; // unbounded
    }
    let ratio = config.io_ratio.max(1) as u32;
    Some(io_time * (100 - ratio) / ratio)
}

fn run_timers(ctx: &Rc<LoopCtx>) {
    let now = Instant::now();
    loop {
        let task = ctx.timers.borrow_mut().pop_due(now);
        let Some(task) = task else { break };
        run_guarded(ctx, task, "timer");
    }
}

fn run_tasks(ctx: &Rc<LoopCtx>, budget: Option<Duration>) {
    let deadline = budget.map(|b| Instant::now() + b);
    let mut ran: u32 = 0;
    loop {
        // Pull foreign submissions into the local queue so everything runs
        // in one FIFO.
        while let Some(task) = ctx.shared.queue.pop() {
            ctx.local.borrow_mut().push_back(task);
        }
        let task = ctx.local.borrow_mut().pop_front();
        let Some(task) = task else { break };
        run_guarded(ctx, task, "task");
        ran += 1;
        // Check the clock only every 64 tasks; Instant::now is not free.
        if ran % 64 == 0
            && let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            break;
        }
    }
}

fn run_guarded(ctx: &Rc<LoopCtx>, task: LocalTask, kind: &str) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| task(ctx))) {
        error!(
            loop_index = ctx.shared.index,
            kind,
            panic = %panic_text(&panic),
            "panic escaped a loop task"
        );
    }
}

fn close_all(ctx: &Rc<LoopCtx>) {
    let channels = ctx.channels.borrow().all();
    if !channels.is_empty() {
        warn!(
            loop_index = ctx.shared.index,
            count = channels.len(),
            "closing channels left registered at shutdown"
        );
    }
    for ch in channels {
        ch.close(crate::promise::OpPromise::void());
    }
}

fn quiescent(ctx: &LoopCtx) -> bool {
    ctx.channels.borrow().len() == 0
        && ctx.local.borrow().is_empty()
        && ctx.shared.queue.is_empty()
}

pub(crate) fn panic_text(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
