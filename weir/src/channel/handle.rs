//! The `Send` face of a channel.
//!
//! A handle carries the channel id, the owning loop and the shared
//! backpressure state; operations called off-loop become tasks. The write
//! path is the interesting one: the pending-byte counter is charged on the
//! submitting thread *before* the task is queued (so writability is honest
//! under scheduling delay) and settled by the task once the write landed in
//! the outbound buffer. The task shells themselves come from a per-thread
//! [`Recycler`] pool and are recycled from the loop thread: the
//! cross-thread return path in action.
//!
//! [`Recycler`]: crate::recycler::Recycler

use std::sync::Arc;
use std::sync::atomic::Ordering;

use arc_swap::ArcSwap;
use tracing::trace;

use crate::error::{ChannelError, PipelineError};
use crate::id::ChannelId;
use crate::pipeline::Handler;
use crate::promise::OpPromise;
use crate::recycler::Recycler;
use crate::runtime::EventLoopHandle;

use super::config::ChannelConfig;
use super::outbound::{PendingBytes, WritabilityEdge};
use super::{Channel, Message};

pub(crate) struct HandleShared {
    pub(crate) id: ChannelId,
    pub(crate) executor: EventLoopHandle,
    pub(crate) cfg: Arc<ArcSwap<ChannelConfig>>,
    pub(crate) pending: Arc<PendingBytes>,
    pub(crate) accepting: Arc<std::sync::atomic::AtomicBool>,
    pub(crate) close_promise: OpPromise,
}

/// Cross-thread reference to a channel. Cloneable; all clones address the
/// same channel on its owning loop.
#[derive(Clone)]
pub struct ChannelHandle {
    shared: Arc<HandleShared>,
}

/// Recyclable shell for the cross-thread write path.
#[derive(Default)]
struct WriteTask {
    msg: Option<Message>,
    promise: Option<OpPromise>,
    size: usize,
    flush: bool,
    crossed: bool,
}

thread_local! {
    static WRITE_TASKS: Recycler<WriteTask> = Recycler::new(512, WriteTask::default);
}

impl ChannelHandle {
    pub(crate) fn from_shared(shared: Arc<HandleShared>) -> Self {
        ChannelHandle { shared }
    }

    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    pub fn event_loop(&self) -> EventLoopHandle {
        self.shared.executor.clone()
    }

    /// Whether writes are currently advisable (pending bytes under the high
    /// watermark). Safe to poll from any thread.
    pub fn is_writable(&self) -> bool {
        self.shared.pending.is_writable()
    }

    /// Outbound bytes accepted but not yet written to the OS.
    pub fn pending_bytes(&self) -> usize {
        self.shared.pending.bytes()
    }

    /// Completes when the channel will never be usable again.
    pub fn close_promise(&self) -> OpPromise {
        self.shared.close_promise.clone()
    }

    pub fn config(&self) -> Arc<ChannelConfig> {
        self.shared.cfg.load_full()
    }

    pub fn update_config(&self, f: impl Fn(&mut ChannelConfig)) {
        self.shared.cfg.rcu(|cfg| {
            let mut next = ChannelConfig::clone(cfg);
            f(&mut next);
            next
        });
    }

    /// Run `f` with the channel on its owning loop thread. Fire-and-forget:
    /// dropped silently if the channel is gone; pair with a promise or a
    /// side channel when a result is needed.
    pub fn invoke(&self, f: impl FnOnce(&Channel) + Send + 'static) {
        self.run_on_loop(None, f);
    }

    // Channel operations.

    pub fn write(&self, msg: Message) -> OpPromise {
        self.write_inner(msg, false)
    }

    pub fn write_and_flush(&self, msg: Message) -> OpPromise {
        self.write_inner(msg, true)
    }

    pub fn flush(&self) {
        self.run_on_loop(None, |ch| ch.flush());
    }

    /// Arm one read (meaningful with auto-read off).
    pub fn read(&self) {
        self.run_on_loop(None, |ch| ch.read());
    }

    pub fn close(&self) -> OpPromise {
        let promise = OpPromise::with_executor(self.event_loop());
        // Close must get through even after the accepting gate drops; it is
        // the teardown itself, not new work.
        let p = promise.clone();
        let id = self.shared.id;
        let close_promise = self.shared.close_promise.clone();
        let submitted = self.shared.executor.submit(move |ctx| {
            let ch = ctx.channels.borrow().by_id(id);
            match ch {
                Some(ch) => ch.close(p),
                None => {
                    // Already torn down (or never finished registering).
                    if close_promise.is_done() {
                        p.try_success();
                    } else {
                        close_promise.add_listener(move |_| {
                            p.try_success();
                        });
                    }
                }
            }
        });
        if submitted.is_err() {
            promise.try_success();
        }
        promise
    }

    pub fn disconnect(&self) -> OpPromise {
        let promise = OpPromise::with_executor(self.event_loop());
        let p = promise.clone();
        self.run_on_loop(Some(promise.clone()), move |ch| {
            ch.disconnect().add_listener(move |r| complete(&p, r));
        });
        promise
    }

    pub fn deregister(&self) -> OpPromise {
        let promise = OpPromise::with_executor(self.event_loop());
        let p = promise.clone();
        self.run_on_loop(Some(promise.clone()), move |ch| {
            ch.deregister().add_listener(move |r| complete(&p, r));
        });
        promise
    }

    pub fn shutdown_output(&self) -> OpPromise {
        let promise = OpPromise::with_executor(self.event_loop());
        let p = promise.clone();
        self.run_on_loop(Some(promise.clone()), move |ch| {
            ch.shutdown_output().add_listener(move |r| complete(&p, r));
        });
        promise
    }

    // Pipeline mutation from any thread. Each returns a promise that
    // completes once the loop has applied the change; `await_done` gives
    // the blocking flavor.

    pub fn add_last(&self, name: &str, handler: impl Handler) -> OpPromise {
        let name = name.to_string();
        self.mutate_pipeline(move |ch| ch.add_last(&name, handler))
    }

    pub fn add_first(&self, name: &str, handler: impl Handler) -> OpPromise {
        let name = name.to_string();
        self.mutate_pipeline(move |ch| ch.add_first(&name, handler))
    }

    pub fn add_before(&self, anchor: &str, name: &str, handler: impl Handler) -> OpPromise {
        let (anchor, name) = (anchor.to_string(), name.to_string());
        self.mutate_pipeline(move |ch| ch.add_before(&anchor, &name, handler))
    }

    pub fn add_after(&self, anchor: &str, name: &str, handler: impl Handler) -> OpPromise {
        let (anchor, name) = (anchor.to_string(), name.to_string());
        self.mutate_pipeline(move |ch| ch.add_after(&anchor, &name, handler))
    }

    pub fn remove_handler(&self, name: &str) -> OpPromise {
        let name = name.to_string();
        self.mutate_pipeline(move |ch| ch.remove_handler(&name))
    }

    pub fn replace_handler(
        &self,
        old: &str,
        new_name: &str,
        handler: impl Handler,
    ) -> OpPromise {
        let (old, new_name) = (old.to_string(), new_name.to_string());
        self.mutate_pipeline(move |ch| ch.replace_handler(&old, &new_name, handler))
    }

    fn mutate_pipeline(
        &self,
        f: impl FnOnce(&Channel) -> Result<(), PipelineError> + Send + 'static,
    ) -> OpPromise {
        let promise = OpPromise::with_executor(self.event_loop());
        let p = promise.clone();
        self.run_on_loop(Some(promise.clone()), move |ch| {
            match f(ch) {
                Ok(()) => p.try_success(),
                Err(e) => {
                    trace!(error = %e, "pipeline mutation rejected");
                    p.try_failure(ChannelError::Pipeline(e))
                }
            };
        });
        promise
    }

    /// Resolve the channel on its loop and run `f` there. Fails `fail` fast
    /// when the channel stopped accepting work or is gone.
    pub(crate) fn run_on_loop(
        &self,
        fail: Option<OpPromise>,
        f: impl FnOnce(&Channel) + Send + 'static,
    ) {
        if !self.shared.accepting.load(Ordering::Acquire) {
            if let Some(p) = fail {
                p.try_failure(ChannelError::Closed);
            }
            return;
        }
        let id = self.shared.id;

        // Already home: call straight through.
        if self.shared.executor.in_event_loop()
            && let Some(ctx) = crate::runtime::current_ctx()
        {
            let ch = ctx.channels.borrow().by_id(id);
            match ch {
                Some(ch) => f(&ch),
                None => {
                    if let Some(p) = fail {
                        p.try_failure(ChannelError::Closed);
                    }
                }
            }
            return;
        }

        let fail_clone = fail.clone();
        let submitted = self.shared.executor.submit(move |ctx| {
            let ch = ctx.channels.borrow().by_id(id);
            match ch {
                Some(ch) => f(&ch),
                None => {
                    if let Some(p) = fail_clone {
                        p.try_failure(ChannelError::Closed);
                    }
                }
            }
        });
        if submitted.is_err()
            && let Some(p) = fail
        {
            p.try_failure(ChannelError::LoopShutDown);
        }
    }

    fn write_inner(&self, msg: Message, flush: bool) -> OpPromise {
        let promise = OpPromise::with_executor(self.event_loop());
        if !self.shared.accepting.load(Ordering::Acquire) {
            promise.try_failure(ChannelError::Closed);
            return promise;
        }

        // On the loop already: the pipeline does its own accounting.
        if self.shared.executor.in_event_loop() {
            let p = promise.clone();
            self.run_on_loop(Some(promise.clone()), move |ch| {
                ch.write_with(msg, p);
                if flush {
                    ch.flush();
                }
            });
            return promise;
        }

        // Charge the shared counter before queueing so writability reflects
        // this message from the moment the caller let go of it.
        let size = (self.shared.cfg.load().size_estimator)(&msg).max(0) as usize;
        let crossed =
            self.shared.pending.add(size) == Some(WritabilityEdge::BecameUnwritable);

        let (mut task, task_handle) = WRITE_TASKS.with(|pool| pool.get());
        task.msg = Some(msg);
        task.promise = Some(promise.clone());
        task.size = size;
        task.flush = flush;
        task.crossed = crossed;

        let id = self.shared.id;
        let pending = self.shared.pending.clone();
        let submitted = self.shared.executor.submit(move |ctx| {
            let msg = task.msg.take().expect("write task filled");
            let promise = task.promise.take().expect("write task filled");
            let (size, flush, crossed) = (task.size, task.flush, task.crossed);
            let ch = ctx.channels.borrow().by_id(id);
            match ch {
                Some(ch) => {
                    if crossed {
                        // The edge crossed at submit time on the caller's
                        // thread; the event itself belongs on the loop.
                        ch.fire_writability_changed();
                    }
                    ch.write_with(msg, promise);
                    if flush {
                        ch.flush();
                    }
                }
                None => {
                    promise.try_failure(ChannelError::Closed);
                }
            }
            // Settle the pre-charge; the outbound buffer carries its own
            // accounting from here (or the write failed and owes nothing).
            pending.sub(size);
            task.size = 0;
            task.flush = false;
            task.crossed = false;
            if let Err(e) = task_handle.recycle(task) {
                trace!(error = %e, "write task not recycled");
            }
        });

        if submitted.is_err() {
            // Refund the pre-charge; the task (and its message) died with
            // the queue.
            self.shared.pending.sub(size);
            promise.try_failure(ChannelError::LoopShutDown);
        }
        promise
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChannelHandle({})", self.shared.id)
    }
}

fn complete(promise: &OpPromise, result: &Result<(), ChannelError>) {
    match result {
        Ok(()) => promise.try_success(),
        Err(e) => promise.try_failure(e.clone()),
    };
}
