//! The channel: one descriptor, one pipeline, one owning loop.
//!
//! A `Channel` is a cheap `Rc` clone usable only on its loop thread; the
//! `Send` face is [`ChannelHandle`]. All lifecycle transitions run here:
//!
//! ```text
//! unregistered → registered → active ⇄ inactive → deregistered → closed
//! ```
//!
//! The transport-facing internals (the `*0` methods) are the only code that
//! touches the descriptor, the interest set and the outbound buffer; the
//! pipeline's head sentinel funnels every outbound operation into them.

mod config;
mod handle;
mod outbound;

pub use config::{ChannelConfig, SizeEstimator, SocketOptions};
pub use handle::ChannelHandle;

pub(crate) use handle::HandleShared;
pub(crate) use outbound::{OutboundBuffer, PendingBytes, WritabilityEdge};

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{ChannelError, Errno, IoClass, PipelineError, classify};
use crate::id::ChannelId;
use crate::pipeline::{
    Context, Handler, HeadHandler, Inbound, Outbound, Pipeline, TailHandler, UserEvent,
    fire_inbound_from, fire_outbound_from,
};
use crate::pipeline::{HEAD, TAIL};
use crate::promise::OpPromise;
use crate::runtime::{EventLoopHandle, LoopCtx, ScheduleHandle};
use crate::sys::epoll::Interest;
use crate::sys::Readiness;
use crate::transport::{AcceptedSocket, ReadResult, Transport, WriteOutcome};

/// A message travelling through a pipeline.
#[derive(Debug)]
pub enum Message {
    /// A chunk of stream bytes.
    Buf(Bytes),
    /// One datagram with its peer address.
    Datagram { data: Bytes, peer: SocketAddr },
    /// A connection taken off a listener, ready to become a child channel.
    Accepted(AcceptedSocket),
}

impl Message {
    /// Payload length in bytes; what the write loop accounts against.
    pub fn byte_len(&self) -> usize {
        match self {
            Message::Buf(b) => b.len(),
            Message::Datagram { data, .. } => data.len(),
            Message::Accepted(_) => 0,
        }
    }

    /// Default watermark estimator: payload length, nothing for accepted
    /// sockets.
    pub fn default_size_estimate(msg: &Message) -> isize {
        msg.byte_len() as isize
    }
}

/// User event fired instead of closing when the peer shuts down its write
/// side and `allow_half_closure` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputShutdown;

/// Builds a channel's pipeline right after construction, before
/// registration events fire.
pub type Initializer = Arc<dyn Fn(&Channel) + Send + Sync>;

struct PendingConnect {
    promise: OpPromise,
    timer: Option<ScheduleHandle>,
}

pub(crate) struct ChannelInner {
    id: ChannelId,
    parent: Option<ChannelId>,
    loop_ctx: Rc<LoopCtx>,
    cfg: Arc<ArcSwap<ChannelConfig>>,
    pipeline: RefCell<Pipeline>,
    outbound: RefCell<OutboundBuffer>,
    pending: Arc<PendingBytes>,
    transport: RefCell<Box<dyn Transport>>,
    registered: Cell<bool>,
    /// Became active at least once; gates the inactive event on close.
    active_seen: Cell<bool>,
    interest: Cell<Interest>,
    /// An explicit `read()` was requested and not yet satisfied.
    read_pending: Cell<bool>,
    in_flush: Cell<bool>,
    /// Close requested while a flush was on the stack; retried afterwards.
    close_after_flush: RefCell<Option<OpPromise>>,
    close_initiated: Cell<bool>,
    close_promise: OpPromise,
    /// Pausable gate for the channel's handles: once teardown starts, no
    /// new work is accepted from other threads.
    accepting: Arc<AtomicBool>,
    connect_pending: RefCell<Option<PendingConnect>>,
    input_shutdown: Cell<bool>,
}

/// Loop-thread view of a connection. Clones share the same inner state.
#[derive(Clone)]
pub struct Channel {
    inner: Rc<ChannelInner>,
}

enum Anchor {
    First,
    Last,
    Before(usize),
    After(usize),
}

impl Channel {
    pub(crate) fn build(
        loop_ctx: Rc<LoopCtx>,
        parts: ChannelParts,
        parent: Option<ChannelId>,
        transport: Box<dyn Transport>,
    ) -> Channel {
        let pipeline = Pipeline::new(
            Arc::new(Mutex::new(HeadHandler)),
            Arc::new(Mutex::new(TailHandler)),
        );
        let edge_triggered = parts.cfg.load().edge_triggered;
        Channel {
            inner: Rc::new(ChannelInner {
                id: parts.id,
                parent,
                loop_ctx,
                outbound: RefCell::new(OutboundBuffer::new(parts.pending.clone())),
                pending: parts.pending,
                cfg: parts.cfg,
                pipeline: RefCell::new(pipeline),
                transport: RefCell::new(transport),
                registered: Cell::new(false),
                active_seen: Cell::new(false),
                interest: Cell::new(Interest {
                    readable: false,
                    writable: false,
                    edge_triggered,
                }),
                read_pending: Cell::new(false),
                in_flush: Cell::new(false),
                close_after_flush: RefCell::new(None),
                close_initiated: Cell::new(false),
                close_promise: parts.close_promise,
                accepting: parts.accepting,
                connect_pending: RefCell::new(None),
                input_shutdown: Cell::new(false),
            }),
        }
    }

    // Identity and state probes.

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    /// The listener this channel was accepted from, if any.
    pub fn parent_id(&self) -> Option<ChannelId> {
        self.inner.parent
    }

    pub fn event_loop(&self) -> EventLoopHandle {
        self.inner.loop_ctx.handle()
    }

    pub fn is_registered(&self) -> bool {
        self.inner.registered.get()
    }

    pub fn is_open(&self) -> bool {
        self.inner.transport.borrow().is_open()
    }

    pub fn is_active(&self) -> bool {
        self.inner.transport.borrow().is_active()
    }

    pub fn is_writable(&self) -> bool {
        self.inner.pending.is_writable()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.borrow_mut().local_addr()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.borrow_mut().remote_addr()
    }

    /// Completes exactly once, when the channel will never be usable again.
    pub fn close_promise(&self) -> OpPromise {
        self.inner.close_promise.clone()
    }

    /// Snapshot of the live configuration.
    pub fn config(&self) -> Arc<ChannelConfig> {
        self.inner.cfg.load_full()
    }

    pub fn update_config(&self, f: impl Fn(&mut ChannelConfig)) {
        self.inner.cfg.rcu(|cfg| {
            let mut next = ChannelConfig::clone(cfg);
            f(&mut next);
            next
        });
    }

    /// The `Send` face of this channel.
    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle::from_shared(Arc::new(HandleShared {
            id: self.inner.id,
            executor: self.event_loop(),
            cfg: self.inner.cfg.clone(),
            pending: self.inner.pending.clone(),
            accepting: self.inner.accepting.clone(),
            close_promise: self.inner.close_promise.clone(),
        }))
    }

    pub(crate) fn loop_ctx(&self) -> Rc<LoopCtx> {
        self.inner.loop_ctx.clone()
    }

    pub(crate) fn pipeline_ref(&self) -> std::cell::Ref<'_, Pipeline> {
        self.inner.pipeline.borrow()
    }

    pub(crate) fn pipeline_mut(&self) -> std::cell::RefMut<'_, Pipeline> {
        self.inner.pipeline.borrow_mut()
    }

    // Pipeline mutation. All of these run on the loop thread; foreign
    // threads go through the ChannelHandle equivalents.

    pub fn add_last(&self, name: &str, handler: impl Handler) -> Result<(), PipelineError> {
        self.add_handler(Anchor::Last, name, Arc::new(Mutex::new(handler)), None)
    }

    pub fn add_first(&self, name: &str, handler: impl Handler) -> Result<(), PipelineError> {
        self.add_handler(Anchor::First, name, Arc::new(Mutex::new(handler)), None)
    }

    pub fn add_before(
        &self,
        anchor: &str,
        name: &str,
        handler: impl Handler,
    ) -> Result<(), PipelineError> {
        let idx = self.index_of(anchor)?;
        self.add_handler(Anchor::Before(idx), name, Arc::new(Mutex::new(handler)), None)
    }

    pub fn add_after(
        &self,
        anchor: &str,
        name: &str,
        handler: impl Handler,
    ) -> Result<(), PipelineError> {
        let idx = self.index_of(anchor)?;
        self.add_handler(Anchor::After(idx), name, Arc::new(Mutex::new(handler)), None)
    }

    /// Add a handler whose callbacks run on `executor` instead of the
    /// channel's own loop.
    pub fn add_last_pinned(
        &self,
        name: &str,
        executor: EventLoopHandle,
        handler: impl Handler,
    ) -> Result<(), PipelineError> {
        self.add_handler(
            Anchor::Last,
            name,
            Arc::new(Mutex::new(handler)),
            Some(executor),
        )
    }

    pub fn remove_handler(&self, name: &str) -> Result<(), PipelineError> {
        let idx = self.index_of(name)?;
        self.inner.pipeline.borrow_mut().unlink(idx);
        self.fire_handler_removed(idx);
        Ok(())
    }

    pub fn replace_handler(
        &self,
        old: &str,
        new_name: &str,
        handler: impl Handler,
    ) -> Result<(), PipelineError> {
        let old_idx = self.index_of(old)?;
        let prev = self.pipeline_ref().prev_of(old_idx);
        self.inner.pipeline.borrow_mut().unlink(old_idx);
        let result = self.add_handler(
            Anchor::After(prev),
            new_name,
            Arc::new(Mutex::new(handler)),
            None,
        );
        self.fire_handler_removed(old_idx);
        result
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.pipeline_ref().names()
    }

    pub fn contains_handler(&self, name: &str) -> bool {
        self.pipeline_ref().index_of(name).is_some()
    }

    fn index_of(&self, name: &str) -> Result<usize, PipelineError> {
        self.pipeline_ref()
            .index_of(name)
            .ok_or_else(|| PipelineError::NotFound(name.to_string()))
    }

    fn add_handler(
        &self,
        anchor: Anchor,
        name: &str,
        cell: Arc<Mutex<dyn Handler>>,
        executor: Option<EventLoopHandle>,
    ) -> Result<(), PipelineError> {
        // The capability mask is read once here and cached on the node.
        let mask = cell.lock().events();
        let idx = {
            let mut p = self.inner.pipeline.borrow_mut();
            match anchor {
                Anchor::First => p.insert_after(HEAD, name, cell, mask, executor),
                Anchor::Last => p.insert_before(TAIL, name, cell, mask, executor),
                Anchor::Before(a) => p.insert_before(a, name, cell, mask, executor),
                Anchor::After(a) => p.insert_after(a, name, cell, mask, executor),
            }
        }?;
        self.fire_handler_added(idx);
        Ok(())
    }

    fn fire_handler_added(&self, idx: usize) {
        let (handler, executor, name) = self.pipeline_ref().hop(idx);
        match executor {
            Some(exec) if !exec.in_event_loop() => {
                let handle = self.handle();
                let submitted = exec.execute(move || {
                    let ctx = Context::remote(handle.clone(), idx, name);
                    if let Err(e) = handler.lock().handler_added(&ctx) {
                        let text: Arc<str> = Arc::from(e.to_string());
                        handle.run_on_loop(None, move |ch| {
                            ch.force_remove(idx, ChannelError::HandlerFailed(text))
                        });
                    }
                });
                if submitted.is_err() {
                    warn!(node = idx, "pinned executor rejected handler_added");
                }
            }
            _ => {
                let ctx = Context::local(self.clone(), idx, name);
                if let Err(e) = handler.lock().handler_added(&ctx) {
                    let text: Arc<str> = Arc::from(e.to_string());
                    self.force_remove(idx, ChannelError::HandlerFailed(text));
                }
            }
        }
    }

    fn fire_handler_removed(&self, idx: usize) {
        let (handler, executor, name) = self.pipeline_ref().hop(idx);
        match executor {
            Some(exec) if !exec.in_event_loop() => {
                let handle = self.handle();
                let submitted = exec.execute(move || {
                    let ctx = Context::remote(handle, idx, name);
                    if let Err(e) = handler.lock().handler_removed(&ctx) {
                        warn!(error = %e, "handler_removed failed on pinned executor");
                    }
                });
                if submitted.is_err() {
                    warn!(node = idx, "pinned executor rejected handler_removed");
                }
            }
            _ => {
                let ctx = Context::local(self.clone(), idx, name);
                if let Err(e) = handler.lock().handler_removed(&ctx) {
                    let text: Arc<str> = Arc::from(e.to_string());
                    warn!(channel = %self.id(), error = %e, "handler_removed failed");
                    self.fire_exception_caught(ChannelError::HandlerFailed(text));
                }
            }
        }
    }

    /// Remove a handler whose `handler_added` failed, then surface the
    /// failure as a pipeline exception event.
    fn force_remove(&self, idx: usize, cause: ChannelError) {
        {
            let mut p = self.inner.pipeline.borrow_mut();
            if p.is_terminated() || p.node(idx).is_removed() {
                return;
            }
            p.unlink(idx);
        }
        self.fire_handler_removed(idx);
        self.fire_exception_caught(cause);
    }

    // Channel-level operations; each enters the pipeline at the tail.

    pub fn write(&self, msg: Message) -> OpPromise {
        let promise = OpPromise::with_executor(self.event_loop());
        self.write_with(msg, promise.clone());
        promise
    }

    pub fn write_with(&self, msg: Message, promise: OpPromise) {
        fire_outbound_from(self, TAIL, Outbound::Write(msg, promise));
    }

    pub fn write_and_flush(&self, msg: Message) -> OpPromise {
        let promise = self.write(msg);
        self.flush();
        promise
    }

    pub fn flush(&self) {
        fire_outbound_from(self, TAIL, Outbound::Flush);
    }

    /// Arm one read (meaningful with auto-read off).
    pub fn read(&self) {
        fire_outbound_from(self, TAIL, Outbound::Read);
    }

    pub fn bind(&self, addr: SocketAddr) -> OpPromise {
        let promise = OpPromise::with_executor(self.event_loop());
        fire_outbound_from(self, TAIL, Outbound::Bind(addr, promise.clone()));
        promise
    }

    pub fn connect(&self, addr: SocketAddr) -> OpPromise {
        let promise = OpPromise::with_executor(self.event_loop());
        fire_outbound_from(self, TAIL, Outbound::Connect(addr, promise.clone()));
        promise
    }

    pub fn disconnect(&self) -> OpPromise {
        let promise = OpPromise::with_executor(self.event_loop());
        fire_outbound_from(self, TAIL, Outbound::Disconnect(promise.clone()));
        promise
    }

    pub fn close(&self, promise: OpPromise) {
        fire_outbound_from(self, TAIL, Outbound::Close(promise));
    }

    pub fn deregister(&self) -> OpPromise {
        let promise = OpPromise::with_executor(self.event_loop());
        fire_outbound_from(self, TAIL, Outbound::Deregister(promise.clone()));
        promise
    }

    /// Half-close this side's writes; the peer sees EOF, reads keep working.
    pub fn shutdown_output(&self) -> OpPromise {
        let promise = OpPromise::with_executor(self.event_loop());
        match self.inner.transport.borrow_mut().do_shutdown_output() {
            Ok(()) => promise.try_success(),
            Err(e) => promise.try_failure(ChannelError::from(e)),
        };
        promise
    }

    // Event injection; entry points for the transport layer and tests.

    pub fn fire_user_event(&self, event: UserEvent) {
        fire_inbound_from(self, HEAD, Inbound::User(event));
    }

    pub fn fire_exception_caught(&self, error: ChannelError) {
        fire_inbound_from(self, HEAD, Inbound::Exception(error));
    }

    pub(crate) fn fire_writability_changed(&self) {
        fire_inbound_from(self, HEAD, Inbound::WritabilityChanged);
    }

    fn fire_read(&self, msg: Message) {
        fire_inbound_from(self, HEAD, Inbound::Read(msg));
    }

    fn fire_read_complete(&self) {
        fire_inbound_from(self, HEAD, Inbound::ReadComplete);
    }

    // Registration; runs once, on the loop thread.

    pub(crate) fn register0(&self) -> Result<(), ChannelError> {
        if self.is_registered() {
            return Err(ChannelError::AlreadyRegistered);
        }
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        let fd = {
            let transport = self.inner.transport.borrow();
            let fd = transport.fd().ok_or(ChannelError::Closed)?;
            self.inner
                .loop_ctx
                .poller
                .add(fd, self.inner.interest.get(), fd.as_raw_fd() as u64)
                .map_err(ChannelError::from)?;
            fd.as_raw_fd()
        };
        self.inner
            .loop_ctx
            .channels
            .borrow_mut()
            .insert(fd, self.clone());
        self.inner.registered.set(true);
        trace!(channel = %self.id(), fd, kind = self.inner.transport.borrow().kind(), "registered");
        fire_inbound_from(self, HEAD, Inbound::Registered);
        if self.is_active() {
            self.mark_active();
        }
        Ok(())
    }

    /// The inactive → active edge: fire the event once and start reading.
    fn mark_active(&self) {
        if self.inner.active_seen.replace(true) {
            return;
        }
        fire_inbound_from(self, HEAD, Inbound::Active);
        if self.config().auto_read {
            self.begin_read0();
        }
    }

    // Transport internals ("*0"): only reachable through the head sentinel
    // or the loop itself.

    pub(crate) fn bind0(&self, addr: SocketAddr, promise: OpPromise) {
        let result = self.inner.transport.borrow_mut().do_bind(&addr);
        match result {
            Ok(()) => {
                promise.try_success();
                if self.is_active() {
                    self.mark_active();
                }
            }
            Err(e) => {
                promise.try_failure(ChannelError::from(e));
            }
        }
    }

    pub(crate) fn connect0(&self, addr: SocketAddr, promise: OpPromise) {
        if self.inner.connect_pending.borrow().is_some() {
            promise.try_failure(ChannelError::Io(Errno::EALREADY));
            return;
        }
        if !self.is_open() {
            promise.try_failure(ChannelError::Closed);
            return;
        }
        let result = self.inner.transport.borrow_mut().do_connect(&addr);
        match result {
            Ok(true) => {
                promise.try_success();
                self.mark_active();
            }
            Ok(false) => {
                self.set_interest(None, Some(true));
                let timer = self.config().connect_timeout.map(|timeout| {
                    let ch = self.clone();
                    self.inner.loop_ctx.schedule_local(timeout, move |_| {
                        let pending = ch.inner.connect_pending.borrow_mut().take();
                        if let Some(pending) = pending {
                            pending.promise.try_failure(ChannelError::ConnectTimeout);
                            debug!(channel = %ch.id(), "connect timed out; force closing");
                            ch.close0(OpPromise::void());
                        }
                    })
                });
                *self.inner.connect_pending.borrow_mut() = Some(PendingConnect { promise, timer });
            }
            Err(e) => {
                promise.try_failure(ChannelError::from(e));
                self.close0(OpPromise::void());
            }
        }
    }

    fn finish_connect(&self) {
        let Some(pending) = self.inner.connect_pending.borrow_mut().take() else {
            return;
        };
        if let Some(timer) = &pending.timer {
            timer.cancel();
        }
        let result = self.inner.transport.borrow_mut().finish_connect();
        match result {
            Ok(()) => {
                self.set_interest(None, Some(false));
                pending.promise.try_success();
                self.mark_active();
            }
            Err(e) => {
                pending.promise.try_failure(ChannelError::from(e));
                self.close0(OpPromise::void());
            }
        }
    }

    pub(crate) fn disconnect0(&self, promise: OpPromise) {
        let result = self.inner.transport.borrow_mut().do_disconnect();
        match result {
            Ok(true) => {
                // The transport dissolved the association and stays usable.
                promise.try_success();
            }
            Ok(false) => self.close0(promise),
            Err(e) => {
                promise.try_failure(ChannelError::from(e));
            }
        }
    }

    pub(crate) fn begin_read0(&self) {
        if !self.is_open() || self.inner.input_shutdown.get() {
            return;
        }
        self.inner.read_pending.set(true);
        self.set_interest(Some(true), None);
    }

    pub(crate) fn write0(&self, msg: Message, promise: OpPromise) {
        if self.inner.close_initiated.get() || !self.is_open() {
            promise.try_failure(ChannelError::Closed);
            return;
        }
        if !self.inner.transport.borrow().writable_transport() {
            promise.try_failure(ChannelError::Io(Errno::EOPNOTSUPP));
            return;
        }
        let size = (self.config().size_estimator)(&msg).max(0) as usize;
        let edge = self
            .inner
            .outbound
            .borrow_mut()
            .add_message(msg, size, promise);
        if edge == Some(WritabilityEdge::BecameUnwritable) {
            self.fire_writability_changed();
        }
    }

    pub(crate) fn flush0(&self) {
        self.inner.outbound.borrow_mut().add_flush();
        self.flush_now();
    }

    /// Push flushed entries into the transport; called from `flush0` and on
    /// write readiness.
    fn flush_now(&self) {
        if self.inner.in_flush.get() || !self.is_open() {
            return;
        }
        if !self.inner.outbound.borrow().has_flushed() {
            self.set_interest(None, Some(false));
            return;
        }
        self.inner.in_flush.set(true);
        let cfg = self.config();
        let result = {
            let mut transport = self.inner.transport.borrow_mut();
            let mut outbound = self.inner.outbound.borrow_mut();
            transport.do_write(&mut outbound, &cfg)
        };
        self.inner.in_flush.set(false);

        match result {
            Ok((outcome, edges)) => {
                for edge in edges {
                    if edge == WritabilityEdge::BecameWritable {
                        self.fire_writability_changed();
                    }
                }
                match outcome {
                    WriteOutcome::Flushed => self.set_interest(None, Some(false)),
                    // Partial write: stop spinning, let write readiness
                    // resume the flush.
                    WriteOutcome::Blocked => self.set_interest(None, Some(true)),
                }
                let queued_close = self.inner.close_after_flush.borrow_mut().take();
                if let Some(promise) = queued_close {
                    self.close0(promise);
                }
            }
            Err(e) => self.on_io_error(e),
        }
    }

    pub(crate) fn close0(&self, promise: OpPromise) {
        if self.inner.close_initiated.get() {
            // Idempotent: piggyback on the first close.
            let close_promise = &self.inner.close_promise;
            if close_promise.is_done() {
                promise.try_success();
            } else {
                close_promise.add_listener(move |result| {
                    match result {
                        Ok(()) => promise.try_success(),
                        Err(e) => promise.try_failure(e.clone()),
                    };
                });
            }
            return;
        }
        if self.inner.in_flush.get() {
            // Mid-flush close: re-queued once the flush unwinds.
            *self.inner.close_after_flush.borrow_mut() = Some(promise);
            return;
        }
        self.inner.close_initiated.set(true);
        self.inner.accepting.store(false, Ordering::Release);

        let pending_connect = self.inner.connect_pending.borrow_mut().take();
        if let Some(pending) = pending_connect {
            if let Some(timer) = &pending.timer {
                timer.cancel();
            }
            pending.promise.try_failure(ChannelError::Closed);
        }

        let was_active = self.is_active();
        let was_registered = self.is_registered();
        self.inner.outbound.borrow_mut().fail_all(ChannelError::Closed);
        self.unregister_from_loop();
        self.inner.transport.borrow_mut().do_close();
        trace!(channel = %self.id(), "closed");

        // Lifecycle events run as a fresh task: a close issued from inside
        // channel_read must not re-enter the reading handler's stack.
        let ch = self.clone();
        self.inner.loop_ctx.defer(move |_| {
            if was_active {
                fire_inbound_from(&ch, HEAD, Inbound::Inactive);
            }
            if was_registered {
                fire_inbound_from(&ch, HEAD, Inbound::Unregistered);
            }
            ch.teardown_pipeline();
            ch.inner.close_promise.try_success();
            promise.try_success();
        });
    }

    pub(crate) fn deregister0(&self, promise: OpPromise) {
        if !self.is_registered() {
            promise.try_success();
            return;
        }
        self.unregister_from_loop();
        let ch = self.clone();
        self.inner.loop_ctx.defer(move |_| {
            fire_inbound_from(&ch, HEAD, Inbound::Unregistered);
            promise.try_success();
        });
    }

    fn unregister_from_loop(&self) {
        if !self.inner.registered.replace(false) {
            return;
        }
        let transport = self.inner.transport.borrow();
        if let Some(fd) = transport.fd() {
            let raw = fd.as_raw_fd();
            if let Err(e) = self.inner.loop_ctx.poller.delete(fd) {
                warn!(channel = %self.id(), error = %e, "epoll deregistration failed");
            }
            drop(transport);
            self.inner.loop_ctx.channels.borrow_mut().remove(raw);
        }
    }

    fn teardown_pipeline(&self) {
        if self.pipeline_ref().is_terminated() {
            return;
        }
        // Reverse order: the last handler added is the first torn down.
        let nodes = self.pipeline_ref().user_nodes();
        for idx in nodes.into_iter().rev() {
            self.inner.pipeline.borrow_mut().unlink(idx);
            self.fire_handler_removed(idx);
        }
        self.inner.pipeline.borrow_mut().terminate();
    }

    // Readiness dispatch, called by the owning loop.

    pub(crate) fn handle_readiness(&self, ready: Readiness) {
        if !self.is_open() {
            return;
        }

        // Hangup first: a dead descriptor with nothing readable closes now;
        // with readable bytes pending, the read path drains them and then
        // observes the EOF/reset itself.
        if ready.hangup && self.inner.connect_pending.borrow().is_none() && !ready.readable {
            debug!(channel = %self.id(), "peer hangup");
            self.close0(OpPromise::void());
            return;
        }

        if ready.writable || (ready.hangup && self.inner.connect_pending.borrow().is_some()) {
            if self.inner.connect_pending.borrow().is_some() {
                self.finish_connect();
            } else {
                self.flush_now();
            }
        }

        if !self.is_open() {
            return;
        }

        if ready.readable || ready.read_closed || ready.hangup {
            self.read_ready(ready.read_closed);
        }
    }

    fn read_ready(&self, read_closed: bool) {
        let cfg = self.config();
        let quota = cfg.max_messages_per_read.max(1);
        self.inner.read_pending.set(false);

        let mut reads = 0usize;
        let mut eof = false;
        let mut error: Option<Errno> = None;
        while reads < quota && self.is_open() && !self.inner.close_initiated.get() {
            let result = self.inner.transport.borrow_mut().do_read(&cfg);
            match result {
                Ok(ReadResult::Message { msg, more }) => {
                    reads += 1;
                    self.fire_read(msg);
                    if !more {
                        break;
                    }
                }
                Ok(ReadResult::Eof) => {
                    eof = true;
                    break;
                }
                Ok(ReadResult::WouldBlock) => break,
                Err(e) if classify(e) == IoClass::Interrupted => continue,
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }

        if reads > 0 {
            self.fire_read_complete();
        }

        if let Some(e) = error {
            self.on_io_error(e);
            return;
        }
        if eof || (read_closed && reads == 0) {
            self.on_input_shutdown();
            return;
        }
        self.rearm_read(&cfg);
    }

    fn rearm_read(&self, cfg: &ChannelConfig) {
        if !self.is_open() {
            return;
        }
        if cfg.auto_read || self.inner.read_pending.get() {
            self.set_interest(Some(true), None);
        } else {
            self.set_interest(Some(false), None);
        }
    }

    /// Peer finished writing. Either signal half-closure or close outright.
    fn on_input_shutdown(&self) {
        if self.inner.input_shutdown.replace(true) {
            return;
        }
        let supports = self.inner.transport.borrow().supports_half_closure();
        if supports && self.config().allow_half_closure {
            if let Err(e) = self.inner.transport.borrow_mut().do_shutdown_input() {
                trace!(channel = %self.id(), error = %e, "shutdown_input after peer EOF");
            }
            self.set_interest(Some(false), None);
            self.fire_user_event(Box::new(InputShutdown));
        } else {
            self.close0(OpPromise::void());
        }
    }

    /// Apply the errno taxonomy to a failed read or write.
    fn on_io_error(&self, e: Errno) {
        match classify(e) {
            IoClass::WouldBlock | IoClass::Interrupted => {}
            IoClass::Reset => {
                self.fire_exception_caught(ChannelError::Reset);
                self.close0(OpPromise::void());
            }
            IoClass::Closed => {
                // Descriptor already gone: no exception event, just fold up.
                self.close0(OpPromise::void());
            }
            IoClass::Fatal => {
                warn!(channel = %self.id(), errno = %e, "fatal channel I/O error");
                self.fire_exception_caught(ChannelError::Io(e));
                self.close0(OpPromise::void());
            }
        }
    }

    fn set_interest(&self, readable: Option<bool>, writable: Option<bool>) {
        let current = self.inner.interest.get();
        let next = Interest {
            readable: readable.unwrap_or(current.readable),
            writable: writable.unwrap_or(current.writable),
            edge_triggered: current.edge_triggered,
        };
        if next == current || !self.is_registered() {
            self.inner.interest.set(next);
            return;
        }
        self.inner.interest.set(next);
        let transport = self.inner.transport.borrow();
        if let Some(fd) = transport.fd() {
            let token = fd.as_raw_fd() as u64;
            if let Err(e) = self.inner.loop_ctx.poller.modify(fd, next, token) {
                warn!(channel = %self.id(), error = %e, "interest update failed");
            }
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Channel({}, {})",
            self.id(),
            self.inner.transport.borrow().kind()
        )
    }
}

/// Pieces of a channel created on the spawning thread, so its handle exists
/// before the loop builds the channel proper.
pub(crate) struct ChannelParts {
    pub(crate) id: ChannelId,
    pub(crate) cfg: Arc<ArcSwap<ChannelConfig>>,
    pub(crate) pending: Arc<PendingBytes>,
    pub(crate) accepting: Arc<AtomicBool>,
    pub(crate) close_promise: OpPromise,
}

impl ChannelParts {
    pub(crate) fn new(cfg: ChannelConfig, executor: &EventLoopHandle) -> (Self, ChannelHandle) {
        let cfg = Arc::new(ArcSwap::from_pointee(cfg));
        let pending = PendingBytes::new(cfg.clone());
        let parts = ChannelParts {
            id: ChannelId::next(),
            cfg: cfg.clone(),
            pending: pending.clone(),
            accepting: Arc::new(AtomicBool::new(true)),
            close_promise: OpPromise::with_executor(executor.clone()),
        };
        let handle = ChannelHandle::from_shared(Arc::new(HandleShared {
            id: parts.id,
            executor: executor.clone(),
            cfg,
            pending,
            accepting: parts.accepting.clone(),
            close_promise: parts.close_promise.clone(),
        }));
        (parts, handle)
    }
}

/// Create, initialize and register a channel on `executor`, then run `op`
/// (bind, connect, or nothing) with `op_promise`.
pub(crate) fn spawn_channel(
    executor: &EventLoopHandle,
    cfg: ChannelConfig,
    parent: Option<ChannelId>,
    build: impl FnOnce() -> Result<Box<dyn Transport>, Errno> + Send + 'static,
    init: Option<Initializer>,
    op: impl FnOnce(&Channel, OpPromise) + Send + 'static,
    op_promise: OpPromise,
) -> ChannelHandle {
    let (parts, handle) = ChannelParts::new(cfg, executor);
    let close_promise = parts.close_promise.clone();
    let fail_promise = op_promise.clone();

    let submitted = executor.submit(move |ctx| {
        let transport = match build() {
            Ok(t) => t,
            Err(e) => {
                op_promise.try_failure(ChannelError::from(e));
                // The channel never existed; its lifetime is over.
                close_promise.try_success();
                return;
            }
        };
        let channel = Channel::build(ctx.clone(), parts, parent, transport);
        if let Some(init) = init {
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| init(&channel)));
            if let Err(panic) = outcome {
                let text = crate::runtime::panic_text(&panic);
                warn!(channel = %channel.id(), panic = %text, "initializer panicked");
                op_promise.try_failure(ChannelError::HandlerPanic(Arc::from(text.as_str())));
                channel.close0(OpPromise::void());
                return;
            }
        }
        if let Err(e) = channel.register0() {
            op_promise.try_failure(e);
            channel.close0(OpPromise::void());
            return;
        }
        op(&channel, op_promise);
    });

    if submitted.is_err() {
        fail_promise.try_failure(ChannelError::LoopShutDown);
    }
    handle
}
