//! The handler pipeline: an arena-backed doubly-linked list with sentinels.
//!
//! Contexts live in a slab of slots addressed by index, with explicit
//! prev/next links. Slot 0 is the head sentinel (the outbound terminal that
//! drives operations into the channel's transport internals), slot 1 the
//! tail (the inbound terminal that logs whatever nobody handled). Removed
//! nodes are unlinked but keep their slot and links until the pipeline is
//! torn down, so contexts held by in-flight events stay valid.
//!
//! Dispatch walks next-links for inbound events and prev-links for outbound
//! operations, skipping nodes whose cached [`EventMask`] lacks the event's
//! bit. Each hop re-checks whether the target's executor is the current
//! thread; a pinned handler gets the event as a task on its own executor,
//! with a detached context that marshals follow-ups back to the loop.

mod context;
mod handler;

pub use context::Context;
pub use handler::{EventMask, Handler, UserEvent};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::channel::{Channel, Message};
use crate::error::{ChannelError, PipelineError};
use crate::promise::OpPromise;
use crate::runtime::EventLoopHandle;

pub(crate) const HEAD: usize = 0;
pub(crate) const TAIL: usize = 1;

pub(crate) type HandlerCell = Arc<Mutex<dyn Handler>>;

/// An inbound event travelling head → tail.
pub(crate) enum Inbound {
    Registered,
    Unregistered,
    Active,
    Inactive,
    Read(Message),
    ReadComplete,
    WritabilityChanged,
    User(UserEvent),
    Exception(ChannelError),
}

impl Inbound {
    fn mask(&self) -> EventMask {
        match self {
            Inbound::Registered => EventMask::REGISTERED,
            Inbound::Unregistered => EventMask::UNREGISTERED,
            Inbound::Active => EventMask::ACTIVE,
            Inbound::Inactive => EventMask::INACTIVE,
            Inbound::Read(_) => EventMask::READ,
            Inbound::ReadComplete => EventMask::READ_COMPLETE,
            Inbound::WritabilityChanged => EventMask::WRITABILITY_CHANGED,
            Inbound::User(_) => EventMask::USER_EVENT,
            Inbound::Exception(_) => EventMask::EXCEPTION_CAUGHT,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Inbound::Registered => "channel_registered",
            Inbound::Unregistered => "channel_unregistered",
            Inbound::Active => "channel_active",
            Inbound::Inactive => "channel_inactive",
            Inbound::Read(_) => "channel_read",
            Inbound::ReadComplete => "channel_read_complete",
            Inbound::WritabilityChanged => "channel_writability_changed",
            Inbound::User(_) => "user_event",
            Inbound::Exception(_) => "exception_caught",
        }
    }
}

/// An outbound operation travelling tail → head.
pub(crate) enum Outbound {
    Bind(SocketAddr, OpPromise),
    Connect(SocketAddr, OpPromise),
    Disconnect(OpPromise),
    Close(OpPromise),
    Deregister(OpPromise),
    Read,
    Write(Message, OpPromise),
    Flush,
}

impl Outbound {
    fn mask(&self) -> EventMask {
        match self {
            Outbound::Bind(..) => EventMask::BIND,
            Outbound::Connect(..) => EventMask::CONNECT,
            Outbound::Disconnect(_) => EventMask::DISCONNECT,
            Outbound::Close(_) => EventMask::CLOSE,
            Outbound::Deregister(_) => EventMask::DEREGISTER,
            Outbound::Read => EventMask::OUT_READ,
            Outbound::Write(..) => EventMask::WRITE,
            Outbound::Flush => EventMask::FLUSH,
        }
    }

    pub(crate) fn promise(&self) -> Option<&OpPromise> {
        match self {
            Outbound::Bind(_, p)
            | Outbound::Connect(_, p)
            | Outbound::Disconnect(p)
            | Outbound::Close(p)
            | Outbound::Deregister(p)
            | Outbound::Write(_, p) => Some(p),
            Outbound::Read | Outbound::Flush => None,
        }
    }
}

pub(crate) struct Node {
    name: Arc<str>,
    prev: usize,
    next: usize,
    handler: HandlerCell,
    mask: EventMask,
    executor: Option<EventLoopHandle>,
    removed: bool,
    /// Saw a `channel_read` since the last `channel_read_complete`; gates
    /// completion forwarding so a quiet handler never sees duplicate
    /// completion signals.
    saw_read: bool,
}

impl Node {
    pub(crate) fn is_removed(&self) -> bool {
        self.removed
    }
}

/// List mechanics only; event firing lives in the free functions below and
/// the channel internals.
pub(crate) struct Pipeline {
    nodes: Vec<Node>,
    by_name: HashMap<Arc<str>, usize>,
    terminated: bool,
}

impl Pipeline {
    pub(crate) fn new(head: HandlerCell, tail: HandlerCell) -> Self {
        let head = Node {
            name: Arc::from("head"),
            prev: HEAD,
            next: TAIL,
            handler: head,
            mask: EventMask::OUTBOUND,
            executor: None,
            removed: false,
            saw_read: false,
        };
        let tail_node = Node {
            name: Arc::from("tail"),
            prev: HEAD,
            next: TAIL,
            handler: tail,
            mask: EventMask::INBOUND,
            executor: None,
            removed: false,
            saw_read: false,
        };
        Pipeline {
            nodes: vec![head, tail_node],
            by_name: HashMap::new(),
            terminated: false,
        }
    }

    fn check_name(&self, name: &str) -> Result<(), PipelineError> {
        if self.terminated {
            return Err(PipelineError::Terminated);
        }
        if self.by_name.contains_key(name) {
            return Err(PipelineError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    /// Link a new node after `anchor`. Returns its slot index.
    pub(crate) fn insert_after(
        &mut self,
        anchor: usize,
        name: &str,
        handler: HandlerCell,
        mask: EventMask,
        executor: Option<EventLoopHandle>,
    ) -> Result<usize, PipelineError> {
        self.check_name(name)?;
        let name: Arc<str> = Arc::from(name);
        let next = self.nodes[anchor].next;
        let idx = self.nodes.len();
        self.nodes.push(Node {
            name: name.clone(),
            prev: anchor,
            next,
            handler,
            mask,
            executor,
            removed: false,
            saw_read: false,
        });
        self.nodes[anchor].next = idx;
        self.nodes[next].prev = idx;
        self.by_name.insert(name, idx);
        Ok(idx)
    }

    pub(crate) fn insert_before(
        &mut self,
        anchor: usize,
        name: &str,
        handler: HandlerCell,
        mask: EventMask,
        executor: Option<EventLoopHandle>,
    ) -> Result<usize, PipelineError> {
        let prev = self.nodes[anchor].prev;
        self.insert_after(prev, name, handler, mask, executor)
    }

    pub(crate) fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Unlink a node; the slot and its links survive for in-flight walks.
    pub(crate) fn unlink(&mut self, idx: usize) {
        debug_assert!(idx != HEAD && idx != TAIL, "sentinels are permanent");
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
        self.nodes[idx].removed = true;
        self.by_name.remove(&self.nodes[idx].name);
    }

    pub(crate) fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    pub(crate) fn prev_of(&self, idx: usize) -> usize {
        self.nodes[idx].prev
    }

    pub(crate) fn hop(&self, idx: usize) -> (HandlerCell, Option<EventLoopHandle>, Arc<str>) {
        let n = &self.nodes[idx];
        (n.handler.clone(), n.executor.clone(), n.name.clone())
    }

    /// User handler names in pipeline order (sentinels excluded).
    pub(crate) fn names(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut idx = self.nodes[HEAD].next;
        while idx != TAIL {
            out.push(self.nodes[idx].name.to_string());
            idx = self.nodes[idx].next;
        }
        out
    }

    /// User node indices in pipeline order.
    pub(crate) fn user_nodes(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut idx = self.nodes[HEAD].next;
        while idx != TAIL {
            out.push(idx);
            idx = self.nodes[idx].next;
        }
        out
    }

    pub(crate) fn terminate(&mut self) {
        self.terminated = true;
        self.by_name.clear();
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated
    }
}

/// Walk next-links from `from` (exclusive) to the first live node whose mask
/// matches, and invoke the event there.
pub(crate) fn fire_inbound_from(ch: &Channel, from: usize, evt: Inbound) {
    let target = {
        let mut pipeline = ch.pipeline_mut();
        if pipeline.is_terminated() {
            return;
        }
        let mask = evt.mask();
        let mut idx = pipeline.nodes[from].next;
        loop {
            let node = &pipeline.nodes[idx];
            if !node.removed && node.mask.contains(mask) {
                break;
            }
            if idx == TAIL {
                // Tail matched nothing only when the event is inbound-typed
                // but tail-masked out; nothing to do.
                return;
            }
            idx = node.next;
        }
        match &evt {
            Inbound::Read(_) => pipeline.nodes[idx].saw_read = true,
            Inbound::ReadComplete => {
                if !pipeline.nodes[idx].saw_read {
                    // This context saw no reads since its last completion;
                    // forwarding would deliver a duplicate signal.
                    return;
                }
                pipeline.nodes[idx].saw_read = false;
            }
            _ => {}
        }
        idx
    };
    deliver_inbound(ch, target, evt);
}

/// Invoke `evt` at exactly `idx` (no mask search); used for first delivery
/// and for exception events raised by the node itself.
pub(crate) fn deliver_inbound(ch: &Channel, idx: usize, evt: Inbound) {
    let (handler, executor, name) = {
        let pipeline = ch.pipeline_ref();
        if pipeline.is_terminated() {
            return;
        }
        pipeline.hop(idx)
    };

    match executor {
        Some(exec) if !exec.in_event_loop() => {
            let handle = ch.handle();
            let submitted = exec.execute(move || {
                let ctx = Context::remote(handle, idx, name);
                let mut guard = handler.lock();
                invoke_inbound(&mut *guard, &ctx, evt);
            });
            if submitted.is_err() {
                warn!(node = idx, "pinned executor is shut down; inbound event dropped");
            }
        }
        _ => {
            let Some(mut guard) = handler.try_lock() else {
                // The handler is mid-callback on this very stack (it
                // triggered an event that cycled back to itself). Deliver
                // once the current callback unwinds.
                let ch = ch.clone();
                ch.clone()
                    .loop_ctx()
                    .defer(move |_| deliver_inbound(&ch, idx, evt));
                return;
            };
            let is_exception = matches!(evt, Inbound::Exception(_));
            let ctx = Context::local(ch.clone(), idx, name);
            invoke_with_guard(ch, &mut *guard, &ctx, evt, is_exception);
        }
    }
}

/// Call the handler with a panic guard; a panic in a normal callback becomes
/// an `exception_caught` event delivered to the same node.
fn invoke_with_guard(
    ch: &Channel,
    handler: &mut dyn Handler,
    ctx: &Context,
    evt: Inbound,
    is_exception: bool,
) {
    let kind = evt.kind();
    let outcome = catch_unwind(AssertUnwindSafe(|| invoke_inbound(handler, ctx, evt)));
    if let Err(panic) = outcome {
        let msg = crate::runtime::panic_text(&panic);
        if is_exception {
            error!(
                channel = %ch.id(),
                node = ctx.idx,
                panic = %msg,
                "handler panicked inside exception_caught; only logged"
            );
        } else {
            warn!(
                channel = %ch.id(),
                node = ctx.idx,
                callback = kind,
                panic = %msg,
                "handler panicked; raising exception_caught"
            );
            deliver_inbound(
                ch,
                ctx.idx,
                Inbound::Exception(ChannelError::HandlerPanic(Arc::from(msg.as_str()))),
            );
        }
    }
}

fn invoke_inbound(handler: &mut dyn Handler, ctx: &Context, evt: Inbound) {
    match evt {
        Inbound::Registered => handler.channel_registered(ctx),
        Inbound::Unregistered => handler.channel_unregistered(ctx),
        Inbound::Active => handler.channel_active(ctx),
        Inbound::Inactive => handler.channel_inactive(ctx),
        Inbound::Read(msg) => handler.channel_read(ctx, msg),
        Inbound::ReadComplete => handler.channel_read_complete(ctx),
        Inbound::WritabilityChanged => handler.channel_writability_changed(ctx),
        Inbound::User(event) => handler.user_event(ctx, event),
        Inbound::Exception(error) => handler.exception_caught(ctx, error),
    }
}

/// Walk prev-links from `from` (exclusive) toward the head and invoke there.
pub(crate) fn fire_outbound_from(ch: &Channel, from: usize, evt: Outbound) {
    let target = {
        let pipeline = ch.pipeline_ref();
        if pipeline.is_terminated() {
            complete_after_teardown(&evt);
            return;
        }
        let mask = evt.mask();
        let mut idx = pipeline.nodes[from].prev;
        loop {
            let node = &pipeline.nodes[idx];
            if !node.removed && node.mask.contains(mask) {
                break;
            }
            if idx == HEAD {
                return;
            }
            idx = node.prev;
        }
        idx
    };
    deliver_outbound(ch, target, evt);
}

/// A closed channel's pipeline is gone: close/deregister are no-ops that
/// succeed, everything else fails its promise.
fn complete_after_teardown(evt: &Outbound) {
    match evt {
        Outbound::Close(p) | Outbound::Deregister(p) => {
            p.try_success();
        }
        other => {
            if let Some(p) = other.promise() {
                p.try_failure(ChannelError::Closed);
            }
        }
    }
}

pub(crate) fn deliver_outbound(ch: &Channel, idx: usize, evt: Outbound) {
    let (handler, executor, name) = {
        let pipeline = ch.pipeline_ref();
        if pipeline.is_terminated() {
            complete_after_teardown(&evt);
            return;
        }
        pipeline.hop(idx)
    };

    match executor {
        Some(exec) if !exec.in_event_loop() => {
            let handle = ch.handle();
            let fail = evt.promise().cloned();
            let submitted = exec.execute(move || {
                let ctx = Context::remote(handle, idx, name);
                let mut guard = handler.lock();
                invoke_outbound(&mut *guard, &ctx, evt);
            });
            if submitted.is_err() && let Some(p) = fail {
                p.try_failure(ChannelError::LoopShutDown);
            }
        }
        _ => {
            let Some(mut guard) = handler.try_lock() else {
                let ch = ch.clone();
                ch.clone()
                    .loop_ctx()
                    .defer(move |_| deliver_outbound(&ch, idx, evt));
                return;
            };
            let ctx = Context::local(ch.clone(), idx, name);
            let outcome =
                catch_unwind(AssertUnwindSafe(|| invoke_outbound(&mut *guard, &ctx, evt)));
            if let Err(panic) = outcome {
                let msg = crate::runtime::panic_text(&panic);
                warn!(
                    channel = %ch.id(),
                    node = idx,
                    panic = %msg,
                    "handler panicked in outbound op; raising exception_caught"
                );
                deliver_inbound(
                    ch,
                    idx,
                    Inbound::Exception(ChannelError::HandlerPanic(Arc::from(msg.as_str()))),
                );
            }
        }
    }
}

fn invoke_outbound(handler: &mut dyn Handler, ctx: &Context, evt: Outbound) {
    match evt {
        Outbound::Bind(addr, promise) => handler.bind(ctx, addr, promise),
        Outbound::Connect(addr, promise) => handler.connect(ctx, addr, promise),
        Outbound::Disconnect(promise) => handler.disconnect(ctx, promise),
        Outbound::Close(promise) => handler.close(ctx, promise),
        Outbound::Deregister(promise) => handler.deregister(ctx, promise),
        Outbound::Read => handler.read(ctx),
        Outbound::Write(msg, promise) => handler.write(ctx, msg, promise),
        Outbound::Flush => handler.flush(ctx),
    }
}

/// Outbound terminal: turns pipeline operations into transport calls.
pub(crate) struct HeadHandler;

impl Handler for HeadHandler {
    fn events(&self) -> EventMask {
        EventMask::OUTBOUND
    }

    fn bind(&mut self, ctx: &Context, addr: SocketAddr, promise: OpPromise) {
        let ch = ctx.channel().expect("head runs on the loop");
        ch.bind0(addr, promise);
    }

    fn connect(&mut self, ctx: &Context, addr: SocketAddr, promise: OpPromise) {
        let ch = ctx.channel().expect("head runs on the loop");
        ch.connect0(addr, promise);
    }

    fn disconnect(&mut self, ctx: &Context, promise: OpPromise) {
        let ch = ctx.channel().expect("head runs on the loop");
        ch.disconnect0(promise);
    }

    fn close(&mut self, ctx: &Context, promise: OpPromise) {
        let ch = ctx.channel().expect("head runs on the loop");
        ch.close0(promise);
    }

    fn deregister(&mut self, ctx: &Context, promise: OpPromise) {
        let ch = ctx.channel().expect("head runs on the loop");
        ch.deregister0(promise);
    }

    fn read(&mut self, ctx: &Context) {
        let ch = ctx.channel().expect("head runs on the loop");
        ch.begin_read0();
    }

    fn write(&mut self, ctx: &Context, msg: Message, promise: OpPromise) {
        let ch = ctx.channel().expect("head runs on the loop");
        ch.write0(msg, promise);
    }

    fn flush(&mut self, ctx: &Context) {
        let ch = ctx.channel().expect("head runs on the loop");
        ch.flush0();
    }
}

/// Inbound terminal: the sink for events nobody consumed.
pub(crate) struct TailHandler;

impl Handler for TailHandler {
    fn events(&self) -> EventMask {
        EventMask::INBOUND
    }

    fn channel_registered(&mut self, _ctx: &Context) {}
    fn channel_unregistered(&mut self, _ctx: &Context) {}
    fn channel_active(&mut self, _ctx: &Context) {}
    fn channel_inactive(&mut self, _ctx: &Context) {}
    fn channel_read_complete(&mut self, _ctx: &Context) {}
    fn channel_writability_changed(&mut self, _ctx: &Context) {}

    fn channel_read(&mut self, ctx: &Context, msg: Message) {
        debug!(
            name = ctx.name(),
            size = msg.byte_len(),
            "inbound message reached the tail; discarded"
        );
    }

    fn user_event(&mut self, _ctx: &Context, _event: UserEvent) {
        debug!("user event reached the tail; discarded");
    }

    fn exception_caught(&mut self, _ctx: &Context, error: ChannelError) {
        warn!(
            error = %error,
            "exception reached the tail of the pipeline; \
             add a handler overriding exception_caught to consume it"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl Handler for Noop {}

    fn cell() -> HandlerCell {
        Arc::new(Mutex::new(Noop))
    }

    fn pipeline() -> Pipeline {
        Pipeline::new(
            Arc::new(Mutex::new(HeadHandler)),
            Arc::new(Mutex::new(TailHandler)),
        )
    }

    #[test]
    fn insert_variants_link_in_order() {
        let mut p = pipeline();
        let b = p.insert_before(TAIL, "b", cell(), EventMask::ALL, None).unwrap();
        let _a = p.insert_after(HEAD, "a", cell(), EventMask::ALL, None).unwrap();
        let _c = p.insert_after(b, "c", cell(), EventMask::ALL, None).unwrap();
        assert_eq!(p.names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut p = pipeline();
        p.insert_before(TAIL, "x", cell(), EventMask::ALL, None).unwrap();
        let err = p
            .insert_before(TAIL, "x", cell(), EventMask::ALL, None)
            .unwrap_err();
        assert_eq!(err, PipelineError::DuplicateName("x".into()));
    }

    #[test]
    fn unlink_keeps_slot_and_links() {
        let mut p = pipeline();
        let a = p.insert_before(TAIL, "a", cell(), EventMask::ALL, None).unwrap();
        let b = p.insert_before(TAIL, "b", cell(), EventMask::ALL, None).unwrap();
        p.unlink(a);

        assert_eq!(p.names(), vec!["b"]);
        assert!(p.index_of("a").is_none());
        // The tombstone still routes an in-flight walk around itself.
        assert!(p.node(a).is_removed());
        assert_eq!(p.node(a).next, b);
        // The live list no longer reaches it.
        assert_eq!(p.node(HEAD).next, b);
        assert_eq!(p.node(b).prev, HEAD);
    }

    #[test]
    fn terminate_rejects_mutation() {
        let mut p = pipeline();
        p.terminate();
        let err = p
            .insert_before(TAIL, "late", cell(), EventMask::ALL, None)
            .unwrap_err();
        assert_eq!(err, PipelineError::Terminated);
    }
}
