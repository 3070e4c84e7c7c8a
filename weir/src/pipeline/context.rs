//! The per-node view handed to handler callbacks.
//!
//! A `Context` knows which node it stands at and how to reach the channel:
//! directly when the callback runs on the channel's own loop, or through the
//! channel's `Send` handle when the handler is pinned to another executor.
//! Every `fire_*`/operation re-enters the dispatch layer, which re-checks
//! executor affinity per hop.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::channel::{Channel, ChannelHandle, Message};
use crate::error::ChannelError;
use crate::promise::OpPromise;
use crate::runtime::EventLoopHandle;

use super::handler::UserEvent;
use super::{Inbound, Outbound, fire_inbound_from, fire_outbound_from};

#[derive(Clone)]
pub(crate) enum ChannelRef {
    /// Running on the channel's loop thread.
    Local(Channel),
    /// Running on a pinned executor; operations marshal back to the loop.
    Remote(ChannelHandle),
}

pub struct Context {
    pub(crate) idx: usize,
    pub(crate) name: Arc<str>,
    pub(crate) channel: ChannelRef,
}

impl Context {
    pub(crate) fn local(channel: Channel, idx: usize, name: Arc<str>) -> Self {
        Context {
            idx,
            name,
            channel: ChannelRef::Local(channel),
        }
    }

    pub(crate) fn remote(handle: ChannelHandle, idx: usize, name: Arc<str>) -> Self {
        Context {
            idx,
            name,
            channel: ChannelRef::Remote(handle),
        }
    }

    /// This node's handler name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The channel, when the callback runs on its loop thread. `None` for
    /// handlers pinned to a foreign executor; use [`handle`](Self::handle).
    pub fn channel(&self) -> Option<&Channel> {
        match &self.channel {
            ChannelRef::Local(ch) => Some(ch),
            ChannelRef::Remote(_) => None,
        }
    }

    /// A `Send` handle to the channel, usable from any thread.
    pub fn handle(&self) -> ChannelHandle {
        match &self.channel {
            ChannelRef::Local(ch) => ch.handle(),
            ChannelRef::Remote(h) => h.clone(),
        }
    }

    /// The channel's owning event loop.
    pub fn executor(&self) -> EventLoopHandle {
        match &self.channel {
            ChannelRef::Local(ch) => ch.event_loop(),
            ChannelRef::Remote(h) => h.event_loop(),
        }
    }

    // Inbound forwarding: toward the tail.

    pub fn fire_channel_registered(&self) {
        self.forward_inbound(Inbound::Registered);
    }

    pub fn fire_channel_unregistered(&self) {
        self.forward_inbound(Inbound::Unregistered);
    }

    pub fn fire_channel_active(&self) {
        self.forward_inbound(Inbound::Active);
    }

    pub fn fire_channel_inactive(&self) {
        self.forward_inbound(Inbound::Inactive);
    }

    pub fn fire_channel_read(&self, msg: Message) {
        self.forward_inbound(Inbound::Read(msg));
    }

    pub fn fire_channel_read_complete(&self) {
        self.forward_inbound(Inbound::ReadComplete);
    }

    pub fn fire_channel_writability_changed(&self) {
        self.forward_inbound(Inbound::WritabilityChanged);
    }

    pub fn fire_user_event(&self, event: UserEvent) {
        self.forward_inbound(Inbound::User(event));
    }

    pub fn fire_exception_caught(&self, error: ChannelError) {
        self.forward_inbound(Inbound::Exception(error));
    }

    // Outbound operations: toward the head.

    pub fn bind(&self, addr: SocketAddr, promise: OpPromise) {
        self.forward_outbound(Outbound::Bind(addr, promise));
    }

    pub fn connect(&self, addr: SocketAddr, promise: OpPromise) {
        self.forward_outbound(Outbound::Connect(addr, promise));
    }

    pub fn disconnect(&self, promise: OpPromise) {
        self.forward_outbound(Outbound::Disconnect(promise));
    }

    pub fn close(&self, promise: OpPromise) {
        self.forward_outbound(Outbound::Close(promise));
    }

    pub fn deregister(&self, promise: OpPromise) {
        self.forward_outbound(Outbound::Deregister(promise));
    }

    /// Request one read from the transport (meaningful with auto-read off).
    pub fn read(&self) {
        self.forward_outbound(Outbound::Read);
    }

    pub fn write(&self, msg: Message, promise: OpPromise) {
        self.forward_outbound(Outbound::Write(msg, promise));
    }

    /// Write with a fresh promise and hand it back.
    pub fn write_future(&self, msg: Message) -> OpPromise {
        let promise = OpPromise::with_executor(self.executor());
        self.write(msg, promise.clone());
        promise
    }

    pub fn flush(&self) {
        self.forward_outbound(Outbound::Flush);
    }

    fn forward_inbound(&self, evt: Inbound) {
        match &self.channel {
            ChannelRef::Local(ch) => fire_inbound_from(ch, self.idx, evt),
            ChannelRef::Remote(handle) => {
                let idx = self.idx;
                handle.run_on_loop(None, move |ch| fire_inbound_from(ch, idx, evt));
            }
        }
    }

    fn forward_outbound(&self, evt: Outbound) {
        match &self.channel {
            ChannelRef::Local(ch) => fire_outbound_from(ch, self.idx, evt),
            ChannelRef::Remote(handle) => {
                let idx = self.idx;
                let fail = evt.promise().cloned();
                handle.run_on_loop(fail, move |ch| fire_outbound_from(ch, idx, evt));
            }
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Context({:?} at node {})", self.name, self.idx)
    }
}
