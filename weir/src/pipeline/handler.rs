//! The handler contract: seventeen event callbacks and a capability mask.
//!
//! Every callback defaults to forwarding, so a handler implements only what
//! it cares about. [`Handler::events`] declares which callbacks the handler
//! actually participates in; the pipeline caches that mask on the node when
//! the handler is added and skips the node entirely for events outside it,
//! so trivial pass-through handlers cost nothing per event.

use std::net::SocketAddr;

use crate::channel::Message;
use crate::error::ChannelError;
use crate::promise::OpPromise;

use super::Context;

/// An application-defined inbound event; delivered via `fire_user_event`.
pub type UserEvent = Box<dyn std::any::Any + Send>;

/// Bitmask over the seventeen maskable event callbacks.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EventMask(u32);

impl EventMask {
    pub const REGISTERED: EventMask = EventMask(1 << 0);
    pub const UNREGISTERED: EventMask = EventMask(1 << 1);
    pub const ACTIVE: EventMask = EventMask(1 << 2);
    pub const INACTIVE: EventMask = EventMask(1 << 3);
    pub const READ: EventMask = EventMask(1 << 4);
    pub const READ_COMPLETE: EventMask = EventMask(1 << 5);
    pub const WRITABILITY_CHANGED: EventMask = EventMask(1 << 6);
    pub const USER_EVENT: EventMask = EventMask(1 << 7);
    pub const EXCEPTION_CAUGHT: EventMask = EventMask(1 << 8);

    pub const BIND: EventMask = EventMask(1 << 9);
    pub const CONNECT: EventMask = EventMask(1 << 10);
    pub const DISCONNECT: EventMask = EventMask(1 << 11);
    pub const CLOSE: EventMask = EventMask(1 << 12);
    pub const DEREGISTER: EventMask = EventMask(1 << 13);
    pub const OUT_READ: EventMask = EventMask(1 << 14);
    pub const WRITE: EventMask = EventMask(1 << 15);
    pub const FLUSH: EventMask = EventMask(1 << 16);

    pub const NONE: EventMask = EventMask(0);
    pub const INBOUND: EventMask = EventMask(0x1ff);
    pub const OUTBOUND: EventMask = EventMask(0xff << 9);
    pub const ALL: EventMask = EventMask(0x1ffff);

    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for EventMask {
    type Output = EventMask;
    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Debug for EventMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventMask({:#07x})", self.0)
    }
}

/// A node in a channel's pipeline.
///
/// Handlers run on the channel's event loop unless pinned to another
/// executor at add time, and are never invoked concurrently; `&mut self`
/// state needs no further synchronization.
///
/// Inbound defaults forward toward the tail, outbound defaults toward the
/// head, so overriding nothing yields a transparent handler.
#[allow(unused_variables)]
pub trait Handler: Send + 'static {
    /// The callbacks this handler participates in. Narrowing the mask lets
    /// the pipeline skip this node for everything else. The default opts in
    /// to all events; the mask is read once, when the handler is added.
    fn events(&self) -> EventMask {
        EventMask::ALL
    }

    /// The handler was added and is ready to process events.
    fn handler_added(&mut self, ctx: &Context) -> crate::Result<()> {
        Ok(())
    }

    /// The handler was removed; last callback it will ever see.
    fn handler_removed(&mut self, ctx: &Context) -> crate::Result<()> {
        Ok(())
    }

    fn channel_registered(&mut self, ctx: &Context) {
        ctx.fire_channel_registered();
    }

    fn channel_unregistered(&mut self, ctx: &Context) {
        ctx.fire_channel_unregistered();
    }

    fn channel_active(&mut self, ctx: &Context) {
        ctx.fire_channel_active();
    }

    fn channel_inactive(&mut self, ctx: &Context) {
        ctx.fire_channel_inactive();
    }

    fn channel_read(&mut self, ctx: &Context, msg: Message) {
        ctx.fire_channel_read(msg);
    }

    fn channel_read_complete(&mut self, ctx: &Context) {
        ctx.fire_channel_read_complete();
    }

    fn channel_writability_changed(&mut self, ctx: &Context) {
        ctx.fire_channel_writability_changed();
    }

    fn user_event(&mut self, ctx: &Context, event: UserEvent) {
        ctx.fire_user_event(event);
    }

    fn exception_caught(&mut self, ctx: &Context, error: ChannelError) {
        ctx.fire_exception_caught(error);
    }

    fn bind(&mut self, ctx: &Context, addr: SocketAddr, promise: OpPromise) {
        ctx.bind(addr, promise);
    }

    fn connect(&mut self, ctx: &Context, addr: SocketAddr, promise: OpPromise) {
        ctx.connect(addr, promise);
    }

    fn disconnect(&mut self, ctx: &Context, promise: OpPromise) {
        ctx.disconnect(promise);
    }

    fn close(&mut self, ctx: &Context, promise: OpPromise) {
        ctx.close(promise);
    }

    fn deregister(&mut self, ctx: &Context, promise: OpPromise) {
        ctx.deregister(promise);
    }

    fn read(&mut self, ctx: &Context) {
        ctx.read();
    }

    fn write(&mut self, ctx: &Context, msg: Message, promise: OpPromise) {
        ctx.write(msg, promise);
    }

    fn flush(&mut self, ctx: &Context) {
        ctx.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_partitions() {
        assert!(EventMask::ALL.contains(EventMask::INBOUND));
        assert!(EventMask::ALL.contains(EventMask::OUTBOUND));
        assert!(!EventMask::INBOUND.intersects(EventMask::OUTBOUND));
        assert!(EventMask::INBOUND.contains(EventMask::READ | EventMask::EXCEPTION_CAUGHT));
        assert!(EventMask::OUTBOUND.contains(EventMask::WRITE | EventMask::FLUSH));
    }
}
