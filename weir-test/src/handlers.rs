//! Reusable test handlers: echo, recording, collecting.

use std::sync::Arc;
use std::sync::mpsc::Sender;

use bytes::BytesMut;
use parking_lot::Mutex;
use weir::error::ChannelError;
use weir::pipeline::UserEvent;
use weir::{Context, EventMask, Handler, Message};

/// Writes every received byte chunk straight back and flushes.
pub struct EchoHandler;

impl Handler for EchoHandler {
    fn events(&self) -> EventMask {
        EventMask::READ
    }

    fn channel_read(&mut self, ctx: &Context, msg: Message) {
        if let Message::Buf(data) = msg {
            let promise = ctx.write_future(Message::Buf(data));
            promise.add_listener(|result| {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "echo write failed");
                }
            });
            ctx.flush();
        }
    }
}

/// Accumulates received bytes and signals once a target count arrived.
pub struct Collector {
    buf: Arc<Mutex<BytesMut>>,
    target: usize,
    notify: Sender<usize>,
}

impl Collector {
    pub fn new(target: usize, notify: Sender<usize>) -> (Self, Arc<Mutex<BytesMut>>) {
        let buf = Arc::new(Mutex::new(BytesMut::new()));
        (
            Collector {
                buf: buf.clone(),
                target,
                notify,
            },
            buf,
        )
    }
}

impl Handler for Collector {
    fn events(&self) -> EventMask {
        EventMask::READ
    }

    fn channel_read(&mut self, _ctx: &Context, msg: Message) {
        if let Message::Buf(data) = msg {
            let mut buf = self.buf.lock();
            buf.extend_from_slice(&data);
            if buf.len() >= self.target {
                let _ = self.notify.send(buf.len());
            }
        }
    }
}

/// Every lifecycle/exception event this handler sees, in arrival order.
#[derive(Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
        let entries = Arc::new(Mutex::new(Vec::new()));
        (
            EventLog {
                entries: entries.clone(),
            },
            entries,
        )
    }

    fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }
}

impl Handler for EventLog {
    fn channel_registered(&mut self, ctx: &Context) {
        self.push("registered");
        ctx.fire_channel_registered();
    }

    fn channel_unregistered(&mut self, ctx: &Context) {
        self.push("unregistered");
        ctx.fire_channel_unregistered();
    }

    fn channel_active(&mut self, ctx: &Context) {
        self.push("active");
        ctx.fire_channel_active();
    }

    fn channel_inactive(&mut self, ctx: &Context) {
        self.push("inactive");
        ctx.fire_channel_inactive();
    }

    fn channel_read(&mut self, ctx: &Context, msg: Message) {
        self.push(format!("read:{}", msg.byte_len()));
        ctx.fire_channel_read(msg);
    }

    fn channel_read_complete(&mut self, ctx: &Context) {
        self.push("read_complete");
        ctx.fire_channel_read_complete();
    }

    fn channel_writability_changed(&mut self, ctx: &Context) {
        self.push(format!("writability:{}", ctx.handle().is_writable()));
        ctx.fire_channel_writability_changed();
    }

    fn user_event(&mut self, ctx: &Context, event: UserEvent) {
        self.push("user_event");
        ctx.fire_user_event(event);
    }

    fn exception_caught(&mut self, ctx: &Context, error: ChannelError) {
        self.push(format!("exception:{error}"));
        ctx.fire_exception_caught(error);
    }
}

/// Panics on the first read; for exception-path tests.
pub struct PanicOnRead;

impl Handler for PanicOnRead {
    fn events(&self) -> EventMask {
        EventMask::READ
    }

    fn channel_read(&mut self, _ctx: &Context, _msg: Message) {
        panic!("boom");
    }
}
