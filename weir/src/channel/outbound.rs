//! The outbound queue: pending writes, flush cursor, writability edges.
//!
//! Entries accumulate unflushed until `add_flush` marks the boundary; only
//! entries at or before that boundary are visible to the transport write
//! loop, which consumes them strictly FIFO and completes each promise when
//! its last byte is on the wire (or the entry fails).
//!
//! Byte accounting lives in [`PendingBytes`], shared with foreign-thread
//! channel handles so a cross-thread write can charge the counter *before*
//! its task is queued; writability stays truthful under scheduling delay.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use arc_swap::ArcSwap;

use super::Message;
use super::config::ChannelConfig;
use crate::error::ChannelError;
use crate::promise::OpPromise;

/// Which writability edge, if any, an accounting step crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WritabilityEdge {
    BecameUnwritable,
    BecameWritable,
}

/// Shared pending-byte counter with edge-detected watermark state.
pub(crate) struct PendingBytes {
    bytes: AtomicUsize,
    writable: AtomicBool,
    config: Arc<ArcSwap<ChannelConfig>>,
}

impl PendingBytes {
    pub(crate) fn new(config: Arc<ArcSwap<ChannelConfig>>) -> Arc<Self> {
        Arc::new(PendingBytes {
            bytes: AtomicUsize::new(0),
            writable: AtomicBool::new(true),
            config,
        })
    }

    pub(crate) fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    /// Charge `n` bytes. The swap makes the unwritable transition fire
    /// exactly once per crossing, no matter how many adds pile on above the
    /// watermark.
    pub(crate) fn add(&self, n: usize) -> Option<WritabilityEdge> {
        let total = self.bytes.fetch_add(n, Ordering::AcqRel) + n;
        let high = self.config.load().write_high_watermark;
        if total > high && self.writable.swap(false, Ordering::AcqRel) {
            return Some(WritabilityEdge::BecameUnwritable);
        }
        None
    }

    /// Release `n` bytes; the inverse edge fires once when the total drops
    /// below the low watermark.
    pub(crate) fn sub(&self, n: usize) -> Option<WritabilityEdge> {
        let total = self.bytes.fetch_sub(n, Ordering::AcqRel) - n;
        let low = self.config.load().write_low_watermark;
        if total < low
            && self
                .writable
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return Some(WritabilityEdge::BecameWritable);
        }
        None
    }
}

struct Entry {
    msg: Message,
    size: usize,
    promise: OpPromise,
}

/// Per-channel FIFO of not-yet-written messages. Loop-thread only.
pub(crate) struct OutboundBuffer {
    queue: VecDeque<Entry>,
    /// Entries `[0, flushed)` are visible to the transport.
    flushed: usize,
    /// Bytes of the first flushed entry already written by a partial write.
    first_offset: usize,
    pending: Arc<PendingBytes>,
}

impl OutboundBuffer {
    pub(crate) fn new(pending: Arc<PendingBytes>) -> Self {
        OutboundBuffer {
            queue: VecDeque::new(),
            flushed: 0,
            first_offset: 0,
            pending,
        }
    }

    /// Append an unflushed entry. Returns the writability edge to publish,
    /// if this add crossed the high watermark.
    pub(crate) fn add_message(
        &mut self,
        msg: Message,
        size: usize,
        promise: OpPromise,
    ) -> Option<WritabilityEdge> {
        self.queue.push_back(Entry { msg, size, promise });
        self.pending.add(size)
    }

    /// Make everything queued so far visible to the write loop.
    pub(crate) fn add_flush(&mut self) {
        self.flushed = self.queue.len();
    }

    pub(crate) fn has_flushed(&self) -> bool {
        self.flushed > 0
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn pending_bytes(&self) -> usize {
        self.pending.bytes()
    }

    /// The flushed entries' payloads in FIFO order, with the partial-write
    /// offset already applied to the first, up to `max` slices. Datagram and
    /// other non-byte messages yield exactly one slice each call.
    pub(crate) fn flushed_messages(&self) -> impl Iterator<Item = (&Message, usize)> {
        self.queue
            .iter()
            .take(self.flushed)
            .enumerate()
            .map(|(i, e)| (&e.msg, if i == 0 { self.first_offset } else { 0 }))
    }

    pub(crate) fn first_flushed(&self) -> Option<(&Message, usize)> {
        if self.flushed == 0 {
            return None;
        }
        self.queue.front().map(|e| (&e.msg, self.first_offset))
    }

    /// Consume `n` written bytes from the front of the flushed range,
    /// completing promises for every entry fully written. Returns the edges
    /// crossed while releasing bytes.
    pub(crate) fn advance(&mut self, mut n: usize) -> Vec<WritabilityEdge> {
        let mut edges = Vec::new();
        while n > 0 && self.flushed > 0 {
            let len = {
                let entry = self.queue.front().expect("flushed entry");
                entry.msg.byte_len().saturating_sub(self.first_offset)
            };
            if n < len {
                self.first_offset += n;
                break;
            }
            n -= len;
            self.complete_first(Ok(()), &mut edges);
        }
        edges
    }

    /// Complete the first flushed entry without byte accounting against its
    /// payload length (datagrams are all-or-nothing).
    pub(crate) fn remove_first(&mut self, result: Result<(), ChannelError>) -> Vec<WritabilityEdge> {
        let mut edges = Vec::new();
        if self.flushed > 0 {
            self.complete_first(result, &mut edges);
        }
        edges
    }

    fn complete_first(
        &mut self,
        result: Result<(), ChannelError>,
        edges: &mut Vec<WritabilityEdge>,
    ) {
        let entry = self.queue.pop_front().expect("flushed entry");
        self.flushed -= 1;
        self.first_offset = 0;
        if let Some(edge) = self.pending.sub(entry.size) {
            edges.push(edge);
        }
        match result {
            Ok(()) => entry.promise.try_success(),
            Err(e) => entry.promise.try_failure(e),
        };
    }

    /// Fail every entry, flushed or not; used on close.
    pub(crate) fn fail_all(&mut self, err: ChannelError) -> Vec<WritabilityEdge> {
        let mut edges = Vec::new();
        while let Some(entry) = self.queue.pop_front() {
            if let Some(edge) = self.pending.sub(entry.size) {
                edges.push(edge);
            }
            entry.promise.try_failure(err.clone());
        }
        self.flushed = 0;
        self.first_offset = 0;
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn fixture(high: usize, low: usize) -> (OutboundBuffer, Arc<PendingBytes>) {
        let cfg = Arc::new(ArcSwap::from_pointee(ChannelConfig {
            write_high_watermark: high,
            write_low_watermark: low,
            ..ChannelConfig::default()
        }));
        let pending = PendingBytes::new(cfg);
        (OutboundBuffer::new(pending.clone()), pending)
    }

    fn buf_msg(n: usize) -> Message {
        Message::Buf(Bytes::from(vec![b'x'; n]))
    }

    #[test]
    fn watermark_edges_fire_once_per_crossing() {
        let (mut ob, pending) = fixture(25, 8);
        assert!(pending.is_writable());

        assert_eq!(ob.add_message(buf_msg(10), 10, OpPromise::new()), None);
        assert_eq!(
            ob.add_message(buf_msg(20), 20, OpPromise::new()),
            Some(WritabilityEdge::BecameUnwritable)
        );
        // Still above: no second edge.
        assert_eq!(ob.add_message(buf_msg(30), 30, OpPromise::new()), None);
        assert!(!pending.is_writable());

        ob.add_flush();
        // Draining 10 leaves 50 pending: no edge yet.
        assert!(ob.advance(10).is_empty());
        // Draining everything crosses the low watermark exactly once.
        let edges = ob.advance(50);
        assert_eq!(edges, vec![WritabilityEdge::BecameWritable]);
        assert_eq!(pending.bytes(), 0);
    }

    #[test]
    fn flush_cursor_hides_later_entries() {
        let (mut ob, _) = fixture(1024, 512);
        ob.add_message(buf_msg(4), 4, OpPromise::new());
        ob.add_flush();
        ob.add_message(buf_msg(6), 6, OpPromise::new());

        let visible: Vec<usize> = ob.flushed_messages().map(|(m, _)| m.byte_len()).collect();
        assert_eq!(visible, vec![4]);

        ob.add_flush();
        let visible: Vec<usize> = ob.flushed_messages().map(|(m, _)| m.byte_len()).collect();
        assert_eq!(visible, vec![4, 6]);
    }

    #[test]
    fn partial_write_tracks_offset() {
        let (mut ob, _) = fixture(1024, 512);
        let p = OpPromise::new();
        ob.add_message(buf_msg(10), 10, p.clone());
        ob.add_flush();

        ob.advance(4);
        assert!(!p.is_done());
        let (_, offset) = ob.first_flushed().unwrap();
        assert_eq!(offset, 4);

        ob.advance(6);
        assert!(p.is_success());
        assert!(ob.is_empty());
    }

    #[test]
    fn promises_complete_in_submission_order() {
        let (mut ob, _) = fixture(1024, 512);
        let promises: Vec<OpPromise> = (0..3).map(|_| OpPromise::new()).collect();
        for p in &promises {
            ob.add_message(buf_msg(5), 5, p.clone());
        }
        ob.add_flush();

        ob.advance(5);
        assert!(promises[0].is_success());
        assert!(!promises[1].is_done());

        ob.advance(10);
        assert!(promises.iter().all(|p| p.is_success()));
        assert_eq!(ob.pending_bytes(), 0);
    }

    #[test]
    fn fail_all_completes_with_error() {
        let (mut ob, pending) = fixture(8, 4);
        let p1 = OpPromise::new();
        let p2 = OpPromise::new();
        ob.add_message(buf_msg(6), 6, p1.clone());
        ob.add_flush();
        ob.add_message(buf_msg(6), 6, p2.clone());

        let edges = ob.fail_all(ChannelError::Closed);
        assert_eq!(p1.result(), Some(Err(ChannelError::Closed)));
        assert_eq!(p2.result(), Some(Err(ChannelError::Closed)));
        assert_eq!(pending.bytes(), 0);
        assert_eq!(edges, vec![WritabilityEdge::BecameWritable]);
    }
}
