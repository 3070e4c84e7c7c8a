//! The per-loop timer heap.
//!
//! Timers are plain heap entries consulted when computing the next poll
//! timeout; there is no timer fd. Cancellation is a flag checked at fire
//! time, so a cancelled entry costs one heap pop and nothing else.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Instant;

use super::task::LocalTask;

/// Cancellation handle for a scheduled task. Best effort: a timer that
/// already fired is unaffected.
#[derive(Clone, Debug)]
pub struct ScheduleHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduleHandle {
    /// A handle created before its heap entry exists; cross-thread
    /// `schedule` hands this back immediately and links the entry when the
    /// submission reaches the loop.
    pub(crate) fn detached() -> Self {
        ScheduleHandle {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire)
    }
}

struct Entry {
    deadline: Instant,
    /// Insertion order tie-breaker so equal deadlines fire FIFO.
    seq: u64,
    cancelled: Arc<AtomicBool>,
    task: LocalTask,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the nearest deadline is on top.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl TimerHeap {
    pub(crate) fn push(&mut self, deadline: Instant, task: LocalTask) -> ScheduleHandle {
        let handle = ScheduleHandle::detached();
        self.push_with_handle(deadline, task, &handle);
        handle
    }

    pub(crate) fn push_with_handle(
        &mut self,
        deadline: Instant,
        task: LocalTask,
        handle: &ScheduleHandle,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            deadline,
            seq,
            cancelled: handle.cancelled.clone(),
            task,
        });
    }

    /// Deadline of the nearest live entry; used to bound the poll timeout.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if top.cancelled.load(AtomicOrdering::Acquire) {
                self.heap.pop();
                continue;
            }
            return Some(top.deadline);
        }
        None
    }

    /// Pop the next entry due at `now`, skipping cancelled ones.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<LocalTask> {
        while let Some(top) = self.heap.peek() {
            if top.cancelled.load(AtomicOrdering::Acquire) {
                self.heap.pop();
                continue;
            }
            if top.deadline > now {
                return None;
            }
            return self.heap.pop().map(|e| e.task);
        }
        None
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn nearest_deadline_wins() {
        let mut heap = TimerHeap::default();
        let now = Instant::now();
        heap.push(now + Duration::from_millis(10), Box::new(|_| {}));
        heap.push(now + Duration::from_millis(5), Box::new(|_| {}));
        heap.push(now + Duration::from_millis(10), Box::new(|_| {}));

        assert_eq!(heap.next_deadline(), Some(now + Duration::from_millis(5)));

        // Nothing is due yet at +1ms; everything is due at +50ms.
        assert!(heap.pop_due(now + Duration::from_millis(1)).is_none());
        let later = now + Duration::from_millis(50);
        let mut fired = 0;
        while heap.pop_due(later).is_some() {
            fired += 1;
        }
        assert_eq!(fired, 3);
    }

    #[test]
    fn cancelled_entries_are_skipped() {
        let mut heap = TimerHeap::default();
        let now = Instant::now();
        let h = heap.push(now, Box::new(|_| {}));
        h.cancel();
        assert_eq!(heap.next_deadline(), None);
        assert!(heap.pop_due(now + Duration::from_millis(1)).is_none());
        assert_eq!(heap.len(), 0);
    }
}
