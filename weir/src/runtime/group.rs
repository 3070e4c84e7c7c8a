//! A fixed set of event loops sharing work by channel assignment.
//!
//! Channels are distributed round-robin at registration time and never move
//! afterwards; the group only hands out loop handles and coordinates
//! shutdown.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::event_loop::{EventLoopHandle, LoopConfig, new_loop, run_loop};

pub struct EventLoopGroup {
    handles: Vec<EventLoopHandle>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    /// Spawn `threads` loops (0 = one per available core).
    pub fn new(threads: usize) -> io::Result<Arc<Self>> {
        Self::with_config(threads, LoopConfig::default())
    }

    pub fn with_config(threads: usize, config: LoopConfig) -> io::Result<Arc<Self>> {
        let threads = if threads == 0 {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            threads
        };
        let mut handles = Vec::with_capacity(threads);
        let mut joins = Vec::with_capacity(threads);
        for index in 0..threads {
            let (handle, seed) = new_loop(index, config.clone()).map_err(io::Error::from)?;
            let join = std::thread::Builder::new()
                .name(format!("weir-loop-{index}"))
                .spawn(move || run_loop(std::rc::Rc::new(seed.into_ctx())))?;
            handles.push(handle);
            joins.push(join);
        }
        debug!(threads, "event loop group started");
        Ok(Arc::new(EventLoopGroup {
            handles,
            joins: Mutex::new(joins),
            next: AtomicUsize::new(0),
        }))
    }

    /// The next loop in round-robin order; where the next channel registers.
    pub fn next(&self) -> EventLoopHandle {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        self.handles[i].clone()
    }

    pub fn handles(&self) -> &[EventLoopHandle] {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cooperative shutdown: every loop rejects new work, drains what it
    /// has, closes remaining channels and exits. Blocks until all loop
    /// threads joined. Safe to call more than once.
    pub fn shutdown(&self) {
        for handle in &self.handles {
            handle.shutdown();
        }
        let joins: Vec<_> = self.joins.lock().drain(..).collect();
        for join in joins {
            if join.join().is_err() {
                warn!("event loop thread panicked during shutdown");
            }
        }
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for EventLoopGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventLoopGroup({} loops)", self.handles.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn execute_runs_on_loop_thread() {
        let group = EventLoopGroup::new(1).unwrap();
        let handle = group.next();
        assert!(!handle.in_event_loop());

        let ran = Arc::new(AtomicBool::new(false));
        let probe = ran.clone();
        let h2 = handle.clone();
        let p = crate::promise::OpPromise::new();
        let p2 = p.clone();
        handle
            .execute(move || {
                probe.store(h2.in_event_loop(), Ordering::SeqCst);
                p2.set_success();
            })
            .unwrap();
        assert_eq!(p.await_done(), Ok(()));
        assert!(ran.load(Ordering::SeqCst));
        group.shutdown();
    }

    #[test]
    fn schedule_fires_and_cancel_suppresses() {
        let group = EventLoopGroup::new(1).unwrap();
        let handle = group.next();

        let fired = crate::promise::OpPromise::new();
        let f2 = fired.clone();
        handle
            .schedule(Duration::from_millis(20), move || f2.set_success())
            .unwrap();

        let never = Arc::new(AtomicBool::new(false));
        let n2 = never.clone();
        let cancel = handle
            .schedule(Duration::from_millis(20), move || {
                n2.store(true, Ordering::SeqCst)
            })
            .unwrap();
        cancel.cancel();

        assert_eq!(fired.await_done(), Ok(()));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!never.load(Ordering::SeqCst));
        group.shutdown();
    }

    #[test]
    fn shutdown_rejects_new_tasks() {
        let group = EventLoopGroup::new(1).unwrap();
        let handle = group.next();
        group.shutdown();
        assert!(handle.is_terminated());
        assert!(handle.execute(|| {}).is_err());
    }

    #[test]
    fn round_robin_cycles() {
        let group = EventLoopGroup::new(2).unwrap();
        let a = group.next();
        let b = group.next();
        let c = group.next();
        assert_ne!(a, b);
        assert_eq!(a, c);
        group.shutdown();
    }
}
