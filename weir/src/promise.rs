//! Completion promises for asynchronous channel operations.
//!
//! Every channel operation that may be deferred to the owning event loop
//! hands back an [`OpPromise`]. The submitting thread can attach listeners
//! (dispatched on the promise's bound executor) or block in [`await_done`]
//! (refused on a loop thread, which would deadlock the loop against itself).
//!
//! A promise completes exactly once. Completing it again is a bug in the
//! caller and is logged rather than escalated, matching the rule that the
//! event path never panics on bookkeeping slips.
//!
//! [`await_done`]: OpPromise::await_done

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::ChannelError;
use crate::runtime::EventLoopHandle;

/// Result carried by a completed promise.
pub type OpResult = Result<(), ChannelError>;

type Listener = Box<dyn FnOnce(&OpResult) + Send>;

enum State {
    Pending(Vec<Listener>),
    Done(OpResult),
}

struct Inner {
    /// Fire-and-forget mode: completion is recorded but listeners and
    /// failure accounting are skipped. Failures still get logged.
    void: bool,
    executor: Option<EventLoopHandle>,
    state: Mutex<State>,
    done: Condvar,
}

/// A cloneable, thread-safe completion handle.
#[derive(Clone)]
pub struct OpPromise {
    inner: Arc<Inner>,
}

impl OpPromise {
    /// A promise with no bound executor; listeners run on whichever thread
    /// completes the promise.
    pub fn new() -> Self {
        Self::build(false, None)
    }

    /// A promise whose listeners are dispatched on `executor`.
    pub fn with_executor(executor: EventLoopHandle) -> Self {
        Self::build(false, Some(executor))
    }

    /// The void promise used for fire-and-forget writes.
    pub fn void() -> Self {
        Self::build(true, None)
    }

    fn build(void: bool, executor: Option<EventLoopHandle>) -> Self {
        OpPromise {
            inner: Arc::new(Inner {
                void,
                executor,
                state: Mutex::new(State::Pending(Vec::new())),
                done: Condvar::new(),
            }),
        }
    }

    pub fn is_void(&self) -> bool {
        self.inner.void
    }

    pub fn is_done(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Done(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Done(Ok(())))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            &*self.inner.state.lock(),
            State::Done(Err(ChannelError::Cancelled))
        )
    }

    /// The result, if completed.
    pub fn result(&self) -> Option<OpResult> {
        match &*self.inner.state.lock() {
            State::Done(r) => Some(r.clone()),
            State::Pending(_) => None,
        }
    }

    /// Complete successfully; logs if the promise was already done.
    pub fn set_success(&self) {
        if !self.try_success() {
            warn!("promise completed more than once (success)");
        }
    }

    /// Complete with `err`; logs if the promise was already done.
    pub fn set_failure(&self, err: ChannelError) {
        if self.inner.void {
            // Void promises have no observers; the failure must not vanish.
            warn!(error = %err, "write on void promise failed");
        }
        if !self.try_failure(err) && !self.inner.void {
            warn!("promise completed more than once (failure)");
        }
    }

    /// Complete successfully unless already done. Returns whether this call
    /// won the completion.
    pub fn try_success(&self) -> bool {
        self.complete(Ok(()))
    }

    /// Complete with `err` unless already done.
    pub fn try_failure(&self, err: ChannelError) -> bool {
        self.complete(Err(err))
    }

    /// Cancel: completes with [`ChannelError::Cancelled`] unless already done.
    pub fn cancel(&self) -> bool {
        self.try_failure(ChannelError::Cancelled)
    }

    fn complete(&self, result: OpResult) -> bool {
        let listeners = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending(listeners) => {
                    let listeners = std::mem::take(listeners);
                    *state = State::Done(result.clone());
                    listeners
                }
            }
        };
        self.inner.done.notify_all();
        self.dispatch(listeners, result);
        true
    }

    /// Run `f` when the promise completes; immediately (on the bound
    /// executor, if any) when it already has.
    pub fn add_listener(&self, f: impl FnOnce(&OpResult) + Send + 'static) {
        if self.inner.void {
            return;
        }
        let listener: Listener = Box::new(f);
        let late = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending(listeners) => {
                    listeners.push(listener);
                    None
                }
                State::Done(r) => Some((listener, r.clone())),
            }
        };
        if let Some((listener, result)) = late {
            self.dispatch(vec![listener], result);
        }
    }

    fn dispatch(&self, listeners: Vec<Listener>, result: OpResult) {
        if listeners.is_empty() {
            return;
        }
        match &self.inner.executor {
            Some(executor) if !executor.in_event_loop() => {
                let result = result.clone();
                let submitted = executor.execute(move || {
                    for l in listeners {
                        l(&result);
                    }
                });
                if submitted.is_err() {
                    warn!("promise listeners dropped: bound executor is shut down");
                }
            }
            _ => {
                for l in listeners {
                    l(&result);
                }
            }
        }
    }

    /// Block until completed and return the result.
    ///
    /// # Panics
    ///
    /// Panics when called from an event loop thread: the loop would wait on
    /// work only it can run.
    pub fn await_done(&self) -> OpResult {
        assert!(
            !crate::runtime::on_loop_thread(),
            "OpPromise::await_done called from an event loop thread"
        );
        let mut state = self.inner.state.lock();
        loop {
            if let State::Done(r) = &*state {
                return r.clone();
            }
            self.inner.done.wait(&mut state);
        }
    }
}

impl Default for OpPromise {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OpPromise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.inner.state.lock() {
            State::Pending(_) => write!(f, "OpPromise(pending)"),
            State::Done(r) => write!(f, "OpPromise({r:?})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn completes_once() {
        let p = OpPromise::new();
        assert!(p.try_success());
        assert!(!p.try_failure(ChannelError::Closed));
        assert!(p.is_success());
    }

    #[test]
    fn listener_after_completion_fires() {
        let p = OpPromise::new();
        p.set_failure(ChannelError::Reset);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        p.add_listener(move |r| {
            assert_eq!(r, &Err(ChannelError::Reset));
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn await_done_across_threads() {
        let p = OpPromise::new();
        let p2 = p.clone();
        let t = std::thread::spawn(move || p2.await_done());
        std::thread::sleep(std::time::Duration::from_millis(10));
        p.set_success();
        assert_eq!(t.join().unwrap(), Ok(()));
    }

    #[test]
    fn void_promise_skips_listeners() {
        let p = OpPromise::void();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        p.add_listener(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        p.set_failure(ChannelError::Closed);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
