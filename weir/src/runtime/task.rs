//! Task boxes run by an event loop.
//!
//! Both flavors receive the loop-local state so channel operations submitted
//! from other threads can resolve their channel by id once they arrive on
//! the owning thread. Local tasks additionally may capture loop-confined
//! (`!Send`) values such as `Channel` clones.

use std::rc::Rc;

use super::event_loop::LoopCtx;

/// A task submitted from any thread.
pub(crate) type RemoteTask = Box<dyn FnOnce(&Rc<LoopCtx>) + Send + 'static>;

/// A task created on the loop thread itself; may capture `!Send` state.
pub(crate) type LocalTask = Box<dyn FnOnce(&Rc<LoopCtx>) + 'static>;
