//! Pipeline-oriented network I/O runtime on single-threaded epoll event loops.
//!
//! weir runs each connection as a [`channel::Channel`]: one file descriptor,
//! one handler [`pipeline::Pipeline`], one owning [`runtime::EventLoop`]. A
//! loop is a single OS thread that multiplexes readiness across all channels
//! registered to it, so channel state is plain single-threaded data with no
//! locks on the event path. Calls from other threads go through `Send`
//! handles that turn the operation into a task on the owning loop and hand
//! back an [`promise::OpPromise`] to observe completion.
//!
//! # Architecture
//!
//! ```text
//! EventLoopGroup ──▶ EventLoop (thread) ──▶ epoll_wait ──▶ Channel readiness
//!                        │                                     │
//!                        │ tasks / timers                      ▼
//!                        ◀──── ChannelHandle (other threads)  Pipeline
//!                                                              │
//!                                              head ◀─ ctx ─▶ tail
//! ```
//!
//! The epoll descriptor, the wakeup eventfd and the fd → channel table are
//! owned by the loop thread; interest changes requested elsewhere are
//! marshalled through the loop's task queue.

pub mod channel;
pub mod error;
pub mod id;
pub mod pipeline;
pub mod promise;
pub mod recycler;
pub mod runtime;
pub mod sys;
pub mod transport;

pub use channel::{Channel, ChannelHandle, Message};
pub use error::ChannelError;
pub use id::ChannelId;
pub use pipeline::{Context, EventMask, Handler};
pub use promise::OpPromise;
pub use runtime::{EventLoopGroup, EventLoopHandle};

/// A boxed error type for weir operations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A Result type using BoxError.
pub type Result<T> = std::result::Result<T, BoxError>;
