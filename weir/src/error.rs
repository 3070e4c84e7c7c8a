//! Error types and the errno classification used by the epoll transports.
//!
//! Syscall-level failures stay `nix::errno::Errno` until they cross into
//! channel logic, where [`classify`] sorts them into the small set of
//! outcomes the rest of the runtime cares about: retry later, peer reset,
//! already closed, or fatal for this channel.

use std::fmt;
use std::sync::Arc;

pub type Errno = nix::errno::Errno;

/// Error delivered through promises and `exception_caught` events.
///
/// Cloneable because one failure may complete several write promises and
/// still travel down the pipeline as an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel is closed (or closing); the operation was not attempted.
    Closed,
    /// The peer reset the connection (EPIPE / ECONNRESET).
    Reset,
    /// A connect attempt did not complete within the configured timeout.
    ConnectTimeout,
    /// The operation requires a registered channel.
    NotRegistered,
    /// `register` was called on an already registered channel.
    AlreadyRegistered,
    /// The promise was cancelled before completion.
    Cancelled,
    /// The owning event loop is shutting down and rejected the task.
    LoopShutDown,
    /// A pipeline handler panicked while processing an event.
    HandlerPanic(Arc<str>),
    /// A handler's `handler_added`/`handler_removed` returned an error.
    HandlerFailed(Arc<str>),
    /// A pipeline mutation was rejected.
    Pipeline(PipelineError),
    /// Any other OS-level failure, kept as the raw errno.
    Io(Errno),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Closed => write!(f, "channel is closed"),
            ChannelError::Reset => write!(f, "connection reset by peer"),
            ChannelError::ConnectTimeout => write!(f, "connect attempt timed out"),
            ChannelError::NotRegistered => write!(f, "channel is not registered"),
            ChannelError::AlreadyRegistered => write!(f, "channel is already registered"),
            ChannelError::Cancelled => write!(f, "operation cancelled"),
            ChannelError::LoopShutDown => write!(f, "event loop is shut down"),
            ChannelError::HandlerPanic(msg) => write!(f, "handler panicked: {msg}"),
            ChannelError::HandlerFailed(msg) => write!(f, "handler failed: {msg}"),
            ChannelError::Pipeline(e) => write!(f, "pipeline error: {e}"),
            ChannelError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<PipelineError> for ChannelError {
    fn from(e: PipelineError) -> Self {
        ChannelError::Pipeline(e)
    }
}

impl From<Errno> for ChannelError {
    fn from(e: Errno) -> Self {
        match classify(e) {
            IoClass::Reset => ChannelError::Reset,
            IoClass::Closed => ChannelError::Closed,
            _ => ChannelError::Io(e),
        }
    }
}

/// Error from pipeline mutation operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// A handler with this name already exists in the pipeline.
    DuplicateName(String),
    /// No handler with this name (or the anchor name) exists.
    NotFound(String),
    /// The pipeline belongs to a closed channel.
    Terminated,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::DuplicateName(name) => {
                write!(f, "duplicate handler name: {name:?}")
            }
            PipelineError::NotFound(name) => write!(f, "no such handler: {name:?}"),
            PipelineError::Terminated => write!(f, "pipeline belongs to a closed channel"),
        }
    }
}

impl std::error::Error for PipelineError {}

/// What a failed syscall means for the channel that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoClass {
    /// No progress right now; retry on the next readiness notification.
    WouldBlock,
    /// Interrupted; retry immediately.
    Interrupted,
    /// Peer-reset class: surface through `exception_caught`, then close.
    Reset,
    /// The descriptor is already gone; fail promises, no exception event.
    Closed,
    /// Anything else: fatal for this channel (never for the loop).
    Fatal,
}

/// Sort an errno into the channel-level taxonomy.
pub fn classify(e: Errno) -> IoClass {
    match e {
        Errno::EAGAIN => IoClass::WouldBlock,
        Errno::EINTR => IoClass::Interrupted,
        Errno::EPIPE | Errno::ECONNRESET => IoClass::Reset,
        Errno::EBADF => IoClass::Closed,
        _ => IoClass::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_taxonomy() {
        assert_eq!(classify(Errno::EAGAIN), IoClass::WouldBlock);
        assert_eq!(classify(Errno::EPIPE), IoClass::Reset);
        assert_eq!(classify(Errno::ECONNRESET), IoClass::Reset);
        assert_eq!(classify(Errno::EBADF), IoClass::Closed);
        assert_eq!(classify(Errno::ENOMEM), IoClass::Fatal);
    }

    #[test]
    fn errno_to_channel_error() {
        assert_eq!(ChannelError::from(Errno::ECONNRESET), ChannelError::Reset);
        assert_eq!(ChannelError::from(Errno::EBADF), ChannelError::Closed);
        assert_eq!(
            ChannelError::from(Errno::ENOSPC),
            ChannelError::Io(Errno::ENOSPC)
        );
    }
}
