//! Thin typed wrappers over the OS facilities the runtime drives.
//!
//! Everything that touches a raw syscall lives under this module so the rest
//! of the crate deals in `Result<_, Errno>` and owned descriptors only.

pub mod epoll;
pub mod socket;

pub use epoll::{Poller, Readiness, WAKE_TOKEN};
