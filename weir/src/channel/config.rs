//! Channel configuration.
//!
//! A channel's live config is an `ArcSwap` snapshot shared between the loop
//! thread and any foreign handles: readers load a consistent copy, updaters
//! replace the whole struct. Socket-level options are applied once at
//! creation and kept separate.

use std::time::Duration;

use super::Message;

/// Estimates the byte cost of a message for backpressure accounting. A
/// negative estimate counts as zero.
pub type SizeEstimator = fn(&Message) -> isize;

/// Live per-channel settings.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Pending outbound bytes above which the channel reports unwritable.
    pub write_high_watermark: usize,
    /// Pending outbound bytes below which writability is restored.
    pub write_low_watermark: usize,
    /// Arm read interest automatically; off means reads happen only after an
    /// explicit `read()` op.
    pub auto_read: bool,
    /// Messages pulled per readiness notification before yielding to other
    /// channels on the loop.
    pub max_messages_per_read: usize,
    /// Receive buffer handed to each stream read.
    pub read_buffer_size: usize,
    /// writev attempts per flush before parking on write readiness.
    pub write_spin_count: usize,
    /// Fail a pending connect after this long. `None` waits forever.
    pub connect_timeout: Option<Duration>,
    /// Subscribe with EPOLLET instead of level-triggered readiness.
    pub edge_triggered: bool,
    /// On peer input shutdown, fire [`InputShutdown`] instead of closing.
    ///
    /// [`InputShutdown`]: crate::channel::InputShutdown
    pub allow_half_closure: bool,
    /// Message size estimator used for watermark accounting.
    pub size_estimator: SizeEstimator,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            write_high_watermark: 64 * 1024,
            write_low_watermark: 32 * 1024,
            auto_read: true,
            max_messages_per_read: 16,
            read_buffer_size: 16 * 1024,
            write_spin_count: 16,
            connect_timeout: Some(Duration::from_secs(30)),
            edge_triggered: false,
            allow_half_closure: false,
            size_estimator: Message::default_size_estimate,
        }
    }
}

/// Socket options applied when the descriptor is created.
#[derive(Clone, Debug)]
pub struct SocketOptions {
    pub nodelay: bool,
    pub reuse_addr: bool,
    pub keepalive: bool,
    pub send_buffer: Option<usize>,
    pub recv_buffer: Option<usize>,
    /// SO_LINGER seconds; `Some(0)` turns close into an immediate reset.
    pub linger: Option<u16>,
    /// Listen backlog (listeners only).
    pub backlog: u32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            nodelay: true,
            reuse_addr: true,
            keepalive: false,
            send_buffer: None,
            recv_buffer: None,
            linger: None,
            backlog: 128,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_defaults_are_ordered() {
        let cfg = ChannelConfig::default();
        assert!(cfg.write_low_watermark < cfg.write_high_watermark);
        assert!(cfg.max_messages_per_read > 0);
    }
}
