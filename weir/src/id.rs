//! Globally unique, lexically ordered channel identifiers.
//!
//! An id packs machine entropy, the process id, a process-wide sequence
//! number, a millisecond timestamp and per-id randomness into a fixed byte
//! string, so ids sort in roughly-creation order across a fleet and compare
//! cheaply as plain byte slices.

use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

/// machine(8) + pid(4) + sequence(4) + millis(8) + random(4)
const LEN: usize = 28;

/// Unique identity of a channel for its whole lifetime.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId {
    bytes: [u8; LEN],
}

static SEQUENCE: AtomicU32 = AtomicU32::new(0);

fn machine_id() -> &'static [u8; 8] {
    // One random machine component per process; reading interface hardware
    // addresses is not worth a privileged lookup here.
    static MACHINE: OnceLock<[u8; 8]> = OnceLock::new();
    MACHINE.get_or_init(|| {
        let mut id = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut id);
        id
    })
}

impl ChannelId {
    /// Generate the next id.
    pub fn next() -> Self {
        let mut bytes = [0u8; LEN];
        bytes[..8].copy_from_slice(machine_id());
        bytes[8..12].copy_from_slice(&std::process::id().to_be_bytes());
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        bytes[12..16].copy_from_slice(&seq.to_be_bytes());
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        bytes[16..24].copy_from_slice(&millis.to_be_bytes());
        bytes[24..].copy_from_slice(&rand::thread_rng().next_u32().to_be_bytes());
        ChannelId { bytes }
    }

    /// Short form: the sequence + random tail, enough to tell channels apart
    /// in logs from one process.
    pub fn short_text(&self) -> String {
        let mut s = String::with_capacity(16);
        for b in &self.bytes[12..16] {
            s.push_str(&format!("{b:02x}"));
        }
        for b in &self.bytes[24..] {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }

    /// Long form: every component, hex encoded.
    pub fn long_text(&self) -> String {
        let mut s = String::with_capacity(LEN * 2);
        for b in &self.bytes {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short_text())
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.short_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_ordered() {
        let a = ChannelId::next();
        let b = ChannelId::next();
        assert_ne!(a, b);
        // Same machine, same process, increasing sequence.
        assert!(a < b);
    }

    #[test]
    fn text_forms() {
        let id = ChannelId::next();
        assert_eq!(id.long_text().len(), LEN * 2);
        assert_eq!(id.short_text().len(), 16);
        assert!(id.long_text().contains(&id.short_text()[..8]));
    }
}
