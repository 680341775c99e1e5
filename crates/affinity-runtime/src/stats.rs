use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters for one marshalling site (typically one context).
#[derive(Debug, Default)]
pub struct MarshalStats {
    inline: AtomicU64,
    marshalled: AtomicU64,
    timeouts: AtomicU64,
    stale_owners: AtomicU64,
}

/// Point-in-time copy of [`MarshalStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MarshalCounters {
    /// Operations executed inline because the caller was the owner.
    pub inline: u64,
    /// Operations queued onto the owner's run loop.
    pub marshalled: u64,
    /// Marshalled operations that hit their deadline.
    pub timeouts: u64,
    /// Marshalled operations whose owner had gone away.
    pub stale_owners: u64,
}

impl MarshalStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_inline(&self) {
        self.inline.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_marshalled(&self) {
        self.marshalled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_owner(&self) {
        self.stale_owners.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MarshalCounters {
        MarshalCounters {
            inline: self.inline.load(Ordering::Relaxed),
            marshalled: self.marshalled.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            stale_owners: self.stale_owners.load(Ordering::Relaxed),
        }
    }
}
