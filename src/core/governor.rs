//! Global memory budget for QoS 0 entries across every queue.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::Config;

/// Running byte total of queued QoS 0 messages, updated lock-free.
#[derive(Debug)]
pub struct Qos0MemoryGovernor {
    current: AtomicU64,
    limit: u64,
}

impl Qos0MemoryGovernor {
    pub fn new(limit_bytes: u64) -> Self {
        Self {
            current: AtomicU64::new(0),
            limit: limit_bytes,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.qos0_memory_limit())
    }

    #[inline]
    pub fn increment(&self, bytes: u64) {
        self.current.fetch_add(bytes, Ordering::AcqRel);
    }

    #[inline]
    pub fn decrement(&self, bytes: u64) {
        // Saturate so a stale size can never wrap the counter.
        let _ = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    #[inline]
    pub fn exceeded(&self) -> bool {
        self.current() > self.limit
    }
}
