//! Notifications for messages the queue throws away under capacity pressure.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::core::message::Qos;

/// Sink for capacity drops (metrics, logging).
pub trait MessageDroppedService: Send + Sync + fmt::Debug {
    /// A queue hit its depth limit and a message was discarded.
    fn queue_full(&self, queue_id: &str, topic: &str, qos: Qos);

    /// The global QoS 0 budget evicted a message from a client queue.
    fn qos0_memory_exceeded(
        &self,
        client_id: &str,
        topic: &str,
        qos: Qos,
        current_bytes: u64,
        limit_bytes: u64,
    );

    /// The global QoS 0 budget evicted a message from a shared-subscription queue.
    fn qos0_memory_exceeded_shared(
        &self,
        group_id: &str,
        topic: &str,
        qos: Qos,
        current_bytes: u64,
        limit_bytes: u64,
    );
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounts {
    pub queue_full: u64,
    pub qos0_memory_exceeded: u64,
    pub qos0_memory_exceeded_shared: u64,
}

/// Logs every drop at debug level and keeps running totals.
#[derive(Debug, Default)]
pub struct LoggingDropService {
    queue_full: AtomicU64,
    qos0_memory_exceeded: AtomicU64,
    qos0_memory_exceeded_shared: AtomicU64,
}

impl LoggingDropService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> DropCounts {
        DropCounts {
            queue_full: self.queue_full.load(Ordering::Relaxed),
            qos0_memory_exceeded: self.qos0_memory_exceeded.load(Ordering::Relaxed),
            qos0_memory_exceeded_shared: self.qos0_memory_exceeded_shared.load(Ordering::Relaxed),
        }
    }
}

impl MessageDroppedService for LoggingDropService {
    fn queue_full(&self, queue_id: &str, topic: &str, qos: Qos) {
        self.queue_full.fetch_add(1, Ordering::Relaxed);
        debug!(queue_id, topic, %qos, "message dropped, queue full");
    }

    fn qos0_memory_exceeded(
        &self,
        client_id: &str,
        topic: &str,
        qos: Qos,
        current_bytes: u64,
        limit_bytes: u64,
    ) {
        self.qos0_memory_exceeded.fetch_add(1, Ordering::Relaxed);
        debug!(
            client_id,
            topic,
            %qos,
            current_bytes,
            limit_bytes,
            "message dropped, qos 0 memory exceeded"
        );
    }

    fn qos0_memory_exceeded_shared(
        &self,
        group_id: &str,
        topic: &str,
        qos: Qos,
        current_bytes: u64,
        limit_bytes: u64,
    ) {
        self.qos0_memory_exceeded_shared
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            group_id,
            topic,
            %qos,
            current_bytes,
            limit_bytes,
            "shared message dropped, qos 0 memory exceeded"
        );
    }
}
