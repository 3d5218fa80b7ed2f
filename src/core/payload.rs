//! Payload ownership shared between queue entries and the payload store.
//!
//! The store keeps the bytes and a reference count per payload id. Every
//! queued PUBLISH owns exactly one unit of that count through a [`PayloadRef`],
//! which can only be given back by consuming it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{trace, warn};

/// Reference-counted blob store the queue hands payload ids to.
pub trait PayloadPersistence: Send + Sync + fmt::Debug {
    fn increment_reference_counter(&self, payload_id: u64);

    fn decrement_reference_counter(&self, payload_id: u64);
}

/// One unit of a payload's reference count, held by a queue entry.
///
/// Not `Clone`: releasing it consumes the handle, so a single entry cannot
/// decrement the same payload twice.
#[must_use = "a payload reference must be released exactly once"]
#[derive(Debug, PartialEq, Eq)]
pub struct PayloadRef {
    id: u64,
}

impl PayloadRef {
    /// Take over a reference the caller already counted in the store.
    pub(crate) fn adopt(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn release(self, store: &dyn PayloadPersistence) {
        trace!(payload_id = self.id, "releasing payload reference");
        store.decrement_reference_counter(self.id);
    }
}

#[derive(Debug)]
struct StoredPayload {
    bytes: Bytes,
    references: u64,
}

/// In-process payload store.
///
/// Payloads that drop to zero references stay readable until [`sweep`] so a
/// QoS 0 message polled out of a queue can still be written to the socket.
///
/// [`sweep`]: InMemoryPayloadStore::sweep
#[derive(Debug)]
pub struct InMemoryPayloadStore {
    payloads: DashMap<u64, StoredPayload>,
    next_id: AtomicU64,
    decrements: DashMap<u64, u64>,
}

impl Default for InMemoryPayloadStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPayloadStore {
    pub fn new() -> Self {
        Self {
            payloads: DashMap::new(),
            next_id: AtomicU64::new(1),
            decrements: DashMap::new(),
        }
    }

    /// Store a payload with one reference and return its id.
    pub fn add(&self, bytes: impl Into<Bytes>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.payloads.insert(
            id,
            StoredPayload {
                bytes: bytes.into(),
                references: 1,
            },
        );
        id
    }

    pub fn get(&self, payload_id: u64) -> Option<Bytes> {
        self.payloads.get(&payload_id).map(|p| p.bytes.clone())
    }

    pub fn reference_count(&self, payload_id: u64) -> u64 {
        self.payloads
            .get(&payload_id)
            .map(|p| p.references)
            .unwrap_or(0)
    }

    /// Number of decrement calls seen for one payload id.
    pub fn decrements_for(&self, payload_id: u64) -> u64 {
        self.decrements.get(&payload_id).map(|c| *c).unwrap_or(0)
    }

    /// Number of decrement calls seen overall.
    pub fn total_decrements(&self) -> u64 {
        self.decrements.iter().map(|c| *c.value()).sum()
    }

    /// Drop payloads nobody references any more. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let before = self.payloads.len();
        self.payloads.retain(|_, p| p.references > 0);
        before - self.payloads.len()
    }
}

impl PayloadPersistence for InMemoryPayloadStore {
    fn increment_reference_counter(&self, payload_id: u64) {
        match self.payloads.get_mut(&payload_id) {
            Some(mut payload) => payload.references += 1,
            None => warn!(payload_id, "increment for unknown payload"),
        }
    }

    fn decrement_reference_counter(&self, payload_id: u64) {
        *self.decrements.entry(payload_id).or_insert(0) += 1;
        match self.payloads.get_mut(&payload_id) {
            Some(mut payload) if payload.references > 0 => payload.references -= 1,
            Some(_) => warn!(payload_id, "decrement below zero references"),
            None => warn!(payload_id, "decrement for unknown payload"),
        }
    }
}
