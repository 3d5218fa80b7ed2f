//! Stored queue entries and the changes applied to them.

use std::fmt;

use crate::core::message::{InflightMessage, Publish, Pubrel, Qos, NO_PACKET_ID, PUBREL_SIZE_ESTIMATE};
use crate::core::payload::PayloadRef;
use crate::core::policy::QueueClass;

/// Identity of one queue. A client queue and a shared group may share an id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueKey {
    pub queue_id: String,
    pub shared: bool,
}

impl QueueKey {
    pub fn new(queue_id: impl Into<String>, shared: bool) -> Self {
        Self {
            queue_id: queue_id.into(),
            shared,
        }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.shared {
            write!(f, "shared:{}", self.queue_id)
        } else {
            f.write_str(&self.queue_id)
        }
    }
}

/// Storage key: entries of one queue are contiguous and ordered by sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryKey {
    pub queue: QueueKey,
    pub sequence: u64,
}

impl EntryKey {
    pub fn new(queue: QueueKey, sequence: u64) -> Self {
        Self { queue, sequence }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StoredPublish {
    /// `None` while the entry sits in the new region.
    pub packet_id: Option<u16>,
    pub qos: Qos,
    pub topic: String,
    pub unique_id: String,
    pub payload: PayloadRef,
    pub timestamp: u64,
    pub message_expiry_interval: Option<u64>,
    pub retain: bool,
    pub estimated_size: u64,
}

impl StoredPublish {
    /// Take ownership of an incoming publish and its payload reference.
    pub fn adopt(publish: Publish, payload: PayloadRef) -> Self {
        Self {
            packet_id: None,
            qos: publish.qos,
            topic: publish.topic,
            unique_id: publish.unique_id,
            payload,
            timestamp: publish.timestamp,
            message_expiry_interval: publish.message_expiry_interval,
            retain: publish.retain,
            estimated_size: publish.estimated_size,
        }
    }

    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        crate::core::message::is_expired(self.timestamp, self.message_expiry_interval, now_ms)
    }

    /// Copy out for the caller, stamped with the given packet id.
    pub fn to_publish(&self, packet_id: u16) -> Publish {
        Publish {
            packet_id,
            qos: self.qos,
            topic: self.topic.clone(),
            unique_id: self.unique_id.clone(),
            payload_id: self.payload.id(),
            timestamp: self.timestamp,
            message_expiry_interval: self.message_expiry_interval,
            retain: self.retain,
            duplicate_delivery: false,
            estimated_size: self.estimated_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredPubrel {
    pub packet_id: u16,
}

/// One slot in a queue's ordered sequence.
#[derive(Debug, PartialEq, Eq)]
pub enum StoredEntry {
    Publish(StoredPublish),
    Pubrel(StoredPubrel),
    /// A shared-group publish a consumer has taken but not yet settled.
    SharedInFlightMarker(StoredPublish),
}

impl StoredEntry {
    pub fn class(&self) -> QueueClass {
        match self {
            StoredEntry::Publish(p) | StoredEntry::SharedInFlightMarker(p) => QueueClass::of(p.qos),
            StoredEntry::Pubrel(_) => QueueClass::Qos12,
        }
    }

    /// Packet id this entry occupies, if it is in flight with a real id.
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            StoredEntry::Publish(p) => p.packet_id,
            StoredEntry::Pubrel(p) => Some(p.packet_id),
            StoredEntry::SharedInFlightMarker(_) => None,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, StoredEntry::Publish(p) if p.packet_id.is_none())
    }

    pub fn publish(&self) -> Option<&StoredPublish> {
        match self {
            StoredEntry::Publish(p) | StoredEntry::SharedInFlightMarker(p) => Some(p),
            StoredEntry::Pubrel(_) => None,
        }
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.publish().map(|p| p.unique_id.as_str())
    }

    pub fn estimated_size(&self) -> u64 {
        match self {
            StoredEntry::Publish(p) | StoredEntry::SharedInFlightMarker(p) => p.estimated_size,
            StoredEntry::Pubrel(_) => PUBREL_SIZE_ESTIMATE,
        }
    }

    /// QoS 0 bytes this entry charges against the global budget.
    pub fn qos0_bytes(&self) -> Option<u64> {
        match self {
            StoredEntry::Publish(p) if p.qos == Qos::AtMostOnce => Some(p.estimated_size),
            _ => None,
        }
    }

    /// Snapshot for retransmission; `None` for entries still in the new region.
    pub fn to_inflight(&self) -> Option<InflightMessage> {
        match self {
            StoredEntry::Publish(p) => p.packet_id.map(|id| {
                let mut publish = p.to_publish(id);
                publish.duplicate_delivery = true;
                InflightMessage::Publish(publish)
            }),
            StoredEntry::Pubrel(p) => Some(InflightMessage::Pubrel(Pubrel::new(p.packet_id))),
            StoredEntry::SharedInFlightMarker(p) => {
                Some(InflightMessage::Marker(p.to_publish(NO_PACKET_ID)))
            }
        }
    }

    /// Give the payload reference back, if this entry holds one.
    pub fn into_payload(self) -> Option<PayloadRef> {
        match self {
            StoredEntry::Publish(p) | StoredEntry::SharedInFlightMarker(p) => Some(p.payload),
            StoredEntry::Pubrel(_) => None,
        }
    }
}

/// A single mutation of a bucket. Committed changes are journaled first and
/// then applied; replay feeds the same changes back in.
#[derive(Debug, PartialEq, Eq)]
pub enum Change {
    Insert(EntryKey, StoredEntry),
    Delete(EntryKey),
    /// Move a publish into (`Some`) or back out of (`None`) flight.
    AssignPacketId(EntryKey, Option<u16>),
    /// Turn a shared publish into a marker (`true`) or back (`false`).
    SetMarker(EntryKey, bool),
    /// Substitute a PUBREL for the publish at the same position.
    ReplaceWithPubrel(EntryKey, StoredPubrel),
}

impl Change {
    pub fn key(&self) -> &EntryKey {
        match self {
            Change::Insert(key, _)
            | Change::Delete(key)
            | Change::AssignPacketId(key, _)
            | Change::SetMarker(key, _)
            | Change::ReplaceWithPubrel(key, _) => key,
        }
    }
}
