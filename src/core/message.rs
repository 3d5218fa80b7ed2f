//! Decoded MQTT messages as the queue sees them.
//!
//! Wire framing happens upstream; by the time a message reaches the queue it
//! is one of these plain structs. The queue never touches payload bytes, it
//! only carries the payload id handed out by the payload store.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Packet identifier placeholder for messages that have none (QoS 0, new entries).
pub const NO_PACKET_ID: u16 = 0;

/// Rough wire size used to budget PUBREL retransmissions.
pub const PUBREL_SIZE_ESTIMATE: u64 = 16;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Qos {
    /// At most once - fire and forget
    AtMostOnce = 0,
    /// At least once - acknowledged delivery
    AtLeastOnce = 1,
    /// Exactly once - two-phase handshake
    ExactlyOnce = 2,
}

impl Qos {
    pub fn number(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Qos {
    type Error = u8;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(other),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        qos as u8
    }
}

impl fmt::Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// A decoded PUBLISH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Transport identifier; `NO_PACKET_ID` until the queue assigns one.
    pub packet_id: u16,
    pub qos: Qos,
    pub topic: String,
    /// Cluster-wide id of this publish, e.g. `node1_pub_42`.
    pub unique_id: String,
    /// Key into the payload store.
    pub payload_id: u64,
    /// Creation time in milliseconds since the epoch.
    pub timestamp: u64,
    /// Message expiry interval in seconds, if any.
    pub message_expiry_interval: Option<u64>,
    pub retain: bool,
    pub duplicate_delivery: bool,
    /// Estimated in-memory size in bytes; drives byte limits and the QoS 0 budget.
    pub estimated_size: u64,
}

impl Publish {
    pub fn new(
        topic: impl Into<String>,
        qos: Qos,
        payload_id: u64,
        unique_id: impl Into<String>,
    ) -> Self {
        let topic = topic.into();
        let unique_id = unique_id.into();
        let estimated_size = (topic.len() + unique_id.len()) as u64 + 64;
        Self {
            packet_id: NO_PACKET_ID,
            qos,
            topic,
            unique_id,
            payload_id,
            timestamp: current_timestamp(),
            message_expiry_interval: None,
            retain: false,
            duplicate_delivery: false,
            estimated_size,
        }
    }

    pub fn with_packet_id(mut self, packet_id: u16) -> Self {
        self.packet_id = packet_id;
        self
    }

    pub fn with_expiry(mut self, interval_secs: u64, timestamp: u64) -> Self {
        self.message_expiry_interval = Some(interval_secs);
        self.timestamp = timestamp;
        self
    }

    pub fn with_estimated_size(mut self, bytes: u64) -> Self {
        self.estimated_size = bytes;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        is_expired(self.timestamp, self.message_expiry_interval, now_ms)
    }
}

/// Second half of the QoS 2 handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pubrel {
    pub packet_id: u16,
}

impl Pubrel {
    pub fn new(packet_id: u16) -> Self {
        Self { packet_id }
    }
}

/// What `add` accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedMessage {
    Publish(Publish),
    Pubrel(Pubrel),
}

impl From<Publish> for QueuedMessage {
    fn from(publish: Publish) -> Self {
        QueuedMessage::Publish(publish)
    }
}

impl From<Pubrel> for QueuedMessage {
    fn from(pubrel: Pubrel) -> Self {
        QueuedMessage::Pubrel(pubrel)
    }
}

/// What `read_inflight` hands back for retransmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InflightMessage {
    Publish(Publish),
    Pubrel(Pubrel),
    /// A shared-subscription entry taken by a consumer but not yet acknowledged.
    Marker(Publish),
}

impl InflightMessage {
    pub fn packet_id(&self) -> u16 {
        match self {
            InflightMessage::Publish(publish) | InflightMessage::Marker(publish) => {
                publish.packet_id
            }
            InflightMessage::Pubrel(pubrel) => pubrel.packet_id,
        }
    }

    pub fn is_pubrel(&self) -> bool {
        matches!(self, InflightMessage::Pubrel(_))
    }
}

#[inline]
pub(crate) fn is_expired(timestamp: u64, interval_secs: Option<u64>, now_ms: u64) -> bool {
    match interval_secs {
        Some(secs) => timestamp.saturating_add(secs.saturating_mul(1000)) <= now_ms,
        None => false,
    }
}

pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_decodes_known_levels_only() {
        assert_eq!(Qos::try_from(2), Ok(Qos::ExactlyOnce));
        assert_eq!(Qos::try_from(3), Err(3));
        assert_eq!(u8::from(Qos::AtLeastOnce), 1);
    }

    #[test]
    fn expiry_is_inclusive_of_the_deadline() {
        let now = current_timestamp();
        let expired = Publish::new("t", Qos::AtLeastOnce, 1, "n_pub_1").with_expiry(10, now - 10_000);
        let alive = Publish::new("t", Qos::AtLeastOnce, 1, "n_pub_2").with_expiry(100, now - 10_000);
        let forever = Publish::new("t", Qos::AtLeastOnce, 1, "n_pub_3");

        assert!(expired.is_expired(now));
        assert!(!alive.is_expired(now));
        assert!(!forever.is_expired(now));
    }
}
