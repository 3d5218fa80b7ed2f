//! What happens when a queue is at its depth limit.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::core::message::Qos;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardPolicy {
    /// Drop the incoming message, keep the queue as it is.
    #[default]
    Discard,
    /// Evict the oldest eligible entry to make room for the incoming one.
    DiscardOldest,
}

impl FromStr for DiscardPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discard" => Ok(DiscardPolicy::Discard),
            "discard_oldest" | "discard-oldest" => Ok(DiscardPolicy::DiscardOldest),
            other => Err(format!("unknown discard policy '{other}'")),
        }
    }
}

impl fmt::Display for DiscardPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscardPolicy::Discard => f.write_str("discard"),
            DiscardPolicy::DiscardOldest => f.write_str("discard_oldest"),
        }
    }
}

/// Queues are limited per class: QoS 0 entries never crowd out QoS 1/2 ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueClass {
    Qos0,
    Qos12,
}

impl QueueClass {
    pub fn of(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => QueueClass::Qos0,
            Qos::AtLeastOnce | Qos::ExactlyOnce => QueueClass::Qos12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitState {
    UnderLimit,
    AtLimit,
}

impl LimitState {
    pub fn of(current: usize, limit: usize) -> Self {
        if current >= limit {
            LimitState::AtLimit
        } else {
            LimitState::UnderLimit
        }
    }
}

/// Outcome of an `add` against one queue class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    DropIncoming,
    EvictOldest,
}

pub fn admit(state: LimitState, policy: DiscardPolicy) -> Admission {
    match (state, policy) {
        (LimitState::UnderLimit, _) => Admission::Accept,
        (LimitState::AtLimit, DiscardPolicy::Discard) => Admission::DropIncoming,
        (LimitState::AtLimit, DiscardPolicy::DiscardOldest) => Admission::EvictOldest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_follows_policy_only_at_limit() {
        assert_eq!(
            admit(LimitState::of(2, 3), DiscardPolicy::Discard),
            Admission::Accept
        );
        assert_eq!(
            admit(LimitState::of(3, 3), DiscardPolicy::Discard),
            Admission::DropIncoming
        );
        assert_eq!(
            admit(LimitState::of(4, 3), DiscardPolicy::DiscardOldest),
            Admission::EvictOldest
        );
    }

    #[test]
    fn policy_parses_from_config_strings() {
        assert_eq!("DISCARD_OLDEST".parse(), Ok(DiscardPolicy::DiscardOldest));
        assert_eq!("discard".parse(), Ok(DiscardPolicy::Discard));
        assert!("drop".parse::<DiscardPolicy>().is_err());
    }

    #[test]
    fn classes_split_qos0_from_the_rest() {
        assert_eq!(QueueClass::of(Qos::AtMostOnce), QueueClass::Qos0);
        assert_eq!(QueueClass::of(Qos::ExactlyOnce), QueueClass::Qos12);
    }
}
