//! Per-queue packet identifier bookkeeping.
//!
//! Identifiers come from the caller (the session knows which ids its client
//! still has outstanding); the queue only makes sure no two in-flight entries
//! hold the same one. Releasing an id is implicit: the owning entry leaves.

use std::collections::{HashMap, HashSet};

use crate::core::message::NO_PACKET_ID;

#[derive(Debug, Default)]
pub struct PacketIdAllocator {
    /// packet id -> sequence number of the entry holding it
    in_flight: HashMap<u16, u64>,
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_flight(&self, packet_id: u16) -> bool {
        self.in_flight.contains_key(&packet_id)
    }

    /// Sequence number of the entry currently holding `packet_id`.
    pub fn holder(&self, packet_id: u16) -> Option<u64> {
        self.in_flight.get(&packet_id).copied()
    }

    /// Record that `sequence` now holds `packet_id`. Returns false on collision.
    pub fn occupy(&mut self, packet_id: u16, sequence: u64) -> bool {
        match self.in_flight.get(&packet_id) {
            Some(holder) if *holder != sequence => false,
            _ => {
                self.in_flight.insert(packet_id, sequence);
                true
            }
        }
    }

    pub fn vacate(&mut self, packet_id: u16, sequence: u64) {
        if self.in_flight.get(&packet_id) == Some(&sequence) {
            self.in_flight.remove(&packet_id);
        }
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Walk a caller-supplied pool in order, yielding ids that are free.
    pub fn candidates<'a>(&'a self, pool: &'a [u16]) -> Candidates<'a> {
        Candidates {
            allocator: self,
            pool: pool.iter(),
            handed_out: HashSet::new(),
        }
    }
}

pub struct Candidates<'a> {
    allocator: &'a PacketIdAllocator,
    pool: std::slice::Iter<'a, u16>,
    handed_out: HashSet<u16>,
}

impl Iterator for Candidates<'_> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        for &id in self.pool.by_ref() {
            if id == NO_PACKET_ID || self.allocator.is_in_flight(id) {
                continue;
            }
            if self.handed_out.insert(id) {
                return Some(id);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_skip_in_flight_and_repeated_ids() {
        let mut allocator = PacketIdAllocator::new();
        assert!(allocator.occupy(3, 100));

        let ids: Vec<u16> = allocator.candidates(&[2, 3, 0, 2, 5]).collect();
        assert_eq!(ids, vec![2, 5]);
    }

    #[test]
    fn occupy_rejects_a_second_holder() {
        let mut allocator = PacketIdAllocator::new();
        assert!(allocator.occupy(7, 1));
        assert!(allocator.occupy(7, 1));
        assert!(!allocator.occupy(7, 2));

        allocator.vacate(7, 2);
        assert_eq!(allocator.holder(7), Some(1));
        allocator.vacate(7, 1);
        assert!(allocator.is_empty());
    }
}
