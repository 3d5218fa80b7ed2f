//! Buckets: fixed partitions of the queue keyspace.
//!
//! Every queue lives in exactly one bucket for its whole life. A bucket owns
//! its entries, the per-queue counters and its journal; the engine wraps each
//! bucket in its own mutex so unrelated buckets never contend.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::RangeInclusive;
use std::sync::Arc;

use tracing::error;

use crate::core::codec;
use crate::core::entry::{Change, EntryKey, QueueKey, StoredEntry, StoredPublish};
use crate::core::governor::Qos0MemoryGovernor;
use crate::core::packet_id::PacketIdAllocator;
use crate::core::policy::QueueClass;
use crate::storage::{Journal, StorageError};

/// Bucket for a queue id.
///
/// CRC-32 of the id bytes, so the mapping is the same across builds and
/// journals recovered by position still line up with their queues.
pub fn bucket_index(queue_id: &str, bucket_count: usize) -> usize {
    crc32fast::hash(queue_id.as_bytes()) as usize % bucket_count.max(1)
}

/// Per-queue counters kept next to the entries.
#[derive(Debug, Default)]
pub struct QueueMeta {
    pub qos0: usize,
    pub qos12: usize,
    pub packet_ids: PacketIdAllocator,
}

impl QueueMeta {
    pub fn size(&self) -> usize {
        self.qos0 + self.qos12
    }

    pub fn class_size(&self, class: QueueClass) -> usize {
        match class {
            QueueClass::Qos0 => self.qos0,
            QueueClass::Qos12 => self.qos12,
        }
    }
}

/// A journal write failed; nothing was applied.
#[derive(Debug)]
pub struct CommitError {
    pub source: StorageError,
    /// Entries the batch would have inserted, handed back so their payload
    /// references can be released.
    pub rejected: Vec<StoredEntry>,
}

#[derive(Debug)]
pub struct Bucket {
    index: usize,
    entries: BTreeMap<EntryKey, StoredEntry>,
    queues: HashMap<QueueKey, QueueMeta>,
    /// (sequence, queue) of every QoS 0 entry, oldest first.
    qos0_by_age: BTreeSet<(u64, QueueKey)>,
    governor: Arc<Qos0MemoryGovernor>,
    journal: Box<dyn Journal>,
}

impl Bucket {
    pub fn new(index: usize, journal: Box<dyn Journal>, governor: Arc<Qos0MemoryGovernor>) -> Self {
        Self {
            index,
            entries: BTreeMap::new(),
            queues: HashMap::new(),
            qos0_by_age: BTreeSet::new(),
            governor,
            journal,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Rebuild state from the journal. Returns the highest sequence seen.
    pub fn recover(&mut self) -> Result<Option<u64>, StorageError> {
        let mut highest = None;
        for batch in self.journal.replay()? {
            for change in codec::decode_batch(&batch)? {
                let sequence = change.key().sequence;
                highest = highest.max(Some(sequence));
                // References held by displaced entries were settled before the restart.
                let _ = self.apply(change);
            }
        }
        Ok(highest)
    }

    /// Journal the batch, then apply it. Returns entries that left the bucket.
    pub fn commit(&mut self, changes: Vec<Change>) -> Result<Vec<StoredEntry>, CommitError> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }

        let written = codec::encode_batch(&changes).and_then(|batch| self.journal.append(&batch));
        if let Err(source) = written {
            let rejected = changes
                .into_iter()
                .filter_map(|change| match change {
                    Change::Insert(_, entry) => Some(entry),
                    _ => None,
                })
                .collect();
            return Err(CommitError { source, rejected });
        }

        Ok(changes
            .into_iter()
            .filter_map(|change| self.apply(change))
            .collect())
    }

    fn apply(&mut self, change: Change) -> Option<StoredEntry> {
        match change {
            Change::Insert(key, entry) => self.attach(key, entry),
            Change::Delete(key) => self.detach(&key),
            Change::AssignPacketId(key, packet_id) => {
                let entry = self.detach(&key)?;
                let entry = match entry {
                    StoredEntry::Publish(mut publish) => {
                        publish.packet_id = packet_id;
                        StoredEntry::Publish(publish)
                    }
                    other => {
                        error!(bucket = self.index, queue = %key.queue, "packet id assigned to a non-publish entry");
                        other
                    }
                };
                self.attach(key, entry)
            }
            Change::SetMarker(key, marked) => {
                let entry = self.detach(&key)?;
                let entry = match (entry, marked) {
                    (StoredEntry::Publish(publish), true) => {
                        StoredEntry::SharedInFlightMarker(StoredPublish {
                            packet_id: None,
                            ..publish
                        })
                    }
                    (StoredEntry::SharedInFlightMarker(publish), false) => {
                        StoredEntry::Publish(publish)
                    }
                    (other, _) => other,
                };
                self.attach(key, entry)
            }
            Change::ReplaceWithPubrel(key, pubrel) => {
                let displaced = self.detach(&key);
                self.attach(key, StoredEntry::Pubrel(pubrel));
                displaced
            }
        }
    }

    fn attach(&mut self, key: EntryKey, entry: StoredEntry) -> Option<StoredEntry> {
        let previous = self.detach(&key);

        let meta = self.queues.entry(key.queue.clone()).or_default();
        match entry.class() {
            QueueClass::Qos0 => meta.qos0 += 1,
            QueueClass::Qos12 => meta.qos12 += 1,
        }
        if let Some(packet_id) = entry.packet_id() {
            if !meta.packet_ids.occupy(packet_id, key.sequence) {
                error!(
                    bucket = self.index,
                    queue = %key.queue,
                    packet_id,
                    "packet id already held by another in-flight entry"
                );
            }
        }
        if let Some(bytes) = entry.qos0_bytes() {
            self.qos0_by_age.insert((key.sequence, key.queue.clone()));
            self.governor.increment(bytes);
        }

        self.entries.insert(key, entry);
        previous
    }

    fn detach(&mut self, key: &EntryKey) -> Option<StoredEntry> {
        let entry = self.entries.remove(key)?;

        if let Some(meta) = self.queues.get_mut(&key.queue) {
            match entry.class() {
                QueueClass::Qos0 => meta.qos0 = meta.qos0.saturating_sub(1),
                QueueClass::Qos12 => meta.qos12 = meta.qos12.saturating_sub(1),
            }
            if let Some(packet_id) = entry.packet_id() {
                meta.packet_ids.vacate(packet_id, key.sequence);
            }
        }
        if let Some(bytes) = entry.qos0_bytes() {
            self.qos0_by_age.remove(&(key.sequence, key.queue.clone()));
            self.governor.decrement(bytes);
        }

        Some(entry)
    }

    // ───────────────────────────────────────────────────────────
    // Queries
    // ───────────────────────────────────────────────────────────

    pub fn meta(&self, queue: &QueueKey) -> Option<&QueueMeta> {
        self.queues.get(queue)
    }

    pub fn size(&self, queue: &QueueKey) -> usize {
        self.meta(queue).map(QueueMeta::size).unwrap_or(0)
    }

    pub fn class_size(&self, queue: &QueueKey, class: QueueClass) -> usize {
        self.meta(queue).map(|m| m.class_size(class)).unwrap_or(0)
    }

    pub fn get(&self, key: &EntryKey) -> Option<&StoredEntry> {
        self.entries.get(key)
    }

    /// Entries of one queue in sequence order.
    pub fn queue_entries<'a>(
        &'a self,
        queue: &QueueKey,
    ) -> impl Iterator<Item = (&'a EntryKey, &'a StoredEntry)> + 'a {
        self.entries.range(queue_range(queue))
    }

    /// Entry currently holding `packet_id` in this queue.
    pub fn in_flight_key(&self, queue: &QueueKey, packet_id: u16) -> Option<EntryKey> {
        self.meta(queue)
            .and_then(|meta| meta.packet_ids.holder(packet_id))
            .map(|sequence| EntryKey::new(queue.clone(), sequence))
    }

    /// Oldest entry a full queue may give up for the given class.
    pub fn oldest_evictable(&self, queue: &QueueKey, class: QueueClass) -> Option<EntryKey> {
        self.queue_entries(queue)
            .find(|(_, entry)| entry.is_new() && entry.class() == class)
            .map(|(key, _)| key.clone())
    }

    pub fn oldest_qos0_sequence(&self) -> Option<u64> {
        self.qos0_by_age.first().map(|(sequence, _)| *sequence)
    }

    pub fn oldest_qos0(&self) -> Option<EntryKey> {
        self.qos0_by_age
            .first()
            .map(|(sequence, queue)| EntryKey::new(queue.clone(), *sequence))
    }

    pub fn queue_keys(&self) -> Vec<QueueKey> {
        self.queues.keys().cloned().collect()
    }

    /// Drop counters of queues with no entries left.
    pub fn forget_empty_queues(&mut self) -> usize {
        let before = self.queues.len();
        self.queues.retain(|_, meta| meta.size() > 0);
        before - self.queues.len()
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    // ───────────────────────────────────────────────────────────
    // Journal maintenance
    // ───────────────────────────────────────────────────────────

    pub fn journal_records(&self) -> u64 {
        self.journal.record_count()
    }

    /// Rewrite the journal as one snapshot of the current entries.
    pub fn compact(&mut self) -> Result<(), StorageError> {
        let snapshot = codec::encode_snapshot(self.entries.iter())?;
        self.journal.rewrite(&snapshot)
    }

    pub fn sync(&mut self) -> Result<(), StorageError> {
        self.journal.sync()
    }
}

fn queue_range(queue: &QueueKey) -> RangeInclusive<EntryKey> {
    EntryKey::new(queue.clone(), 0)..=EntryKey::new(queue.clone(), u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entry::StoredPubrel;
    use crate::core::message::Qos;
    use crate::core::payload::PayloadRef;
    use crate::storage::MemoryJournal;

    fn publish(qos: Qos, size: u64) -> StoredEntry {
        StoredEntry::Publish(StoredPublish {
            packet_id: None,
            qos,
            topic: "t".to_string(),
            unique_id: "n_pub_1".to_string(),
            payload: PayloadRef::adopt(1),
            timestamp: 0,
            message_expiry_interval: None,
            retain: false,
            estimated_size: size,
        })
    }

    fn bucket(journal: MemoryJournal) -> (Bucket, Arc<Qos0MemoryGovernor>) {
        let governor = Arc::new(Qos0MemoryGovernor::new(u64::MAX));
        (Bucket::new(0, Box::new(journal), Arc::clone(&governor)), governor)
    }

    #[test]
    fn router_is_stable_and_in_range() {
        for id in ["client1", "client2", "group/topic", ""] {
            let first = bucket_index(id, 16);
            assert!(first < 16);
            assert_eq!(first, bucket_index(id, 16));
        }
    }

    #[test]
    fn router_uses_crc32_of_the_queue_id() {
        // Pinned so a rebuild never moves existing queues.
        assert_eq!(bucket_index("client1", 16), 8);
        assert_eq!(bucket_index("client2", 64), 50);
        assert_eq!(bucket_index("group/topic", 64), 61);
        assert_eq!(bucket_index("", 64), 0);
    }

    #[test]
    fn counters_follow_commits() {
        let (mut bucket, governor) = bucket(MemoryJournal::new());
        let queue = QueueKey::new("c", false);
        let a = EntryKey::new(queue.clone(), 1);
        let b = EntryKey::new(queue.clone(), 2);

        bucket
            .commit(vec![
                Change::Insert(a.clone(), publish(Qos::AtMostOnce, 10)),
                Change::Insert(b.clone(), publish(Qos::AtLeastOnce, 10)),
                Change::AssignPacketId(b.clone(), Some(4)),
            ])
            .unwrap();

        assert_eq!(bucket.size(&queue), 2);
        assert_eq!(bucket.class_size(&queue, QueueClass::Qos0), 1);
        assert_eq!(governor.current(), 10);
        assert_eq!(bucket.in_flight_key(&queue, 4), Some(b.clone()));
        assert_eq!(bucket.oldest_qos0(), Some(a.clone()));

        let displaced = bucket
            .commit(vec![
                Change::Delete(a),
                Change::ReplaceWithPubrel(b.clone(), StoredPubrel { packet_id: 4 }),
            ])
            .unwrap();
        assert_eq!(displaced.len(), 2);
        assert_eq!(governor.current(), 0);
        assert_eq!(bucket.size(&queue), 1);
        assert_eq!(bucket.in_flight_key(&queue, 4), Some(b));
        for entry in displaced {
            let _ = entry.into_payload();
        }
    }

    #[test]
    fn failed_commit_changes_nothing_and_returns_inserts() {
        let journal = MemoryJournal::new();
        let (mut bucket, _) = bucket(journal.clone());
        let queue = QueueKey::new("c", false);

        journal.fail_appends(true);
        let err = bucket
            .commit(vec![Change::Insert(EntryKey::new(queue.clone(), 1), publish(Qos::AtLeastOnce, 1))])
            .unwrap_err();

        assert_eq!(err.rejected.len(), 1);
        assert_eq!(bucket.size(&queue), 0);
        assert_eq!(bucket.entry_count(), 0);
    }

    #[test]
    fn recover_replays_journal_into_a_fresh_bucket() {
        let journal = MemoryJournal::new();
        let queue = QueueKey::new("c", false);
        {
            let (mut bucket, _) = bucket(journal.clone());
            bucket
                .commit(vec![
                    Change::Insert(EntryKey::new(queue.clone(), 5), publish(Qos::AtLeastOnce, 1)),
                    Change::Insert(EntryKey::new(queue.clone(), 6), publish(Qos::AtLeastOnce, 1)),
                ])
                .unwrap();
            bucket
                .commit(vec![Change::AssignPacketId(EntryKey::new(queue.clone(), 6), Some(9))])
                .unwrap();
        }

        let (mut restored, _) = bucket(journal);
        assert_eq!(restored.recover().unwrap(), Some(6));
        assert_eq!(restored.size(&queue), 2);
        assert_eq!(restored.in_flight_key(&queue, 9).map(|k| k.sequence), Some(6));
    }
}
