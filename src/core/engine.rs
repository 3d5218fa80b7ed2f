//! The client queue engine.
//!
//! [`ClientQueuePersistence`] owns a fixed array of buckets, each behind its
//! own mutex, and runs every queue operation as one journaled transaction
//! against exactly one bucket. The sequence generator and the QoS 0 memory
//! governor are the only state shared across buckets; both are atomics.
//!
//! Calls block on journal I/O. Async callers go through
//! [`ClientQueueService`](crate::core::writer::ClientQueueService).

use std::collections::HashSet;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::bucket::{bucket_index, Bucket, CommitError};
use crate::core::dropped::MessageDroppedService;
use crate::core::entry::{Change, EntryKey, QueueKey, StoredEntry, StoredPublish, StoredPubrel};
use crate::core::error::{QueueError, QueueResult};
use crate::core::governor::Qos0MemoryGovernor;
use crate::core::message::{
    current_timestamp, InflightMessage, Publish, Pubrel, Qos, QueuedMessage, NO_PACKET_ID,
};
use crate::core::payload::{PayloadPersistence, PayloadRef};
use crate::core::policy::{admit, Admission, DiscardPolicy, LimitState, QueueClass};
use crate::core::sequence::SequenceGenerator;
use crate::storage::{BucketLayout, FileJournal, Journal, MemoryJournal, StorageError};

/// Running totals for drops the engine decided on its own.
#[derive(Debug, Default)]
struct EngineStats {
    expired: AtomicU64,
    discarded: AtomicU64,
    qos0_memory_dropped: AtomicU64,
    qos0_eviction_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub expired: u64,
    pub discarded: u64,
    pub qos0_memory_dropped: u64,
    pub qos0_eviction_failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSummary {
    pub index: usize,
    pub queues: usize,
    pub entries: usize,
    pub journal_records: u64,
}

#[derive(Debug)]
pub struct ClientQueuePersistence {
    config: Config,
    buckets: Vec<Mutex<Bucket>>,
    payloads: Arc<dyn PayloadPersistence>,
    dropped: Arc<dyn MessageDroppedService>,
    sequence: SequenceGenerator,
    governor: Arc<Qos0MemoryGovernor>,
    /// Serializes QoS 0 budget sweeps.
    eviction: Mutex<()>,
    stats: EngineStats,
    closed: AtomicBool,
}

impl ClientQueuePersistence {
    /// Open (or create) file journals under `config.data_dir` and recover them.
    ///
    /// Fails with [`StorageError::LayoutMismatch`] if the directory was created
    /// with a different bucket count.
    pub fn open(
        config: Config,
        payloads: Arc<dyn PayloadPersistence>,
        dropped: Arc<dyn MessageDroppedService>,
    ) -> QueueResult<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir).map_err(StorageError::from)?;
        BucketLayout::new(config.bucket_count).ensure(&config.data_dir)?;

        let journal_config = config.journal_config();
        let mut journals: Vec<Box<dyn Journal>> = Vec::with_capacity(config.bucket_count);
        for index in 0..config.bucket_count {
            let path = config.data_dir.join(format!("bucket-{index}.journal"));
            journals.push(Box::new(FileJournal::open_with_config(
                path,
                journal_config.clone(),
            )?));
        }

        Self::with_journals(config, journals, payloads, dropped)
    }

    /// Open the journals under `config.data_dir` without writing to them.
    ///
    /// The bucket count comes from the directory's recorded layout when there
    /// is one. Every mutating operation fails with [`StorageError::ReadOnly`].
    pub fn open_read_only(
        mut config: Config,
        payloads: Arc<dyn PayloadPersistence>,
        dropped: Arc<dyn MessageDroppedService>,
    ) -> QueueResult<Self> {
        if let Some(stored) = BucketLayout::load(&config.data_dir)? {
            BucketLayout::new(stored.bucket_count).check(&stored)?;
            config.bucket_count = stored.bucket_count;
        }

        let mut journals: Vec<Box<dyn Journal>> = Vec::with_capacity(config.bucket_count);
        for index in 0..config.bucket_count {
            let path = config.data_dir.join(format!("bucket-{index}.journal"));
            journals.push(Box::new(FileJournal::open_read_only(path)?));
        }

        Self::with_journals(config, journals, payloads, dropped)
    }

    /// Engine with fresh in-memory journals.
    pub fn in_memory(
        config: Config,
        payloads: Arc<dyn PayloadPersistence>,
        dropped: Arc<dyn MessageDroppedService>,
    ) -> QueueResult<Self> {
        let journals = (0..config.bucket_count)
            .map(|_| Box::new(MemoryJournal::new()) as Box<dyn Journal>)
            .collect();
        Self::with_journals(config, journals, payloads, dropped)
    }

    /// Build an engine over the given journals, one per bucket, replaying them.
    ///
    /// The number of journals becomes the bucket count.
    pub fn with_journals(
        mut config: Config,
        journals: Vec<Box<dyn Journal>>,
        payloads: Arc<dyn PayloadPersistence>,
        dropped: Arc<dyn MessageDroppedService>,
    ) -> QueueResult<Self> {
        config.bucket_count = journals.len();
        config.validate()?;

        let governor = Arc::new(Qos0MemoryGovernor::from_config(&config));
        let sequence = SequenceGenerator::new();

        let mut buckets = Vec::with_capacity(journals.len());
        let mut recovered = 0usize;
        for (index, journal) in journals.into_iter().enumerate() {
            let mut bucket = Bucket::new(index, journal, Arc::clone(&governor));
            if let Some(highest) = bucket.recover()? {
                sequence.resume_after(highest);
            }
            recovered += bucket.entry_count();
            buckets.push(Mutex::new(bucket));
        }

        info!(
            buckets = buckets.len(),
            recovered,
            next_sequence = sequence.peek(),
            qos0_bytes = governor.current(),
            "client queue persistence opened"
        );

        Ok(Self {
            config,
            buckets,
            payloads,
            dropped,
            sequence,
            governor,
            eviction: Mutex::new(()),
            stats: EngineStats::default(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket a queue id lives in.
    pub fn bucket_for(&self, queue_id: &str) -> usize {
        bucket_index(queue_id, self.buckets.len())
    }

    pub fn sequence(&self) -> &SequenceGenerator {
        &self.sequence
    }

    pub fn governor(&self) -> &Qos0MemoryGovernor {
        &self.governor
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            expired: self.stats.expired.load(Ordering::Relaxed),
            discarded: self.stats.discarded.load(Ordering::Relaxed),
            qos0_memory_dropped: self.stats.qos0_memory_dropped.load(Ordering::Relaxed),
            qos0_eviction_failures: self.stats.qos0_eviction_failures.load(Ordering::Relaxed),
        }
    }

    pub fn bucket_summary(&self, bucket: usize) -> QueueResult<BucketSummary> {
        let guard = self.bucket(bucket)?.lock();
        Ok(BucketSummary {
            index: bucket,
            queues: guard.queue_count(),
            entries: guard.entry_count(),
            journal_records: guard.journal_records(),
        })
    }

    // ───────────────────────────────────────────────────────────
    // Queue operations
    // ───────────────────────────────────────────────────────────

    /// Append a PUBLISH (or a PUBREL being rehydrated) to the queue.
    ///
    /// The caller has already counted one payload reference for this queue;
    /// from here on the engine owns it, on the error paths too.
    #[tracing::instrument(level = "trace", skip(self, message))]
    pub fn add(
        &self,
        queue_id: &str,
        shared: bool,
        message: QueuedMessage,
        queue_limit: usize,
        policy: DiscardPolicy,
        bucket: usize,
    ) -> QueueResult<()> {
        let key = QueueKey::new(queue_id, shared);
        let publish = match message {
            QueuedMessage::Publish(publish) => publish,
            QueuedMessage::Pubrel(pubrel) => {
                return self.add_pubrel(self.bucket(bucket)?, key, pubrel)
            }
        };

        // Adopted before any error can surface: every `Err` below has released it.
        let payload = PayloadRef::adopt(publish.payload_id);
        let lock = match self.bucket(bucket) {
            Ok(lock) => lock,
            Err(e) => {
                payload.release(self.payloads.as_ref());
                return Err(e);
            }
        };
        let class = QueueClass::of(publish.qos);
        let is_qos0 = publish.qos == Qos::AtMostOnce;

        {
            let mut guard = lock.lock();
            let mut changes = Vec::with_capacity(2);
            let mut evicted = None;

            let state = LimitState::of(guard.class_size(&key, class), queue_limit);
            match admit(state, policy) {
                Admission::Accept => {}
                Admission::DropIncoming => {
                    drop(guard);
                    self.drop_incoming(queue_id, &publish, payload);
                    return Ok(());
                }
                Admission::EvictOldest => match guard.oldest_evictable(&key, class) {
                    Some(oldest) => {
                        evicted = guard
                            .get(&oldest)
                            .and_then(StoredEntry::publish)
                            .map(|p| (p.topic.clone(), p.qos));
                        changes.push(Change::Delete(oldest));
                    }
                    None => {
                        drop(guard);
                        self.drop_incoming(queue_id, &publish, payload);
                        return Ok(());
                    }
                },
            }

            let entry_key = EntryKey::new(key, self.sequence.next());
            changes.push(Change::Insert(
                entry_key,
                StoredEntry::Publish(StoredPublish::adopt(publish, payload)),
            ));
            self.commit(&mut guard, changes)?;

            if let Some((topic, qos)) = evicted {
                self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                self.dropped.queue_full(queue_id, &topic, qos);
            }
        }

        if is_qos0 {
            self.enforce_qos0_budget();
        }
        Ok(())
    }

    fn add_pubrel(&self, lock: &Mutex<Bucket>, key: QueueKey, pubrel: Pubrel) -> QueueResult<()> {
        let mut guard = lock.lock();
        if let Some(holder) = guard.in_flight_key(&key, pubrel.packet_id) {
            error!(
                queue = %key,
                packet_id = pubrel.packet_id,
                holder = holder.sequence,
                "pubrel packet id already in flight, ignoring"
            );
            return Ok(());
        }
        let entry_key = EntryKey::new(key, self.sequence.next());
        self.commit(
            &mut guard,
            vec![Change::Insert(
                entry_key,
                StoredEntry::Pubrel(StoredPubrel {
                    packet_id: pubrel.packet_id,
                }),
            )],
        )
    }

    fn drop_incoming(&self, queue_id: &str, publish: &Publish, payload: PayloadRef) {
        self.stats.discarded.fetch_add(1, Ordering::Relaxed);
        self.dropped.queue_full(queue_id, &publish.topic, publish.qos);
        payload.release(self.payloads.as_ref());
    }

    /// Pull entries out of the new region for transmission.
    ///
    /// Entries come back in sequence order. QoS 0 entries leave the queue;
    /// QoS 1/2 entries take the next free id from `packet_ids` and move into
    /// flight. Shared queues hand out markers instead of packet ids.
    #[tracing::instrument(level = "trace", skip(self, packet_ids))]
    pub fn read_new(
        &self,
        queue_id: &str,
        shared: bool,
        packet_ids: &[u16],
        byte_limit: u64,
        bucket: usize,
    ) -> QueueResult<Vec<Publish>> {
        let key = QueueKey::new(queue_id, shared);
        let now = current_timestamp();
        let mut guard = self.bucket(bucket)?.lock();

        let mut messages = Vec::new();
        let mut changes = Vec::new();
        let mut expired = 0u64;
        let mut bytes = 0u64;

        {
            let Some(meta) = guard.meta(&key) else {
                return Ok(messages);
            };
            let mut free_ids = meta.packet_ids.candidates(packet_ids);

            for (entry_key, entry) in guard.queue_entries(&key) {
                if messages.len() >= packet_ids.len() {
                    break;
                }
                let StoredEntry::Publish(publish) = entry else {
                    continue;
                };
                if publish.packet_id.is_some() {
                    continue;
                }
                if publish.is_expired(now) {
                    changes.push(Change::Delete(entry_key.clone()));
                    expired += 1;
                    continue;
                }
                if !messages.is_empty() && bytes + publish.estimated_size > byte_limit {
                    break;
                }

                let packet_id = if publish.qos == Qos::AtMostOnce {
                    changes.push(Change::Delete(entry_key.clone()));
                    NO_PACKET_ID
                } else if shared {
                    changes.push(Change::SetMarker(entry_key.clone(), true));
                    NO_PACKET_ID
                } else {
                    match free_ids.next() {
                        Some(id) => {
                            changes.push(Change::AssignPacketId(entry_key.clone(), Some(id)));
                            id
                        }
                        None => break,
                    }
                };

                bytes += publish.estimated_size;
                messages.push(publish.to_publish(packet_id));
            }
        }

        self.commit(&mut guard, changes)?;
        if expired > 0 {
            self.stats.expired.fetch_add(expired, Ordering::Relaxed);
            debug!(queue = %key, expired, "dropped expired messages on read");
        }
        Ok(messages)
    }

    /// In-flight entries for retransmission: PUBRELs first, then publishes
    /// and markers, each in sequence order.
    pub fn read_inflight(
        &self,
        queue_id: &str,
        shared: bool,
        max_count: usize,
        byte_limit: u64,
        bucket: usize,
    ) -> QueueResult<Vec<InflightMessage>> {
        let key = QueueKey::new(queue_id, shared);
        let guard = self.bucket(bucket)?.lock();

        let pubrels = guard
            .queue_entries(&key)
            .filter(|(_, entry)| matches!(entry, StoredEntry::Pubrel(_)));
        let publishes = guard
            .queue_entries(&key)
            .filter(|(_, entry)| !matches!(entry, StoredEntry::Pubrel(_)) && !entry.is_new());

        let mut messages = Vec::new();
        let mut bytes = 0u64;
        for (_, entry) in pubrels.chain(publishes) {
            if messages.len() >= max_count {
                break;
            }
            let size = entry.estimated_size();
            if !messages.is_empty() && bytes + size > byte_limit {
                break;
            }
            if let Some(message) = entry.to_inflight() {
                bytes += size;
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Swap the in-flight PUBLISH holding `pubrel.packet_id` for a PUBREL.
    ///
    /// Returns the unique id of the replaced publish. Without a matching
    /// in-flight entry the PUBREL is appended as a new in-flight entry.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn replace(
        &self,
        queue_id: &str,
        pubrel: Pubrel,
        bucket: usize,
    ) -> QueueResult<Option<String>> {
        let key = QueueKey::new(queue_id, false);
        let mut guard = self.bucket(bucket)?.lock();
        let stored = StoredPubrel {
            packet_id: pubrel.packet_id,
        };

        let Some(entry_key) = guard.in_flight_key(&key, pubrel.packet_id) else {
            warn!(
                queue = queue_id,
                packet_id = pubrel.packet_id,
                "no in-flight publish for pubrel, storing pubrel"
            );
            let entry_key = EntryKey::new(key, self.sequence.next());
            self.commit(
                &mut guard,
                vec![Change::Insert(entry_key, StoredEntry::Pubrel(stored))],
            )?;
            return Ok(None);
        };

        let unique_id = match guard.get(&entry_key) {
            Some(StoredEntry::Publish(publish)) => publish.unique_id.clone(),
            Some(StoredEntry::Pubrel(_)) => {
                debug!(queue = queue_id, packet_id = pubrel.packet_id, "pubrel already stored");
                return Ok(None);
            }
            other => {
                error!(
                    queue = queue_id,
                    packet_id = pubrel.packet_id,
                    found = ?other.map(StoredEntry::class),
                    "packet id held by an unexpected entry"
                );
                return Ok(None);
            }
        };

        self.commit(&mut guard, vec![Change::ReplaceWithPubrel(entry_key, stored)])?;
        Ok(Some(unique_id))
    }

    /// Remove the in-flight entry holding `packet_id`.
    ///
    /// With `expected_unique_id` set, an entry carrying a different unique id
    /// is left alone and `None` is returned.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn remove(
        &self,
        queue_id: &str,
        packet_id: u16,
        expected_unique_id: Option<&str>,
        bucket: usize,
    ) -> QueueResult<Option<String>> {
        let key = QueueKey::new(queue_id, false);
        let mut guard = self.bucket(bucket)?.lock();

        let Some(entry_key) = guard.in_flight_key(&key, packet_id) else {
            return Ok(None);
        };
        let unique_id = guard
            .get(&entry_key)
            .and_then(StoredEntry::unique_id)
            .map(str::to_owned);

        if let Some(expected) = expected_unique_id {
            if unique_id.as_deref() != Some(expected) {
                debug!(
                    queue = queue_id,
                    packet_id,
                    expected,
                    found = ?unique_id,
                    "unique id mismatch, not removing"
                );
                return Ok(None);
            }
        }

        self.commit(&mut guard, vec![Change::Delete(entry_key)])?;
        Ok(unique_id)
    }

    /// Delete the shared-queue publish or marker with `unique_id`.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn remove_shared(&self, shared_id: &str, unique_id: &str, bucket: usize) -> QueueResult<bool> {
        let key = QueueKey::new(shared_id, true);
        let mut guard = self.bucket(bucket)?.lock();

        let found = guard
            .queue_entries(&key)
            .find(|(_, entry)| entry.unique_id() == Some(unique_id))
            .map(|(entry_key, _)| entry_key.clone());

        match found {
            Some(entry_key) => {
                self.commit(&mut guard, vec![Change::Delete(entry_key)])?;
                Ok(true)
            }
            None => {
                debug!(group = shared_id, unique_id, "shared message not found");
                Ok(false)
            }
        }
    }

    /// Hand a marker's message back to the shared queue as new.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn remove_in_flight_marker(
        &self,
        shared_id: &str,
        unique_id: &str,
        bucket: usize,
    ) -> QueueResult<bool> {
        let key = QueueKey::new(shared_id, true);
        let mut guard = self.bucket(bucket)?.lock();

        let found = guard
            .queue_entries(&key)
            .find(|(_, entry)| {
                matches!(entry, StoredEntry::SharedInFlightMarker(p) if p.unique_id == unique_id)
            })
            .map(|(entry_key, _)| entry_key.clone());

        match found {
            Some(entry_key) => {
                self.commit(&mut guard, vec![Change::SetMarker(entry_key, false)])?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn remove_all_qos0_messages(&self, queue_id: &str, shared: bool, bucket: usize) -> QueueResult<()> {
        let key = QueueKey::new(queue_id, shared);
        let mut guard = self.bucket(bucket)?.lock();

        let changes = guard
            .queue_entries(&key)
            .filter(|(_, entry)| entry.class() == QueueClass::Qos0)
            .map(|(entry_key, _)| Change::Delete(entry_key.clone()))
            .collect();
        self.commit(&mut guard, changes)
    }

    pub fn clear(&self, queue_id: &str, shared: bool, bucket: usize) -> QueueResult<()> {
        let key = QueueKey::new(queue_id, shared);
        let mut guard = self.bucket(bucket)?.lock();

        let changes: Vec<Change> = guard
            .queue_entries(&key)
            .map(|(entry_key, _)| Change::Delete(entry_key.clone()))
            .collect();
        let cleared = changes.len();
        self.commit(&mut guard, changes)?;
        debug!(queue = %key, cleared, "queue cleared");
        Ok(())
    }

    /// Periodic sweep of one bucket.
    ///
    /// Drops expired new-region entries, forgets empty queues, compacts the
    /// journal once it has grown past the threshold, and returns the ids of
    /// shared queues that still hold entries.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn clean_up(&self, bucket: usize) -> QueueResult<HashSet<String>> {
        let now = current_timestamp();
        let mut guard = self.bucket(bucket)?.lock();

        let mut changes = Vec::new();
        for queue in guard.queue_keys() {
            changes.extend(
                guard
                    .queue_entries(&queue)
                    .filter(|(_, entry)| {
                        matches!(entry, StoredEntry::Publish(p) if p.packet_id.is_none() && p.is_expired(now))
                    })
                    .map(|(entry_key, _)| Change::Delete(entry_key.clone())),
            );
        }
        let expired = changes.len() as u64;
        self.commit(&mut guard, changes)?;
        self.stats.expired.fetch_add(expired, Ordering::Relaxed);

        let forgotten = guard.forget_empty_queues();

        let shared_queues = guard
            .queue_keys()
            .into_iter()
            .filter(|queue| queue.shared)
            .map(|queue| queue.queue_id)
            .collect();

        let records = guard.journal_records();
        if records > self.config.compaction_threshold {
            guard.compact()?;
            debug!(bucket, records, "journal compacted");
        }

        debug!(bucket, expired, forgotten, "bucket cleaned up");
        Ok(shared_queues)
    }

    pub fn size(&self, queue_id: &str, shared: bool, bucket: usize) -> QueueResult<usize> {
        let key = QueueKey::new(queue_id, shared);
        Ok(self.bucket(bucket)?.lock().size(&key))
    }

    /// Flush every journal and refuse further operations.
    pub fn close(&self) -> QueueResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut failed = None;
        for lock in &self.buckets {
            let mut guard = lock.lock();
            let mut attempt = 0u32;
            loop {
                match guard.sync() {
                    Ok(()) => break,
                    Err(e) if attempt < self.config.close_retries => {
                        attempt += 1;
                        warn!(bucket = guard.index(), attempt, error = %e, "journal sync failed, retrying");
                        std::thread::sleep(self.config.close_retry_interval());
                    }
                    Err(e) => {
                        error!(bucket = guard.index(), error = %e, "giving up on journal sync");
                        failed = Some(e);
                        break;
                    }
                }
            }
        }

        match failed {
            Some(e) => Err(e.into()),
            None => {
                info!(buckets = self.buckets.len(), "client queue persistence closed");
                Ok(())
            }
        }
    }

    // ───────────────────────────────────────────────────────────
    // Internals
    // ───────────────────────────────────────────────────────────

    fn bucket(&self, bucket: usize) -> QueueResult<&Mutex<Bucket>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed.into());
        }
        self.buckets.get(bucket).ok_or(QueueError::InvalidBucket {
            bucket,
            bucket_count: self.buckets.len(),
        })
    }

    fn commit(&self, bucket: &mut Bucket, changes: Vec<Change>) -> QueueResult<()> {
        match bucket.commit(changes) {
            Ok(displaced) => {
                for entry in displaced {
                    self.release(entry);
                }
                Ok(())
            }
            Err(CommitError { source, rejected }) => {
                error!(bucket = bucket.index(), error = %source, "journal commit failed");
                for entry in rejected {
                    self.release(entry);
                }
                Err(source.into())
            }
        }
    }

    fn release(&self, entry: StoredEntry) {
        if let Some(payload) = entry.into_payload() {
            payload.release(self.payloads.as_ref());
        }
    }

    /// Evict the globally oldest QoS 0 entries until the budget holds again.
    ///
    /// Runs after the triggering add has committed, so it never fails that
    /// add: a journal error here is logged and counted and the sweep stops.
    /// Sweeps are serialized; buckets are locked one at a time.
    fn enforce_qos0_budget(&self) {
        let _sweep = self.eviction.lock();
        while self.governor.exceeded() {
            let mut oldest: Option<(usize, u64)> = None;
            for (index, lock) in self.buckets.iter().enumerate() {
                if let Some(sequence) = lock.lock().oldest_qos0_sequence() {
                    if oldest.map_or(true, |(_, best)| sequence < best) {
                        oldest = Some((index, sequence));
                    }
                }
            }
            let Some((index, sequence)) = oldest else {
                break;
            };

            let mut guard = self.buckets[index].lock();
            if !self.governor.exceeded() {
                break;
            }
            // Delivered or removed since the scan.
            if guard.oldest_qos0_sequence() != Some(sequence) {
                continue;
            }
            let Some(entry_key) = guard.oldest_qos0() else {
                continue;
            };
            let Some((topic, qos)) = guard
                .get(&entry_key)
                .and_then(StoredEntry::publish)
                .map(|p| (p.topic.clone(), p.qos))
            else {
                continue;
            };

            let current = self.governor.current();
            let limit = self.governor.limit();
            let queue = entry_key.queue.clone();
            if let Err(e) = self.commit(&mut guard, vec![Change::Delete(entry_key)]) {
                self.stats.qos0_eviction_failures.fetch_add(1, Ordering::Relaxed);
                error!(bucket = index, queue = %queue, error = %e, "qos0 eviction failed, budget stays exceeded");
                break;
            }
            drop(guard);

            self.stats.qos0_memory_dropped.fetch_add(1, Ordering::Relaxed);
            if queue.shared {
                self.dropped
                    .qos0_memory_exceeded_shared(&queue.queue_id, &topic, qos, current, limit);
            } else {
                self.dropped
                    .qos0_memory_exceeded(&queue.queue_id, &topic, qos, current, limit);
            }
        }
    }
}

impl Drop for ClientQueuePersistence {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.close() {
                error!(error = %e, "failed to close client queue persistence");
            }
        }
    }
}
