//! Durable storage behind each bucket.
//!
//! A bucket persists its changes as opaque transaction batches in a
//! [`Journal`]. One `append` is one atomic transaction: on replay a batch is
//! either seen whole or not at all.

pub mod file;
pub mod layout;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;

pub use file::FileJournal;
pub use layout::BucketLayout;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal corruption: {0}")]
    Corruption(String),

    #[error("journal closed")]
    Closed,

    #[error("journal is read-only")]
    ReadOnly,

    #[error("bucket layout mismatch: {0}")]
    LayoutMismatch(String),
}

/// Flush policy for file journals.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Call fsync every N appends. If `None`, do not fsync based on count.
    pub fsync_every_n: Option<usize>,
    /// Call fsync if at least this long has passed since the last one.
    /// Checked on each append. If `None`, do not fsync based on time.
    pub fsync_interval: Option<Duration>,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            fsync_every_n: Some(64),
            fsync_interval: None,
        }
    }
}

/// Append-only transaction log for one bucket.
pub trait Journal: Send + fmt::Debug {
    /// Durably append one transaction batch.
    fn append(&mut self, batch: &[u8]) -> Result<(), StorageError>;

    /// Every batch currently in the log, oldest first.
    fn replay(&mut self) -> Result<Vec<Bytes>, StorageError>;

    /// Replace the whole log with a single snapshot batch.
    fn rewrite(&mut self, snapshot: &[u8]) -> Result<(), StorageError>;

    /// Batches in the log since it was opened or last rewritten.
    fn record_count(&self) -> u64;

    /// Flush buffered data to stable storage.
    fn sync(&mut self) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
struct MemoryLog {
    batches: Vec<Bytes>,
}

/// Journal kept in process memory.
///
/// Clones share the same log, so a test can drop an engine and rebuild a new
/// one from the same journals to exercise recovery.
#[derive(Debug, Clone, Default)]
pub struct MemoryJournal {
    log: Arc<Mutex<MemoryLog>>,
    fail_appends: Arc<AtomicBool>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent appends fail with an I/O error.
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }
}

impl Journal for MemoryJournal {
    fn append(&mut self, batch: &[u8]) -> Result<(), StorageError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other(
                "injected append failure",
            )));
        }
        self.log.lock().batches.push(Bytes::copy_from_slice(batch));
        Ok(())
    }

    fn replay(&mut self) -> Result<Vec<Bytes>, StorageError> {
        Ok(self.log.lock().batches.clone())
    }

    fn rewrite(&mut self, snapshot: &[u8]) -> Result<(), StorageError> {
        let mut log = self.log.lock();
        log.batches.clear();
        log.batches.push(Bytes::copy_from_slice(snapshot));
        Ok(())
    }

    fn record_count(&self) -> u64 {
        self.log.lock().batches.len() as u64
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_journal_clones_share_the_log() {
        let mut journal = MemoryJournal::new();
        let mut reopened = journal.clone();

        journal.append(b"one").unwrap();
        journal.append(b"two").unwrap();
        assert_eq!(reopened.replay().unwrap().len(), 2);

        reopened.rewrite(b"snapshot").unwrap();
        assert_eq!(journal.record_count(), 1);
        assert_eq!(journal.replay().unwrap()[0], Bytes::from_static(b"snapshot"));
    }

    #[test]
    fn injected_failures_leave_the_log_untouched() {
        let mut journal = MemoryJournal::new();
        journal.fail_appends(true);
        assert!(matches!(journal.append(b"lost"), Err(StorageError::Io(_))));
        assert_eq!(journal.record_count(), 0);
    }
}
