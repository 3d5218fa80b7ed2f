//! File-backed journal: a CRC-framed append-only log, one file per bucket.
//!
//! Layout: a 32-byte header (magic + version), then records of
//! `[id: u64][len: u32][crc32: u32][batch]`, all little endian. A torn record
//! at the tail is cut off on open; a CRC mismatch anywhere is corruption.
//! A failed append truncates back to where it started, so later records never
//! land behind a partial one.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::Bytes;
use crc32fast::Hasher as Crc32Hasher;
use tracing::{debug, error, warn};

use super::{Journal, JournalConfig, StorageError};

const HEADER_MAGIC: &[u8; 8] = b"BLIPCQJ\0";
const HEADER_VERSION: u32 = 1;
const HEADER_LEN: u64 = 32;
const RECORD_HEADER_LEN: usize = 8 + 4 + 4;

#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: File,
    config: JournalConfig,
    /// Id of the next record to write.
    next_id: u64,
    /// Records in the file since open or the last rewrite.
    records: u64,
    /// Batches read on open, handed out once by `replay`.
    recovered: Option<Vec<Bytes>>,
    unflushed_records: usize,
    last_fsync: Instant,
    read_only: bool,
    /// Bytes the next append writes before failing.
    #[cfg(test)]
    torn_write: Option<usize>,
}

impl FileJournal {
    /// Open or create a journal at the given path with the default flush policy.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::open_with_config(path, JournalConfig::default())
    }

    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        config: JournalConfig,
    ) -> Result<Self, StorageError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path_ref)?;

        let len = file.metadata()?.len();
        if len == 0 {
            write_header(&mut file)?;
        } else if len < HEADER_LEN {
            return Err(StorageError::Corruption(
                "file too small to contain header".to_string(),
            ));
        } else {
            validate_header(&mut file)?;
        }

        let (batches, next_id, valid_end) = read_records(&mut file)?;
        let file_len = file.metadata()?.len();
        if valid_end < file_len {
            warn!(
                path = %path_ref.display(),
                dropped_bytes = file_len - valid_end,
                "truncating torn journal tail"
            );
            file.set_len(valid_end)?;
        }
        file.seek(SeekFrom::Start(valid_end))?;

        debug!(path = %path_ref.display(), records = batches.len(), "journal opened");

        Ok(Self {
            path: path_ref.to_path_buf(),
            file,
            config,
            next_id,
            records: batches.len() as u64,
            recovered: Some(batches),
            unflushed_records: 0,
            last_fsync: Instant::now(),
            read_only: false,
            #[cfg(test)]
            torn_write: None,
        })
    }

    /// Open an existing journal for reading only.
    ///
    /// Nothing is created, repaired or truncated; a torn tail is skipped.
    /// Appends and rewrites fail with [`StorageError::ReadOnly`].
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path_ref = path.as_ref();
        let mut file = OpenOptions::new().read(true).open(path_ref)?;

        let len = file.metadata()?.len();
        let (batches, next_id) = if len == 0 {
            (Vec::new(), 1)
        } else if len < HEADER_LEN {
            return Err(StorageError::Corruption(
                "file too small to contain header".to_string(),
            ));
        } else {
            validate_header(&mut file)?;
            let (batches, next_id, _) = read_records(&mut file)?;
            (batches, next_id)
        };

        debug!(path = %path_ref.display(), records = batches.len(), "journal opened read-only");

        Ok(Self {
            path: path_ref.to_path_buf(),
            file,
            config: JournalConfig::default(),
            next_id,
            records: batches.len() as u64,
            recovered: Some(batches),
            unflushed_records: 0,
            last_fsync: Instant::now(),
            read_only: true,
            #[cfg(test)]
            torn_write: None,
        })
    }

    /// Access the underlying journal path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode_record(id: u64, batch: &[u8]) -> Result<Vec<u8>, StorageError> {
        let len = u32::try_from(batch.len())
            .map_err(|_| StorageError::Corruption("batch too large".to_string()))?;

        let mut hasher = Crc32Hasher::new();
        hasher.update(batch);
        let crc = hasher.finalize();

        let mut buffer = Vec::with_capacity(RECORD_HEADER_LEN + batch.len());
        buffer.extend_from_slice(&id.to_le_bytes());
        buffer.extend_from_slice(&len.to_le_bytes());
        buffer.extend_from_slice(&crc.to_le_bytes());
        buffer.extend_from_slice(batch);
        Ok(buffer)
    }

    #[cfg(test)]
    fn take_torn_write(&mut self) -> Option<usize> {
        self.torn_write.take()
    }

    #[cfg(not(test))]
    fn take_torn_write(&mut self) -> Option<usize> {
        None
    }

    fn write_record(&mut self, record: &[u8]) -> io::Result<()> {
        if let Some(limit) = self.take_torn_write() {
            self.file.write_all(&record[..limit.min(record.len())])?;
            return Err(io::Error::other("injected torn write"));
        }
        self.file.write_all(record)
    }

    /// Cut the file back to `offset` after a failed append.
    fn roll_back(&mut self, offset: u64) {
        let restored = self
            .file
            .set_len(offset)
            .and_then(|()| self.file.seek(SeekFrom::Start(offset)));
        if let Err(e) = restored {
            error!(path = %self.path.display(), offset, error = %e, "could not roll back failed append");
        }
    }

    fn maybe_sync(&mut self) -> Result<(), StorageError> {
        let mut should_sync = false;

        if let Some(every_n) = self.config.fsync_every_n {
            if self.unflushed_records >= every_n {
                should_sync = true;
            }
        }

        if !should_sync {
            if let Some(interval) = self.config.fsync_interval {
                if self.last_fsync.elapsed() >= interval {
                    should_sync = true;
                }
            }
        }

        if should_sync {
            let span = tracing::trace_span!("journal_fsync");
            let _guard = span.enter();
            self.sync()?;
        }

        Ok(())
    }
}

impl Journal for FileJournal {
    fn append(&mut self, batch: &[u8]) -> Result<(), StorageError> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        let id = self.next_id;
        let record = Self::encode_record(id, batch)?;
        let offset = self.file.stream_position()?;
        if let Err(e) = self.write_record(&record) {
            self.roll_back(offset);
            return Err(e.into());
        }
        self.next_id = id.wrapping_add(1);
        self.records += 1;
        self.unflushed_records = self.unflushed_records.saturating_add(1);
        self.maybe_sync()
    }

    fn replay(&mut self) -> Result<Vec<Bytes>, StorageError> {
        if let Some(batches) = self.recovered.take() {
            return Ok(batches);
        }
        // Already consumed once; read the file again.
        let (batches, _, _) = read_records(&mut self.file)?;
        self.file.seek(SeekFrom::End(0))?;
        Ok(batches)
    }

    fn rewrite(&mut self, snapshot: &[u8]) -> Result<(), StorageError> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        let record = Self::encode_record(1, snapshot)?;
        let tmp_path = self.path.with_extension("compact");
        {
            let mut tmp = OpenOptions::new()
                .create(true)
                .truncate(true)
                .read(true)
                .write(true)
                .open(&tmp_path)?;
            write_header(&mut tmp)?;
            tmp.write_all(&record)?;
            tmp.flush()?;
            tmp.sync_data()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.seek(SeekFrom::End(0))?;
        self.file = file;
        self.next_id = 2;
        self.records = 1;
        self.recovered = None;
        self.unflushed_records = 0;
        self.last_fsync = Instant::now();
        Ok(())
    }

    fn record_count(&self) -> u64 {
        self.records
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        if self.read_only {
            return Ok(());
        }
        self.file.flush()?;
        self.file.sync_data()?;
        self.unflushed_records = 0;
        self.last_fsync = Instant::now();
        Ok(())
    }
}

fn write_header(file: &mut File) -> Result<(), StorageError> {
    let mut buf = [0u8; HEADER_LEN as usize];
    buf[..8].copy_from_slice(HEADER_MAGIC);
    buf[8..12].copy_from_slice(&HEADER_VERSION.to_le_bytes());
    // Remaining bytes are reserved / zero.
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&buf)?;
    file.flush()?;
    file.sync_data()?;
    Ok(())
}

fn validate_header(file: &mut File) -> Result<(), StorageError> {
    let mut buf = [0u8; HEADER_LEN as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf).map_err(|_| {
        StorageError::Corruption("unexpected EOF while reading journal header".to_string())
    })?;

    if &buf[..8] != HEADER_MAGIC {
        return Err(StorageError::Corruption("invalid journal magic".to_string()));
    }

    let mut version_bytes = [0u8; 4];
    version_bytes.copy_from_slice(&buf[8..12]);
    let version = u32::from_le_bytes(version_bytes);
    if version != HEADER_VERSION {
        return Err(StorageError::Corruption(format!(
            "unsupported journal version: {version}"
        )));
    }

    Ok(())
}

/// Read every complete record. Returns the batches, the next record id and
/// the offset just past the last complete record.
fn read_records(file: &mut File) -> Result<(Vec<Bytes>, u64, u64), StorageError> {
    file.seek(SeekFrom::Start(HEADER_LEN))?;
    let mut offset = HEADER_LEN;
    let mut next_id = 1u64;
    let mut batches = Vec::new();

    loop {
        match read_next_record(file, offset)? {
            Some((id, batch, total_len)) => {
                next_id = id.wrapping_add(1);
                batches.push(batch);
                offset = offset
                    .checked_add(total_len)
                    .ok_or_else(|| StorageError::Corruption("journal offset overflow".to_string()))?;
            }
            None => break,
        }
    }

    Ok((batches, next_id, offset))
}

fn read_next_record(
    file: &mut File,
    current_offset: u64,
) -> Result<Option<(u64, Bytes, u64)>, StorageError> {
    let mut header = [0u8; RECORD_HEADER_LEN];
    if !read_fully(file, &mut header)? {
        // Clean EOF or partial header at the tail.
        return Ok(None);
    }

    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&header[..8]);
    let id = u64::from_le_bytes(id_bytes);

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[8..12]);
    let len = u32::from_le_bytes(len_bytes) as usize;

    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&header[12..16]);
    let expected_crc = u32::from_le_bytes(crc_bytes);

    let mut batch = vec![0u8; len];
    if !read_fully(file, &mut batch)? {
        // Partial batch at end of file: the transaction never committed.
        return Ok(None);
    }

    let mut hasher = Crc32Hasher::new();
    hasher.update(&batch);
    let actual_crc = hasher.finalize();

    if actual_crc != expected_crc {
        error!(
            offset = current_offset,
            "journal CRC mismatch: expected {expected_crc:08x}, got {actual_crc:08x}"
        );
        return Err(StorageError::Corruption(format!(
            "CRC mismatch at offset {current_offset}: expected {expected_crc:08x}, got {actual_crc:08x}"
        )));
    }

    let total_len = RECORD_HEADER_LEN as u64 + len as u64;
    Ok(Some((id, Bytes::from(batch), total_len)))
}

/// Fill `buf` completely. Returns false if EOF arrives first.
fn read_fully(file: &mut File, buf: &mut [u8]) -> Result<bool, StorageError> {
    let mut read = 0usize;
    while read < buf.len() {
        let n = file.read(&mut buf[read..])?;
        if n == 0 {
            return Ok(false);
        }
        read += n;
    }
    Ok(true)
}
