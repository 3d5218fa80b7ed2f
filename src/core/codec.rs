//! Binary encoding of change batches written to a bucket journal.
//!
//! A batch is `[count: u32]` followed by `count` changes. Strings carry a
//! u16 length prefix, integers are big endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::entry::{Change, EntryKey, QueueKey, StoredEntry, StoredPublish, StoredPubrel};
use crate::core::message::Qos;
use crate::core::payload::PayloadRef;
use crate::storage::StorageError;

const CHANGE_INSERT: u8 = 1;
const CHANGE_DELETE: u8 = 2;
const CHANGE_ASSIGN: u8 = 3;
const CHANGE_MARKER: u8 = 4;
const CHANGE_PUBREL: u8 = 5;

const ENTRY_PUBLISH: u8 = 1;
const ENTRY_PUBREL: u8 = 2;
const ENTRY_MARKER: u8 = 3;

pub fn encode_batch<'a, I>(changes: I) -> Result<Bytes, StorageError>
where
    I: IntoIterator<Item = &'a Change>,
{
    let mut buf = BytesMut::new();
    buf.put_u32(0);
    let mut count: u32 = 0;
    for change in changes {
        encode_change(change, &mut buf)?;
        count += 1;
    }
    buf[..4].copy_from_slice(&count.to_be_bytes());
    Ok(buf.freeze())
}

/// Encode a full bucket image as a batch of inserts.
pub fn encode_snapshot<'a, I>(entries: I) -> Result<Bytes, StorageError>
where
    I: IntoIterator<Item = (&'a EntryKey, &'a StoredEntry)>,
{
    let mut buf = BytesMut::new();
    buf.put_u32(0);
    let mut count: u32 = 0;
    for (key, entry) in entries {
        buf.put_u8(CHANGE_INSERT);
        put_key(key, &mut buf)?;
        put_entry(entry, &mut buf)?;
        count += 1;
    }
    buf[..4].copy_from_slice(&count.to_be_bytes());
    Ok(buf.freeze())
}

pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Change>, StorageError> {
    let mut slice = bytes;
    ensure(&slice, 4, "batch header")?;
    let count = slice.get_u32() as usize;
    let mut changes = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        changes.push(decode_change(&mut slice)?);
    }
    if slice.has_remaining() {
        return Err(StorageError::Corruption(format!(
            "{} trailing bytes after batch",
            slice.remaining()
        )));
    }
    Ok(changes)
}

fn encode_change(change: &Change, buf: &mut BytesMut) -> Result<(), StorageError> {
    match change {
        Change::Insert(key, entry) => {
            buf.put_u8(CHANGE_INSERT);
            put_key(key, buf)?;
            put_entry(entry, buf)?;
        }
        Change::Delete(key) => {
            buf.put_u8(CHANGE_DELETE);
            put_key(key, buf)?;
        }
        Change::AssignPacketId(key, packet_id) => {
            buf.put_u8(CHANGE_ASSIGN);
            put_key(key, buf)?;
            buf.put_u16(packet_id.unwrap_or(0));
        }
        Change::SetMarker(key, marked) => {
            buf.put_u8(CHANGE_MARKER);
            put_key(key, buf)?;
            buf.put_u8(u8::from(*marked));
        }
        Change::ReplaceWithPubrel(key, pubrel) => {
            buf.put_u8(CHANGE_PUBREL);
            put_key(key, buf)?;
            buf.put_u16(pubrel.packet_id);
        }
    }
    Ok(())
}

fn decode_change(slice: &mut &[u8]) -> Result<Change, StorageError> {
    ensure(slice, 1, "change tag")?;
    let tag = slice.get_u8();
    let key = get_key(slice)?;
    let change = match tag {
        CHANGE_INSERT => Change::Insert(key, get_entry(slice)?),
        CHANGE_DELETE => Change::Delete(key),
        CHANGE_ASSIGN => {
            ensure(slice, 2, "packet id")?;
            let packet_id = slice.get_u16();
            Change::AssignPacketId(key, (packet_id != 0).then_some(packet_id))
        }
        CHANGE_MARKER => {
            ensure(slice, 1, "marker flag")?;
            Change::SetMarker(key, slice.get_u8() != 0)
        }
        CHANGE_PUBREL => {
            ensure(slice, 2, "packet id")?;
            Change::ReplaceWithPubrel(key, StoredPubrel { packet_id: slice.get_u16() })
        }
        other => {
            return Err(StorageError::Corruption(format!(
                "invalid change tag {other}"
            )))
        }
    };
    Ok(change)
}

fn put_key(key: &EntryKey, buf: &mut BytesMut) -> Result<(), StorageError> {
    buf.put_u8(u8::from(key.queue.shared));
    put_str(&key.queue.queue_id, buf, "queue id")?;
    buf.put_u64(key.sequence);
    Ok(())
}

fn get_key(slice: &mut &[u8]) -> Result<EntryKey, StorageError> {
    ensure(slice, 1, "shared flag")?;
    let shared = slice.get_u8() != 0;
    let queue_id = get_str(slice, "queue id")?;
    ensure(slice, 8, "sequence number")?;
    let sequence = slice.get_u64();
    Ok(EntryKey::new(QueueKey::new(queue_id, shared), sequence))
}

fn put_entry(entry: &StoredEntry, buf: &mut BytesMut) -> Result<(), StorageError> {
    match entry {
        StoredEntry::Publish(publish) => {
            buf.put_u8(ENTRY_PUBLISH);
            put_publish(publish, buf)
        }
        StoredEntry::SharedInFlightMarker(publish) => {
            buf.put_u8(ENTRY_MARKER);
            put_publish(publish, buf)
        }
        StoredEntry::Pubrel(pubrel) => {
            buf.put_u8(ENTRY_PUBREL);
            buf.put_u16(pubrel.packet_id);
            Ok(())
        }
    }
}

fn get_entry(slice: &mut &[u8]) -> Result<StoredEntry, StorageError> {
    ensure(slice, 1, "entry tag")?;
    match slice.get_u8() {
        ENTRY_PUBLISH => Ok(StoredEntry::Publish(get_publish(slice)?)),
        ENTRY_MARKER => Ok(StoredEntry::SharedInFlightMarker(get_publish(slice)?)),
        ENTRY_PUBREL => {
            ensure(slice, 2, "packet id")?;
            Ok(StoredEntry::Pubrel(StoredPubrel {
                packet_id: slice.get_u16(),
            }))
        }
        other => Err(StorageError::Corruption(format!(
            "invalid entry tag {other}"
        ))),
    }
}

fn put_publish(publish: &StoredPublish, buf: &mut BytesMut) -> Result<(), StorageError> {
    buf.put_u16(publish.packet_id.unwrap_or(0));
    buf.put_u8(publish.qos.number());
    buf.put_u8(u8::from(publish.retain));
    put_str(&publish.topic, buf, "topic")?;
    put_str(&publish.unique_id, buf, "unique id")?;
    buf.put_u64(publish.payload.id());
    buf.put_u64(publish.timestamp);
    match publish.message_expiry_interval {
        Some(interval) => {
            buf.put_u8(1);
            buf.put_u64(interval);
        }
        None => buf.put_u8(0),
    }
    buf.put_u64(publish.estimated_size);
    Ok(())
}

fn get_publish(slice: &mut &[u8]) -> Result<StoredPublish, StorageError> {
    ensure(slice, 4, "publish header")?;
    let packet_id = slice.get_u16();
    let qos_byte = slice.get_u8();
    let qos = Qos::try_from(qos_byte)
        .map_err(|v| StorageError::Corruption(format!("invalid QoS value {v} in journal")))?;
    let retain = slice.get_u8() != 0;
    let topic = get_str(slice, "topic")?;
    let unique_id = get_str(slice, "unique id")?;
    ensure(slice, 8 + 8 + 1, "publish body")?;
    let payload_id = slice.get_u64();
    let timestamp = slice.get_u64();
    let message_expiry_interval = match slice.get_u8() {
        0 => None,
        _ => {
            ensure(slice, 8, "expiry interval")?;
            Some(slice.get_u64())
        }
    };
    ensure(slice, 8, "estimated size")?;
    let estimated_size = slice.get_u64();

    Ok(StoredPublish {
        packet_id: (packet_id != 0).then_some(packet_id),
        qos,
        topic,
        unique_id,
        // Replay restores the reference the entry held before restart.
        payload: PayloadRef::adopt(payload_id),
        timestamp,
        message_expiry_interval,
        retain,
        estimated_size,
    })
}

fn put_str(value: &str, buf: &mut BytesMut, what: &str) -> Result<(), StorageError> {
    let bytes = value.as_bytes();
    let len = u16::try_from(bytes.len())
        .map_err(|_| StorageError::Corruption(format!("{what} too long for journal record")))?;
    buf.put_u16(len);
    buf.put_slice(bytes);
    Ok(())
}

fn get_str(slice: &mut &[u8], what: &str) -> Result<String, StorageError> {
    ensure(slice, 2, what)?;
    let len = slice.get_u16() as usize;
    ensure(slice, len, what)?;
    let raw = slice.copy_to_bytes(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| StorageError::Corruption(format!("{what} in journal is not valid UTF-8")))
}

fn ensure(slice: &&[u8], needed: usize, what: &str) -> Result<(), StorageError> {
    if slice.remaining() < needed {
        return Err(StorageError::Corruption(format!(
            "journal record truncated while reading {what}"
        )));
    }
    Ok(())
}
