//! Logical log entries
//!
//! On-disk framing of one entry:
//! `[type_tag: u8][tx_local_id: u32][payload_len: u32][crc32: u32][payload]`
//! with little-endian integers and the checksum taken over the payload.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Size of the fixed part of an entry frame
pub const FRAME_SIZE: usize = 13;

/// Entry type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    /// A transaction opened in this log
    Start = 1,
    /// One buffered command of the transaction
    Command = 2,
    /// All commands are on disk and forced; the transaction may commit
    Prepare = 3,
    /// The transaction committed under a global id and primary epoch
    Commit = 4,
    /// The store files reflect the transaction
    Done = 5,
    /// The transaction was discarded after PREPARE
    Rollback = 6,
}

impl EntryKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Start),
            2 => Some(Self::Command),
            3 => Some(Self::Prepare),
            4 => Some(Self::Commit),
            5 => Some(Self::Done),
            6 => Some(Self::Rollback),
            _ => None,
        }
    }
}

/// COMMIT payload: the globally agreed transaction id, the epoch of the
/// primary that produced it, and the wall-clock commit time
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CommitPayload {
    pub global_tx_id: u64,
    pub primary_epoch: u32,
    pub timestamp_millis: i64,
}

impl CommitPayload {
    pub fn now(global_tx_id: u64, primary_epoch: u32) -> Self {
        Self {
            global_tx_id,
            primary_epoch,
            timestamp_millis: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// One parsed log entry
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub kind: EntryKind,
    pub tx_local_id: u32,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn new(kind: EntryKind, tx_local_id: u32, payload: Vec<u8>) -> Self {
        Self {
            kind,
            tx_local_id,
            payload,
        }
    }

    pub fn commit(tx_local_id: u32, payload: &CommitPayload) -> Result<Self> {
        Ok(Self::new(
            EntryKind::Commit,
            tx_local_id,
            bincode::serialize(payload)?,
        ))
    }

    pub fn commit_payload(&self) -> Result<CommitPayload> {
        debug_assert_eq!(self.kind, EntryKind::Commit);
        Ok(bincode::deserialize(&self.payload)?)
    }

    /// Serialize into the on-disk frame
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_SIZE + self.payload.len());
        out.push(self.kind as u8);
        out.extend_from_slice(&self.tx_local_id.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&crc32fast::hash(&self.payload).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse one entry from `buf` at `offset`. Returns the entry and the
    /// offset just past it. `None` means a clean end of readable entries
    /// (truncated or torn tail).
    pub fn read_from(buf: &[u8], offset: usize) -> Result<Option<(Self, usize)>> {
        if offset + FRAME_SIZE > buf.len() {
            return Ok(None);
        }
        let kind = match EntryKind::from_u8(buf[offset]) {
            Some(k) => k,
            None if buf[offset] == 0 => return Ok(None),
            None => {
                return Err(Error::LogCorrupted {
                    offset: offset as u64,
                    reason: format!("unknown entry tag {}", buf[offset]),
                })
            }
        };
        let tx_local_id = u32::from_le_bytes(buf[offset + 1..offset + 5].try_into().unwrap());
        let len = u32::from_le_bytes(buf[offset + 5..offset + 9].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(buf[offset + 9..offset + 13].try_into().unwrap());

        let start = offset + FRAME_SIZE;
        if start + len > buf.len() {
            // Torn tail: the frame promises more bytes than the file holds
            return Ok(None);
        }
        let payload = &buf[start..start + len];
        if crc32fast::hash(payload) != crc {
            return Err(Error::LogCorrupted {
                offset: offset as u64,
                reason: "payload checksum mismatch".into(),
            });
        }
        Ok(Some((
            Self::new(kind, tx_local_id, payload.to_vec()),
            start + len,
        )))
    }
}

/// A committed transaction extracted from the log for replication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommittedTx {
    pub tx_id: u64,
    pub primary_epoch: u32,
    pub commands: Vec<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trip() {
        let entry = LogEntry::new(EntryKind::Command, 7, vec![1, 2, 3, 4]);
        let bytes = entry.to_bytes();
        let (parsed, next) = LogEntry::read_from(&bytes, 0).unwrap().unwrap();
        assert_eq!(parsed.kind, EntryKind::Command);
        assert_eq!(parsed.tx_local_id, 7);
        assert_eq!(parsed.payload, vec![1, 2, 3, 4]);
        assert_eq!(next, bytes.len());
    }

    #[test]
    fn torn_tail_reads_as_end() {
        let entry = LogEntry::new(EntryKind::Command, 1, vec![9; 100]);
        let mut bytes = entry.to_bytes();
        bytes.truncate(bytes.len() - 10);
        assert!(LogEntry::read_from(&bytes, 0).unwrap().is_none());
    }

    #[test]
    fn corrupt_payload_detected() {
        let entry = LogEntry::new(EntryKind::Commit, 1, vec![5; 32]);
        let mut bytes = entry.to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            LogEntry::read_from(&bytes, 0),
            Err(Error::LogCorrupted { .. })
        ));
    }

    #[test]
    fn commit_payload_round_trip() {
        let payload = CommitPayload::now(42, 3);
        let entry = LogEntry::commit(1, &payload).unwrap();
        let back = entry.commit_payload().unwrap();
        assert_eq!(back.global_tx_id, 42);
        assert_eq!(back.primary_epoch, 3);
    }
}
