//! Logical log scanning
//!
//! Forward scan over one log file, reconstructing per-transaction state.
//! Used by recovery on boot and by history extraction for replication.

use std::collections::HashMap;
use std::path::Path;

use super::entry::{CommitPayload, EntryKind, LogEntry};
use super::FILE_HEADER_SIZE;
use crate::error::{Error, Result};

/// Everything the scan learned about one transaction
#[derive(Debug, Clone, Default)]
pub struct ScannedTx {
    pub commands: Vec<Vec<u8>>,
    pub prepared: bool,
    pub commit: Option<CommitPayload>,
    pub done: bool,
    pub rolled_back: bool,
}

impl ScannedTx {
    /// Committed but the store apply never finished
    pub fn needs_redo(&self) -> bool {
        self.commit.is_some() && !self.done
    }
}

/// Result of scanning one log file
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Transactions in order of their START entry, keyed by local id
    pub txs: HashMap<u32, ScannedTx>,
    /// Offset just past the last intact entry; the tail beyond is torn
    pub valid_len: u64,
    /// Highest local transaction id seen
    pub max_local: u32,
}

impl ScanOutcome {
    /// Committed transactions ordered by global id
    pub fn committed(&self) -> Vec<(u32, &ScannedTx)> {
        let mut out: Vec<(u32, &ScannedTx)> = self
            .txs
            .iter()
            .filter(|(_, tx)| tx.commit.is_some())
            .map(|(local, tx)| (*local, tx))
            .collect();
        out.sort_by_key(|(_, tx)| tx.commit.as_ref().unwrap().global_tx_id);
        out
    }
}

/// Scan a log file from its header to the first torn or corrupt entry.
/// Corruption after the last COMMIT is treated as a torn tail; anything
/// else is surfaced to the caller.
pub fn scan_log_file(path: &Path) -> Result<ScanOutcome> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < FILE_HEADER_SIZE {
        return Ok(ScanOutcome {
            valid_len: bytes.len() as u64,
            ..Default::default()
        });
    }

    let mut outcome = ScanOutcome {
        valid_len: FILE_HEADER_SIZE as u64,
        ..Default::default()
    };
    let mut offset = FILE_HEADER_SIZE;

    loop {
        match LogEntry::read_from(&bytes, offset) {
            Ok(Some((entry, next))) => {
                let local = entry.tx_local_id;
                outcome.max_local = outcome.max_local.max(local);
                let tx = outcome.txs.entry(local).or_default();
                match entry.kind {
                    EntryKind::Start => {}
                    EntryKind::Command => tx.commands.push(entry.payload),
                    EntryKind::Prepare => tx.prepared = true,
                    EntryKind::Commit => tx.commit = Some(entry.commit_payload()?),
                    EntryKind::Done => tx.done = true,
                    EntryKind::Rollback => tx.rolled_back = true,
                }
                offset = next;
                outcome.valid_len = offset as u64;
            }
            Ok(None) => break,
            Err(Error::LogCorrupted { offset: at, reason }) => {
                tracing::warn!(
                    file = %path.display(),
                    offset = at,
                    %reason,
                    "treating corrupt log entry as torn tail"
                );
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::entry::{CommitPayload, EntryKind, LogEntry};
    use crate::log::write_file_header;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_log(path: &Path, entries: &[LogEntry]) {
        let mut file = std::fs::File::create(path).unwrap();
        write_file_header(&mut file, 1).unwrap();
        for e in entries {
            file.write_all(&e.to_bytes()).unwrap();
        }
    }

    #[test]
    fn scan_classifies_transactions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.0");

        write_log(
            &path,
            &[
                // tx 1: fully done
                LogEntry::new(EntryKind::Start, 1, vec![]),
                LogEntry::new(EntryKind::Command, 1, vec![1]),
                LogEntry::new(EntryKind::Prepare, 1, vec![]),
                LogEntry::commit(1, &CommitPayload::now(10, 1)).unwrap(),
                LogEntry::new(EntryKind::Done, 1, vec![]),
                // tx 2: committed, apply never finished
                LogEntry::new(EntryKind::Start, 2, vec![]),
                LogEntry::new(EntryKind::Command, 2, vec![2]),
                LogEntry::new(EntryKind::Prepare, 2, vec![]),
                LogEntry::commit(2, &CommitPayload::now(11, 1)).unwrap(),
                // tx 3: prepared, never committed
                LogEntry::new(EntryKind::Start, 3, vec![]),
                LogEntry::new(EntryKind::Command, 3, vec![3]),
                LogEntry::new(EntryKind::Prepare, 3, vec![]),
            ],
        );

        let outcome = scan_log_file(&path).unwrap();
        assert_eq!(outcome.max_local, 3);
        assert!(!outcome.txs[&1].needs_redo());
        assert!(outcome.txs[&2].needs_redo());
        assert!(!outcome.txs[&3].needs_redo());
        assert!(outcome.txs[&3].prepared);

        let committed = outcome.committed();
        assert_eq!(committed.len(), 2);
        assert_eq!(committed[0].1.commit.unwrap().global_tx_id, 10);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.0");

        write_log(
            &path,
            &[
                LogEntry::new(EntryKind::Start, 1, vec![]),
                LogEntry::new(EntryKind::Command, 1, vec![7; 50]),
            ],
        );
        let full = std::fs::metadata(&path).unwrap().len();
        let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(full - 20).unwrap();

        let outcome = scan_log_file(&path).unwrap();
        assert!(outcome.valid_len < full - 20 || outcome.txs[&1].commands.is_empty());
        // Only the intact START survives
        assert!(outcome.txs[&1].commands.is_empty());
    }
}
