//! Logical Log
//!
//! Append-only write-ahead log of transaction commands, alternating
//! between two halves (`<base>.0` / `<base>.1`) with rotation once the
//! active half passes a size bound. Rotated halves are retained as
//! `<base>.v<N>` when the log keeps history for replication.

pub mod entry;
pub mod recovery;

pub use entry::{CommitPayload, CommittedTx, EntryKind, LogEntry};
pub use recovery::{scan_log_file, ScanOutcome, ScannedTx};

use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};

const LOG_MAGIC: &[u8; 8] = b"ANTLRLOG";
const LOG_FORMAT_VERSION: u32 = 1;

/// Size of a log file header: magic, format version, log version
pub const FILE_HEADER_SIZE: usize = 20;

/// Write a log file header to a freshly created file
pub fn write_file_header(file: &mut File, log_version: u64) -> Result<()> {
    let mut header = [0u8; FILE_HEADER_SIZE];
    header[0..8].copy_from_slice(LOG_MAGIC);
    header[8..12].copy_from_slice(&LOG_FORMAT_VERSION.to_le_bytes());
    header[12..20].copy_from_slice(&log_version.to_le_bytes());
    file.write_all(&header)?;
    Ok(())
}

#[derive(Debug)]
struct LogInner {
    file: File,
    pos: u64,
    active_half: u8,
    /// Monotonic sequence number of the active file across rotations
    log_version: u64,
    next_local: u32,
    open_txs: HashSet<u32>,
}

/// A committed transaction found in the active log during recovery.
/// Replay is idempotent, so callers redo any of these that may not be
/// fully reflected in their store.
#[derive(Debug)]
pub struct RecoveredTx {
    pub local_id: u32,
    pub tx_id: u64,
    pub primary_epoch: u32,
    pub commands: Vec<Vec<u8>>,
    /// DONE was on disk; the store apply at least started completing
    pub done: bool,
}

/// The write-ahead logical log of one data source
#[derive(Debug)]
pub struct LogicalLog {
    dir: PathBuf,
    base: String,
    keep_logs: bool,
    rotate_at: u64,
    inner: Mutex<LogInner>,
    /// Committed global tx id → primary epoch, for branch checks
    epoch_map: RwLock<BTreeMap<u64, u32>>,
}

impl LogicalLog {
    /// Open (or create) the logical log in `dir`, returning the log and
    /// every committed transaction in the active file. The caller redoes
    /// the ones its store may be missing, then calls
    /// [`LogicalLog::finish_recovery`] with the locals that lacked DONE.
    pub fn open(
        dir: &Path,
        base: &str,
        keep_logs: bool,
        rotate_at: u64,
    ) -> Result<(Self, Vec<RecoveredTx>)> {
        std::fs::create_dir_all(dir)?;
        let (active_half, log_version) = read_active_marker(dir, base)?;
        let path = half_path(dir, base, active_half);

        let mut recovered = Vec::new();
        let mut epoch_map = BTreeMap::new();
        let mut next_local = 1;
        let (file, pos) = if path.exists() {
            let outcome = scan_log_file(&path)?;
            next_local = outcome.max_local + 1;
            for (local, tx) in outcome.committed() {
                let commit = tx.commit.as_ref().unwrap();
                epoch_map.insert(commit.global_tx_id, commit.primary_epoch);
                recovered.push(RecoveredTx {
                    local_id: local,
                    tx_id: commit.global_tx_id,
                    primary_epoch: commit.primary_epoch,
                    commands: tx.commands.clone(),
                    done: tx.done,
                });
            }
            recovered.sort_by_key(|tx| tx.tx_id);

            let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
            if outcome.valid_len < FILE_HEADER_SIZE as u64 {
                // Crash between create and header force: start over
                file.set_len(0)?;
                write_file_header(&mut file, log_version)?;
                file.sync_data()?;
                (file, FILE_HEADER_SIZE as u64)
            } else {
                if file.metadata()?.len() > outcome.valid_len {
                    tracing::warn!(
                        file = %path.display(),
                        valid = outcome.valid_len,
                        "truncating torn logical log tail"
                    );
                    file.set_len(outcome.valid_len)?;
                }
                use std::io::{Seek, SeekFrom};
                file.seek(SeekFrom::Start(outcome.valid_len))?;
                (file, outcome.valid_len)
            }
        } else {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            write_file_header(&mut file, log_version)?;
            file.sync_data()?;
            (file, FILE_HEADER_SIZE as u64)
        };

        let log = Self {
            dir: dir.to_path_buf(),
            base: base.to_string(),
            keep_logs,
            rotate_at,
            inner: Mutex::new(LogInner {
                file,
                pos,
                active_half,
                log_version,
                next_local,
                open_txs: HashSet::new(),
            }),
            epoch_map: RwLock::new(epoch_map),
        };
        write_active_marker(dir, base, active_half, log_version)?;
        Ok((log, recovered))
    }

    /// Reserve a local transaction id
    pub fn begin(&self) -> u32 {
        let mut inner = self.inner.lock();
        let local = inner.next_local;
        inner.next_local += 1;
        inner.open_txs.insert(local);
        local
    }

    fn append(inner: &mut LogInner, entry: &LogEntry) -> Result<()> {
        let bytes = entry.to_bytes();
        inner.file.write_all(&bytes)?;
        inner.pos += bytes.len() as u64;
        Ok(())
    }

    /// Write START, the command entries and PREPARE, then force to disk
    pub fn prepare(&self, local: u32, commands: &[Vec<u8>]) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::append(&mut inner, &LogEntry::new(EntryKind::Start, local, vec![]))?;
        for cmd in commands {
            Self::append(&mut inner, &LogEntry::new(EntryKind::Command, local, cmd.clone()))?;
        }
        Self::append(&mut inner, &LogEntry::new(EntryKind::Prepare, local, vec![]))?;
        inner.file.sync_data()?;
        Ok(())
    }

    /// Write COMMIT with the assigned global id and epoch, forced. Never
    /// called before [`LogicalLog::prepare`] for the same transaction.
    pub fn commit(&self, local: u32, tx_id: u64, primary_epoch: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let payload = CommitPayload::now(tx_id, primary_epoch);
        Self::append(&mut inner, &LogEntry::commit(local, &payload)?)?;
        inner.file.sync_data()?;
        drop(inner);
        self.epoch_map.write().insert(tx_id, primary_epoch);
        Ok(())
    }

    /// Write DONE once the store reflects the transaction; may rotate
    pub fn done(&self, local: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::append(&mut inner, &LogEntry::new(EntryKind::Done, local, vec![]))?;
        inner.open_txs.remove(&local);
        if inner.pos >= self.rotate_at && inner.open_txs.is_empty() {
            self.rotate(&mut inner)?;
        }
        Ok(())
    }

    /// Discard the transaction. A rollback record is only needed when the
    /// transaction already prepared.
    pub fn rollback(&self, local: u32, was_prepared: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if was_prepared {
            Self::append(&mut inner, &LogEntry::new(EntryKind::Rollback, local, vec![]))?;
            inner.file.sync_data()?;
        }
        inner.open_txs.remove(&local);
        Ok(())
    }

    /// Append DONE for transactions redone during recovery
    pub fn finish_recovery(&self, locals: &[u32]) -> Result<()> {
        let mut inner = self.inner.lock();
        for local in locals {
            Self::append(&mut inner, &LogEntry::new(EntryKind::Done, *local, vec![]))?;
        }
        inner.file.sync_data()?;
        Ok(())
    }

    fn rotate(&self, inner: &mut LogInner) -> Result<()> {
        inner.file.sync_data()?;
        let old_path = half_path(&self.dir, &self.base, inner.active_half);
        if self.keep_logs {
            let retained = self.versioned_path(inner.log_version);
            std::fs::rename(&old_path, &retained)?;
            tracing::debug!(retained = %retained.display(), "retained rotated logical log");
        } else {
            std::fs::remove_file(&old_path)?;
        }

        inner.active_half ^= 1;
        inner.log_version += 1;
        let new_path = half_path(&self.dir, &self.base, inner.active_half);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&new_path)?;
        write_file_header(&mut file, inner.log_version)?;
        file.sync_data()?;
        inner.file = file;
        inner.pos = FILE_HEADER_SIZE as u64;
        write_active_marker(&self.dir, &self.base, inner.active_half, inner.log_version)?;
        tracing::info!(version = inner.log_version, "rotated logical log");
        Ok(())
    }

    fn versioned_path(&self, version: u64) -> PathBuf {
        self.dir.join(format!("{}.v{}", self.base, version))
    }

    /// Retained log versions on disk, ascending
    fn retained_versions(&self) -> Result<Vec<(u64, PathBuf)>> {
        let prefix = format!("{}.v", self.base);
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(rest) = name.strip_prefix(&prefix) {
                if let Ok(version) = rest.parse::<u64>() {
                    out.push((version, entry.path()));
                }
            }
        }
        out.sort_by_key(|(v, _)| *v);
        Ok(out)
    }

    /// Force the active file to disk
    pub fn force(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.file.sync_data()?;
        Ok(())
    }

    /// Extract every committed transaction with id in
    /// `(from_tx_id ..= last_committed)` from the retained logs and the
    /// active one, in id order. Fails with [`Error::LogPruned`] when the
    /// range is no longer fully on disk.
    pub fn extract(&self, from_tx_id: u64, last_committed: u64) -> Result<Vec<CommittedTx>> {
        if from_tx_id > last_committed {
            return Ok(Vec::new());
        }

        let mut found: BTreeMap<u64, CommittedTx> = BTreeMap::new();
        let mut files: Vec<PathBuf> = self
            .retained_versions()?
            .into_iter()
            .map(|(_, p)| p)
            .collect();
        {
            let inner = self.inner.lock();
            inner.file.sync_data()?;
            files.push(half_path(&self.dir, &self.base, inner.active_half));
        }

        for path in files {
            let outcome = scan_log_file(&path)?;
            for (_, tx) in outcome.committed() {
                let commit = tx.commit.as_ref().unwrap();
                if commit.global_tx_id >= from_tx_id && commit.global_tx_id <= last_committed {
                    found.insert(
                        commit.global_tx_id,
                        CommittedTx {
                            tx_id: commit.global_tx_id,
                            primary_epoch: commit.primary_epoch,
                            commands: tx.commands.clone(),
                        },
                    );
                }
            }
        }

        let mut expected = from_tx_id;
        for tx_id in found.keys() {
            if *tx_id != expected {
                return Err(Error::LogPruned { from: from_tx_id });
            }
            expected += 1;
        }
        if expected != last_committed + 1 {
            return Err(Error::LogPruned { from: from_tx_id });
        }
        Ok(found.into_values().collect())
    }

    /// The primary epoch that produced `tx_id`, from the in-memory map or
    /// by scanning retained logs
    pub fn master_epoch_for(&self, tx_id: u64) -> Result<u32> {
        if let Some(epoch) = self.epoch_map.read().get(&tx_id) {
            return Ok(*epoch);
        }
        for (_, path) in self.retained_versions()? {
            let outcome = scan_log_file(&path)?;
            for (_, tx) in outcome.committed() {
                let commit = tx.commit.as_ref().unwrap();
                self.epoch_map
                    .write()
                    .insert(commit.global_tx_id, commit.primary_epoch);
            }
        }
        self.epoch_map
            .read()
            .get(&tx_id)
            .copied()
            .ok_or(Error::LogPruned { from: tx_id })
    }

    /// Record the epoch of an externally applied transaction
    pub fn note_epoch(&self, tx_id: u64, epoch: u32) {
        self.epoch_map.write().insert(tx_id, epoch);
    }

    /// Delete retained logs whose newest transaction is older than
    /// `applied_everywhere`
    pub fn prune(&self, applied_everywhere: u64) -> Result<usize> {
        let mut removed = 0;
        for (_, path) in self.retained_versions()? {
            let outcome = scan_log_file(&path)?;
            let newest = outcome
                .committed()
                .last()
                .and_then(|(_, tx)| tx.commit.as_ref().map(|c| c.global_tx_id));
            match newest {
                Some(id) if id < applied_everywhere => {
                    std::fs::remove_file(&path)?;
                    removed += 1;
                }
                None => {
                    std::fs::remove_file(&path)?;
                    removed += 1;
                }
                _ => {}
            }
        }
        Ok(removed)
    }

    /// Paths of the active log and marker files, for snapshot streaming
    pub fn active_files(&self) -> Vec<(String, PathBuf)> {
        let inner = self.inner.lock();
        let half = inner.active_half;
        drop(inner);
        let mut out = Vec::new();
        let active = half_path(&self.dir, &self.base, half);
        if active.exists() {
            out.push((format!("{}.{}", self.base, half), active));
        }
        let marker = marker_path(&self.dir, &self.base);
        if marker.exists() {
            out.push((format!("{}.active", self.base), marker));
        }
        out
    }
}

fn half_path(dir: &Path, base: &str, half: u8) -> PathBuf {
    dir.join(format!("{base}.{half}"))
}

fn marker_path(dir: &Path, base: &str) -> PathBuf {
    dir.join(format!("{base}.active"))
}

fn read_active_marker(dir: &Path, base: &str) -> Result<(u8, u64)> {
    let path = marker_path(dir, base);
    match std::fs::read(&path) {
        Ok(bytes) if bytes.len() >= 9 => {
            let half = bytes[0];
            if half > 1 {
                return Err(Error::Log(format!("bad active marker {half}")));
            }
            let version = u64::from_le_bytes(bytes[1..9].try_into().unwrap());
            Ok((half, version))
        }
        Ok(_) => Err(Error::Log("truncated active marker".into())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok((0, 1)),
        Err(e) => Err(e.into()),
    }
}

fn write_active_marker(dir: &Path, base: &str, half: u8, version: u64) -> Result<()> {
    let path = marker_path(dir, base);
    let tmp = dir.join(format!("{base}.active.tmp"));
    let mut bytes = Vec::with_capacity(9);
    bytes.push(half);
    bytes.extend_from_slice(&version.to_le_bytes());
    {
        let mut f = File::create(&tmp)?;
        f.write_all(&bytes)?;
        f.sync_data()?;
    }
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const BASE: &str = "nioneo_logical.log";

    fn commit_one(log: &LogicalLog, tx_id: u64, epoch: u32, payload: u8) {
        let local = log.begin();
        log.prepare(local, &[vec![payload]]).unwrap();
        log.commit(local, tx_id, epoch).unwrap();
        log.done(local).unwrap();
    }

    #[test]
    fn commit_cycle_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let (log, recovered) = LogicalLog::open(dir.path(), BASE, true, 1 << 20).unwrap();
            assert!(recovered.is_empty());
            commit_one(&log, 1, 1, 0xAA);
        }

        let (log, recovered) = LogicalLog::open(dir.path(), BASE, true, 1 << 20).unwrap();
        // DONE was written; the transaction surfaces as fully applied
        assert_eq!(recovered.len(), 1);
        assert!(recovered[0].done);
        assert_eq!(log.master_epoch_for(1).unwrap(), 1);
    }

    #[test]
    fn recovery_returns_committed_without_done() {
        let dir = tempdir().unwrap();
        {
            let (log, _) = LogicalLog::open(dir.path(), BASE, true, 1 << 20).unwrap();
            let local = log.begin();
            log.prepare(local, &[vec![1], vec![2]]).unwrap();
            log.commit(local, 5, 2).unwrap();
            // Crash before DONE
        }

        let (log, recovered) = LogicalLog::open(dir.path(), BASE, true, 1 << 20).unwrap();
        assert_eq!(recovered.len(), 1);
        assert!(!recovered[0].done);
        assert_eq!(recovered[0].tx_id, 5);
        assert_eq!(recovered[0].primary_epoch, 2);
        assert_eq!(recovered[0].commands.len(), 2);
        log.finish_recovery(&[recovered[0].local_id]).unwrap();

        // Redone and marked: a third open sees it as done
        drop(log);
        let (_, recovered) = LogicalLog::open(dir.path(), BASE, true, 1 << 20).unwrap();
        assert_eq!(recovered.len(), 1);
        assert!(recovered[0].done);
    }

    #[test]
    fn prepared_without_commit_is_discarded() {
        let dir = tempdir().unwrap();
        {
            let (log, _) = LogicalLog::open(dir.path(), BASE, true, 1 << 20).unwrap();
            let local = log.begin();
            log.prepare(local, &[vec![9]]).unwrap();
            // Crash before COMMIT
        }

        let (_, recovered) = LogicalLog::open(dir.path(), BASE, true, 1 << 20).unwrap();
        assert!(recovered.is_empty());
    }

    #[test]
    fn extract_range_and_gap_detection() {
        let dir = tempdir().unwrap();
        let (log, _) = LogicalLog::open(dir.path(), BASE, true, 1 << 20).unwrap();
        for tx_id in 1..=4 {
            commit_one(&log, tx_id, 1, tx_id as u8);
        }

        let txs = log.extract(2, 4).unwrap();
        assert_eq!(txs.iter().map(|t| t.tx_id).collect::<Vec<_>>(), vec![2, 3, 4]);

        // Asking past the end is empty, not an error
        assert!(log.extract(5, 4).unwrap().is_empty());
    }

    #[test]
    fn rotation_retains_history() {
        let dir = tempdir().unwrap();
        // Tiny bound so every transaction rotates
        let (log, _) = LogicalLog::open(dir.path(), BASE, true, 64).unwrap();
        for tx_id in 1..=3 {
            commit_one(&log, tx_id, 1, tx_id as u8);
        }

        // All three transactions still extractable across retained files
        let txs = log.extract(1, 3).unwrap();
        assert_eq!(txs.len(), 3);

        // Without retention the history is gone
        let dir2 = tempdir().unwrap();
        let (log2, _) = LogicalLog::open(dir2.path(), BASE, false, 64).unwrap();
        for tx_id in 1..=3 {
            commit_one(&log2, tx_id, 1, tx_id as u8);
        }
        assert!(matches!(
            log2.extract(1, 3),
            Err(Error::LogPruned { .. })
        ));
    }

    #[test]
    fn prune_drops_fully_applied_logs() {
        let dir = tempdir().unwrap();
        let (log, _) = LogicalLog::open(dir.path(), BASE, true, 64).unwrap();
        for tx_id in 1..=3 {
            commit_one(&log, tx_id, 1, tx_id as u8);
        }
        let removed = log.prune(3).unwrap();
        assert!(removed >= 1);
        assert!(matches!(log.extract(1, 3), Err(Error::LogPruned { .. })));
    }

    #[test]
    fn epoch_lookup_survives_rotation() {
        let dir = tempdir().unwrap();
        {
            let (log, _) = LogicalLog::open(dir.path(), BASE, true, 64).unwrap();
            commit_one(&log, 1, 1, 1);
            commit_one(&log, 2, 3, 2);
        }
        // Fresh open: map only covers the active file, the rest is scanned
        let (log, _) = LogicalLog::open(dir.path(), BASE, true, 64).unwrap();
        assert_eq!(log.master_epoch_for(1).unwrap(), 1);
        assert_eq!(log.master_epoch_for(2).unwrap(), 3);
        assert!(matches!(log.master_epoch_for(99), Err(Error::LogPruned { .. })));
    }
}
