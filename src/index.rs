//! Key index
//!
//! A secondary exact-match index from `(key, value)` pairs to node ids.
//! It is a full data source: it keeps its own logical log, commits after
//! the graph store inside the same two-phase transaction, and replicates
//! through the same extract/apply surface. External full-text indexes
//! plug in the same way; this one ships in-repo so the multi-resource
//! commit path is always exercised.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::datasource::DataSource;
use crate::error::{Error, Result};
use crate::log::{CommittedTx, LogicalLog};
use crate::store::StoreId;

/// Name of the key index resource
pub const KEY_INDEX_SOURCE: &str = "keyindex";

const INDEX_MAGIC: &[u8; 8] = b"ANTLRIDX";

/// One index mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IndexCommand {
    Add {
        key: String,
        value: String,
        node_id: u32,
    },
    Remove {
        key: String,
        value: String,
        node_id: u32,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexTable {
    entries: HashMap<String, HashMap<String, BTreeSet<u32>>>,
    last_committed_tx: u64,
    primary_epoch: u32,
}

impl IndexTable {
    fn apply(&mut self, command: &IndexCommand) {
        match command {
            IndexCommand::Add {
                key,
                value,
                node_id,
            } => {
                self.entries
                    .entry(key.clone())
                    .or_default()
                    .entry(value.clone())
                    .or_default()
                    .insert(*node_id);
            }
            IndexCommand::Remove {
                key,
                value,
                node_id,
            } => {
                if let Some(values) = self.entries.get_mut(key) {
                    if let Some(ids) = values.get_mut(value) {
                        ids.remove(node_id);
                        if ids.is_empty() {
                            values.remove(value);
                        }
                    }
                    if values.is_empty() {
                        self.entries.remove(key);
                    }
                }
            }
        }
    }
}

/// The key index data source
#[derive(Debug)]
pub struct KeyIndexSource {
    path: PathBuf,
    store_id: StoreId,
    table: RwLock<IndexTable>,
    log: LogicalLog,
}

impl KeyIndexSource {
    pub const LOG_BASE: &'static str = "keyindex_logical.log";
    pub const TABLE_FILE: &'static str = "keyindex.db";

    /// Open (or create) the index in `dir`, running recovery against its
    /// own logical log
    pub fn open(dir: &Path, store_id: StoreId, keep_logs: bool, rotate_at: u64) -> Result<Self> {
        let path = dir.join(Self::TABLE_FILE);
        let table = match Self::load(&path)? {
            Some((found_id, table)) => {
                if found_id != store_id {
                    return Err(Error::StoreIdMismatch {
                        local: store_id.to_string(),
                        remote: found_id.to_string(),
                    });
                }
                table
            }
            None => IndexTable::default(),
        };

        let (log, recovered) = LogicalLog::open(dir, Self::LOG_BASE, keep_logs, rotate_at)?;

        let source = Self {
            path,
            store_id,
            table: RwLock::new(table),
            log,
        };

        // Replay whatever the persisted table is missing
        let mut redo_locals = Vec::new();
        let mut redone = 0usize;
        {
            let mut table = source.table.write();
            let watermark = table.last_committed_tx;
            for tx in &recovered {
                if tx.tx_id > watermark || !tx.done {
                    for bytes in &tx.commands {
                        let command: IndexCommand = bincode::deserialize(bytes)?;
                        table.apply(&command);
                    }
                    redone += 1;
                }
                table.last_committed_tx = table.last_committed_tx.max(tx.tx_id);
                if !tx.done {
                    redo_locals.push(tx.local_id);
                }
            }
        }
        if redone > 0 {
            tracing::info!(count = redone, "redid committed index transactions during recovery");
            source.log.finish_recovery(&redo_locals)?;
            source.persist()?;
        }

        Ok(source)
    }

    fn load(path: &Path) -> Result<Option<(StoreId, IndexTable)>> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.len() < 8 || &bytes[0..8] != INDEX_MAGIC {
            return Err(Error::CorruptStoreHeader {
                file: path.display().to_string(),
                reason: "bad index magic".into(),
            });
        }
        let (store_id, table): (StoreId, IndexTable) = bincode::deserialize(&bytes[8..])?;
        Ok(Some((store_id, table)))
    }

    fn persist(&self) -> Result<()> {
        let table = self.table.read();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(INDEX_MAGIC);
        bytes.extend(bincode::serialize(&(&self.store_id, &*table))?);
        drop(table);

        let tmp = self.path.with_extension("tmp");
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_data()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Node ids indexed under `(key, value)`
    pub fn get(&self, key: &str, value: &str) -> Vec<u32> {
        self.table
            .read()
            .entries
            .get(key)
            .and_then(|values| values.get(value))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    fn apply_bytes(&self, commands: &[Vec<u8>]) -> Result<()> {
        let mut table = self.table.write();
        for bytes in commands {
            let command: IndexCommand = bincode::deserialize(bytes)?;
            table.apply(&command);
        }
        Ok(())
    }
}

impl DataSource for KeyIndexSource {
    fn name(&self) -> &str {
        KEY_INDEX_SOURCE
    }

    fn last_committed_tx_id(&self) -> u64 {
        self.table.read().last_committed_tx
    }

    fn set_last_committed_tx_id(&self, tx_id: u64) -> Result<()> {
        self.table.write().last_committed_tx = tx_id;
        Ok(())
    }

    fn tx_begin(&self) -> Result<u32> {
        Ok(self.log.begin())
    }

    fn tx_prepare(&self, local: u32, commands: &[Vec<u8>]) -> Result<()> {
        self.log.prepare(local, commands)
    }

    fn tx_commit(&self, local: u32, tx_id: u64, epoch: u32, commands: &[Vec<u8>]) -> Result<()> {
        self.log.commit(local, tx_id, epoch)?;
        self.apply_bytes(commands)?;
        self.log.done(local)?;
        let mut table = self.table.write();
        table.last_committed_tx = tx_id;
        table.primary_epoch = epoch;
        Ok(())
    }

    fn tx_rollback(&self, local: u32, was_prepared: bool) -> Result<()> {
        self.log.rollback(local, was_prepared)
    }

    fn apply_committed(&self, tx_id: u64, epoch: u32, commands: &[Vec<u8>]) -> Result<()> {
        let last = self.last_committed_tx_id();
        if tx_id <= last {
            tracing::debug!(tx_id, last, "skipping already applied index transaction");
            return Ok(());
        }
        if tx_id != last + 1 {
            return Err(Error::TxGap {
                resource: KEY_INDEX_SOURCE.to_string(),
                last,
                got: tx_id,
            });
        }

        let local = self.log.begin();
        self.log.prepare(local, commands)?;
        self.log.commit(local, tx_id, epoch)?;
        self.apply_bytes(commands)?;
        self.log.done(local)?;
        let mut table = self.table.write();
        table.last_committed_tx = tx_id;
        table.primary_epoch = epoch;
        Ok(())
    }

    fn extract(&self, from_tx_id: u64) -> Result<Vec<CommittedTx>> {
        self.log.extract(from_tx_id, self.last_committed_tx_id())
    }

    fn master_epoch_for(&self, tx_id: u64) -> Result<u32> {
        self.log.master_epoch_for(tx_id)
    }

    fn prune_history(&self, applied_everywhere: u64) -> Result<usize> {
        self.log.prune(applied_everywhere)
    }

    fn flush(&self) -> Result<()> {
        self.log.force()?;
        self.persist()
    }

    fn close(&self) -> Result<()> {
        self.log.force()?;
        self.persist()
    }

    fn snapshot_files(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut files = Vec::new();
        if self.path.exists() {
            files.push((Self::TABLE_FILE.to_string(), self.path.clone()));
        }
        files.extend(self.log.active_files());
        Ok(files)
    }
}

/// Serialize one index command for a transaction stream
pub fn serialize_command(command: &IndexCommand) -> Result<Vec<u8>> {
    Ok(bincode::serialize(command)?)
}

/// Convenience constructor used by engine wiring
pub fn open_shared(
    dir: &Path,
    store_id: StoreId,
    keep_logs: bool,
    rotate_at: u64,
) -> Result<Arc<KeyIndexSource>> {
    Ok(Arc::new(KeyIndexSource::open(
        dir, store_id, keep_logs, rotate_at,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn add(key: &str, value: &str, node_id: u32) -> Vec<u8> {
        serialize_command(&IndexCommand::Add {
            key: key.into(),
            value: value.into(),
            node_id,
        })
        .unwrap()
    }

    #[test]
    fn commit_and_lookup() {
        let dir = tempdir().unwrap();
        let index = KeyIndexSource::open(dir.path(), StoreId::new(), true, 1 << 20).unwrap();

        let local = index.tx_begin().unwrap();
        let cmds = vec![add("name", "alice", 1), add("name", "alice", 2)];
        index.tx_prepare(local, &cmds).unwrap();
        index.tx_commit(local, 1, 1, &cmds).unwrap();

        assert_eq!(index.get("name", "alice"), vec![1, 2]);
        assert!(index.get("name", "bob").is_empty());
    }

    #[test]
    fn remove_cleans_empty_buckets() {
        let dir = tempdir().unwrap();
        let index = KeyIndexSource::open(dir.path(), StoreId::new(), true, 1 << 20).unwrap();

        let cmds = vec![
            add("name", "alice", 1),
            serialize_command(&IndexCommand::Remove {
                key: "name".into(),
                value: "alice".into(),
                node_id: 1,
            })
            .unwrap(),
        ];
        let local = index.tx_begin().unwrap();
        index.tx_prepare(local, &cmds).unwrap();
        index.tx_commit(local, 1, 1, &cmds).unwrap();

        assert!(index.get("name", "alice").is_empty());
        assert!(index.table.read().entries.is_empty());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempdir().unwrap();
        let store_id = StoreId::new();
        {
            let index = KeyIndexSource::open(dir.path(), store_id, true, 1 << 20).unwrap();
            let cmds = vec![add("name", "carol", 9)];
            let local = index.tx_begin().unwrap();
            index.tx_prepare(local, &cmds).unwrap();
            index.tx_commit(local, 1, 2, &cmds).unwrap();
            index.close().unwrap();
        }

        let index = KeyIndexSource::open(dir.path(), store_id, true, 1 << 20).unwrap();
        assert_eq!(index.get("name", "carol"), vec![9]);
        assert_eq!(index.last_committed_tx_id(), 1);

        // Foreign store ids are rejected
        let err = KeyIndexSource::open(dir.path(), StoreId::new(), true, 1 << 20).unwrap_err();
        assert!(matches!(err, Error::StoreIdMismatch { .. }));
    }

    #[test]
    fn unpersisted_commit_recovers_from_log() {
        let dir = tempdir().unwrap();
        let store_id = StoreId::new();
        {
            let index = KeyIndexSource::open(dir.path(), store_id, true, 1 << 20).unwrap();
            let cmds = vec![add("name", "dave", 4)];
            let local = index.tx_begin().unwrap();
            index.tx_prepare(local, &cmds).unwrap();
            index.tx_commit(local, 1, 1, &cmds).unwrap();
            // No close: the table snapshot was never persisted
        }

        let index = KeyIndexSource::open(dir.path(), store_id, true, 1 << 20).unwrap();
        assert_eq!(index.get("name", "dave"), vec![4]);
        assert_eq!(index.last_committed_tx_id(), 1);
    }

    #[test]
    fn gap_rejected() {
        let dir = tempdir().unwrap();
        let index = KeyIndexSource::open(dir.path(), StoreId::new(), true, 1 << 20).unwrap();

        index.apply_committed(1, 1, &[add("k", "v", 1)]).unwrap();
        let err = index.apply_committed(3, 1, &[add("k", "v", 3)]).unwrap_err();
        assert!(matches!(err, Error::TxGap { .. }));
    }
}
