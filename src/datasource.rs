//! Data sources
//!
//! A data source is a named recoverable resource with its own logical
//! log and committed-transaction watermark. The transaction coordinator
//! drives every enlisted source through two-phase commit; replication
//! moves committed history between sources of the same name on
//! different nodes.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::log::{CommittedTx, LogicalLog};
use crate::store::{Command, GraphStore};

/// Name of the graph resource
pub const GRAPH_SOURCE: &str = "graph";

/// A participating resource: 2PC hooks for the coordinator plus the
/// transferable-history surface used by replication
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    /// Highest committed transaction id applied to this source
    fn last_committed_tx_id(&self) -> u64;

    /// Overwrite the watermark; used when seeding a store copied from
    /// the primary
    fn set_last_committed_tx_id(&self, tx_id: u64) -> Result<()>;

    // ── Two-phase commit ───────────────────────────────

    /// Reserve a source-local transaction id
    fn tx_begin(&self) -> Result<u32>;

    /// Phase one: write and force the command stream
    fn tx_prepare(&self, local: u32, commands: &[Vec<u8>]) -> Result<()>;

    /// Phase two: write COMMIT under the assigned global id, apply to
    /// the store, mark DONE
    fn tx_commit(&self, local: u32, tx_id: u64, epoch: u32, commands: &[Vec<u8>]) -> Result<()>;

    fn tx_rollback(&self, local: u32, was_prepared: bool) -> Result<()>;

    // ── Replicated history ─────────────────────────────

    /// Apply a transaction committed elsewhere. Idempotent; refuses
    /// gaps in the id sequence.
    fn apply_committed(&self, tx_id: u64, epoch: u32, commands: &[Vec<u8>]) -> Result<()>;

    /// Committed transactions with id > `from_tx_id - 1`, oldest first
    fn extract(&self, from_tx_id: u64) -> Result<Vec<CommittedTx>>;

    /// Epoch of the primary that produced `tx_id`
    fn master_epoch_for(&self, tx_id: u64) -> Result<u32>;

    // ── Maintenance ────────────────────────────────────

    /// Drop retained history every replica has applied; returns the
    /// number of log files removed
    fn prune_history(&self, applied_everywhere: u64) -> Result<usize>;

    fn flush(&self) -> Result<()>;

    fn close(&self) -> Result<()>;

    /// Store files to stream in a snapshot, with directory-relative names
    fn snapshot_files(&self) -> Result<Vec<(String, PathBuf)>>;
}

/// Named set of data sources; iteration order is registration order and
/// defines the commit order across sources (graph first)
#[derive(Default, Clone)]
pub struct DataSourceRegistry {
    sources: Vec<Arc<dyn DataSource>>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Arc<dyn DataSource>) {
        debug_assert!(self.get(source.name()).is_none(), "duplicate data source");
        self.sources.push(source);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DataSource>> {
        self.sources.iter().find(|s| s.name() == name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<dyn DataSource>> {
        self.get(name)
            .ok_or_else(|| Error::UnknownDataSource(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DataSource>> {
        self.sources.iter()
    }

    /// `(name, last_committed_tx_id)` for every source, the shape a
    /// follower reports in its context
    pub fn watermarks(&self) -> Vec<(String, u64)> {
        self.sources
            .iter()
            .map(|s| (s.name().to_string(), s.last_committed_tx_id()))
            .collect()
    }

    pub fn flush_all(&self) -> Result<()> {
        for source in &self.sources {
            source.flush()?;
        }
        Ok(())
    }

    pub fn close_all(&self) -> Result<()> {
        for source in &self.sources {
            source.close()?;
        }
        Ok(())
    }
}

/// The graph resource: fixed-record store plus its logical log
pub struct GraphDataSource {
    store: Arc<GraphStore>,
    log: LogicalLog,
}

impl GraphDataSource {
    pub const LOG_BASE: &'static str = "nioneo_logical.log";

    /// Open the source and run recovery: committed-but-unapplied
    /// transactions are redone, everything else in the log is discarded.
    pub fn open(
        store: Arc<GraphStore>,
        dir: &std::path::Path,
        keep_logs: bool,
        rotate_at: u64,
    ) -> Result<Self> {
        let (log, recovered) = LogicalLog::open(dir, Self::LOG_BASE, keep_logs, rotate_at)?;

        // Replay every committed transaction the flushed store may be
        // missing; replay is idempotent because commands overwrite whole
        // records by id.
        let watermark = store.last_committed_tx();
        let mut redo_locals = Vec::new();
        let mut highest = watermark;
        let mut redone = 0usize;
        for tx in &recovered {
            if tx.tx_id > watermark || !tx.done {
                for bytes in &tx.commands {
                    let command: Command = bincode::deserialize(bytes)?;
                    store.apply(&command)?;
                }
                redone += 1;
            }
            highest = highest.max(tx.tx_id);
            if !tx.done {
                redo_locals.push(tx.local_id);
            }
        }
        if redone > 0 {
            tracing::info!(count = redone, "redid committed transactions during recovery");
            log.finish_recovery(&redo_locals)?;
            store.set_last_committed_tx(highest);
            store.flush_all()?;
        }

        Ok(Self { store, log })
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    fn apply_bytes(&self, commands: &[Vec<u8>]) -> Result<()> {
        for bytes in commands {
            let command: Command = bincode::deserialize(bytes)?;
            self.store.apply(&command)?;
        }
        Ok(())
    }
}

impl DataSource for GraphDataSource {
    fn name(&self) -> &str {
        GRAPH_SOURCE
    }

    fn last_committed_tx_id(&self) -> u64 {
        self.store.last_committed_tx()
    }

    fn set_last_committed_tx_id(&self, tx_id: u64) -> Result<()> {
        self.store.set_last_committed_tx(tx_id);
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
        self.store.set_last_committed_tx(tx_id);
        self.store.set_primary_epoch(epoch);
        Ok(())
    }

    fn tx_rollback(&self, local: u32, was_prepared: bool) -> Result<()> {
        self.log.rollback(local, was_prepared)
    }

    fn apply_committed(&self, tx_id: u64, epoch: u32, commands: &[Vec<u8>]) -> Result<()> {
        let last = self.store.last_committed_tx();
        if tx_id <= last {
            tracing::debug!(tx_id, last, "skipping already applied transaction");
            return Ok(());
        }
        if tx_id != last + 1 {
            return Err(Error::TxGap {
                resource: GRAPH_SOURCE.to_string(),
                last,
                got: tx_id,
            });
        }

        // The follower writes the same log records the primary did,
        // under the id the primary assigned.
        let local = self.log.begin();
        self.log.prepare(local, commands)?;
        self.log.commit(local, tx_id, epoch)?;
        self.apply_bytes(commands)?;
        self.log.done(local)?;
        self.store.set_last_committed_tx(tx_id);
        self.store.set_primary_epoch(epoch);
        Ok(())
    }

    fn extract(&self, from_tx_id: u64) -> Result<Vec<CommittedTx>> {
        self.log.extract(from_tx_id, self.store.last_committed_tx())
    }

    fn master_epoch_for(&self, tx_id: u64) -> Result<u32> {
        self.log.master_epoch_for(tx_id)
    }

    fn prune_history(&self, applied_everywhere: u64) -> Result<usize> {
        self.log.prune(applied_everywhere)
    }

    fn flush(&self) -> Result<()> {
        self.log.force()?;
        self.store.flush_all()
    }

    fn close(&self) -> Result<()> {
        self.log.force()?;
        self.store.close()
    }

    fn snapshot_files(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut files = self.store.files()?;
        files.extend(self.log.active_files());
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::record::{NodeRecord, Record};
    use crate::store::{IdKind, StoreId};
    use tempfile::tempdir;

    fn node_command(store: &GraphStore) -> (u32, Vec<u8>) {
        let id = store.allocator(IdKind::Node).allocate();
        let cmd = Command::Node {
            id,
            before: NodeRecord::unused(),
            after: NodeRecord {
                in_use: true,
                first_rel: crate::store::record::NO_REFERENCE,
                first_prop: crate::store::record::NO_REFERENCE,
            },
        };
        (id, bincode::serialize(&cmd).unwrap())
    }

    fn open_source(dir: &std::path::Path) -> GraphDataSource {
        let store = if StorePaths::new(dir).is_empty_store() {
            Arc::new(GraphStore::create(dir, StoreId::new(), false).unwrap())
        } else {
            Arc::new(GraphStore::open(dir, false).unwrap())
        };
        GraphDataSource::open(store, dir, true, 1 << 20).unwrap()
    }

    use crate::store::StorePaths;

    #[test]
    fn commit_cycle_advances_watermark() {
        let dir = tempdir().unwrap();
        let source = open_source(dir.path());

        let (node_id, cmd) = node_command(source.store());
        let local = source.tx_begin().unwrap();
        source.tx_prepare(local, std::slice::from_ref(&cmd)).unwrap();
        source.tx_commit(local, 1, 1, &[cmd]).unwrap();

        assert_eq!(source.last_committed_tx_id(), 1);
        assert!(source.store().node(node_id).unwrap().in_use);
        assert_eq!(source.master_epoch_for(1).unwrap(), 1);
    }

    #[test]
    fn apply_refuses_gaps_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let source = open_source(dir.path());

        let (_, cmd1) = node_command(source.store());
        let (_, cmd3) = node_command(source.store());

        source.apply_committed(1, 1, std::slice::from_ref(&cmd1)).unwrap();

        // Gap: 3 after 1 must fail
        let err = source
            .apply_committed(3, 1, std::slice::from_ref(&cmd3))
            .unwrap_err();
        assert!(matches!(err, Error::TxGap { last: 1, got: 3, .. }));

        // Replay of 1 is a no-op
        source.apply_committed(1, 1, &[cmd1]).unwrap();
        assert_eq!(source.last_committed_tx_id(), 1);
    }

    #[test]
    fn extract_round_trips_through_apply() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let a = open_source(dir_a.path());

        // B is created from the same store id, as a copy would be
        let store_b = Arc::new(
            GraphStore::create(dir_b.path(), a.store().store_id(), false).unwrap(),
        );
        let b = GraphDataSource::open(store_b, dir_b.path(), true, 1 << 20).unwrap();

        for tx_id in 1..=3 {
            let (_, cmd) = node_command(a.store());
            let local = a.tx_begin().unwrap();
            a.tx_prepare(local, std::slice::from_ref(&cmd)).unwrap();
            a.tx_commit(local, tx_id, 1, &[cmd]).unwrap();
        }

        for tx in a.extract(1).unwrap() {
            b.apply_committed(tx.tx_id, tx.primary_epoch, &tx.commands)
                .unwrap();
        }
        assert_eq!(b.last_committed_tx_id(), 3);
        assert_eq!(b.store().node_high_id(), a.store().node_high_id());
    }

    #[test]
    fn crash_between_commit_and_done_is_redone() {
        let dir = tempdir().unwrap();
        let store_id;
        {
            let source = open_source(dir.path());
            store_id = source.store().store_id();
            let (_, cmd) = node_command(source.store());
            let local = source.tx_begin().unwrap();
            source.tx_prepare(local, std::slice::from_ref(&cmd)).unwrap();
            // Simulate the crash window: COMMIT hits the log but the
            // store apply and DONE never happen
            source.log.commit(local, 1, 1).unwrap();
            source.store().close().unwrap();
        }

        let store = Arc::new(GraphStore::open(dir.path(), false).unwrap());
        assert_eq!(store.store_id(), store_id);
        let source = GraphDataSource::open(store, dir.path(), true, 1 << 20).unwrap();
        // Recovery redid the transaction
        assert_eq!(source.last_committed_tx_id(), 1);
        assert!(source.store().node(0).unwrap().in_use);
    }
}
