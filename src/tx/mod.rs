//! Transaction Coordinator
//!
//! Two-phase commit across the registered data sources. A transaction
//! handle is bound to the thread that began it; commit runs
//! synchronously on that thread. On a primary, commit assigns global
//! transaction ids locally; on a follower, the accumulated command
//! streams are forwarded through a remote commit hook and the returned
//! apply stream is applied through the local sources.

pub mod locks;

pub use locks::{LockManager, LockResource};

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::{Mutex, RwLock};

use crate::datasource::{DataSource, DataSourceRegistry};
use crate::error::{Error, Result};
use crate::log::CommittedTx;

/// Lock acquisition strategy: local tables on a primary, primary-backed
/// on a follower
pub trait Locks: Send + Sync {
    fn acquire_shared(&self, tx: u64, resource: LockResource) -> Result<()>;
    fn acquire_exclusive(&self, tx: u64, resource: LockResource) -> Result<()>;
    fn release_all(&self, tx: u64) -> Result<()>;
}

impl Locks for LockManager {
    fn acquire_shared(&self, tx: u64, resource: LockResource) -> Result<()> {
        LockManager::acquire_shared(self, tx, resource)
    }

    fn acquire_exclusive(&self, tx: u64, resource: LockResource) -> Result<()> {
        LockManager::acquire_exclusive(self, tx, resource)
    }

    fn release_all(&self, tx: u64) -> Result<()> {
        LockManager::release_all(self, tx);
        Ok(())
    }
}

/// Result of forwarding a commit to the primary
#[derive(Debug)]
pub struct RemoteCommitResponse {
    /// `(resource, tx_id, epoch)` assigned to this transaction
    pub assigned: Vec<(String, u64, u32)>,
    /// Every transaction the follower must apply, in order: history it
    /// was missing followed by the forwarded transaction itself
    pub apply: Vec<(String, CommittedTx)>,
}

/// Follower-side commit forwarding
pub trait RemoteCommitHook: Send + Sync {
    fn commit_remote(&self, streams: &[(String, Vec<Vec<u8>>)]) -> Result<RemoteCommitResponse>;
}

/// A transaction bound to its originating thread
pub struct TxHandle {
    id: u64,
    thread: ThreadId,
}

impl TxHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn check_thread(&self) -> Result<()> {
        if std::thread::current().id() != self.thread {
            return Err(Error::Transaction(
                "transaction used from a thread other than its owner".into(),
            ));
        }
        Ok(())
    }
}

/// The transaction coordinator of one engine instance
pub struct TxManager {
    registry: DataSourceRegistry,
    locks: Arc<dyn Locks>,
    next_handle: AtomicU64,
    /// Epoch stamped into locally assigned commits
    epoch: AtomicU32,
    /// Serializes commits: the total order per resource
    commit_latch: Mutex<()>,
    /// Present on followers; commits forward through it
    remote: RwLock<Option<Arc<dyn RemoteCommitHook>>>,
}

impl TxManager {
    pub fn new(registry: DataSourceRegistry, locks: Arc<dyn Locks>) -> Self {
        Self {
            registry,
            locks,
            next_handle: AtomicU64::new(1),
            epoch: AtomicU32::new(1),
            commit_latch: Mutex::new(()),
            remote: RwLock::new(None),
        }
    }

    pub fn registry(&self) -> &DataSourceRegistry {
        &self.registry
    }

    pub fn locks(&self) -> &Arc<dyn Locks> {
        &self.locks
    }

    /// The epoch stamped into commits assigned by this node
    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn set_epoch(&self, epoch: u32) {
        self.epoch.store(epoch, Ordering::SeqCst);
    }

    /// Install or clear the follower commit hook
    pub fn set_remote_hook(&self, hook: Option<Arc<dyn RemoteCommitHook>>) {
        *self.remote.write() = hook;
    }

    /// Begin a transaction on the calling thread
    pub fn begin(&self) -> TxHandle {
        TxHandle {
            id: self.next_handle.fetch_add(1, Ordering::SeqCst),
            thread: std::thread::current().id(),
        }
    }

    /// Commit: two-phase over the enlisted sources, or a forwarded
    /// commit when this node is a follower. `streams` pairs each
    /// enlisted source name with its serialized command list, in
    /// registry order.
    pub fn commit(
        &self,
        handle: &TxHandle,
        streams: Vec<(String, Vec<Vec<u8>>)>,
    ) -> Result<Vec<(String, u64)>> {
        handle.check_thread()?;
        let result = if streams.iter().all(|(_, cmds)| cmds.is_empty()) {
            Ok(Vec::new())
        } else {
            let remote = self.remote.read().clone();
            match remote {
                Some(hook) => self.commit_forwarded(&streams, hook),
                None => self.commit_local(&streams).map(|assigned| {
                    assigned
                        .into_iter()
                        .map(|(name, tx_id, _)| (name, tx_id))
                        .collect()
                }),
            }
        };
        self.locks.release_all(handle.id)?;
        result
    }

    /// Commit a command stream that arrived from a follower. Refused
    /// when this node is itself a follower.
    pub fn commit_replicated(
        &self,
        streams: &[(String, Vec<Vec<u8>>)],
    ) -> Result<Vec<(String, u64, u32)>> {
        if self.remote.read().is_some() {
            return Err(Error::NoPrimary);
        }
        self.commit_local(streams)
    }

    fn commit_local(&self, streams: &[(String, Vec<Vec<u8>>)]) -> Result<Vec<(String, u64, u32)>> {
        let _latch = self.commit_latch.lock();
        let epoch = self.epoch();

        // Phase one, registry order
        let mut prepared: Vec<(Arc<dyn DataSource>, u32)> = Vec::new();
        for source in self.registry.iter() {
            let stream = match streams
                .iter()
                .find(|(name, cmds)| name == source.name() && !cmds.is_empty())
            {
                Some((_, cmds)) => cmds,
                None => continue,
            };
            let local = source.tx_begin()?;
            if let Err(e) = source.tx_prepare(local, stream) {
                tracing::warn!(source = source.name(), error = %e, "prepare failed, rolling back");
                source.tx_rollback(local, false).ok();
                for (src, lcl) in &prepared {
                    src.tx_rollback(*lcl, true).ok();
                }
                return Err(e);
            }
            prepared.push((source.clone(), local));
        }

        // Phase two: graph store first, then secondary sources, so a
        // crash in between leaves the index rebuildable from the graph
        let mut assigned = Vec::with_capacity(prepared.len());
        for (source, local) in &prepared {
            let stream = streams
                .iter()
                .find(|(name, _)| name == source.name())
                .map(|(_, cmds)| cmds.as_slice())
                .expect("prepared source has a stream");
            let tx_id = source.last_committed_tx_id() + 1;
            source.tx_commit(*local, tx_id, epoch, stream)?;
            assigned.push((source.name().to_string(), tx_id, epoch));
        }
        Ok(assigned)
    }

    fn commit_forwarded(
        &self,
        streams: &[(String, Vec<Vec<u8>>)],
        hook: Arc<dyn RemoteCommitHook>,
    ) -> Result<Vec<(String, u64)>> {
        let response = hook.commit_remote(streams)?;

        // The stream includes missing history first; gap refusal in
        // apply_committed keeps us honest about ordering.
        let _latch = self.commit_latch.lock();
        apply_stream(&self.registry, &response.apply)?;

        Ok(response
            .assigned
            .into_iter()
            .map(|(name, tx_id, _)| (name, tx_id))
            .collect())
    }

    /// Apply a pulled stream of committed transactions under the commit
    /// latch, so it never interleaves with a forwarded commit
    pub fn apply_remote(&self, transactions: &[(String, CommittedTx)]) -> Result<usize> {
        let _latch = self.commit_latch.lock();
        apply_stream(&self.registry, transactions)?;
        Ok(transactions.len())
    }

    /// Roll back: discard buffered commands, release locks. Nothing was
    /// written, so no log force is needed.
    pub fn rollback(&self, handle: &TxHandle) -> Result<()> {
        handle.check_thread()?;
        self.locks.release_all(handle.id)
    }
}

/// Apply an ordered stream of `(resource, transaction)` pairs through
/// the registry. Used by forwarded commits, the update puller, and
/// store-copy seeding.
pub fn apply_stream(
    registry: &DataSourceRegistry,
    transactions: &[(String, CommittedTx)],
) -> Result<()> {
    for (resource, tx) in transactions {
        let source = registry.require(resource)?;
        source.apply_committed(tx.tx_id, tx.primary_epoch, &tx.commands)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::{GraphDataSource, GRAPH_SOURCE};
    use crate::store::record::{NodeRecord, Record};
    use crate::store::{Command, GraphStore, IdKind, StoreId};
    use tempfile::tempdir;

    fn build_manager(dir: &std::path::Path) -> (TxManager, Arc<GraphStore>) {
        let store = Arc::new(GraphStore::create(dir, StoreId::new(), false).unwrap());
        let source = GraphDataSource::open(store.clone(), dir, true, 1 << 20).unwrap();
        let mut registry = DataSourceRegistry::new();
        registry.register(Arc::new(source));
        let manager = TxManager::new(registry, Arc::new(LockManager::new()));
        (manager, store)
    }

    fn node_stream(store: &GraphStore) -> (u32, Vec<(String, Vec<Vec<u8>>)>) {
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
        (
            id,
            vec![(
                GRAPH_SOURCE.to_string(),
                vec![bincode::serialize(&cmd).unwrap()],
            )],
        )
    }

    #[test]
    fn local_commit_assigns_sequential_ids() {
        let dir = tempdir().unwrap();
        let (manager, store) = build_manager(dir.path());

        for expected in 1..=3u64 {
            let handle = manager.begin();
            let (_, streams) = node_stream(&store);
            let assigned = manager.commit(&handle, streams).unwrap();
            assert_eq!(assigned, vec![(GRAPH_SOURCE.to_string(), expected)]);
        }
    }

    #[test]
    fn empty_commit_writes_nothing() {
        let dir = tempdir().unwrap();
        let (manager, _) = build_manager(dir.path());
        let handle = manager.begin();
        let assigned = manager
            .commit(&handle, vec![(GRAPH_SOURCE.to_string(), vec![])])
            .unwrap();
        assert!(assigned.is_empty());
        let source = manager.registry().require(GRAPH_SOURCE).unwrap();
        assert_eq!(source.last_committed_tx_id(), 0);
    }

    #[test]
    fn commit_stamps_current_epoch() {
        let dir = tempdir().unwrap();
        let (manager, store) = build_manager(dir.path());
        manager.set_epoch(4);

        let handle = manager.begin();
        let (_, streams) = node_stream(&store);
        manager.commit(&handle, streams).unwrap();

        let source = manager.registry().require(GRAPH_SOURCE).unwrap();
        assert_eq!(source.master_epoch_for(1).unwrap(), 4);
    }

    #[test]
    fn handle_rejects_foreign_thread() {
        let dir = tempdir().unwrap();
        let (manager, store) = build_manager(dir.path());
        let manager = Arc::new(manager);

        let handle = manager.begin();
        let (_, streams) = node_stream(&store);

        let m = Arc::clone(&manager);
        let result = std::thread::spawn(move || m.commit(&handle, streams))
            .join()
            .unwrap();
        assert!(matches!(result, Err(Error::Transaction(_))));
    }
}
