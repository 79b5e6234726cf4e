//! Follower runtime
//!
//! Everything a follower swaps into the engine: an id assigner leasing
//! ranges from the primary, a lock strategy that takes primary-side
//! locks alongside local ones, the forwarded-commit hook, and the
//! background update puller.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::datasource::DataSourceRegistry;
use crate::db::IdAssigner;
use crate::error::{Error, Result};
use crate::rpc::protocol::FollowerContext;
use crate::rpc::PrimaryClient;
use crate::store::IdKind;
use crate::tx::{
    LockManager, LockResource, Locks, RemoteCommitHook, RemoteCommitResponse, TxManager,
};

/// Ids leased from the primary per refill
const ID_LEASE: u32 = 128;

/// A follower's connection to the current primary, with the state
/// needed to stamp every request with a fresh context
pub struct PrimaryHandle {
    client: PrimaryClient,
    machine_id: u32,
    primary_machine: u32,
    registry: Mutex<Option<DataSourceRegistry>>,
    events: AtomicU64,
    /// Flipped on communication failure so the supervisor re-elects
    failed: AtomicBool,
    /// Pokes the supervisor when a failure is first observed
    failure_notifier: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl PrimaryHandle {
    pub fn new(client: PrimaryClient, machine_id: u32, primary_machine: u32) -> Arc<Self> {
        Arc::new(Self {
            client,
            machine_id,
            primary_machine,
            registry: Mutex::new(None),
            events: AtomicU64::new(1),
            failed: AtomicBool::new(false),
            failure_notifier: Mutex::new(None),
        })
    }

    /// Install the supervisor's re-election nudge
    pub fn set_failure_notifier(&self, notifier: Box<dyn Fn() + Send + Sync>) {
        *self.failure_notifier.lock() = Some(notifier);
    }

    /// Wire in the engine's registry once it is open
    pub fn bind_registry(&self, registry: DataSourceRegistry) {
        *self.registry.lock() = Some(registry);
    }

    pub fn primary_machine(&self) -> u32 {
        self.primary_machine
    }

    pub fn client(&self) -> &PrimaryClient {
        &self.client
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn context(&self) -> FollowerContext {
        let event_id = self.events.fetch_add(1, Ordering::SeqCst);
        match &*self.registry.lock() {
            Some(registry) => super::follower_context(self.machine_id, event_id, registry),
            None => FollowerContext {
                follower_id: self.machine_id,
                event_id,
                last_applied: Vec::new(),
            },
        }
    }

    fn note_failure<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_retryable() && !self.failed.swap(true, Ordering::SeqCst) {
                tracing::warn!(
                    primary = self.primary_machine,
                    "communication with primary failed, dropping handle: {e}"
                );
                if let Some(notifier) = &*self.failure_notifier.lock() {
                    notifier();
                }
            }
        }
        result
    }

    /// Pull committed updates and apply them through `tx`
    pub fn pull_and_apply(&self, tx: &TxManager) -> Result<usize> {
        let context = self.context();
        let transactions = self.note_failure(self.client.pull_updates(&context))?;
        if transactions.is_empty() {
            return Ok(0);
        }
        let applied = tx.apply_remote(&transactions)?;
        tracing::debug!(applied, "pulled updates from primary");
        Ok(applied)
    }
}

/// Range-leasing id assigner; leases are dropped on epoch change
pub struct RemoteIdAssigner {
    handle: Arc<PrimaryHandle>,
    cache: Mutex<HashMap<IdKind, VecDeque<u32>>>,
}

impl RemoteIdAssigner {
    pub fn new(handle: Arc<PrimaryHandle>) -> Self {
        Self {
            handle,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl IdAssigner for RemoteIdAssigner {
    fn next(&self, kind: IdKind) -> Result<u32> {
        let mut cache = self.cache.lock();
        let pool = cache.entry(kind).or_default();
        if let Some(id) = pool.pop_front() {
            return Ok(id);
        }

        let context = self.handle.context();
        let (ranges, piggyback) = self
            .handle
            .note_failure(self.handle.client.allocate_ids(&context, kind, ID_LEASE))?;
        // Catch-up rides on the puller and the commit path; applying it
        // here would re-enter the sources mid-transaction
        drop(piggyback);
        for (start, len) in ranges {
            for id in start..start + len {
                pool.push_back(id);
            }
        }
        pool.pop_front()
            .ok_or_else(|| Error::Communication("primary returned an empty id lease".into()))
    }

    fn release(&self, kind: IdKind, id: u32) {
        self.cache.lock().entry(kind).or_default().push_front(id);
    }

    fn forget_leases(&self) {
        tracing::info!("dropping cached id leases");
        self.cache.lock().clear();
    }
}

/// Locks taken on the primary first, then locally, so two followers
/// cannot both think they own a record
pub struct SlaveLocks {
    local: Arc<LockManager>,
    handle: Arc<PrimaryHandle>,
    /// local transaction id → primary-side lock token
    tokens: Mutex<HashMap<u64, u64>>,
}

impl SlaveLocks {
    pub fn new(local: Arc<LockManager>, handle: Arc<PrimaryHandle>) -> Self {
        Self {
            local,
            handle,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    fn acquire_remote(&self, tx: u64, exclusive: bool, resource: LockResource) -> Result<()> {
        let existing = self.tokens.lock().get(&tx).copied();
        let context = self.handle.context();
        let (token, _) = self.handle.note_failure(self.handle.client.acquire_locks(
            &context,
            existing,
            exclusive,
            vec![resource],
        ))?;
        self.tokens.lock().insert(tx, token);
        Ok(())
    }
}

impl Locks for SlaveLocks {
    fn acquire_shared(&self, tx: u64, resource: LockResource) -> Result<()> {
        self.acquire_remote(tx, false, resource)?;
        self.local.acquire_shared(tx, resource)
    }

    fn acquire_exclusive(&self, tx: u64, resource: LockResource) -> Result<()> {
        self.acquire_remote(tx, true, resource)?;
        self.local.acquire_exclusive(tx, resource)
    }

    fn release_all(&self, tx: u64) -> Result<()> {
        self.local.release_all(tx);
        if let Some(token) = self.tokens.lock().remove(&tx) {
            let context = self.handle.context();
            if let Err(e) = self.handle.client.release_locks(&context, token) {
                // The primary drops the token with the session; losing
                // this call only delays that
                tracing::warn!("failed to release primary locks: {e}");
            }
        }
        Ok(())
    }
}

/// The forwarded-commit hook installed into the follower's TxManager
pub struct SlaveCommitHook {
    handle: Arc<PrimaryHandle>,
}

impl SlaveCommitHook {
    pub fn new(handle: Arc<PrimaryHandle>) -> Self {
        Self { handle }
    }
}

impl RemoteCommitHook for SlaveCommitHook {
    fn commit_remote(&self, streams: &[(String, Vec<Vec<u8>>)]) -> Result<RemoteCommitResponse> {
        let context = self.handle.context();
        self.handle.note_failure(self.handle.client.commit(&context, streams))
    }
}

/// Background thread polling the primary so follower reads stay fresh
pub struct UpdatePuller {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl UpdatePuller {
    pub fn start(handle: Arc<PrimaryHandle>, tx: Arc<TxManager>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("update-puller".into())
            .spawn(move || {
                tracing::info!(?interval, "update puller started");
                while !stop_flag.load(Ordering::Relaxed) {
                    std::thread::sleep(interval);
                    if stop_flag.load(Ordering::Relaxed) {
                        break;
                    }
                    match handle.pull_and_apply(&tx) {
                        Ok(0) => {}
                        Ok(n) => tracing::debug!(applied = n, "background pull"),
                        Err(e) => tracing::warn!("background pull failed: {e}"),
                    }
                }
                tracing::info!("update puller stopped");
            })
            .expect("spawn update-puller");
        Self {
            stop,
            thread: Some(thread),
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for UpdatePuller {
    fn drop(&mut self) {
        self.stop();
    }
}
