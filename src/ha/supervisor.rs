//! Lifecycle supervisor
//!
//! `ClusterGraphDb` keeps one node's embedded engine in the right shape
//! for the current cluster view: primary (local allocators and locks,
//! follower-facing server) or follower (remote allocators and locks,
//! forwarded commits). Transitions run under a single supervisor latch
//! with a watchdog; branched data is quarantined and refetched.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::watch;

use super::follower::{
    PrimaryHandle, RemoteIdAssigner, SlaveCommitHook, SlaveLocks, UpdatePuller,
};
use crate::broker::ClusterBroker;
use crate::config::AntlerConfig;
use crate::coord::{ClusterView, CoordinationService};
use crate::datasource::DataSource;
use crate::db::{EngineHooks, GraphDb, IdAssigner};
use crate::error::{Error, Result};
use crate::log::CommittedTx;
use crate::rpc::protocol::FollowerContext;
use crate::rpc::{PrimaryClient, PrimaryServer};
use crate::store::{StoreId, StorePaths};
use crate::tx::{apply_stream, LockManager};

/// How long an empty node keeps trying to join or found the cluster
const STARTUP_WINDOW: Duration = Duration::from_secs(10);

/// Pause between startup attempts
const STARTUP_RETRY: Duration = Duration::from_millis(300);

/// Attempts to fetch a fresh store after quarantining a branched one
const REFETCH_ATTEMPTS: u32 = 10;

enum Role {
    Idle,
    Primary {
        server_stop: watch::Sender<bool>,
    },
    Follower {
        handle: Arc<PrimaryHandle>,
        ids: Arc<RemoteIdAssigner>,
        puller: Option<UpdatePuller>,
    },
}

impl Role {
    fn name(&self) -> &'static str {
        match self {
            Role::Idle => "idle",
            Role::Primary { .. } => "primary",
            Role::Follower { .. } => "follower",
        }
    }
}

/// Aborts the process when a role transition wedges
struct Watchdog {
    done: Arc<AtomicBool>,
}

impl Watchdog {
    fn arm(timeout: Duration, what: &'static str) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        std::thread::Builder::new()
            .name("transition-watchdog".into())
            .spawn(move || {
                std::thread::sleep(timeout);
                if !flag.load(Ordering::SeqCst) {
                    tracing::error!("{what} did not complete within {timeout:?}, aborting");
                    std::process::abort();
                }
            })
            .expect("spawn transition-watchdog");
        Self { done }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
    }
}

/// A highly available graph database node
pub struct ClusterGraphDb {
    config: AntlerConfig,
    broker: Arc<ClusterBroker>,
    runtime: tokio::runtime::Runtime,
    /// The supervisor latch: one role transition at a time, and it also
    /// gates who reads a consistent (role, view) pair
    role: Mutex<Role>,
    engine: RwLock<Option<Arc<GraphDb>>>,
    last_view: Mutex<Option<ClusterView>>,
    cause_of_shutdown: Mutex<Option<String>>,
    stop: Arc<AtomicBool>,
    /// Bumped by follower components on communication failure so the
    /// watcher reevaluates without waiting for a view change
    reelect_nudge: watch::Sender<u64>,
    /// Consecutive transient failures; exhausting the budget is fatal
    retry_failures: AtomicU32,
}

impl ClusterGraphDb {
    /// Boot a cluster node: join, copy or found the store when the
    /// directory is empty, then take the role the view dictates
    pub fn open(
        mut config: AntlerConfig,
        coordination: Arc<dyn CoordinationService>,
    ) -> Result<Arc<Self>> {
        // Replication replays history; rotated logs must be retained
        config.store.keep_logical_logs = true;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("antler-cluster")
            .enable_all()
            .build()?;

        let broker = Arc::new(ClusterBroker::new(
            config.node.machine_id,
            config.ha_server(),
            config.node.backup_slave,
            coordination,
        ));

        let (reelect_nudge, _) = watch::channel(0);
        let node = Arc::new(Self {
            config,
            broker,
            runtime,
            role: Mutex::new(Role::Idle),
            engine: RwLock::new(None),
            last_view: Mutex::new(None),
            cause_of_shutdown: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
            reelect_nudge,
            retry_failures: AtomicU32::new(0),
        });

        node.startup()?;
        node.spawn_view_watcher();
        Ok(node)
    }

    fn machine_id(&self) -> u32 {
        self.config.node.machine_id
    }

    fn store_dir(&self) -> &Path {
        self.config.store_dir()
    }

    // ── Startup ────────────────────────────────────────

    fn startup(self: &Arc<Self>) -> Result<()> {
        self.broker.join()?;

        let paths = StorePaths::new(self.store_dir());
        if paths.is_empty_store() {
            self.acquire_initial_store()?;
        }

        match self.reevaluate() {
            Ok(()) => Ok(()),
            Err(Error::BranchedData(reason)) => {
                tracing::warn!(%reason, "branched data at startup, refetching store");
                self.quarantine_and_refetch()?;
                self.reevaluate()
            }
            Err(e) => Err(e),
        }
    }

    /// Empty directory: copy from a live primary, or found the cluster
    /// when allowed
    fn acquire_initial_store(&self) -> Result<()> {
        let deadline = Instant::now() + STARTUP_WINDOW;
        let mut last_error: Option<Error> = None;

        while Instant::now() < deadline {
            let view = self.broker.current_view()?;
            match view.primary {
                Some((_, ref primary)) if primary.machine_id != self.machine_id() => {
                    let store_id = self
                        .broker
                        .cluster_store_id()?
                        .ok_or_else(|| Error::Coordination("primary without store id".into()))?;
                    match self.copy_store_from(&primary.ha_address, store_id) {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            tracing::warn!("problems copying store from primary: {e}");
                            last_error = Some(e);
                        }
                    }
                }
                _ if self.config.cluster.allow_init_cluster && !self.config.node.read_only => {
                    let minted = StoreId::new();
                    let agreed = self.broker.create_cluster(minted)?;
                    if agreed == minted {
                        tracing::info!(store_id = %minted, "founding new cluster");
                        return Ok(());
                    }
                    // Someone else's store won; wait for them to serve
                    last_error = Some(Error::NoPrimary);
                }
                _ => last_error = Some(Error::NoPrimary),
            }
            std::thread::sleep(STARTUP_RETRY);
        }

        Err(Error::TransitionFailed(format!(
            "could not join or initialize the cluster: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Stream a full copy from `address` into the store directory and
    /// seed the watermarks from the log tail
    fn copy_store_from(&self, address: &str, store_id: StoreId) -> Result<()> {
        tracing::info!(%address, "copying store from primary");
        let client = PrimaryClient::new(
            address.to_string(),
            store_id,
            self.config.rpc_timeout(),
        );
        let context = FollowerContext {
            follower_id: self.machine_id(),
            event_id: 0,
            last_applied: Vec::new(),
        };
        let tail = client.copy_store(&context, self.store_dir())?;

        // Open the copy once to run recovery and apply the tail, the
        // way any fresh engine would
        let engine = GraphDb::open(
            self.store_dir(),
            &self.config,
            Some(store_id),
            EngineHooks::default(),
        )?;
        seed_from_tail(&engine, &tail)?;
        engine.shutdown()?;
        tracing::info!("done copying store from primary");
        Ok(())
    }

    // ── Role transitions ───────────────────────────────

    /// Re-read the view and reconfigure this node to match it
    fn reevaluate(self: &Arc<Self>) -> Result<()> {
        let mut role = self.role.lock();
        let _watchdog = Watchdog::arm(self.config.transition_timeout(), "role transition");

        let view = self.broker.force_reelect()?;
        let epoch_changed = {
            let last = self.last_view.lock();
            last.as_ref().map(|v| v.epoch) != Some(view.epoch)
        };
        let i_am_primary = view.primary_machine() == Some(self.machine_id());

        tracing::info!(
            machine = self.machine_id(),
            epoch = view.epoch,
            primary = ?view.primary_machine(),
            current_role = role.name(),
            "reevaluating role"
        );

        enum Move {
            StayPrimary,
            StayFollower,
            BecomePrimary,
            BecomeFollower,
        }

        let decision = match (&*role, i_am_primary) {
            (Role::Primary { .. }, true) => Move::StayPrimary,
            (Role::Follower { handle, .. }, false)
                if view.primary_machine() == Some(handle.primary_machine())
                    && !handle.has_failed() =>
            {
                Move::StayFollower
            }
            (_, true) => Move::BecomePrimary,
            (_, false) => Move::BecomeFollower,
        };

        match decision {
            Move::StayPrimary => {
                if let Some(engine) = self.engine.read().as_ref() {
                    engine.tx_manager().set_epoch(view.epoch);
                }
                self.broker.rebind_primary()?;
            }
            Move::StayFollower => {
                if epoch_changed {
                    // Same primary, new reign: cached leases are void
                    if let Role::Follower { ids, .. } = &*role {
                        ids.forget_leases();
                    }
                    if let Some(engine) = self.engine.read().as_ref() {
                        engine.tx_manager().set_epoch(view.epoch);
                    }
                }
            }
            Move::BecomePrimary => {
                self.teardown(&mut role);
                self.start_as_primary(&mut role, &view)?;
            }
            Move::BecomeFollower => {
                self.teardown(&mut role);
                self.start_as_follower(&mut role, &view)?;
            }
        }

        *self.last_view.lock() = Some(view);
        Ok(())
    }

    fn cluster_store_id_or_claim(&self, local: Option<StoreId>) -> Result<StoreId> {
        if let Some(id) = self.broker.cluster_store_id()? {
            return Ok(id);
        }
        match local {
            Some(id) => self.broker.create_cluster(id),
            None => Err(Error::Coordination("cluster has no store id".into())),
        }
    }

    fn local_store_id(&self) -> Option<StoreId> {
        let paths = StorePaths::new(self.store_dir());
        if paths.is_empty_store() {
            return None;
        }
        crate::store::MetadataStore::open(&paths.metadata())
            .ok()
            .map(|meta| meta.store_id())
    }

    fn start_as_primary(self: &Arc<Self>, role: &mut Role, view: &ClusterView) -> Result<()> {
        tracing::info!(machine = self.machine_id(), "starting as primary");
        let store_id = self.cluster_store_id_or_claim(self.local_store_id())?;

        let engine = Arc::new(GraphDb::open(
            self.store_dir(),
            &self.config,
            Some(store_id),
            EngineHooks::default(),
        )?);
        self.verify_store_identity(&engine, store_id)?;
        engine.tx_manager().set_epoch(view.epoch);

        let server = PrimaryServer::new(
            self.config.ha_server(),
            engine.store().clone(),
            engine.tx_manager().clone(),
            engine.lock_tables().clone(),
        );
        let (server_stop, stop_rx) = watch::channel(false);
        self.runtime.spawn(async move {
            if let Err(e) = server.run(stop_rx).await {
                tracing::error!("primary server failed: {e}");
            }
        });

        *self.engine.write() = Some(engine);
        *role = Role::Primary { server_stop };
        self.broker.rebind_primary()?;
        tracing::info!(machine = self.machine_id(), epoch = view.epoch, "started as primary");
        Ok(())
    }

    fn start_as_follower(self: &Arc<Self>, role: &mut Role, view: &ClusterView) -> Result<()> {
        let (primary_machine, primary_address) = match &view.primary {
            Some((_, m)) => (m.machine_id, m.ha_address.clone()),
            None => return Err(Error::NoPrimary),
        };
        tracing::info!(
            machine = self.machine_id(),
            primary = primary_machine,
            "starting as follower"
        );

        let store_id = self.cluster_store_id_or_claim(self.local_store_id())?;
        let client = PrimaryClient::new(primary_address, store_id, self.config.rpc_timeout());
        let handle = PrimaryHandle::new(client, self.machine_id(), primary_machine);
        let nudge = self.reelect_nudge.clone();
        handle.set_failure_notifier(Box::new(move || {
            nudge.send_modify(|v| *v += 1);
        }));

        let ids = Arc::new(RemoteIdAssigner::new(Arc::clone(&handle)));
        let hooks = EngineHooks {
            locks: Some(Arc::new(SlaveLocks::new(
                Arc::new(LockManager::new()),
                Arc::clone(&handle),
            ))),
            ids: Some(ids.clone() as Arc<dyn IdAssigner>),
            remote_commit: Some(Arc::new(SlaveCommitHook::new(Arc::clone(&handle)))),
        };

        let engine = Arc::new(GraphDb::open(
            self.store_dir(),
            &self.config,
            Some(store_id),
            hooks,
        )?);
        self.verify_store_identity(&engine, store_id)?;
        handle.bind_registry(engine.registry().clone());

        self.verify_not_branched(&handle, &engine)?;
        engine.tx_manager().set_epoch(view.epoch);

        // Catch up before serving reads
        match handle.pull_and_apply(engine.tx_manager()) {
            Ok(_) => {}
            Err(Error::LogPruned { .. }) => {
                // Too far behind for incremental catch-up; only a full
                // copy can close the gap
                return Err(Error::BranchedData(
                    "primary no longer retains this node's delta".into(),
                ));
            }
            Err(e) => tracing::warn!("initial catch-up failed: {e}"),
        }

        let puller = self.config.pull_interval().map(|interval| {
            UpdatePuller::start(
                Arc::clone(&handle),
                engine.tx_manager().clone(),
                interval,
            )
        });

        *self.engine.write() = Some(engine);
        *role = Role::Follower { handle, ids, puller };
        tracing::info!(machine = self.machine_id(), epoch = view.epoch, "started as follower");
        Ok(())
    }

    fn verify_store_identity(&self, engine: &GraphDb, expected: StoreId) -> Result<()> {
        if engine.store_id() != expected {
            return Err(Error::StoreIdMismatch {
                local: engine.store_id().to_string(),
                remote: expected.to_string(),
            });
        }
        Ok(())
    }

    /// Compare history with the primary at the highest common
    /// transaction per resource; divergence is branched data
    fn verify_not_branched(&self, handle: &PrimaryHandle, engine: &GraphDb) -> Result<()> {
        let remote_marks = handle.client().watermarks(&handle.context())?;

        for source in engine.registry().iter() {
            let local_last = source.last_committed_tx_id();
            if local_last == 0 {
                continue;
            }
            let primary_last = match remote_marks
                .iter()
                .find(|(name, _)| name == source.name())
            {
                Some((_, last)) => *last,
                None => continue,
            };

            if local_last > primary_last {
                return Err(Error::BranchedData(format!(
                    "{} has {local_last} locally but the primary only has {primary_last}",
                    source.name()
                )));
            }

            let common = local_last.min(primary_last);
            if common == 0 {
                continue;
            }
            let local_epoch = match source.master_epoch_for(common) {
                Ok(epoch) => epoch,
                Err(Error::LogPruned { .. }) => {
                    // A freshly copied store may lack the log for its
                    // own watermark; nothing to compare against
                    tracing::info!(
                        resource = source.name(),
                        tx = common,
                        "no local epoch history, skipping branch check"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            let remote_epoch =
                handle
                    .client()
                    .master_epoch_for(&handle.context(), source.name(), common)?;

            if local_epoch != remote_epoch {
                return Err(Error::BranchedData(format!(
                    "{}@{common} committed under epoch {local_epoch} here, \
                     epoch {remote_epoch} on the primary",
                    source.name()
                )));
            }
            tracing::debug!(
                resource = source.name(),
                tx = common,
                epoch = local_epoch,
                "history agrees with primary"
            );
        }
        Ok(())
    }

    /// Move the local store to `broken-<timestamp>/` and fetch a fresh
    /// copy from the primary
    fn quarantine_and_refetch(&self) -> Result<()> {
        {
            let mut role = self.role.lock();
            self.teardown(&mut role);
        }

        let dir = self.store_dir();
        let broken = dir.join(format!(
            "broken-{}",
            chrono::Utc::now().timestamp_millis()
        ));
        std::fs::create_dir_all(&broken)?;
        tracing::warn!(quarantine = %broken.display(), "moving branched store aside");

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if name_str == "messages.log" || name_str.starts_with("broken-") {
                continue;
            }
            std::fs::rename(entry.path(), broken.join(&name))?;
        }

        let mut last_error = None;
        for attempt in 1..=REFETCH_ATTEMPTS {
            let view = self.broker.force_reelect()?;
            let result = match &view.primary {
                Some((_, primary)) if primary.machine_id != self.machine_id() => {
                    let store_id = self
                        .broker
                        .cluster_store_id()?
                        .ok_or_else(|| Error::Coordination("cluster has no store id".into()))?;
                    self.copy_store_from(&primary.ha_address, store_id)
                }
                _ => Err(Error::NoPrimary),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, "problems copying store from primary: {e}");
                    last_error = Some(e);
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
        Err(last_error.unwrap_or(Error::NoPrimary))
    }

    fn teardown(&self, role: &mut Role) {
        match std::mem::replace(role, Role::Idle) {
            Role::Idle => {}
            Role::Primary { server_stop } => {
                tracing::info!("stopping primary server");
                let _ = server_stop.send(true);
            }
            Role::Follower { mut puller, .. } => {
                if let Some(puller) = puller.as_mut() {
                    puller.stop();
                }
            }
        }
        if let Some(engine) = self.engine.write().take() {
            if let Err(e) = engine.shutdown() {
                tracing::warn!("engine shutdown error: {e}");
            }
        }
    }

    // ── View watching ──────────────────────────────────

    fn spawn_view_watcher(self: &Arc<Self>) {
        let node = Arc::clone(self);
        std::thread::Builder::new()
            .name("view-watcher".into())
            .spawn(move || {
                let mut views = node.broker.subscribe();
                let mut nudges = node.reelect_nudge.subscribe();
                loop {
                    let alive = node.runtime.block_on(async {
                        tokio::select! {
                            changed = views.changed() => changed.is_ok(),
                            changed = nudges.changed() => changed.is_ok(),
                        }
                    });
                    if node.stop.load(Ordering::SeqCst) || !alive {
                        break;
                    }
                    node.on_view_change();
                }
            })
            .expect("spawn view-watcher");
    }

    fn on_view_change(self: &Arc<Self>) {
        if self.stop.load(Ordering::SeqCst) {
            return;
        }
        match self.reevaluate() {
            Ok(()) => {
                self.retry_failures.store(0, Ordering::SeqCst);
            }
            Err(Error::BranchedData(reason)) => {
                tracing::warn!(%reason, "branched data detected, quarantining store");
                let outcome = self
                    .quarantine_and_refetch()
                    .and_then(|_| self.reevaluate());
                if let Err(e) = outcome {
                    self.fatal(format!("unrecoverable branched data: {e}"));
                }
            }
            Err(e) if e.is_retryable() => {
                let failures = self.retry_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures > self.config.cluster.retry_budget {
                    self.fatal(format!("lost cluster quorum beyond retry budget: {e}"));
                    return;
                }
                let base = self
                    .config
                    .cluster
                    .retry_backoff_ms
                    .saturating_mul(1 << failures.min(6));
                // Jitter keeps concurrently retrying followers from
                // hitting the primary in lockstep
                let jitter = rand::thread_rng().gen_range(0..=base / 2);
                let backoff = Duration::from_millis(base + jitter);
                tracing::warn!(failures, ?backoff, "role reevaluation failed, retrying: {e}");
                let nudge = self.reelect_nudge.clone();
                let stop = Arc::clone(&self.stop);
                std::thread::spawn(move || {
                    std::thread::sleep(backoff);
                    if !stop.load(Ordering::SeqCst) {
                        nudge.send_modify(|v| *v += 1);
                    }
                });
            }
            Err(e) => self.fatal(format!("role reevaluation failed: {e}")),
        }
    }

    fn fatal(&self, cause: String) {
        tracing::error!(%cause, "shutting down node");
        *self.cause_of_shutdown.lock() = Some(cause);
        let mut role = self.role.lock();
        self.teardown(&mut role);
    }

    // ── Public surface ─────────────────────────────────

    /// The live engine. During a role swap new callers wait a bounded
    /// time for the next configuration; a recorded cause of shutdown is
    /// surfaced immediately.
    pub fn engine(&self) -> Result<Arc<GraphDb>> {
        let deadline = Instant::now() + self.config.rpc_timeout();
        loop {
            if let Some(engine) = self.engine.read().as_ref() {
                return Ok(Arc::clone(engine));
            }
            if let Some(cause) = self.cause_of_shutdown.lock().clone() {
                return Err(Error::ShutDown(cause));
            }
            if self.stop.load(Ordering::SeqCst) || Instant::now() >= deadline {
                return Err(Error::ShutDown(
                    "engine not assigned, role swap in progress".into(),
                ));
            }
            std::thread::sleep(Duration::from_millis(25));
        }
    }

    /// Whether this node is the elected primary
    pub fn is_primary(&self) -> bool {
        self.broker.i_am_primary().unwrap_or(false)
    }

    /// The epoch of the current view as this node last saw it
    pub fn current_epoch(&self) -> u32 {
        self.last_view.lock().as_ref().map(|v| v.epoch).unwrap_or(0)
    }

    /// Pull committed updates from the primary right now
    pub fn pull_updates(&self) -> Result<usize> {
        let role = self.role.lock();
        match &*role {
            Role::Follower { handle, .. } => {
                let handle = Arc::clone(handle);
                let engine = self.engine()?;
                drop(role);
                handle.pull_and_apply(engine.tx_manager())
            }
            Role::Primary { .. } => Ok(0),
            Role::Idle => Err(Error::ShutDown("no role assigned".into())),
        }
    }

    /// Clean shutdown: leave the cluster, stop serving, close the store
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let mut role = self.role.lock();
        self.teardown(&mut role);
        drop(role);
        if let Err(e) = self.broker.leave() {
            tracing::debug!("leave on shutdown: {e}");
        }
        // Wake the watcher so it observes the stop flag
        self.reelect_nudge.send_modify(|v| *v += 1);
    }
}

impl Drop for ClusterGraphDb {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Apply a copy-stream tail: the first transaction seen for a resource
/// pins its watermark just below, then everything applies in order
fn seed_from_tail(engine: &GraphDb, tail: &[(String, CommittedTx)]) -> Result<()> {
    let mut visited: std::collections::HashSet<&str> = std::collections::HashSet::new();
    for (resource, tx) in tail {
        if visited.insert(resource.as_str()) {
            let source = engine.registry().require(resource)?;
            source.set_last_committed_tx_id(tx.tx_id - 1)?;
        }
    }
    apply_stream(engine.registry(), tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryCore;
    use crate::datasource::GRAPH_SOURCE;
    use crate::store::PropertyValue;
    use tempfile::TempDir;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn node_config(machine_id: u32, dir: &Path, port: u16) -> AntlerConfig {
        let mut config = AntlerConfig::from_toml(&format!(
            "[node]\nmachine_id = {machine_id}\n[store]\nuse_memory_mapped_buffers = false\n"
        ))
        .unwrap();
        config.node.store_dir = dir.to_path_buf();
        config.node.ha_server = Some(format!("127.0.0.1:{port}"));
        config
    }

    fn open_node(
        core: &Arc<MemoryCore>,
        machine_id: u32,
        dir: &Path,
        port: u16,
    ) -> Result<Arc<ClusterGraphDb>> {
        ClusterGraphDb::open(node_config(machine_id, dir, port), Arc::new(core.session()))
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(15);
        while Instant::now() < deadline {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("timed out waiting for {what}");
    }

    fn graph_last(node: &ClusterGraphDb) -> u64 {
        node.engine()
            .unwrap()
            .registry()
            .require(GRAPH_SOURCE)
            .unwrap()
            .last_committed_tx_id()
    }

    #[test]
    fn bootstrap_then_follower_joins_by_copy() {
        let core = Arc::new(MemoryCore::new());
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();

        let a = open_node(&core, 1, dir_a.path(), free_port()).unwrap();
        assert!(a.is_primary());
        assert_eq!(a.current_epoch(), 1);

        let engine_a = a.engine().unwrap();
        let tx = engine_a.begin_tx().unwrap();
        let x = tx.create_node().unwrap();
        tx.set_node_property(x, "name", PropertyValue::Str("alice".into()))
            .unwrap();
        tx.index_add("name", "alice", x).unwrap();
        tx.commit().unwrap();

        let b = open_node(&core, 2, dir_b.path(), free_port()).unwrap();
        assert!(!b.is_primary());
        assert!(a.is_primary());

        // B copied the store and sees X
        let engine_b = b.engine().unwrap();
        assert!(engine_b.node_exists(x).unwrap());
        assert_eq!(
            engine_b.node_property(x, "name").unwrap(),
            Some(PropertyValue::Str("alice".into()))
        );
        assert_eq!(engine_b.index_get("name", "alice"), vec![x]);
        assert_eq!(engine_b.store_id(), engine_a.store_id());

        b.shutdown();
        a.shutdown();
    }

    #[test]
    fn follower_write_round_trips_through_primary() {
        let core = Arc::new(MemoryCore::new());
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();

        let a = open_node(&core, 1, dir_a.path(), free_port()).unwrap();
        {
            let engine_a = a.engine().unwrap();
            let tx = engine_a.begin_tx().unwrap();
            tx.create_node().unwrap();
            tx.commit().unwrap();
        }

        let b = open_node(&core, 2, dir_b.path(), free_port()).unwrap();
        let before = graph_last(&a);

        let engine_b = b.engine().unwrap();
        let tx = engine_b.begin_tx().unwrap();
        let y = tx.create_node().unwrap();
        tx.set_node_property(y, "who", PropertyValue::Str("bob".into()))
            .unwrap();
        let assigned = tx.commit().unwrap();
        let (_, y_tx) = assigned
            .iter()
            .find(|(name, _)| name == GRAPH_SOURCE)
            .cloned()
            .unwrap();

        // The commit round-tripped: both nodes hold Y under the same id
        assert_eq!(y_tx, before + 1);
        assert_eq!(graph_last(&a), before + 1);
        assert_eq!(graph_last(&b), before + 1);
        let engine_a = a.engine().unwrap();
        assert!(engine_a.node_exists(y).unwrap());
        assert_eq!(
            engine_a.node_property(y, "who").unwrap(),
            Some(PropertyValue::Str("bob".into()))
        );
        assert_eq!(
            engine_b.node_property(y, "who").unwrap(),
            Some(PropertyValue::Str("bob".into()))
        );

        b.shutdown();
        a.shutdown();
    }

    #[test]
    fn primary_crash_elects_follower_and_old_primary_rejoins() {
        let core = Arc::new(MemoryCore::new());
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let port_a = free_port();

        let a = open_node(&core, 1, dir_a.path(), port_a).unwrap();
        {
            let engine_a = a.engine().unwrap();
            let tx = engine_a.begin_tx().unwrap();
            tx.create_node().unwrap();
            tx.commit().unwrap();
        }

        let b = open_node(&core, 2, dir_b.path(), free_port()).unwrap();
        b.pull_updates().unwrap();

        // Primary goes away; the follower is elected under epoch 2
        a.shutdown();
        drop(a);
        wait_until("B to become primary", || {
            b.is_primary() && b.engine().is_ok() && b.current_epoch() == 2
        });

        let z_tx = {
            let engine_b = b.engine().unwrap();
            let tx = engine_b.begin_tx().unwrap();
            let z = tx.create_node().unwrap();
            tx.set_node_property(z, "v", PropertyValue::Int(7)).unwrap();
            let assigned = tx.commit().unwrap();
            assigned
                .iter()
                .find(|(name, _)| name == GRAPH_SOURCE)
                .map(|(_, id)| *id)
                .unwrap()
        };

        // The old primary comes back as a follower and fetches Z
        let a = open_node(&core, 1, dir_a.path(), port_a).unwrap();
        assert!(!a.is_primary());
        assert!(b.is_primary());

        wait_until("A to catch up", || graph_last(&a) >= z_tx);
        let engine_a = a.engine().unwrap();
        assert_eq!(
            engine_a
                .registry()
                .require(GRAPH_SOURCE)
                .unwrap()
                .master_epoch_for(z_tx)
                .unwrap(),
            2
        );

        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn branched_store_is_quarantined_and_refetched() {
        let core = Arc::new(MemoryCore::new());
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let port_b = free_port();

        let a = open_node(&core, 1, dir_a.path(), free_port()).unwrap();
        {
            let engine_a = a.engine().unwrap();
            let tx = engine_a.begin_tx().unwrap();
            tx.create_node().unwrap();
            tx.commit().unwrap();
        }

        let b = open_node(&core, 2, dir_b.path(), port_b).unwrap();
        b.pull_updates().unwrap();
        b.shutdown();
        drop(b);

        // The cluster moves on without B
        let w = {
            let engine_a = a.engine().unwrap();
            let tx = engine_a.begin_tx().unwrap();
            let w = tx.create_node().unwrap();
            tx.set_node_property(w, "winner", PropertyValue::Bool(true))
                .unwrap();
            tx.commit().unwrap();
            w
        };

        // Meanwhile B, wrongly believing itself primary, commits its own
        // second transaction under a different epoch
        {
            let mut config = node_config(2, dir_b.path(), port_b);
            config.store.keep_logical_logs = true;
            let rogue = GraphDb::open(dir_b.path(), &config, None, EngineHooks::default()).unwrap();
            rogue.tx_manager().set_epoch(42);
            let tx = rogue.begin_tx().unwrap();
            tx.create_node().unwrap();
            tx.commit().unwrap();
            rogue.shutdown().unwrap();
        }

        // Rejoining detects the divergence, quarantines and refetches
        let b = open_node(&core, 2, dir_b.path(), port_b).unwrap();
        let engine_b = b.engine().unwrap();
        assert!(engine_b.node_exists(w).unwrap());
        assert_eq!(
            engine_b.node_property(w, "winner").unwrap(),
            Some(PropertyValue::Bool(true))
        );
        assert_eq!(
            engine_b
                .registry()
                .require(GRAPH_SOURCE)
                .unwrap()
                .master_epoch_for(2)
                .unwrap(),
            1
        );

        // The branched store sits under broken-<timestamp>/
        let quarantined = std::fs::read_dir(dir_b.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("broken-"));
        assert!(quarantined);

        b.shutdown();
        a.shutdown();
    }

    #[test]
    fn foreign_store_is_refused() {
        let core = Arc::new(MemoryCore::new());
        let dir_a = TempDir::new().unwrap();
        let dir_c = TempDir::new().unwrap();

        let a = open_node(&core, 1, dir_a.path(), free_port()).unwrap();

        // A store minted outside this cluster
        {
            let config = node_config(3, dir_c.path(), free_port());
            let foreign = GraphDb::open(dir_c.path(), &config, None, EngineHooks::default()).unwrap();
            let tx = foreign.begin_tx().unwrap();
            tx.create_node().unwrap();
            tx.commit().unwrap();
            foreign.shutdown().unwrap();
        }

        let err = match open_node(&core, 3, dir_c.path(), free_port()) {
            Err(e) => e,
            Ok(_) => panic!("a foreign store joined the cluster"),
        };
        assert!(matches!(err, Error::StoreIdMismatch { .. }));

        a.shutdown();
    }

    #[test]
    fn at_most_one_primary_per_view() {
        let core = Arc::new(MemoryCore::new());
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();

        let a = open_node(&core, 1, dir_a.path(), free_port()).unwrap();
        let b = open_node(&core, 2, dir_b.path(), free_port()).unwrap();

        let primaries = [a.is_primary(), b.is_primary()];
        assert_eq!(primaries.iter().filter(|p| **p).count(), 1);

        b.shutdown();
        a.shutdown();
    }
}
