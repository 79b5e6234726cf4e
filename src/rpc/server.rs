//! Primary RPC server
//!
//! Serves followers: id-range leases, record locks, forwarded commits,
//! update pulls, full store copies and epoch lookups. Every response
//! carries the committed transactions the caller's context shows it is
//! missing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::protocol::{
    FollowerContext, Request, RequestEnvelope, ResponseEnvelope, ResponsePayload, SnapshotChunk,
    WireError,
};
use super::{read_frame, write_frame};
use crate::datasource::DataSource;
use crate::error::{Error, Result};
use crate::log::CommittedTx;
use crate::store::GraphStore;
use crate::tx::{LockManager, TxManager};

/// Bytes per snapshot chunk before compression
const SNAPSHOT_CHUNK: usize = 256 * 1024;

/// Remote lock tokens live far above local transaction ids, so the
/// deadlock detector treats forwarded transactions as youngest
const REMOTE_TOKEN_BASE: u64 = 1 << 48;

/// Pulls served between history-pruning sweeps
const PRUNE_EVERY: u64 = 64;

/// The follower-facing server run while this node is primary
pub struct PrimaryServer {
    bind_address: String,
    store: Arc<GraphStore>,
    tx: Arc<TxManager>,
    locks: Arc<LockManager>,
    next_token: AtomicU64,
    /// follower id → (resource, last applied) from its latest context
    follower_marks: Mutex<HashMap<u32, Vec<(String, u64)>>>,
    pulls_served: AtomicU64,
}

impl PrimaryServer {
    pub fn new(
        bind_address: String,
        store: Arc<GraphStore>,
        tx: Arc<TxManager>,
        locks: Arc<LockManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bind_address,
            store,
            tx,
            locks,
            next_token: AtomicU64::new(REMOTE_TOKEN_BASE),
            follower_marks: Mutex::new(HashMap::new()),
            pulls_served: AtomicU64::new(0),
        })
    }

    /// Accept follower connections until `shutdown` flips
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("primary server listening on {}", self.bind_address);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(socket).await {
                                    tracing::debug!("follower connection from {addr} ended: {e}");
                                }
                            });
                        }
                        Err(e) => tracing::error!("accept error: {e}"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("primary server stopped");
        Ok(())
    }

    async fn handle_connection(self: &Arc<Self>, socket: TcpStream) -> Result<()> {
        socket.set_nodelay(true)?;
        let (mut reader, mut writer) = socket.into_split();

        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(frame) => frame,
                Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            };
            let envelope: RequestEnvelope = bincode::deserialize(&frame)?;

            if envelope.store_id != self.store.store_id() {
                let response = ResponseEnvelope {
                    result: Err(WireError::from_error(&Error::StoreIdMismatch {
                        local: self.store.store_id().to_string(),
                        remote: envelope.store_id.to_string(),
                    })),
                    transactions: Vec::new(),
                };
                write_frame(&mut writer, &bincode::serialize(&response)?).await?;
                continue;
            }

            tracing::trace!(
                follower = envelope.context.follower_id,
                event = envelope.context.event_id,
                "serving request"
            );

            if matches!(envelope.request, Request::CopyStore) {
                self.stream_store_copy(&mut writer, &envelope.context).await?;
                continue;
            }

            let server = Arc::clone(self);
            let response = tokio::task::spawn_blocking(move || server.dispatch(envelope))
                .await
                .map_err(|e| Error::Internal(format!("request task panicked: {e}")))?;
            write_frame(&mut writer, &bincode::serialize(&response)?).await?;
        }
        Ok(())
    }

    fn dispatch(&self, envelope: RequestEnvelope) -> ResponseEnvelope {
        let context = envelope.context;
        let is_pull = matches!(envelope.request, Request::PullUpdates);

        if !context.last_applied.is_empty() {
            self.follower_marks.lock().insert(
                context.follower_id,
                context
                    .last_applied
                    .iter()
                    .map(|(name, last, _)| (name.clone(), *last))
                    .collect(),
            );
        }
        if is_pull && self.pulls_served.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == 0 {
            self.prune_applied_history();
        }
        let result = match envelope.request {
            Request::AllocateIds { kind, count } => {
                let range = self.store.allocator(kind).allocate_range(count);
                Ok(ResponsePayload::IdRanges(vec![range]))
            }
            Request::AcquireLocks {
                token,
                exclusive,
                resources,
            } => self.acquire_locks(token, exclusive, &resources),
            Request::ReleaseLocks { token } => {
                self.locks.release_all(token);
                Ok(ResponsePayload::Unit)
            }
            Request::Commit { streams } => self
                .check_branch_safety(&context)
                .and_then(|_| self.tx.commit_replicated(&streams))
                .map(ResponsePayload::Committed),
            Request::PullUpdates => Ok(ResponsePayload::Unit),
            Request::CopyStore => unreachable!("copy handled by the streaming path"),
            Request::MasterEpochFor { resource, tx_id } => self
                .tx
                .registry()
                .require(&resource)
                .and_then(|source| source.master_epoch_for(tx_id))
                .map(ResponsePayload::Epoch),
            Request::GetWatermarks => Ok(ResponsePayload::Watermarks(
                self.tx.registry().watermarks(),
            )),
        };

        // Piggyback whatever the follower is missing. A pull with pruned
        // history must fail loudly so the follower falls back to a full
        // store copy; for other operations the catch-up is best-effort.
        let transactions = match self.transactions_since(&context) {
            Ok(txs) => txs,
            Err(e @ Error::LogPruned { .. }) if is_pull && result.is_ok() => {
                return ResponseEnvelope {
                    result: Err(WireError::from_error(&e)),
                    transactions: Vec::new(),
                }
            }
            Err(e) => {
                tracing::warn!("catch-up piggyback unavailable: {e}");
                Vec::new()
            }
        };

        ResponseEnvelope {
            result: result.map_err(|e| WireError::from_error(&e)),
            transactions,
        }
    }

    fn acquire_locks(
        &self,
        token: Option<u64>,
        exclusive: bool,
        resources: &[crate::tx::LockResource],
    ) -> Result<ResponsePayload> {
        let fresh = token.is_none();
        let token = token.unwrap_or_else(|| self.next_token.fetch_add(1, Ordering::SeqCst));
        for resource in resources {
            let acquired = if exclusive {
                self.locks.acquire_exclusive(token, *resource)
            } else {
                self.locks.acquire_shared(token, *resource)
            };
            if let Err(e) = acquired {
                if fresh {
                    self.locks.release_all(token);
                }
                return Err(e);
            }
        }
        Ok(ResponsePayload::LockToken(token))
    }

    /// Refuse requests whose context disagrees with this node's history
    fn check_branch_safety(&self, context: &FollowerContext) -> Result<()> {
        for (resource, last_tx, epoch) in &context.last_applied {
            if *last_tx == 0 {
                continue;
            }
            let source = self.tx.registry().require(resource)?;
            if *last_tx > source.last_committed_tx_id() {
                return Err(Error::BranchedData(format!(
                    "follower claims {resource}@{last_tx}, primary has only {}",
                    source.last_committed_tx_id()
                )));
            }
            match source.master_epoch_for(*last_tx) {
                Ok(my_epoch) if *epoch != 0 && my_epoch != *epoch => {
                    return Err(Error::BranchedData(format!(
                        "{resource}@{last_tx} was produced by epoch {my_epoch} here, \
                         epoch {epoch} on the follower"
                    )));
                }
                Ok(_) => {}
                Err(Error::LogPruned { .. }) => {
                    // History no longer on disk; the branch check cannot
                    // refute the follower, let it through
                    tracing::debug!(resource, last_tx, "epoch history pruned, skipping check");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Drop retained log history that every known follower has applied
    fn prune_applied_history(&self) {
        let marks = self.follower_marks.lock().clone();
        if marks.is_empty() {
            return;
        }
        for source in self.tx.registry().iter() {
            let floor = marks
                .values()
                .map(|per_resource| {
                    per_resource
                        .iter()
                        .find(|(name, _)| name == source.name())
                        .map(|(_, last)| *last)
                        .unwrap_or(0)
                })
                .min()
                .unwrap_or(0);
            if floor == 0 {
                continue;
            }
            match source.prune_history(floor) {
                Ok(0) => {}
                Ok(removed) => tracing::info!(
                    resource = source.name(),
                    removed,
                    floor,
                    "pruned replicated history"
                ),
                Err(e) => tracing::warn!("history pruning failed: {e}"),
            }
        }
    }

    /// Committed transactions the follower has not applied yet
    fn transactions_since(&self, context: &FollowerContext) -> Result<Vec<(String, CommittedTx)>> {
        let mut out = Vec::new();
        for (resource, last_tx, _) in &context.last_applied {
            let source = self.tx.registry().require(resource)?;
            for tx in source.extract(last_tx + 1)? {
                out.push((resource.clone(), tx));
            }
        }
        Ok(out)
    }

    /// Stream a consistent snapshot: flush, remember the watermarks,
    /// send every store file in chunks, then the transactions committed
    /// since the watermark. Records torn by concurrent writes are
    /// repaired by that tail, because commands overwrite whole records.
    async fn stream_store_copy<W>(
        self: &Arc<Self>,
        writer: &mut W,
        context: &FollowerContext,
    ) -> Result<()>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        tracing::info!(follower = context.follower_id, "streaming store copy");

        let server = Arc::clone(self);
        let watermarks = tokio::task::spawn_blocking(move || -> Result<Vec<(String, u64)>> {
            server.tx.registry().flush_all()?;
            Ok(server.tx.registry().watermarks())
        })
        .await
        .map_err(|e| Error::Internal(format!("flush task panicked: {e}")))??;

        let envelope = ResponseEnvelope {
            result: Ok(ResponsePayload::CopyStarting),
            transactions: Vec::new(),
        };
        write_frame(writer, &bincode::serialize(&envelope)?).await?;

        for source in self.tx.registry().iter() {
            for (name, path) in source.snapshot_files()? {
                let bytes = tokio::fs::read(&path).await?;
                let mut chunks = bytes.chunks(SNAPSHOT_CHUNK).peekable();
                if bytes.is_empty() {
                    let chunk = SnapshotChunk {
                        path: name.clone(),
                        bytes: Vec::new(),
                        compressed: false,
                        more: false,
                    };
                    write_frame(writer, &bincode::serialize(&chunk)?).await?;
                }
                while let Some(data) = chunks.next() {
                    let chunk = SnapshotChunk {
                        path: name.clone(),
                        bytes: lz4_flex::compress_prepend_size(data),
                        compressed: true,
                        more: chunks.peek().is_some(),
                    };
                    write_frame(writer, &bincode::serialize(&chunk)?).await?;
                }
            }
        }
        write_frame(writer, &bincode::serialize(&SnapshotChunk::terminator())?).await?;

        // Tail: everything committed during the copy
        let server = Arc::clone(self);
        let tail = tokio::task::spawn_blocking(move || -> Result<Vec<(String, CommittedTx)>> {
            let mut out = Vec::new();
            for (resource, watermark) in &watermarks {
                let source = server.tx.registry().require(resource)?;
                for tx in source.extract(watermark + 1)? {
                    out.push((resource.clone(), tx));
                }
            }
            Ok(out)
        })
        .await
        .map_err(|e| Error::Internal(format!("tail task panicked: {e}")))??;

        tracing::info!(
            follower = context.follower_id,
            tail = tail.len(),
            "store copy streamed"
        );
        write_frame(writer, &bincode::serialize(&tail)?).await?;
        Ok(())
    }
}
