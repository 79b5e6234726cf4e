//! Primary RPC client
//!
//! Blocking client used by follower runtimes. Every call carries the
//! follower context and a deadline; a missed deadline surfaces as a
//! communication failure, never a partial result. Transactions
//! piggybacked on responses are handed back to the caller for applying.

use std::io::ErrorKind;
use std::net::TcpStream;
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;

use super::protocol::{
    FollowerContext, Request, RequestEnvelope, ResponseEnvelope, ResponsePayload, SnapshotChunk,
};
use super::{read_frame_sync, write_frame_sync};
use crate::error::{Error, Result};
use crate::log::CommittedTx;
use crate::store::{IdKind, StoreId};
use crate::tx::{LockResource, RemoteCommitResponse};

/// A connection to the current primary
pub struct PrimaryClient {
    address: String,
    store_id: StoreId,
    timeout: Duration,
    conn: Mutex<Option<TcpStream>>,
}

impl PrimaryClient {
    pub fn new(address: String, store_id: StoreId, timeout: Duration) -> Self {
        Self {
            address,
            store_id,
            timeout,
            conn: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn connect(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect(&self.address).map_err(|e| Error::ConnectionFailed {
            address: self.address.clone(),
            reason: e.to_string(),
        })?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        Ok(stream)
    }

    fn map_timeout(&self, error: Error) -> Error {
        match error {
            Error::Io(ref e)
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
            {
                Error::RequestTimeout(self.address.clone())
            }
            other => other,
        }
    }

    fn request(&self, context: &FollowerContext, request: Request) -> Result<ResponseEnvelope> {
        let envelope = RequestEnvelope {
            store_id: self.store_id,
            context: context.clone(),
            request,
        };
        let bytes = bincode::serialize(&envelope)?;

        let mut conn = self.conn.lock();
        for attempt in 0..2 {
            if conn.is_none() {
                *conn = Some(self.connect()?);
            }
            let stream = conn.as_mut().unwrap();
            let outcome = write_frame_sync(stream, &bytes).and_then(|_| read_frame_sync(stream));
            match outcome {
                Ok(frame) => {
                    let response: ResponseEnvelope = bincode::deserialize(&frame)?;
                    return Ok(response);
                }
                Err(e) => {
                    *conn = None;
                    let e = self.map_timeout(e);
                    // A timed-out request may have half a response in
                    // flight; only a clean send failure is retried
                    if attempt == 1 || matches!(e, Error::RequestTimeout(_)) {
                        return Err(e);
                    }
                    tracing::debug!("primary request failed, reconnecting: {e}");
                }
            }
        }
        unreachable!("loop returns on second attempt")
    }

    fn expect<T>(
        &self,
        response: ResponseEnvelope,
        extract: impl FnOnce(ResponsePayload) -> Option<T>,
    ) -> Result<(T, Vec<(String, CommittedTx)>)> {
        match response.result {
            Ok(payload) => match extract(payload) {
                Some(value) => Ok((value, response.transactions)),
                None => Err(Error::Communication("unexpected response payload".into())),
            },
            Err(wire) => Err(wire.into_error()),
        }
    }

    /// Lease id ranges of `kind` from the primary
    pub fn allocate_ids(
        &self,
        context: &FollowerContext,
        kind: IdKind,
        count: u32,
    ) -> Result<(Vec<(u32, u32)>, Vec<(String, CommittedTx)>)> {
        let response = self.request(context, Request::AllocateIds { kind, count })?;
        self.expect(response, |payload| match payload {
            ResponsePayload::IdRanges(ranges) => Some(ranges),
            _ => None,
        })
    }

    /// Take record locks on the primary; returns the token they are
    /// held under
    pub fn acquire_locks(
        &self,
        context: &FollowerContext,
        token: Option<u64>,
        exclusive: bool,
        resources: Vec<LockResource>,
    ) -> Result<(u64, Vec<(String, CommittedTx)>)> {
        let response = self.request(
            context,
            Request::AcquireLocks {
                token,
                exclusive,
                resources,
            },
        )?;
        self.expect(response, |payload| match payload {
            ResponsePayload::LockToken(token) => Some(token),
            _ => None,
        })
    }

    pub fn release_locks(&self, context: &FollowerContext, token: u64) -> Result<()> {
        let response = self.request(context, Request::ReleaseLocks { token })?;
        self.expect(response, |payload| match payload {
            ResponsePayload::Unit => Some(()),
            _ => None,
        })
        .map(|_| ())
    }

    /// Forward a commit; the response carries the assigned ids and the
    /// apply stream (missing history plus the forwarded transaction)
    pub fn commit(
        &self,
        context: &FollowerContext,
        streams: &[(String, Vec<Vec<u8>>)],
    ) -> Result<RemoteCommitResponse> {
        let response = self.request(
            context,
            Request::Commit {
                streams: streams.to_vec(),
            },
        )?;
        let (assigned, apply) = self.expect(response, |payload| match payload {
            ResponsePayload::Committed(assigned) => Some(assigned),
            _ => None,
        })?;
        Ok(RemoteCommitResponse { assigned, apply })
    }

    /// Fetch everything committed past the context's watermarks
    pub fn pull_updates(&self, context: &FollowerContext) -> Result<Vec<(String, CommittedTx)>> {
        let response = self.request(context, Request::PullUpdates)?;
        self.expect(response, |payload| match payload {
            ResponsePayload::Unit => Some(()),
            _ => None,
        })
        .map(|(_, txs)| txs)
    }

    pub fn master_epoch_for(
        &self,
        context: &FollowerContext,
        resource: &str,
        tx_id: u64,
    ) -> Result<u32> {
        let response = self.request(
            context,
            Request::MasterEpochFor {
                resource: resource.to_string(),
                tx_id,
            },
        )?;
        self.expect(response, |payload| match payload {
            ResponsePayload::Epoch(epoch) => Some(epoch),
            _ => None,
        })
        .map(|(epoch, _)| epoch)
    }

    /// The primary's committed watermark per resource
    pub fn watermarks(&self, context: &FollowerContext) -> Result<Vec<(String, u64)>> {
        let response = self.request(context, Request::GetWatermarks)?;
        self.expect(response, |payload| match payload {
            ResponsePayload::Watermarks(marks) => Some(marks),
            _ => None,
        })
        .map(|(marks, _)| marks)
    }

    /// Stream a full store copy into `target_dir`, returning the log
    /// tail committed during the copy
    pub fn copy_store(
        &self,
        context: &FollowerContext,
        target_dir: &Path,
    ) -> Result<Vec<(String, CommittedTx)>> {
        std::fs::create_dir_all(target_dir)?;

        // A dedicated connection: the stream is long and must not share
        // a socket with request/response traffic
        let mut stream = self.connect()?;
        // Copies move far more data than one request; scale the deadline
        stream.set_read_timeout(Some(self.timeout * 10))?;

        let envelope = RequestEnvelope {
            store_id: self.store_id,
            context: context.clone(),
            request: Request::CopyStore,
        };
        write_frame_sync(&mut stream, &bincode::serialize(&envelope)?)
            .map_err(|e| self.map_timeout(e))?;

        let frame = read_frame_sync(&mut stream).map_err(|e| self.map_timeout(e))?;
        let response: ResponseEnvelope = bincode::deserialize(&frame)?;
        match response.result {
            Ok(ResponsePayload::CopyStarting) => {}
            Ok(_) => return Err(Error::Communication("unexpected copy response".into())),
            Err(wire) => return Err(wire.into_error()),
        }

        use std::io::Write as _;
        let mut open: Option<(String, std::fs::File)> = None;
        loop {
            let frame = read_frame_sync(&mut stream).map_err(|e| self.map_timeout(e))?;
            let chunk: SnapshotChunk = bincode::deserialize(&frame)?;
            if chunk.is_terminator() {
                break;
            }
            let file = match &mut open {
                Some((path, file)) if *path == chunk.path => file,
                _ => {
                    let target = target_dir.join(&chunk.path);
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let file = std::fs::File::create(&target)?;
                    open = Some((chunk.path.clone(), file));
                    &mut open.as_mut().unwrap().1
                }
            };
            file.write_all(&chunk.data()?)?;
            if !chunk.more {
                file.sync_data()?;
            }
        }
        drop(open);

        let frame = read_frame_sync(&mut stream).map_err(|e| self.map_timeout(e))?;
        let tail: Vec<(String, CommittedTx)> = bincode::deserialize(&frame)?;
        tracing::info!(
            files_into = %target_dir.display(),
            tail = tail.len(),
            "store copy received"
        );
        Ok(tail)
    }
}
