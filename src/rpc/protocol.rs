//! Primary RPC protocol
//!
//! Requests carry the follower's context (who it is and what it has
//! applied per resource); responses piggyback any committed
//! transactions the follower is missing, so every round-trip doubles
//! as a catch-up opportunity.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::log::CommittedTx;
use crate::store::{IdKind, StoreId};
use crate::tx::LockResource;

/// What a follower sends with every request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowerContext {
    pub follower_id: u32,
    /// Request counter, for correlating the primary's log with the
    /// follower's
    pub event_id: u64,
    /// `(resource, last applied tx id, epoch of that tx)` per source
    pub last_applied: Vec<(String, u64, u32)>,
}

/// Operations served by the primary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    AllocateIds {
        kind: IdKind,
        count: u32,
    },
    AcquireLocks {
        /// Token of this transaction's earlier acquisitions, if any
        token: Option<u64>,
        exclusive: bool,
        resources: Vec<LockResource>,
    },
    ReleaseLocks {
        token: u64,
    },
    Commit {
        streams: Vec<(String, Vec<Vec<u8>>)>,
    },
    PullUpdates,
    CopyStore,
    MasterEpochFor {
        resource: String,
        tx_id: u64,
    },
    /// Per-resource committed watermarks, for branch checks
    GetWatermarks,
}

/// A request frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// The store the follower believes it replicates; foreign stores
    /// are refused
    pub store_id: StoreId,
    pub context: FollowerContext,
    pub request: Request,
}

/// Error classification that survives the wire; the lifecycle
/// supervisor pattern-matches on the kind to pick re-election,
/// refetch, or shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireErrorKind {
    NotPrimary,
    BranchedData,
    StoreIdMismatch,
    TxGap,
    Deadlock,
    LogPruned,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: WireErrorKind,
    pub message: String,
}

impl WireError {
    pub fn from_error(error: &Error) -> Self {
        let kind = match error {
            Error::NotPrimary(_) | Error::NoPrimary => WireErrorKind::NotPrimary,
            Error::BranchedData(_) => WireErrorKind::BranchedData,
            Error::StoreIdMismatch { .. } => WireErrorKind::StoreIdMismatch,
            Error::TxGap { .. } => WireErrorKind::TxGap,
            Error::DeadlockDetected(_) => WireErrorKind::Deadlock,
            Error::LogPruned { .. } => WireErrorKind::LogPruned,
            _ => WireErrorKind::Internal,
        };
        Self {
            kind,
            message: error.to_string(),
        }
    }

    pub fn into_error(self) -> Error {
        match self.kind {
            WireErrorKind::NotPrimary => Error::NoPrimary,
            WireErrorKind::BranchedData => Error::BranchedData(self.message),
            WireErrorKind::StoreIdMismatch => Error::StoreIdMismatch {
                local: "follower".into(),
                remote: self.message,
            },
            WireErrorKind::TxGap | WireErrorKind::LogPruned => Error::LogPruned { from: 0 },
            WireErrorKind::Deadlock => Error::DeadlockDetected(0),
            WireErrorKind::Internal => Error::Communication(self.message),
        }
    }
}

/// Operation results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponsePayload {
    /// `(start, length)` id ranges
    IdRanges(Vec<(u32, u32)>),
    /// Token under which the requested locks are held on the primary
    LockToken(u64),
    /// `(resource, tx_id, epoch)` assigned to a forwarded commit
    Committed(Vec<(String, u64, u32)>),
    Epoch(u32),
    /// `(resource, last committed tx id)` pairs
    Watermarks(Vec<(String, u64)>),
    /// Snapshot frames follow this envelope
    CopyStarting,
    Unit,
}

/// A response frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub result: std::result::Result<ResponsePayload, WireError>,
    /// Committed transactions the follower was missing, in apply order
    pub transactions: Vec<(String, CommittedTx)>,
}

/// One store file chunk of a snapshot stream; an empty `path` ends the
/// sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotChunk {
    pub path: String,
    pub bytes: Vec<u8>,
    pub compressed: bool,
    /// More chunks of this same file follow
    pub more: bool,
}

impl SnapshotChunk {
    pub fn terminator() -> Self {
        Self {
            path: String::new(),
            bytes: Vec::new(),
            compressed: false,
            more: false,
        }
    }

    pub fn is_terminator(&self) -> bool {
        self.path.is_empty() && self.bytes.is_empty()
    }

    pub fn data(&self) -> crate::error::Result<Vec<u8>> {
        if self.compressed {
            lz4_flex::decompress_size_prepended(&self.bytes)
                .map_err(|e| Error::Communication(format!("snapshot chunk decompression: {e}")))
        } else {
            Ok(self.bytes.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let envelope = RequestEnvelope {
            store_id: StoreId::new(),
            context: FollowerContext {
                follower_id: 2,
                event_id: 17,
                last_applied: vec![("graph".into(), 42, 3)],
            },
            request: Request::PullUpdates,
        };
        let bytes = bincode::serialize(&envelope).unwrap();
        let back: RequestEnvelope = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.context.follower_id, 2);
        assert!(matches!(back.request, Request::PullUpdates));
    }

    #[test]
    fn wire_error_classification() {
        let err = Error::BranchedData("epoch mismatch at 7".into());
        let wire = WireError::from_error(&err);
        assert_eq!(wire.kind, WireErrorKind::BranchedData);
        assert!(matches!(wire.into_error(), Error::BranchedData(_)));

        let wire = WireError::from_error(&Error::RequestTimeout("x".into()));
        assert_eq!(wire.kind, WireErrorKind::Internal);
    }

    #[test]
    fn snapshot_chunk_compression() {
        let data = vec![7u8; 4096];
        let chunk = SnapshotChunk {
            path: "neostore.nodestore.db".into(),
            bytes: lz4_flex::compress_prepend_size(&data),
            compressed: true,
            more: false,
        };
        assert!(chunk.bytes.len() < data.len());
        assert_eq!(chunk.data().unwrap(), data);
    }
}
