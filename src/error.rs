//! Antler Error Types

use thiserror::Error;

/// Result type alias for antler operations
pub type Result<T> = std::result::Result<T, Error>;

/// Antler error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Store errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Corrupted store header in {file}: {reason}")]
    CorruptStoreHeader { file: String, reason: String },

    #[error("Store id mismatch: local {local}, remote {remote}")]
    StoreIdMismatch { local: String, remote: String },

    #[error("Record {0} not in use")]
    RecordNotInUse(u32),

    // Logical log errors
    #[error("Logical log error: {0}")]
    Log(String),

    #[error("Log entry corrupted at offset {offset}: {reason}")]
    LogCorrupted { offset: u64, reason: String },

    #[error("Transactions from {from} no longer retained in the logical log")]
    LogPruned { from: u64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Transaction errors
    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("No transaction associated with the calling thread")]
    NoTransaction,

    #[error("Deadlock detected, transaction {0} aborted")]
    DeadlockDetected(u64),

    #[error("Applying transaction {got} would leave a gap after {last} in resource {resource}")]
    TxGap { resource: String, last: u64, got: u64 },

    // Data source errors
    #[error("Unknown data source: {0}")]
    UnknownDataSource(String),

    // Cluster errors
    #[error("Branched data: {0}")]
    BranchedData(String),

    #[error("Not the primary: current primary is machine {0}")]
    NotPrimary(u32),

    #[error("No primary elected")]
    NoPrimary,

    #[error("Coordination service error: {0}")]
    Coordination(String),

    #[error("Lost coordination session")]
    SessionExpired,

    // Network errors
    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Request to {0} timed out")]
    RequestTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Lifecycle errors
    #[error("Database is shut down: {0}")]
    ShutDown(String),

    #[error("Database is read only")]
    ReadOnly,

    #[error("Role transition did not complete: {0}")]
    TransitionFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is a transient communication failure worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Communication(_)
                | Error::ConnectionFailed { .. }
                | Error::RequestTimeout(_)
                | Error::NoPrimary
                | Error::NotPrimary(_)
                | Error::SessionExpired
        )
    }

    /// Check if this error must halt the node instead of triggering re-election
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CorruptStoreHeader { .. } | Error::StoreIdMismatch { .. } | Error::ShutDown(_)
        )
    }

    /// Check if this error should make a follower re-evaluate who the primary is
    pub fn triggers_reelection(&self) -> bool {
        self.is_retryable() && !matches!(self, Error::SessionExpired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::RequestTimeout("10.0.0.1:6361".into()).is_retryable());
        assert!(Error::NoPrimary.is_retryable());
        assert!(!Error::DeadlockDetected(7).is_retryable());
        assert!(!Error::BranchedData("epoch mismatch".into()).is_retryable());
    }

    #[test]
    fn fatal_classification() {
        let err = Error::StoreIdMismatch {
            local: "1234/5678".into(),
            remote: "9999/0000".into(),
        };
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        assert!(!Error::Communication("broken pipe".into()).is_fatal());
    }
}
