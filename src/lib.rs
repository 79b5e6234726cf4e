//! Antler - Embeddable Highly Available Graph Database Core
//!
//! An embedded graph engine with a transactional fixed-record store, a
//! write-ahead logical log, and leader-based replication that keeps a
//! cluster of embedded engines consistent around a single elected
//! primary.
//!
//! # Architecture
//!
//! Writes flow through a two-phase transaction coordinator over the
//! registered data sources (the graph store first, secondary indexes
//! after). On a follower every write is forwarded to the primary, which
//! serializes commits into a total order per resource; the follower
//! applies the returned stream locally under the same transaction ids.
//! Membership and primary election live in a coordination service with
//! ephemeral sequential registrations; the smallest live sequence wins.
//!
//! # Features
//!
//! - Fixed-record stores for nodes, relationships and properties with
//!   free-list id reuse
//! - Append-only logical log with rotation, recovery and history
//!   extraction for replication
//! - Two-phase commit across graph store and secondary indexes
//! - Record-level locking with wait-for-graph deadlock detection
//! - Primary election, follower catch-up and full store copies
//! - Branched-data detection with quarantine and refetch

pub mod broker;
pub mod config;
pub mod coord;
pub mod datasource;
pub mod db;
pub mod error;
pub mod ha;
pub mod index;
pub mod log;
pub mod rpc;
pub mod store;
pub mod tx;

pub use config::AntlerConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::broker::ClusterBroker;
    pub use crate::config::AntlerConfig;
    pub use crate::coord::{ClusterView, CoordinationService, MemberInfo, MemoryCore};
    pub use crate::db::{EngineHooks, GraphDb};
    pub use crate::error::{Error, Result};
    pub use crate::ha::ClusterGraphDb;
    pub use crate::store::{PropertyValue, StoreId};
}
