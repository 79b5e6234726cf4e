//! Coordination service
//!
//! A strongly consistent membership store with ephemeral, sequentially
//! numbered registrations. Nodes register on join; the registration
//! disappears with the session. The member holding the smallest live
//! sequence number (that is allowed to lead) is the primary, and the
//! epoch increments every time that changes.

pub mod client;
pub mod memory;
pub mod server;

pub use client::CoordClient;
pub use memory::{MemoryCoordinator, MemoryCore};
pub use server::CoordServer;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::Result;
use crate::store::StoreId;

/// What a node publishes about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub machine_id: u32,
    /// Address of this node's follower-facing server
    pub ha_address: String,
    /// Never elected primary (read-only replicas, backup nodes)
    pub backup_only: bool,
}

/// A consistent snapshot of the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterView {
    /// Increases on every primary change; at most one primary per epoch
    pub epoch: u32,
    /// `(sequence, member)` of the elected primary, when one exists
    pub primary: Option<(u64, MemberInfo)>,
    /// All live members ordered by sequence number
    pub members: Vec<(u64, MemberInfo)>,
}

impl ClusterView {
    pub fn primary_machine(&self) -> Option<u32> {
        self.primary.as_ref().map(|(_, m)| m.machine_id)
    }

    pub fn primary_address(&self) -> Option<&str> {
        self.primary.as_ref().map(|(_, m)| m.ha_address.as_str())
    }

    pub fn address_of(&self, machine_id: u32) -> Option<&str> {
        self.members
            .iter()
            .find(|(_, m)| m.machine_id == machine_id)
            .map(|(_, m)| m.ha_address.as_str())
    }

    pub fn is_member(&self, machine_id: u32) -> bool {
        self.members.iter().any(|(_, m)| m.machine_id == machine_id)
    }
}

/// One node's session against the coordination service
pub trait CoordinationService: Send + Sync {
    /// Register this session's member record; returns the assigned
    /// sequence number. Re-registering replaces the previous record
    /// under a fresh, higher sequence.
    fn register(&self, member: MemberInfo) -> Result<u64>;

    /// Republish this session's member record in place
    fn update_member(&self, member: MemberInfo) -> Result<()>;

    /// Drop this session's registration
    fn deregister(&self) -> Result<()>;

    /// Fetch a fresh view
    fn view(&self) -> Result<ClusterView>;

    /// Claim the cluster for `store_id`; the first claim wins and every
    /// caller gets the winning id back
    fn create_cluster(&self, store_id: StoreId) -> Result<StoreId>;

    /// The agreed store id, if the cluster was ever claimed
    fn cluster_store_id(&self) -> Result<Option<StoreId>>;

    /// View-version channel; the value changes whenever membership or
    /// election state does
    fn subscribe(&self) -> watch::Receiver<u64>;
}
