//! High availability
//!
//! The follower runtime (remote ids, remote locks, forwarded commits,
//! update pulling) and the lifecycle supervisor that swaps one node
//! between primary and follower configurations.

pub mod follower;
pub mod supervisor;

pub use follower::{PrimaryHandle, RemoteIdAssigner, SlaveCommitHook, SlaveLocks, UpdatePuller};
pub use supervisor::ClusterGraphDb;

use crate::datasource::{DataSource, DataSourceRegistry};
use crate::rpc::protocol::FollowerContext;

/// Build the context a follower attaches to every request: its machine
/// id, a request counter, and what it has applied per resource. An
/// epoch of zero means the follower cannot determine it locally (fresh
/// copy with pruned history) and asks the primary not to judge it.
pub fn follower_context(
    machine_id: u32,
    event_id: u64,
    registry: &DataSourceRegistry,
) -> FollowerContext {
    let last_applied = registry
        .iter()
        .map(|source| {
            let last = source.last_committed_tx_id();
            let epoch = if last == 0 {
                0
            } else {
                source.master_epoch_for(last).unwrap_or(0)
            };
            (source.name().to_string(), last, epoch)
        })
        .collect();
    FollowerContext {
        follower_id: machine_id,
        event_id,
        last_applied,
    }
}
