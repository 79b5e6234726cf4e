//! Cluster broker
//!
//! One node's window onto the coordination service: membership,
//! primary lookup, cluster creation and the re-election nudge used
//! when communication with the primary fails.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::coord::{ClusterView, CoordinationService, MemberInfo};
use crate::error::{Error, Result};
use crate::store::StoreId;

/// Broker for one node
pub struct ClusterBroker {
    coordination: Arc<dyn CoordinationService>,
    member: Mutex<MemberInfo>,
    sequence: Mutex<Option<u64>>,
}

impl ClusterBroker {
    pub fn new(
        machine_id: u32,
        ha_address: String,
        backup_only: bool,
        coordination: Arc<dyn CoordinationService>,
    ) -> Self {
        Self {
            coordination,
            member: Mutex::new(MemberInfo {
                machine_id,
                ha_address,
                backup_only,
            }),
            sequence: Mutex::new(None),
        }
    }

    pub fn machine_id(&self) -> u32 {
        self.member.lock().machine_id
    }

    /// Register this node with the cluster
    pub fn join(&self) -> Result<u64> {
        let member = self.member.lock().clone();
        let seq = self.coordination.register(member)?;
        *self.sequence.lock() = Some(seq);
        tracing::info!(sequence = seq, "joined cluster");
        Ok(seq)
    }

    /// Drop this node's registration
    pub fn leave(&self) -> Result<()> {
        *self.sequence.lock() = None;
        self.coordination.deregister()
    }

    /// The current cluster view
    pub fn current_view(&self) -> Result<ClusterView> {
        self.coordination.view()
    }

    /// Force a fresh look at who the primary is. If this node's own
    /// registration was lost with its session, it re-registers first
    /// (under a fresh, higher sequence, so it cannot depose anyone).
    pub fn force_reelect(&self) -> Result<ClusterView> {
        let machine_id = self.machine_id();
        let view = self.coordination.view()?;
        if view.is_member(machine_id) {
            return Ok(view);
        }
        tracing::warn!("registration lost, rejoining cluster");
        self.join()?;
        self.coordination.view()
    }

    /// Claim the cluster for `store_id`; whoever claims first wins
    pub fn create_cluster(&self, store_id: StoreId) -> Result<StoreId> {
        self.coordination.create_cluster(store_id)
    }

    /// The store id the cluster agreed on, if any
    pub fn cluster_store_id(&self) -> Result<Option<StoreId>> {
        self.coordination.cluster_store_id()
    }

    /// Republish this node's connection information after it started
    /// serving as primary
    pub fn rebind_primary(&self) -> Result<()> {
        let member = self.member.lock().clone();
        self.coordination.update_member(member)
    }

    /// Whether this node is the elected primary right now
    pub fn i_am_primary(&self) -> Result<bool> {
        Ok(self.current_view()?.primary_machine() == Some(self.machine_id()))
    }

    /// The primary's follower-facing address, when one is elected
    pub fn primary_address(&self) -> Result<(u32, String)> {
        let view = self.current_view()?;
        match view.primary {
            Some((_, member)) => Ok((member.machine_id, member.ha_address)),
            None => Err(Error::NoPrimary),
        }
    }

    /// View-change notifications
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.coordination.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryCore;

    fn broker(core: &Arc<MemoryCore>, machine_id: u32) -> ClusterBroker {
        ClusterBroker::new(
            machine_id,
            format!("127.0.0.1:{}", 6360 + machine_id),
            false,
            Arc::new(core.session()),
        )
    }

    #[test]
    fn join_and_primacy() {
        let core = Arc::new(MemoryCore::new());
        let a = broker(&core, 1);
        let b = broker(&core, 2);

        a.join().unwrap();
        b.join().unwrap();

        assert!(a.i_am_primary().unwrap());
        assert!(!b.i_am_primary().unwrap());
        assert_eq!(b.primary_address().unwrap(), (1, "127.0.0.1:6361".into()));
    }

    #[test]
    fn reelect_after_primary_loss() {
        let core = Arc::new(MemoryCore::new());
        let a = broker(&core, 1);
        let b = broker(&core, 2);
        a.join().unwrap();
        b.join().unwrap();

        let epoch_before = b.current_view().unwrap().epoch;
        a.leave().unwrap();

        let view = b.force_reelect().unwrap();
        assert_eq!(view.primary_machine(), Some(2));
        assert_eq!(view.epoch, epoch_before + 1);
        assert!(b.i_am_primary().unwrap());
    }

    #[test]
    fn force_reelect_rejoins_lost_session() {
        let core = Arc::new(MemoryCore::new());
        let session_a = core.session();
        let a_session_id = session_a.session_id();
        let a = ClusterBroker::new(1, "127.0.0.1:6361".into(), false, Arc::new(session_a));
        let b = broker(&core, 2);
        a.join().unwrap();
        b.join().unwrap();

        // A's session expires behind its back
        core.expire_session(a_session_id);
        let view = a.force_reelect().unwrap();
        // A is back in, but B was elected in the meantime
        assert!(view.is_member(1));
        assert_eq!(view.primary_machine(), Some(2));
    }

    #[test]
    fn no_primary_before_any_join() {
        let core = Arc::new(MemoryCore::new());
        let a = broker(&core, 1);
        assert!(matches!(a.primary_address(), Err(Error::NoPrimary)));
    }
}
