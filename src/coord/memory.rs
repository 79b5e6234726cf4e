//! In-process coordination
//!
//! A shared membership core for clusters living in one process:
//! embedded multi-node setups and tests. The TCP server wraps the same
//! core for real deployments.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use super::{ClusterView, CoordinationService, MemberInfo};
use crate::error::{Error, Result};
use crate::store::StoreId;

struct CoreState {
    next_seq: u64,
    next_session: u64,
    /// sequence → (session, member)
    members: std::collections::BTreeMap<u64, (u64, MemberInfo)>,
    epoch: u32,
    primary_seq: Option<u64>,
    store_id: Option<StoreId>,
    version: u64,
}

/// The membership store itself
pub struct MemoryCore {
    state: Mutex<CoreState>,
    notify: watch::Sender<u64>,
}

impl Default for MemoryCore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCore {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            state: Mutex::new(CoreState {
                next_seq: 1,
                next_session: 1,
                members: Default::default(),
                epoch: 0,
                primary_seq: None,
                store_id: None,
                version: 0,
            }),
            notify,
        }
    }

    /// Open a session against this core
    pub fn session(self: &Arc<Self>) -> MemoryCoordinator {
        let session = {
            let mut state = self.state.lock();
            let s = state.next_session;
            state.next_session += 1;
            s
        };
        MemoryCoordinator {
            core: Arc::clone(self),
            session,
        }
    }

    /// Drop every registration of `session`, as its expiry would
    pub fn expire_session(&self, session: u64) {
        let mut state = self.state.lock();
        let before = state.members.len();
        state.members.retain(|_, (s, _)| *s != session);
        if state.members.len() != before {
            self.recompute(&mut state);
        }
    }

    fn recompute(&self, state: &mut CoreState) {
        let new_primary = state
            .members
            .iter()
            .find(|(_, (_, m))| !m.backup_only)
            .map(|(seq, _)| *seq);
        if new_primary != state.primary_seq {
            if new_primary.is_some() {
                state.epoch += 1;
                tracing::info!(
                    epoch = state.epoch,
                    primary_seq = ?new_primary,
                    "elected new primary"
                );
            }
            state.primary_seq = new_primary;
        }
        state.version += 1;
        let _ = self.notify.send(state.version);
    }

    fn view_locked(state: &CoreState) -> ClusterView {
        let members: Vec<(u64, MemberInfo)> = state
            .members
            .iter()
            .map(|(seq, (_, m))| (*seq, m.clone()))
            .collect();
        let primary = state.primary_seq.and_then(|seq| {
            state
                .members
                .get(&seq)
                .map(|(_, m)| (seq, m.clone()))
        });
        ClusterView {
            epoch: state.epoch,
            primary,
            members,
        }
    }
}

/// One session against a [`MemoryCore`]
pub struct MemoryCoordinator {
    core: Arc<MemoryCore>,
    session: u64,
}

impl MemoryCoordinator {
    pub fn session_id(&self) -> u64 {
        self.session
    }

    /// The shared core, for wiring further sessions
    pub fn core(&self) -> Arc<MemoryCore> {
        Arc::clone(&self.core)
    }
}

impl CoordinationService for MemoryCoordinator {
    fn register(&self, member: MemberInfo) -> Result<u64> {
        let mut state = self.core.state.lock();
        state.members.retain(|_, (s, _)| *s != self.session);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.members.insert(seq, (self.session, member));
        self.core.recompute(&mut state);
        Ok(seq)
    }

    fn update_member(&self, member: MemberInfo) -> Result<()> {
        let mut state = self.core.state.lock();
        let mut found = false;
        let mut changed = false;
        for (_, (s, m)) in state.members.iter_mut() {
            if *s == self.session {
                if *m != member {
                    *m = member.clone();
                    changed = true;
                }
                found = true;
            }
        }
        if !found {
            return Err(Error::Coordination("session has no registration".into()));
        }
        // Republishing identical information is not a view change
        if changed {
            self.core.recompute(&mut state);
        }
        Ok(())
    }

    fn deregister(&self) -> Result<()> {
        self.core.expire_session(self.session);
        Ok(())
    }

    fn view(&self) -> Result<ClusterView> {
        Ok(MemoryCore::view_locked(&self.core.state.lock()))
    }

    fn create_cluster(&self, store_id: StoreId) -> Result<StoreId> {
        let mut state = self.core.state.lock();
        match state.store_id {
            Some(existing) => Ok(existing),
            None => {
                state.store_id = Some(store_id);
                tracing::info!(%store_id, "cluster created");
                Ok(store_id)
            }
        }
    }

    fn cluster_store_id(&self) -> Result<Option<StoreId>> {
        Ok(self.core.state.lock().store_id)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.core.notify.subscribe()
    }
}

impl Drop for MemoryCoordinator {
    fn drop(&mut self) {
        self.core.expire_session(self.session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(machine_id: u32) -> MemberInfo {
        MemberInfo {
            machine_id,
            ha_address: format!("127.0.0.1:{}", 6361 + machine_id),
            backup_only: false,
        }
    }

    #[test]
    fn smallest_sequence_wins() {
        let core = Arc::new(MemoryCore::new());
        let a = core.session();
        let b = core.session();

        a.register(member(1)).unwrap();
        b.register(member(2)).unwrap();

        let view = a.view().unwrap();
        assert_eq!(view.epoch, 1);
        assert_eq!(view.primary_machine(), Some(1));
        assert_eq!(view.members.len(), 2);
    }

    #[test]
    fn expiry_elects_next_and_bumps_epoch() {
        let core = Arc::new(MemoryCore::new());
        let a = core.session();
        let b = core.session();
        a.register(member(1)).unwrap();
        b.register(member(2)).unwrap();

        core.expire_session(a.session_id());
        let view = b.view().unwrap();
        assert_eq!(view.primary_machine(), Some(2));
        assert_eq!(view.epoch, 2);
        assert_eq!(view.members.len(), 1);
    }

    #[test]
    fn rejoin_gets_higher_sequence() {
        let core = Arc::new(MemoryCore::new());
        let a = core.session();
        let b = core.session();
        a.register(member(1)).unwrap();
        b.register(member(2)).unwrap();
        core.expire_session(a.session_id());

        // A comes back: registers again, but B keeps primacy
        let a2 = core.session();
        a2.register(member(1)).unwrap();
        let view = a2.view().unwrap();
        assert_eq!(view.primary_machine(), Some(2));
        assert_eq!(view.epoch, 2);
    }

    #[test]
    fn backup_members_never_lead() {
        let core = Arc::new(MemoryCore::new());
        let backup = core.session();
        let normal = core.session();
        backup
            .register(MemberInfo {
                backup_only: true,
                ..member(9)
            })
            .unwrap();
        assert_eq!(backup.view().unwrap().primary_machine(), None);

        normal.register(member(1)).unwrap();
        assert_eq!(normal.view().unwrap().primary_machine(), Some(1));
    }

    #[test]
    fn first_store_id_wins() {
        let core = Arc::new(MemoryCore::new());
        let a = core.session();
        let b = core.session();

        let id_a = StoreId::new();
        let id_b = StoreId::new();
        assert_eq!(a.create_cluster(id_a).unwrap(), id_a);
        assert_eq!(b.create_cluster(id_b).unwrap(), id_a);
        assert_eq!(b.cluster_store_id().unwrap(), Some(id_a));
    }

    #[test]
    fn drop_deregisters() {
        let core = Arc::new(MemoryCore::new());
        let a = core.session();
        a.register(member(1)).unwrap();
        let b = core.session();
        b.register(member(2)).unwrap();

        drop(a);
        assert_eq!(b.view().unwrap().primary_machine(), Some(2));
    }

    #[test]
    fn subscription_sees_changes() {
        let core = Arc::new(MemoryCore::new());
        let a = core.session();
        let mut sub = a.subscribe();
        let before = *sub.borrow();
        a.register(member(1)).unwrap();
        assert!(sub.has_changed().unwrap());
        assert!(*sub.borrow_and_update() > before);
    }
}
