//! Record lock manager
//!
//! Shared/exclusive locks on record ids with FIFO-ish waiting and
//! deadlock detection by cycle search over the wait-for graph. A cycle
//! is broken by aborting the youngest transaction in it (transaction
//! ids are assigned monotonically, so youngest = highest id).

use std::collections::{HashMap, HashSet};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// What a lock protects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum LockResource {
    Node(u32),
    Relationship(u32),
    /// Token creation is serialized cluster-wide
    TokenTable,
}

#[derive(Debug, Default)]
struct LockState {
    /// Holder tx id → (shared count, exclusive count); counts allow
    /// reentrant acquisition
    holders: HashMap<u64, (u32, u32)>,
}

impl LockState {
    fn can_grant(&self, tx: u64, exclusive: bool) -> bool {
        if exclusive {
            self.holders.keys().all(|&h| h == tx)
        } else {
            self.holders
                .iter()
                .all(|(&h, &(_, excl))| h == tx || excl == 0)
        }
    }

    fn grant(&mut self, tx: u64, exclusive: bool) {
        let entry = self.holders.entry(tx).or_insert((0, 0));
        if exclusive {
            entry.1 += 1;
        } else {
            entry.0 += 1;
        }
    }

    fn blockers(&self, tx: u64, exclusive: bool) -> Vec<u64> {
        self.holders
            .iter()
            .filter(|(&h, &(_, excl))| h != tx && (exclusive || excl > 0))
            .map(|(&h, _)| h)
            .collect()
    }
}

#[derive(Default)]
struct LockTables {
    locks: HashMap<LockResource, LockState>,
    /// waiter → transactions it is blocked on
    wait_for: HashMap<u64, HashSet<u64>>,
    /// Victims chosen by the deadlock detector, to abort at next wake
    doomed: HashSet<u64>,
}

impl LockTables {
    /// Transactions in a wait-for cycle through `start`, empty when acyclic
    fn find_cycle(&self, start: u64) -> Vec<u64> {
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        if self.dfs(start, start, &mut path, &mut visited) {
            path
        } else {
            Vec::new()
        }
    }

    fn dfs(&self, current: u64, target: u64, path: &mut Vec<u64>, visited: &mut HashSet<u64>) -> bool {
        if !visited.insert(current) {
            return false;
        }
        path.push(current);
        if let Some(next) = self.wait_for.get(&current) {
            for &n in next {
                if n == target && path.len() > 1 {
                    return true;
                }
                if self.dfs(n, target, path, visited) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }
}

/// Lock manager shared by all transactions of one engine
pub struct LockManager {
    tables: Mutex<LockTables>,
    changed: Condvar,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(LockTables::default()),
            changed: Condvar::new(),
        }
    }

    /// Acquire a shared (read) lock, blocking until granted
    pub fn acquire_shared(&self, tx: u64, resource: LockResource) -> Result<()> {
        self.acquire(tx, resource, false)
    }

    /// Acquire an exclusive (write) lock, blocking until granted
    pub fn acquire_exclusive(&self, tx: u64, resource: LockResource) -> Result<()> {
        self.acquire(tx, resource, true)
    }

    fn acquire(&self, tx: u64, resource: LockResource, exclusive: bool) -> Result<()> {
        let mut tables = self.tables.lock();
        loop {
            if tables.doomed.remove(&tx) {
                tables.wait_for.remove(&tx);
                self.changed.notify_all();
                return Err(Error::DeadlockDetected(tx));
            }

            let state = tables.locks.entry(resource).or_default();
            if state.can_grant(tx, exclusive) {
                state.grant(tx, exclusive);
                tables.wait_for.remove(&tx);
                return Ok(());
            }

            let blockers: HashSet<u64> = state.blockers(tx, exclusive).into_iter().collect();
            tables.wait_for.insert(tx, blockers);

            let cycle = tables.find_cycle(tx);
            if !cycle.is_empty() {
                let victim = *cycle.iter().max().expect("non-empty cycle");
                tracing::debug!(?cycle, victim, "breaking lock cycle");
                if victim == tx {
                    tables.wait_for.remove(&tx);
                    self.changed.notify_all();
                    return Err(Error::DeadlockDetected(tx));
                }
                tables.doomed.insert(victim);
                self.changed.notify_all();
            }

            self.changed.wait(&mut tables);
        }
    }

    /// Release every lock held by `tx`
    pub fn release_all(&self, tx: u64) {
        let mut tables = self.tables.lock();
        tables.locks.retain(|_, state| {
            state.holders.remove(&tx);
            !state.holders.is_empty()
        });
        tables.wait_for.remove(&tx);
        tables.doomed.remove(&tx);
        self.changed.notify_all();
    }

    /// Number of resources currently locked (diagnostics)
    pub fn locked_count(&self) -> usize {
        self.tables.lock().locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn shared_locks_coexist() {
        let locks = LockManager::new();
        locks.acquire_shared(1, LockResource::Node(7)).unwrap();
        locks.acquire_shared(2, LockResource::Node(7)).unwrap();
        locks.release_all(1);
        locks.release_all(2);
        assert_eq!(locks.locked_count(), 0);
    }

    #[test]
    fn exclusive_blocks_until_release() {
        let locks = Arc::new(LockManager::new());
        locks.acquire_exclusive(1, LockResource::Node(1)).unwrap();

        let locks2 = Arc::clone(&locks);
        let handle = std::thread::spawn(move || {
            locks2.acquire_exclusive(2, LockResource::Node(1)).unwrap();
            locks2.release_all(2);
        });

        std::thread::sleep(Duration::from_millis(50));
        locks.release_all(1);
        handle.join().unwrap();
    }

    #[test]
    fn reentrant_and_upgrade() {
        let locks = LockManager::new();
        locks.acquire_shared(1, LockResource::Node(1)).unwrap();
        locks.acquire_shared(1, LockResource::Node(1)).unwrap();
        // Sole holder may upgrade
        locks.acquire_exclusive(1, LockResource::Node(1)).unwrap();
        locks.release_all(1);
    }

    #[test]
    fn deadlock_aborts_youngest() {
        let locks = Arc::new(LockManager::new());

        // tx 1 (older) takes A; tx 2 (younger) takes B
        locks.acquire_exclusive(1, LockResource::Node(1)).unwrap();
        locks.acquire_exclusive(2, LockResource::Node(2)).unwrap();

        let l1 = Arc::clone(&locks);
        let older = std::thread::spawn(move || {
            // 1 wants B → blocks on 2
            let res = l1.acquire_exclusive(1, LockResource::Node(2));
            l1.release_all(1);
            res
        });

        std::thread::sleep(Duration::from_millis(50));

        // 2 wants A → cycle {1, 2}; youngest (2) aborts
        let res = locks.acquire_exclusive(2, LockResource::Node(1));
        assert!(matches!(res, Err(Error::DeadlockDetected(2))));
        locks.release_all(2);

        // The older transaction proceeds once 2's locks are gone
        assert!(older.join().unwrap().is_ok());
    }
}
