//! Embedded engine
//!
//! `GraphDb` is one node's graph engine: store, logical logs,
//! transaction coordinator and the minimal data API the replicated core
//! serves. Construction hooks swap the id, lock and commit strategies
//! so the same engine runs standalone, as a primary, or as a follower.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::AntlerConfig;
use crate::datasource::{DataSource, DataSourceRegistry, GraphDataSource, GRAPH_SOURCE};
use crate::error::{Error, Result};
use crate::index::{IndexCommand, KeyIndexSource, KEY_INDEX_SOURCE};
use crate::store::record::{
    NodeRecord, PropertyKind, PropertyRecord, Record, RelationshipRecord, TokenKind, TokenRecord,
    NO_REFERENCE,
};
use crate::store::{
    graph::{build_dynamic_chain, pack_int_array},
    Command, GraphStore, IdKind, PropertyValue, StoreId, StorePaths,
};
use crate::tx::{LockManager, LockResource, Locks, RemoteCommitHook, TxHandle, TxManager};

/// Hands out record ids: store-backed locally, range-leased on followers
pub trait IdAssigner: Send + Sync {
    fn next(&self, kind: IdKind) -> Result<u32>;
    fn release(&self, kind: IdKind, id: u32);
    /// Drop cached leases; called when the primary epoch changes
    fn forget_leases(&self);
}

/// Store-backed assigner used on primaries and standalone nodes
pub struct LocalIdAssigner {
    store: Arc<GraphStore>,
}

impl LocalIdAssigner {
    pub fn new(store: Arc<GraphStore>) -> Self {
        Self { store }
    }
}

impl IdAssigner for LocalIdAssigner {
    fn next(&self, kind: IdKind) -> Result<u32> {
        Ok(self.store.allocator(kind).allocate())
    }

    fn release(&self, kind: IdKind, id: u32) {
        self.store.allocator(kind).release(id);
    }

    fn forget_leases(&self) {}
}

/// Strategy overrides wired in by the lifecycle supervisor
#[derive(Default)]
pub struct EngineHooks {
    pub locks: Option<Arc<dyn Locks>>,
    pub ids: Option<Arc<dyn IdAssigner>>,
    pub remote_commit: Option<Arc<dyn RemoteCommitHook>>,
}

/// One node's embedded graph engine
pub struct GraphDb {
    dir: PathBuf,
    store: Arc<GraphStore>,
    index: Arc<KeyIndexSource>,
    tx: Arc<TxManager>,
    lock_tables: Arc<LockManager>,
    ids: Arc<dyn IdAssigner>,
    read_only: bool,
}

impl GraphDb {
    /// Open the engine in `dir`, creating a store when none exists.
    /// `store_id` is only consulted at creation time.
    pub fn open(
        dir: &Path,
        config: &AntlerConfig,
        store_id: Option<StoreId>,
        hooks: EngineHooks,
    ) -> Result<Self> {
        let paths = StorePaths::new(dir);
        let mapped = config
            .store
            .use_memory_mapped_buffers
            .unwrap_or(cfg!(target_pointer_width = "64"));
        let keep_logs = config.store.keep_logical_logs || config.is_clustered();
        let rotate_at = config.store.rotate_at_bytes;

        let store = if paths.is_empty_store() {
            if config.node.read_only {
                return Err(Error::ReadOnly);
            }
            Arc::new(GraphStore::create(
                dir,
                store_id.unwrap_or_default(),
                mapped,
            )?)
        } else {
            Arc::new(GraphStore::open(dir, mapped)?)
        };

        let graph_source = GraphDataSource::open(store.clone(), dir, keep_logs, rotate_at)?;
        let index = Arc::new(KeyIndexSource::open(
            dir,
            store.store_id(),
            keep_logs,
            rotate_at,
        )?);

        // Commit order: the graph store strictly before secondary indexes
        let mut registry = DataSourceRegistry::new();
        registry.register(Arc::new(graph_source));
        registry.register(index.clone());

        let lock_tables = Arc::new(LockManager::new());
        let locks: Arc<dyn Locks> = hooks.locks.unwrap_or_else(|| lock_tables.clone());
        let ids: Arc<dyn IdAssigner> = hooks
            .ids
            .unwrap_or_else(|| Arc::new(LocalIdAssigner::new(store.clone())));

        let tx = Arc::new(TxManager::new(registry, locks));
        tx.set_epoch(store.primary_epoch().max(1));
        if let Some(hook) = hooks.remote_commit {
            tx.set_remote_hook(Some(hook));
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            store,
            index,
            tx,
            lock_tables,
            ids,
            read_only: config.node.read_only,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    pub fn store_id(&self) -> StoreId {
        self.store.store_id()
    }

    pub fn registry(&self) -> &DataSourceRegistry {
        self.tx.registry()
    }

    pub fn tx_manager(&self) -> &Arc<TxManager> {
        &self.tx
    }

    /// The local lock tables, served to followers when this node is
    /// primary
    pub fn lock_tables(&self) -> &Arc<LockManager> {
        &self.lock_tables
    }

    pub fn id_assigner(&self) -> &Arc<dyn IdAssigner> {
        &self.ids
    }

    /// Begin a transaction bound to the calling thread
    pub fn begin_tx(&self) -> Result<Transaction<'_>> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(Transaction {
            db: self,
            handle: self.tx.begin(),
            working: Mutex::new(WorkingSet::default()),
            finished: false,
        })
    }

    // ── Reads (committed state) ────────────────────────

    pub fn node_exists(&self, id: u32) -> Result<bool> {
        Ok(self.store.node(id)?.in_use)
    }

    /// A node's property by key name
    pub fn node_property(&self, id: u32, key: &str) -> Result<Option<PropertyValue>> {
        let node = self.store.node(id)?;
        if !node.in_use {
            return Err(Error::RecordNotInUse(id));
        }
        let key_id = match self.store.token_id(TokenKind::PropertyKey, key) {
            Some(k) => k,
            None => return Ok(None),
        };
        let mut prop_id = node.first_prop;
        while prop_id != NO_REFERENCE {
            let prop = self.store.property(prop_id)?;
            if !prop.in_use {
                break;
            }
            if prop.key_id == key_id {
                return Ok(Some(self.store.read_value(&prop)?));
            }
            prop_id = prop.next_prop;
        }
        Ok(None)
    }

    /// `(relationship id, type name, other endpoint)` for a node
    pub fn relationships(&self, node_id: u32) -> Result<Vec<(u32, String, u32)>> {
        let node = self.store.node(node_id)?;
        if !node.in_use {
            return Err(Error::RecordNotInUse(node_id));
        }
        let mut out = Vec::new();
        let mut rel_id = node.first_rel;
        while rel_id != NO_REFERENCE {
            let rel = self.store.relationship(rel_id)?;
            if !rel.in_use {
                break;
            }
            let type_name = self
                .store
                .token_name(rel.type_id)
                .unwrap_or_else(|| format!("?{}", rel.type_id));
            let (other, next) = if rel.start_node == node_id {
                (rel.end_node, rel.start_next)
            } else {
                (rel.start_node, rel.end_next)
            };
            out.push((rel_id, type_name, other));
            rel_id = next;
        }
        Ok(out)
    }

    /// Exact-match index lookup
    pub fn index_get(&self, key: &str, value: &str) -> Vec<u32> {
        self.index.get(key, value)
    }

    /// Flush all data sources (checkpoint)
    pub fn flush(&self) -> Result<()> {
        self.registry().flush_all()
    }

    /// Clean shutdown of the engine
    pub fn shutdown(&self) -> Result<()> {
        self.registry().close_all()
    }
}

#[derive(Debug, Clone)]
struct Touched<R> {
    before: R,
    after: R,
}

#[derive(Default)]
struct WorkingSet {
    nodes: BTreeMap<u32, Touched<NodeRecord>>,
    relationships: BTreeMap<u32, Touched<RelationshipRecord>>,
    properties: BTreeMap<u32, Touched<PropertyRecord>>,
    dynamic_strings: Vec<(u32, crate::store::record::DynamicRecord, bool)>,
    dynamic_arrays: Vec<(u32, crate::store::record::DynamicRecord, bool)>,
    /// `(token id, record, name)`; the name backs in-transaction lookups
    tokens: Vec<(u32, TokenRecord, String)>,
    index: Vec<IndexCommand>,
    /// Ids taken from the assigner, returned on rollback
    allocated: Vec<(IdKind, u32)>,
}

/// A write transaction; reads through it see its own writes
pub struct Transaction<'db> {
    db: &'db GraphDb,
    handle: TxHandle,
    working: Mutex<WorkingSet>,
    finished: bool,
}

impl<'db> Transaction<'db> {
    fn allocate(&self, kind: IdKind) -> Result<u32> {
        let id = self.db.ids.next(kind)?;
        self.working.lock().allocated.push((kind, id));
        Ok(id)
    }

    fn lock_exclusive(&self, resource: LockResource) -> Result<()> {
        self.db.tx.locks().acquire_exclusive(self.handle.id(), resource)
    }

    // ── Record views: working set over committed store ─

    fn node_view(&self, id: u32) -> Result<NodeRecord> {
        if let Some(touched) = self.working.lock().nodes.get(&id) {
            return Ok(touched.after.clone());
        }
        self.db.store.node(id)
    }

    fn rel_view(&self, id: u32) -> Result<RelationshipRecord> {
        if let Some(touched) = self.working.lock().relationships.get(&id) {
            return Ok(touched.after.clone());
        }
        self.db.store.relationship(id)
    }

    fn prop_view(&self, id: u32) -> Result<PropertyRecord> {
        if let Some(touched) = self.working.lock().properties.get(&id) {
            return Ok(touched.after.clone());
        }
        self.db.store.property(id)
    }

    fn put_node(&self, id: u32, after: NodeRecord, created: bool) -> Result<()> {
        let mut working = self.working.lock();
        match working.nodes.get_mut(&id) {
            Some(touched) => touched.after = after,
            None => {
                let before = if created {
                    NodeRecord::unused()
                } else {
                    self.db.store.node(id)?
                };
                working.nodes.insert(
                    id,
                    Touched { before, after },
                );
            }
        }
        Ok(())
    }

    fn put_rel(&self, id: u32, after: RelationshipRecord, created: bool) -> Result<()> {
        let mut working = self.working.lock();
        match working.relationships.get_mut(&id) {
            Some(touched) => touched.after = after,
            None => {
                let before = if created {
                    RelationshipRecord::unused()
                } else {
                    self.db.store.relationship(id)?
                };
                working.relationships.insert(
                    id,
                    Touched { before, after },
                );
            }
        }
        Ok(())
    }

    fn put_prop(&self, id: u32, after: PropertyRecord, created: bool) -> Result<()> {
        let mut working = self.working.lock();
        match working.properties.get_mut(&id) {
            Some(touched) => touched.after = after,
            None => {
                let before = if created {
                    PropertyRecord::unused()
                } else {
                    self.db.store.property(id)?
                };
                working.properties.insert(
                    id,
                    Touched { before, after },
                );
            }
        }
        Ok(())
    }

    // ── Tokens ─────────────────────────────────────────

    fn get_or_create_token(&self, kind: TokenKind, name: &str) -> Result<u32> {
        if let Some(id) = self.db.store.token_id(kind, name) {
            return Ok(id);
        }
        {
            let working = self.working.lock();
            if let Some((id, _, _)) = working
                .tokens
                .iter()
                .find(|(_, rec, n)| rec.kind == kind && n == name)
            {
                return Ok(*id);
            }
        }
        // Token creation is serialized cluster-wide
        self.lock_exclusive(LockResource::TokenTable)?;
        if let Some(id) = self.db.store.token_id(kind, name) {
            return Ok(id);
        }
        let name_block = self.spill_dynamic(IdKind::DynamicString, name.as_bytes())?;
        let id = self.allocate(IdKind::Token)?;
        self.working.lock().tokens.push((
            id,
            TokenRecord {
                in_use: true,
                kind,
                name_block,
            },
            name.to_string(),
        ));
        Ok(id)
    }

    // ── Graph operations ───────────────────────────────

    /// Create a node, returning its id
    pub fn create_node(&self) -> Result<u32> {
        let id = self.allocate(IdKind::Node)?;
        self.lock_exclusive(LockResource::Node(id))?;
        self.put_node(
            id,
            NodeRecord {
                in_use: true,
                first_rel: NO_REFERENCE,
                first_prop: NO_REFERENCE,
            },
            true,
        )?;
        Ok(id)
    }

    /// Delete a node; its relationships must already be gone
    pub fn delete_node(&self, id: u32) -> Result<()> {
        self.lock_exclusive(LockResource::Node(id))?;
        let node = self.node_view(id)?;
        if !node.in_use {
            return Err(Error::RecordNotInUse(id));
        }
        if node.first_rel != NO_REFERENCE {
            return Err(Error::Transaction(format!(
                "node {id} still has relationships"
            )));
        }
        // Drop the property chain with the node
        let mut prop_id = node.first_prop;
        while prop_id != NO_REFERENCE {
            let prop = self.prop_view(prop_id)?;
            self.delete_property_record(prop_id, &prop)?;
            prop_id = prop.next_prop;
        }
        self.put_node(id, NodeRecord::unused(), false)?;
        Ok(())
    }

    /// Create a relationship between two nodes, returning its id
    pub fn create_relationship(&self, type_name: &str, start: u32, end: u32) -> Result<u32> {
        let type_id = self.get_or_create_token(TokenKind::RelationshipType, type_name)?;

        // Lock both endpoints in id order so concurrent creates cannot
        // deadlock on each other
        let (first, second) = if start <= end { (start, end) } else { (end, start) };
        self.lock_exclusive(LockResource::Node(first))?;
        if first != second {
            self.lock_exclusive(LockResource::Node(second))?;
        }

        let mut start_node = self.node_view(start)?;
        if !start_node.in_use {
            return Err(Error::RecordNotInUse(start));
        }
        let mut end_node = self.node_view(end)?;
        if !end_node.in_use {
            return Err(Error::RecordNotInUse(end));
        }

        let id = self.allocate(IdKind::Relationship)?;
        self.lock_exclusive(LockResource::Relationship(id))?;

        let mut rel = RelationshipRecord {
            in_use: true,
            start_node: start,
            end_node: end,
            type_id,
            start_prev: NO_REFERENCE,
            start_next: start_node.first_rel,
            end_prev: NO_REFERENCE,
            end_next: end_node.first_rel,
            first_prop: NO_REFERENCE,
        };

        // Splice into the head of both endpoint chains
        if start_node.first_rel != NO_REFERENCE {
            let head_id = start_node.first_rel;
            self.lock_exclusive(LockResource::Relationship(head_id))?;
            let mut head = self.rel_view(head_id)?;
            if head.start_node == start {
                head.start_prev = id;
            } else {
                head.end_prev = id;
            }
            self.put_rel(head_id, head, false)?;
        }
        start_node.first_rel = id;
        self.put_node(start, start_node, false)?;

        if start == end {
            // A self-loop sits at the chain head once; both chain
            // pointers of the record are its own
            rel.end_next = rel.start_next;
        } else {
            let end_node_now = self.node_view(end)?;
            if end_node_now.first_rel != NO_REFERENCE && end_node_now.first_rel != id {
                let head_id = end_node_now.first_rel;
                self.lock_exclusive(LockResource::Relationship(head_id))?;
                let mut head = self.rel_view(head_id)?;
                if head.start_node == end {
                    head.start_prev = id;
                } else {
                    head.end_prev = id;
                }
                self.put_rel(head_id, head, false)?;
            }
            end_node = self.node_view(end)?;
            rel.end_next = end_node.first_rel;
            end_node.first_rel = id;
            self.put_node(end, end_node, false)?;
        }

        self.put_rel(id, rel, true)?;
        Ok(id)
    }

    /// Delete a relationship, unlinking it from both endpoint chains
    pub fn delete_relationship(&self, id: u32) -> Result<()> {
        self.lock_exclusive(LockResource::Relationship(id))?;
        let rel = self.rel_view(id)?;
        if !rel.in_use {
            return Err(Error::RecordNotInUse(id));
        }
        let (first, second) = if rel.start_node <= rel.end_node {
            (rel.start_node, rel.end_node)
        } else {
            (rel.end_node, rel.start_node)
        };
        self.lock_exclusive(LockResource::Node(first))?;
        if first != second {
            self.lock_exclusive(LockResource::Node(second))?;
        }

        self.unlink_from_chain(&rel, rel.start_node, true)?;
        if rel.start_node != rel.end_node {
            self.unlink_from_chain(&rel, rel.end_node, false)?;
        }

        let mut prop_id = rel.first_prop;
        while prop_id != NO_REFERENCE {
            let prop = self.prop_view(prop_id)?;
            self.delete_property_record(prop_id, &prop)?;
            prop_id = prop.next_prop;
        }

        self.put_rel(id, RelationshipRecord::unused(), false)?;
        Ok(())
    }

    fn unlink_from_chain(
        &self,
        rel: &RelationshipRecord,
        node_id: u32,
        start_side: bool,
    ) -> Result<()> {
        let (prev, next) = if start_side {
            (rel.start_prev, rel.start_next)
        } else {
            (rel.end_prev, rel.end_next)
        };

        if prev == NO_REFERENCE {
            let mut node = self.node_view(node_id)?;
            node.first_rel = next;
            self.put_node(node_id, node, false)?;
        } else {
            self.lock_exclusive(LockResource::Relationship(prev))?;
            let mut prev_rel = self.rel_view(prev)?;
            if prev_rel.start_node == node_id {
                prev_rel.start_next = next;
            } else {
                prev_rel.end_next = next;
            }
            self.put_rel(prev, prev_rel, false)?;
        }

        if next != NO_REFERENCE {
            self.lock_exclusive(LockResource::Relationship(next))?;
            let mut next_rel = self.rel_view(next)?;
            if next_rel.start_node == node_id {
                next_rel.start_prev = prev;
            } else {
                next_rel.end_prev = prev;
            }
            self.put_rel(next, next_rel, false)?;
        }
        Ok(())
    }

    // ── Properties ─────────────────────────────────────

    /// Set a property on a node, replacing any previous value
    pub fn set_node_property(&self, node_id: u32, key: &str, value: PropertyValue) -> Result<()> {
        self.lock_exclusive(LockResource::Node(node_id))?;
        let mut node = self.node_view(node_id)?;
        if !node.in_use {
            return Err(Error::RecordNotInUse(node_id));
        }
        let key_id = self.get_or_create_token(TokenKind::PropertyKey, key)?;

        // Replace in place when the key already exists in the chain
        let mut prop_id = node.first_prop;
        while prop_id != NO_REFERENCE {
            let prop = self.prop_view(prop_id)?;
            if !prop.in_use {
                break;
            }
            if prop.key_id == key_id {
                self.release_spilled_value(&prop)?;
                let (kind, payload) = self.encode_value(&value)?;
                self.put_prop(
                    prop_id,
                    PropertyRecord {
                        in_use: true,
                        key_id,
                        kind,
                        payload,
                        next_prop: prop.next_prop,
                    },
                    false,
                )?;
                return Ok(());
            }
            prop_id = prop.next_prop;
        }

        // Prepend a fresh record
        let (kind, payload) = self.encode_value(&value)?;
        let new_id = self.allocate(IdKind::Property)?;
        self.put_prop(
            new_id,
            PropertyRecord {
                in_use: true,
                key_id,
                kind,
                payload,
                next_prop: node.first_prop,
            },
            true,
        )?;
        node.first_prop = new_id;
        self.put_node(node_id, node, false)?;
        Ok(())
    }

    /// Read a node property through the transaction
    pub fn node_property(&self, node_id: u32, key: &str) -> Result<Option<PropertyValue>> {
        let node = self.node_view(node_id)?;
        if !node.in_use {
            return Err(Error::RecordNotInUse(node_id));
        }
        let key_id = match self.db.store.token_id(TokenKind::PropertyKey, key).or_else(|| {
            self.working
                .lock()
                .tokens
                .iter()
                .find(|(_, rec, n)| rec.kind == TokenKind::PropertyKey && n == key)
                .map(|(id, _, _)| *id)
        }) {
            Some(k) => k,
            None => return Ok(None),
        };

        let mut prop_id = node.first_prop;
        while prop_id != NO_REFERENCE {
            let prop = self.prop_view(prop_id)?;
            if !prop.in_use {
                break;
            }
            if prop.key_id == key_id {
                return self.read_value(&prop).map(Some);
            }
            prop_id = prop.next_prop;
        }
        Ok(None)
    }

    fn read_value(&self, prop: &PropertyRecord) -> Result<PropertyValue> {
        // Values written by this transaction live in the working set
        let working = self.working.lock();
        let find = |blocks: &[(u32, crate::store::record::DynamicRecord, bool)], head: u32| {
            let mut out = Vec::new();
            let mut next = head;
            'chain: loop {
                for (id, rec, _) in blocks {
                    if *id == next {
                        out.extend_from_slice(&rec.data);
                        if rec.next_block == NO_REFERENCE {
                            break 'chain;
                        }
                        next = rec.next_block;
                        continue 'chain;
                    }
                }
                return None;
            }
            Some(out)
        };
        match prop.kind {
            PropertyKind::String => {
                if let Some(bytes) = find(&working.dynamic_strings, prop.payload as u32) {
                    return Ok(PropertyValue::Str(
                        String::from_utf8_lossy(&bytes).into_owned(),
                    ));
                }
            }
            PropertyKind::IntArray => {
                if let Some(bytes) = find(&working.dynamic_arrays, prop.payload as u32) {
                    let values = bytes
                        .chunks_exact(8)
                        .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
                        .collect();
                    return Ok(PropertyValue::IntArray(values));
                }
            }
            _ => {}
        }
        drop(working);
        self.db.store.read_value(prop)
    }

    fn encode_value(&self, value: &PropertyValue) -> Result<(PropertyKind, u64)> {
        Ok(match value {
            PropertyValue::Bool(b) => (PropertyKind::Bool, *b as u64),
            PropertyValue::Int(i) => (PropertyKind::Int, *i as u64),
            PropertyValue::Float(f) => (PropertyKind::Float, f.to_bits()),
            PropertyValue::Str(s) => {
                let head = self.spill_dynamic(IdKind::DynamicString, s.as_bytes())?;
                (PropertyKind::String, head as u64)
            }
            PropertyValue::IntArray(values) => {
                let head = self.spill_dynamic(IdKind::DynamicArray, &pack_int_array(values))?;
                (PropertyKind::IntArray, head as u64)
            }
        })
    }

    fn spill_dynamic(&self, kind: IdKind, data: &[u8]) -> Result<u32> {
        let needed = data
            .chunks(crate::store::record::DYNAMIC_BLOCK_DATA)
            .count()
            .max(1);
        let mut ids = Vec::with_capacity(needed);
        for _ in 0..needed {
            ids.push(self.allocate(kind)?);
        }
        let mut next = ids.into_iter();
        let blocks = build_dynamic_chain(data, || next.next().expect("sized above"));
        let head = blocks[0].0;
        let mut working = self.working.lock();
        let target = match kind {
            IdKind::DynamicString => &mut working.dynamic_strings,
            IdKind::DynamicArray => &mut working.dynamic_arrays,
            _ => unreachable!(),
        };
        for (id, record) in blocks {
            target.push((id, record, true));
        }
        Ok(head)
    }

    /// Release the dynamic chain behind a replaced or deleted value
    fn release_spilled_value(&self, prop: &PropertyRecord) -> Result<()> {
        let kind = match prop.kind {
            PropertyKind::String => IdKind::DynamicString,
            PropertyKind::IntArray => IdKind::DynamicArray,
            _ => return Ok(()),
        };
        for (id, record) in self
            .db
            .store
            .dynamic_chain_records(kind, prop.payload as u32)?
        {
            let mut dead = record;
            dead.in_use = false;
            dead.data.clear();
            dead.length = 0;
            let mut working = self.working.lock();
            match kind {
                IdKind::DynamicString => working.dynamic_strings.push((id, dead, false)),
                IdKind::DynamicArray => working.dynamic_arrays.push((id, dead, false)),
                _ => unreachable!(),
            }
        }
        Ok(())
    }

    fn delete_property_record(&self, id: u32, prop: &PropertyRecord) -> Result<()> {
        self.release_spilled_value(prop)?;
        self.put_prop(id, PropertyRecord::unused(), false)
    }

    // ── Index ──────────────────────────────────────────

    /// Add `(key, value) → node` to the secondary index
    pub fn index_add(&self, key: &str, value: &str, node_id: u32) -> Result<()> {
        self.working.lock().index.push(IndexCommand::Add {
            key: key.to_string(),
            value: value.to_string(),
            node_id,
        });
        Ok(())
    }

    /// Remove `(key, value) → node` from the secondary index
    pub fn index_remove(&self, key: &str, value: &str, node_id: u32) -> Result<()> {
        self.working.lock().index.push(IndexCommand::Remove {
            key: key.to_string(),
            value: value.to_string(),
            node_id,
        });
        Ok(())
    }

    // ── Completion ─────────────────────────────────────

    /// Commit: build the per-source command streams and run them
    /// through the coordinator
    pub fn commit(mut self) -> Result<Vec<(String, u64)>> {
        let streams = {
            let working = self.working.lock();
            let mut graph: Vec<Vec<u8>> = Vec::new();
            // Dynamic blocks go first: token commands resolve their name
            // chains from the store while being applied
            for (id, record, created) in &working.dynamic_strings {
                graph.push(bincode::serialize(&Command::DynamicString {
                    id: *id,
                    before: if *created {
                        crate::store::record::DynamicRecord::unused()
                    } else {
                        self.db.store.dynamic_chain_records(IdKind::DynamicString, *id)?
                            .into_iter()
                            .next()
                            .map(|(_, r)| r)
                            .unwrap_or_else(crate::store::record::DynamicRecord::unused)
                    },
                    after: record.clone(),
                })?);
            }
            for (id, record, created) in &working.dynamic_arrays {
                graph.push(bincode::serialize(&Command::DynamicArray {
                    id: *id,
                    before: if *created {
                        crate::store::record::DynamicRecord::unused()
                    } else {
                        self.db.store.dynamic_chain_records(IdKind::DynamicArray, *id)?
                            .into_iter()
                            .next()
                            .map(|(_, r)| r)
                            .unwrap_or_else(crate::store::record::DynamicRecord::unused)
                    },
                    after: record.clone(),
                })?);
            }
            for (id, token, _) in &working.tokens {
                graph.push(bincode::serialize(&Command::Token {
                    id: *id,
                    after: token.clone(),
                })?);
            }
            for (id, t) in &working.nodes {
                graph.push(bincode::serialize(&Command::Node {
                    id: *id,
                    before: t.before.clone(),
                    after: t.after.clone(),
                })?);
            }
            for (id, t) in &working.relationships {
                graph.push(bincode::serialize(&Command::Relationship {
                    id: *id,
                    before: t.before.clone(),
                    after: t.after.clone(),
                })?);
            }
            for (id, t) in &working.properties {
                graph.push(bincode::serialize(&Command::Property {
                    id: *id,
                    before: t.before.clone(),
                    after: t.after.clone(),
                })?);
            }

            let mut index: Vec<Vec<u8>> = Vec::new();
            for command in &working.index {
                index.push(bincode::serialize(command)?);
            }

            vec![
                (GRAPH_SOURCE.to_string(), graph),
                (KEY_INDEX_SOURCE.to_string(), index),
            ]
        };

        self.finished = true;
        self.db.tx.commit(&self.handle, streams)
    }

    /// Discard the transaction
    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        let working = std::mem::take(&mut *self.working.lock());
        for (kind, id) in working.allocated {
            self.db.ids.release(kind, id);
        }
        self.db.tx.rollback(&self.handle)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let working = std::mem::take(&mut *self.working.lock());
            for (kind, id) in working.allocated {
                self.db.ids.release(kind, id);
            }
            let _ = self.db.tx.rollback(&self.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config() -> AntlerConfig {
        AntlerConfig::from_toml("[node]\nmachine_id = 1\n[store]\nkeep_logical_logs = true\n")
            .unwrap()
    }

    fn open_db(dir: &Path) -> GraphDb {
        GraphDb::open(dir, &config(), None, EngineHooks::default()).unwrap()
    }

    #[test]
    fn create_commit_read() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());

        let tx = db.begin_tx().unwrap();
        let node = tx.create_node().unwrap();
        tx.set_node_property(node, "name", PropertyValue::Str("alice".into()))
            .unwrap();
        tx.set_node_property(node, "age", PropertyValue::Int(30)).unwrap();
        tx.commit().unwrap();

        assert!(db.node_exists(node).unwrap());
        assert_eq!(
            db.node_property(node, "name").unwrap(),
            Some(PropertyValue::Str("alice".into()))
        );
        assert_eq!(
            db.node_property(node, "age").unwrap(),
            Some(PropertyValue::Int(30))
        );
        assert_eq!(db.node_property(node, "missing").unwrap(), None);
    }

    #[test]
    fn rollback_leaves_no_trace() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());

        let tx = db.begin_tx().unwrap();
        let node = tx.create_node().unwrap();
        tx.rollback().unwrap();

        assert!(!db.node_exists(node).unwrap());
        // The released id is handed out again
        let tx = db.begin_tx().unwrap();
        assert_eq!(tx.create_node().unwrap(), node);
        tx.commit().unwrap();
    }

    #[test]
    fn relationships_link_and_unlink() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());

        let tx = db.begin_tx().unwrap();
        let a = tx.create_node().unwrap();
        let b = tx.create_node().unwrap();
        let c = tx.create_node().unwrap();
        let ab = tx.create_relationship("KNOWS", a, b).unwrap();
        let ac = tx.create_relationship("KNOWS", a, c).unwrap();
        tx.commit().unwrap();

        let rels = db.relationships(a).unwrap();
        assert_eq!(rels.len(), 2);
        // Chain head is the most recently created
        assert_eq!(rels[0].0, ac);
        assert_eq!(rels[0].2, c);
        assert_eq!(rels[1].0, ab);
        assert_eq!(rels[1].2, b);
        assert_eq!(db.relationships(b).unwrap().len(), 1);

        let tx = db.begin_tx().unwrap();
        tx.delete_relationship(ab).unwrap();
        tx.commit().unwrap();

        assert_eq!(db.relationships(a).unwrap().len(), 1);
        assert!(db.relationships(b).unwrap().is_empty());
    }

    #[test]
    fn delete_node_requires_no_relationships() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());

        let tx = db.begin_tx().unwrap();
        let a = tx.create_node().unwrap();
        let b = tx.create_node().unwrap();
        let rel = tx.create_relationship("LINKS", a, b).unwrap();
        tx.commit().unwrap();

        let tx = db.begin_tx().unwrap();
        assert!(tx.delete_node(a).is_err());
        tx.rollback().unwrap();

        let tx = db.begin_tx().unwrap();
        tx.delete_relationship(rel).unwrap();
        tx.delete_node(a).unwrap();
        tx.commit().unwrap();
        assert!(!db.node_exists(a).unwrap());
    }

    #[test]
    fn long_string_spills_and_reads_back() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());

        let text: String = "antler".repeat(100);
        let tx = db.begin_tx().unwrap();
        let node = tx.create_node().unwrap();
        tx.set_node_property(node, "bio", PropertyValue::Str(text.clone()))
            .unwrap();
        // Read-your-writes before commit
        assert_eq!(
            tx.node_property(node, "bio").unwrap(),
            Some(PropertyValue::Str(text.clone()))
        );
        tx.commit().unwrap();

        assert_eq!(
            db.node_property(node, "bio").unwrap(),
            Some(PropertyValue::Str(text))
        );
    }

    #[test]
    fn property_overwrite_replaces_value() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());

        let tx = db.begin_tx().unwrap();
        let node = tx.create_node().unwrap();
        tx.set_node_property(node, "n", PropertyValue::Int(1)).unwrap();
        tx.commit().unwrap();

        let tx = db.begin_tx().unwrap();
        tx.set_node_property(node, "n", PropertyValue::Int(2)).unwrap();
        tx.commit().unwrap();

        assert_eq!(
            db.node_property(node, "n").unwrap(),
            Some(PropertyValue::Int(2))
        );
    }

    #[test]
    fn index_participates_in_commit() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());

        let tx = db.begin_tx().unwrap();
        let node = tx.create_node().unwrap();
        tx.index_add("name", "carol", node).unwrap();
        tx.commit().unwrap();

        assert_eq!(db.index_get("name", "carol"), vec![node]);

        // Graph committed before the index: both advanced by one
        assert_eq!(
            db.registry().require(GRAPH_SOURCE).unwrap().last_committed_tx_id(),
            1
        );
        assert_eq!(
            db.registry()
                .require(KEY_INDEX_SOURCE)
                .unwrap()
                .last_committed_tx_id(),
            1
        );
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let node;
        {
            let db = open_db(dir.path());
            let tx = db.begin_tx().unwrap();
            node = tx.create_node().unwrap();
            tx.set_node_property(node, "k", PropertyValue::Bool(true)).unwrap();
            tx.commit().unwrap();
            db.shutdown().unwrap();
        }

        let db = open_db(dir.path());
        assert!(db.node_exists(node).unwrap());
        assert_eq!(
            db.node_property(node, "k").unwrap(),
            Some(PropertyValue::Bool(true))
        );
    }

    #[test]
    fn read_only_refuses_transactions() {
        let dir = tempdir().unwrap();
        {
            let db = open_db(dir.path());
            db.shutdown().unwrap();
        }
        let mut cfg = config();
        cfg.node.read_only = true;
        let db = GraphDb::open(dir.path(), &cfg, None, EngineHooks::default()).unwrap();
        assert!(matches!(db.begin_tx(), Err(Error::ReadOnly)));
    }
}
