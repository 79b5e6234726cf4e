//! Graph store
//!
//! Owns the record files, id allocators and the store metadata for the
//! graph resource. All mutation flows through [`Command`]s carrying
//! before/after record images; applying a command is idempotent because
//! it overwrites the whole record addressed by its id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::file::RecordFile;
use super::id::IdAllocator;
use super::record::{
    DynamicRecord, NodeRecord, PropertyKind, PropertyRecord, Record, RelationshipRecord,
    TokenKind, TokenRecord, DYNAMIC_BLOCK_DATA, NO_REFERENCE,
};
use super::{IdKind, MetadataStore, StoreId, StorePaths};
use crate::error::{Error, Result};

/// One mutated record inside a transaction, with the images needed to
/// redo it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    Node {
        id: u32,
        before: NodeRecord,
        after: NodeRecord,
    },
    Relationship {
        id: u32,
        before: RelationshipRecord,
        after: RelationshipRecord,
    },
    Property {
        id: u32,
        before: PropertyRecord,
        after: PropertyRecord,
    },
    DynamicString {
        id: u32,
        before: DynamicRecord,
        after: DynamicRecord,
    },
    DynamicArray {
        id: u32,
        before: DynamicRecord,
        after: DynamicRecord,
    },
    /// Token creation; tokens are never deleted
    Token { id: u32, after: TokenRecord },
}

impl Command {
    /// The id kind and record id this command addresses
    pub fn addresses(&self) -> (IdKind, u32) {
        match self {
            Command::Node { id, .. } => (IdKind::Node, *id),
            Command::Relationship { id, .. } => (IdKind::Relationship, *id),
            Command::Property { id, .. } => (IdKind::Property, *id),
            Command::DynamicString { id, .. } => (IdKind::DynamicString, *id),
            Command::DynamicArray { id, .. } => (IdKind::DynamicArray, *id),
            Command::Token { id, .. } => (IdKind::Token, *id),
        }
    }

    /// Whether the after image leaves the slot unused
    pub fn is_delete(&self) -> bool {
        match self {
            Command::Node { after, .. } => !after.in_use,
            Command::Relationship { after, .. } => !after.in_use,
            Command::Property { after, .. } => !after.in_use,
            Command::DynamicString { after, .. } => !after.in_use,
            Command::DynamicArray { after, .. } => !after.in_use,
            Command::Token { .. } => false,
        }
    }
}

/// A property value as seen by the embedded API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    IntArray(Vec<i64>),
}

impl PropertyValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::Bool(_) => PropertyKind::Bool,
            PropertyValue::Int(_) => PropertyKind::Int,
            PropertyValue::Float(_) => PropertyKind::Float,
            PropertyValue::Str(_) => PropertyKind::String,
            PropertyValue::IntArray(_) => PropertyKind::IntArray,
        }
    }
}

struct TokenCache {
    by_id: HashMap<u32, (TokenKind, String)>,
    by_name: HashMap<(TokenKind, String), u32>,
}

/// The graph resource's persistent state
pub struct GraphStore {
    paths: StorePaths,
    meta: MetadataStore,
    nodes: RecordFile<NodeRecord>,
    relationships: RecordFile<RelationshipRecord>,
    properties: RecordFile<PropertyRecord>,
    strings: RecordFile<DynamicRecord>,
    arrays: RecordFile<DynamicRecord>,
    tokens: RecordFile<TokenRecord>,
    allocators: HashMap<IdKind, IdAllocator>,
    token_cache: RwLock<TokenCache>,
}

impl GraphStore {
    /// Create a brand-new store in `dir`, stamped with `store_id`
    pub fn create(dir: &Path, store_id: StoreId, mapped: bool) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let paths = StorePaths::new(dir);
        let meta = MetadataStore::create(&paths.metadata(), store_id)?;

        let nodes = RecordFile::create(&paths.store_file(StorePaths::NODES), store_id, mapped)?;
        let relationships =
            RecordFile::create(&paths.store_file(StorePaths::RELATIONSHIPS), store_id, mapped)?;
        let properties =
            RecordFile::create(&paths.store_file(StorePaths::PROPERTIES), store_id, mapped)?;
        let strings =
            RecordFile::create(&paths.store_file(StorePaths::STRINGS), store_id, mapped)?;
        let arrays = RecordFile::create(&paths.store_file(StorePaths::ARRAYS), store_id, mapped)?;
        let tokens = RecordFile::create(&paths.store_file(StorePaths::TOKENS), store_id, mapped)?;

        let mut allocators = HashMap::new();
        for kind in IdKind::ALL {
            let name = Self::file_for(kind);
            allocators.insert(kind, IdAllocator::create(&paths.id_file(name))?);
        }

        tracing::info!(store_id = %store_id, dir = %dir.display(), "created graph store");

        Ok(Self {
            paths,
            meta,
            nodes,
            relationships,
            properties,
            strings,
            arrays,
            tokens,
            allocators,
            token_cache: RwLock::new(TokenCache {
                by_id: HashMap::new(),
                by_name: HashMap::new(),
            }),
        })
    }

    /// Open an existing store, verifying every file against the metadata
    /// store id and rebuilding id allocators after an unclean shutdown
    pub fn open(dir: &Path, mapped: bool) -> Result<Self> {
        let paths = StorePaths::new(dir);
        let meta = MetadataStore::open(&paths.metadata())?;
        let store_id = meta.store_id();

        let nodes = RecordFile::open(&paths.store_file(StorePaths::NODES), store_id, mapped)?;
        let relationships =
            RecordFile::open(&paths.store_file(StorePaths::RELATIONSHIPS), store_id, mapped)?;
        let properties =
            RecordFile::open(&paths.store_file(StorePaths::PROPERTIES), store_id, mapped)?;
        let strings = RecordFile::open(&paths.store_file(StorePaths::STRINGS), store_id, mapped)?;
        let arrays = RecordFile::open(&paths.store_file(StorePaths::ARRAYS), store_id, mapped)?;
        let tokens = RecordFile::open(&paths.store_file(StorePaths::TOKENS), store_id, mapped)?;

        let mut allocators = HashMap::new();
        macro_rules! open_alloc {
            ($kind:expr, $file:expr) => {{
                let id_path = paths.id_file(Self::file_for($kind));
                let alloc = IdAllocator::open(&id_path, || {
                    Ok(($file.high_id(), $file.scan_free()?))
                })?;
                allocators.insert($kind, alloc);
            }};
        }
        open_alloc!(IdKind::Node, nodes);
        open_alloc!(IdKind::Relationship, relationships);
        open_alloc!(IdKind::Property, properties);
        open_alloc!(IdKind::DynamicString, strings);
        open_alloc!(IdKind::DynamicArray, arrays);
        open_alloc!(IdKind::Token, tokens);

        let store = Self {
            paths,
            meta,
            nodes,
            relationships,
            properties,
            strings,
            arrays,
            tokens,
            allocators,
            token_cache: RwLock::new(TokenCache {
                by_id: HashMap::new(),
                by_name: HashMap::new(),
            }),
        };
        store.load_token_cache()?;

        tracing::info!(
            store_id = %store_id,
            last_tx = store.meta.last_committed_tx(),
            "opened graph store"
        );
        Ok(store)
    }

    fn file_for(kind: IdKind) -> &'static str {
        match kind {
            IdKind::Node => StorePaths::NODES,
            IdKind::Relationship => StorePaths::RELATIONSHIPS,
            IdKind::Property => StorePaths::PROPERTIES,
            IdKind::DynamicString => StorePaths::STRINGS,
            IdKind::DynamicArray => StorePaths::ARRAYS,
            IdKind::Token => StorePaths::TOKENS,
        }
    }

    fn load_token_cache(&self) -> Result<()> {
        let mut cache = self.token_cache.write();
        for id in 0..self.tokens.high_id() {
            let rec = self.tokens.read(id)?;
            if rec.in_use {
                let bytes = self.read_dynamic_chain(IdKind::DynamicString, rec.name_block)?;
                let name = String::from_utf8_lossy(&bytes).into_owned();
                cache.by_name.insert((rec.kind, name.clone()), id);
                cache.by_id.insert(id, (rec.kind, name));
            }
        }
        Ok(())
    }

    // ── Identity and watermarks ────────────────────────

    pub fn store_id(&self) -> StoreId {
        self.meta.store_id()
    }

    pub fn last_committed_tx(&self) -> u64 {
        self.meta.last_committed_tx()
    }

    pub fn set_last_committed_tx(&self, tx_id: u64) {
        self.meta.set_last_committed_tx(tx_id);
    }

    pub fn primary_epoch(&self) -> u32 {
        self.meta.primary_epoch()
    }

    pub fn set_primary_epoch(&self, epoch: u32) {
        self.meta.set_primary_epoch(epoch);
    }

    // ── Id allocation ──────────────────────────────────

    pub fn allocator(&self, kind: IdKind) -> &IdAllocator {
        &self.allocators[&kind]
    }

    // ── Record reads ───────────────────────────────────

    pub fn node(&self, id: u32) -> Result<NodeRecord> {
        self.nodes.read(id)
    }

    pub fn relationship(&self, id: u32) -> Result<RelationshipRecord> {
        self.relationships.read(id)
    }

    pub fn property(&self, id: u32) -> Result<PropertyRecord> {
        self.properties.read(id)
    }

    pub fn node_high_id(&self) -> u32 {
        self.nodes.high_id()
    }

    // ── Tokens ─────────────────────────────────────────

    pub fn token_id(&self, kind: TokenKind, name: &str) -> Option<u32> {
        self.token_cache
            .read()
            .by_name
            .get(&(kind, name.to_string()))
            .copied()
    }

    pub fn token_name(&self, id: u32) -> Option<String> {
        self.token_cache
            .read()
            .by_id
            .get(&id)
            .map(|(_, name)| name.clone())
    }

    // ── Value encoding ─────────────────────────────────

    /// Read a property value, following dynamic chains as needed
    pub fn read_value(&self, prop: &PropertyRecord) -> Result<PropertyValue> {
        Ok(match prop.kind {
            PropertyKind::Bool => PropertyValue::Bool(prop.payload != 0),
            PropertyKind::Int => PropertyValue::Int(prop.payload as i64),
            PropertyKind::Float => PropertyValue::Float(f64::from_bits(prop.payload)),
            PropertyKind::String => {
                let bytes = self.read_dynamic_chain(IdKind::DynamicString, prop.payload as u32)?;
                PropertyValue::Str(String::from_utf8_lossy(&bytes).into_owned())
            }
            PropertyKind::IntArray => {
                let bytes = self.read_dynamic_chain(IdKind::DynamicArray, prop.payload as u32)?;
                let mut values = Vec::with_capacity(bytes.len() / 8);
                for chunk in bytes.chunks_exact(8) {
                    values.push(i64::from_le_bytes(chunk.try_into().unwrap()));
                }
                PropertyValue::IntArray(values)
            }
        })
    }

    fn dynamic_file(&self, kind: IdKind) -> &RecordFile<DynamicRecord> {
        match kind {
            IdKind::DynamicString => &self.strings,
            IdKind::DynamicArray => &self.arrays,
            _ => unreachable!("not a dynamic store"),
        }
    }

    pub fn read_dynamic_chain(&self, kind: IdKind, head: u32) -> Result<Vec<u8>> {
        let file = self.dynamic_file(kind);
        let mut out = Vec::new();
        let mut block_id = head;
        while block_id != NO_REFERENCE {
            let block = file.read(block_id)?;
            if !block.in_use {
                return Err(Error::Store(format!(
                    "dynamic chain broken at block {block_id}"
                )));
            }
            out.extend_from_slice(&block.data);
            block_id = block.next_block;
        }
        Ok(out)
    }

    /// Read the dynamic records of a chain, for building delete commands
    pub fn dynamic_chain_records(&self, kind: IdKind, head: u32) -> Result<Vec<(u32, DynamicRecord)>> {
        let file = self.dynamic_file(kind);
        let mut out = Vec::new();
        let mut block_id = head;
        while block_id != NO_REFERENCE {
            let block = file.read(block_id)?;
            if !block.in_use {
                break;
            }
            let next = block.next_block;
            out.push((block_id, block));
            block_id = next;
        }
        Ok(out)
    }

    // ── Apply ──────────────────────────────────────────

    /// Apply one command's after image to the store files. Idempotent:
    /// re-applying overwrites with the same bytes and leaves allocators
    /// in the same state.
    pub fn apply(&self, command: &Command) -> Result<()> {
        let (kind, _) = command.addresses();

        match command {
            Command::Node { id, after, .. } => {
                let was = self.nodes.read(*id)?;
                self.nodes.write(*id, after)?;
                self.reconcile_allocator(kind, *id, was.in_use, after.in_use);
            }
            Command::Relationship { id, after, .. } => {
                let was = self.relationships.read(*id)?;
                self.relationships.write(*id, after)?;
                self.reconcile_allocator(kind, *id, was.in_use, after.in_use);
            }
            Command::Property { id, after, .. } => {
                let was = self.properties.read(*id)?;
                self.properties.write(*id, after)?;
                self.reconcile_allocator(kind, *id, was.in_use, after.in_use);
            }
            Command::DynamicString { id, after, .. } => {
                let was = self.strings.read(*id)?;
                self.strings.write(*id, after)?;
                self.reconcile_allocator(kind, *id, was.in_use, after.in_use);
            }
            Command::DynamicArray { id, after, .. } => {
                let was = self.arrays.read(*id)?;
                self.arrays.write(*id, after)?;
                self.reconcile_allocator(kind, *id, was.in_use, after.in_use);
            }
            Command::Token { id, after } => {
                self.tokens.write(*id, after)?;
                self.allocator(IdKind::Token).mark_used(*id);
                // The name chain's dynamic commands precede the token
                // command in every stream, so the name is readable here
                let bytes = self.read_dynamic_chain(IdKind::DynamicString, after.name_block)?;
                let name = String::from_utf8_lossy(&bytes).into_owned();
                let mut cache = self.token_cache.write();
                cache.by_name.insert((after.kind, name.clone()), *id);
                cache.by_id.insert(*id, (after.kind, name));
            }
        }
        Ok(())
    }

    fn reconcile_allocator(&self, kind: IdKind, id: u32, was_in_use: bool, now_in_use: bool) {
        let alloc = self.allocator(kind);
        if now_in_use {
            alloc.mark_used(id);
        } else if was_in_use {
            alloc.release(id);
        }
    }

    // ── Maintenance ────────────────────────────────────

    /// Flush all dirty pages; logical-log records for the flushed state
    /// must already be durable
    pub fn flush_all(&self) -> Result<()> {
        self.nodes.flush()?;
        self.relationships.flush()?;
        self.properties.flush()?;
        self.strings.flush()?;
        self.arrays.flush()?;
        self.tokens.flush()?;
        self.meta.persist()
    }

    /// Clean shutdown: flush, persist allocators and metadata
    pub fn close(&self) -> Result<()> {
        self.nodes.close()?;
        self.relationships.close()?;
        self.properties.close()?;
        self.strings.close()?;
        self.arrays.close()?;
        self.tokens.close()?;
        for alloc in self.allocators.values() {
            alloc.persist()?;
        }
        self.meta.persist()
    }

    /// Existing store files with their directory-relative names, for
    /// snapshot streaming
    pub fn files(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut out = Vec::new();
        for name in StorePaths::record_files() {
            let path = self.paths.store_file(name);
            if path.exists() {
                out.push((name.to_string(), path));
            }
        }
        for kind in IdKind::ALL {
            let name = format!("{}.id", Self::file_for(kind));
            let path = self.paths.dir.join(&name);
            if path.exists() {
                out.push((name, path));
            }
        }
        Ok(out)
    }
}

/// Split `data` into a dynamic-record chain using ids from `next_id`.
/// Returns the blocks in chain order; the first one is the head.
pub fn build_dynamic_chain(
    data: &[u8],
    mut next_id: impl FnMut() -> u32,
) -> Vec<(u32, DynamicRecord)> {
    if data.is_empty() {
        let id = next_id();
        return vec![(
            id,
            DynamicRecord {
                in_use: true,
                length: 0,
                next_block: NO_REFERENCE,
                data: Vec::new(),
            },
        )];
    }

    let chunks: Vec<&[u8]> = data.chunks(DYNAMIC_BLOCK_DATA).collect();
    let ids: Vec<u32> = (0..chunks.len()).map(|_| next_id()).collect();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            (
                ids[i],
                DynamicRecord {
                    in_use: true,
                    length: chunk.len() as u32,
                    next_block: if i + 1 < ids.len() {
                        ids[i + 1]
                    } else {
                        NO_REFERENCE
                    },
                    data: chunk.to_vec(),
                },
            )
        })
        .collect()
}

/// Pack an i64 array into bytes for the arrays store
pub fn pack_int_array(values: &[i64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_store(dir: &Path) -> GraphStore {
        GraphStore::create(dir, StoreId::new(), false).unwrap()
    }

    #[test]
    fn apply_node_command_and_reopen() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());
        let store_id = store.store_id();

        let id = store.allocator(IdKind::Node).allocate();
        let after = NodeRecord {
            in_use: true,
            first_rel: NO_REFERENCE,
            first_prop: NO_REFERENCE,
        };
        store
            .apply(&Command::Node {
                id,
                before: NodeRecord::unused(),
                after: after.clone(),
            })
            .unwrap();
        store.set_last_committed_tx(1);
        store.close().unwrap();

        let reopened = GraphStore::open(dir.path(), false).unwrap();
        assert_eq!(reopened.store_id(), store_id);
        assert_eq!(reopened.last_committed_tx(), 1);
        assert!(reopened.node(id).unwrap().in_use);
    }

    #[test]
    fn apply_is_idempotent_for_allocators() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());

        let id = store.allocator(IdKind::Node).allocate();
        let create = Command::Node {
            id,
            before: NodeRecord::unused(),
            after: NodeRecord {
                in_use: true,
                first_rel: NO_REFERENCE,
                first_prop: NO_REFERENCE,
            },
        };
        store.apply(&create).unwrap();
        store.apply(&create).unwrap();

        let delete = Command::Node {
            id,
            before: NodeRecord {
                in_use: true,
                first_rel: NO_REFERENCE,
                first_prop: NO_REFERENCE,
            },
            after: NodeRecord::unused(),
        };
        store.apply(&delete).unwrap();
        store.apply(&delete).unwrap();

        // Released exactly once: the id comes back once, then fresh ids
        assert_eq!(store.allocator(IdKind::Node).allocate(), id);
        assert_ne!(store.allocator(IdKind::Node).allocate(), id);
    }

    #[test]
    fn dynamic_chain_round_trip() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());

        let data: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();
        let alloc = store.allocator(IdKind::DynamicString);
        let blocks = build_dynamic_chain(&data, || alloc.allocate());
        assert_eq!(blocks.len(), 3);
        let head = blocks[0].0;

        for (id, rec) in &blocks {
            store
                .apply(&Command::DynamicString {
                    id: *id,
                    before: DynamicRecord::unused(),
                    after: rec.clone(),
                })
                .unwrap();
        }

        assert_eq!(
            store.read_dynamic_chain(IdKind::DynamicString, head).unwrap(),
            data
        );
    }

    #[test]
    fn token_cache_updates_on_apply() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());

        // Names spill into the strings store like any dynamic value
        let alloc = store.allocator(IdKind::DynamicString);
        let blocks = build_dynamic_chain(b"KNOWS", || alloc.allocate());
        let name_block = blocks[0].0;
        for (id, rec) in &blocks {
            store
                .apply(&Command::DynamicString {
                    id: *id,
                    before: DynamicRecord::unused(),
                    after: rec.clone(),
                })
                .unwrap();
        }

        let id = store.allocator(IdKind::Token).allocate();
        store
            .apply(&Command::Token {
                id,
                after: TokenRecord {
                    in_use: true,
                    kind: TokenKind::RelationshipType,
                    name_block,
                },
            })
            .unwrap();

        assert_eq!(store.token_id(TokenKind::RelationshipType, "KNOWS"), Some(id));
        assert_eq!(store.token_id(TokenKind::PropertyKey, "KNOWS"), None);
        assert_eq!(store.token_name(id).as_deref(), Some("KNOWS"));

        // Reopen rebuilds the cache from the chain, not from the record
        store.close().unwrap();
        let reopened = GraphStore::open(dir.path(), false).unwrap();
        assert_eq!(reopened.token_id(TokenKind::RelationshipType, "KNOWS"), Some(id));
    }

    #[test]
    fn property_value_round_trip() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());

        let prop = PropertyRecord {
            in_use: true,
            key_id: 0,
            kind: PropertyKind::Float,
            payload: 2.5f64.to_bits(),
            next_prop: NO_REFERENCE,
        };
        assert_eq!(
            store.read_value(&prop).unwrap(),
            PropertyValue::Float(2.5)
        );
    }
}
