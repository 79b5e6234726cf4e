//! Store Engine
//!
//! Fixed-record files for nodes, relationships, properties and name
//! tokens, with id allocators and the store-wide metadata file.

pub mod file;
pub mod graph;
pub mod id;
pub mod record;

pub use file::RecordFile;
pub use graph::{Command, GraphStore, PropertyValue};
pub use id::IdAllocator;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Immutable identity of a physical store, stamped at creation.
/// Two nodes may replicate to each other only when their ids agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId {
    /// Milliseconds since the epoch when the store was created
    pub creation_time: u64,
    /// Random discriminator so simultaneous creations stay distinct
    pub random_id: u64,
}

impl StoreId {
    /// Mint a fresh identity
    pub fn new() -> Self {
        Self {
            creation_time: chrono::Utc::now().timestamp_millis() as u64,
            random_id: uuid::Uuid::new_v4().as_u64_pair().0,
        }
    }
}

impl Default for StoreId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StoreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:016x}", self.creation_time, self.random_id)
    }
}

/// Kinds of ids handed out by the store, mirrored by the remote
/// allocation protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdKind {
    Node,
    Relationship,
    Property,
    DynamicString,
    DynamicArray,
    Token,
}

impl IdKind {
    pub const ALL: [IdKind; 6] = [
        IdKind::Node,
        IdKind::Relationship,
        IdKind::Property,
        IdKind::DynamicString,
        IdKind::DynamicArray,
        IdKind::Token,
    ];
}

/// File layout of a store directory
#[derive(Debug, Clone)]
pub struct StorePaths {
    pub dir: PathBuf,
}

impl StorePaths {
    pub const METADATA: &'static str = "neostore";
    pub const NODES: &'static str = "neostore.nodestore.db";
    pub const RELATIONSHIPS: &'static str = "neostore.relationshipstore.db";
    pub const PROPERTIES: &'static str = "neostore.propertystore.db";
    pub const STRINGS: &'static str = "neostore.propertystore.db.strings";
    pub const ARRAYS: &'static str = "neostore.propertystore.db.arrays";
    pub const TOKENS: &'static str = "neostore.relationshiptypestore.db";

    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn metadata(&self) -> PathBuf {
        self.dir.join(Self::METADATA)
    }

    pub fn store_file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn id_file(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.id"))
    }

    /// All record store file names, metadata first
    pub fn record_files() -> [&'static str; 7] {
        [
            Self::METADATA,
            Self::NODES,
            Self::RELATIONSHIPS,
            Self::PROPERTIES,
            Self::STRINGS,
            Self::ARRAYS,
            Self::TOKENS,
        ]
    }

    /// True when no store has ever been created in this directory
    pub fn is_empty_store(&self) -> bool {
        !self.metadata().exists()
    }
}

const METADATA_MAGIC: &[u8; 8] = b"ANTLRNEO";
const METADATA_VERSION: u32 = 1;
const METADATA_LEN: usize = 8 + 4 + 8 + 8 + 8 + 4;

/// The `neostore` metadata file: store identity plus the graph
/// resource's committed-transaction watermark and the last primary
/// epoch observed by it
pub struct MetadataStore {
    path: PathBuf,
    state: parking_lot::Mutex<MetadataState>,
}

#[derive(Debug, Clone, Copy)]
struct MetadataState {
    store_id: StoreId,
    last_committed_tx: u64,
    primary_epoch: u32,
}

impl MetadataStore {
    pub fn create(path: &Path, store_id: StoreId) -> Result<Self> {
        let store = Self {
            path: path.to_path_buf(),
            state: parking_lot::Mutex::new(MetadataState {
                store_id,
                last_committed_tx: 0,
                primary_epoch: 0,
            }),
        };
        store.persist()?;
        Ok(store)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        if bytes.len() < METADATA_LEN || &bytes[0..8] != METADATA_MAGIC {
            return Err(Error::CorruptStoreHeader {
                file: path.display().to_string(),
                reason: "bad metadata magic".into(),
            });
        }
        let version = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        if version != METADATA_VERSION {
            return Err(Error::CorruptStoreHeader {
                file: path.display().to_string(),
                reason: format!("unsupported metadata version {version}"),
            });
        }
        let state = MetadataState {
            store_id: StoreId {
                creation_time: u64::from_le_bytes(bytes[12..20].try_into().unwrap()),
                random_id: u64::from_le_bytes(bytes[20..28].try_into().unwrap()),
            },
            last_committed_tx: u64::from_le_bytes(bytes[28..36].try_into().unwrap()),
            primary_epoch: u32::from_le_bytes(bytes[36..40].try_into().unwrap()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            state: parking_lot::Mutex::new(state),
        })
    }

    pub fn store_id(&self) -> StoreId {
        self.state.lock().store_id
    }

    pub fn last_committed_tx(&self) -> u64 {
        self.state.lock().last_committed_tx
    }

    pub fn set_last_committed_tx(&self, tx_id: u64) {
        self.state.lock().last_committed_tx = tx_id;
    }

    pub fn primary_epoch(&self) -> u32 {
        self.state.lock().primary_epoch
    }

    pub fn set_primary_epoch(&self, epoch: u32) {
        self.state.lock().primary_epoch = epoch;
    }

    /// Write the metadata file in place, atomically
    pub fn persist(&self) -> Result<()> {
        let state = *self.state.lock();
        let mut bytes = Vec::with_capacity(METADATA_LEN);
        bytes.extend_from_slice(METADATA_MAGIC);
        bytes.extend_from_slice(&METADATA_VERSION.to_le_bytes());
        bytes.extend_from_slice(&state.store_id.creation_time.to_le_bytes());
        bytes.extend_from_slice(&state.store_id.random_id.to_le_bytes());
        bytes.extend_from_slice(&state.last_committed_tx.to_le_bytes());
        bytes.extend_from_slice(&state.primary_epoch.to_le_bytes());

        let tmp = self.path.with_extension("tmp");
        {
            use std::io::Write;
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_data()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn store_id_unique() {
        assert_ne!(StoreId::new(), StoreId::new());
    }

    #[test]
    fn metadata_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(StorePaths::METADATA);
        let id = StoreId::new();

        {
            let meta = MetadataStore::create(&path, id).unwrap();
            meta.set_last_committed_tx(42);
            meta.set_primary_epoch(3);
            meta.persist().unwrap();
        }

        let meta = MetadataStore::open(&path).unwrap();
        assert_eq!(meta.store_id(), id);
        assert_eq!(meta.last_committed_tx(), 42);
        assert_eq!(meta.primary_epoch(), 3);
    }

    #[test]
    fn empty_store_detection() {
        let dir = tempdir().unwrap();
        let paths = StorePaths::new(dir.path());
        assert!(paths.is_empty_store());
        MetadataStore::create(&paths.metadata(), StoreId::new()).unwrap();
        assert!(!paths.is_empty_store());
    }
}
