//! Record file I/O
//!
//! Each store file starts with a version header identifying the store it
//! belongs to, followed by fixed-width records addressed by id. Pages are
//! served either through a memory map or positional reads, selected at
//! open time.

use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use parking_lot::RwLock;

use super::record::Record;
use super::StoreId;
use crate::error::{Error, Result};

/// Magic bytes at the start of each store file
const STORE_MAGIC: &[u8; 8] = b"ANTLRSTR";

/// Store format version
const STORE_VERSION: u32 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 32;

/// File growth step for the memory-mapped backend
const GROW_STEP: u64 = 1024 * 1024;

/// Store file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHeader {
    pub store_id: StoreId,
    pub record_size: u32,
}

impl StoreHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(STORE_MAGIC);
        bytes[8..12].copy_from_slice(&STORE_VERSION.to_le_bytes());
        bytes[12..20].copy_from_slice(&self.store_id.creation_time.to_le_bytes());
        bytes[20..28].copy_from_slice(&self.store_id.random_id.to_le_bytes());
        bytes[28..32].copy_from_slice(&self.record_size.to_le_bytes());
        bytes
    }

    pub fn from_bytes(file: &str, bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::CorruptStoreHeader {
                file: file.into(),
                reason: "header too short".into(),
            });
        }
        if &bytes[0..8] != STORE_MAGIC {
            return Err(Error::CorruptStoreHeader {
                file: file.into(),
                reason: "bad magic".into(),
            });
        }
        let version = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        if version != STORE_VERSION {
            return Err(Error::CorruptStoreHeader {
                file: file.into(),
                reason: format!("unsupported version {version}"),
            });
        }
        Ok(Self {
            store_id: StoreId {
                creation_time: u64::from_le_bytes(bytes[12..20].try_into().unwrap()),
                random_id: u64::from_le_bytes(bytes[20..28].try_into().unwrap()),
            },
            record_size: u32::from_le_bytes(bytes[28..32].try_into().unwrap()),
        })
    }
}

/// Backend for page access
#[derive(Debug)]
enum Backend {
    /// Memory-mapped file; `cap` is the mapped capacity
    Mapped { map: MmapMut, cap: u64 },
    /// Positional read/write against the file descriptor
    Direct,
}

/// A file addressed by absolute byte offsets
#[derive(Debug)]
pub struct PageFile {
    file: File,
    backend: Backend,
    /// Logical length: header plus the highest written record's end
    len: u64,
}

impl PageFile {
    fn new(file: File, len: u64, mapped: bool) -> Result<Self> {
        let backend = if mapped {
            let cap = len.max(GROW_STEP);
            file.set_len(cap)?;
            let map = unsafe { MmapMut::map_mut(&file)? };
            Backend::Mapped { map, cap }
        } else {
            Backend::Direct
        };
        Ok(Self { file, backend, len })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset + buf.len() as u64;
        if end > self.len {
            return Err(Error::Store(format!(
                "read past end: {} > {}",
                end, self.len
            )));
        }
        match &self.backend {
            Backend::Mapped { map, .. } => {
                buf.copy_from_slice(&map[offset as usize..end as usize]);
                Ok(())
            }
            Backend::Direct => {
                self.file.read_exact_at(buf, offset)?;
                Ok(())
            }
        }
    }

    pub fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let end = offset + buf.len() as u64;
        match &mut self.backend {
            Backend::Mapped { map, cap } => {
                if end > *cap {
                    let new_cap = (end / GROW_STEP + 1) * GROW_STEP;
                    self.file.set_len(new_cap)?;
                    *map = unsafe { MmapMut::map_mut(&self.file)? };
                    *cap = new_cap;
                }
                map[offset as usize..end as usize].copy_from_slice(buf);
            }
            Backend::Direct => {
                self.file.write_all_at(buf, offset)?;
            }
        }
        if end > self.len {
            self.len = end;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        match &self.backend {
            Backend::Mapped { map, .. } => map.flush().map_err(Error::Io)?,
            Backend::Direct => self.file.sync_data()?,
        }
        Ok(())
    }

    /// Truncate mapped slack down to the logical length before close
    fn shrink_to_fit(&mut self) -> Result<()> {
        if matches!(self.backend, Backend::Mapped { .. }) {
            // Drop the map before truncating
            self.backend = Backend::Direct;
            self.file.set_len(self.len)?;
        }
        Ok(())
    }
}

/// A store file of fixed-width records guarded by a per-file latch
#[derive(Debug)]
pub struct RecordFile<R: Record> {
    path: PathBuf,
    inner: RwLock<PageFile>,
    _marker: PhantomData<R>,
}

impl<R: Record> RecordFile<R> {
    /// Create a new record file stamped with the given store id
    pub fn create(path: &Path, store_id: StoreId, mapped: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let header = StoreHeader {
            store_id,
            record_size: R::SIZE as u32,
        };
        file.write_all_at(&header.to_bytes(), 0)?;
        file.sync_data()?;

        let page = PageFile::new(file, HEADER_SIZE as u64, mapped)?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: RwLock::new(page),
            _marker: PhantomData,
        })
    }

    /// Open an existing record file, verifying its header
    pub fn open(path: &Path, expected: StoreId, mapped: bool) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let name = path.display().to_string();

        let mut header_bytes = [0u8; HEADER_SIZE];
        file.read_exact_at(&mut header_bytes, 0)
            .map_err(|_| Error::CorruptStoreHeader {
                file: name.clone(),
                reason: "missing header".into(),
            })?;
        let header = StoreHeader::from_bytes(&name, &header_bytes)?;

        if header.store_id != expected {
            return Err(Error::StoreIdMismatch {
                local: expected.to_string(),
                remote: header.store_id.to_string(),
            });
        }
        if header.record_size != R::SIZE as u32 {
            return Err(Error::CorruptStoreHeader {
                file: name,
                reason: format!(
                    "record size {} does not match expected {}",
                    header.record_size,
                    R::SIZE
                ),
            });
        }

        // Logical length snaps to whole records; a torn trailing record is
        // dropped here and rebuilt by recovery.
        let raw_len = file.metadata()?.len();
        let body = raw_len.saturating_sub(HEADER_SIZE as u64);
        let len = HEADER_SIZE as u64 + (body / R::SIZE as u64) * R::SIZE as u64;

        let page = PageFile::new(file, len, mapped)?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: RwLock::new(page),
            _marker: PhantomData,
        })
    }

    fn offset(id: u32) -> u64 {
        HEADER_SIZE as u64 + id as u64 * R::SIZE as u64
    }

    /// Number of record slots (live or free) in the file
    pub fn high_id(&self) -> u32 {
        let len = self.inner.read().len();
        ((len - HEADER_SIZE as u64) / R::SIZE as u64) as u32
    }

    /// Read the record at `id`; slots past the end read as unused
    pub fn read(&self, id: u32) -> Result<R> {
        let inner = self.inner.read();
        let off = Self::offset(id);
        if off + R::SIZE as u64 > inner.len() {
            return Ok(R::unused());
        }
        let mut buf = vec![0u8; R::SIZE];
        inner.read_exact_at(off, &mut buf)?;
        Ok(R::from_bytes(&buf))
    }

    /// Write the record at `id`, growing the file as needed
    pub fn write(&self, id: u32, record: &R) -> Result<()> {
        let mut inner = self.inner.write();
        let off = Self::offset(id);
        // Slots between the old end and `id` are zero (not in use) by
        // construction of the backends.
        let mut buf = vec![0u8; R::SIZE];
        record.to_bytes(&mut buf);
        inner.write_all_at(off, &buf)
    }

    /// Collect the ids of unused slots below the high id, for free-list rebuild
    pub fn scan_free(&self) -> Result<Vec<u32>> {
        let high = self.high_id();
        let mut free = Vec::new();
        for id in 0..high {
            if !self.read(id)?.in_use() {
                free.push(id);
            }
        }
        Ok(free)
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.read().flush()
    }

    /// Flush and release mapped slack; called on clean shutdown
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.flush()?;
        inner.shrink_to_fit()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::record::{NodeRecord, NO_REFERENCE};
    use tempfile::tempdir;

    fn test_store_id() -> StoreId {
        StoreId {
            creation_time: 1_700_000_000_000,
            random_id: 0xDEADBEEF,
        }
    }

    #[test]
    fn create_write_read() {
        for mapped in [false, true] {
            let dir = tempdir().unwrap();
            let path = dir.path().join("nodes.db");
            let file: RecordFile<NodeRecord> =
                RecordFile::create(&path, test_store_id(), mapped).unwrap();

            let rec = NodeRecord {
                in_use: true,
                first_rel: 7,
                first_prop: NO_REFERENCE,
            };
            file.write(5, &rec).unwrap();
            assert_eq!(file.read(5).unwrap(), rec);
            // Slots in between read as unused
            assert!(!file.read(2).unwrap().in_use);
            assert_eq!(file.high_id(), 6);
        }
    }

    #[test]
    fn reopen_verifies_store_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes.db");
        {
            let file: RecordFile<NodeRecord> =
                RecordFile::create(&path, test_store_id(), false).unwrap();
            file.write(
                0,
                &NodeRecord {
                    in_use: true,
                    first_rel: NO_REFERENCE,
                    first_prop: NO_REFERENCE,
                },
            )
            .unwrap();
            file.close().unwrap();
        }

        let reopened: RecordFile<NodeRecord> =
            RecordFile::open(&path, test_store_id(), false).unwrap();
        assert!(reopened.read(0).unwrap().in_use);

        let foreign = StoreId {
            creation_time: 1,
            random_id: 2,
        };
        let err = RecordFile::<NodeRecord>::open(&path, foreign, false).unwrap_err();
        assert!(matches!(err, Error::StoreIdMismatch { .. }));
    }

    #[test]
    fn scan_free_finds_holes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes.db");
        let file: RecordFile<NodeRecord> =
            RecordFile::create(&path, test_store_id(), false).unwrap();

        for id in [0u32, 2, 4] {
            file.write(
                id,
                &NodeRecord {
                    in_use: true,
                    first_rel: NO_REFERENCE,
                    first_prop: NO_REFERENCE,
                },
            )
            .unwrap();
        }
        assert_eq!(file.scan_free().unwrap(), vec![1, 3]);
    }
}
