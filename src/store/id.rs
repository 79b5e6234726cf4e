//! ID allocation
//!
//! Every record file has an `.id` sibling persisting the high-water mark
//! and the free-list of reclaimed ids. The sibling is removed while the
//! store is open; its absence after a crash forces a rebuild by scanning
//! the record file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{Error, Result};

const ID_FILE_MAGIC: &[u8; 8] = b"ANTLRID\0";

struct AllocState {
    /// Next id handed out when the free-list is empty
    high: u32,
    /// Reclaimed ids, reused before the high mark advances
    free: Vec<u32>,
}

/// Allocator for one record file's id space
pub struct IdAllocator {
    path: PathBuf,
    state: Mutex<AllocState>,
}

impl IdAllocator {
    /// Create an allocator for a brand-new store file
    pub fn create(path: &Path) -> Result<Self> {
        let alloc = Self {
            path: path.to_path_buf(),
            state: Mutex::new(AllocState {
                high: 0,
                free: Vec::new(),
            }),
        };
        // No sibling on disk while open
        let _ = fs::remove_file(path);
        Ok(alloc)
    }

    /// Open an allocator: load the persisted sibling, or rebuild through
    /// `rebuild` when the sibling is missing (unclean shutdown)
    pub fn open<F>(path: &Path, rebuild: F) -> Result<Self>
    where
        F: FnOnce() -> Result<(u32, Vec<u32>)>,
    {
        let (high, free) = match Self::load(path)? {
            Some(state) => state,
            None => {
                tracing::info!("rebuilding id allocator from {}", path.display());
                rebuild()?
            }
        };
        // Remove the sibling so a crash from here on is detectable
        let _ = fs::remove_file(path);
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(AllocState { high, free }),
        })
    }

    fn load(path: &Path) -> Result<Option<(u32, Vec<u32>)>> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.len() < 16 || &bytes[0..8] != ID_FILE_MAGIC {
            return Err(Error::Store(format!(
                "corrupt id file {}",
                path.display()
            )));
        }
        let high = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let count = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
        if bytes.len() < 16 + count * 4 {
            return Err(Error::Store(format!(
                "truncated id file {}",
                path.display()
            )));
        }
        let mut free = Vec::with_capacity(count);
        for i in 0..count {
            let at = 16 + i * 4;
            free.push(u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()));
        }
        Ok(Some((high, free)))
    }

    /// Allocate the next id, preferring reclaimed ones
    pub fn allocate(&self) -> u32 {
        let mut state = self.state.lock();
        if let Some(id) = state.free.pop() {
            id
        } else {
            let id = state.high;
            state.high += 1;
            id
        }
    }

    /// Reserve a contiguous range above the high mark, skipping the
    /// free-list. Used to lease id ranges to followers.
    pub fn allocate_range(&self, count: u32) -> (u32, u32) {
        let mut state = self.state.lock();
        let start = state.high;
        state.high += count;
        (start, count)
    }

    /// Return a released id to the free-list
    pub fn release(&self, id: u32) {
        let mut state = self.state.lock();
        state.free.push(id);
    }

    /// Current high-water mark
    pub fn high_water(&self) -> u32 {
        self.state.lock().high
    }

    /// Make sure `id` can never be handed out again: advance the high mark
    /// past it and drop it from the free-list. Used when applying commands
    /// whose ids were assigned elsewhere.
    pub fn mark_used(&self, id: u32) {
        let mut state = self.state.lock();
        if id >= state.high {
            state.high = id + 1;
        }
        if let Some(pos) = state.free.iter().position(|&f| f == id) {
            state.free.swap_remove(pos);
        }
    }

    /// Drop all free ids and reset the high mark (fresh store copy)
    pub fn reset(&self, high: u32) {
        let mut state = self.state.lock();
        state.high = high;
        state.free.clear();
    }

    /// Persist the sibling file; called on clean shutdown and checkpoints
    pub fn persist(&self) -> Result<()> {
        let state = self.state.lock();
        let mut bytes = Vec::with_capacity(16 + state.free.len() * 4);
        bytes.extend_from_slice(ID_FILE_MAGIC);
        bytes.extend_from_slice(&state.high.to_le_bytes());
        bytes.extend_from_slice(&(state.free.len() as u32).to_le_bytes());
        for id in &state.free {
            bytes.extend_from_slice(&id.to_le_bytes());
        }

        let tmp = self.path.with_extension("id.tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_data()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocate_monotonic_then_reuse() {
        let dir = tempdir().unwrap();
        let alloc = IdAllocator::create(&dir.path().join("nodes.db.id")).unwrap();

        assert_eq!(alloc.allocate(), 0);
        assert_eq!(alloc.allocate(), 1);
        assert_eq!(alloc.allocate(), 2);

        alloc.release(1);
        assert_eq!(alloc.allocate(), 1);
        assert_eq!(alloc.allocate(), 3);
    }

    #[test]
    fn persist_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes.db.id");

        {
            let alloc = IdAllocator::create(&path).unwrap();
            for _ in 0..5 {
                alloc.allocate();
            }
            alloc.release(2);
            alloc.persist().unwrap();
        }

        let reopened = IdAllocator::open(&path, || panic!("should not rebuild")).unwrap();
        assert_eq!(reopened.allocate(), 2);
        assert_eq!(reopened.allocate(), 5);
    }

    #[test]
    fn missing_sibling_triggers_rebuild() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes.db.id");

        let alloc = IdAllocator::open(&path, || Ok((10, vec![4, 7]))).unwrap();
        assert_eq!(alloc.high_water(), 10);
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert_eq!([b, a], [4, 7]);
        assert_eq!(alloc.allocate(), 10);
    }

    #[test]
    fn mark_used_advances_and_prunes() {
        let dir = tempdir().unwrap();
        let alloc = IdAllocator::create(&dir.path().join("x.id")).unwrap();
        alloc.allocate();
        alloc.release(0);
        alloc.mark_used(0);
        alloc.mark_used(9);
        assert_eq!(alloc.allocate(), 10);
    }
}
