//! In-memory storage layer modelling files as vectors of fixed-size page slots.
//!
//! Page rewrites move the last live page into the first free slot and
//! truncate trailing free slots, which is how a block manager gives space
//! back after deletes. Exclusive holders (checkpoint, DDL, verify) can be
//! simulated with [`MemStorage::hold`], and I/O faults with
//! [`MemStorage::fail_rewrites`].

use std::{
    collections::BTreeMap,
    ops::Range,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
};

use super::{
    BusyReason, DataFileHandle, FileLease, FileMetadata, PageRewrite, StorageError, StorageLayer,
};
use crate::id::{FileId, FileIdGenerator};

/// Page size used when none is configured.
pub const DEFAULT_PAGE_SIZE: u64 = 4 * 1024;

/// In-memory [`StorageLayer`].
pub struct MemStorage {
    files: RwLock<BTreeMap<FileId, Arc<MemFile>>>,
    ids: FileIdGenerator,
    page_size: u64,
    readonly: bool,
    in_memory: bool,
}

struct MemFile {
    id: FileId,
    uri: String,
    compactable: bool,
    state: Mutex<FileState>,
    rewrite_calls: AtomicU64,
}

#[derive(Default)]
struct FileState {
    /// `true` marks a slot holding a live page.
    pages: Vec<bool>,
    live: u64,
    holder: Option<BusyReason>,
    closed: bool,
    failures_left: u32,
}

impl FileState {
    fn truncate_free_tail(&mut self) {
        while self.pages.last() == Some(&false) {
            self.pages.pop();
        }
    }
}

impl MemFile {
    fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn metadata(&self, page_size: u64) -> FileMetadata {
        let state = self.lock();
        FileMetadata {
            allocated_bytes: state.pages.len() as u64 * page_size,
            live_bytes: state.live * page_size,
        }
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStorage {
    /// Empty storage with [`DEFAULT_PAGE_SIZE`] pages.
    pub fn new() -> Self {
        Self {
            files: RwLock::new(BTreeMap::new()),
            ids: FileIdGenerator::new(),
            page_size: DEFAULT_PAGE_SIZE,
            readonly: false,
            in_memory: false,
        }
    }

    /// Use `page_size` bytes per page.
    pub fn with_page_size(self, page_size: u64) -> Self {
        MemStorage {
            page_size: page_size.max(1),
            ..self
        }
    }

    /// Report the engine as readonly.
    pub fn readonly(self, readonly: bool) -> Self {
        MemStorage { readonly, ..self }
    }

    /// Report the engine as purely in-memory.
    pub fn in_memory(self, in_memory: bool) -> Self {
        MemStorage { in_memory, ..self }
    }

    /// Bytes per page.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Create an empty compactable file.
    pub fn create_file(&self, uri: impl Into<String>) -> FileId {
        self.insert(uri.into(), true)
    }

    /// Create an empty file that compaction must never touch.
    pub fn create_system_file(&self, uri: impl Into<String>) -> FileId {
        self.insert(uri.into(), false)
    }

    fn insert(&self, uri: String, compactable: bool) -> FileId {
        let id = self.ids.generate();
        let file = Arc::new(MemFile {
            id,
            uri,
            compactable,
            state: Mutex::new(FileState::default()),
            rewrite_calls: AtomicU64::new(0),
        });
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, file);
        id
    }

    fn file(&self, id: FileId) -> Result<Arc<MemFile>, StorageError> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(StorageError::Closed(id))
    }

    /// Append `pages` live pages.
    pub fn populate(&self, id: FileId, pages: usize) -> Result<(), StorageError> {
        let file = self.file(id)?;
        let mut state = file.lock();
        state.pages.extend(std::iter::repeat(true).take(pages));
        state.live += pages as u64;
        Ok(())
    }

    /// Free the live pages in `slots`. Returns how many pages were freed.
    pub fn delete_pages(&self, id: FileId, slots: Range<usize>) -> Result<u64, StorageError> {
        let file = self.file(id)?;
        let mut state = file.lock();
        let end = slots.end.min(state.pages.len());
        let start = slots.start.min(end);
        let mut freed = 0;
        for slot in &mut state.pages[start..end] {
            if *slot {
                *slot = false;
                freed += 1;
            }
        }
        state.live -= freed;
        state.truncate_free_tail();
        Ok(freed)
    }

    /// Close and forget `id`, as a drop would.
    pub fn drop_file(&self, id: FileId) -> Result<(), StorageError> {
        let file = self
            .files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .ok_or(StorageError::Closed(id))?;
        file.lock().closed = true;
        Ok(())
    }

    /// Hold `id` exclusively on behalf of `reason` until the guard drops.
    pub fn hold(&self, id: FileId, reason: BusyReason) -> Result<HoldGuard, StorageError> {
        let file = self.file(id)?;
        {
            let mut state = file.lock();
            if let Some(holder) = state.holder {
                return Err(StorageError::Busy(holder));
            }
            state.holder = Some(reason);
        }
        Ok(HoldGuard { file })
    }

    /// Make the next `count` page rewrites of `id` fail with an I/O error.
    pub fn fail_rewrites(&self, id: FileId, count: u32) -> Result<(), StorageError> {
        self.file(id)?.lock().failures_left = count;
        Ok(())
    }

    /// Number of page rewrites attempted on `id`, failed ones included.
    pub fn rewrite_calls(&self, id: FileId) -> u64 {
        self.file(id)
            .map(|file| file.rewrite_calls.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// Exclusive hold simulating a checkpoint, DDL or verify on one file.
pub struct HoldGuard {
    file: Arc<MemFile>,
}

impl Drop for HoldGuard {
    fn drop(&mut self) {
        self.file.lock().holder = None;
    }
}

/// Page-rewrite lease handed out by [`MemStorage`].
pub struct MemLease {
    file: Arc<MemFile>,
}

impl FileLease for MemLease {
    fn file_id(&self) -> FileId {
        self.file.id
    }
}

impl Drop for MemLease {
    fn drop(&mut self) {
        let mut state = self.file.lock();
        if state.holder == Some(BusyReason::Compaction) {
            state.holder = None;
        }
    }
}

impl StorageLayer for MemStorage {
    type Lease = MemLease;

    fn open_handles(&self) -> Vec<DataFileHandle> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        files
            .values()
            .map(|file| DataFileHandle {
                id: file.id,
                uri: file.uri.clone(),
                compactable: file.compactable,
                cached: file.metadata(self.page_size),
            })
            .collect()
    }

    fn metadata(&self, id: FileId) -> Result<FileMetadata, StorageError> {
        let file = self.file(id)?;
        let holder = file.lock().holder;
        match holder {
            Some(reason) if reason != BusyReason::Compaction => Err(StorageError::Busy(reason)),
            _ => Ok(file.metadata(self.page_size)),
        }
    }

    fn try_acquire(&self, id: FileId) -> Result<MemLease, StorageError> {
        let file = self.file(id)?;
        {
            let mut state = file.lock();
            if let Some(holder) = state.holder {
                return Err(StorageError::Busy(holder));
            }
            state.holder = Some(BusyReason::Compaction);
        }
        Ok(MemLease { file })
    }

    fn rewrite_page(&self, lease: &mut MemLease) -> Result<PageRewrite, StorageError> {
        let file = &lease.file;
        file.rewrite_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = file.lock();
        if state.closed {
            return Err(StorageError::Closed(file.id));
        }
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected page write failure",
            )));
        }
        let Some(last_live) = state.pages.iter().rposition(|live| *live) else {
            return Ok(PageRewrite::NothingToMove);
        };
        let Some(first_free) = state.pages[..last_live].iter().position(|live| !*live) else {
            return Ok(PageRewrite::NothingToMove);
        };
        state.pages[first_free] = true;
        state.pages[last_live] = false;
        state.truncate_free_tail();
        Ok(PageRewrite::Rewritten {
            bytes: self.page_size,
        })
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn is_in_memory(&self) -> bool {
        self.in_memory
    }
}
