//! Restartable walk over open, compactable data handles.

use crate::{
    id::FileId,
    storage::{DataFileHandle, StorageLayer},
};

/// Lazy cursor over the storage layer's open handles, in [`FileId`] order.
///
/// Every call to [`FileSetIterator::next_handle`] re-enumerates the open
/// handles, so files created or dropped mid-pass are picked up or skipped
/// without restarting anything. A pass ends when no handle sorts after the
/// cursor; the next call starts a new pass from the beginning.
#[derive(Debug, Clone, Default)]
pub struct FileSetIterator {
    cursor: Option<FileId>,
    passes_completed: u64,
}

impl FileSetIterator {
    /// Iterator positioned at the start of a pass.
    pub fn new() -> Self {
        Self::default()
    }

    /// Iterator that continues after `cursor`.
    pub fn resume_after(cursor: Option<FileId>) -> Self {
        Self {
            cursor,
            passes_completed: 0,
        }
    }

    /// Last handle yielded in the current pass.
    pub fn cursor(&self) -> Option<FileId> {
        self.cursor
    }

    /// Passes walked to completion.
    pub fn passes_completed(&self) -> u64 {
        self.passes_completed
    }

    /// Next compactable handle of the current pass, or `None` when the pass
    /// is over.
    pub fn next_handle<S>(&mut self, storage: &S) -> Option<DataFileHandle>
    where
        S: StorageLayer + ?Sized,
    {
        let next = storage
            .open_handles()
            .into_iter()
            .filter(|handle| handle.compactable)
            .filter(|handle| self.cursor.map_or(true, |cursor| handle.id > cursor))
            .min_by_key(|handle| handle.id);
        match next {
            Some(handle) => {
                self.cursor = Some(handle.id);
                Some(handle)
            }
            None => {
                self.cursor = None;
                self.passes_completed += 1;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mem::MemStorage;

    fn drain(iter: &mut FileSetIterator, storage: &MemStorage) -> Vec<FileId> {
        std::iter::from_fn(|| iter.next_handle(storage))
            .map(|handle| handle.id)
            .collect()
    }

    #[test]
    fn covers_every_compactable_file_once_per_pass() {
        let storage = MemStorage::new();
        let a = storage.create_file("file:a.wt");
        let _hs = storage.create_system_file("file:history.wt");
        let b = storage.create_file("file:b.wt");

        let mut iter = FileSetIterator::new();
        assert_eq!(drain(&mut iter, &storage), vec![a, b]);
        assert_eq!(iter.passes_completed(), 1);
        assert_eq!(drain(&mut iter, &storage), vec![a, b]);
        assert_eq!(iter.passes_completed(), 2);
    }

    #[test]
    fn picks_up_files_created_and_dropped_mid_pass() {
        let storage = MemStorage::new();
        let a = storage.create_file("file:a.wt");
        let b = storage.create_file("file:b.wt");

        let mut iter = FileSetIterator::new();
        assert_eq!(iter.next_handle(&storage).map(|h| h.id), Some(a));
        storage.drop_file(b).expect("drop");
        let c = storage.create_file("file:c.wt");
        assert_eq!(iter.next_handle(&storage).map(|h| h.id), Some(c));
        assert!(iter.next_handle(&storage).is_none());
    }

    #[test]
    fn resumes_after_cursor_then_wraps() {
        let storage = MemStorage::new();
        let a = storage.create_file("file:a.wt");
        let b = storage.create_file("file:b.wt");
        let c = storage.create_file("file:c.wt");

        let mut iter = FileSetIterator::resume_after(Some(a));
        assert_eq!(drain(&mut iter, &storage), vec![b, c]);
        assert_eq!(drain(&mut iter, &storage), vec![a, b, c]);
    }

    #[test]
    fn empty_storage_ends_pass_immediately() {
        let storage = MemStorage::new();
        let mut iter = FileSetIterator::new();
        assert!(iter.next_handle(&storage).is_none());
        assert_eq!(iter.passes_completed(), 1);
        assert_eq!(iter.cursor(), None);
    }
}
