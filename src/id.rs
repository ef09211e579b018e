use std::sync::{Mutex, PoisonError};

use ulid::{Generator, Ulid};

/// Identifier of one data file as seen by the compaction manager.
///
/// Identifiers are time-ordered, so sorting by [`FileId`] yields creation order.
pub type FileId = Ulid;

/// Thread-safe ULID generator scoped to a single storage instance.
pub struct FileIdGenerator {
    inner: Mutex<Generator>,
}

impl FileIdGenerator {
    /// Create a new generator seeded with the current time.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Generator::new()),
        }
    }

    /// Produce the next [`FileId`] in a monotonic, time-ordered sequence.
    ///
    /// When the random component overflows within one millisecond the
    /// generator falls back to a fresh id, which is still unique but may sort
    /// before its predecessor.
    pub fn generate(&self) -> FileId {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.generate().unwrap_or_else(|_| Ulid::new())
    }
}

impl Default for FileIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
