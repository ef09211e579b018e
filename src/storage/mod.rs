//! Storage-layer contract consumed by the compaction manager.
//!
//! The storage engine owns data handles, their size metadata and the page
//! rewrite primitive. The manager only ever holds short-lived, re-validated
//! references obtained through [`StorageLayer`].

/// In-memory page-file storage implementing the contract.
pub mod mem;

use std::{fmt, io};

use thiserror::Error;

use crate::id::FileId;

/// Operation currently holding a file exclusively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusyReason {
    /// A checkpoint is writing the file.
    Checkpoint,
    /// A schema operation (drop, rename, alter) owns the file.
    Ddl,
    /// The file is being verified.
    Verify,
    /// Another compaction holds the file.
    Compaction,
}

impl fmt::Display for BusyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BusyReason::Checkpoint => "checkpoint",
            BusyReason::Ddl => "ddl",
            BusyReason::Verify => "verify",
            BusyReason::Compaction => "compaction",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The file is exclusively held by another operation.
    #[error("file busy with {0}")]
    Busy(BusyReason),
    /// The handle was closed or dropped.
    #[error("file {0} is no longer open")]
    Closed(FileId),
    /// Underlying I/O failure.
    #[error("storage io error: {0}")]
    Io(#[from] io::Error),
}

/// Size metadata the storage layer keeps up to date for every open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileMetadata {
    /// Bytes the file occupies on disk.
    pub allocated_bytes: u64,
    /// Bytes holding live data.
    pub live_bytes: u64,
}

impl FileMetadata {
    /// Space compaction could give back.
    pub fn reclaimable_bytes(&self) -> u64 {
        self.allocated_bytes.saturating_sub(self.live_bytes)
    }
}

/// Non-owning view of one open data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFileHandle {
    /// Stable identifier.
    pub id: FileId,
    /// Name the engine addresses the file by.
    pub uri: String,
    /// `false` for files that must never be rewritten (e.g. the history store).
    pub compactable: bool,
    /// Metadata as of the enumeration; re-read before acting on it.
    pub cached: FileMetadata,
}

/// Result of a single page rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRewrite {
    /// One page was moved; `bytes` were written.
    Rewritten {
        /// Bytes written by the rewrite.
        bytes: u64,
    },
    /// No live page can move to a lower offset.
    NothingToMove,
}

/// Exclusive, non-blocking claim on one file for page rewrites.
///
/// Dropping the lease releases the file.
pub trait FileLease: Send {
    /// File the lease covers.
    fn file_id(&self) -> FileId;
}

/// Services the storage engine provides to the compaction manager.
pub trait StorageLayer: Send + Sync + 'static {
    /// Lease type returned by [`StorageLayer::try_acquire`].
    type Lease: FileLease;

    /// Snapshot of currently open data handles.
    fn open_handles(&self) -> Vec<DataFileHandle>;

    /// Cached size metadata. Never scans the file.
    ///
    /// Fails with [`StorageError::Busy`] while another operation holds the file
    /// exclusively and with [`StorageError::Closed`] once the handle is gone.
    /// A compaction lease does not make the metadata unreadable.
    fn metadata(&self, id: FileId) -> Result<FileMetadata, StorageError>;

    /// Claim `id` for page rewrites without waiting.
    fn try_acquire(&self, id: FileId) -> Result<Self::Lease, StorageError>;

    /// Rewrite one page of the leased file. Each call is individually durable.
    fn rewrite_page(&self, lease: &mut Self::Lease) -> Result<PageRewrite, StorageError>;

    /// Readonly engines cannot be compacted.
    fn is_readonly(&self) -> bool {
        false
    }

    /// In-memory engines have nothing to reclaim on disk.
    fn is_in_memory(&self) -> bool {
        false
    }
}
