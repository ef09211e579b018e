#![deny(missing_docs)]
//! Background compaction for page-based storage engines.
//!
//! A [`BackgroundCompactionManager`] runs one worker task that periodically
//! visits every open data file, and for files with at least
//! `free_space_target` bytes of reclaimable space moves live pages toward the
//! start of the file so the tail can be released. The storage engine is
//! reached only through the [`storage::StorageLayer`] trait; an in-memory
//! implementation lives in [`storage::mem`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bgcompact::{
//!     option::{ByteSize, CompactRequest},
//!     storage::mem::MemStorage,
//!     BackgroundCompactionManager,
//! };
//!
//! # async fn run() -> Result<(), bgcompact::CompactError> {
//! let manager = BackgroundCompactionManager::new(Arc::new(MemStorage::new()));
//! manager
//!     .compact(CompactRequest::enable(Some(ByteSize::mb(1))))
//!     .await?;
//! assert!(manager.stats().session() > 0);
//! manager.compact(CompactRequest::disable()).await?;
//! assert!(!manager.is_running());
//! # Ok(())
//! # }
//! ```

/// Background compaction manager, worker and statistics.
pub mod compaction;
/// File identifiers.
pub mod id;
mod logging;
/// Compaction configuration and control requests.
pub mod option;
/// Storage-layer contract and in-memory implementation.
pub mod storage;

pub use crate::{
    compaction::{
        BackgroundCompactionManager, CompactError, CompactionState, CompactionStats,
        CompactionStatsSnapshot,
    },
    id::FileId,
    option::{ByteSize, CompactRequest, CompactionConfig},
};
