//! Background compaction of page-based data files.
//!
//! A single worker per manager walks the open files, asks the evaluator
//! whether each one has enough reclaimable space, and hands eligible files to
//! the executor, which moves live pages toward the start of the file in small
//! leased batches.

/// Control-surface errors.
mod error;
/// Per-file eligibility checks.
pub mod evaluator;
/// Batched page rewrites for a single file.
pub mod executor;
/// Unified handle for the background compaction worker.
mod handle;
/// Per-file attempt tracking and backoff.
mod history;
/// Restartable cursor over the open data files.
pub mod iter;
/// Lifecycle control for background compaction sessions.
mod manager;
/// Session statistics.
pub mod metrics;
/// Manager lifecycle states.
mod states;
/// The background loop.
mod worker;

pub use error::CompactError;
pub use evaluator::{Eligibility, FileSpaceEvaluator, Unavailability};
pub use executor::{
    AbortReason, CompactOutcome, CompactionBudget, CompactionExecutor, CompactionReport,
    StopReason,
};
pub use iter::FileSetIterator;
pub use manager::BackgroundCompactionManager;
pub use metrics::{CompactionStats, CompactionStatsSnapshot};
pub use states::CompactionState;
