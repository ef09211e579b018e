//! Page-rewrite driver for one qualifying file.
//!
//! Compaction of a file is a sequence of small, individually durable page
//! rewrites. The executor claims the file for a single page rewrite at a
//! time, so no exclusive lease outlives one rewrite, and re-checks the file's
//! eligibility between batches of rewrites. Cancellation is observed only at
//! batch boundaries.

use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::{
    compaction::evaluator::{Eligibility, FileSpaceEvaluator, Unavailability},
    id::FileId,
    option::{ByteSize, CompactionConfig},
    storage::{BusyReason, FileLease, FileMetadata, PageRewrite, StorageError, StorageLayer},
};

/// Limits applied to one executor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionBudget {
    /// Maximum page rewrites for the call.
    pub pages: u64,
    /// Page rewrites between eligibility re-checks.
    pub batch: u64,
    /// Stop once reclaimable space drops below this.
    pub threshold: ByteSize,
}

impl CompactionBudget {
    /// Budget derived from a session config.
    pub fn from_config(config: &CompactionConfig) -> Self {
        Self {
            pages: config.pages_per_pass,
            batch: config.batch_size(),
            threshold: config.free_space_target,
        }
    }
}

/// Why a successful call stopped rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The file no longer meets the free-space target.
    BelowTarget,
    /// The per-call page budget was used up.
    BudgetExhausted,
    /// No live page could move to a lower offset.
    NothingToMove,
}

/// Summary of a call that ran to one of its normal stopping points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    /// Pages rewritten.
    pub pages_rewritten: u64,
    /// Bytes written by the rewrites.
    pub bytes_rewritten: u64,
    /// Metadata before the first rewrite.
    pub start: FileMetadata,
    /// Metadata after the last rewrite.
    pub end: FileMetadata,
    /// What ended the call.
    pub stop: StopReason,
}

impl CompactionReport {
    /// Allocated bytes given back by the call.
    pub fn bytes_recovered(&self) -> u64 {
        self.start
            .allocated_bytes
            .saturating_sub(self.end.allocated_bytes)
    }
}

/// Why a call ended early. Rewrites done before the abort stay durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Another operation claimed the file.
    Busy(BusyReason),
    /// The file was closed or dropped.
    Closed,
    /// The session is stopping.
    Interrupted,
    /// A page rewrite failed.
    Io(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Busy(reason) => write!(f, "busy ({reason})"),
            AbortReason::Closed => f.write_str("closed"),
            AbortReason::Interrupted => f.write_str("interrupted"),
            AbortReason::Io(err) => write!(f, "io ({err})"),
        }
    }
}

impl From<StorageError> for AbortReason {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Busy(reason) => AbortReason::Busy(reason),
            StorageError::Closed(_) => AbortReason::Closed,
            StorageError::Io(err) => AbortReason::Io(err.to_string()),
        }
    }
}

impl From<Unavailability> for AbortReason {
    fn from(unavailable: Unavailability) -> Self {
        match unavailable {
            Unavailability::Busy(reason) => AbortReason::Busy(reason),
            Unavailability::Closed => AbortReason::Closed,
            Unavailability::Io => AbortReason::Io("metadata unreadable".to_string()),
        }
    }
}

/// Result of one executor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactOutcome {
    /// Rewrites stopped at a normal stopping point.
    Rewritten(CompactionReport),
    /// Rewrites stopped early.
    Aborted {
        /// Cause of the abort.
        reason: AbortReason,
        /// Pages rewritten before the abort.
        pages_rewritten: u64,
        /// Bytes written before the abort.
        bytes_rewritten: u64,
    },
}

impl CompactOutcome {
    /// Pages rewritten, whatever the outcome.
    pub fn pages_rewritten(&self) -> u64 {
        match self {
            CompactOutcome::Rewritten(report) => report.pages_rewritten,
            CompactOutcome::Aborted {
                pages_rewritten, ..
            } => *pages_rewritten,
        }
    }

    /// Bytes written, whatever the outcome.
    pub fn bytes_rewritten(&self) -> u64 {
        match self {
            CompactOutcome::Rewritten(report) => report.bytes_rewritten,
            CompactOutcome::Aborted {
                bytes_rewritten, ..
            } => *bytes_rewritten,
        }
    }
}

/// Rewrites pages of a file until it stops qualifying or the budget runs out.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactionExecutor {
    evaluator: FileSpaceEvaluator,
}

impl CompactionExecutor {
    /// Create an executor.
    pub fn new() -> Self {
        Self {
            evaluator: FileSpaceEvaluator::new(),
        }
    }

    /// Compact `id` within `budget`.
    pub async fn compact<S>(
        &self,
        storage: &S,
        id: FileId,
        budget: CompactionBudget,
        cancel: &CancellationToken,
    ) -> CompactOutcome
    where
        S: StorageLayer + ?Sized,
    {
        let mut progress = Progress::default();
        let start = match storage.metadata(id) {
            Ok(meta) => meta,
            Err(err) => return progress.abort(err.into()),
        };
        let batch = budget.batch.max(1);
        let mut last = start;

        let stop = loop {
            if progress.pages >= budget.pages {
                break StopReason::BudgetExhausted;
            }
            let batch_end = progress.pages.saturating_add(batch).min(budget.pages);
            match self.rewrite_batch(storage, id, &mut progress, batch_end) {
                Ok(true) => {}
                Ok(false) => break StopReason::NothingToMove,
                Err(reason) => return progress.abort(reason),
            }

            match self.evaluator.evaluate(storage, id, budget.threshold) {
                Eligibility::Eligible(meta) => last = meta,
                Eligibility::NotEligible(meta) => {
                    last = meta;
                    break StopReason::BelowTarget;
                }
                Eligibility::Unavailable(unavailable) => {
                    return progress.abort(unavailable.into());
                }
            }

            if cancel.is_cancelled() {
                return progress.abort(AbortReason::Interrupted);
            }
            tokio::task::yield_now().await;
        };

        let end = storage.metadata(id).unwrap_or(last);
        CompactOutcome::Rewritten(CompactionReport {
            pages_rewritten: progress.pages,
            bytes_rewritten: progress.bytes,
            start,
            end,
            stop,
        })
    }

    /// Rewrite pages until `batch_end`, leasing the file afresh for every
    /// page. Returns `false` once the storage reports nothing left to move.
    fn rewrite_batch<S>(
        &self,
        storage: &S,
        id: FileId,
        progress: &mut Progress,
        batch_end: u64,
    ) -> Result<bool, AbortReason>
    where
        S: StorageLayer + ?Sized,
    {
        while progress.pages < batch_end {
            let mut lease = storage.try_acquire(id)?;
            debug_assert_eq!(lease.file_id(), id);
            let rewrite = storage.rewrite_page(&mut lease);
            drop(lease);
            match rewrite? {
                PageRewrite::Rewritten { bytes } => {
                    progress.pages += 1;
                    progress.bytes = progress.bytes.saturating_add(bytes);
                }
                PageRewrite::NothingToMove => return Ok(false),
            }
        }
        Ok(true)
    }
}

#[derive(Debug, Default)]
struct Progress {
    pages: u64,
    bytes: u64,
}

impl Progress {
    fn abort(&self, reason: AbortReason) -> CompactOutcome {
        CompactOutcome::Aborted {
            reason,
            pages_rewritten: self.pages,
            bytes_rewritten: self.bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::storage::{
        mem::{MemLease, MemStorage},
        DataFileHandle,
    };

    const PAGE: u64 = 4 * 1024;

    fn fragmented(live_tail: usize, holes: usize) -> (MemStorage, FileId) {
        let storage = MemStorage::new().with_page_size(PAGE);
        let id = storage.create_file("file:frag.wt");
        storage.populate(id, holes + live_tail).expect("populate");
        storage.delete_pages(id, 0..holes).expect("delete");
        (storage, id)
    }

    fn budget(pages: u64, batch: u64) -> CompactionBudget {
        CompactionBudget {
            pages,
            batch,
            threshold: ByteSize::mb(1),
        }
    }

    #[tokio::test]
    async fn compacts_until_nothing_left_to_move() {
        let (storage, id) = fragmented(100, 900);
        let outcome = CompactionExecutor::new()
            .compact(&storage, id, budget(1024, 16), &CancellationToken::new())
            .await;
        let CompactOutcome::Rewritten(report) = outcome else {
            panic!("expected rewrite, got {outcome:?}");
        };
        assert_eq!(report.pages_rewritten, 100);
        assert_eq!(report.bytes_rewritten, 100 * PAGE);
        assert_eq!(report.end.allocated_bytes, 100 * PAGE);
        assert_eq!(report.bytes_recovered(), 900 * PAGE);
        assert!(matches!(
            report.stop,
            StopReason::BelowTarget | StopReason::NothingToMove
        ));
        assert!(!FileSpaceEvaluator::new()
            .evaluate(&storage, id, ByteSize::mb(1))
            .is_eligible());
    }

    #[tokio::test]
    async fn stops_once_below_target() {
        // 400 holes; each move shrinks the file by one page once the tail
        // is live, and the target is 256 pages of free space.
        let (storage, id) = fragmented(600, 400);
        let outcome = CompactionExecutor::new()
            .compact(&storage, id, budget(1024, 1), &CancellationToken::new())
            .await;
        let CompactOutcome::Rewritten(report) = outcome else {
            panic!("expected rewrite, got {outcome:?}");
        };
        assert_eq!(report.stop, StopReason::BelowTarget);
        assert_eq!(report.pages_rewritten, 145);
        assert!(report.end.reclaimable_bytes() < ByteSize::mb(1).as_u64());
    }

    #[tokio::test]
    async fn respects_page_budget() {
        let (storage, id) = fragmented(100, 900);
        let outcome = CompactionExecutor::new()
            .compact(&storage, id, budget(10, 4), &CancellationToken::new())
            .await;
        let CompactOutcome::Rewritten(report) = outcome else {
            panic!("expected rewrite, got {outcome:?}");
        };
        assert_eq!(report.stop, StopReason::BudgetExhausted);
        assert_eq!(report.pages_rewritten, 10);
        assert_eq!(storage.rewrite_calls(id), 10);
    }

    #[tokio::test]
    async fn busy_file_aborts_without_rewrites() {
        let (storage, id) = fragmented(100, 900);
        let _checkpoint = storage.hold(id, BusyReason::Checkpoint).expect("hold");
        let outcome = CompactionExecutor::new()
            .compact(&storage, id, budget(64, 8), &CancellationToken::new())
            .await;
        assert_eq!(
            outcome,
            CompactOutcome::Aborted {
                reason: AbortReason::Busy(BusyReason::Checkpoint),
                pages_rewritten: 0,
                bytes_rewritten: 0,
            }
        );
        assert_eq!(storage.rewrite_calls(id), 0);
    }

    #[tokio::test]
    async fn io_fault_keeps_partial_progress() {
        let (storage, id) = fragmented(100, 900);
        let executor = CompactionExecutor::new();
        let first = executor
            .compact(&storage, id, budget(5, 5), &CancellationToken::new())
            .await;
        assert_eq!(first.pages_rewritten(), 5);
        assert_eq!(first.bytes_rewritten(), 5 * PAGE);

        storage.fail_rewrites(id, 1).expect("inject");
        let second = executor
            .compact(&storage, id, budget(64, 8), &CancellationToken::new())
            .await;
        assert!(matches!(
            second,
            CompactOutcome::Aborted {
                reason: AbortReason::Io(_),
                pages_rewritten: 0,
                ..
            }
        ));
        let meta = storage.metadata(id).expect("metadata");
        assert_eq!(meta.allocated_bytes, 995 * PAGE);
        assert_eq!(meta.live_bytes, 100 * PAGE);
    }

    #[tokio::test]
    async fn cancellation_is_observed_between_batches() {
        let (storage, id) = fragmented(100, 900);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = CompactionExecutor::new()
            .compact(&storage, id, budget(64, 8), &cancel)
            .await;
        assert_eq!(
            outcome,
            CompactOutcome::Aborted {
                reason: AbortReason::Interrupted,
                pages_rewritten: 8,
                bytes_rewritten: 8 * PAGE,
            }
        );
    }

    /// Takes and releases a checkpoint hold before every lease request.
    struct CheckpointingStorage {
        inner: MemStorage,
        acquisitions: AtomicU64,
        holds_granted: AtomicU64,
    }

    impl StorageLayer for CheckpointingStorage {
        type Lease = MemLease;

        fn open_handles(&self) -> Vec<DataFileHandle> {
            self.inner.open_handles()
        }

        fn metadata(&self, id: FileId) -> Result<FileMetadata, StorageError> {
            self.inner.metadata(id)
        }

        fn try_acquire(&self, id: FileId) -> Result<MemLease, StorageError> {
            self.acquisitions.fetch_add(1, Ordering::Relaxed);
            if self.inner.hold(id, BusyReason::Checkpoint).is_ok() {
                self.holds_granted.fetch_add(1, Ordering::Relaxed);
            }
            self.inner.try_acquire(id)
        }

        fn rewrite_page(&self, lease: &mut MemLease) -> Result<PageRewrite, StorageError> {
            self.inner.rewrite_page(lease)
        }
    }

    #[tokio::test]
    async fn checkpoint_can_take_the_file_between_page_rewrites() {
        let (inner, id) = fragmented(100, 900);
        let storage = CheckpointingStorage {
            inner,
            acquisitions: AtomicU64::new(0),
            holds_granted: AtomicU64::new(0),
        };
        let outcome = CompactionExecutor::new()
            .compact(&storage, id, budget(8, 8), &CancellationToken::new())
            .await;
        assert_eq!(outcome.pages_rewritten(), 8);
        assert_eq!(storage.acquisitions.load(Ordering::Relaxed), 8);
        assert_eq!(storage.holds_granted.load(Ordering::Relaxed), 8);
    }
}
