//! Session-scoped background compaction statistics.
//!
//! One [`CompactionStats`] lives per storage engine instance. Only the
//! background worker mutates it; any thread may read it. Counters are plain
//! atomics and the per-file page map sits behind a reader-friendly lock, so a
//! statistics read never waits on a page rewrite. `running` is tagged with
//! the session that set it, so a worker from an earlier session can never
//! clear the flag of a later one.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        PoisonError, RwLock,
    },
};

use crate::{
    compaction::{evaluator::Unavailability, executor::AbortReason},
    id::FileId,
    storage::BusyReason,
};

/// Weight of the latest successful attempt in the bytes-rewritten average.
const EMA_WEIGHT: f64 = 0.1;

/// Why a file was skipped during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SkipReason {
    /// Reclaimable space below the target.
    NotEligible,
    /// File could not be inspected or claimed.
    Unavailable,
    /// Recent attempts on the file were unproductive.
    Backoff,
}

/// Point-in-time copy of [`CompactionStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompactionStatsSnapshot {
    /// Whether the worker is alive.
    pub running: bool,
    /// Number of the current (or last) session; starts at 1 on first enable.
    pub session: u64,
    /// Qualification checks that rejected a file this session; always the sum
    /// of the three `skipped_*` counters.
    pub files_skipped: u64,
    /// Skips because the file was below the free-space target.
    pub skipped_not_eligible: u64,
    /// Skips because the file was busy, closed or aborted.
    pub skipped_unavailable: u64,
    /// Skips because of per-file backoff.
    pub skipped_backoff: u64,
    /// Attempts that gave space back.
    pub files_compacted: u64,
    /// Executor calls that aborted on a fault or conflict.
    pub compact_failures: u64,
    /// Times a file was found held by a checkpoint.
    pub busy_checkpoint: u64,
    /// Times a file was found held by a schema operation.
    pub busy_ddl: u64,
    /// Executor calls cut short by disable.
    pub interrupted: u64,
    /// Moving average of bytes rewritten by successful attempts.
    pub bytes_rewritten_ema: u64,
    /// Pages rewritten per file this session.
    pub pages_rewritten: HashMap<FileId, u64>,
}

/// Shared background compaction counters.
#[derive(Debug, Default)]
pub struct CompactionStats {
    /// Session of the live worker, `0` when none.
    running_session: AtomicU64,
    session: AtomicU64,
    skipped_not_eligible: AtomicU64,
    skipped_unavailable: AtomicU64,
    skipped_backoff: AtomicU64,
    files_compacted: AtomicU64,
    compact_failures: AtomicU64,
    busy_checkpoint: AtomicU64,
    busy_ddl: AtomicU64,
    interrupted: AtomicU64,
    bytes_rewritten_ema: AtomicU64,
    pages_rewritten: RwLock<HashMap<FileId, u64>>,
}

impl CompactionStats {
    /// Fresh, zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the background worker is currently alive.
    pub fn running(&self) -> bool {
        self.running_session.load(Ordering::Acquire) != 0
    }

    /// Current session number.
    pub fn session(&self) -> u64 {
        self.session.load(Ordering::Acquire)
    }

    /// Files skipped this session.
    pub fn files_skipped(&self) -> u64 {
        self.skipped_not_eligible
            .load(Ordering::Relaxed)
            .saturating_add(self.skipped_unavailable.load(Ordering::Relaxed))
            .saturating_add(self.skipped_backoff.load(Ordering::Relaxed))
    }

    /// Pages rewritten in `id` this session; `0` for unknown files.
    pub fn pages_rewritten(&self, id: FileId) -> u64 {
        self.pages_rewritten
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .copied()
            .unwrap_or(0)
    }

    /// Current moving average of bytes rewritten per successful attempt.
    pub fn bytes_rewritten_ema(&self) -> u64 {
        self.bytes_rewritten_ema.load(Ordering::Relaxed)
    }

    /// Copy every counter.
    pub fn snapshot(&self) -> CompactionStatsSnapshot {
        let skipped_not_eligible = self.skipped_not_eligible.load(Ordering::Relaxed);
        let skipped_unavailable = self.skipped_unavailable.load(Ordering::Relaxed);
        let skipped_backoff = self.skipped_backoff.load(Ordering::Relaxed);
        CompactionStatsSnapshot {
            running: self.running(),
            session: self.session(),
            files_skipped: skipped_not_eligible
                .saturating_add(skipped_unavailable)
                .saturating_add(skipped_backoff),
            skipped_not_eligible,
            skipped_unavailable,
            skipped_backoff,
            files_compacted: self.files_compacted.load(Ordering::Relaxed),
            compact_failures: self.compact_failures.load(Ordering::Relaxed),
            busy_checkpoint: self.busy_checkpoint.load(Ordering::Relaxed),
            busy_ddl: self.busy_ddl.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
            bytes_rewritten_ema: self.bytes_rewritten_ema.load(Ordering::Relaxed),
            pages_rewritten: self
                .pages_rewritten
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    /// Zero every session counter and open a new session. Must run before
    /// the session's worker starts.
    pub(crate) fn begin_session(&self) -> u64 {
        for counter in [
            &self.skipped_not_eligible,
            &self.skipped_unavailable,
            &self.skipped_backoff,
            &self.files_compacted,
            &self.compact_failures,
            &self.busy_checkpoint,
            &self.busy_ddl,
            &self.interrupted,
            &self.bytes_rewritten_ema,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.pages_rewritten
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.session.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Mark the worker of `session` as alive.
    pub(crate) fn set_running(&self, session: u64) {
        self.running_session.store(session, Ordering::Release);
    }

    /// Clear `running` if it still belongs to `session`.
    pub(crate) fn clear_running(&self, session: u64) -> bool {
        self.running_session
            .compare_exchange(session, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn record_skip(&self, reason: SkipReason) {
        let counter = match reason {
            SkipReason::NotEligible => &self.skipped_not_eligible,
            SkipReason::Unavailable => &self.skipped_unavailable,
            SkipReason::Backoff => &self.skipped_backoff,
        };
        add_saturating(counter, 1);
    }

    pub(crate) fn record_unavailable(&self, unavailable: Unavailability) {
        self.record_skip(SkipReason::Unavailable);
        if let Unavailability::Busy(reason) = unavailable {
            self.record_busy(reason);
        }
    }

    pub(crate) fn record_pages(&self, id: FileId, pages: u64) {
        if pages == 0 {
            return;
        }
        let mut guard = self
            .pages_rewritten
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = guard.entry(id).or_insert(0);
        *entry = entry.saturating_add(pages);
    }

    /// Record an attempt that gave space back and fold `bytes_rewritten` into
    /// the moving average.
    pub(crate) fn record_compacted(&self, bytes_rewritten: u64) {
        add_saturating(&self.files_compacted, 1);
        let _ = self
            .bytes_rewritten_ema
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                let next =
                    EMA_WEIGHT * bytes_rewritten as f64 + (1.0 - EMA_WEIGHT) * current as f64;
                Some(next.round() as u64)
            });
    }

    /// Record an aborted executor call. Interruptions are not failures.
    pub(crate) fn record_abort(&self, reason: &AbortReason) {
        match reason {
            AbortReason::Interrupted => add_saturating(&self.interrupted, 1),
            AbortReason::Busy(busy) => {
                add_saturating(&self.compact_failures, 1);
                self.record_busy(*busy);
            }
            AbortReason::Closed | AbortReason::Io(_) => add_saturating(&self.compact_failures, 1),
        }
    }

    fn record_busy(&self, reason: BusyReason) {
        match reason {
            BusyReason::Checkpoint => add_saturating(&self.busy_checkpoint, 1),
            BusyReason::Ddl => add_saturating(&self.busy_ddl, 1),
            BusyReason::Verify | BusyReason::Compaction => {}
        }
    }
}

fn add_saturating(counter: &AtomicU64, delta: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_add(delta))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::FileIdGenerator;

    #[test]
    fn skips_are_split_by_reason_and_summed() {
        let stats = CompactionStats::new();
        stats.record_skip(SkipReason::NotEligible);
        stats.record_skip(SkipReason::NotEligible);
        stats.record_skip(SkipReason::Backoff);
        stats.record_unavailable(Unavailability::Busy(BusyReason::Checkpoint));
        stats.record_unavailable(Unavailability::Closed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.files_skipped, 5);
        assert_eq!(stats.files_skipped(), 5);
        assert_eq!(snapshot.skipped_not_eligible, 2);
        assert_eq!(snapshot.skipped_backoff, 1);
        assert_eq!(snapshot.skipped_unavailable, 2);
        assert_eq!(snapshot.busy_checkpoint, 1);
        assert_eq!(snapshot.compact_failures, 0);
    }

    #[test]
    fn pages_accumulate_per_file() {
        let ids = FileIdGenerator::new();
        let (a, b) = (ids.generate(), ids.generate());
        let stats = CompactionStats::new();
        stats.record_pages(a, 10);
        stats.record_pages(a, 5);
        stats.record_pages(b, 0);
        assert_eq!(stats.pages_rewritten(a), 15);
        assert_eq!(stats.pages_rewritten(b), 0);
        assert!(!stats.snapshot().pages_rewritten.contains_key(&b));
    }

    #[test]
    fn begin_session_resets_everything_but_running() {
        let ids = FileIdGenerator::new();
        let stats = CompactionStats::new();
        assert_eq!(stats.begin_session(), 1);
        stats.set_running(1);
        stats.record_skip(SkipReason::NotEligible);
        stats.record_pages(ids.generate(), 3);
        stats.record_compacted(4096);
        stats.record_abort(&AbortReason::Busy(BusyReason::Ddl));
        stats.record_abort(&AbortReason::Interrupted);

        assert_eq!(stats.begin_session(), 2);
        let snapshot = stats.snapshot();
        assert_eq!(
            snapshot,
            CompactionStatsSnapshot {
                running: true,
                session: 2,
                ..CompactionStatsSnapshot::default()
            }
        );
    }

    #[test]
    fn stale_session_cannot_clear_running() {
        let stats = CompactionStats::new();
        stats.set_running(1);
        stats.set_running(2);
        assert!(!stats.clear_running(1));
        assert!(stats.running());
        assert!(stats.clear_running(2));
        assert!(!stats.running());
    }

    #[test]
    fn moving_average_weights_latest_attempt() {
        let stats = CompactionStats::new();
        stats.record_compacted(1000);
        assert_eq!(stats.bytes_rewritten_ema(), 100);
        stats.record_compacted(1000);
        assert_eq!(stats.bytes_rewritten_ema(), 190);
    }

    #[test]
    fn aborts_are_classified() {
        let stats = CompactionStats::new();
        stats.record_abort(&AbortReason::Io("disk".to_string()));
        stats.record_abort(&AbortReason::Closed);
        stats.record_abort(&AbortReason::Busy(BusyReason::Checkpoint));
        stats.record_abort(&AbortReason::Interrupted);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.compact_failures, 3);
        assert_eq!(snapshot.busy_checkpoint, 1);
        assert_eq!(snapshot.interrupted, 1);
    }
}
