//! Per-file record of recent compaction attempts.
//!
//! Lets the worker avoid reopening files that compaction is unlikely to help:
//! files whose last attempt recovered nothing, files that repeatedly made no
//! progress, and files whose last attempt rewrote less than the session's
//! moving average. Owned by the worker and cleared with each session.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::{id::FileId, option::CompactionConfig};

#[derive(Debug, Clone, Copy)]
struct FileRecord {
    start_time: Instant,
    last_unsuccessful: Option<Instant>,
    consecutive_unsuccessful: u32,
    bytes_rewritten: u64,
}

/// Result of recording one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttemptResult {
    /// The attempt gave allocated space back.
    Successful,
    /// The file did not shrink.
    Unsuccessful,
}

#[derive(Debug, Default)]
pub(crate) struct FileHistory {
    entries: HashMap<FileId, FileRecord>,
}

impl FileHistory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Whether `id` should be handed to the executor now.
    pub(crate) fn should_compact(
        &self,
        id: FileId,
        now: Instant,
        config: &CompactionConfig,
        bytes_rewritten_ema: u64,
    ) -> bool {
        let Some(record) = self.entries.get(&id) else {
            return true;
        };
        let cap = config.max_file_passes_without_progress;
        if cap > 0 && record.consecutive_unsuccessful >= cap {
            return false;
        }
        if let Some(failed_at) = record.last_unsuccessful {
            if now.saturating_duration_since(failed_at) < config.retry_backoff {
                return false;
            }
        }
        if record.bytes_rewritten < bytes_rewritten_ema
            && now.saturating_duration_since(record.start_time) < config.retry_backoff
        {
            return false;
        }
        true
    }

    /// Record an attempt started at `started` that recovered `bytes_recovered`
    /// allocated bytes while writing `bytes_rewritten`.
    pub(crate) fn record_attempt(
        &mut self,
        id: FileId,
        started: Instant,
        finished: Instant,
        bytes_recovered: u64,
        bytes_rewritten: u64,
    ) -> AttemptResult {
        let record = self.entries.entry(id).or_insert(FileRecord {
            start_time: started,
            last_unsuccessful: None,
            consecutive_unsuccessful: 0,
            bytes_rewritten: 0,
        });
        record.start_time = started;
        record.bytes_rewritten = bytes_rewritten;
        if bytes_recovered == 0 {
            record.last_unsuccessful = Some(finished);
            record.consecutive_unsuccessful = record.consecutive_unsuccessful.saturating_add(1);
            AttemptResult::Unsuccessful
        } else {
            record.consecutive_unsuccessful = 0;
            AttemptResult::Successful
        }
    }

    /// Forget files not attempted within `retention`.
    pub(crate) fn prune(&mut self, now: Instant, retention: Duration) {
        self.entries
            .retain(|_, record| now.saturating_duration_since(record.start_time) <= retention);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::FileIdGenerator;

    fn config() -> CompactionConfig {
        CompactionConfig::default()
            .retry_backoff(Duration::from_secs(60))
            .max_file_passes_without_progress(3)
    }

    #[test]
    fn unknown_files_are_always_tried() {
        let history = FileHistory::new();
        let id = FileIdGenerator::new().generate();
        assert!(history.should_compact(id, Instant::now(), &config(), u64::MAX));
    }

    #[test]
    fn unsuccessful_attempt_backs_off_until_retry_window_passes() {
        let mut history = FileHistory::new();
        let id = FileIdGenerator::new().generate();
        let t0 = Instant::now();
        assert_eq!(
            history.record_attempt(id, t0, t0, 0, 0),
            AttemptResult::Unsuccessful
        );
        assert!(!history.should_compact(id, t0 + Duration::from_secs(30), &config(), 0));
        assert!(history.should_compact(id, t0 + Duration::from_secs(61), &config(), 0));
    }

    #[test]
    fn below_average_attempt_is_deferred() {
        let mut history = FileHistory::new();
        let id = FileIdGenerator::new().generate();
        let t0 = Instant::now();
        assert_eq!(
            history.record_attempt(id, t0, t0, 4096, 4096),
            AttemptResult::Successful
        );
        let soon = t0 + Duration::from_secs(1);
        assert!(!history.should_compact(id, soon, &config(), 8192));
        assert!(history.should_compact(id, soon, &config(), 1024));
        assert!(history.should_compact(id, t0 + Duration::from_secs(61), &config(), 8192));
    }

    #[test]
    fn progress_cap_excludes_file_for_the_session() {
        let mut history = FileHistory::new();
        let id = FileIdGenerator::new().generate();
        let t0 = Instant::now();
        for _ in 0..3 {
            history.record_attempt(id, t0, t0, 0, 0);
        }
        let much_later = t0 + Duration::from_secs(3600);
        assert!(!history.should_compact(id, much_later, &config(), 0));

        let uncapped = config().max_file_passes_without_progress(0);
        assert!(history.should_compact(id, much_later, &uncapped, 0));

        history.record_attempt(id, much_later, much_later, 4096, 4096);
        assert!(history.should_compact(id, much_later, &config(), 0));
    }

    #[test]
    fn prune_drops_stale_entries() {
        let mut history = FileHistory::new();
        let ids = FileIdGenerator::new();
        let (old, fresh) = (ids.generate(), ids.generate());
        let t0 = Instant::now();
        history.record_attempt(old, t0, t0, 0, 0);
        let t1 = t0 + Duration::from_secs(100);
        history.record_attempt(fresh, t1, t1, 0, 0);
        history.prune(t1, Duration::from_secs(50));
        assert_eq!(history.len(), 1);
        assert!(history.should_compact(old, t1, &config(), 0));
    }
}
