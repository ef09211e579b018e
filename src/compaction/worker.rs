//! The background compaction loop.
//!
//! One worker exists per enabled session. It walks the open files one at a
//! time, pausing `pass_interval` before every file and at the end of every
//! pass, and stops cooperatively when its cancellation token fires. The
//! token is only observed between files and between page batches, so a page
//! rewrite is never torn.

use std::{sync::Arc, time::Instant};

use tokio_util::sync::CancellationToken;

use crate::{
    compaction::{
        evaluator::{Eligibility, FileSpaceEvaluator},
        executor::{AbortReason, CompactOutcome, CompactionBudget, CompactionExecutor},
        handle::WorkerSignal,
        history::{AttemptResult, FileHistory},
        iter::FileSetIterator,
        metrics::{CompactionStats, SkipReason},
        states::{CompactionState, SharedState},
    },
    logging::{compact_log, LogContext},
    option::CompactionConfig,
    storage::{DataFileHandle, StorageLayer},
};

const WORKER_LOG_CTX: LogContext = LogContext::new("component=bg_compact_worker");

pub(crate) struct CompactionWorker<S: StorageLayer> {
    storage: Arc<S>,
    stats: Arc<CompactionStats>,
    state: Arc<SharedState>,
    config: Arc<CompactionConfig>,
    signals: flume::Receiver<WorkerSignal>,
    cancel: CancellationToken,
    files: FileSetIterator,
    history: FileHistory,
    evaluator: FileSpaceEvaluator,
    executor: CompactionExecutor,
    session: u64,
}

/// Publishes the stopped state however the loop exits, unwinding included.
/// Both writes are tagged with the worker's session and are no-ops once a
/// newer session has started.
struct RunningGuard {
    stats: Arc<CompactionStats>,
    state: Arc<SharedState>,
    session: u64,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.stats.clear_running(self.session);
        self.state.set(self.session, CompactionState::Stopped);
        if std::thread::panicking() {
            compact_log!(
                log::Level::Error,
                ctx: WORKER_LOG_CTX,
                "bg_compact_worker_panicked",
                "session={}",
                self.session,
            );
        }
    }
}

impl<S: StorageLayer> CompactionWorker<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        storage: Arc<S>,
        stats: Arc<CompactionStats>,
        state: Arc<SharedState>,
        config: Arc<CompactionConfig>,
        signals: flume::Receiver<WorkerSignal>,
        cancel: CancellationToken,
        files: FileSetIterator,
        session: u64,
    ) -> Self {
        Self {
            storage,
            stats,
            state,
            config,
            signals,
            cancel,
            files,
            history: FileHistory::new(),
            evaluator: FileSpaceEvaluator::new(),
            executor: CompactionExecutor::new(),
            session,
        }
    }

    /// Run until cancelled. Returns the file cursor so a later session can
    /// continue where this one stopped.
    pub(crate) async fn run(mut self) -> FileSetIterator {
        let _guard = RunningGuard {
            stats: Arc::clone(&self.stats),
            state: Arc::clone(&self.state),
            session: self.session,
        };
        if self.cancel.is_cancelled() {
            return self.files;
        }
        self.stats.set_running(self.session);
        self.state.transition(
            self.session,
            CompactionState::Starting,
            CompactionState::Running,
        );
        compact_log!(
            log::Level::Info,
            ctx: WORKER_LOG_CTX,
            "bg_compact_worker_started",
            "session={} free_space_target={} pass_interval_ms={}",
            self.session,
            self.config.free_space_target,
            self.config.pass_interval.as_millis(),
        );

        loop {
            if !self.pause().await {
                break;
            }
            match self.files.next_handle(self.storage.as_ref()) {
                Some(handle) => self.process(handle).await,
                None => self.finish_pass(),
            }
            if self.cancel.is_cancelled() {
                break;
            }
        }

        compact_log!(
            log::Level::Info,
            ctx: WORKER_LOG_CTX,
            "bg_compact_worker_stopped",
            "session={} passes={} files_skipped={}",
            self.session,
            self.files.passes_completed(),
            self.stats.files_skipped(),
        );
        self.files
    }

    /// Wait one `pass_interval`, applying control signals as they arrive.
    /// Returns `false` once the worker should exit.
    async fn pause(&mut self) -> bool {
        let cancel = self.cancel.clone();
        let signals = self.signals.clone();
        let sleep = tokio::time::sleep(self.config.pass_interval);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                signal = signals.recv_async() => match signal {
                    Ok(WorkerSignal::Reconfigure(config)) => self.apply(config),
                    // The handle owns the sender and cancels on drop.
                    Err(_) => return false,
                },
                _ = &mut sleep => return true,
            }
        }
    }

    fn apply(&mut self, config: Arc<CompactionConfig>) {
        compact_log!(
            log::Level::Info,
            ctx: WORKER_LOG_CTX,
            "bg_compact_reconfigured",
            "session={} free_space_target={} pass_interval_ms={}",
            self.session,
            config.free_space_target,
            config.pass_interval.as_millis(),
        );
        self.config = config;
    }

    async fn process(&mut self, handle: DataFileHandle) {
        let config = Arc::clone(&self.config);
        let started = Instant::now();
        if !self.history.should_compact(
            handle.id,
            started,
            &config,
            self.stats.bytes_rewritten_ema(),
        ) {
            self.stats.record_skip(SkipReason::Backoff);
            self.log_skip(&handle, "backoff");
            return;
        }

        let start = match self
            .evaluator
            .evaluate(self.storage.as_ref(), handle.id, config.free_space_target)
        {
            Eligibility::Eligible(meta) => meta,
            Eligibility::NotEligible(meta) => {
                self.stats.record_skip(SkipReason::NotEligible);
                compact_log!(
                    log::Level::Debug,
                    ctx: WORKER_LOG_CTX,
                    "bg_compact_file_skipped",
                    "uri={} reason=not_eligible reclaimable_bytes={}",
                    handle.uri,
                    meta.reclaimable_bytes(),
                );
                return;
            }
            Eligibility::Unavailable(unavailable) => {
                self.stats.record_unavailable(unavailable);
                compact_log!(
                    log::Level::Debug,
                    ctx: WORKER_LOG_CTX,
                    "bg_compact_file_skipped",
                    "uri={} reason=unavailable detail={:?}",
                    handle.uri,
                    unavailable,
                );
                return;
            }
        };

        let outcome = self
            .executor
            .compact(
                self.storage.as_ref(),
                handle.id,
                CompactionBudget::from_config(&config),
                &self.cancel,
            )
            .await;
        self.stats.record_pages(handle.id, outcome.pages_rewritten());
        let finished = Instant::now();

        match outcome {
            CompactOutcome::Rewritten(report) => {
                let recovered = report.bytes_recovered();
                let result = self.history.record_attempt(
                    handle.id,
                    started,
                    finished,
                    recovered,
                    report.bytes_rewritten,
                );
                if result == AttemptResult::Successful {
                    self.stats.record_compacted(report.bytes_rewritten);
                }
                compact_log!(
                    log::Level::Info,
                    ctx: WORKER_LOG_CTX,
                    "bg_compact_file_compacted",
                    "uri={} pages_rewritten={} bytes_recovered={} stop={:?}",
                    handle.uri,
                    report.pages_rewritten,
                    recovered,
                    report.stop,
                );
            }
            CompactOutcome::Aborted {
                reason,
                pages_rewritten,
                bytes_rewritten,
            } => {
                self.stats.record_abort(&reason);
                if reason != AbortReason::Interrupted {
                    self.stats.record_skip(SkipReason::Unavailable);
                }
                let recovered = self
                    .storage
                    .metadata(handle.id)
                    .map(|meta| start.allocated_bytes.saturating_sub(meta.allocated_bytes))
                    .unwrap_or(0);
                let result = self.history.record_attempt(
                    handle.id,
                    started,
                    finished,
                    recovered,
                    bytes_rewritten,
                );
                if result == AttemptResult::Successful {
                    self.stats.record_compacted(bytes_rewritten);
                }
                compact_log!(
                    log::Level::Warn,
                    ctx: WORKER_LOG_CTX,
                    "bg_compact_file_aborted",
                    "uri={} reason={} pages_rewritten={}",
                    handle.uri,
                    reason,
                    pages_rewritten,
                );
            }
        }
    }

    fn finish_pass(&mut self) {
        self.history
            .prune(Instant::now(), self.config.stat_retention);
        compact_log!(
            log::Level::Debug,
            ctx: WORKER_LOG_CTX,
            "bg_compact_pass_finished",
            "session={} pass={} tracked_files={} files_skipped={}",
            self.session,
            self.files.passes_completed(),
            self.history.len(),
            self.stats.files_skipped(),
        );
    }

    fn log_skip(&self, handle: &DataFileHandle, reason: &str) {
        compact_log!(
            log::Level::Debug,
            ctx: WORKER_LOG_CTX,
            "bg_compact_file_skipped",
            "uri={} reason={}",
            handle.uri,
            reason,
        );
    }
}
