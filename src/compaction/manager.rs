//! Control surface for background compaction.
//!
//! [`BackgroundCompactionManager`] owns the worker lifecycle and the session
//! config. Enable resets the session statistics before the worker exists, so
//! no reader can observe a previous session's counters once the new session
//! reports `running`. Disable waits for the worker to exit, so `running` is
//! `false` as soon as it returns. The worker handle stays in the control
//! block until its task has been joined; a disable that is dropped midway
//! leaves it there for the next disable or enable to finish reaping.

use std::sync::Arc;

use async_lock::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    compaction::{
        handle::CompactionHandle,
        iter::FileSetIterator,
        metrics::{CompactionStats, CompactionStatsSnapshot},
        states::{CompactionState, SharedState},
        worker::CompactionWorker,
        CompactError,
    },
    id::FileId,
    logging::{compact_log, LogContext},
    option::{CompactRequest, CompactionConfig},
    storage::StorageLayer,
};

const MANAGER_LOG_CTX: LogContext = LogContext::new("component=bg_compact_manager");

#[derive(Default)]
struct Control {
    worker: Option<CompactionHandle>,
    config: Option<Arc<CompactionConfig>>,
    /// Cursor handed from one session to the next.
    files: FileSetIterator,
}

/// Background compaction manager for one storage engine instance.
pub struct BackgroundCompactionManager<S: StorageLayer> {
    storage: Arc<S>,
    stats: Arc<CompactionStats>,
    state: Arc<SharedState>,
    defaults: CompactionConfig,
    control: Mutex<Control>,
}

impl<S: StorageLayer> BackgroundCompactionManager<S> {
    /// Manager with its own statistics.
    pub fn new(storage: Arc<S>) -> Self {
        Self::with_stats(storage, Arc::new(CompactionStats::new()))
    }

    /// Manager publishing into `stats`, typically owned by the engine handle.
    pub fn with_stats(storage: Arc<S>, stats: Arc<CompactionStats>) -> Self {
        Self {
            storage,
            stats,
            state: Arc::new(SharedState::default()),
            defaults: CompactionConfig::default(),
            control: Mutex::new(Control::default()),
        }
    }

    /// Base config that [`CompactRequest`] overrides are applied to.
    pub fn with_default_config(self, defaults: CompactionConfig) -> Self {
        Self { defaults, ..self }
    }

    /// Shared statistics.
    pub fn stats(&self) -> Arc<CompactionStats> {
        Arc::clone(&self.stats)
    }

    /// Copy of the current statistics.
    pub fn snapshot(&self) -> CompactionStatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether the worker is alive.
    pub fn is_running(&self) -> bool {
        self.stats.running()
    }

    /// Files skipped this session.
    pub fn files_skipped(&self) -> u64 {
        self.stats.files_skipped()
    }

    /// Pages rewritten in `id` this session.
    pub fn pages_rewritten(&self, id: FileId) -> u64 {
        self.stats.pages_rewritten(id)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CompactionState {
        self.state.get()
    }

    /// Config of the active session, if any.
    pub async fn current_config(&self) -> Option<CompactionConfig> {
        let control = self.control.lock().await;
        if self.state.get() == CompactionState::Stopped {
            return None;
        }
        control.config.as_deref().cloned()
    }

    /// Apply a control-surface request.
    pub async fn compact(&self, request: CompactRequest) -> Result<(), CompactError> {
        if request.background {
            self.enable(request.config_from(&self.defaults)).await
        } else {
            self.disable().await
        }
    }

    /// Start a session with `config`, or hand `config` to the running worker
    /// without touching the session's statistics.
    pub async fn enable(&self, config: CompactionConfig) -> Result<(), CompactError> {
        config.validate()?;
        if self.storage.is_readonly() {
            return Err(CompactError::NotSupported("readonly"));
        }
        if self.storage.is_in_memory() {
            return Err(CompactError::NotSupported("in-memory"));
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| CompactError::NoRuntime)?;
        let config = Arc::new(config);

        let mut control = self.control.lock().await;
        if let Some(worker) = control.worker.as_ref() {
            let alive = !worker.is_finished()
                && worker.session() == self.state.session()
                && matches!(
                    self.state.get(),
                    CompactionState::Starting | CompactionState::Running
                );
            if alive && worker.reconfigure(Arc::clone(&config)) {
                control.config = Some(config);
                return Ok(());
            }
            // The previous worker died or its disable was abandoned; finish
            // reaping it before another one is spawned.
            if let Err(err) = self.stop_worker(&mut control).await {
                compact_log!(
                    log::Level::Warn,
                    ctx: MANAGER_LOG_CTX,
                    "bg_compact_worker_reaped",
                    "error={}",
                    err,
                );
            }
        }

        let session = self.stats.begin_session();
        self.state.start(session);
        let cancel = CancellationToken::new();
        let (signals_tx, signals_rx) = flume::unbounded();
        let worker = CompactionWorker::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.stats),
            Arc::clone(&self.state),
            Arc::clone(&config),
            signals_rx,
            cancel.clone(),
            std::mem::take(&mut control.files),
            session,
        );
        let join = runtime.spawn(worker.run());
        control.worker = Some(CompactionHandle::new(session, cancel, join, signals_tx));
        control.config = Some(config);
        compact_log!(
            log::Level::Info,
            ctx: MANAGER_LOG_CTX,
            "bg_compact_enabled",
            "session={}",
            session,
        );
        Ok(())
    }

    /// Stop the session and wait for the worker to exit.
    pub async fn disable(&self) -> Result<(), CompactError> {
        let mut control = self.control.lock().await;
        if control.worker.is_none() {
            return Err(CompactError::NotEnabled);
        }
        let result = self.stop_worker(&mut control).await;
        compact_log!(
            log::Level::Info,
            ctx: MANAGER_LOG_CTX,
            "bg_compact_disabled",
            "session={} files_skipped={}",
            self.stats.session(),
            self.stats.files_skipped(),
        );
        result
    }

    /// Cancel and join the worker in `control`. Cancel safe: the handle is
    /// only removed once the join has completed.
    async fn stop_worker(&self, control: &mut Control) -> Result<(), CompactError> {
        let Some(worker) = control.worker.as_mut() else {
            return Ok(());
        };
        let session = worker.session();
        self.state.set(session, CompactionState::Stopping);
        let joined = worker.stop().await;
        control.worker = None;
        self.stats.clear_running(session);
        self.state.set(session, CompactionState::Stopped);
        control.config = None;
        match joined {
            Ok(files) => {
                control.files = files;
                Ok(())
            }
            Err(err) => {
                control.files = FileSetIterator::new();
                Err(CompactError::Worker(err.to_string()))
            }
        }
    }
}
