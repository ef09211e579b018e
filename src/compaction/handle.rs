//! Handle to the background compaction worker.

use std::sync::Arc;

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{compaction::iter::FileSetIterator, option::CompactionConfig};

/// Messages the control surface sends to a running worker.
#[derive(Debug)]
pub(crate) enum WorkerSignal {
    /// Replace the session config from the next unit of work on.
    Reconfigure(Arc<CompactionConfig>),
}

/// Handle to a background compaction worker.
///
/// Provides control over the worker lifecycle. The worker is cancelled when
/// the handle is dropped; [`CompactionHandle::stop`] additionally waits for
/// it to exit. The join handle stays in place until the join completes, so an
/// abandoned `stop` can be resumed by calling it again.
pub(crate) struct CompactionHandle {
    session: u64,
    cancel: CancellationToken,
    join: Option<JoinHandle<FileSetIterator>>,
    signals: flume::Sender<WorkerSignal>,
}

impl CompactionHandle {
    /// Create a new compaction handle.
    pub(crate) fn new(
        session: u64,
        cancel: CancellationToken,
        join: JoinHandle<FileSetIterator>,
        signals: flume::Sender<WorkerSignal>,
    ) -> Self {
        Self {
            session,
            cancel,
            join: Some(join),
            signals,
        }
    }

    /// Session the worker was started for.
    pub(crate) fn session(&self) -> u64 {
        self.session
    }

    /// Hand a new config to the worker. Returns `false` if it already exited.
    pub(crate) fn reconfigure(&self, config: Arc<CompactionConfig>) -> bool {
        self.signals.send(WorkerSignal::Reconfigure(config)).is_ok()
    }

    /// Whether the worker task has exited.
    pub(crate) fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancel the worker and wait until it has exited, taking back its
    /// file cursor.
    pub(crate) async fn stop(&mut self) -> Result<FileSetIterator, JoinError> {
        self.cancel.cancel();
        let Some(join) = self.join.as_mut() else {
            return Ok(FileSetIterator::default());
        };
        let joined = join.await;
        self.join = None;
        joined
    }
}

impl Drop for CompactionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
