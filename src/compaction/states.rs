use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle of the background compaction manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionState {
    /// No worker exists.
    Stopped,
    /// Enabled; the worker has not begun its loop yet.
    Starting,
    /// The worker is looping.
    Running,
    /// Disable requested; waiting for the worker to exit.
    Stopping,
}

impl CompactionState {
    fn as_u8(self) -> u8 {
        match self {
            CompactionState::Stopped => 0,
            CompactionState::Starting => 1,
            CompactionState::Running => 2,
            CompactionState::Stopping => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => CompactionState::Starting,
            2 => CompactionState::Running,
            3 => CompactionState::Stopping,
            _ => CompactionState::Stopped,
        }
    }
}

const STATE_BITS: u32 = 8;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

fn pack(session: u64, state: CompactionState) -> u64 {
    (session << STATE_BITS) | u64::from(state.as_u8())
}

/// State shared by the control surface and the worker.
///
/// The word also carries the session that last started, so a worker can only
/// publish transitions for its own session.
#[derive(Debug, Default)]
pub(crate) struct SharedState {
    inner: AtomicU64,
}

impl SharedState {
    pub(crate) fn get(&self) -> CompactionState {
        CompactionState::from_u8((self.inner.load(Ordering::Acquire) & STATE_MASK) as u8)
    }

    /// Session the state belongs to; `0` before the first enable.
    pub(crate) fn session(&self) -> u64 {
        self.inner.load(Ordering::Acquire) >> STATE_BITS
    }

    /// Open `session` in [`CompactionState::Starting`].
    pub(crate) fn start(&self, session: u64) {
        self.inner
            .store(pack(session, CompactionState::Starting), Ordering::Release);
    }

    /// Move `session` from `from` to `to`; returns `false` if the word held a
    /// different session or state.
    pub(crate) fn transition(
        &self,
        session: u64,
        from: CompactionState,
        to: CompactionState,
    ) -> bool {
        self.inner
            .compare_exchange(
                pack(session, from),
                pack(session, to),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move `session` to `to` from whatever state it is in.
    pub(crate) fn set(&self, session: u64, to: CompactionState) -> bool {
        self.inner
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                (word >> STATE_BITS == session).then(|| pack(session, to))
            })
            .is_ok()
    }
}
