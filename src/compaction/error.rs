use thiserror::Error;

/// Rejected control-surface requests.
///
/// Per-file outcomes never surface here; they are folded into statistics by
/// the background worker.
#[derive(Debug, Error)]
pub enum CompactError {
    /// A configuration value is out of range.
    #[error("invalid compaction config `{field}`: {reason}")]
    InvalidConfig {
        /// Offending setting.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
    /// Disable was requested while no session is active.
    #[error("background compaction is not enabled")]
    NotEnabled,
    /// The storage engine cannot be compacted in the background.
    #[error("background compaction is not supported for {0} databases")]
    NotSupported(&'static str),
    /// Enable was requested outside a tokio runtime.
    #[error("background compaction requires a tokio runtime")]
    NoRuntime,
    /// The worker terminated abnormally; the session has been stopped.
    #[error("background compaction worker failed: {0}")]
    Worker(String),
}
