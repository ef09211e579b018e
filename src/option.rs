use std::{fmt, str::FromStr, time::Duration};

use thiserror::Error;

use crate::compaction::CompactError;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;

/// Smallest free-space target a session accepts.
pub const MIN_FREE_SPACE_TARGET: ByteSize = ByteSize::mb(1);

/// Byte quantity used for space thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Quantity of `bytes` bytes.
    pub const fn b(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Quantity of `kb` kibibytes.
    pub const fn kb(kb: u64) -> Self {
        Self(kb * KB)
    }

    /// Quantity of `mb` mebibytes.
    pub const fn mb(mb: u64) -> Self {
        Self(mb * MB)
    }

    /// Quantity of `gb` gibibytes.
    pub const fn gb(gb: u64) -> Self {
        Self(gb * GB)
    }

    /// Number of bytes.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for ByteSize {
    fn from(bytes: u64) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0;
        if bytes != 0 && bytes % GB == 0 {
            write!(f, "{}GB", bytes / GB)
        } else if bytes != 0 && bytes % MB == 0 {
            write!(f, "{}MB", bytes / MB)
        } else if bytes != 0 && bytes % KB == 0 {
            write!(f, "{}KB", bytes / KB)
        } else {
            write!(f, "{bytes}B")
        }
    }
}

/// Error returned when a [`ByteSize`] string cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ByteSizeParseError {
    /// No digits before the unit suffix.
    #[error("missing numeric value in {0:?}")]
    MissingValue(String),
    /// The unit suffix is not one of `B`, `KB`, `MB`, `GB`.
    #[error("unknown size unit {0:?}")]
    UnknownUnit(String),
    /// The value does not fit in 64 bits once scaled.
    #[error("size {0:?} overflows")]
    Overflow(String),
}

impl FromStr for ByteSize {
    type Err = ByteSizeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(split);
        if digits.is_empty() {
            return Err(ByteSizeParseError::MissingValue(s.to_string()));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| ByteSizeParseError::Overflow(s.to_string()))?;
        let scale = match unit.trim().to_ascii_uppercase().as_str() {
            "" | "B" => 1,
            "K" | "KB" => KB,
            "M" | "MB" => MB,
            "G" | "GB" => GB,
            other => return Err(ByteSizeParseError::UnknownUnit(other.to_string())),
        };
        value
            .checked_mul(scale)
            .map(ByteSize)
            .ok_or_else(|| ByteSizeParseError::Overflow(s.to_string()))
    }
}

/// Settings for one background compaction session.
///
/// The snapshot is taken when a session is enabled; the worker only observes
/// a different one when it is explicitly reconfigured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionConfig {
    pub(crate) free_space_target: ByteSize,
    pub(crate) pass_interval: Duration,
    pub(crate) max_file_passes_without_progress: u32,
    pub(crate) pages_per_pass: u64,
    pub(crate) pages_per_batch: u64,
    pub(crate) retry_backoff: Duration,
    pub(crate) stat_retention: Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        CompactionConfig {
            free_space_target: ByteSize::mb(20),
            pass_interval: Duration::from_secs(1),
            max_file_passes_without_progress: 10,
            pages_per_pass: 1024,
            pages_per_batch: 16,
            retry_backoff: Duration::from_secs(60),
            stat_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl CompactionConfig {
    /// Minimum reclaimable space that makes a file eligible.
    pub fn free_space_target(self, free_space_target: impl Into<ByteSize>) -> Self {
        CompactionConfig {
            free_space_target: free_space_target.into(),
            ..self
        }
    }

    /// Pause between two files and between two passes.
    pub fn pass_interval(self, pass_interval: Duration) -> Self {
        CompactionConfig {
            pass_interval,
            ..self
        }
    }

    /// Consecutive unsuccessful attempts after which a file is left alone for
    /// the rest of the session. `0` disables the cap.
    pub fn max_file_passes_without_progress(self, max_file_passes_without_progress: u32) -> Self {
        CompactionConfig {
            max_file_passes_without_progress,
            ..self
        }
    }

    /// Page rewrites allowed in one executor call.
    pub fn pages_per_pass(self, pages_per_pass: u64) -> Self {
        CompactionConfig {
            pages_per_pass,
            ..self
        }
    }

    /// Page rewrites between two eligibility re-checks.
    pub fn pages_per_batch(self, pages_per_batch: u64) -> Self {
        CompactionConfig {
            pages_per_batch,
            ..self
        }
    }

    /// How long an unproductive file is skipped before it is tried again.
    pub fn retry_backoff(self, retry_backoff: Duration) -> Self {
        CompactionConfig {
            retry_backoff,
            ..self
        }
    }

    /// How long per-file tracking survives without a new attempt.
    pub fn stat_retention(self, stat_retention: Duration) -> Self {
        CompactionConfig {
            stat_retention,
            ..self
        }
    }

    /// Configured free-space target.
    pub fn target(&self) -> ByteSize {
        self.free_space_target
    }

    /// Configured pause between units of work.
    pub fn interval(&self) -> Duration {
        self.pass_interval
    }

    /// Reject settings that would make the worker spin or never qualify a file.
    pub fn validate(&self) -> Result<(), CompactError> {
        if self.free_space_target < MIN_FREE_SPACE_TARGET {
            return Err(CompactError::InvalidConfig {
                field: "free_space_target",
                reason: format!(
                    "{} is below the minimum of {}",
                    self.free_space_target, MIN_FREE_SPACE_TARGET
                ),
            });
        }
        if self.pass_interval.is_zero() {
            return Err(CompactError::InvalidConfig {
                field: "pass_interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.pages_per_pass == 0 {
            return Err(CompactError::InvalidConfig {
                field: "pages_per_pass",
                reason: "must be at least one page".to_string(),
            });
        }
        if self.pages_per_batch == 0 {
            return Err(CompactError::InvalidConfig {
                field: "pages_per_batch",
                reason: "must be at least one page".to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn batch_size(&self) -> u64 {
        self.pages_per_batch.min(self.pages_per_pass).max(1)
    }
}

/// Control-surface request toggling background compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactRequest {
    /// `true` enables (or reconfigures) the worker, `false` stops it.
    pub background: bool,
    /// Optional override of the default free-space target.
    pub free_space_target: Option<ByteSize>,
}

impl CompactRequest {
    /// Request enabling background compaction.
    pub fn enable(free_space_target: Option<ByteSize>) -> Self {
        Self {
            background: true,
            free_space_target,
        }
    }

    /// Request disabling background compaction.
    pub fn disable() -> Self {
        Self {
            background: false,
            free_space_target: None,
        }
    }

    /// Apply the request's overrides on top of `base`.
    pub(crate) fn config_from(&self, base: &CompactionConfig) -> CompactionConfig {
        match self.free_space_target {
            Some(target) => base.clone().free_space_target(target),
            None => base.clone(),
        }
    }
}
