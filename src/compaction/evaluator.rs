//! Fragmentation check deciding whether a file is worth compacting.

use crate::{
    id::FileId,
    option::ByteSize,
    storage::{BusyReason, FileMetadata, StorageError, StorageLayer},
};

/// Why a file could not be inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailability {
    /// Exclusively held by another operation.
    Busy(BusyReason),
    /// Closed or dropped since it was enumerated.
    Closed,
    /// Metadata could not be read.
    Io,
}

/// Outcome of a space evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// Reclaimable space meets the target.
    Eligible(FileMetadata),
    /// Reclaimable space is below the target.
    NotEligible(FileMetadata),
    /// The file could not be inspected right now.
    Unavailable(Unavailability),
}

impl Eligibility {
    /// `true` for [`Eligibility::Eligible`].
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible(_))
    }
}

/// Classifies files by reclaimable space using cached metadata only.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSpaceEvaluator;

impl FileSpaceEvaluator {
    /// Create an evaluator.
    pub fn new() -> Self {
        Self
    }

    /// Evaluate `id` against `threshold`. Side-effect free.
    pub fn evaluate<S>(&self, storage: &S, id: FileId, threshold: ByteSize) -> Eligibility
    where
        S: StorageLayer + ?Sized,
    {
        match storage.metadata(id) {
            Ok(meta) => Self::classify(meta, threshold),
            Err(StorageError::Busy(reason)) => {
                Eligibility::Unavailable(Unavailability::Busy(reason))
            }
            Err(StorageError::Closed(_)) => Eligibility::Unavailable(Unavailability::Closed),
            Err(StorageError::Io(_)) => Eligibility::Unavailable(Unavailability::Io),
        }
    }

    /// Classify already-read metadata.
    pub fn classify(meta: FileMetadata, threshold: ByteSize) -> Eligibility {
        if meta.reclaimable_bytes() >= threshold.as_u64() {
            Eligibility::Eligible(meta)
        } else {
            Eligibility::NotEligible(meta)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mem::MemStorage;

    const PAGE: u64 = 4 * 1024;

    fn storage() -> MemStorage {
        MemStorage::new().with_page_size(PAGE)
    }

    #[test]
    fn threshold_is_inclusive() {
        let meta = FileMetadata {
            allocated_bytes: 3 * 1024 * 1024,
            live_bytes: 2 * 1024 * 1024,
        };
        assert!(FileSpaceEvaluator::classify(meta, ByteSize::mb(1)).is_eligible());
        assert_eq!(
            FileSpaceEvaluator::classify(meta, ByteSize::mb(2)),
            Eligibility::NotEligible(meta)
        );
    }

    #[test]
    fn fully_live_file_is_not_eligible() {
        let storage = storage();
        let id = storage.create_file("file:full.wt");
        storage.populate(id, 1024).expect("populate");
        assert!(matches!(
            FileSpaceEvaluator::new().evaluate(&storage, id, ByteSize::mb(1)),
            Eligibility::NotEligible(_)
        ));
    }

    #[test]
    fn fragmented_file_is_eligible() {
        let storage = storage();
        let id = storage.create_file("file:holes.wt");
        storage.populate(id, 1024).expect("populate");
        storage.delete_pages(id, 0..512).expect("delete");
        match FileSpaceEvaluator::new().evaluate(&storage, id, ByteSize::mb(1)) {
            Eligibility::Eligible(meta) => assert_eq!(meta.reclaimable_bytes(), 512 * PAGE),
            other => panic!("expected eligible, got {other:?}"),
        }
    }

    #[test]
    fn busy_and_closed_files_are_unavailable() {
        let storage = storage();
        let id = storage.create_file("file:busy.wt");
        let evaluator = FileSpaceEvaluator::new();

        let checkpoint = storage.hold(id, BusyReason::Checkpoint).expect("hold");
        assert_eq!(
            evaluator.evaluate(&storage, id, ByteSize::mb(1)),
            Eligibility::Unavailable(Unavailability::Busy(BusyReason::Checkpoint))
        );
        drop(checkpoint);

        let ddl = storage.hold(id, BusyReason::Ddl).expect("hold");
        assert_eq!(
            evaluator.evaluate(&storage, id, ByteSize::mb(1)),
            Eligibility::Unavailable(Unavailability::Busy(BusyReason::Ddl))
        );
        drop(ddl);

        storage.drop_file(id).expect("drop");
        assert_eq!(
            evaluator.evaluate(&storage, id, ByteSize::mb(1)),
            Eligibility::Unavailable(Unavailability::Closed)
        );
    }

    #[test]
    fn evaluation_is_idempotent() {
        let storage = storage();
        let id = storage.create_file("file:stable.wt");
        storage.populate(id, 600).expect("populate");
        storage.delete_pages(id, 0..300).expect("delete");
        let evaluator = FileSpaceEvaluator::new();
        let first = evaluator.evaluate(&storage, id, ByteSize::mb(1));
        let second = evaluator.evaluate(&storage, id, ByteSize::mb(1));
        assert_eq!(first, second);
        assert_eq!(storage.rewrite_calls(id), 0);
    }
}
