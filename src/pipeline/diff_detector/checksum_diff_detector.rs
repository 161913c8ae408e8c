use async_trait::async_trait;
use tracing::{debug, info};

use crate::pipeline::diff_detector::{DiffDetectionStrategy, DiffDetector, DiffOutcome};
use crate::storage::SyncInventory;
use crate::types::{ContentHash, HashOutcome};

/// Size first, then content hash.
///
/// A size mismatch is conclusive. When either side only has a composite
/// multipart hash, equal sizes are taken as equal content.
pub struct ChecksumDiffDetector;

const FILTER_NAME: &str = "ChecksumDiffDetector";
#[async_trait]
impl DiffDetectionStrategy for ChecksumDiffDetector {
    async fn compare(
        &self,
        relative_path: &str,
        source: &dyn SyncInventory,
        target: &dyn SyncInventory,
    ) -> anyhow::Result<DiffOutcome> {
        if source.size(relative_path) != target.size(relative_path) {
            return Ok(DiffOutcome::Different { source_hash: None });
        }

        // the side that can be hashed without I/O goes first, it may settle the comparison
        let (source_hash, target_hash) = if source.hashes_are_free() && !target.hashes_are_free()
        {
            let source_hash = match side_hash(source, relative_path, "source").await? {
                Ok(hash) => hash,
                Err(outcome) => return Ok(outcome),
            };
            let target_hash = match side_hash(target, relative_path, "target").await? {
                Ok(hash) => hash,
                Err(outcome) => return Ok(outcome),
            };
            (source_hash, target_hash)
        } else {
            let target_hash = match side_hash(target, relative_path, "target").await? {
                Ok(hash) => hash,
                Err(outcome) => return Ok(outcome),
            };
            let source_hash = match side_hash(source, relative_path, "source").await? {
                Ok(hash) => hash,
                Err(outcome) => return Ok(outcome),
            };
            (source_hash, target_hash)
        };

        if source_hash != target_hash {
            debug!(
                name = FILTER_NAME,
                key = relative_path,
                source_checksum = source_hash,
                target_checksum = target_hash,
                "checksum mismatch."
            );
            return Ok(DiffOutcome::Different {
                source_hash: Some(source_hash),
            });
        }

        debug!(
            name = FILTER_NAME,
            key = relative_path,
            checksum = source_hash,
            "object filtered."
        );

        Ok(DiffOutcome::Same)
    }
}

impl ChecksumDiffDetector {
    pub fn boxed_new() -> DiffDetector {
        Box::new(ChecksumDiffDetector {})
    }
}

/// The hash of one side, or the outcome it already decides.
async fn side_hash(
    inventory: &dyn SyncInventory,
    relative_path: &str,
    side: &str,
) -> anyhow::Result<Result<ContentHash, DiffOutcome>> {
    Ok(match inventory.content_hash(relative_path).await? {
        HashOutcome::Trusted(hash) => Ok(hash),
        HashOutcome::Untrusted => {
            info!(
                name = FILTER_NAME,
                key = relative_path,
                side = side,
                "checksum is a composite value. compared by size only."
            );
            Err(DiffOutcome::Same)
        }
        HashOutcome::Vanished => Err(DiffOutcome::Vanished),
    })
}
