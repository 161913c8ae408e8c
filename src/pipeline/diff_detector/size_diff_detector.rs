use async_trait::async_trait;
use tracing::debug;

use crate::pipeline::diff_detector::{DiffDetectionStrategy, DiffDetector, DiffOutcome};
use crate::storage::SyncInventory;

pub struct SizeDiffDetector;

const FILTER_NAME: &str = "SizeDiffDetector";
#[async_trait]
impl DiffDetectionStrategy for SizeDiffDetector {
    async fn compare(
        &self,
        relative_path: &str,
        source: &dyn SyncInventory,
        target: &dyn SyncInventory,
    ) -> anyhow::Result<DiffOutcome> {
        let source_size = source.size(relative_path);
        if source_size != target.size(relative_path) {
            return Ok(DiffOutcome::Different { source_hash: None });
        }

        debug!(
            name = FILTER_NAME,
            size = source_size,
            key = relative_path,
            "object filtered."
        );

        Ok(DiffOutcome::Same)
    }
}

impl SizeDiffDetector {
    pub fn boxed_new() -> DiffDetector {
        Box::new(SizeDiffDetector {})
    }
}
