use anyhow::Result;
use async_trait::async_trait;

use crate::storage::SyncInventory;
use crate::types::ContentHash;

pub mod checksum_diff_detector;
pub mod size_diff_detector;

pub type DiffDetector = Box<dyn DiffDetectionStrategy + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOutcome {
    Same,
    /// The source hash is carried when it was computed on the way.
    Different { source_hash: Option<ContentHash> },
    /// A file disappeared while it was being read.
    Vanished,
}

/// Decides whether a path present on both sides has to be transferred.
#[async_trait]
pub trait DiffDetectionStrategy {
    async fn compare(
        &self,
        relative_path: &str,
        source: &dyn SyncInventory,
        target: &dyn SyncInventory,
    ) -> Result<DiffOutcome>;
}
