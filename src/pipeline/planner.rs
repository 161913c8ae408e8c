use std::collections::BTreeSet;

use anyhow::{Result, anyhow};
use tracing::{debug, info, trace, warn};

use crate::pipeline::diff_detector::checksum_diff_detector::ChecksumDiffDetector;
use crate::pipeline::diff_detector::size_diff_detector::SizeDiffDetector;
use crate::pipeline::diff_detector::{DiffDetector, DiffOutcome};
use crate::storage::SyncInventory;
use crate::types::error::S3mirrorError;
use crate::types::token::SyncCancellationToken;
use crate::types::{ContentHash, HashOutcome, SyncDirection, SyncPlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanOptions {
    pub skip_existing: bool,
    pub check_checksum: bool,
    /// Substitute target-side copies for transfers of content the target already holds.
    pub dedup: bool,
    pub delete_removed: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            skip_existing: false,
            check_checksum: true,
            dedup: true,
            delete_removed: false,
        }
    }
}

pub struct SyncPlanner {
    options: PlanOptions,
    diff_detector: DiffDetector,
    cancellation_token: SyncCancellationToken,
}

impl SyncPlanner {
    pub fn new(options: PlanOptions, cancellation_token: SyncCancellationToken) -> Self {
        let diff_detector = if options.check_checksum {
            ChecksumDiffDetector::boxed_new()
        } else {
            SizeDiffDetector::boxed_new()
        };

        Self {
            options,
            diff_detector,
            cancellation_token,
        }
    }

    /// The local side is the source of an upload and the target of a download.
    pub async fn plan(
        &self,
        local: &mut dyn SyncInventory,
        remote: &mut dyn SyncInventory,
        direction: SyncDirection,
    ) -> Result<SyncPlan> {
        match direction {
            SyncDirection::Upload => self.plan_roles(local, remote).await,
            SyncDirection::Download => self.plan_roles(remote, local).await,
        }
    }

    /// Entries that vanish while being hashed are removed from both inventories.
    pub async fn plan_roles(
        &self,
        source: &mut dyn SyncInventory,
        target: &mut dyn SyncInventory,
    ) -> Result<SyncPlan> {
        let target_keys: BTreeSet<String> = target.keys().into_iter().collect();
        let mut pending: Vec<(String, Option<ContentHash>)> = Vec::new();

        for path in source.keys() {
            self.check_cancelled()?;

            if !target_keys.contains(&path) {
                pending.push((path, None));
                continue;
            }

            if self.options.skip_existing {
                debug!(key = path, "skip existing object.");
                continue;
            }

            match self.diff_detector.compare(&path, &*source, &*target).await? {
                DiffOutcome::Same => {
                    trace!(key = path, "object is up to date.");
                }
                DiffOutcome::Different { source_hash } => {
                    pending.push((path, source_hash));
                }
                DiffOutcome::Vanished => {
                    warn!(key = path, "file disappeared while comparing. skipped.");
                    source.remove(&path);
                    target.remove(&path);
                }
            }
        }

        // Built after the comparisons so that hashes computed on the way are indexed.
        // Paths about to be overwritten can not serve as copy sources.
        let mut target_index = target.known_content_index();
        for (path, _) in &pending {
            target_index.remove_path(path);
        }
        debug!(
            indexed_hashes = target_index.len(),
            "target content index built."
        );

        let mut plan = SyncPlan::default();
        for (path, source_hash) in pending {
            self.check_cancelled()?;

            let source_hash = if self.is_dedup_enabled() && source_hash.is_none() {
                match source.content_hash(&path).await? {
                    HashOutcome::Trusted(hash) => Some(hash),
                    HashOutcome::Untrusted => None,
                    HashOutcome::Vanished => {
                        warn!(key = path, "file disappeared while hashing. skipped.");
                        source.remove(&path);
                        target.remove(&path);
                        continue;
                    }
                }
            } else {
                source_hash
            };

            if let Some(hash) = source_hash.as_deref().filter(|_| self.is_dedup_enabled()) {
                let size = source.size(&path).unwrap_or_default();
                let existing = target_index
                    .first_path(hash)
                    .filter(|existing| *existing != path)
                    .map(str::to_string);

                // later paths with the same content may chain off this one
                target_index.insert(hash, &path, size);

                if let Some(existing) = existing {
                    debug!(key = path, source_key = existing, "content found in target.");
                    plan.to_copy.insert(path, existing);
                    continue;
                }
            }

            plan.to_transfer.insert(path);
        }

        if self.options.delete_removed {
            let source_keys: BTreeSet<String> = source.keys().into_iter().collect();
            for path in target.keys() {
                if !source_keys.contains(&path) && !plan.contains(&path) {
                    plan.to_delete.insert(path);
                }
            }
        }

        info!(
            transfer = plan.to_transfer.len(),
            copy = plan.to_copy.len(),
            delete = plan.to_delete.len(),
            "sync plan created."
        );

        Ok(plan)
    }

    fn is_dedup_enabled(&self) -> bool {
        self.options.dedup && self.options.check_checksum
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancellation_token.is_cancelled() {
            trace!("planning cancelled.");
            return Err(anyhow!(S3mirrorError::Cancelled));
        }

        Ok(())
    }
}
