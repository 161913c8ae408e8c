use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::ContentHash;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashCacheEntry {
    pub hash: ContentHash,
    pub size: u64,
    #[serde(skip)]
    purge: bool,
}

type MtimeMap = BTreeMap<i64, HashCacheEntry>;
type InodeMap = BTreeMap<u64, MtimeMap>;

/// Persistent `device -> inode -> mtime -> {hash, size}` map.
///
/// Loaded once before the local scan and saved once after it. Entries that were not
/// confirmed during the scan are dropped by [`HashCache::purge`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashCache {
    devices: BTreeMap<u64, InodeMap>,
}

impl HashCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A missing file is an empty cache.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = path.display().to_string(), "hash cache not found.");
                return Ok(Self::new());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read hash cache: {}", path.display()));
            }
        };

        let cache: HashCache = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse hash cache: {}", path.display()))?;

        info!(
            path = path.display().to_string(),
            entries = cache.len(),
            "hash cache loaded."
        );

        Ok(cache)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string(self).context("failed to serialize hash cache.")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create directory: {}", parent.display())
                })?;
            }
        }

        let mut temp_file = tempfile::NamedTempFile::new_in(
            path.parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new(".")),
        )
        .context("failed to create temporary hash cache file.")?;
        std::io::Write::write_all(&mut temp_file, content.as_bytes())
            .context("failed to write hash cache.")?;
        temp_file
            .persist(path)
            .with_context(|| format!("failed to persist hash cache: {}", path.display()))?;

        info!(
            path = path.display().to_string(),
            entries = self.len(),
            "hash cache saved."
        );

        Ok(())
    }

    pub fn lookup(&self, device_id: u64, inode: u64, mtime: i64, size: u64) -> Option<ContentHash> {
        self.devices
            .get(&device_id)?
            .get(&inode)?
            .get(&mtime)
            .filter(|entry| entry.size == size)
            .map(|entry| entry.hash.clone())
    }

    /// inode 0 means the platform has no stable identity; such files are never cached.
    pub fn store(&mut self, device_id: u64, inode: u64, mtime: i64, size: u64, hash: ContentHash) {
        if inode == 0 {
            return;
        }

        self.devices
            .entry(device_id)
            .or_default()
            .entry(inode)
            .or_default()
            .insert(
                mtime,
                HashCacheEntry {
                    hash,
                    size,
                    purge: false,
                },
            );
    }

    pub fn mark_all_for_purge(&mut self) {
        self.entries_mut().for_each(|entry| entry.purge = true);
    }

    /// Keeps the entry only if it still describes the live file.
    pub fn unmark(&mut self, device_id: u64, inode: u64, mtime: i64, size: u64) {
        if let Some(entry) = self
            .devices
            .get_mut(&device_id)
            .and_then(|inodes| inodes.get_mut(&inode))
            .and_then(|mtimes| mtimes.get_mut(&mtime))
        {
            if entry.size == size {
                entry.purge = false;
            }
        }
    }

    /// Returns the number of discarded entries.
    pub fn purge(&mut self) -> usize {
        let before = self.len();

        for inodes in self.devices.values_mut() {
            for mtimes in inodes.values_mut() {
                mtimes.retain(|_, entry| !entry.purge);
            }
            inodes.retain(|_, mtimes| !mtimes.is_empty());
        }
        self.devices.retain(|_, inodes| !inodes.is_empty());

        let purged = before - self.len();
        debug!(purged = purged, "hash cache purged.");

        purged
    }

    pub fn len(&self) -> usize {
        self.devices
            .values()
            .flat_map(|inodes| inodes.values())
            .map(|mtimes| mtimes.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries_mut(&mut self) -> impl Iterator<Item = &mut HashCacheEntry> {
        self.devices
            .values_mut()
            .flat_map(|inodes| inodes.values_mut())
            .flat_map(|mtimes| mtimes.values_mut())
    }
}
