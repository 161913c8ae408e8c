use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tracing::{debug, trace, warn};
use walkdir::{DirEntry, WalkDir};

use crate::storage::SyncInventory;
use crate::storage::checksum::ContentHasher;
use crate::storage::filter::PathFilter;
use crate::storage::hash_cache::HashCache;
use crate::types::error::S3mirrorError;
use crate::types::token::SyncCancellationToken;
use crate::types::{ContentHash, HashOutcome, InventoryEntry, LocalFileEntry};

pub mod fs_util;

pub struct LocalInventoryBuilder {
    pub roots: Vec<PathBuf>,
    pub recursive: bool,
    pub follow_symlinks: bool,
    pub filter: PathFilter,
    /// Relative paths to read instead of walking the (single) root.
    pub files_from: Option<Vec<String>>,
    pub cancellation_token: SyncCancellationToken,
}

impl LocalInventoryBuilder {
    pub fn new(roots: Vec<PathBuf>, cancellation_token: SyncCancellationToken) -> Self {
        Self {
            roots,
            recursive: true,
            follow_symlinks: false,
            filter: PathFilter::default(),
            files_from: None,
            cancellation_token,
        }
    }

    /// Collects every regular file below the roots.
    ///
    /// Cached hashes are attached to the entries, and each confirmed entry is
    /// unmarked in the cache so that it survives the end-of-run purge.
    pub fn build(
        &self,
        hash_cache: Arc<Mutex<HashCache>>,
        hasher: ContentHasher,
    ) -> Result<LocalInventory> {
        let mut single_file = false;
        let mut entries = Vec::new();

        if let Some(files_from) = &self.files_from {
            let root = match self.roots.as_slice() {
                [root] => root,
                _ => {
                    return Err(anyhow!(S3mirrorError::InvalidConfiguration(
                        "--files-from requires exactly one local root.".to_string()
                    )));
                }
            };
            for relative_path in files_from {
                self.check_cancelled()?;

                let relative_path = relative_path.trim().trim_start_matches("./");
                if relative_path.is_empty() || self.filter.is_excluded_with_parents(relative_path) {
                    continue;
                }
                entries.push(read_entry(
                    &fs_util::relative_path_to_file_path(root, relative_path),
                    relative_path,
                    self.follow_symlinks,
                ));
            }
        } else {
            for root in &self.roots {
                let metadata = std::fs::metadata(root)
                    .with_context(|| format!("failed to access local path: {}", root.display()))?;

                if !metadata.is_dir() {
                    single_file = self.roots.len() == 1;

                    let file_name = root
                        .file_name()
                        .map(|name| name.to_string_lossy().to_string())
                        .ok_or_else(|| anyhow!("invalid file path: {}", root.display()))?;
                    entries.push(read_entry(root, &file_name, true));
                    continue;
                }

                entries.append(&mut self.walk(root)?);
            }
        }

        let mut files = BTreeMap::new();
        let mut vanished = Vec::new();
        {
            let mut cache = hash_cache
                .lock()
                .map_err(|_| anyhow!("hash cache lock poisoned."))?;

            for entry in entries {
                match entry {
                    InventoryEntry::Present(mut file) => {
                        let mtime = file.mtime_secs();
                        file.content_hash =
                            cache.lookup(file.device_id, file.inode, mtime, file.size);
                        cache.unmark(file.device_id, file.inode, mtime, file.size);

                        if let Some(duplicate) = files.insert(file.relative_path.clone(), file) {
                            let path = duplicate.relative_path;
                            warn!(path = path, "duplicate relative path. the last one wins.");
                        }
                    }
                    InventoryEntry::Vanished {
                        relative_path,
                        reason,
                    } => {
                        warn!(path = relative_path, reason = reason, "local file vanished.");
                        vanished.push(relative_path);
                    }
                }
            }
        }

        debug!(
            files = files.len(),
            vanished = vanished.len(),
            single_file = single_file,
            "local inventory built."
        );

        Ok(LocalInventory {
            files,
            single_file,
            vanished,
            hash_cache,
            hasher,
            computed_hashes: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn walk(&self, root: &Path) -> Result<Vec<InventoryEntry>> {
        let prefix = root_prefix(root);
        let max_depth = if self.recursive { usize::MAX } else { 1 };

        let mut entries = Vec::new();
        let walker = WalkDir::new(root)
            .follow_links(self.follow_symlinks)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !self.is_pruned(root, &prefix, entry));

        for entry in walker {
            self.check_cancelled()?;

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e
                        .path()
                        .unwrap_or_else(|| Path::new(""))
                        .to_string_lossy()
                        .to_string();

                    if let Some(ancestor) = e.loop_ancestor() {
                        let ancestor = ancestor.to_string_lossy().to_string();
                        warn!(
                            path = path,
                            ancestor = ancestor,
                            "symbolic link loop detected. skipped."
                        );
                        continue;
                    }
                    if let Some(inner) = e.io_error() {
                        if inner.kind() == io::ErrorKind::NotFound {
                            debug!(path = path, "file vanished while listing.");
                            continue;
                        }
                    }

                    let error = e.to_string();
                    warn!(path = path, error = error, "failed to list local files.");
                    continue;
                }
            };

            if entry.file_type().is_dir() {
                continue;
            }
            if entry.path_is_symlink() && !self.follow_symlinks {
                let path = entry.path().to_string_lossy().to_string();
                debug!(path = path, "skip symbolic link.");
                continue;
            }

            let Some(relative_path) = relative_path_of(root, &prefix, entry.path()) else {
                continue;
            };
            if self.filter.is_excluded(&relative_path) {
                continue;
            }

            entries.push(read_entry(
                entry.path(),
                &relative_path,
                self.follow_symlinks,
            ));
        }

        Ok(entries)
    }

    fn is_pruned(&self, root: &Path, prefix: &str, entry: &DirEntry) -> bool {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return false;
        }

        match relative_path_of(root, prefix, entry.path()) {
            Some(relative_dir) => {
                let pruned = self.filter.is_excluded_dir(&relative_dir);
                if pruned {
                    trace!(path = relative_dir, "directory pruned.");
                }
                pruned
            }
            None => false,
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancellation_token.is_cancelled() {
            trace!("local inventory build cancelled.");
            return Err(anyhow!(S3mirrorError::Cancelled));
        }

        Ok(())
    }
}

/// A root given with a trailing separator contributes its contents;
/// otherwise its own name becomes the first path component.
fn root_prefix(root: &Path) -> String {
    let root_str = root.to_string_lossy();
    if root_str.ends_with('/') || root_str.ends_with(std::path::MAIN_SEPARATOR) {
        return "".to_string();
    }

    match root.file_name() {
        Some(name) => format!("{}/", name.to_string_lossy()),
        None => "".to_string(),
    }
}

fn relative_path_of(root: &Path, prefix: &str, path: &Path) -> Option<String> {
    let relative = fs_util::to_relative_path(path, root)?;
    if relative.is_empty() {
        return None;
    }

    Some(format!("{prefix}{relative}"))
}

fn read_entry(path: &Path, relative_path: &str, follow_symlinks: bool) -> InventoryEntry {
    let metadata = if follow_symlinks {
        std::fs::metadata(path)
    } else {
        std::fs::symlink_metadata(path)
    };

    let metadata = match metadata {
        Ok(metadata) => metadata,
        Err(e) => {
            return InventoryEntry::Vanished {
                relative_path: relative_path.to_string(),
                reason: e.to_string(),
            };
        }
    };
    if !metadata.is_file() {
        return InventoryEntry::Vanished {
            relative_path: relative_path.to_string(),
            reason: "not a regular file".to_string(),
        };
    }

    let mtime = match fs_util::get_last_modified(&metadata) {
        Ok(mtime) => mtime,
        Err(e) => {
            return InventoryEntry::Vanished {
                relative_path: relative_path.to_string(),
                reason: e.to_string(),
            };
        }
    };
    let ownership = fs_util::get_ownership(&metadata);

    InventoryEntry::Present(LocalFileEntry {
        relative_path: relative_path.to_string(),
        absolute_path: std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf()),
        size: metadata.len(),
        mtime,
        device_id: ownership.device_id,
        inode: ownership.inode,
        owner_uid: ownership.uid,
        owner_gid: ownership.gid,
        content_hash: None,
    })
}

/// Local side of a sync. Hashes are computed lazily and shared between hard links.
pub struct LocalInventory {
    files: BTreeMap<String, LocalFileEntry>,
    single_file: bool,
    vanished: Vec<String>,
    hash_cache: Arc<Mutex<HashCache>>,
    hasher: ContentHasher,
    /// Hashes of files without a stable identity, which the cache never holds.
    computed_hashes: Arc<Mutex<HashMap<String, ContentHash>>>,
}

impl LocalInventory {
    pub fn get(&self, relative_path: &str) -> Option<&LocalFileEntry> {
        self.files.get(relative_path)
    }

    pub fn files(&self) -> impl Iterator<Item = &LocalFileEntry> {
        self.files.values()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn is_single_file(&self) -> bool {
        self.single_file
    }

    pub fn vanished(&self) -> &[String] {
        &self.vanished
    }

    /// An inventory for a local target directory that does not exist yet.
    pub fn empty(hash_cache: Arc<Mutex<HashCache>>, hasher: ContentHasher) -> Self {
        Self {
            files: BTreeMap::new(),
            single_file: false,
            vanished: Vec::new(),
            hash_cache,
            hasher,
            computed_hashes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Gives an entry another relative path, e.g. to name a single file differently on the other side.
    pub fn rename(&mut self, from: &str, to: &str) {
        if let Some(mut file) = self.files.remove(from) {
            file.relative_path = to.to_string();
            self.files.insert(to.to_string(), file);
        }
    }

    pub fn retain(&mut self, mut f: impl FnMut(&str) -> bool) {
        self.files.retain(|relative_path, _| f(relative_path));
    }

    fn lookup_hash(&self, file: &LocalFileEntry) -> Option<ContentHash> {
        if let Some(hash) = &file.content_hash {
            return Some(hash.clone());
        }

        if let Some(hash) = self
            .hash_cache
            .lock()
            .ok()?
            .lookup(file.device_id, file.inode, file.mtime_secs(), file.size)
        {
            return Some(hash);
        }

        self.computed_hashes
            .lock()
            .ok()?
            .get(&file.relative_path)
            .cloned()
    }

    fn record_hash(&self, file: &LocalFileEntry, hash: &ContentHash) -> Result<()> {
        if file.identity().is_known() {
            self.hash_cache
                .lock()
                .map_err(|_| anyhow!("hash cache lock poisoned."))?
                .store(
                    file.device_id,
                    file.inode,
                    file.mtime_secs(),
                    file.size,
                    hash.clone(),
                );
        } else {
            self.computed_hashes
                .lock()
                .map_err(|_| anyhow!("hash lock poisoned."))?
                .insert(file.relative_path.clone(), hash.clone());
        }

        Ok(())
    }
}

#[async_trait]
impl SyncInventory for LocalInventory {
    fn keys(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    fn size(&self, relative_path: &str) -> Option<u64> {
        self.files.get(relative_path).map(|file| file.size)
    }

    fn known_hash(&self, relative_path: &str) -> Option<ContentHash> {
        self.lookup_hash(self.files.get(relative_path)?)
    }

    async fn content_hash(&self, relative_path: &str) -> Result<HashOutcome> {
        let Some(file) = self.files.get(relative_path) else {
            return Ok(HashOutcome::Vanished);
        };

        if let Some(hash) = self.lookup_hash(file) {
            return Ok(HashOutcome::Trusted(hash));
        }

        match self.hasher.hash_file(&file.absolute_path).await {
            Ok(hash) => {
                let path = file.absolute_path.to_string_lossy().to_string();
                trace!(path = path, hash = hash, "content hash computed.");

                self.record_hash(file, &hash)?;
                Ok(HashOutcome::Trusted(hash))
            }
            Err(e) => {
                let path = file.absolute_path.to_string_lossy().to_string();
                let error = e.to_string();
                warn!(
                    path = path,
                    error = error,
                    "failed to read local file. it may have been removed."
                );

                Ok(HashOutcome::Vanished)
            }
        }
    }

    fn remove(&mut self, relative_path: &str) {
        if self.files.remove(relative_path).is_some() {
            self.vanished.push(relative_path.to_string());
        }
    }
}
