use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fmt::{Debug, Formatter};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use zeroize_derive::{Zeroize, ZeroizeOnDrop};

use crate::storage::checksum::{is_multipart_upload_e_tag, normalize_e_tag};

pub mod error;
pub mod token;

pub const CONTENT_ATTRIBUTES_METADATA_KEY: &str = "s3mirror-attrs";

/// Lowercase hex MD5 digest of a whole payload.
pub type ContentHash = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileIdentity {
    pub device_id: u64,
    pub inode: u64,
}

impl FileIdentity {
    /// inode 0 is reported on platforms without stable file identities.
    pub fn is_known(&self) -> bool {
        self.inode != 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalFileEntry {
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub device_id: u64,
    pub inode: u64,
    pub owner_uid: u32,
    pub owner_gid: u32,
    pub content_hash: Option<ContentHash>,
}

impl LocalFileEntry {
    pub fn identity(&self) -> FileIdentity {
        FileIdentity {
            device_id: self.device_id,
            inode: self.inode,
        }
    }

    pub fn mtime_secs(&self) -> i64 {
        self.mtime.timestamp()
    }
}

/// Result of reading one local entry. A file that existed when its directory was
/// listed may be gone by the time it is stat-ed or hashed.
#[derive(Debug, Clone, PartialEq)]
pub enum InventoryEntry {
    Present(LocalFileEntry),
    Vanished {
        relative_path: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObjectEntry {
    pub relative_key: String,
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub e_tag: Option<String>,
    pub storage_class: Option<String>,
    /// Whole-object hash carried in the attribute blob, survives multipart uploads.
    pub attributes_hash: Option<ContentHash>,
}

impl RemoteObjectEntry {
    pub fn has_composite_e_tag(&self) -> bool {
        is_multipart_upload_e_tag(&self.e_tag)
    }

    /// The hash usable for equality comparison, if any.
    pub fn comparable_hash(&self) -> Option<ContentHash> {
        if let Some(attributes_hash) = &self.attributes_hash {
            return Some(attributes_hash.clone());
        }

        if self.has_composite_e_tag() {
            return None;
        }

        normalize_e_tag(&self.e_tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashOutcome {
    Trusted(ContentHash),
    /// The recorded hash cannot be compared, e.g. a composite multipart ETag.
    Untrusted,
    Vanished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPlan {
    pub to_transfer: BTreeSet<String>,
    pub to_delete: BTreeSet<String>,
    /// new relative path -> existing destination relative path
    pub to_copy: BTreeMap<String, String>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.to_transfer.is_empty() && self.to_delete.is_empty() && self.to_copy.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.to_transfer.contains(path)
            || self.to_delete.contains(path)
            || self.to_copy.contains_key(path)
    }

    /// `(existing_key, new_relative_path)` pairs.
    pub fn copy_pairs(&self) -> Vec<(String, String)> {
        self.to_copy
            .iter()
            .map(|(new_path, existing)| (existing.clone(), new_path.clone()))
            .collect()
    }
}

#[derive(Debug, PartialEq)]
pub enum SyncStatistics {
    SyncBytes(u64),
    SyncComplete { key: String },
    SyncCopy { key: String },
    SyncDelete { key: String },
    SyncSkip { key: String },
    SyncError { key: String },
    SyncWarning { key: String },
    ETagVerified { key: String },
}

/// Totals of one run, folded from `SyncStatistics`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub transferred: u64,
    pub transferred_bytes: u64,
    pub copied: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub failed: u64,
    pub warnings: u64,
    pub e_tag_verified: u64,
    /// Actions that a dry run would have executed.
    pub planned: u64,
    pub dry_run: bool,
}

impl SyncReport {
    pub fn add(&mut self, stats: &SyncStatistics) {
        match stats {
            SyncStatistics::SyncBytes(size) => self.transferred_bytes += size,
            SyncStatistics::SyncComplete { .. } => self.transferred += 1,
            SyncStatistics::SyncCopy { .. } => self.copied += 1,
            SyncStatistics::SyncDelete { .. } => self.deleted += 1,
            SyncStatistics::SyncSkip { .. } => self.skipped += 1,
            SyncStatistics::SyncError { .. } => self.failed += 1,
            SyncStatistics::SyncWarning { .. } => self.warnings += 1,
            SyncStatistics::ETagVerified { .. } => self.e_tag_verified += 1,
        }
    }

    pub fn has_failures(&self) -> bool {
        0 < self.failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoragePath {
    S3 { bucket: String, prefix: String },
    Local(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ClientConfigLocation {
    pub aws_config_file: Option<PathBuf>,
    pub aws_shared_credentials_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum S3Credentials {
    Profile(String),
    Credentials { access_keys: AccessKeys },
    FromEnvironment,
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AccessKeys {
    pub access_key: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl Debug for AccessKeys {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut keys = f.debug_struct("AccessKeys");
        let session_token = self
            .session_token
            .as_ref()
            .map_or("None", |_| "** redacted **");
        keys.field("access_key", &self.access_key)
            .field("secret_access_key", &"** redacted **")
            .field("session_token", &session_token);
        keys.finish()
    }
}
