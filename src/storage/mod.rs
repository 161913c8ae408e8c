use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dyn_clone::DynClone;
use tokio::io::AsyncRead;

use crate::storage::content_index::ContentIndex;
use crate::types::{ContentHash, HashOutcome};

pub mod checksum;
pub mod content_index;
pub mod filter;
pub mod hash_cache;
pub mod local;
pub mod s3;

pub type ObjectStore = Box<dyn ObjectStoreTrait + Send + Sync>;
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Clone, PartialEq)]
pub struct ListRequest {
    pub prefix: String,
    pub delimiter: Option<String>,
    /// Continuation marker returned by the previous page.
    pub continuation: Option<String>,
    pub max_keys: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListedObject {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub e_tag: Option<String>,
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListPage {
    pub objects: Vec<ListedObject>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_continuation: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMetadata {
    pub size: u64,
    pub e_tag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    /// Free-form attribute blob carried in user metadata.
    pub attributes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PutOptions {
    pub content_md5: Option<String>,
    pub content_type: Option<String>,
    pub attributes: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub size: u64,
    pub e_tag: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpload {
    pub key: String,
    pub upload_id: String,
    pub initiated: Option<DateTime<Utc>>,
}

pub struct GetObjectResult {
    pub reader: ObjectReader,
    pub size: u64,
    pub e_tag: Option<String>,
    pub attributes: Option<String>,
}

/// The narrow slice of an object store the sync engine needs.
///
/// Keys are full keys inside the store's bucket. Implementations report
/// failures as `S3mirrorError::TransientStoreError` or `PermanentStoreError`
/// so that callers can decide whether to retry.
#[async_trait]
pub trait ObjectStoreTrait: DynClone {
    fn bucket(&self) -> &str;
    async fn list_page(&self, request: &ListRequest) -> Result<ListPage>;
    /// `None` when the object does not exist.
    async fn head_object(&self, key: &str) -> Result<Option<ObjectMetadata>>;
    async fn get_object(&self, key: &str) -> Result<GetObjectResult>;
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        options: &PutOptions,
    ) -> Result<Option<String>>;
    /// The copy takes its metadata from `options`, not from the source object.
    async fn copy_object(
        &self,
        source_key: &str,
        target_key: &str,
        options: &PutOptions,
    ) -> Result<()>;
    async fn delete_object(&self, key: &str) -> Result<()>;
    async fn create_multipart_upload(&self, key: &str, options: &PutOptions) -> Result<String>;
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
        content_md5: &str,
    ) -> Result<String>;
    async fn list_parts(&self, key: &str, upload_id: &str) -> Result<Vec<UploadedPart>>;
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(i32, String)],
    ) -> Result<Option<String>>;
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()>;
    async fn list_multipart_uploads(&self, key: &str) -> Result<Vec<PendingUpload>>;
}

/// One side of a sync, seen by the planner.
///
/// `known_hash` never touches the file system or the network; `content_hash`
/// may, and reports a vanished file as a value instead of an error.
#[async_trait]
pub trait SyncInventory: Send + Sync {
    fn keys(&self) -> Vec<String>;
    fn size(&self, relative_path: &str) -> Option<u64>;
    fn known_hash(&self, relative_path: &str) -> Option<ContentHash>;
    async fn content_hash(&self, relative_path: &str) -> Result<HashOutcome>;
    fn remove(&mut self, relative_path: &str);

    /// `content_hash` reads neither a file nor the store.
    fn hashes_are_free(&self) -> bool {
        false
    }

    /// Index of the hashes known without any I/O.
    fn known_content_index(&self) -> ContentIndex {
        let mut index = ContentIndex::new();
        for path in self.keys() {
            if let (Some(hash), Some(size)) = (self.known_hash(&path), self.size(&path)) {
                index.insert(&hash, &path, size);
            }
        }

        index
    }
}
