#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;
use walkdir::WalkDir;

use s3mirror::Config;
use s3mirror::config::args::parse_from_args;
use s3mirror::pipeline::Pipeline;
use s3mirror::storage::checksum::{generate_multipart_e_tag, md5_hex};
use s3mirror::storage::{
    GetObjectResult, ListPage, ListRequest, ListedObject, ObjectMetadata, ObjectStoreTrait,
    PendingUpload, PutOptions, UploadedPart,
};
use s3mirror::types::SyncReport;
use s3mirror::types::error::S3mirrorError;
use s3mirror::types::token::create_sync_cancellation_token;

pub const BUCKET: &str = "test-bucket";

#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub e_tag: String,
    pub last_modified: DateTime<Utc>,
    pub attributes: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MultipartSession {
    pub key: String,
    pub initiated: DateTime<Utc>,
    pub options: PutOptions,
    pub parts: BTreeMap<i32, Vec<u8>>,
}

/// How an injected failure presents itself to the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Failure {
    Transient,
    Permanent,
}

#[derive(Debug, Default)]
struct StoreState {
    objects: BTreeMap<String, StoredObject>,
    sessions: BTreeMap<String, MultipartSession>,
    put_failures: HashMap<String, Failure>,
    copy_failures: HashMap<String, Failure>,
    /// Part uploads succeed until this many have been served.
    part_upload_limit: Option<(usize, Failure)>,
    part_uploads: usize,
    puts: usize,
    copies: usize,
    deletes: usize,
    list_requests: Vec<ListRequest>,
    clock: i64,
}

/// An object store that keeps everything in memory and answers like S3 does.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn boxed(&self) -> Box<dyn ObjectStoreTrait + Send + Sync> {
        Box::new(self.clone())
    }

    pub fn insert(&self, key: &str, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let last_modified = state.tick();
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                e_tag: format!("\"{}\"", md5_hex(data)),
                last_modified,
                attributes: None,
                content_type: None,
            },
        );
    }

    /// Stores an object the way a multipart upload without an attribute blob would leave it.
    pub fn insert_multipart(&self, key: &str, data: &[u8], chunk_size: usize) {
        let digests = data.chunks(chunk_size).map(md5_hex).collect::<Vec<_>>();
        let e_tag = generate_multipart_e_tag(&digests).unwrap();

        let mut state = self.state.lock().unwrap();
        let last_modified = state.tick();
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                e_tag: format!("\"{e_tag}\""),
                last_modified,
                attributes: None,
                content_type: None,
            },
        );
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().unwrap().objects.keys().cloned().collect()
    }

    pub fn fail_put(&self, key: &str, failure: Failure) {
        self.state
            .lock()
            .unwrap()
            .put_failures
            .insert(key.to_string(), failure);
    }

    pub fn fail_copy(&self, target_key: &str, failure: Failure) {
        self.state
            .lock()
            .unwrap()
            .copy_failures
            .insert(target_key.to_string(), failure);
    }

    pub fn fail_part_uploads_after(&self, count: usize) {
        self.fail_part_uploads_with(count, Failure::Transient);
    }

    pub fn fail_part_uploads_with(&self, count: usize, failure: Failure) {
        self.state.lock().unwrap().part_upload_limit = Some((count, failure));
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.put_failures.clear();
        state.copy_failures.clear();
        state.part_upload_limit = None;
    }

    pub fn sessions(&self) -> Vec<(String, MultipartSession)> {
        self.state
            .lock()
            .unwrap()
            .sessions
            .iter()
            .map(|(upload_id, session)| (upload_id.clone(), session.clone()))
            .collect()
    }

    pub fn part_uploads(&self) -> usize {
        self.state.lock().unwrap().part_uploads
    }

    pub fn puts(&self) -> usize {
        self.state.lock().unwrap().puts
    }

    pub fn copies(&self) -> usize {
        self.state.lock().unwrap().copies
    }

    pub fn deletes(&self) -> usize {
        self.state.lock().unwrap().deletes
    }

    pub fn list_requests(&self) -> Vec<ListRequest> {
        self.state.lock().unwrap().list_requests.clone()
    }

    pub fn reset_counters(&self) {
        let mut state = self.state.lock().unwrap();
        state.part_uploads = 0;
        state.puts = 0;
        state.copies = 0;
        state.deletes = 0;
        state.list_requests.clear();
    }
}

impl StoreState {
    /// A strictly increasing timestamp, so that "most recent" is deterministic.
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += 1;
        DateTime::from_timestamp(1_700_000_000 + self.clock, 0).unwrap_or_default()
    }
}

fn injected_error(failure: Failure, operation: &str, key: &str) -> anyhow::Error {
    match failure {
        Failure::Transient => anyhow!(S3mirrorError::TransientStoreError(format!(
            "{operation} SlowDown: {key}"
        ))),
        Failure::Permanent => anyhow!(S3mirrorError::PermanentStoreError(format!(
            "{operation} AccessDenied: {key}"
        ))),
    }
}

fn no_such_upload(upload_id: &str) -> anyhow::Error {
    anyhow!(S3mirrorError::PermanentStoreError(format!(
        "NoSuchUpload: {upload_id}"
    )))
}

#[async_trait]
impl ObjectStoreTrait for InMemoryStore {
    fn bucket(&self) -> &str {
        BUCKET
    }

    async fn list_page(&self, request: &ListRequest) -> Result<ListPage> {
        let mut state = self.state.lock().unwrap();
        state.list_requests.push(request.clone());

        // key -> listed object, or None for a common prefix
        let mut entries: BTreeMap<String, Option<ListedObject>> = BTreeMap::new();
        for (key, object) in &state.objects {
            let Some(rest) = key.strip_prefix(&request.prefix) else {
                continue;
            };
            if let (Some(delimiter), Some(index)) = (&request.delimiter, rest.find('/')) {
                let common_prefix = format!("{}{}{delimiter}", request.prefix, &rest[..index]);
                entries.insert(common_prefix, None);
                continue;
            }

            entries.insert(
                key.clone(),
                Some(ListedObject {
                    key: key.clone(),
                    size: object.data.len() as u64,
                    last_modified: object.last_modified,
                    e_tag: Some(object.e_tag.clone()),
                    storage_class: Some("STANDARD".to_string()),
                }),
            );
        }

        let max_keys = request.max_keys.max(1) as usize;
        let mut remaining = entries
            .into_iter()
            .filter(|(key, _)| match &request.continuation {
                Some(marker) => key > marker,
                None => true,
            })
            .peekable();

        let mut page = ListPage::default();
        let mut last_key = None;
        for (key, object) in remaining.by_ref().take(max_keys) {
            match object {
                Some(object) => page.objects.push(object),
                None => page.common_prefixes.push(key.clone()),
            }
            last_key = Some(key);
        }
        page.is_truncated = remaining.peek().is_some();
        if page.is_truncated {
            page.next_continuation = last_key;
        }

        Ok(page)
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .objects
            .get(key)
            .map(|object| ObjectMetadata {
                size: object.data.len() as u64,
                e_tag: Some(object.e_tag.clone()),
                last_modified: Some(object.last_modified),
                attributes: object.attributes.clone(),
            }))
    }

    async fn get_object(&self, key: &str) -> Result<GetObjectResult> {
        let state = self.state.lock().unwrap();
        let Some(object) = state.objects.get(key) else {
            return Err(anyhow!(S3mirrorError::PermanentStoreError(format!(
                "NoSuchKey: {key}"
            ))));
        };

        Ok(GetObjectResult {
            reader: Box::pin(Cursor::new(object.data.clone())),
            size: object.data.len() as u64,
            e_tag: Some(object.e_tag.clone()),
            attributes: object.attributes.clone(),
        })
    }

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        options: &PutOptions,
    ) -> Result<Option<String>> {
        let mut state = self.state.lock().unwrap();
        if let Some(failure) = state.put_failures.get(key) {
            return Err(injected_error(*failure, "put_object()", key));
        }

        let e_tag = format!("\"{}\"", md5_hex(&body));
        let last_modified = state.tick();
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data: body,
                e_tag: e_tag.clone(),
                last_modified,
                attributes: options.attributes.clone(),
                content_type: options.content_type.clone(),
            },
        );
        state.puts += 1;

        Ok(Some(e_tag))
    }

    async fn copy_object(
        &self,
        source_key: &str,
        target_key: &str,
        options: &PutOptions,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(failure) = state.copy_failures.get(target_key) {
            return Err(injected_error(*failure, "copy_object()", target_key));
        }

        let Some(source) = state.objects.get(source_key).cloned() else {
            return Err(anyhow!(S3mirrorError::PermanentStoreError(format!(
                "NoSuchKey: {source_key}"
            ))));
        };

        let last_modified = state.tick();
        state.objects.insert(
            target_key.to_string(),
            StoredObject {
                last_modified,
                attributes: options.attributes.clone(),
                content_type: options.content_type.clone(),
                ..source
            },
        );
        state.copies += 1;

        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.objects.remove(key);
        state.deletes += 1;

        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str, options: &PutOptions) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let upload_id = Uuid::new_v4().to_string();
        let initiated = state.tick();

        state.sessions.insert(
            upload_id.clone(),
            MultipartSession {
                key: key.to_string(),
                initiated,
                options: options.clone(),
                parts: BTreeMap::new(),
            },
        );

        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
        _content_md5: &str,
    ) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if let Some((limit, failure)) = state.part_upload_limit {
            if limit <= state.part_uploads {
                return Err(injected_error(failure, "upload_part()", key));
            }
        }

        let e_tag = format!("\"{}\"", md5_hex(&body));
        let Some(session) = state.sessions.get_mut(upload_id) else {
            return Err(no_such_upload(upload_id));
        };
        session.parts.insert(part_number, body);
        state.part_uploads += 1;

        Ok(e_tag)
    }

    async fn list_parts(&self, _key: &str, upload_id: &str) -> Result<Vec<UploadedPart>> {
        let state = self.state.lock().unwrap();
        let Some(session) = state.sessions.get(upload_id) else {
            return Err(no_such_upload(upload_id));
        };

        Ok(session
            .parts
            .iter()
            .map(|(part_number, data)| UploadedPart {
                part_number: *part_number,
                size: data.len() as u64,
                e_tag: format!("\"{}\"", md5_hex(data)),
            })
            .collect())
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(i32, String)],
    ) -> Result<Option<String>> {
        let mut state = self.state.lock().unwrap();
        let Some(session) = state.sessions.remove(upload_id) else {
            return Err(no_such_upload(upload_id));
        };

        let mut data = Vec::new();
        let mut digests = Vec::new();
        for (part_number, _) in parts {
            let Some(part) = session.parts.get(part_number) else {
                return Err(anyhow!(S3mirrorError::PermanentStoreError(format!(
                    "InvalidPart: {part_number}"
                ))));
            };
            digests.push(md5_hex(part));
            data.extend_from_slice(part);
        }

        let e_tag = format!("\"{}\"", generate_multipart_e_tag(&digests)?);
        let last_modified = state.tick();
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data,
                e_tag: e_tag.clone(),
                last_modified,
                attributes: session.options.attributes.clone(),
                content_type: session.options.content_type.clone(),
            },
        );

        Ok(Some(e_tag))
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<()> {
        self.state.lock().unwrap().sessions.remove(upload_id);
        Ok(())
    }

    async fn list_multipart_uploads(&self, key: &str) -> Result<Vec<PendingUpload>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .sessions
            .iter()
            .filter(|(_, session)| session.key.starts_with(key))
            .map(|(upload_id, session)| PendingUpload {
                key: session.key.clone(),
                upload_id: upload_id.clone(),
                initiated: Some(session.initiated),
            })
            .collect())
    }
}

pub struct TestHelper;

impl TestHelper {
    pub fn init_dummy_tracing_subscriber() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("dummy=trace")
            .try_init();
    }

    pub fn build_config(args: Vec<&str>) -> Config {
        let mut full_args = vec!["s3mirror"];
        full_args.extend(args);

        Config::try_from(parse_from_args(full_args).unwrap()).unwrap()
    }

    pub async fn run(store: &InMemoryStore, args: Vec<&str>) -> Result<SyncReport> {
        let config = Self::build_config(args);
        let mut pipeline =
            Pipeline::with_store(config, store.boxed(), create_sync_cancellation_token());

        pipeline.run().await
    }

    pub fn write_file(root: &Path, relative_path: &str, data: &[u8]) -> PathBuf {
        let path = root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, data).unwrap();

        path
    }

    /// Relative paths of every regular file under `root`, sorted.
    pub fn list_files(root: &Path) -> Vec<String> {
        let mut files = WalkDir::new(root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| {
                entry
                    .path()
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .replace(std::path::MAIN_SEPARATOR, "/")
            })
            .collect::<Vec<_>>();
        files.sort();

        files
    }

    /// A path argument that means "the contents of this directory".
    pub fn dir_arg(dir: &Path) -> String {
        format!("{}/", dir.display())
    }

    pub fn sized_data(size: usize, seed: u8) -> Vec<u8> {
        (0..size)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }
}
