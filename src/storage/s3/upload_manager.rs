use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, trace, warn};

use crate::config::{MAXIMUM_CHUNKSIZE, MAXIMUM_OBJECT_SIZE, MAXIMUM_PARTS, MINIMUM_CHUNKSIZE};
use crate::storage::checksum::{
    generate_multipart_e_tag, is_multipart_upload_e_tag, md5_base64, md5_hex, normalize_e_tag,
};
use crate::storage::{ObjectStore, PutOptions};
use crate::types::error::{
    S3mirrorError, is_cancelled_error, is_retryable_error, is_vanished_error,
};
use crate::types::token::SyncCancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Initiated,
    UploadingParts,
    Completing,
    Done,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartRecord {
    pub e_tag: String,
    pub size: u64,
}

/// The store is the source of truth for which parts exist; this is refreshed from it on resume.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadSession {
    pub upload_id: String,
    pub parts: BTreeMap<i32, PartRecord>,
    pub chunk_size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct PartRetryConfig {
    pub max_retries: u32,
    pub initial_backoff_milliseconds: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadOutcome {
    pub upload_id: String,
    pub e_tag: Option<String>,
    pub uploaded_parts: usize,
    pub reused_parts: usize,
}

pub struct UploadManager {
    store: ObjectStore,
    key: String,
    path: PathBuf,
    file_size: u64,
    chunk_size: u64,
    options: PutOptions,
    retry_config: PartRetryConfig,
    abort_on_failure: bool,
    resume_existing_uploads: bool,
    cancellation_token: SyncCancellationToken,
    state: UploadState,
    session: Option<UploadSession>,
    part_md5_digests: BTreeMap<i32, String>,
    uploaded_parts: usize,
    reused_parts: usize,
}

/// Number of parts for `file_size`, or a configuration error if the store would reject it.
pub fn validate_chunking(file_size: u64, chunk_size: u64) -> Result<u64> {
    if !(MINIMUM_CHUNKSIZE..=MAXIMUM_CHUNKSIZE).contains(&chunk_size) {
        return Err(anyhow!(S3mirrorError::InvalidConfiguration(format!(
            "multipart chunk size must be between {MINIMUM_CHUNKSIZE} and {MAXIMUM_CHUNKSIZE} bytes: {chunk_size}"
        ))));
    }
    if MAXIMUM_OBJECT_SIZE < file_size {
        return Err(anyhow!(S3mirrorError::InvalidConfiguration(format!(
            "object size exceeds {MAXIMUM_OBJECT_SIZE} bytes: {file_size}"
        ))));
    }

    let parts = file_size.div_ceil(chunk_size).max(1);
    if MAXIMUM_PARTS < parts {
        return Err(anyhow!(S3mirrorError::InvalidConfiguration(format!(
            "{parts} parts exceed the limit of {MAXIMUM_PARTS}. increase --multipart-chunk-size."
        ))));
    }

    Ok(parts)
}

impl UploadManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: ObjectStore,
        key: &str,
        path: PathBuf,
        file_size: u64,
        chunk_size: u64,
        options: PutOptions,
        retry_config: PartRetryConfig,
        cancellation_token: SyncCancellationToken,
    ) -> Result<Self> {
        validate_chunking(file_size, chunk_size)?;

        Ok(UploadManager {
            store,
            key: key.to_string(),
            path,
            file_size,
            chunk_size,
            options,
            retry_config,
            abort_on_failure: false,
            resume_existing_uploads: false,
            cancellation_token,
            state: UploadState::Initiated,
            session: None,
            part_md5_digests: BTreeMap::new(),
            uploaded_parts: 0,
            reused_parts: 0,
        })
    }

    /// Release the session in the store when the upload fails.
    pub fn abort_on_failure(mut self, abort_on_failure: bool) -> Self {
        self.abort_on_failure = abort_on_failure;
        self
    }

    /// Re-attach to an in-progress session for the same key if no upload id is supplied.
    pub fn resume_existing_uploads(mut self, resume_existing_uploads: bool) -> Self {
        self.resume_existing_uploads = resume_existing_uploads;
        self
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn session(&self) -> Option<&UploadSession> {
        self.session.as_ref()
    }

    pub async fn upload(&mut self, upload_id: Option<String>) -> Result<UploadOutcome> {
        let mut upload_id = upload_id;
        let mut e_tag = None;

        loop {
            trace!(key = self.key, state = ?self.state, "upload state.");

            match self.state {
                UploadState::Initiated => {
                    self.initiate(upload_id.take()).await?;
                    self.state = UploadState::UploadingParts;
                }
                UploadState::UploadingParts => {
                    if let Err(e) = self.upload_parts().await {
                        return Err(self.fail(e).await);
                    }
                    self.state = UploadState::Completing;
                }
                UploadState::Completing => match self.complete().await {
                    Ok(completed_e_tag) => {
                        e_tag = completed_e_tag;
                        self.state = UploadState::Done;
                    }
                    Err(e) => return Err(self.fail(e).await),
                },
                UploadState::Done => {
                    return Ok(UploadOutcome {
                        upload_id: self.upload_id().to_string(),
                        e_tag,
                        uploaded_parts: self.uploaded_parts,
                        reused_parts: self.reused_parts,
                    });
                }
                UploadState::Aborted => {
                    return Err(anyhow!(S3mirrorError::UploadAborted {
                        key: self.key.clone(),
                        upload_id: self.upload_id().to_string(),
                    }));
                }
            }
        }
    }

    fn upload_id(&self) -> &str {
        self.session
            .as_ref()
            .map(|session| session.upload_id.as_str())
            .unwrap_or_default()
    }

    async fn initiate(&mut self, upload_id: Option<String>) -> Result<()> {
        let upload_id = match upload_id {
            Some(upload_id) => Some(upload_id),
            None if self.resume_existing_uploads => self.find_existing_upload().await?,
            None => None,
        };

        let session = match upload_id {
            Some(upload_id) => {
                let parts = self
                    .store
                    .list_parts(&self.key, &upload_id)
                    .await
                    .with_context(|| format!("failed to list parts. upload_id: {upload_id}"))?;

                info!(
                    key = self.key,
                    upload_id = upload_id,
                    existing_parts = parts.len(),
                    "resuming multipart upload."
                );

                UploadSession {
                    upload_id,
                    parts: parts
                        .into_iter()
                        .map(|part| {
                            (
                                part.part_number,
                                PartRecord {
                                    e_tag: part.e_tag,
                                    size: part.size,
                                },
                            )
                        })
                        .collect(),
                    chunk_size: self.chunk_size,
                }
            }
            None => {
                let upload_id = self
                    .store
                    .create_multipart_upload(&self.key, &self.options)
                    .await
                    .context("failed to create multipart upload.")?;

                debug!(key = self.key, upload_id = upload_id, "multipart upload created.");

                UploadSession {
                    upload_id,
                    parts: BTreeMap::new(),
                    chunk_size: self.chunk_size,
                }
            }
        };

        self.session = Some(session);
        Ok(())
    }

    async fn find_existing_upload(&self) -> Result<Option<String>> {
        let uploads = self
            .store
            .list_multipart_uploads(&self.key)
            .await
            .context("failed to list multipart uploads.")?;

        Ok(uploads
            .into_iter()
            .filter(|upload| upload.key == self.key)
            .max_by_key(|upload| upload.initiated)
            .map(|upload| upload.upload_id))
    }

    async fn upload_parts(&mut self) -> Result<()> {
        let mut file = File::open(&self.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                anyhow!(S3mirrorError::LocalFileVanished {
                    path: self.path.to_string_lossy().to_string(),
                })
            } else {
                anyhow!(e).context(format!("failed to open: {}", self.path.display()))
            }
        })?;

        let parts = validate_chunking(self.file_size, self.chunk_size)?;
        let mut remaining_bytes = self.file_size;

        for part_number in 1..=parts as i32 {
            if self.cancellation_token.is_cancelled() {
                return Err(anyhow!(S3mirrorError::Cancelled));
            }

            let chunk_size = remaining_bytes.min(self.chunk_size);
            let mut buffer = vec![0u8; chunk_size as usize];
            file.read_exact(&mut buffer)
                .await
                .with_context(|| format!("failed to read part {part_number}."))?;
            remaining_bytes -= chunk_size;

            let md5_digest = md5_hex(&buffer);
            self.part_md5_digests.insert(part_number, md5_digest.clone());

            if self.is_part_reusable(part_number, chunk_size, &md5_digest) {
                trace!(key = self.key, part_number = part_number, "part already uploaded.");
                self.reused_parts += 1;
                continue;
            }

            let e_tag = self
                .upload_part_with_retry(part_number, buffer, &md5_digest)
                .await?;
            self.uploaded_parts += 1;

            if let Some(session) = self.session.as_mut() {
                session.parts.insert(
                    part_number,
                    PartRecord {
                        e_tag,
                        size: chunk_size,
                    },
                );
            }
        }

        if let Some(session) = self.session.as_mut() {
            // parts beyond the current chunking belong to a different file version
            session.parts.retain(|part_number, _| *part_number <= parts as i32);
        }

        Ok(())
    }

    fn is_part_reusable(&self, part_number: i32, chunk_size: u64, md5_digest: &str) -> bool {
        let Some(part) = self
            .session
            .as_ref()
            .and_then(|session| session.parts.get(&part_number))
        else {
            return false;
        };

        if part.size != chunk_size {
            return false;
        }

        let remote_digest = normalize_e_tag(&Some(part.e_tag.clone()));
        if remote_digest.as_deref() != Some(md5_digest) {
            debug!(
                key = self.key,
                part_number = part_number,
                remote_e_tag = part.e_tag,
                local_md5 = md5_digest,
                "uploaded part differs from local content. re-uploading."
            );
            return false;
        }

        true
    }

    async fn upload_part_with_retry(
        &self,
        part_number: i32,
        buffer: Vec<u8>,
        md5_digest: &str,
    ) -> Result<String> {
        let upload_id = self.upload_id().to_string();
        let content_md5 = md5_base64(&buffer);

        self.with_retry(&format!("upload_part({part_number})"), || {
            let buffer = buffer.clone();
            let upload_id = upload_id.clone();
            let content_md5 = content_md5.clone();
            async move {
                let e_tag = self
                    .store
                    .upload_part(&self.key, &upload_id, part_number, buffer, &content_md5)
                    .await?;

                let returned_digest = normalize_e_tag(&Some(e_tag.clone())).unwrap_or_default();
                if returned_digest != md5_digest {
                    return Err(anyhow!(S3mirrorError::ChecksumMismatch {
                        key: format!("{} (part {part_number})", self.key),
                        expected: md5_digest.to_string(),
                        actual: returned_digest,
                    }));
                }

                Ok(e_tag)
            }
        })
        .await
    }

    async fn complete(&mut self) -> Result<Option<String>> {
        let upload_id = self.upload_id().to_string();
        let parts = self
            .session
            .as_ref()
            .map(|session| {
                session
                    .parts
                    .iter()
                    .map(|(part_number, part)| (*part_number, part.e_tag.clone()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let this: &Self = self;
        let e_tag = this
            .with_retry("complete_multipart_upload()", || {
                let upload_id = upload_id.clone();
                let parts = parts.clone();
                async move {
                    this.store
                        .complete_multipart_upload(&this.key, &upload_id, &parts)
                        .await
                }
            })
            .await?;

        self.verify_completed_e_tag(&e_tag);

        info!(
            key = self.key,
            upload_id = upload_id,
            uploaded_parts = self.uploaded_parts,
            reused_parts = self.reused_parts,
            "multipart upload completed."
        );

        Ok(e_tag)
    }

    fn verify_completed_e_tag(&self, e_tag: &Option<String>) {
        if !is_multipart_upload_e_tag(e_tag) {
            return;
        }

        let digests = self.part_md5_digests.values().cloned().collect::<Vec<_>>();
        let Ok(expected) = generate_multipart_e_tag(&digests) else {
            return;
        };
        let actual = normalize_e_tag(e_tag).unwrap_or_default();

        if actual != expected {
            warn!(
                key = self.key,
                expected_e_tag = expected,
                actual_e_tag = actual,
                "multipart e_tag mismatch. object in the store may be corrupted."
            );
        } else {
            trace!(key = self.key, e_tag = actual, "multipart e_tag verified.");
        }
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut backoff = Duration::from_millis(self.retry_config.initial_backoff_milliseconds);
        let mut attempt = 0;

        loop {
            let result = tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    return Err(anyhow!(S3mirrorError::Cancelled));
                }
                result = f() => result,
            };

            let e = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !is_retryable_error(&e) || self.retry_config.max_retries <= attempt {
                return Err(e);
            }
            attempt += 1;

            let error = format!("{e:#}");
            warn!(
                key = self.key,
                operation = operation,
                attempt = attempt,
                error = error,
                "retrying after a transient failure."
            );

            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    return Err(anyhow!(S3mirrorError::Cancelled));
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff *= 2;
        }
    }

    async fn fail(&mut self, e: anyhow::Error) -> anyhow::Error {
        if is_cancelled_error(&e) {
            warn!(
                key = self.key,
                upload_id = self.upload_id(),
                "multipart upload cancelled. the upload can be resumed with --upload-id."
            );
            return e;
        }

        let upload_id = self.upload_id().to_string();
        let error = format!("{e:#}");
        error!(
            key = self.key,
            upload_id = upload_id,
            state = ?self.state,
            error = error,
            "multipart upload failed."
        );
        self.state = UploadState::Aborted;

        if self.abort_on_failure && !upload_id.is_empty() {
            if let Err(abort_error) = self.store.abort_multipart_upload(&self.key, &upload_id).await
            {
                let abort_error = format!("{abort_error:#}");
                warn!(
                    key = self.key,
                    upload_id = upload_id,
                    error = abort_error,
                    "failed to abort multipart upload."
                );
            }
        }

        if is_vanished_error(&e) {
            return e;
        }

        e.context(S3mirrorError::UploadAborted {
            key: self.key.clone(),
            upload_id,
        })
    }
}
