use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use async_channel::{Receiver, Sender};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, trace, warn};

use crate::Config;
use crate::storage::checksum::{
    ContentAttributes, is_multipart_upload_e_tag, md5_base64, md5_hex, md5_hex_from_path,
    normalize_e_tag,
};
use crate::storage::local::fs_util;
use crate::storage::s3::upload_manager::{PartRetryConfig, UploadManager};
use crate::storage::{ObjectStore, PutOptions};
use crate::types::SyncStatistics::{
    ETagVerified, SyncBytes, SyncComplete, SyncCopy, SyncDelete, SyncError, SyncWarning,
};
use crate::types::error::{
    S3mirrorError, is_cancelled_error, is_permanent_error, is_retryable_error, is_vanished_error,
};
use crate::types::token::SyncCancellationToken;
use crate::types::{ContentHash, LocalFileEntry, SyncStatistics};

const DOWNLOAD_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct UploadItem {
    pub relative_path: String,
    pub key: String,
    pub local: LocalFileEntry,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadItem {
    pub relative_path: String,
    pub key: String,
    pub path: PathBuf,
    pub size: u64,
    /// Whole-object hash known from the listing, if it is trustworthy.
    pub expected_hash: Option<ContentHash>,
    pub last_modified: DateTime<Utc>,
}

/// One unit of work derived from a `SyncPlan`.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncAction {
    Upload(UploadItem),
    Download(DownloadItem),
    /// Server-side copy; the upload is the fallback if the copy fails.
    CopyObject {
        source_key: String,
        upload: UploadItem,
    },
    /// Local copy; the download is the fallback if the copy fails.
    CopyFile {
        source_path: PathBuf,
        download: DownloadItem,
    },
    DeleteObject {
        relative_path: String,
        key: String,
    },
    DeleteFile {
        relative_path: String,
        path: PathBuf,
    },
}

impl SyncAction {
    pub fn relative_path(&self) -> &str {
        match self {
            SyncAction::Upload(item) | SyncAction::CopyObject { upload: item, .. } => {
                &item.relative_path
            }
            SyncAction::Download(item) | SyncAction::CopyFile { download: item, .. } => {
                &item.relative_path
            }
            SyncAction::DeleteObject { relative_path, .. }
            | SyncAction::DeleteFile { relative_path, .. } => relative_path,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            SyncAction::Upload(item) => {
                format!("upload: {} -> {}", item.local.absolute_path.display(), item.key)
            }
            SyncAction::Download(item) => {
                format!("download: {} -> {}", item.key, item.path.display())
            }
            SyncAction::CopyObject { source_key, upload } => {
                format!("remote copy: {} -> {}", source_key, upload.key)
            }
            SyncAction::CopyFile {
                source_path,
                download,
            } => format!(
                "local copy: {} -> {}",
                source_path.display(),
                download.path.display()
            ),
            SyncAction::DeleteObject { key, .. } => format!("delete: {key}"),
            SyncAction::DeleteFile { path, .. } => format!("delete: {}", path.display()),
        }
    }
}

pub struct ObjectSyncer {
    worker_index: u16,
    config: Config,
    store: ObjectStore,
    receiver: Receiver<SyncAction>,
    stats_sender: Sender<SyncStatistics>,
    cancellation_token: SyncCancellationToken,
}

impl ObjectSyncer {
    pub fn new(
        config: Config,
        store: ObjectStore,
        receiver: Receiver<SyncAction>,
        stats_sender: Sender<SyncStatistics>,
        cancellation_token: SyncCancellationToken,
        worker_index: u16,
    ) -> Self {
        Self {
            worker_index,
            config,
            store,
            receiver,
            stats_sender,
            cancellation_token,
        }
    }

    pub async fn sync(&self) -> Result<()> {
        trace!(worker_index = self.worker_index, "sync worker has started.");
        self.receive_and_sync().await
    }

    async fn receive_and_sync(&self) -> Result<()> {
        loop {
            tokio::select! {
                recv_result = self.receiver.recv() => {
                    match recv_result {
                        Ok(action) => {
                            if let Err(e) = self.sync_with_force_retry(action).await {
                                self.cancellation_token.cancel();
                                error!(worker_index = self.worker_index, "sync worker has been cancelled with error.");
                                return Err(e);
                            }
                        },
                        Err(_) => {
                            // normal shutdown
                            trace!(worker_index = self.worker_index, "sync worker has been completed.");
                            break;
                        }
                    }
                },
                _ = self.cancellation_token.cancelled() => {
                    info!(worker_index = self.worker_index, "sync worker has been cancelled.");
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    /// Only errors that must stop the whole run are returned.
    async fn sync_with_force_retry(&self, action: SyncAction) -> Result<()> {
        let key = action.relative_path().to_string();
        let mut interval = self.config.force_retry_config.force_retry_interval_milliseconds;

        for attempt in 0..=self.config.force_retry_config.force_retry_count {
            let result = self.sync_action(&action).await;

            if self.cancellation_token.is_cancelled() {
                info!(
                    worker_index = self.worker_index,
                    key = key,
                    "cancellation_token has been cancelled."
                );
                return Ok(());
            }

            let e = match result {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            let error = format!("{e:#}");

            if is_cancelled_error(&e) {
                return Ok(());
            }

            if is_vanished_error(&e) {
                self.send_stats(SyncWarning { key: key.clone() }).await;
                warn!(
                    worker_index = self.worker_index,
                    key = key,
                    error = error,
                    "local file vanished. skipping."
                );
                return Ok(());
            }

            if is_permanent_error(&e) {
                self.send_stats(SyncError { key: key.clone() }).await;
                error!(
                    worker_index = self.worker_index,
                    key = key,
                    error = error,
                    "permanent error has occurred."
                );
                return Err(e);
            }

            if is_retryable_error(&e) && attempt < self.config.force_retry_config.force_retry_count
            {
                self.send_stats(SyncWarning { key: key.clone() }).await;
                warn!(
                    worker_index = self.worker_index,
                    key = key,
                    error = error,
                    attempt = attempt + 1,
                    "force retryable error has occurred."
                );

                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(interval)) => {}
                    _ = self.cancellation_token.cancelled() => return Ok(()),
                }
                interval = interval.saturating_mul(2);
                continue;
            }

            self.send_stats(SyncError { key: key.clone() }).await;
            error!(
                worker_index = self.worker_index,
                key = key,
                action = action.describe(),
                error = error,
                "sync failed."
            );
            return Ok(());
        }

        Ok(())
    }

    async fn sync_action(&self, action: &SyncAction) -> Result<()> {
        match action {
            SyncAction::Upload(item) => self.upload(item).await,
            SyncAction::Download(item) => self.download(item).await,
            SyncAction::CopyObject { source_key, upload } => {
                self.copy_object(source_key, upload).await
            }
            SyncAction::CopyFile {
                source_path,
                download,
            } => self.copy_file(source_path, download).await,
            SyncAction::DeleteObject { relative_path, key } => {
                self.store
                    .delete_object(key)
                    .await
                    .with_context(|| format!("failed to delete object: {key}"))?;

                info!(key = key, "object deleted.");
                self.send_stats(SyncDelete {
                    key: relative_path.clone(),
                })
                .await;
                Ok(())
            }
            SyncAction::DeleteFile {
                relative_path,
                path,
            } => {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    if e.kind() != ErrorKind::NotFound {
                        return Err(anyhow!(e)
                            .context(format!("failed to delete file: {}", path.display())));
                    }
                }

                let path = path.to_string_lossy().to_string();
                info!(path = path, "file deleted.");
                self.send_stats(SyncDelete {
                    key: relative_path.clone(),
                })
                .await;
                Ok(())
            }
        }
    }

    async fn upload(&self, item: &UploadItem) -> Result<()> {
        let metadata = match tokio::fs::metadata(&item.local.absolute_path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(anyhow!(S3mirrorError::LocalFileVanished {
                    path: item.local.absolute_path.to_string_lossy().to_string(),
                }));
            }
            Err(e) => return Err(anyhow!(e)),
        };

        let size = metadata.len();
        if self.config.transfer_config.is_multipart_upload_required(size) {
            self.multipart_upload(item, size).await?;
        } else {
            self.single_part_upload(item).await?;
        }

        self.send_stats(SyncBytes(size)).await;
        self.send_stats(SyncComplete {
            key: item.relative_path.clone(),
        })
        .await;

        Ok(())
    }

    async fn single_part_upload(&self, item: &UploadItem) -> Result<()> {
        let body = tokio::fs::read(&item.local.absolute_path)
            .await
            .map_err(|e| self.local_read_error(e, &item.local))?;

        let md5_digest = md5_hex(&body);
        let options = self.build_put_options(item, &md5_digest, Some(md5_base64(&body)));
        let size = body.len();

        let e_tag = self
            .store
            .put_object(&item.key, body, &options)
            .await
            .with_context(|| format!("failed to put object: {}", item.key))?;

        self.verify_e_tag(&item.key, &md5_digest, &e_tag).await?;

        info!(
            key = item.key,
            size = size,
            "object uploaded."
        );

        Ok(())
    }

    async fn multipart_upload(&self, item: &UploadItem, size: u64) -> Result<()> {
        let md5_digest = match &item.local.content_hash {
            Some(hash) => hash.clone(),
            None => md5_hex_from_path(&item.local.absolute_path)
                .await
                .map_err(|e| self.local_read_error(e, &item.local))?,
        };
        let options = self.build_put_options(item, &md5_digest, None);

        let mut upload_manager = UploadManager::new(
            dyn_clone::clone_box(&*self.store),
            &item.key,
            item.local.absolute_path.clone(),
            size,
            self.config.transfer_config.multipart_chunksize,
            options,
            PartRetryConfig {
                max_retries: self.config.force_retry_config.force_retry_count,
                initial_backoff_milliseconds: self
                    .config
                    .force_retry_config
                    .force_retry_interval_milliseconds,
            },
            self.cancellation_token.clone(),
        )?
        .abort_on_failure(self.config.abort_failed_uploads)
        .resume_existing_uploads(self.config.resume_existing_uploads);

        let outcome = upload_manager.upload(self.config.upload_id.clone()).await?;

        info!(
            key = item.key,
            size = size,
            upload_id = outcome.upload_id,
            uploaded_parts = outcome.uploaded_parts,
            reused_parts = outcome.reused_parts,
            "object uploaded."
        );

        Ok(())
    }

    fn build_put_options(
        &self,
        item: &UploadItem,
        md5_digest: &str,
        content_md5: Option<String>,
    ) -> PutOptions {
        let content_type = if self.config.no_guess_mime_type {
            None
        } else {
            mime_guess::from_path(&item.local.absolute_path)
                .first()
                .map(|mime| mime.to_string())
        };

        let attributes = ContentAttributes {
            md5: Some(md5_digest.to_string()),
            size: Some(item.local.size),
            mtime: Some(item.local.mtime_secs()),
            uid: Some(item.local.owner_uid),
            gid: Some(item.local.owner_gid),
        };

        PutOptions {
            content_md5,
            content_type,
            attributes: Some(attributes.encode()),
        }
    }

    async fn verify_e_tag(&self, key: &str, md5_digest: &str, e_tag: &Option<String>) -> Result<()> {
        if e_tag.is_none() || is_multipart_upload_e_tag(e_tag) {
            debug!(key = key, "e_tag can not be verified.");
            return Ok(());
        }

        let actual = normalize_e_tag(e_tag).unwrap_or_default();
        if actual != md5_digest {
            return Err(anyhow!(S3mirrorError::ChecksumMismatch {
                key: key.to_string(),
                expected: md5_digest.to_string(),
                actual,
            }));
        }

        trace!(key = key, e_tag = actual, "e_tag verified.");
        self.send_stats(ETagVerified {
            key: key.to_string(),
        })
        .await;

        Ok(())
    }

    async fn download(&self, item: &DownloadItem) -> Result<()> {
        if fs_util::check_directory_traversal(&item.relative_path) {
            return Err(anyhow!(S3mirrorError::DirectoryTraversalError)
                .context(format!("key: {}", item.key)));
        }

        let object = self
            .store
            .get_object(&item.key)
            .await
            .with_context(|| format!("failed to get object: {}", item.key))?;
        let attributes = object.attributes.as_deref().map(ContentAttributes::parse);

        let temp_file = fs_util::create_temp_file_beside(&item.path).await?;
        let mut file = tokio::fs::File::from_std(
            temp_file
                .as_file()
                .try_clone()
                .context("failed to open the temporary file.")?,
        );

        let mut reader = object.reader;
        let mut context = md5::Context::new();
        let mut buffer = vec![0u8; DOWNLOAD_BUFFER_SIZE];
        let mut written: u64 = 0;
        loop {
            if self.cancellation_token.is_cancelled() {
                return Err(anyhow!(S3mirrorError::Cancelled));
            }

            let read = reader
                .read(&mut buffer)
                .await
                .map_err(|e| anyhow!(S3mirrorError::TransientStoreError(e.to_string())))?;
            if read == 0 {
                break;
            }

            context.consume(&buffer[..read]);
            file.write_all(&buffer[..read])
                .await
                .context("failed to write the temporary file.")?;
            written += read as u64;
        }
        file.flush().await?;
        drop(file);

        if written != object.size {
            return Err(anyhow!(S3mirrorError::TransientStoreError(format!(
                "object size mismatch. key: {}, expected: {}, actual: {written}",
                item.key, object.size
            ))));
        }

        let digest: md5::Digest = context.into();
        let actual = format!("{digest:x}");
        let expected = item
            .expected_hash
            .clone()
            .or_else(|| attributes.as_ref().and_then(|attributes| attributes.md5.clone()))
            .or_else(|| {
                (!is_multipart_upload_e_tag(&object.e_tag))
                    .then(|| normalize_e_tag(&object.e_tag))
                    .flatten()
            });
        match expected {
            Some(expected) if expected != actual => {
                return Err(anyhow!(S3mirrorError::ChecksumMismatch {
                    key: item.key.clone(),
                    expected,
                    actual,
                }));
            }
            Some(_) => {
                self.send_stats(ETagVerified {
                    key: item.key.clone(),
                })
                .await;
            }
            None => debug!(key = item.key, "checksum can not be verified."),
        }

        temp_file
            .persist(&item.path)
            .with_context(|| format!("failed to persist: {}", item.path.display()))?;

        let mtime = attributes
            .and_then(|attributes| attributes.mtime)
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or(item.last_modified);
        fs_util::set_last_modified(&item.path, &mtime)
            .with_context(|| format!("failed to set mtime: {}", item.path.display()))?;

        let path = item.path.to_string_lossy().to_string();
        info!(key = item.key, path = path, size = written, "object downloaded.");

        self.send_stats(SyncBytes(written)).await;
        self.send_stats(SyncComplete {
            key: item.relative_path.clone(),
        })
        .await;

        Ok(())
    }

    async fn copy_object(&self, source_key: &str, upload: &UploadItem) -> Result<()> {
        let md5_digest = match &upload.local.content_hash {
            Some(hash) => hash.clone(),
            None => md5_hex_from_path(&upload.local.absolute_path)
                .await
                .map_err(|e| self.local_read_error(e, &upload.local))?,
        };
        let options = self.build_put_options(upload, &md5_digest, None);

        match self
            .store
            .copy_object(source_key, &upload.key, &options)
            .await
        {
            Ok(()) => {
                info!(
                    source_key = source_key,
                    key = upload.key,
                    "object copied from existing content."
                );
                self.send_stats(SyncCopy {
                    key: upload.relative_path.clone(),
                })
                .await;
                Ok(())
            }
            Err(e) if is_cancelled_error(&e) => Err(e),
            Err(e) => {
                let error = format!("{e:#}");
                warn!(
                    source_key = source_key,
                    key = upload.key,
                    error = error,
                    "copy failed. falling back to upload."
                );
                self.upload(upload).await
            }
        }
    }

    async fn copy_file(&self, source_path: &Path, download: &DownloadItem) -> Result<()> {
        match self.copy_local_file(source_path, download).await {
            Ok(()) => {
                let path = download.path.to_string_lossy().to_string();
                info!(path = path, "file copied from existing content.");
                self.send_stats(SyncCopy {
                    key: download.relative_path.clone(),
                })
                .await;
                Ok(())
            }
            Err(e) => {
                let error = format!("{e:#}");
                warn!(
                    key = download.key,
                    error = error,
                    "copy failed. falling back to download."
                );
                self.download(download).await
            }
        }
    }

    async fn copy_local_file(&self, source_path: &Path, download: &DownloadItem) -> Result<()> {
        if fs_util::check_directory_traversal(&download.relative_path) {
            return Err(anyhow!(S3mirrorError::DirectoryTraversalError));
        }

        let temp_file = fs_util::create_temp_file_beside(&download.path).await?;
        tokio::fs::copy(source_path, temp_file.path())
            .await
            .with_context(|| format!("failed to copy: {}", source_path.display()))?;

        let actual = md5_hex_from_path(temp_file.path()).await?;
        if let Some(expected) = &download.expected_hash {
            if *expected != actual {
                return Err(anyhow!(S3mirrorError::ChecksumMismatch {
                    key: download.key.clone(),
                    expected: expected.clone(),
                    actual,
                }));
            }
        }

        temp_file
            .persist(&download.path)
            .with_context(|| format!("failed to persist: {}", download.path.display()))?;
        fs_util::set_last_modified(&download.path, &download.last_modified)?;

        Ok(())
    }

    fn local_read_error(&self, e: std::io::Error, local: &LocalFileEntry) -> anyhow::Error {
        if e.kind() == ErrorKind::NotFound {
            return anyhow!(S3mirrorError::LocalFileVanished {
                path: local.absolute_path.to_string_lossy().to_string(),
            });
        }

        anyhow!(e).context(format!(
            "failed to read: {}",
            local.absolute_path.display()
        ))
    }

    async fn send_stats(&self, stats: SyncStatistics) {
        let _ = self.stats_sender.send(stats).await;
    }
}
