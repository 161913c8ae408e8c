use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};

use crate::Config;
use crate::storage::ObjectStore;
use crate::storage::s3::S3ObjectStore;
use crate::types::StoragePath;
use crate::types::error::S3mirrorError;

pub async fn create_object_store(config: &Config) -> Result<ObjectStore> {
    let bucket = remote_bucket(config)?;
    let client_config = config.client_config.as_ref().ok_or_else(|| {
        anyhow!(S3mirrorError::InvalidConfiguration(
            "client configuration is missing.".to_string()
        ))
    })?;

    Ok(S3ObjectStore::boxed_new(&bucket, client_config).await)
}

pub fn remote_bucket(config: &Config) -> Result<String> {
    remote_path(config).map(|(bucket, _)| bucket)
}

/// `(bucket, prefix)` of the remote side.
pub fn remote_path(config: &Config) -> Result<(String, String)> {
    config
        .sources
        .iter()
        .chain(std::iter::once(&config.target))
        .find_map(|path| match path {
            StoragePath::S3 { bucket, prefix } => Some((bucket.clone(), prefix.clone())),
            StoragePath::Local(_) => None,
        })
        .ok_or_else(|| {
            anyhow!(S3mirrorError::InvalidConfiguration(
                "either SOURCE or TARGET must be s3://bucket[/prefix].".to_string()
            ))
        })
}

pub fn local_sources(config: &Config) -> Vec<PathBuf> {
    config
        .sources
        .iter()
        .filter_map(|path| match path {
            StoragePath::Local(path) => Some(path.clone()),
            StoragePath::S3 { .. } => None,
        })
        .collect()
}

/// Directory that receives downloads, and the file name when a single object is
/// saved under another name.
pub fn resolve_local_target(target: &Path, single_object: bool) -> (PathBuf, Option<String>) {
    if !single_object || target.is_dir() || ends_with_separator(target) {
        return (target.to_path_buf(), None);
    }

    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().to_string());
    let mut directory = target
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    if directory.as_os_str().is_empty() {
        directory = ".".into();
    }

    (directory, file_name)
}

/// With a trailing separator the directory contributes its contents, not its name.
pub fn with_trailing_separator(path: &Path) -> PathBuf {
    if ends_with_separator(path) {
        return path.to_path_buf();
    }

    (path.to_string_lossy().to_string() + std::path::MAIN_SEPARATOR_STR).into()
}

fn ends_with_separator(path: &Path) -> bool {
    let path = path.to_string_lossy();
    path.ends_with('/') || path.ends_with(std::path::MAIN_SEPARATOR_STR)
}
