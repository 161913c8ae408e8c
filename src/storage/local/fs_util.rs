use std::fs::Metadata;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use filetime::{FileTime, set_file_mtime};
use regex::Regex;
use tempfile::NamedTempFile;
use tracing::trace;

pub struct FileOwnership {
    pub device_id: u64,
    pub inode: u64,
    pub uid: u32,
    pub gid: u32,
}

pub fn check_directory_traversal(key: &str) -> bool {
    let re = Regex::new(r"(^|[/\\])\.\.([/\\]|$)").unwrap();
    re.is_match(key)
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub fn get_ownership(metadata: &Metadata) -> FileOwnership {
            use std::os::unix::fs::MetadataExt;

            FileOwnership {
                device_id: metadata.dev(),
                inode: metadata.ino(),
                uid: metadata.uid(),
                gid: metadata.gid(),
            }
        }
    } else {
        pub fn get_ownership(_metadata: &Metadata) -> FileOwnership {
            FileOwnership {
                device_id: 0,
                inode: 0,
                uid: 0,
                gid: 0,
            }
        }
    }
}

pub fn get_last_modified(metadata: &Metadata) -> std::io::Result<DateTime<Utc>> {
    Ok(DateTime::<Utc>::from(metadata.modified()?))
}

pub fn set_last_modified(path: &Path, mtime: &DateTime<Utc>) -> std::io::Result<()> {
    set_file_mtime(
        path,
        FileTime::from_unix_time(mtime.timestamp(), mtime.timestamp_subsec_nanos()),
    )
}

/// The temporary file lives beside `path` so that persisting it is a rename.
pub async fn create_temp_file_beside(path: &Path) -> Result<NamedTempFile> {
    let directory = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    if !directory.try_exists().unwrap_or(false) {
        tokio::fs::create_dir_all(directory)
            .await
            .context("tokio::fs::create_dir_all() failed.")?;

        let directory = directory.to_string_lossy().to_string();
        trace!(directory = directory, "directory created.");
    }

    NamedTempFile::new_in(directory).context("NamedTempFile::new_in failed.")
}

pub fn relative_path_to_file_path(root: &Path, relative_path: &str) -> PathBuf {
    relative_path
        .trim_start_matches('/')
        .split('/')
        .filter(|component| !component.is_empty())
        .fold(root.to_path_buf(), |path, component| path.join(component))
}

/// `/`-separated path of `path` below `root`.
pub fn to_relative_path(path: &Path, root: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let components = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>();

    Some(convert_windows_directory_char_to_slash(&components.join("/")))
}

pub fn convert_windows_directory_char_to_slash(path: &str) -> String {
    path.replace('\\', "/")
}
