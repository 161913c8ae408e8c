use std::path::PathBuf;

use anyhow::Result;

use crate::storage::filter::PathFilter;
use crate::types::{ClientConfigLocation, S3Credentials, StoragePath, SyncDirection};

pub mod args;

pub const MINIMUM_CHUNKSIZE: u64 = 5 * 1024 * 1024;
pub const MAXIMUM_CHUNKSIZE: u64 = 5 * 1024 * 1024 * 1024;
pub const MAXIMUM_PARTS: u64 = 10_000;
pub const MAXIMUM_OBJECT_SIZE: u64 = 5 * 1024 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// Several local roots may be given for an upload.
    pub sources: Vec<StoragePath>,
    pub target: StoragePath,
    pub client_config: Option<ClientConfig>,
    pub force_retry_config: ForceRetryConfig,
    pub tracing_config: Option<TracingConfig>,
    pub transfer_config: TransferConfig,
    pub filter_config: FilterConfig,
    pub worker_size: u16,
    pub recursive: bool,
    pub follow_symlinks: bool,
    pub check_checksum: bool,
    pub skip_existing: bool,
    pub delete_removed: bool,
    pub dedup: bool,
    pub hash_cache_file: Option<PathBuf>,
    pub files_from: Option<PathBuf>,
    pub upload_id: Option<String>,
    pub resume_existing_uploads: bool,
    pub abort_failed_uploads: bool,
    pub no_guess_mime_type: bool,
    pub dry_run: bool,
    pub max_keys: i32,
    pub auto_complete_shell: Option<clap_complete::shells::Shell>,
}

impl Config {
    pub fn direction(&self) -> SyncDirection {
        match self.target {
            StoragePath::S3 { .. } => SyncDirection::Upload,
            StoragePath::Local(_) => SyncDirection::Download,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_config_location: ClientConfigLocation,
    pub credential: S3Credentials,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
    pub retry_config: RetryConfig,
    pub cli_timeout_config: CLITimeoutConfig,
    pub disable_stalled_stream_protection: bool,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub aws_max_attempts: u32,
    pub initial_backoff_milliseconds: u64,
}

#[derive(Debug, Clone)]
pub struct CLITimeoutConfig {
    pub operation_timeout_milliseconds: Option<u64>,
    pub operation_attempt_timeout_milliseconds: Option<u64>,
    pub connect_timeout_milliseconds: Option<u64>,
    pub read_timeout_milliseconds: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct TracingConfig {
    pub tracing_level: log::Level,
    pub json_tracing: bool,
    pub aws_sdk_tracing: bool,
    pub span_events_tracing: bool,
    pub disable_color_tracing: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ForceRetryConfig {
    pub force_retry_count: u32,
    pub force_retry_interval_milliseconds: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub multipart_threshold: u64,
    pub multipart_chunksize: u64,
}

impl TransferConfig {
    pub fn is_multipart_upload_required(&self, content_length: u64) -> bool {
        self.multipart_threshold <= content_length
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilterConfig {
    pub exclude: Vec<String>,
    pub include: Vec<String>,
    pub exclude_regex: Vec<String>,
    pub include_regex: Vec<String>,
}

impl FilterConfig {
    pub fn build_path_filter(&self) -> Result<PathFilter> {
        PathFilter::new(
            &self.exclude,
            &self.include,
            &self.exclude_regex,
            &self.include_regex,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_multipart_upload_necessary() {
        init_dummy_tracing_subscriber();

        let transfer_config = TransferConfig {
            multipart_threshold: 8 * 1024 * 1024,
            multipart_chunksize: 8 * 1024 * 1024,
        };

        assert!(transfer_config.is_multipart_upload_required(8 * 1024 * 1024));
        assert!(transfer_config.is_multipart_upload_required((8 * 1024 * 1024) + 1));
        assert!(!transfer_config.is_multipart_upload_required((8 * 1024 * 1024) - 1));
    }

    #[test]
    fn build_path_filter() {
        init_dummy_tracing_subscriber();

        let filter_config = FilterConfig {
            exclude: vec!["*.tmp".to_string()],
            include: vec!["keep/*".to_string()],
            exclude_regex: vec![],
            include_regex: vec![],
        };
        let filter = filter_config.build_path_filter().unwrap();

        assert!(filter.is_excluded("a.tmp"));
        assert!(!filter.is_excluded("keep/a.tmp"));

        let filter_config = FilterConfig {
            exclude_regex: vec!["[".to_string()],
            ..Default::default()
        };
        assert!(filter_config.build_path_filter().is_err());
    }

    fn init_dummy_tracing_subscriber() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("dummy=trace")
            .try_init();
    }
}
