use crate::config::args::value_parser::{file_exist, human_bytes, storage_path, url};
use crate::config::{
    CLITimeoutConfig, ClientConfig, FilterConfig, ForceRetryConfig, RetryConfig, TracingConfig,
    TransferConfig,
};
use crate::types::{AccessKeys, ClientConfigLocation, S3Credentials, StoragePath};
use crate::Config;
use clap::builder::NonEmptyStringValueParser;
use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
#[cfg(feature = "version")]
use shadow_rs::shadow;
use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;

mod value_parser;

const DEFAULT_WORKER_SIZE: u16 = 16;
const DEFAULT_AWS_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_FORCE_RETRY_COUNT: u32 = 5;
const DEFAULT_FORCE_RETRY_INTERVAL_MILLISECONDS: u64 = 1000;
const DEFAULT_INITIAL_BACKOFF_MILLISECONDS: u64 = 100;
const DEFAULT_MULTIPART_THRESHOLD: &str = "8MiB";
const DEFAULT_MULTIPART_CHUNK_SIZE: &str = "8MiB";
const DEFAULT_MAX_KEYS: i32 = 1000;
const DEFAULT_NO_RECURSIVE: bool = false;
const DEFAULT_FOLLOW_SYMLINKS: bool = false;
const DEFAULT_SIZE_ONLY: bool = false;
const DEFAULT_SKIP_EXISTING: bool = false;
const DEFAULT_DELETE_REMOVED: bool = false;
const DEFAULT_NO_DEDUP: bool = false;
const DEFAULT_RESUME_EXISTING_UPLOADS: bool = false;
const DEFAULT_ABORT_FAILED_UPLOADS: bool = false;
const DEFAULT_NO_GUESS_MIME_TYPE: bool = false;
const DEFAULT_DRY_RUN: bool = false;
const DEFAULT_FORCE_PATH_STYLE: bool = false;
const DEFAULT_DISABLE_STALLED_STREAM_PROTECTION: bool = false;
const DEFAULT_JSON_TRACING: bool = false;
const DEFAULT_AWS_SDK_TRACING: bool = false;
const DEFAULT_SPAN_EVENTS_TRACING: bool = false;
const DEFAULT_DISABLE_COLOR_TRACING: bool = false;

const NO_S3_STORAGE_SPECIFIED: &str = "either SOURCE or TARGET must be s3://\n";
const BOTH_S3_STORAGE_SPECIFIED: &str = "s3:// to s3:// sync is not supported\n";
const MIXED_SOURCE_STORAGE_SPECIFIED: &str =
    "with an s3:// TARGET, every SOURCE must be a local path\n";
const MULTIPLE_S3_SOURCE_SPECIFIED: &str = "with a local TARGET, exactly one s3:// SOURCE is allowed\n";
const SOURCE_LOCAL_STORAGE_NOT_FOUND: &str = "source local path not found: ";
const TARGET_LOCAL_STORAGE_INVALID: &str = "invalid target local path\n";
const UPLOAD_ID_REQUIRES_SINGLE_UPLOAD: &str =
    "with --upload-id, TARGET must be s3:// and exactly one SOURCE file must be given\n";
const FILES_FROM_REQUIRES_LOCAL_SOURCE: &str =
    "with --files-from, SOURCE must be a local directory\n";
const MULTIPART_CHUNK_SIZE_OVER_THRESHOLD: &str =
    "--multipart-chunk-size must be smaller than or equal to --multipart-threshold\n";

#[cfg(feature = "version")]
shadow!(build);

#[derive(Parser, Clone, Debug)]
#[cfg_attr(feature = "version", command(version=format!("{} ({} {}), {}", build::PKG_VERSION, build::SHORT_COMMIT, build::BUILD_TARGET, build::RUST_VERSION)))]
#[command(
    about = "One-way sync between local directories and an S3 bucket",
    long_about = "One-way sync between local directories and an S3 bucket.\n\
    Upload when TARGET is s3://, download when SOURCE is s3://.\n\
    Files are compared by size and MD5 checksum, and identical content already present in the target is copied instead of transferred."
)]
pub struct CLIArgs {
    /// SOURCE... TARGET. s3://<BUCKET_NAME>[/prefix] or local path.
    /// several local SOURCE paths may be given for an upload. a local directory ending in '/' contributes its contents, otherwise its name.
    #[arg(
        value_name = "PATHS",
        num_args = 2..,
        value_parser = storage_path::check_storage_path,
        required_unless_present = "auto_complete_shell"
    )]
    paths: Vec<String>,

    /// A simulation mode. no actions will be performed
    #[arg(long, env, default_value_t = DEFAULT_DRY_RUN, help_heading = "General")]
    dry_run: bool,

    /// do not descend into subdirectories (or sub-prefixes)
    #[arg(long, env, default_value_t = DEFAULT_NO_RECURSIVE, help_heading = "General")]
    no_recursive: bool,

    /// follow symbolic links in local directories
    #[arg(long, env, default_value_t = DEFAULT_FOLLOW_SYMLINKS, help_heading = "General")]
    follow_symlinks: bool,

    /// read newline-separated relative paths under the SOURCE directory instead of walking it
    #[arg(long, env, value_name = "FILE", value_parser = file_exist::is_file_exist, help_heading = "General")]
    files_from: Option<String>,

    /// location of the local hash cache. MD5 checksums of unchanged local files are reused across runs.
    #[arg(long, env, value_name = "FILE", help_heading = "General")]
    hash_cache_file: Option<PathBuf>,

    /// location of the file that the AWS CLI uses to store configuration profiles
    #[arg(long, env, value_name = "FILE", help_heading = "AWS Configuration")]
    aws_config_file: Option<PathBuf>,

    /// location of the file that the AWS CLI uses to store access keys
    #[arg(long, env, value_name = "FILE", help_heading = "AWS Configuration")]
    aws_shared_credentials_file: Option<PathBuf>,

    /// AWS CLI profile
    #[arg(long, env, conflicts_with_all = ["access_key", "secret_access_key", "session_token"], help_heading = "AWS Configuration")]
    profile: Option<String>,

    /// access key
    #[arg(long, env, conflicts_with_all = ["profile"], requires = "secret_access_key", help_heading = "AWS Configuration")]
    access_key: Option<String>,

    /// secret access key
    #[arg(long, env, conflicts_with_all = ["profile"], requires = "access_key", help_heading = "AWS Configuration")]
    secret_access_key: Option<String>,

    /// session token
    #[arg(long, env, conflicts_with_all = ["profile"], requires = "access_key", help_heading = "AWS Configuration")]
    session_token: Option<String>,

    /// region of the bucket
    #[arg(long, env, value_parser = NonEmptyStringValueParser::new(), help_heading = "AWS Configuration")]
    region: Option<String>,

    /// endpoint url of S3-compatible storage
    #[arg(long, env, value_parser = url::check_scheme, help_heading = "AWS Configuration")]
    endpoint_url: Option<String>,

    /// force path-style addressing
    #[arg(long, env, default_value_t = DEFAULT_FORCE_PATH_STYLE, help_heading = "AWS Configuration")]
    force_path_style: bool,

    /// exclude paths that match the given glob pattern. can be repeated.
    #[arg(long, env, value_delimiter = ',', help_heading = "Filtering")]
    exclude: Vec<String>,

    /// include paths that match the given glob pattern even when excluded. can be repeated.
    #[arg(long, env, value_delimiter = ',', help_heading = "Filtering")]
    include: Vec<String>,

    /// exclude paths that match the given regular expression. can be repeated.
    #[arg(long, env, value_parser = crate::config::args::value_parser::regex::parse_regex, help_heading = "Filtering")]
    rexclude: Vec<String>,

    /// include paths that match the given regular expression even when excluded. can be repeated.
    #[arg(long, env, value_parser = crate::config::args::value_parser::regex::parse_regex, help_heading = "Filtering")]
    rinclude: Vec<String>,

    /// compare by size only. MD5 checksums are not calculated.
    #[arg(long, env, default_value_t = DEFAULT_SIZE_ONLY, help_heading = "Comparison")]
    size_only: bool,

    /// do not overwrite paths that already exist in the target
    #[arg(long, env, default_value_t = DEFAULT_SKIP_EXISTING, help_heading = "Comparison")]
    skip_existing: bool,

    /// do not copy identical content that already exists in the target. transfer it instead.
    #[arg(long, env, default_value_t = DEFAULT_NO_DEDUP, help_heading = "Comparison")]
    no_dedup: bool,

    /// number of workers for synchronization
    #[arg(long, env, default_value_t = DEFAULT_WORKER_SIZE, value_parser = clap::value_parser!(u16).range(1..), help_heading = "Performance")]
    worker_size: u16,

    /// maximum number of objects returned in a single list object request
    #[arg(long, env, default_value_t = DEFAULT_MAX_KEYS, value_parser = clap::value_parser!(i32).range(1..=32767), help_heading = "Performance")]
    max_keys: i32,

    /// object size threshold that s3mirror uses for multipart upload, Allow suffixes: MB, MiB, GB, GiB.
    #[arg(long, env, default_value = DEFAULT_MULTIPART_THRESHOLD, value_parser = human_bytes::check_human_bytes, help_heading = "Multipart Settings")]
    multipart_threshold: String,

    /// chunk size that s3mirror uses for multipart upload of individual files, Allow suffixes: MB, MiB, GB, GiB.
    /// the larger the size, the larger the memory usage.
    #[arg(long, env, default_value = DEFAULT_MULTIPART_CHUNK_SIZE, value_parser = human_bytes::check_human_bytes, help_heading = "Multipart Settings")]
    multipart_chunk_size: String,

    /// resume a previous multipart upload session of a single file. already uploaded parts are verified and reused.
    #[arg(long, env, value_parser = NonEmptyStringValueParser::new(), help_heading = "Multipart Settings")]
    upload_id: Option<String>,

    /// look up an in-progress multipart upload session of the same key and resume it
    #[arg(long, env, default_value_t = DEFAULT_RESUME_EXISTING_UPLOADS, help_heading = "Multipart Settings")]
    resume_existing_uploads: bool,

    /// abort the multipart upload session when an upload fails. the session cannot be resumed afterwards.
    #[arg(long, env, default_value_t = DEFAULT_ABORT_FAILED_UPLOADS, help_heading = "Multipart Settings")]
    abort_failed_uploads: bool,

    /// do not try to guess the mime type of local file
    #[arg(long, env, default_value_t = DEFAULT_NO_GUESS_MIME_TYPE, help_heading = "Metadata/Headers")]
    no_guess_mime_type: bool,

    /// trace verbosity(-v: show info, -vv: show debug, -vvv show trace)
    #[clap(flatten)]
    verbosity: Verbosity<WarnLevel>,

    /// show trace as json format
    #[arg(long, env, default_value_t = DEFAULT_JSON_TRACING, help_heading = "Tracing/Logging")]
    json_tracing: bool,

    /// enable aws sdk tracing
    #[arg(long, env, default_value_t = DEFAULT_AWS_SDK_TRACING, help_heading = "Tracing/Logging")]
    aws_sdk_tracing: bool,

    /// show span event tracing
    #[arg(long, env, default_value_t = DEFAULT_SPAN_EVENTS_TRACING, help_heading = "Tracing/Logging")]
    span_events_tracing: bool,

    /// disable ANSI terminal colors
    #[arg(long, env, default_value_t = DEFAULT_DISABLE_COLOR_TRACING, help_heading = "Tracing/Logging")]
    disable_color_tracing: bool,

    /// maximum retry attempts that the AWS SDK retry handler use
    #[arg(long, env, default_value_t = DEFAULT_AWS_MAX_ATTEMPTS, value_name = "max_attempts", help_heading = "Retry Options")]
    aws_max_attempts: u32,

    /// a multiplier value used when calculating backoff times as part of an exponential backoff with jitter strategy.
    #[arg(long, env, default_value_t = DEFAULT_INITIAL_BACKOFF_MILLISECONDS, value_name = "initial_backoff", help_heading = "Retry Options")]
    initial_backoff_milliseconds: u64,

    /// maximum force retry attempts for each file or part on transient errors and checksum mismatches
    #[arg(long, env, default_value_t = DEFAULT_FORCE_RETRY_COUNT, help_heading = "Retry Options")]
    force_retry_count: u32,

    /// initial sleep interval (milliseconds) between force retries. doubled on every retry.
    #[arg(long, env, default_value_t = DEFAULT_FORCE_RETRY_INTERVAL_MILLISECONDS, value_name = "force_retry_interval", help_heading = "Retry Options")]
    force_retry_interval_milliseconds: u64,

    /// operation timeout (milliseconds). For details, see the AWS SDK for Rust TimeoutConfig documentation.
    /// The default has no timeout.
    #[arg(
        long,
        env,
        value_name = "operation_timeout",
        help_heading = "Timeout Options"
    )]
    operation_timeout_milliseconds: Option<u64>,

    /// operation attempt timeout (milliseconds). For details, see the AWS SDK for Rust TimeoutConfig documentation.
    /// The default has no timeout.
    #[arg(
        long,
        env,
        value_name = "operation_attempt_timeout",
        help_heading = "Timeout Options"
    )]
    operation_attempt_timeout_milliseconds: Option<u64>,

    /// connect timeout (milliseconds).
    /// The default has AWS SDK default timeout (Currently 3100 milliseconds).
    #[arg(
        long,
        env,
        value_name = "connect_timeout",
        help_heading = "Timeout Options"
    )]
    connect_timeout_milliseconds: Option<u64>,

    /// read timeout (milliseconds).
    /// The default has no timeout.
    #[arg(
        long,
        env,
        value_name = "read_timeout",
        help_heading = "Timeout Options"
    )]
    read_timeout_milliseconds: Option<u64>,

    /// generate a auto completions script. Valid values: bash, fish, zsh, powershell, elvish.
    #[arg(long, env, value_name = "SHELL", value_parser = clap_complete::shells::Shell::from_str, help_heading = "Advanced")]
    auto_complete_shell: Option<clap_complete::shells::Shell>,

    /// disable stalled stream protection
    #[arg(long, env, default_value_t = DEFAULT_DISABLE_STALLED_STREAM_PROTECTION, help_heading = "Advanced")]
    disable_stalled_stream_protection: bool,

    /// delete paths that exist in the target but not in the source.
    /// [Warning] Since this can cause data loss, test first with the --dry-run option
    #[arg(long, env, default_value_t = DEFAULT_DELETE_REMOVED, help_heading = "Dangerous")]
    delete_removed: bool,
}

pub fn parse_from_args<I, T>(args: I) -> Result<CLIArgs, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    CLIArgs::try_parse_from(args)
}

pub fn build_config_from_args<I, T>(args: I) -> Result<Config, String>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let config_args = CLIArgs::try_parse_from(args).map_err(|e| e.to_string())?;
    crate::Config::try_from(config_args)
}

impl CLIArgs {
    fn validate_storage_config(&self) -> Result<(), String> {
        let (sources, target) = self.parse_paths()?;

        Self::check_storage_direction(&sources, &target)?;
        Self::check_source_local_storage(&sources)?;
        Self::check_target_local_storage(&target)?;
        self.check_upload_id_conflict(&sources, &target)?;
        self.check_files_from_conflict(&sources)?;
        self.check_multipart_chunk_size()?;

        Ok(())
    }

    fn parse_paths(&self) -> Result<(Vec<StoragePath>, StoragePath), String> {
        let Some((target, sources)) = self.paths.split_last() else {
            return Err(NO_S3_STORAGE_SPECIFIED.to_string());
        };

        let sources = sources
            .iter()
            .map(|source| storage_path::parse_storage_path(source))
            .collect::<Result<Vec<_>, _>>()?;
        let target = storage_path::parse_storage_path(target)?;

        Ok((sources, target))
    }

    fn check_storage_direction(sources: &[StoragePath], target: &StoragePath) -> Result<(), String> {
        let s3_sources = sources
            .iter()
            .filter(|source| matches!(source, StoragePath::S3 { .. }))
            .count();

        match target {
            StoragePath::S3 { .. } => {
                if s3_sources == sources.len() && s3_sources != 0 {
                    return Err(BOTH_S3_STORAGE_SPECIFIED.to_string());
                }
                if s3_sources != 0 {
                    return Err(MIXED_SOURCE_STORAGE_SPECIFIED.to_string());
                }
            }
            StoragePath::Local(_) => {
                if s3_sources == 0 {
                    return Err(NO_S3_STORAGE_SPECIFIED.to_string());
                }
                if s3_sources != 1 || sources.len() != 1 {
                    return Err(MULTIPLE_S3_SOURCE_SPECIFIED.to_string());
                }
            }
        }

        Ok(())
    }

    fn check_source_local_storage(sources: &[StoragePath]) -> Result<(), String> {
        for source in sources {
            if let StoragePath::Local(path) = source {
                if !path.exists() {
                    return Err(format!(
                        "{}{}\n",
                        SOURCE_LOCAL_STORAGE_NOT_FOUND,
                        path.display()
                    ));
                }
            }
        }

        Ok(())
    }

    fn check_target_local_storage(target: &StoragePath) -> Result<(), String> {
        if let StoragePath::Local(path) = target {
            if path.try_exists().is_err() {
                return Err(TARGET_LOCAL_STORAGE_INVALID.to_string());
            }
        }

        Ok(())
    }

    fn check_upload_id_conflict(
        &self,
        sources: &[StoragePath],
        target: &StoragePath,
    ) -> Result<(), String> {
        if self.upload_id.is_none() {
            return Ok(());
        }

        let single_file_source = match sources {
            [StoragePath::Local(path)] => path.is_file(),
            _ => false,
        };

        if !single_file_source || !matches!(target, StoragePath::S3 { .. }) {
            return Err(UPLOAD_ID_REQUIRES_SINGLE_UPLOAD.to_string());
        }

        Ok(())
    }

    fn check_files_from_conflict(&self, sources: &[StoragePath]) -> Result<(), String> {
        if self.files_from.is_none() {
            return Ok(());
        }

        match sources {
            [StoragePath::Local(path)] if path.is_dir() => Ok(()),
            _ => Err(FILES_FROM_REQUIRES_LOCAL_SOURCE.to_string()),
        }
    }

    fn check_multipart_chunk_size(&self) -> Result<(), String> {
        let threshold = human_bytes::parse_human_bytes(&self.multipart_threshold)?;
        let chunk_size = human_bytes::parse_human_bytes(&self.multipart_chunk_size)?;

        if threshold < chunk_size {
            return Err(MULTIPART_CHUNK_SIZE_OVER_THRESHOLD.to_string());
        }

        Ok(())
    }

    fn build_client_config(&self) -> ClientConfig {
        let credential = if let Some(profile) = self.profile.clone() {
            S3Credentials::Profile(profile)
        } else if let (Some(access_key), Some(secret_access_key)) =
            (self.access_key.clone(), self.secret_access_key.clone())
        {
            S3Credentials::Credentials {
                access_keys: AccessKeys {
                    access_key,
                    secret_access_key,
                    session_token: self.session_token.clone(),
                },
            }
        } else {
            S3Credentials::FromEnvironment
        };

        ClientConfig {
            client_config_location: ClientConfigLocation {
                aws_config_file: self.aws_config_file.clone(),
                aws_shared_credentials_file: self.aws_shared_credentials_file.clone(),
            },
            credential,
            region: self.region.clone(),
            endpoint_url: self.endpoint_url.clone(),
            force_path_style: self.force_path_style,
            retry_config: RetryConfig {
                aws_max_attempts: self.aws_max_attempts,
                initial_backoff_milliseconds: self.initial_backoff_milliseconds,
            },
            cli_timeout_config: CLITimeoutConfig {
                operation_timeout_milliseconds: self.operation_timeout_milliseconds,
                operation_attempt_timeout_milliseconds: self.operation_attempt_timeout_milliseconds,
                connect_timeout_milliseconds: self.connect_timeout_milliseconds,
                read_timeout_milliseconds: self.read_timeout_milliseconds,
            },
            disable_stalled_stream_protection: self.disable_stalled_stream_protection,
        }
    }

    fn build_tracing_config(&self) -> Option<TracingConfig> {
        let tracing_config = self.verbosity.log_level().map(|log_level| TracingConfig {
            tracing_level: log_level,
            json_tracing: self.json_tracing,
            aws_sdk_tracing: self.aws_sdk_tracing,
            span_events_tracing: self.span_events_tracing,
            disable_color_tracing: self.disable_color_tracing,
        });

        if !self.dry_run {
            return tracing_config;
        }

        // the plan is logged at info level
        match tracing_config {
            None => Some(TracingConfig {
                tracing_level: log::Level::Info,
                json_tracing: DEFAULT_JSON_TRACING,
                aws_sdk_tracing: DEFAULT_AWS_SDK_TRACING,
                span_events_tracing: DEFAULT_SPAN_EVENTS_TRACING,
                disable_color_tracing: DEFAULT_DISABLE_COLOR_TRACING,
            }),
            Some(config) if config.tracing_level < log::Level::Info => Some(TracingConfig {
                tracing_level: log::Level::Info,
                ..config
            }),
            config => config,
        }
    }
}

impl TryFrom<CLIArgs> for Config {
    type Error = String;

    fn try_from(value: CLIArgs) -> Result<Self, Self::Error> {
        // no storage is touched when only a completion script is generated
        let (sources, target) = if value.auto_complete_shell.is_some() {
            (vec![], StoragePath::Local(PathBuf::from(".")))
        } else {
            value.validate_storage_config()?;
            value.parse_paths()?
        };
        let tracing_config = value.build_tracing_config();
        let client_config = value.build_client_config();

        Ok(Config {
            sources,
            target,
            client_config: Some(client_config),
            force_retry_config: ForceRetryConfig {
                force_retry_count: value.force_retry_count,
                force_retry_interval_milliseconds: value.force_retry_interval_milliseconds,
            },
            tracing_config,
            transfer_config: TransferConfig {
                multipart_threshold: human_bytes::parse_human_bytes(&value.multipart_threshold)?,
                multipart_chunksize: human_bytes::parse_human_bytes(&value.multipart_chunk_size)?,
            },
            filter_config: FilterConfig {
                exclude: value.exclude,
                include: value.include,
                exclude_regex: value.rexclude,
                include_regex: value.rinclude,
            },
            worker_size: value.worker_size,
            recursive: !value.no_recursive,
            follow_symlinks: value.follow_symlinks,
            check_checksum: !value.size_only,
            skip_existing: value.skip_existing,
            delete_removed: value.delete_removed,
            dedup: !value.no_dedup,
            hash_cache_file: value.hash_cache_file,
            files_from: value.files_from.map(PathBuf::from),
            upload_id: value.upload_id,
            resume_existing_uploads: value.resume_existing_uploads,
            abort_failed_uploads: value.abort_failed_uploads,
            no_guess_mime_type: value.no_guess_mime_type,
            dry_run: value.dry_run,
            max_keys: value.max_keys,
            auto_complete_shell: value.auto_complete_shell,
        })
    }
}
