use percent_encoding::percent_decode_str;
use regex::Regex;
use url::{ParseError, Url};

use crate::types::StoragePath;

const S3_SCHEME_PREFIX: &str = "s3://";

const INVALID_SCHEME: &str = "scheme must be s3:// .";
const INVALID_PATH: &str = "path must be a valid URL or a local path.";
const NO_BUCKET_NAME_SPECIFIED: &str = "bucket name must be specified.";
const NO_PATH_SPECIFIED: &str = "path must be specified.";
const INVALID_PREFIX_ENCODING: &str = "prefix must be valid UTF-8 after percent-decoding.";

/// Accepts `s3://bucket[/prefix]` or a local path. Local paths are kept as
/// given: a trailing separator is meaningful.
pub fn check_storage_path(path: &str) -> Result<String, String> {
    if path.is_empty() {
        return Err(NO_PATH_SPECIFIED.to_string());
    }

    if is_s3_path(path) {
        split_s3_path(path)?;
        return Ok(path.to_string());
    }

    match Url::parse(path) {
        Err(ParseError::RelativeUrlWithoutBase) => Ok(path.to_string()),
        Err(_) => Err(INVALID_PATH.to_string()),
        Ok(_) if is_windows_absolute_path(path) => Ok(path.to_string()),
        Ok(_) => Err(INVALID_SCHEME.to_string()),
    }
}

pub fn parse_storage_path(path: &str) -> Result<StoragePath, String> {
    check_storage_path(path)?;

    if is_s3_path(path) {
        let (bucket, prefix) = split_s3_path(path)?;
        return Ok(StoragePath::S3 { bucket, prefix });
    }

    Ok(StoragePath::Local(path.into()))
}

pub fn is_s3_path(path: &str) -> bool {
    path.starts_with(S3_SCHEME_PREFIX)
}

// The prefix may carry glob characters such as '?', so it is not parsed as a URL path.
fn split_s3_path(path: &str) -> Result<(String, String), String> {
    let without_scheme = &path[S3_SCHEME_PREFIX.len()..];
    let (bucket, prefix) = without_scheme
        .split_once('/')
        .unwrap_or((without_scheme, ""));

    if bucket.is_empty() {
        return Err(NO_BUCKET_NAME_SPECIFIED.to_string());
    }

    let prefix = percent_decode_str(prefix)
        .decode_utf8()
        .map_err(|_| INVALID_PREFIX_ENCODING.to_string())?
        .to_string();

    Ok((bucket.to_string(), prefix))
}

fn is_windows_absolute_path(path: &str) -> bool {
    if !cfg!(windows) {
        return false;
    }

    let re = Regex::new(r"^[a-zA-Z]:\\").unwrap();
    re.is_match(path)
}
