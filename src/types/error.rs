use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum S3mirrorError {
    #[error("a key references a parent directory.")]
    DirectoryTraversalError,
    #[error("cancelled")]
    Cancelled,
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("transient store error: {0}")]
    TransientStoreError(String),
    #[error("permanent store error: {0}")]
    PermanentStoreError(String),
    #[error("checksum mismatch. key: {key}, expected: {expected}, actual: {actual}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },
    #[error(
        "multipart upload aborted. key: {key}, upload_id: {upload_id}. to resume, run again with --upload-id {upload_id}"
    )]
    UploadAborted { key: String, upload_id: String },
    #[error("local file vanished: {path}")]
    LocalFileVanished { path: String },
}

impl S3mirrorError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            S3mirrorError::TransientStoreError(_) | S3mirrorError::ChecksumMismatch { .. }
        )
    }
}

/// Every `S3mirrorError` in the error, whether it was the root cause or attached as context.
pub fn s3mirror_errors(e: &anyhow::Error) -> impl Iterator<Item = &S3mirrorError> {
    e.downcast_ref::<S3mirrorError>().into_iter().chain(
        e.chain()
            .filter_map(|cause| cause.downcast_ref::<S3mirrorError>()),
    )
}

/// An aborted multipart upload has already retried its parts and is not retried as a whole.
pub fn is_retryable_error(e: &anyhow::Error) -> bool {
    !s3mirror_errors(e).any(|e| matches!(e, S3mirrorError::UploadAborted { .. }))
        && s3mirror_errors(e).any(S3mirrorError::is_retryable)
}

pub fn is_cancelled_error(e: &anyhow::Error) -> bool {
    s3mirror_errors(e).any(|e| *e == S3mirrorError::Cancelled)
}

pub fn is_vanished_error(e: &anyhow::Error) -> bool {
    s3mirror_errors(e).any(|e| matches!(e, S3mirrorError::LocalFileVanished { .. }))
}

pub fn is_permanent_error(e: &anyhow::Error) -> bool {
    s3mirror_errors(e).any(|e| {
        matches!(
            e,
            S3mirrorError::PermanentStoreError(_) | S3mirrorError::InvalidConfiguration(_)
        )
    })
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Context};

    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(is_retryable_error(&anyhow!(
            S3mirrorError::TransientStoreError("503".to_string())
        )));
        assert!(is_retryable_error(&anyhow!(S3mirrorError::ChecksumMismatch {
            key: "a".to_string(),
            expected: "1".to_string(),
            actual: "2".to_string(),
        })));
        assert!(!is_retryable_error(&anyhow!(
            S3mirrorError::PermanentStoreError("403".to_string())
        )));
        assert!(!is_retryable_error(&anyhow!("error")));
    }

    #[test]
    fn retryable_error_with_context() {
        let result: anyhow::Result<()> =
            Err(anyhow!(S3mirrorError::TransientStoreError("reset".to_string())));
        let e = result.context("upload_part() failed.").unwrap_err();

        assert!(is_retryable_error(&e));
        assert!(!is_cancelled_error(&e));
    }

    #[test]
    fn upload_aborted_message_names_upload_id() {
        let message = S3mirrorError::UploadAborted {
            key: "dir/large.bin".to_string(),
            upload_id: "abc123".to_string(),
        }
        .to_string();

        assert!(message.contains("abc123"));
        assert!(message.contains("--upload-id"));
    }

    #[test]
    fn error_attached_as_context() {
        let e = anyhow!("connection reset")
            .context(S3mirrorError::TransientStoreError("upload_part()".to_string()));

        assert!(is_retryable_error(&e));
        assert!(!is_permanent_error(&e));
    }

    #[test]
    fn aborted_upload_keeps_its_cause() {
        let upload_aborted = || S3mirrorError::UploadAborted {
            key: "dir/large.bin".to_string(),
            upload_id: "abc123".to_string(),
        };

        let e = anyhow!(S3mirrorError::PermanentStoreError("403".to_string()))
            .context(upload_aborted());
        assert!(is_permanent_error(&e));
        assert!(e.to_string().contains("abc123"));

        let e = anyhow!(S3mirrorError::TransientStoreError("503".to_string()))
            .context(upload_aborted());
        assert!(!is_retryable_error(&e));
        assert!(!is_permanent_error(&e));
    }

    #[test]
    fn permanent_errors() {
        assert!(is_permanent_error(&anyhow!(
            S3mirrorError::PermanentStoreError("403".to_string())
        )));
        assert!(is_permanent_error(&anyhow!(
            S3mirrorError::InvalidConfiguration("chunk".to_string())
        )));
        assert!(!is_permanent_error(&anyhow!("error")));
    }

    #[test]
    fn vanished_error() {
        assert!(is_vanished_error(&anyhow!(S3mirrorError::LocalFileVanished {
            path: "/tmp/x".to_string()
        })));
        assert!(!is_vanished_error(&anyhow!(S3mirrorError::Cancelled)));
    }
}
