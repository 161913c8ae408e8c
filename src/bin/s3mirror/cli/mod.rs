use anyhow::Result;
use tokio::time::Instant;
use tracing::{error, trace, warn};

use s3mirror::Config;
use s3mirror::pipeline::Pipeline;
use s3mirror::types::SyncReport;
use s3mirror::types::error::{S3mirrorError, s3mirror_errors};
use s3mirror::types::token::create_sync_cancellation_token;

mod ctrl_c_handler;

const EXIT_CODE_SUCCESS: i32 = 0;
const EXIT_CODE_ERROR: i32 = 1;
const EXIT_CODE_INVALID_ARGS: i32 = 2;
const EXIT_CODE_PARTIAL_FAILURE: i32 = 3;

pub async fn run(config: Config) -> Result<()> {
    let start_time = Instant::now();
    trace!("s3mirror start.");

    let result = sync(config).await;

    let duration_sec = format!("{:.3}", start_time.elapsed().as_secs_f32());
    match exit_code(&result) {
        EXIT_CODE_SUCCESS => {
            trace!(duration_sec = duration_sec, "s3mirror has been completed.");
            Ok(())
        }
        EXIT_CODE_PARTIAL_FAILURE => {
            let failed = result.as_ref().map(|report| report.failed).unwrap_or_default();
            warn!(
                failed = failed,
                duration_sec = duration_sec,
                "s3mirror completed, but some files failed to sync."
            );
            std::process::exit(EXIT_CODE_PARTIAL_FAILURE);
        }
        EXIT_CODE_INVALID_ARGS => {
            if let Err(e) = result {
                clap::Error::raw(clap::error::ErrorKind::ValueValidation, format!("{e}\n")).exit();
            }
            std::process::exit(EXIT_CODE_INVALID_ARGS);
        }
        _ => {
            error!(duration_sec = duration_sec, "s3mirror failed.");
            result.map(|_| ())
        }
    }
}

async fn sync(config: Config) -> Result<SyncReport> {
    let cancellation_token = create_sync_cancellation_token();
    ctrl_c_handler::spawn_ctrl_c_handler(cancellation_token.clone());

    let mut pipeline = Pipeline::new(config, cancellation_token.clone()).await?;
    let result = pipeline.run().await;

    // stops the ctrl-c handler
    cancellation_token.cancel();

    result
}

fn exit_code(result: &Result<SyncReport>) -> i32 {
    match result {
        Ok(report) if report.has_failures() => EXIT_CODE_PARTIAL_FAILURE,
        Ok(_) => EXIT_CODE_SUCCESS,
        Err(e) => {
            if s3mirror_errors(e).any(|e| matches!(e, S3mirrorError::InvalidConfiguration(_))) {
                EXIT_CODE_INVALID_ARGS
            } else {
                EXIT_CODE_ERROR
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::anyhow;
    use s3mirror::config::args::parse_from_args;

    use super::*;

    #[test]
    fn exit_code_of_report() {
        init_dummy_tracing_subscriber();

        assert_eq!(exit_code(&Ok(SyncReport::default())), EXIT_CODE_SUCCESS);
        assert_eq!(
            exit_code(&Ok(SyncReport {
                transferred: 3,
                failed: 1,
                ..SyncReport::default()
            })),
            EXIT_CODE_PARTIAL_FAILURE
        );
    }

    #[test]
    fn exit_code_of_error() {
        init_dummy_tracing_subscriber();

        assert_eq!(
            exit_code(&Err(anyhow!(S3mirrorError::InvalidConfiguration(
                "--upload-id requires a single local file as SOURCE.".to_string()
            )))),
            EXIT_CODE_INVALID_ARGS
        );
        assert_eq!(
            exit_code(&Err(anyhow!(S3mirrorError::PermanentStoreError(
                "AccessDenied".to_string()
            )))),
            EXIT_CODE_ERROR
        );
        assert_eq!(exit_code(&Err(anyhow!(S3mirrorError::Cancelled))), EXIT_CODE_ERROR);
        assert_eq!(exit_code(&Err(anyhow!("unknown error"))), EXIT_CODE_ERROR);
    }

    #[tokio::test]
    async fn run_pipeline_error() {
        init_dummy_tracing_subscriber();

        // wait for signal test to finish
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let args = vec![
            "s3mirror",
            "--access-key",
            "access_key",
            "--secret-access-key",
            "secret_access_key",
            "--region",
            "us-east-1",
            "--aws-max-attempts",
            "1",
            "--endpoint-url",
            "https://invalid-s3-endpoint-url.6329313.local:65535",
            "--force-retry-count",
            "1",
            "--force-retry-interval-milliseconds",
            "1",
            "s3://invalid_bucket",
            "./target/invalid_download/",
        ];
        let config = Config::try_from(parse_from_args(args).unwrap()).unwrap();

        assert!(run(config).await.is_err());
    }

    fn init_dummy_tracing_subscriber() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("dummy=trace")
            .try_init();
    }
}
