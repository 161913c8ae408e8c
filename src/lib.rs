/*!
# Overview
s3mirror is a one-way synchronization tool between local directories and an S3 bucket.

## Features
- Upload (local to S3) and download (S3 to local), chosen by which side is `s3://`.

- Content comparison
  Files are compared by size first. When sizes match, the MD5 checksum of the local file is compared with the
  trusted hash of the object (its ETag, or the `s3mirror-attrs` metadata written by s3mirror for multipart objects).
  `--size-only` skips checksums.

- Content-addressed copy
  When the target already contains identical content under another path, s3mirror copies it in place
  (server-side copy on S3, local file copy on disk) instead of transferring the bytes again.

- Hash cache
  MD5 checksums of local files are cached by `(device, inode, mtime, size)` across runs (`--hash-cache-file`).
  Hard links are hashed only once.

- Resumable multipart upload
  Large files are uploaded in parts. An interrupted upload can be resumed with `--upload-id`, or discovered by key
  with `--resume-existing-uploads`. Already uploaded parts are verified against the local file and reused.

## As a library
s3mirror CLI is a thin wrapper of the s3mirror library. Build a [`Config`] from CLI-style arguments and run a
[`pipeline::Pipeline`].

Example usage
=============

```no_run
use s3mirror::config::Config;
use s3mirror::config::args::parse_from_args;
use s3mirror::pipeline::Pipeline;
use s3mirror::types::token::create_sync_cancellation_token;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = vec![
        "program_name",
        "--delete-removed",
        "./src/",
        "s3://test-bucket/src/",
    ];

    let config = Config::try_from(parse_from_args(args)?).map_err(anyhow::Error::msg)?;

    let cancellation_token = create_sync_cancellation_token();
    let mut pipeline = Pipeline::new(config, cancellation_token).await?;
    let report = pipeline.run().await?;

    println!(
        "transferred: {}, copied: {}, deleted: {}, failed: {}",
        report.transferred, report.copied, report.deleted, report.failed
    );

    Ok(())
}
```

Any [`storage::ObjectStoreTrait`] implementation can stand in for S3 with [`pipeline::Pipeline::with_store`].
*/

pub use config::Config;
pub use config::args::CLIArgs;

pub mod config;
pub mod pipeline;
pub mod storage;
pub mod types;
