use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, MetadataDirective};
use aws_smithy_runtime_api::client::result::SdkError;
use aws_smithy_runtime_api::http::Response;
use aws_smithy_types::body::SdkBody;
use aws_smithy_types::error::display::DisplayErrorContext;
use aws_smithy_types_convert::date_time::DateTimeExt;
use chrono::{DateTime, Utc};
use tracing::trace;

use crate::config::ClientConfig;
use crate::storage::{
    GetObjectResult, ListPage, ListRequest, ListedObject, ObjectMetadata, ObjectStore,
    ObjectStoreTrait, PendingUpload, PutOptions, UploadedPart,
};
use crate::types::CONTENT_ATTRIBUTES_METADATA_KEY;
use crate::types::error::S3mirrorError;

pub mod client_builder;
pub mod lister;
pub mod upload_manager;

#[derive(Clone)]
pub struct S3ObjectStore {
    bucket: String,
    client: Arc<Client>,
}

impl S3ObjectStore {
    pub async fn boxed_new(bucket: &str, client_config: &ClientConfig) -> ObjectStore {
        Self::boxed_new_with_client(bucket, Arc::new(client_config.create_client().await))
    }

    pub fn boxed_new_with_client(bucket: &str, client: Arc<Client>) -> ObjectStore {
        Box::new(S3ObjectStore {
            bucket: bucket.to_string(),
            client,
        })
    }
}

#[async_trait]
impl ObjectStoreTrait for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list_page(&self, request: &ListRequest) -> Result<ListPage> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&request.prefix)
            .set_delimiter(request.delimiter.clone())
            .set_continuation_token(request.continuation.clone())
            .max_keys(request.max_keys)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "list_objects_v2()"))?;

        let mut objects = Vec::with_capacity(output.contents().len());
        for object in output.contents() {
            let Some(key) = object.key() else {
                continue;
            };
            objects.push(ListedObject {
                key: key.to_string(),
                size: object.size().unwrap_or_default().max(0) as u64,
                last_modified: to_chrono(object.last_modified()),
                e_tag: object.e_tag().map(|e_tag| e_tag.to_string()),
                storage_class: object
                    .storage_class()
                    .map(|storage_class| storage_class.as_str().to_string()),
            });
        }

        Ok(ListPage {
            objects,
            common_prefixes: output
                .common_prefixes()
                .iter()
                .filter_map(|prefix| prefix.prefix().map(|prefix| prefix.to_string()))
                .collect(),
            is_truncated: output.is_truncated().unwrap_or(false),
            next_continuation: output.next_continuation_token().map(|t| t.to_string()),
        })
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(SdkError::ServiceError(e)) if e.raw().status().as_u16() == 404 => {
                trace!(key = key, "head_object() object not found.");
                return Ok(None);
            }
            Err(e) => return Err(classify_sdk_error(e, "head_object()")),
        };

        Ok(Some(ObjectMetadata {
            size: output.content_length().unwrap_or_default().max(0) as u64,
            e_tag: output.e_tag().map(|e_tag| e_tag.to_string()),
            last_modified: output.last_modified().and_then(|t| t.to_chrono_utc().ok()),
            attributes: get_attributes(output.metadata()),
        }))
    }

    async fn get_object(&self, key: &str) -> Result<GetObjectResult> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "get_object()"))?;

        let size = output.content_length().unwrap_or_default().max(0) as u64;
        let e_tag = output.e_tag().map(|e_tag| e_tag.to_string());
        let attributes = get_attributes(output.metadata());

        Ok(GetObjectResult {
            reader: Box::pin(output.body.into_async_read()),
            size,
            e_tag,
            attributes,
        })
    }

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        options: &PutOptions,
    ) -> Result<Option<String>> {
        let content_length = body.len() as i64;
        let output = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(content_length)
            .set_content_md5(options.content_md5.clone())
            .set_content_type(options.content_type.clone())
            .set_metadata(build_metadata(options))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "put_object()"))?;

        trace!(key = key, "{output:?}");

        Ok(output.e_tag().map(|e_tag| e_tag.to_string()))
    }

    async fn copy_object(
        &self,
        source_key: &str,
        target_key: &str,
        options: &PutOptions,
    ) -> Result<()> {
        let copy_source = format!("{}/{}", self.bucket, urlencoding::encode(source_key));
        let output = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .key(target_key)
            .copy_source(copy_source)
            .metadata_directive(MetadataDirective::Replace)
            .set_content_type(options.content_type.clone())
            .set_metadata(build_metadata(options))
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "copy_object()"))?;

        trace!(source_key = source_key, target_key = target_key, "{output:?}");

        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "delete_object()"))?;

        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str, options: &PutOptions) -> Result<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_content_type(options.content_type.clone())
            .set_metadata(build_metadata(options))
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "create_multipart_upload()"))?;

        output
            .upload_id()
            .map(|upload_id| upload_id.to_string())
            .ok_or_else(|| anyhow!("create_multipart_upload() returned no upload_id."))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
        content_md5: &str,
    ) -> Result<String> {
        let content_length = body.len() as i64;
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .content_md5(content_md5)
            .content_length(content_length)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "upload_part()"))?;

        output
            .e_tag()
            .map(|e_tag| e_tag.to_string())
            .ok_or_else(|| anyhow!("upload_part() returned no e_tag."))
    }

    async fn list_parts(&self, key: &str, upload_id: &str) -> Result<Vec<UploadedPart>> {
        let mut parts = Vec::new();
        let mut part_number_marker = None;
        loop {
            let output = self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .set_part_number_marker(part_number_marker)
                .send()
                .await
                .map_err(|e| classify_sdk_error(e, "list_parts()"))?;

            for part in output.parts() {
                let (Some(part_number), Some(e_tag)) = (part.part_number(), part.e_tag()) else {
                    continue;
                };
                parts.push(UploadedPart {
                    part_number,
                    size: part.size().unwrap_or_default().max(0) as u64,
                    e_tag: e_tag.to_string(),
                });
            }

            if !output.is_truncated().unwrap_or(false) {
                break;
            }
            part_number_marker = output.next_part_number_marker().map(|m| m.to_string());
            if part_number_marker.is_none() {
                break;
            }
        }

        Ok(parts)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(i32, String)],
    ) -> Result<Option<String>> {
        let completed_parts = parts
            .iter()
            .map(|(part_number, e_tag)| {
                CompletedPart::builder()
                    .part_number(*part_number)
                    .e_tag(e_tag)
                    .build()
            })
            .collect();

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "complete_multipart_upload()"))?;

        trace!(key = key, upload_id = upload_id, "{output:?}");

        Ok(output.e_tag().map(|e_tag| e_tag.to_string()))
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "abort_multipart_upload()"))?;

        Ok(())
    }

    async fn list_multipart_uploads(&self, key: &str) -> Result<Vec<PendingUpload>> {
        let output = self
            .client
            .list_multipart_uploads()
            .bucket(&self.bucket)
            .prefix(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "list_multipart_uploads()"))?;

        Ok(output
            .uploads()
            .iter()
            .filter(|upload| upload.key() == Some(key))
            .filter_map(|upload| {
                Some(PendingUpload {
                    key: key.to_string(),
                    upload_id: upload.upload_id()?.to_string(),
                    initiated: upload.initiated().and_then(|t| t.to_chrono_utc().ok()),
                })
            })
            .collect())
    }
}

/// Construction failures and 4xx service errors are permanent; everything else may succeed on retry.
pub fn classify_sdk_error<E>(e: SdkError<E, Response<SdkBody>>, operation: &str) -> anyhow::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    let retryable = is_retryable_sdk_error(&e);
    let message = format!("{operation} failed: {}", DisplayErrorContext(&e));

    let error = if retryable {
        S3mirrorError::TransientStoreError(message)
    } else {
        S3mirrorError::PermanentStoreError(message)
    };

    anyhow!(error)
}

fn is_retryable_sdk_error<E>(e: &SdkError<E, Response<SdkBody>>) -> bool {
    match e {
        SdkError::ConstructionFailure(_) => false,
        SdkError::ServiceError(service_error) => {
            is_retryable_status(service_error.raw().status().as_u16())
        }
        _ => true,
    }
}

fn is_retryable_status(status: u16) -> bool {
    status >= 500 || status == 429 || status == 408
}

fn get_attributes(metadata: Option<&HashMap<String, String>>) -> Option<String> {
    metadata.and_then(|metadata| metadata.get(CONTENT_ATTRIBUTES_METADATA_KEY).cloned())
}

fn build_metadata(options: &PutOptions) -> Option<HashMap<String, String>> {
    options.attributes.as_ref().map(|attributes| {
        HashMap::from([(
            CONTENT_ATTRIBUTES_METADATA_KEY.to_string(),
            attributes.to_string(),
        )])
    })
}

fn to_chrono(date_time: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
    date_time
        .and_then(|date_time| date_time.to_chrono_utc().ok())
        .unwrap_or_default()
}

pub fn remove_s3_prefix(key: &str, prefix: &str) -> String {
    key.strip_prefix(prefix).unwrap_or(key).to_string()
}

pub fn generate_full_key(prefix: &str, key: &str) -> String {
    format!("{prefix}{key}")
}

#[cfg(test)]
mod tests {
    use aws_sdk_s3::operation::head_object::HeadObjectError;
    use aws_smithy_runtime_api::http::StatusCode;

    use crate::types::error::is_retryable_error;

    use super::*;

    #[test]
    fn remove_s3_prefix_test() {
        init_dummy_tracing_subscriber();

        assert_eq!(remove_s3_prefix("dir1/data1", "dir1/data1"), "");
        assert_eq!(remove_s3_prefix("dir1/data1", "dir1"), "/data1");
        assert_eq!(remove_s3_prefix("dir1/data1", "dir1/"), "data1");
        assert_eq!(remove_s3_prefix("dir1/data1", ""), "dir1/data1");
        assert_eq!(remove_s3_prefix("other/data1", "dir1/"), "other/data1");
    }

    #[test]
    fn generate_full_key_test() {
        init_dummy_tracing_subscriber();

        assert_eq!(generate_full_key("dir1/", "data1"), "dir1/data1");
        assert_eq!(generate_full_key("", "data1"), "data1");
    }

    #[test]
    fn classify_service_errors() {
        init_dummy_tracing_subscriber();

        assert!(is_retryable_error(&classify_sdk_error(
            build_head_object_service_error(503),
            "head_object()"
        )));
        assert!(is_retryable_error(&classify_sdk_error(
            build_head_object_service_error(429),
            "head_object()"
        )));
        assert!(!is_retryable_error(&classify_sdk_error(
            build_head_object_service_error(403),
            "head_object()"
        )));
    }

    #[test]
    fn classify_timeout_and_construction_errors() {
        init_dummy_tracing_subscriber();

        let timeout: SdkError<HeadObjectError, Response<SdkBody>> =
            SdkError::timeout_error("timeout_error");
        assert!(is_retryable_error(&classify_sdk_error(
            timeout,
            "head_object()"
        )));

        let construction: SdkError<HeadObjectError, Response<SdkBody>> =
            SdkError::construction_failure("construction_failure");
        let error = classify_sdk_error(construction, "head_object()");
        assert!(!is_retryable_error(&error));
        assert!(error.to_string().contains("permanent store error"));
    }

    #[test]
    fn metadata_round_trip() {
        init_dummy_tracing_subscriber();

        let options = PutOptions {
            attributes: Some("md5:5d41402abc4b2a76b9719d911017c592/size:5".to_string()),
            ..Default::default()
        };
        let metadata = build_metadata(&options);

        assert_eq!(get_attributes(metadata.as_ref()), options.attributes);
        assert!(build_metadata(&PutOptions::default()).is_none());
    }

    fn build_head_object_service_error(status: u16) -> SdkError<HeadObjectError, Response<SdkBody>> {
        let head_object_error =
            HeadObjectError::NotFound(aws_sdk_s3::types::error::NotFound::builder().build());
        let response = Response::new(StatusCode::try_from(status).unwrap(), SdkBody::from(""));

        SdkError::service_error(head_object_error, response)
    }

    fn init_dummy_tracing_subscriber() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("dummy=trace")
            .try_init();
    }
}
