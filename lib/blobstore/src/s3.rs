//! S3-compatible adapter, used for the `s3` and `aws-s3` drivers.
//!
//! Credentials come from an explicit identity/secret pair when configured,
//! falling back to the SDK's default provider chain otherwise (some mock
//! back-ends require no credentials at all). A custom endpoint switches the
//! client to path-style addressing, which is what mock back-ends and most
//! on-premise S3 implementations expect.

use std::{collections::HashMap, ops::Range, time::Duration};

use async_trait::async_trait;
use aws_config::{retry::RetryConfig, timeout::TimeoutConfig, BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    primitives::ByteStream,
    types::{
        BucketLocationConstraint, CompletedMultipartUpload, CompletedPart,
        CreateBucketConfiguration, Delete, ObjectIdentifier,
    },
    Client,
};
use bytes::Bytes;

use super::{
    http_range, Blob, BlobMetadata, BlobStore, MultipartUpload, StoreError, UploadedPart,
};

/// Connection options for [`S3BlobStore`].
///
/// At least one of `region` and `endpoint` must be set; the engine validates
/// this before constructing the adapter.
#[derive(Clone, Debug)]
pub struct S3Options {
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_identity: Option<String>,
    pub access_secret: Option<String>,
    pub request_timeout: Duration,
    pub max_retries: u32,
}

/// [`BlobStore`] adapter over an S3-compatible object store.
#[derive(Debug)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
    region: Option<String>,
}

impl S3BlobStore {
    /// Builds the SDK client and binds it to the configured bucket.
    ///
    /// The bucket is not touched here; use
    /// [`create_bucket`](BlobStore::create_bucket) to provision it.
    pub async fn connect(options: S3Options) -> Self {
        let timeouts = TimeoutConfig::builder()
            .operation_attempt_timeout(options.request_timeout)
            .build();
        let retries = RetryConfig::standard().with_max_attempts(options.max_retries);

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .timeout_config(timeouts)
            .retry_config(retries);
        if let Some(region) = options.region.clone() {
            loader = loader.region(Region::new(region));
        }
        if let Some(endpoint) = options.endpoint.clone() {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(identity), Some(secret)) =
            (options.access_identity.as_ref(), options.access_secret.as_ref())
        {
            loader = loader.credentials_provider(Credentials::from_keys(
                identity.clone(),
                secret.clone(),
                None,
            ));
        }

        let sdk_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if options.endpoint.is_some() {
            builder = builder.force_path_style(true);
        }
        let client = Client::from_conf(builder.build());

        debug!(
            bucket = %options.bucket,
            endpoint = options.endpoint.as_deref().unwrap_or("<default>"),
            "Connected S3 blob store."
        );

        Self {
            client,
            bucket: options.bucket,
            region: options.region,
        }
    }

    fn io_error(
        operation: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> StoreError {
        StoreError::Io {
            operation,
            source: Box::new(source),
        }
    }

    fn missing_field(operation: &'static str, field: &'static str) -> StoreError {
        StoreError::Io {
            operation,
            source: format!("response was missing '{field}'").into(),
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn create_bucket(&self) -> Result<bool, StoreError> {
        let mut request = self.client.create_bucket().bucket(&self.bucket);
        // us-east-1 is the one region that must not be named in a location
        // constraint.
        if let Some(region) = self.region.as_deref().filter(|r| *r != "us-east-1") {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_bucket_already_owned_by_you() {
                    Ok(false)
                } else {
                    Err(Self::io_error("create_bucket", service_err))
                }
            }
        }
    }

    async fn delete_bucket(&self) -> Result<(), StoreError> {
        self.client
            .delete_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|err| Self::io_error("delete_bucket", err))?;
        Ok(())
    }

    async fn initiate_multipart_upload(
        &self,
        key: &str,
        metadata: &BlobMetadata,
    ) -> Result<MultipartUpload, StoreError> {
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_metadata(Some(metadata.user_metadata.clone()));
        if let Some(content_type) = metadata.content_type.as_deref() {
            request = request.content_type(content_type);
        }

        let output = request
            .send()
            .await
            .map_err(|err| Self::io_error("initiate_multipart_upload", err))?;
        let upload_id = output
            .upload_id()
            .ok_or_else(|| Self::missing_field("initiate_multipart_upload", "upload_id"))?;

        Ok(MultipartUpload {
            key: key.to_string(),
            upload_id: upload_id.to_string(),
        })
    }

    async fn upload_part(
        &self,
        upload: &MultipartUpload,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart, StoreError> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&upload.key)
            .upload_id(&upload.upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| Self::io_error("upload_part", err))?;
        let etag = output
            .e_tag()
            .ok_or_else(|| Self::missing_field("upload_part", "e_tag"))?;

        Ok(UploadedPart {
            part_number,
            etag: etag.to_string(),
        })
    }

    async fn complete_multipart_upload(
        &self,
        upload: &MultipartUpload,
        parts: Vec<UploadedPart>,
    ) -> Result<(), StoreError> {
        let completed_parts = parts
            .into_iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.part_number)
                    .e_tag(part.etag)
                    .build()
            })
            .collect::<Vec<_>>();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&upload.key)
            .upload_id(&upload.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|err| Self::io_error("complete_multipart_upload", err))?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, upload: &MultipartUpload) -> Result<(), StoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&upload.key)
            .upload_id(&upload.upload_id)
            .send()
            .await
            .map_err(|err| Self::io_error("abort_multipart_upload", err))?;
        Ok(())
    }

    async fn put_blob(
        &self,
        key: &str,
        metadata: &BlobMetadata,
        body: Bytes,
    ) -> Result<(), StoreError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(body.len() as i64)
            .set_metadata(Some(metadata.user_metadata.clone()))
            .body(ByteStream::from(body));
        if let Some(content_type) = metadata.content_type.as_deref() {
            request = request.content_type(content_type);
        }

        request
            .send()
            .await
            .map_err(|err| Self::io_error("put_blob", err))?;
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> Result<Blob, StoreError> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                let service_err = err.into_service_error();
                return Err(if service_err.is_no_such_key() {
                    StoreError::NotFound {
                        key: key.to_string(),
                    }
                } else {
                    Self::io_error("get_blob", service_err)
                });
            }
        };

        let user_metadata = output
            .metadata()
            .cloned()
            .unwrap_or_else(HashMap::new);
        let body = output
            .body
            .collect()
            .await
            .map_err(|err| Self::io_error("get_blob", err))?
            .into_bytes();

        Ok(Blob {
            user_metadata,
            body,
        })
    }

    async fn get_blob_range(&self, key: &str, range: Range<u64>) -> Result<Bytes, StoreError> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(http_range(&range))
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                let service_err = err.into_service_error();
                return Err(if service_err.is_no_such_key() {
                    StoreError::NotFound {
                        key: key.to_string(),
                    }
                } else {
                    Self::io_error("get_blob_range", service_err)
                });
            }
        };

        Ok(output
            .body
            .collect()
            .await
            .map_err(|err| Self::io_error("get_blob_range", err))?
            .into_bytes())
    }

    async fn remove_blobs(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }

        let objects = keys
            .iter()
            .map(|key| {
                ObjectIdentifier::builder()
                    .key(key)
                    .build()
                    .map_err(|err| Self::io_error("remove_blobs", err))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(|err| Self::io_error("remove_blobs", err))?;

        self.client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|err| Self::io_error("remove_blobs", err))?;
        Ok(())
    }
}
