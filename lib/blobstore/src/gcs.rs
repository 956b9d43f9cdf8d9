//! Google Cloud Storage adapter, used for the `google-cloud-storage` driver.
//!
//! Talks to the GCS JSON API directly. Service-account credentials are read
//! eagerly at construction and exchanged for OAuth tokens on demand; tokens
//! are cached until shortly before expiry.
//!
//! GCS has no native multipart upload in the JSON API, so the adapter maps
//! the multipart capability onto part objects plus chained `compose` calls
//! (at most 32 sources per call). Aborting an upload deletes the part
//! objects that were written.

use std::{
    collections::HashMap,
    ops::Range,
    path::PathBuf,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use goauth::{auth::JwtClaims, credentials::Credentials, scopes::Scope};
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use serde_json::json;
use smpl_jwt::Jwt;

use super::{
    http_range, Blob, BlobMetadata, BlobStore, MultipartUpload, StoreError, UploadedPart,
};

const BASE_URL: &str = "https://storage.googleapis.com";

// Compose accepts at most 32 source objects per call.
const COMPOSE_FAN_IN: usize = 32;

// Refresh tokens two minutes before Google says they expire.
const TOKEN_REFRESH_SLACK: Duration = Duration::from_secs(120);

// Everything except unreserved characters gets escaped in object names.
const OBJECT_NAME: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Connection options for [`GcsBlobStore`].
#[derive(Clone, Debug)]
pub struct GcsOptions {
    pub bucket: String,
    pub service_account_path: PathBuf,
    pub request_timeout: Duration,
}

struct CachedToken {
    header: String,
    acquired: Instant,
    ttl: Duration,
}

struct UploadState {
    metadata: BlobMetadata,
    part_objects: Vec<String>,
}

/// [`BlobStore`] adapter over the GCS JSON API.
pub struct GcsBlobStore {
    http: reqwest::Client,
    bucket: String,
    credentials: Credentials,
    jwt: Jwt<JwtClaims>,
    token: tokio::sync::Mutex<Option<CachedToken>>,
    uploads: Mutex<HashMap<String, UploadState>>,
}

#[derive(Deserialize)]
struct ObjectResource {
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl GcsBlobStore {
    /// Reads the service-account file and builds the adapter.
    ///
    /// # Errors
    ///
    /// Fails with an authentication error if the service-account file cannot
    /// be read or does not contain a usable RSA key. The first token is only
    /// fetched lazily, so a reachable-but-misconfigured OAuth endpoint shows
    /// up on the first store call instead.
    pub fn connect(options: GcsOptions) -> Result<Self, StoreError> {
        let path = options
            .service_account_path
            .to_str()
            .ok_or_else(|| StoreError::Auth {
                reason: "service account path is not valid UTF-8".to_string(),
            })?;
        let credentials = Credentials::from_file(path).map_err(|err| StoreError::Auth {
            reason: format!("failed to load service account file '{path}': {err}"),
        })?;
        let claims = JwtClaims::new(
            credentials.iss(),
            &[Scope::DevStorageReadWrite],
            credentials.token_uri(),
            None,
            None,
        );
        let rsa_key = credentials.rsa_key().map_err(|err| StoreError::Auth {
            reason: format!("service account file '{path}' has an unusable key: {err}"),
        })?;
        let jwt = Jwt::new(claims, rsa_key, None);

        let http = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|err| Self::io_error("connect", err))?;

        debug!(bucket = %options.bucket, "Connected GCS blob store.");

        Ok(Self {
            http,
            bucket: options.bucket,
            credentials,
            jwt,
            token: tokio::sync::Mutex::new(None),
            uploads: Mutex::new(HashMap::new()),
        })
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

    async fn bearer(&self) -> Result<String, StoreError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.acquired.elapsed() < token.ttl {
                return Ok(token.header.clone());
            }
        }

        let token = goauth::get_token(&self.jwt, &self.credentials)
            .await
            .map_err(|err| StoreError::Auth {
                reason: format!("token exchange failed: {err}"),
            })?;
        let ttl = Duration::from_secs(token.expires_in().max(0) as u64)
            .saturating_sub(TOKEN_REFRESH_SLACK);
        let header = format!("Bearer {}", token.access_token());
        *cached = Some(CachedToken {
            header: header.clone(),
            acquired: Instant::now(),
            ttl,
        });

        Ok(header)
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{BASE_URL}/storage/v1/b/{}/o/{}",
            self.bucket,
            utf8_percent_encode(key, OBJECT_NAME)
        )
    }

    fn media_upload_url(&self, key: &str) -> String {
        format!(
            "{BASE_URL}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.bucket,
            utf8_percent_encode(key, OBJECT_NAME)
        )
    }

    /// Checks a response status, mapping 401/403 to authentication errors
    /// and anything else non-successful to an unexpected-response error.
    fn check(
        operation: &'static str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else if status.as_u16() == 401 || status.as_u16() == 403 {
            Err(StoreError::Auth {
                reason: format!("'{operation}' was denied with status {status}"),
            })
        } else {
            Err(StoreError::UnexpectedResponse {
                operation,
                status: status.as_u16(),
            })
        }
    }

    /// Uploads one object via the media endpoint, then patches its user
    /// metadata on when present.
    async fn upload_object(
        &self,
        operation: &'static str,
        key: &str,
        metadata: &BlobMetadata,
        body: Bytes,
    ) -> Result<(), StoreError> {
        let bearer = self.bearer().await?;
        let content_type = metadata
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let response = self
            .http
            .post(self.media_upload_url(key))
            .header(reqwest::header::AUTHORIZATION, bearer.as_str())
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(|err| Self::io_error(operation, err))?;
        Self::check(operation, response)?;

        if !metadata.user_metadata.is_empty() {
            let response = self
                .http
                .patch(self.object_url(key))
                .header(reqwest::header::AUTHORIZATION, bearer.as_str())
                .json(&json!({ "metadata": &metadata.user_metadata }))
                .send()
                .await
                .map_err(|err| Self::io_error(operation, err))?;
            Self::check(operation, response)?;
        }

        Ok(())
    }

    /// Composes `sources` into `destination`, carrying the final metadata.
    async fn compose(
        &self,
        destination: &str,
        sources: &[String],
        metadata: &BlobMetadata,
    ) -> Result<(), StoreError> {
        let bearer = self.bearer().await?;
        let source_objects = sources
            .iter()
            .map(|name| json!({ "name": name }))
            .collect::<Vec<_>>();
        let body = json!({
            "sourceObjects": source_objects,
            "destination": {
                "contentType": metadata
                    .content_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                "metadata": &metadata.user_metadata,
            },
        });

        let response = self
            .http
            .post(format!("{}/compose", self.object_url(destination)))
            .header(reqwest::header::AUTHORIZATION, bearer)
            .json(&body)
            .send()
            .await
            .map_err(|err| Self::io_error("complete_multipart_upload", err))?;
        Self::check("complete_multipart_upload", response)?;
        Ok(())
    }

    /// Deletes one object, treating 404 as success.
    async fn delete_object(&self, operation: &'static str, key: &str) -> Result<(), StoreError> {
        let bearer = self.bearer().await?;
        let response = self
            .http
            .delete(self.object_url(key))
            .header(reqwest::header::AUTHORIZATION, bearer)
            .send()
            .await
            .map_err(|err| Self::io_error(operation, err))?;
        if response.status().as_u16() == 404 {
            return Ok(());
        }
        Self::check(operation, response)?;
        Ok(())
    }

    fn part_object_name(upload: &MultipartUpload, part_number: i32) -> String {
        format!("{}.part-{part_number:05}", upload.upload_id)
    }
}

#[async_trait]
impl BlobStore for GcsBlobStore {
    async fn create_bucket(&self) -> Result<bool, StoreError> {
        let bearer = self.bearer().await?;
        let response = self
            .http
            .post(format!(
                "{BASE_URL}/storage/v1/b?project={}",
                self.credentials.project()
            ))
            .header(reqwest::header::AUTHORIZATION, bearer)
            .json(&json!({ "name": &self.bucket }))
            .send()
            .await
            .map_err(|err| Self::io_error("create_bucket", err))?;
        if response.status().as_u16() == 409 {
            return Ok(false);
        }
        Self::check("create_bucket", response)?;
        Ok(true)
    }

    async fn delete_bucket(&self) -> Result<(), StoreError> {
        let bearer = self.bearer().await?;
        let response = self
            .http
            .delete(format!("{BASE_URL}/storage/v1/b/{}", self.bucket))
            .header(reqwest::header::AUTHORIZATION, bearer)
            .send()
            .await
            .map_err(|err| Self::io_error("delete_bucket", err))?;
        Self::check("delete_bucket", response)?;
        Ok(())
    }

    async fn initiate_multipart_upload(
        &self,
        key: &str,
        metadata: &BlobMetadata,
    ) -> Result<MultipartUpload, StoreError> {
        // Nothing to tell GCS yet; the metadata lands on the composed object
        // at completion time.
        let upload = MultipartUpload {
            key: key.to_string(),
            upload_id: format!("{key}.mpu"),
        };
        self.uploads.lock().insert(
            upload.upload_id.clone(),
            UploadState {
                metadata: metadata.clone(),
                part_objects: Vec::new(),
            },
        );
        Ok(upload)
    }

    async fn upload_part(
        &self,
        upload: &MultipartUpload,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart, StoreError> {
        let name = Self::part_object_name(upload, part_number);
        self.upload_object(
            "upload_part",
            &name,
            &BlobMetadata::new("application/octet-stream"),
            body,
        )
        .await?;

        if let Some(state) = self.uploads.lock().get_mut(&upload.upload_id) {
            state.part_objects.push(name.clone());
        }

        Ok(UploadedPart {
            part_number,
            etag: name,
        })
    }

    async fn complete_multipart_upload(
        &self,
        upload: &MultipartUpload,
        mut parts: Vec<UploadedPart>,
    ) -> Result<(), StoreError> {
        parts.sort_by_key(|part| part.part_number);
        let part_names = parts.into_iter().map(|part| part.etag).collect::<Vec<_>>();

        // The composed object carries the metadata handed over at initiate
        // time, matching what a native multipart completion would stamp.
        let metadata = self
            .uploads
            .lock()
            .get(&upload.upload_id)
            .map(|state| state.metadata.clone())
            .unwrap_or_else(|| BlobMetadata::new("application/octet-stream"));

        let mut composed: Option<String> = None;
        let mut remaining = part_names.as_slice();
        while !remaining.is_empty() {
            let mut sources = Vec::with_capacity(COMPOSE_FAN_IN);
            if let Some(prev) = composed.take() {
                sources.push(prev);
            }
            let take = (COMPOSE_FAN_IN - sources.len()).min(remaining.len());
            sources.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];

            self.compose(&upload.key, &sources, &metadata).await?;
            composed = Some(upload.key.clone());
        }

        // Best effort: the composed object is already complete, so a failed
        // part cleanup only leaves temporary garbage behind.
        for name in &part_names {
            if let Err(error) = self.delete_object("complete_multipart_upload", name).await {
                warn!(part_object = %name, %error, "Failed to delete composed part object.");
            }
        }
        self.uploads.lock().remove(&upload.upload_id);

        Ok(())
    }

    async fn abort_multipart_upload(&self, upload: &MultipartUpload) -> Result<(), StoreError> {
        let part_objects = self
            .uploads
            .lock()
            .remove(&upload.upload_id)
            .map(|state| state.part_objects)
            .unwrap_or_default();
        for name in part_objects {
            self.delete_object("abort_multipart_upload", &name).await?;
        }
        Ok(())
    }

    async fn put_blob(
        &self,
        key: &str,
        metadata: &BlobMetadata,
        body: Bytes,
    ) -> Result<(), StoreError> {
        self.upload_object("put_blob", key, metadata, body).await
    }

    async fn get_blob(&self, key: &str) -> Result<Blob, StoreError> {
        let bearer = self.bearer().await?;

        let response = self
            .http
            .get(format!("{}?alt=json", self.object_url(key)))
            .header(reqwest::header::AUTHORIZATION, bearer.as_str())
            .send()
            .await
            .map_err(|err| Self::io_error("get_blob", err))?;
        if response.status().as_u16() == 404 {
            return Err(StoreError::NotFound {
                key: key.to_string(),
            });
        }
        let resource: ObjectResource = Self::check("get_blob", response)?
            .json()
            .await
            .map_err(|err| Self::io_error("get_blob", err))?;

        let response = self
            .http
            .get(format!("{}?alt=media", self.object_url(key)))
            .header(reqwest::header::AUTHORIZATION, bearer.as_str())
            .send()
            .await
            .map_err(|err| Self::io_error("get_blob", err))?;
        let body = Self::check("get_blob", response)?
            .bytes()
            .await
            .map_err(|err| Self::io_error("get_blob", err))?;

        Ok(Blob {
            user_metadata: resource.metadata,
            body,
        })
    }

    async fn get_blob_range(&self, key: &str, range: Range<u64>) -> Result<Bytes, StoreError> {
        let bearer = self.bearer().await?;
        let response = self
            .http
            .get(format!("{}?alt=media", self.object_url(key)))
            .header(reqwest::header::AUTHORIZATION, bearer)
            .header(reqwest::header::RANGE, http_range(&range))
            .send()
            .await
            .map_err(|err| Self::io_error("get_blob_range", err))?;
        if response.status().as_u16() == 404 {
            return Err(StoreError::NotFound {
                key: key.to_string(),
            });
        }
        Self::check("get_blob_range", response)?
            .bytes()
            .await
            .map_err(|err| Self::io_error("get_blob_range", err))
    }

    async fn remove_blobs(&self, keys: &[String]) -> Result<(), StoreError> {
        for key in keys {
            self.delete_object("remove_blobs", key).await?;
        }
        Ok(())
    }
}
