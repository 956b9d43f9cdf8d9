//! Object-store abstraction for the ledger offload engine.
//!
//! This crate defines the narrow capability set the engine requires from an
//! object store (bucket administration, multipart upload, single-object
//! put/get with user metadata, ranged reads, bulk removal) and provides the
//! production adapters for S3-compatible stores and Google Cloud Storage,
//! plus an in-memory adapter for tests.
//!
//! Adapters are bound to a single bucket at construction time: an engine
//! instance owns exactly one bucket, and every adapter (with its underlying
//! HTTP client pool) is shared across all of the engine's execution lanes.

#[macro_use]
extern crate tracing;

use std::{collections::HashMap, error::Error, ops::Range};

use async_trait::async_trait;
use bytes::Bytes;
use snafu::Snafu;

pub mod gcs;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod s3;

pub use gcs::GcsBlobStore;
pub use s3::S3BlobStore;

/// Error that occurred during a call to a [`BlobStore`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// The requested object does not exist in the bucket.
    #[snafu(display("object '{key}' not found"))]
    NotFound { key: String },

    /// A transport-level failure talking to the object store.
    ///
    /// Covers connection failures, timeouts, and any service error that is
    /// not given a more specific variant. The driver has already exhausted
    /// its internal retries by the time this surfaces.
    #[snafu(display("object store operation '{operation}' failed: {source}"))]
    Io {
        operation: &'static str,
        source: Box<dyn Error + Send + Sync>,
    },

    /// Credential material was missing or rejected.
    #[snafu(display("object store authentication failed: {reason}"))]
    Auth { reason: String },

    /// The store answered with a status the adapter does not expect.
    #[snafu(display("object store operation '{operation}' answered {status}"))]
    UnexpectedResponse { operation: &'static str, status: u16 },
}

impl StoreError {
    /// Whether this error means the target object was absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Metadata attached to an object at write time.
///
/// User metadata keys are normalized to lowercase before they are handed to
/// the driver, since most drivers lowercase header-borne keys on their own.
#[derive(Clone, Debug, Default)]
pub struct BlobMetadata {
    pub content_type: Option<String>,
    pub user_metadata: HashMap<String, String>,
}

impl BlobMetadata {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            user_metadata: HashMap::new(),
        }
    }

    /// Adds a user-metadata entry, lowercasing the key.
    pub fn with_user_metadata(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.user_metadata
            .insert(key.as_ref().to_lowercase(), value.into());
        self
    }

    /// Merges a map of user metadata, lowercasing every key.
    pub fn with_user_metadata_map(mut self, map: &HashMap<String, String>) -> Self {
        for (key, value) in map {
            self.user_metadata
                .insert(key.to_lowercase(), value.clone());
        }
        self
    }
}

/// An object fetched from the store: its user metadata plus its bytes.
#[derive(Clone, Debug)]
pub struct Blob {
    pub user_metadata: HashMap<String, String>,
    pub body: Bytes,
}

/// Handle for an in-progress multipart upload.
#[derive(Clone, Debug)]
pub struct MultipartUpload {
    pub key: String,
    pub upload_id: String,
}

/// A part that has been uploaded and must be named on completion.
#[derive(Clone, Debug)]
pub struct UploadedPart {
    pub part_number: i32,
    pub etag: String,
}

/// The object-store capability set required by the offload engine.
///
/// One implementation instance maps to one bucket. All methods may block for
/// seconds on network I/O and are expected to be called from a context that
/// tolerates that (the engine runs them on per-ledger lanes).
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Creates the bucket this store is bound to.
    ///
    /// Returns `false` when the bucket already existed and is owned by the
    /// caller, `true` when it was created by this call.
    async fn create_bucket(&self) -> Result<bool, StoreError>;

    /// Deletes the bucket this store is bound to.
    async fn delete_bucket(&self) -> Result<(), StoreError>;

    /// Starts a multipart upload for `key`, stamping `metadata` onto the
    /// final object.
    async fn initiate_multipart_upload(
        &self,
        key: &str,
        metadata: &BlobMetadata,
    ) -> Result<MultipartUpload, StoreError>;

    /// Uploads one part. Part numbers start at 1 and must be presented to
    /// [`complete_multipart_upload`](BlobStore::complete_multipart_upload)
    /// in ascending order.
    async fn upload_part(
        &self,
        upload: &MultipartUpload,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart, StoreError>;

    /// Completes a multipart upload from its uploaded parts.
    async fn complete_multipart_upload(
        &self,
        upload: &MultipartUpload,
        parts: Vec<UploadedPart>,
    ) -> Result<(), StoreError>;

    /// Aborts a multipart upload, discarding any uploaded parts.
    async fn abort_multipart_upload(&self, upload: &MultipartUpload) -> Result<(), StoreError>;

    /// Writes a whole object in a single request.
    async fn put_blob(
        &self,
        key: &str,
        metadata: &BlobMetadata,
        body: Bytes,
    ) -> Result<(), StoreError>;

    /// Fetches a whole object along with its user metadata.
    async fn get_blob(&self, key: &str) -> Result<Blob, StoreError>;

    /// Fetches `range` (half-open, in bytes) of an object.
    async fn get_blob_range(&self, key: &str, range: Range<u64>) -> Result<Bytes, StoreError>;

    /// Removes the given objects. Keys that do not exist are ignored.
    async fn remove_blobs(&self, keys: &[String]) -> Result<(), StoreError>;
}

/// Formats a half-open byte range as an HTTP `Range` header value.
pub(crate) fn http_range(range: &Range<u64>) -> String {
    // HTTP ranges are inclusive on both ends.
    format!("bytes={}-{}", range.start, range.end.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_keys_are_lowercased() {
        let metadata = BlobMetadata::new("application/octet-stream")
            .with_user_metadata("Offload-Format-Version", "1");
        assert_eq!(
            metadata.user_metadata.get("offload-format-version"),
            Some(&"1".to_string())
        );
    }

    #[test]
    fn range_header_is_inclusive() {
        assert_eq!(http_range(&(0..1024)), "bytes=0-1023");
        assert_eq!(http_range(&(5..6)), "bytes=5-5");
    }
}
