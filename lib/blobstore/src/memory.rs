//! In-memory [`BlobStore`] used by tests.
//!
//! Behaves like a single-bucket object store: whole-object puts, multipart
//! uploads that only become visible on completion, ranged gets, and benign
//! removal of missing keys. Failures can be injected at the operations the
//! offload compensation paths care about, and a few counters are tracked so
//! tests can assert on what actually happened on the wire.

use std::{
    collections::{BTreeMap, HashMap},
    ops::Range,
    sync::Arc,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use super::{Blob, BlobMetadata, BlobStore, MultipartUpload, StoreError, UploadedPart};

/// A stored object: user metadata plus body.
#[derive(Clone, Debug)]
pub struct StoredBlob {
    pub user_metadata: HashMap<String, String>,
    pub body: Bytes,
}

struct PendingUpload {
    key: String,
    metadata: HashMap<String, String>,
    parts: BTreeMap<i32, Bytes>,
}

#[derive(Default)]
struct Failures {
    upload_part: Option<i32>,
    complete: bool,
    put_blob: Option<String>,
}

#[derive(Default)]
struct State {
    blobs: HashMap<String, StoredBlob>,
    uploads: HashMap<String, PendingUpload>,
    next_upload_id: u64,
    aborted_uploads: usize,
    ranged_gets: usize,
}

/// In-memory mock store with failure injection.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    state: Arc<Mutex<State>>,
    failures: Arc<Mutex<Failures>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the upload of the given part number fail once per offload.
    pub fn fail_upload_part(&self, part_number: i32) {
        self.failures.lock().upload_part = Some(part_number);
    }

    /// Makes the next multipart completion fail.
    pub fn fail_complete(&self) {
        self.failures.lock().complete = true;
    }

    /// Makes the next whole-object put of `key` fail.
    pub fn fail_put_blob(&self, key: impl Into<String>) {
        self.failures.lock().put_blob = Some(key.into());
    }

    /// Whether an object exists under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().blobs.contains_key(key)
    }

    /// Snapshot of the object stored under `key`.
    pub fn blob(&self, key: &str) -> Option<StoredBlob> {
        self.state.lock().blobs.get(key).cloned()
    }

    /// Rewrites the body of a stored object in place, for corruption tests.
    pub fn mutate_blob(&self, key: &str, mutate: impl FnOnce(&mut BytesMut)) {
        let mut state = self.state.lock();
        if let Some(stored) = state.blobs.get_mut(key) {
            let mut body = BytesMut::from(&stored.body[..]);
            mutate(&mut body);
            stored.body = body.freeze();
        }
    }

    /// Overwrites a single user-metadata entry on a stored object.
    pub fn set_user_metadata(&self, key: &str, meta_key: &str, meta_value: &str) {
        let mut state = self.state.lock();
        if let Some(stored) = state.blobs.get_mut(key) {
            stored
                .user_metadata
                .insert(meta_key.to_lowercase(), meta_value.to_string());
        }
    }

    /// Number of multipart uploads that have been aborted.
    pub fn aborted_uploads(&self) -> usize {
        self.state.lock().aborted_uploads
    }

    /// Number of ranged gets served.
    pub fn ranged_gets(&self) -> usize {
        self.state.lock().ranged_gets
    }

    fn injected(operation: &'static str) -> StoreError {
        StoreError::Io {
            operation,
            source: "injected failure".into(),
        }
    }

    fn lowercased(metadata: &BlobMetadata) -> HashMap<String, String> {
        // Real drivers normalize header-borne metadata keys to lowercase.
        metadata
            .user_metadata
            .iter()
            .map(|(key, value)| (key.to_lowercase(), value.clone()))
            .collect()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn create_bucket(&self) -> Result<bool, StoreError> {
        Ok(true)
    }

    async fn delete_bucket(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn initiate_multipart_upload(
        &self,
        key: &str,
        metadata: &BlobMetadata,
    ) -> Result<MultipartUpload, StoreError> {
        let mut state = self.state.lock();
        state.next_upload_id += 1;
        let upload_id = format!("mpu-{}", state.next_upload_id);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                metadata: Self::lowercased(metadata),
                parts: BTreeMap::new(),
            },
        );
        Ok(MultipartUpload {
            key: key.to_string(),
            upload_id,
        })
    }

    async fn upload_part(
        &self,
        upload: &MultipartUpload,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadedPart, StoreError> {
        {
            let mut failures = self.failures.lock();
            if failures.upload_part == Some(part_number) {
                failures.upload_part = None;
                return Err(Self::injected("upload_part"));
            }
        }

        let mut state = self.state.lock();
        let pending = state
            .uploads
            .get_mut(&upload.upload_id)
            .ok_or_else(|| StoreError::NotFound {
                key: upload.upload_id.clone(),
            })?;
        pending.parts.insert(part_number, body);
        Ok(UploadedPart {
            part_number,
            etag: format!("etag-{part_number}"),
        })
    }

    async fn complete_multipart_upload(
        &self,
        upload: &MultipartUpload,
        parts: Vec<UploadedPart>,
    ) -> Result<(), StoreError> {
        if std::mem::take(&mut self.failures.lock().complete) {
            return Err(Self::injected("complete_multipart_upload"));
        }

        let mut state = self.state.lock();
        let pending = state
            .uploads
            .remove(&upload.upload_id)
            .ok_or_else(|| StoreError::NotFound {
                key: upload.upload_id.clone(),
            })?;

        let mut body = BytesMut::new();
        for part in &parts {
            let stored = pending.parts.get(&part.part_number).ok_or_else(|| {
                StoreError::Io {
                    operation: "complete_multipart_upload",
                    source: format!("part {} was never uploaded", part.part_number).into(),
                }
            })?;
            body.extend_from_slice(stored);
        }

        state.blobs.insert(
            pending.key,
            StoredBlob {
                user_metadata: pending.metadata,
                body: body.freeze(),
            },
        );
        Ok(())
    }

    async fn abort_multipart_upload(&self, upload: &MultipartUpload) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.uploads.remove(&upload.upload_id);
        state.aborted_uploads += 1;
        Ok(())
    }

    async fn put_blob(
        &self,
        key: &str,
        metadata: &BlobMetadata,
        body: Bytes,
    ) -> Result<(), StoreError> {
        {
            let mut failures = self.failures.lock();
            if failures.put_blob.as_deref() == Some(key) {
                failures.put_blob = None;
                return Err(Self::injected("put_blob"));
            }
        }

        self.state.lock().blobs.insert(
            key.to_string(),
            StoredBlob {
                user_metadata: Self::lowercased(metadata),
                body,
            },
        );
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> Result<Blob, StoreError> {
        let state = self.state.lock();
        let stored = state.blobs.get(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;
        Ok(Blob {
            user_metadata: stored.user_metadata.clone(),
            body: stored.body.clone(),
        })
    }

    async fn get_blob_range(&self, key: &str, range: Range<u64>) -> Result<Bytes, StoreError> {
        let mut state = self.state.lock();
        state.ranged_gets += 1;
        let stored = state.blobs.get(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;

        let len = stored.body.len() as u64;
        if range.start >= len || range.start >= range.end {
            return Err(StoreError::UnexpectedResponse {
                operation: "get_blob_range",
                status: 416,
            });
        }
        let end = range.end.min(len);
        Ok(stored.body.slice(range.start as usize..end as usize))
    }

    async fn remove_blobs(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        for key in keys {
            state.blobs.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn multipart_upload_is_invisible_until_completed() {
        let store = MemoryBlobStore::new();
        let metadata = BlobMetadata::new("application/octet-stream");
        let upload = store
            .initiate_multipart_upload("data", &metadata)
            .await
            .unwrap();

        let part = store
            .upload_part(&upload, 1, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert!(!store.contains("data"));

        store
            .complete_multipart_upload(&upload, vec![part])
            .await
            .unwrap();
        assert_eq!(store.blob("data").unwrap().body, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn ranged_get_clamps_to_object_length() {
        let store = MemoryBlobStore::new();
        store
            .put_blob(
                "blob",
                &BlobMetadata::new("application/octet-stream"),
                Bytes::from_static(b"0123456789"),
            )
            .await
            .unwrap();

        let bytes = store.get_blob_range("blob", 5..100).await.unwrap();
        assert_eq!(bytes, Bytes::from_static(b"56789"));
    }
}
