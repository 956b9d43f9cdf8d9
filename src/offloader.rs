//! Object-tier offloader.
//!
//! Orchestrates the three per-ledger operations (offload, open a read
//! handle, delete) plus bucket administration. Per-ledger operations are
//! serialized on the execution lane owned by the ledger ID; different
//! ledgers proceed concurrently.
//!
//! An offload is a multipart upload of the data object followed by a single
//! put of the index object. The index object is the commit point: until it
//! exists, nothing observes the offload, and a data object without an index
//! is garbage an external sweeper may reap. Compensation on failure is best
//! effort and never masks the primary error.

use std::{collections::HashMap, sync::Arc};

use blobstore::{
    gcs::{GcsBlobStore, GcsOptions},
    s3::{S3BlobStore, S3Options},
    BlobMetadata, BlobStore, MultipartUpload, StoreError, UploadedPart,
};
use snafu::Snafu;
use uuid::Uuid;

use crate::{
    block::{self, BlockError, BlockStream, DATA_BLOCK_HEADER_LEN, NO_ENTRY},
    config::{ConfigError, Driver, OffloadConfig},
    data_object_key, index_object_key,
    index::OffloadIndexBuilder,
    lanes::LaneSet,
    ledger::LedgerReader,
    read::{BackedReadHandle, ReadError},
    CURRENT_FORMAT_VERSION, FORMAT_VERSION_KEY, SOFTWARE_BUILD, SOFTWARE_BUILD_KEY,
    SOFTWARE_VERSION, SOFTWARE_VERSION_KEY,
};

/// Error that occurred during an offloader operation.
#[derive(Debug, Snafu)]
pub enum OffloadError {
    /// The ledger is not eligible for offload: empty, still open, nothing
    /// confirmed, or an entry too large for the configured block size.
    /// Nothing was written; no compensation applies.
    #[snafu(display("ledger {ledger_id} cannot be offloaded: {reason}"))]
    InvalidArgument { ledger_id: u64, reason: String },

    /// Object-store failure. Any applicable compensation (multipart abort,
    /// orphaned-data removal) has already been attempted, best effort.
    #[snafu(display("object store failure during {operation}: {source}"))]
    Io {
        operation: &'static str,
        source: StoreError,
    },

    /// The source ledger failed to produce an entry.
    #[snafu(display("failed to read source ledger {ledger_id}: {source}"))]
    SourceRead {
        ledger_id: u64,
        source: std::io::Error,
    },

    /// Engine shut down before the operation ran.
    #[snafu(display("offload engine is stopped"))]
    Stopped,
}

fn io_err(operation: &'static str) -> impl FnOnce(StoreError) -> OffloadError {
    move |source| OffloadError::Io { operation, source }
}

/// Offloads closed ledgers into object storage and hands out read handles
/// over what was offloaded.
pub struct BlobStoreOffloader {
    store: Arc<dyn BlobStore>,
    max_block_size: u64,
    read_buffer_size: u64,
    lanes: LaneSet,
}

impl BlobStoreOffloader {
    /// Validates the config, selects and initializes the driver.
    ///
    /// # Errors
    ///
    /// Fails on an invalid config or on a driver that cannot initialize
    /// (for GCS that includes an unreadable service-account file).
    pub async fn new(config: OffloadConfig) -> Result<Self, ConfigError> {
        let driver = config.validate()?;
        let store: Arc<dyn BlobStore> = match driver {
            Driver::AwsS3 => Arc::new(
                S3BlobStore::connect(S3Options {
                    bucket: config.bucket.clone(),
                    region: config.region.clone(),
                    endpoint: config.endpoint.clone(),
                    access_identity: config.access_identity.clone(),
                    access_secret: config.access_secret.clone(),
                    request_timeout: config.request_timeout(),
                    max_retries: config.max_retries,
                })
                .await,
            ),
            Driver::GoogleCloudStorage => Arc::new(
                GcsBlobStore::connect(GcsOptions {
                    bucket: config.bucket.clone(),
                    // validate() guarantees the file is configured.
                    service_account_path: config
                        .service_account_file
                        .clone()
                        .expect("validated config has a service account file"),
                    request_timeout: config.request_timeout(),
                })
                .map_err(|source| ConfigError::DriverInit { source })?,
            ),
        };

        Ok(Self::with_store(store, &config))
    }

    /// Builds an offloader over an already-constructed store. The config is
    /// trusted as-is; used by tests and by embedders bringing their own
    /// adapter.
    pub fn with_store(store: Arc<dyn BlobStore>, config: &OffloadConfig) -> Self {
        Self {
            store,
            max_block_size: config.max_block_size,
            read_buffer_size: config.read_buffer_size,
            lanes: LaneSet::new(config.lanes),
        }
    }

    /// Provisions the configured bucket. Returns `false` if it already
    /// existed.
    pub async fn create_bucket(&self) -> Result<bool, OffloadError> {
        self.store
            .create_bucket()
            .await
            .map_err(io_err("create_bucket"))
    }

    /// Deletes the configured bucket.
    pub async fn delete_bucket(&self) -> Result<(), OffloadError> {
        self.store
            .delete_bucket()
            .await
            .map_err(io_err("delete_bucket"))
    }

    /// Offloads a closed ledger under the caller-chosen `uid`.
    ///
    /// The ledger counts as offloaded if and only if this resolves
    /// successfully; on failure no index object exists and any partial data
    /// object is garbage.
    pub async fn offload(
        &self,
        ledger: Arc<dyn LedgerReader>,
        uid: Uuid,
        extra_metadata: HashMap<String, String>,
    ) -> Result<(), OffloadError> {
        let store = Arc::clone(&self.store);
        let max_block_size = self.max_block_size;
        let ledger_id = ledger.id();
        self.lanes
            .submit(
                ledger_id,
                offload_ledger(store, ledger, uid, extra_metadata, max_block_size),
            )
            .await
            .map_err(|_| OffloadError::Stopped)?
    }

    /// Opens a read handle over a previously offloaded ledger.
    pub async fn read_offloaded(
        &self,
        ledger_id: u64,
        uid: Uuid,
    ) -> Result<BackedReadHandle, ReadError> {
        let store = Arc::clone(&self.store);
        let read_buffer_size = self.read_buffer_size;
        self.lanes
            .submit(
                ledger_id,
                BackedReadHandle::open(
                    store,
                    data_object_key(&uid, ledger_id),
                    index_object_key(&uid, ledger_id),
                    ledger_id,
                    read_buffer_size,
                ),
            )
            .await
            .map_err(|_| ReadError::Stopped)?
    }

    /// Removes both objects of an offloaded ledger. Removing an offload
    /// that does not exist (or was already removed) succeeds.
    pub async fn delete_offloaded(&self, ledger_id: u64, uid: Uuid) -> Result<(), OffloadError> {
        let store = Arc::clone(&self.store);
        let keys = [
            data_object_key(&uid, ledger_id),
            index_object_key(&uid, ledger_id),
        ];
        self.lanes
            .submit(ledger_id, async move {
                store
                    .remove_blobs(&keys)
                    .await
                    .map_err(io_err("remove_blobs"))
            })
            .await
            .map_err(|_| OffloadError::Stopped)?
    }
}

/// The user metadata for the data object: the caller's extra entries plus
/// the engine's reserved headers, which the extras cannot displace.
fn data_object_metadata(extra: &HashMap<String, String>) -> BlobMetadata {
    BlobMetadata::new("application/octet-stream")
        .with_user_metadata_map(extra)
        .with_user_metadata(FORMAT_VERSION_KEY, CURRENT_FORMAT_VERSION.to_string())
        .with_user_metadata(SOFTWARE_VERSION_KEY, SOFTWARE_VERSION)
        .with_user_metadata(SOFTWARE_BUILD_KEY, SOFTWARE_BUILD)
}

/// The user metadata for the index object: only the reserved headers.
/// Caller-supplied extras belong on the data object alone.
fn index_object_metadata() -> BlobMetadata {
    data_object_metadata(&HashMap::new())
}

async fn offload_ledger(
    store: Arc<dyn BlobStore>,
    ledger: Arc<dyn LedgerReader>,
    uid: Uuid,
    extra_metadata: HashMap<String, String>,
    max_block_size: u64,
) -> Result<(), OffloadError> {
    let ledger_id = ledger.id();

    let reject = |reason: &str| OffloadError::InvalidArgument {
        ledger_id,
        reason: reason.to_string(),
    };
    if ledger.length() == 0 {
        return Err(reject("ledger holds no data"));
    }
    if !ledger.is_closed() {
        return Err(reject("ledger is still open"));
    }
    if ledger.last_add_confirmed() < 0 {
        return Err(reject("ledger has no confirmed entries"));
    }

    let data_key = data_object_key(&uid, ledger_id);
    let index_key = index_object_key(&uid, ledger_id);
    let data_metadata = data_object_metadata(&extra_metadata);

    let mut index_builder = OffloadIndexBuilder::new()
        .ledger_metadata(ledger.metadata())
        .data_block_header_len(DATA_BLOCK_HEADER_LEN as u32);

    let upload = store
        .initiate_multipart_upload(&data_key, &data_metadata)
        .await
        .map_err(io_err("initiate_multipart_upload"))?;
    info!(
        ledger_id,
        %uid,
        upload_id = %upload.upload_id,
        "Started ledger offload."
    );

    let (parts, data_object_len) = match upload_blocks(
        &*store,
        &*ledger,
        &upload,
        max_block_size,
        &mut index_builder,
    )
    .await
    {
        Ok(uploaded) => uploaded,
        Err(error) => {
            abort_upload(&*store, &upload, ledger_id).await;
            return Err(error);
        }
    };

    // Past this point an abort is no longer meaningful: either completion
    // fails and the upload never materializes, or it succeeds and only the
    // data object exists, which no reader can observe without an index.
    store
        .complete_multipart_upload(&upload, parts)
        .await
        .map_err(io_err("complete_multipart_upload"))?;

    let index = index_builder.data_object_len(data_object_len).build();
    if let Err(source) = store
        .put_blob(&index_key, &index_object_metadata(), index.to_bytes())
        .await
    {
        if let Err(error) = store.remove_blobs(std::slice::from_ref(&data_key)).await {
            warn!(
                ledger_id,
                %uid,
                %error,
                "Failed to remove orphaned data object after index upload failure."
            );
        }
        return Err(OffloadError::Io {
            operation: "put_index",
            source,
        });
    }

    info!(ledger_id, %uid, data_object_len, "Ledger offload committed.");
    Ok(())
}

/// Packs and uploads blocks sequentially, one part per block, recording
/// each block in the index builder. Sequential parts bound transient memory
/// to a single block and keep index order trivially correct.
async fn upload_blocks(
    store: &dyn BlobStore,
    ledger: &dyn LedgerReader,
    upload: &MultipartUpload,
    max_block_size: u64,
    index_builder: &mut OffloadIndexBuilder,
) -> Result<(Vec<UploadedPart>, u64), OffloadError> {
    let ledger_id = ledger.id();
    let last_add_confirmed = ledger.last_add_confirmed();

    let mut start_entry = 0i64;
    let mut part_id = 1u32;
    let mut entry_bytes_written = 0u64;
    let mut data_object_len = 0u64;
    let mut parts = Vec::new();

    while start_entry <= last_add_confirmed {
        let block_size =
            block::calculate_block_size(max_block_size, ledger, start_entry, entry_bytes_written);
        let stream = BlockStream::open(ledger, start_entry, block_size)
            .await
            .map_err(|err| match err {
                BlockError::EntryTooLarge { .. } => OffloadError::InvalidArgument {
                    ledger_id,
                    reason: err.to_string(),
                },
                BlockError::SourceRead { source, .. } => {
                    OffloadError::SourceRead { ledger_id, source }
                }
            })?;

        let part = store
            .upload_part(upload, part_id as i32, stream.to_bytes())
            .await
            .map_err(io_err("upload_part"))?;
        parts.push(part);
        index_builder.add_block(start_entry, part_id, stream.block_size());
        data_object_len += stream.block_size();

        debug!(
            ledger_id,
            part_id,
            block_size = stream.block_size(),
            end_entry_id = stream.end_entry_id(),
            "Uploaded block."
        );

        if stream.end_entry_id() == NO_ENTRY {
            break;
        }
        start_entry = stream.end_entry_id() + 1;
        entry_bytes_written += stream.entry_bytes_read();
        part_id += 1;
    }

    Ok((parts, data_object_len))
}

async fn abort_upload(store: &dyn BlobStore, upload: &MultipartUpload, ledger_id: u64) {
    if let Err(error) = store.abort_multipart_upload(upload).await {
        warn!(
            ledger_id,
            upload_id = %upload.upload_id,
            %error,
            "Failed to abort multipart upload after offload failure."
        );
    }
}

#[cfg(test)]
mod tests {
    use blobstore::memory::MemoryBlobStore;

    use super::*;
    use crate::test_util::MemoryLedger;

    fn offloader(store: &MemoryBlobStore, max_block_size: u64) -> BlobStoreOffloader {
        let mut config = OffloadConfig::new("s3", "tiered");
        config.max_block_size = max_block_size;
        BlobStoreOffloader::with_store(Arc::new(store.clone()), &config)
    }

    #[tokio::test]
    async fn empty_ledger_is_rejected() {
        let store = MemoryBlobStore::new();
        let engine = offloader(&store, 5 * 1024 * 1024);
        let ledger = Arc::new(MemoryLedger::closed(1, &[]));

        let result = engine.offload(ledger, Uuid::new_v4(), HashMap::new()).await;
        assert!(matches!(
            result,
            Err(OffloadError::InvalidArgument { ledger_id: 1, .. })
        ));
        assert_eq!(store.aborted_uploads(), 0);
    }

    #[tokio::test]
    async fn open_ledger_is_rejected() {
        let store = MemoryBlobStore::new();
        let engine = offloader(&store, 5 * 1024 * 1024);
        let ledger = Arc::new(MemoryLedger::open(2, &[64, 64]));

        let result = engine.offload(ledger, Uuid::new_v4(), HashMap::new()).await;
        assert!(matches!(
            result,
            Err(OffloadError::InvalidArgument { ledger_id: 2, .. })
        ));
    }

    #[tokio::test]
    async fn oversized_entry_aborts_the_upload() {
        let store = MemoryBlobStore::new();
        // Small blocks keep the test fast; with_store skips the floor.
        let engine = offloader(&store, 8 * 1024);
        let ledger = Arc::new(MemoryLedger::closed(3, &[64, 64 * 1024]));
        let uid = Uuid::new_v4();

        let result = engine.offload(ledger, uid, HashMap::new()).await;
        assert!(matches!(
            result,
            Err(OffloadError::InvalidArgument { ledger_id: 3, .. })
        ));
        assert_eq!(store.aborted_uploads(), 1);
        assert!(!store.contains(&index_object_key(&uid, 3)));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryBlobStore::new();
        let engine = offloader(&store, 8 * 1024);
        let ledger = Arc::new(MemoryLedger::closed(4, &[128; 16]));
        let uid = Uuid::new_v4();

        engine
            .offload(ledger, uid, HashMap::new())
            .await
            .expect("offload succeeds");
        assert!(store.contains(&index_object_key(&uid, 4)));

        engine.delete_offloaded(4, uid).await.expect("first delete");
        assert!(!store.contains(&data_object_key(&uid, 4)));
        assert!(!store.contains(&index_object_key(&uid, 4)));
        engine
            .delete_offloaded(4, uid)
            .await
            .expect("second delete is benign");
    }
}
