//! End-to-end offload scenarios against the in-memory store.

use std::{collections::HashMap, sync::Arc};

use blobstore::memory::MemoryBlobStore;
use ledger_offload::{
    block::{DataBlockHeader, DATA_BLOCK_HEADER_LEN, ENTRY_HEADER_LEN},
    data_object_key, index_object_key,
    index::OffloadIndex,
    test_util::MemoryLedger,
    BlobStoreOffloader, LedgerReader, OffloadConfig, OffloadError, ReadError,
    FORMAT_VERSION_KEY,
};
use pretty_assertions::assert_eq;
use uuid::Uuid;

const MIB: u64 = 1024 * 1024;

fn trace_init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn engine(
    store: &MemoryBlobStore,
    max_block_size: u64,
    read_buffer_size: u64,
) -> BlobStoreOffloader {
    let mut config = OffloadConfig::new("s3", "tiered");
    config.max_block_size = max_block_size;
    config.read_buffer_size = read_buffer_size;
    BlobStoreOffloader::with_store(Arc::new(store.clone()), &config)
}

async fn offload(engine: &BlobStoreOffloader, ledger: &MemoryLedger) -> Uuid {
    let uid = Uuid::new_v4();
    engine
        .offload(Arc::new(ledger.clone()), uid, HashMap::new())
        .await
        .expect("offload succeeds");
    uid
}

#[tokio::test]
async fn empty_ledger_fails_with_invalid_argument() {
    let store = MemoryBlobStore::new();
    let engine = engine(&store, 5 * MIB, MIB);
    let ledger = Arc::new(MemoryLedger::closed(1, &[]));

    let result = engine.offload(ledger, Uuid::new_v4(), HashMap::new()).await;
    assert!(matches!(result, Err(OffloadError::InvalidArgument { .. })));
}

#[tokio::test]
async fn open_ledger_fails_with_invalid_argument() {
    let store = MemoryBlobStore::new();
    let engine = engine(&store, 5 * MIB, MIB);
    let ledger = Arc::new(MemoryLedger::open(2, &[100, 200]));

    let result = engine.offload(ledger, Uuid::new_v4(), HashMap::new()).await;
    assert!(matches!(result, Err(OffloadError::InvalidArgument { .. })));
}

#[tokio::test]
async fn small_ledger_lands_in_a_single_block() {
    let store = MemoryBlobStore::new();
    let engine = engine(&store, 5 * MIB, MIB);
    let ledger = MemoryLedger::closed(3, &[100, 200, 300]);
    let uid = offload(&engine, &ledger).await;

    let index_blob = store.blob(&index_object_key(&uid, 3)).expect("index exists");
    let index = OffloadIndex::decode(index_blob.body).unwrap();
    assert_eq!(index.entries().len(), 1);
    assert_eq!(index.entries()[0].first_entry_id, 0);
    assert_eq!(index.entries()[0].part_id, 1);
    assert_eq!(index.entries()[0].block_offset, 0);

    // The final (only) block is trimmed to exactly its content.
    let expected_len = (DATA_BLOCK_HEADER_LEN + 3 * ENTRY_HEADER_LEN + 600) as u64;
    assert_eq!(index.data_object_len(), expected_len);
    let data_blob = store.blob(&data_object_key(&uid, 3)).expect("data exists");
    assert_eq!(data_blob.body.len() as u64, expected_len);
}

#[tokio::test]
async fn one_byte_overflow_splits_into_two_blocks() {
    // Entries 0..=16 are 16 KiB each; entry 17 is sized so that the framed
    // ledger would exceed one 5 MiB block by exactly one byte.
    let uniform = 16 * 1024usize;
    let through_16 = DATA_BLOCK_HEADER_LEN + 17 * (ENTRY_HEADER_LEN + uniform);
    let last = 5 * MIB as usize + 1 - through_16 - ENTRY_HEADER_LEN;
    let mut lengths = vec![uniform; 17];
    lengths.push(last);

    let store = MemoryBlobStore::new();
    let engine = engine(&store, 5 * MIB, MIB);
    let ledger = MemoryLedger::closed(4, &lengths);
    let uid = offload(&engine, &ledger).await;

    let index_blob = store.blob(&index_object_key(&uid, 4)).expect("index exists");
    let index = OffloadIndex::decode(index_blob.body).unwrap();
    assert_eq!(index.entries().len(), 2);
    assert_eq!(
        (
            index.entries()[0].first_entry_id,
            index.entries()[0].part_id,
            index.entries()[0].block_offset,
        ),
        (0, 1, 0)
    );
    assert_eq!(
        (
            index.entries()[1].first_entry_id,
            index.entries()[1].part_id,
            index.entries()[1].block_offset,
        ),
        (17, 2, 5 * MIB)
    );

    // Block 1 is exactly the full block size; the data object length equals
    // the sum of both recorded block sizes.
    assert_eq!(index.block_len(0), 5 * MIB);
    let data_blob = store.blob(&data_object_key(&uid, 4)).expect("data exists");
    assert_eq!(data_blob.body.len() as u64, index.data_object_len());

    // And the split ledger still reads back byte-identically.
    let mut handle = engine.read_offloaded(4, uid).await.unwrap();
    let entries = handle.read(0, 17).await.unwrap();
    assert_eq!(entries.len(), 18);
    for (entry, payload) in entries.iter().zip(ledger.payloads()) {
        assert_eq!(&entry.payload, payload);
    }
}

#[tokio::test]
async fn part_upload_failure_aborts_and_leaves_no_index() {
    trace_init();
    let store = MemoryBlobStore::new();
    let engine = engine(&store, 8 * 1024, MIB);
    // Enough 1 KiB entries to need more than three 8 KiB blocks.
    let ledger = MemoryLedger::closed(5, &[1024; 40]);
    let uid = Uuid::new_v4();

    store.fail_upload_part(3);
    let result = engine
        .offload(Arc::new(ledger.clone()), uid, HashMap::new())
        .await;
    assert!(matches!(
        result,
        Err(OffloadError::Io {
            operation: "upload_part",
            ..
        })
    ));

    assert_eq!(store.aborted_uploads(), 1);
    assert!(!store.contains(&index_object_key(&uid, 5)));
    assert!(!store.contains(&data_object_key(&uid, 5)));

    // The same ledger offloads fine once the fault clears.
    offload(&engine, &ledger).await;
}

#[tokio::test]
async fn completion_failure_leaves_no_index() {
    let store = MemoryBlobStore::new();
    let engine = engine(&store, 8 * 1024, MIB);
    let ledger = Arc::new(MemoryLedger::closed(6, &[512; 8]));
    let uid = Uuid::new_v4();

    store.fail_complete();
    let result = engine.offload(ledger, uid, HashMap::new()).await;
    assert!(matches!(
        result,
        Err(OffloadError::Io {
            operation: "complete_multipart_upload",
            ..
        })
    ));
    assert!(!store.contains(&index_object_key(&uid, 6)));
}

#[tokio::test]
async fn index_upload_failure_removes_the_orphaned_data_object() {
    let store = MemoryBlobStore::new();
    let engine = engine(&store, 8 * 1024, MIB);
    let ledger = Arc::new(MemoryLedger::closed(7, &[512; 8]));
    let uid = Uuid::new_v4();

    store.fail_put_blob(index_object_key(&uid, 7));
    let result = engine.offload(ledger, uid, HashMap::new()).await;
    assert!(matches!(
        result,
        Err(OffloadError::Io {
            operation: "put_index",
            ..
        })
    ));
    assert!(!store.contains(&index_object_key(&uid, 7)));
    assert!(!store.contains(&data_object_key(&uid, 7)));
}

#[tokio::test]
async fn corrupt_index_magic_fails_the_open() {
    let store = MemoryBlobStore::new();
    let engine = engine(&store, 8 * 1024, MIB);
    let ledger = MemoryLedger::closed(8, &[256; 16]);
    let uid = offload(&engine, &ledger).await;

    store.mutate_blob(&index_object_key(&uid, 8), |body| body[0] ^= 0xff);
    let result = engine.read_offloaded(8, uid).await;
    assert!(matches!(result, Err(ReadError::CorruptIndex { .. })));
}

#[tokio::test]
async fn foreign_format_version_fails_the_open() {
    let store = MemoryBlobStore::new();
    let engine = engine(&store, 8 * 1024, MIB);
    let ledger = MemoryLedger::closed(9, &[256; 16]);
    let uid = offload(&engine, &ledger).await;

    store.set_user_metadata(&index_object_key(&uid, 9), FORMAT_VERSION_KEY, "2");
    let result = engine.read_offloaded(9, uid).await;
    assert!(matches!(
        result,
        Err(ReadError::IncompatibleVersion { found: Some(v), .. }) if v == "2"
    ));
}

#[tokio::test]
async fn missing_offload_fails_the_open_with_io() {
    let store = MemoryBlobStore::new();
    let engine = engine(&store, 8 * 1024, MIB);

    let result = engine.read_offloaded(10, Uuid::new_v4()).await;
    assert!(matches!(result, Err(ReadError::Io { .. })));
}

#[tokio::test]
async fn round_trip_reproduces_every_entry() {
    trace_init();
    let store = MemoryBlobStore::new();
    // A small read buffer forces the handle to refill repeatedly.
    let engine = engine(&store, 8 * 1024, 4 * 1024);
    let lengths = (0..96).map(|i| 64 + (i * 37) % 1500).collect::<Vec<_>>();
    let ledger = MemoryLedger::closed(11, &lengths);
    let uid = offload(&engine, &ledger).await;

    let mut handle = engine.read_offloaded(11, uid).await.unwrap();
    assert_eq!(handle.id(), 11);
    assert_eq!(handle.length(), ledger.length());
    assert_eq!(handle.last_add_confirmed(), 95);
    assert_eq!(handle.ledger_metadata(), &ledger.metadata());

    let entries = handle.read(0, 95).await.unwrap();
    assert_eq!(entries.len(), 96);
    for (i, (entry, payload)) in entries.iter().zip(ledger.payloads()).enumerate() {
        assert_eq!(entry.entry_id, i as i64);
        assert_eq!(&entry.payload, payload);
    }
    assert!(store.ranged_gets() > 1);

    // Sub-ranges and single entries work from the same handle.
    let middle = handle.read(40, 44).await.unwrap();
    assert_eq!(middle.len(), 5);
    assert_eq!(middle[0].entry_id, 40);
    assert_eq!(&middle[0].payload, &ledger.payloads()[40]);

    let single = handle.read(95, 95).await.unwrap();
    assert_eq!(&single[0].payload, &ledger.payloads()[95]);

    // Past-the-end reads are rejected outright.
    assert!(matches!(
        handle.read(90, 96).await,
        Err(ReadError::EntryOutOfRange { entry_id: 96 })
    ));
    assert!(matches!(
        handle.read(5, 4).await,
        Err(ReadError::EntryOutOfRange { .. })
    ));
}

#[tokio::test]
async fn index_matches_the_bytes_on_the_object() {
    let store = MemoryBlobStore::new();
    let engine = engine(&store, 8 * 1024, MIB);
    let ledger = MemoryLedger::closed(12, &[700; 64]);
    let uid = offload(&engine, &ledger).await;

    let index_blob = store.blob(&index_object_key(&uid, 12)).unwrap();
    let index = OffloadIndex::decode(index_blob.body).unwrap();
    let data = store.blob(&data_object_key(&uid, 12)).unwrap().body;
    assert_eq!(data.len() as u64, index.data_object_len());

    let entries = index.entries();
    assert!(entries.len() > 1);
    for (position, entry) in entries.iter().enumerate() {
        assert_eq!(entry.part_id, position as u32 + 1);
        // Offsets are multiples of the block size; every block before the
        // last is full-sized.
        assert_eq!(entry.block_offset, position as u64 * 8 * 1024);
        if position + 1 < entries.len() {
            assert_eq!(index.block_len(position), 8 * 1024);
            assert!(entries[position + 1].first_entry_id > entry.first_entry_id);
        }

        // The block header on the object agrees with the index.
        let mut at = data.slice(entry.block_offset as usize..);
        let header = DataBlockHeader::decode(&mut at).unwrap();
        assert_eq!(header.first_entry_id, entry.first_entry_id);
        assert_eq!(header.block_len, index.block_len(position));
    }
}

#[tokio::test]
async fn caller_metadata_rides_along_without_displacing_version_headers() {
    let store = MemoryBlobStore::new();
    let engine = engine(&store, 8 * 1024, MIB);
    let ledger = Arc::new(MemoryLedger::closed(13, &[256; 4]));
    let uid = Uuid::new_v4();

    let mut extra = HashMap::new();
    extra.insert("Managed-Ledger".to_string(), "tenant/ns/topic".to_string());
    engine.offload(ledger, uid, extra).await.unwrap();

    let blob = store.blob(&data_object_key(&uid, 13)).unwrap();
    assert_eq!(
        blob.user_metadata.get("managed-ledger").map(String::as_str),
        Some("tenant/ns/topic")
    );
    assert_eq!(
        blob.user_metadata.get(FORMAT_VERSION_KEY).map(String::as_str),
        Some("1")
    );

    // The index object carries only the reserved headers; caller extras
    // stay on the data object.
    let index_blob = store.blob(&index_object_key(&uid, 13)).unwrap();
    assert!(!index_blob.user_metadata.contains_key("managed-ledger"));
    assert_eq!(
        index_blob
            .user_metadata
            .get(FORMAT_VERSION_KEY)
            .map(String::as_str),
        Some("1")
    );
}
