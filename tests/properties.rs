//! Property tests: any ledger that fits the block budget survives the
//! offload round trip byte-identically, and the index always agrees with
//! the bytes on the object.

use std::{collections::HashMap, sync::Arc};

use blobstore::memory::MemoryBlobStore;
use ledger_offload::{
    block::DataBlockHeader,
    data_object_key, index_object_key,
    index::OffloadIndex,
    test_util::MemoryLedger,
    BlobStoreOffloader, LedgerReader, OffloadConfig,
};
use proptest::prelude::*;
use uuid::Uuid;

const MIB: usize = 1024 * 1024;

// Keep total ledger size at or below 10 MiB.
fn capped(lengths: Vec<usize>) -> Vec<usize> {
    let mut total = 0usize;
    lengths
        .into_iter()
        .take_while(|len| {
            total += len;
            total <= 10 * MIB
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn offload_round_trip_is_lossless(
        raw_lengths in prop::collection::vec(1usize..512 * 1024, 1..128),
        block_mib in prop::sample::select(vec![5u64, 8, 16]),
    ) {
        let lengths = capped(raw_lengths);
        prop_assume!(!lengths.is_empty());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let store = MemoryBlobStore::new();
            let mut config = OffloadConfig::new("s3", "tiered");
            config.max_block_size = block_mib * MIB as u64;
            config.read_buffer_size = 256 * 1024;
            let engine = BlobStoreOffloader::with_store(Arc::new(store.clone()), &config);

            let ledger = MemoryLedger::closed(99, &lengths);
            let last = ledger.last_add_confirmed();
            let uid = Uuid::new_v4();
            engine
                .offload(Arc::new(ledger.clone()), uid, HashMap::new())
                .await
                .expect("offload succeeds");

            // Round trip: every entry comes back byte-identical.
            let mut handle = engine.read_offloaded(99, uid).await.expect("handle opens");
            let entries = handle.read(0, last).await.expect("read succeeds");
            assert_eq!(entries.len(), lengths.len());
            for (i, (entry, payload)) in entries.iter().zip(ledger.payloads()).enumerate() {
                assert_eq!(entry.entry_id, i as i64);
                assert_eq!(&entry.payload, payload, "entry {i} differs");
            }

            // The index's implied offsets match the bytes on the object.
            let data = store.blob(&data_object_key(&uid, 99)).unwrap().body;
            let index =
                OffloadIndex::decode(store.blob(&index_object_key(&uid, 99)).unwrap().body)
                    .unwrap();
            assert_eq!(data.len() as u64, index.data_object_len());
            for (position, entry) in index.entries().iter().enumerate() {
                assert_eq!(entry.part_id as usize, position + 1);
                assert_eq!(entry.block_offset % (block_mib * MIB as u64), 0);

                let mut at = data.slice(entry.block_offset as usize..);
                let header = DataBlockHeader::decode(&mut at).unwrap();
                assert_eq!(header.first_entry_id, entry.first_entry_id);
                assert_eq!(header.block_len, index.block_len(position));
            }
        });
    }
}
