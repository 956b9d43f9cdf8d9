//! Offload index block.
//!
//! The index object maps entry IDs to block locations within the data
//! object. It is written once, as the final step of an offload, and read
//! once, when a backed read handle opens. Layout (all integers big-endian):
//!
//! ```text
//! [magic:4][version:4][entryCount:4][dataHeaderLen:4][dataObjectLen:8][metadataLen:4]
//! [ledger metadata blob]
//! [firstEntryId:8][partId:4][blockOffset:8] * entryCount
//! ```
//!
//! Index entries are sorted by `firstEntryId`, strictly increasing in all
//! three fields; part IDs start at 1; block offsets are multiples of the
//! configured block size.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use snafu::Snafu;

use crate::{ledger::LedgerMetadata, CURRENT_FORMAT_VERSION};

/// Magic word opening the index object.
pub const INDEX_MAGIC: u32 = 0x4F49_4458;

/// Fixed index header length, in bytes.
pub const INDEX_HEADER_LEN: usize = 28;

/// Length of one serialized index entry.
pub const INDEX_ENTRY_LEN: usize = 20;

/// Error produced by index decoding and lookups.
#[derive(Debug, Snafu)]
pub enum IndexError {
    /// The index object's bytes do not describe a valid index.
    #[snafu(display("index object is corrupt: {reason}"))]
    CorruptIndex { reason: String },

    /// The requested entry is not covered by this index.
    #[snafu(display("entry {entry_id} is outside the offloaded ledger"))]
    EntryOutOfRange { entry_id: i64 },
}

fn corrupt(reason: impl Into<String>) -> IndexError {
    IndexError::CorruptIndex {
        reason: reason.into(),
    }
}

/// Location of one block within the data object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub first_entry_id: i64,
    pub part_id: u32,
    pub block_offset: u64,
}

/// Accumulates block locations during an offload.
///
/// `add_block` is called once per uploaded block, in upload order; offsets
/// are derived from the running sum of block sizes.
#[derive(Debug, Default)]
pub struct OffloadIndexBuilder {
    metadata: LedgerMetadata,
    data_block_header_len: u32,
    data_object_len: u64,
    next_offset: u64,
    entries: Vec<IndexEntry>,
}

impl OffloadIndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ledger_metadata(mut self, metadata: LedgerMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn data_block_header_len(mut self, len: u32) -> Self {
        self.data_block_header_len = len;
        self
    }

    /// Records the block that was just uploaded as `part_id`.
    pub fn add_block(&mut self, first_entry_id: i64, part_id: u32, block_size: u64) {
        if let Some(last) = self.entries.last() {
            assert!(
                first_entry_id > last.first_entry_id && part_id > last.part_id,
                "blocks must be added in strictly increasing order"
            );
        } else {
            assert_eq!(part_id, 1, "part IDs start at 1");
        }

        self.entries.push(IndexEntry {
            first_entry_id,
            part_id,
            block_offset: self.next_offset,
        });
        self.next_offset += block_size;
    }

    pub fn data_object_len(mut self, len: u64) -> Self {
        self.data_object_len = len;
        self
    }

    pub fn build(self) -> OffloadIndex {
        debug_assert_eq!(
            self.data_object_len, self.next_offset,
            "data object length must equal the sum of recorded block sizes"
        );
        OffloadIndex {
            metadata: self.metadata,
            data_block_header_len: self.data_block_header_len,
            data_object_len: self.data_object_len,
            entries: self.entries,
        }
    }
}

/// The decoded (or freshly built) index of one offloaded ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OffloadIndex {
    metadata: LedgerMetadata,
    data_block_header_len: u32,
    data_object_len: u64,
    entries: Vec<IndexEntry>,
}

impl OffloadIndex {
    pub fn ledger_metadata(&self) -> &LedgerMetadata {
        &self.metadata
    }

    pub fn data_block_header_len(&self) -> u32 {
        self.data_block_header_len
    }

    pub fn data_object_len(&self) -> u64 {
        self.data_object_len
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Finds the block holding `entry_id`: the greatest recorded block whose
    /// `first_entry_id` does not exceed it.
    pub fn lookup(&self, entry_id: i64) -> Result<IndexEntry, IndexError> {
        self.lookup_position(entry_id)
            .map(|position| self.entries[position])
    }

    /// As [`lookup`](OffloadIndex::lookup), but returns the position within
    /// [`entries`](OffloadIndex::entries) so callers can walk forward.
    pub fn lookup_position(&self, entry_id: i64) -> Result<usize, IndexError> {
        if entry_id < 0 || entry_id > self.metadata.last_entry_id {
            return Err(IndexError::EntryOutOfRange { entry_id });
        }
        let upper = self
            .entries
            .partition_point(|entry| entry.first_entry_id <= entry_id);
        if upper == 0 {
            return Err(IndexError::EntryOutOfRange { entry_id });
        }
        Ok(upper - 1)
    }

    /// Byte length of the block at `position`, derived from the next block's
    /// offset (or the data object length for the final block).
    pub fn block_len(&self, position: usize) -> u64 {
        let start = self.entries[position].block_offset;
        let end = self
            .entries
            .get(position + 1)
            .map_or(self.data_object_len, |next| next.block_offset);
        end - start
    }

    /// Exact length of the serialized index, needed for the content-length
    /// header of the upload.
    pub fn serialized_len(&self) -> usize {
        INDEX_HEADER_LEN + self.metadata.encoded_len() + self.entries.len() * INDEX_ENTRY_LEN
    }

    /// Serializes the index. The returned buffer can be re-sent from the
    /// start on retry.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        buf.put_u32(INDEX_MAGIC);
        buf.put_u32(CURRENT_FORMAT_VERSION);
        buf.put_u32(self.entries.len() as u32);
        buf.put_u32(self.data_block_header_len);
        buf.put_u64(self.data_object_len);
        buf.put_u32(self.metadata.encoded_len() as u32);
        self.metadata.encode(&mut buf);
        for entry in &self.entries {
            buf.put_i64(entry.first_entry_id);
            buf.put_u32(entry.part_id);
            buf.put_u64(entry.block_offset);
        }
        debug_assert_eq!(buf.len(), self.serialized_len());
        buf.freeze()
    }

    /// Parses an index object.
    ///
    /// # Errors
    ///
    /// Fails with `CorruptIndex` on a bad magic word, an unsupported
    /// version, truncation, or entries that violate the ordering invariants.
    pub fn decode(mut buf: Bytes) -> Result<Self, IndexError> {
        if buf.remaining() < INDEX_HEADER_LEN {
            return Err(corrupt("shorter than the fixed header"));
        }
        let magic = buf.get_u32();
        if magic != INDEX_MAGIC {
            return Err(corrupt(format!("bad magic {magic:#010x}")));
        }
        let version = buf.get_u32();
        if version != CURRENT_FORMAT_VERSION {
            return Err(corrupt(format!("unsupported version {version}")));
        }
        let entry_count = buf.get_u32() as usize;
        let data_block_header_len = buf.get_u32();
        let data_object_len = buf.get_u64();
        let metadata_len = buf.get_u32() as usize;

        if buf.remaining() < metadata_len + entry_count * INDEX_ENTRY_LEN {
            return Err(corrupt("truncated before the index table"));
        }
        let mut metadata_blob = buf.copy_to_bytes(metadata_len);
        let metadata = LedgerMetadata::decode(&mut metadata_blob)
            .map_err(|err| corrupt(format!("bad ledger metadata: {err}")))?;

        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let entry = IndexEntry {
                first_entry_id: buf.get_i64(),
                part_id: buf.get_u32(),
                block_offset: buf.get_u64(),
            };
            if let Some(last) = entries.last() {
                let IndexEntry {
                    first_entry_id,
                    part_id,
                    block_offset,
                } = *last;
                if entry.first_entry_id <= first_entry_id
                    || entry.part_id <= part_id
                    || entry.block_offset <= block_offset
                {
                    return Err(corrupt("index entries are not strictly increasing"));
                }
            } else if entry.part_id != 1 {
                return Err(corrupt("part IDs must start at 1"));
            }
            entries.push(entry);
        }

        Ok(Self {
            metadata,
            data_block_header_len,
            data_object_len,
            entries,
        })
    }
}
