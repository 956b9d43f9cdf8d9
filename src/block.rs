//! Block-aware segment streaming.
//!
//! A block is a fixed-size slice of the data object: a fixed header, as many
//! whole framed entries as fit, then zero padding out to the block size. An
//! entry never straddles a block boundary. All integers are big-endian.
//!
//! [`BlockStream`] packs one block. The header carries the entry count, which
//! is only known once packing finishes, so the block is assembled into a
//! single owned buffer and the count is patched in before the block is
//! handed out; peak memory stays at one block. Consumers pull the finished
//! block as zero-copy chunks.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use snafu::{ResultExt, Snafu};

use crate::ledger::LedgerReader;

/// Magic word opening every data-block header.
pub const DATA_BLOCK_MAGIC: u32 = 0x4442_4C4B;

/// Fixed size of the data-block header, in bytes.
pub const DATA_BLOCK_HEADER_LEN: usize = 64;

/// Size of the per-entry frame header: `[length:4][entryId:8]`.
pub const ENTRY_HEADER_LEN: usize = 12;

/// Sentinel entry ID meaning "no entry".
pub const NO_ENTRY: i64 = -1;

// Upload chunks are pulled off the packed block in slices of this size.
const CHUNK_LEN: usize = 64 * 1024;

/// Error that occurred while packing a block.
#[derive(Debug, Snafu)]
pub enum BlockError {
    /// An entry's frame exceeds the largest payload a block can carry.
    ///
    /// The bound is `maxBlockSize − headerLen − entryHeaderLen` bytes of
    /// payload; such ledgers cannot be offloaded with this block size.
    #[snafu(display(
        "entry {entry_id} needs {frame_len} framed bytes but an empty block only holds {budget}"
    ))]
    EntryTooLarge {
        entry_id: i64,
        frame_len: u64,
        budget: u64,
    },

    /// The source ledger failed to produce an entry.
    #[snafu(display("failed to read entry {entry_id} from source ledger: {source}"))]
    SourceRead { entry_id: i64, source: io::Error },
}

/// Error decoding a data-block header.
#[derive(Debug, Snafu)]
pub enum HeaderDecodeError {
    #[snafu(display("data block header is truncated"))]
    Truncated,

    #[snafu(display("bad data block magic: {found:#010x}"))]
    BadMagic { found: u32 },
}

/// The fixed-size header at the start of every block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataBlockHeader {
    pub block_len: u64,
    pub first_entry_id: i64,
    pub entry_count: u32,
}

impl DataBlockHeader {
    /// Writes the header, including its zeroed reserved area, for exactly
    /// [`DATA_BLOCK_HEADER_LEN`] bytes.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(DATA_BLOCK_MAGIC);
        buf.put_u64(self.block_len);
        buf.put_i64(self.first_entry_id);
        buf.put_u32(self.entry_count);
        buf.put_bytes(0, DATA_BLOCK_HEADER_LEN - 24);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, HeaderDecodeError> {
        if buf.remaining() < DATA_BLOCK_HEADER_LEN {
            return Err(HeaderDecodeError::Truncated);
        }
        let magic = buf.get_u32();
        if magic != DATA_BLOCK_MAGIC {
            return Err(HeaderDecodeError::BadMagic { found: magic });
        }
        let block_len = buf.get_u64();
        let first_entry_id = buf.get_i64();
        let entry_count = buf.get_u32();
        buf.advance(DATA_BLOCK_HEADER_LEN - 24);
        Ok(Self {
            block_len,
            first_entry_id,
            entry_count,
        })
    }
}

/// One packed block, ready for upload.
///
/// Greedily packs entries starting at `start_entry_id`: an entry is written
/// if and only if its whole frame still fits; the first entry that does not
/// fit starts the next block. Packing also stops once the ledger's
/// last-add-confirmed entry has been consumed.
#[derive(Debug)]
pub struct BlockStream {
    block: Bytes,
    consumed: usize,
    end_entry_id: i64,
    entry_bytes_read: u64,
}

impl BlockStream {
    /// Packs one block of exactly `block_size` bytes from `ledger`.
    ///
    /// # Errors
    ///
    /// Fails if the source ledger cannot produce an entry, or if an entry is
    /// too large to ever fit a block of this size.
    pub async fn open(
        ledger: &dyn LedgerReader,
        start_entry_id: i64,
        block_size: u64,
    ) -> Result<Self, BlockError> {
        let block_size = block_size as usize;
        debug_assert!(block_size >= DATA_BLOCK_HEADER_LEN);

        let mut buf = BytesMut::with_capacity(block_size);
        DataBlockHeader {
            block_len: block_size as u64,
            first_entry_id: start_entry_id,
            entry_count: 0,
        }
        .encode(&mut buf);

        let last_add_confirmed = ledger.last_add_confirmed();
        let mut next_entry_id = start_entry_id;
        let mut end_entry_id = NO_ENTRY;
        let mut entry_count = 0u32;
        let mut entry_bytes_read = 0u64;

        while next_entry_id <= last_add_confirmed {
            let entry = ledger
                .read_entry(next_entry_id)
                .await
                .context(SourceReadSnafu {
                    entry_id: next_entry_id,
                })?;
            let frame_len = ENTRY_HEADER_LEN + entry.length();
            if buf.len() + frame_len > block_size {
                if entry_count == 0 {
                    return EntryTooLargeSnafu {
                        entry_id: entry.entry_id,
                        frame_len: frame_len as u64,
                        budget: (block_size - DATA_BLOCK_HEADER_LEN) as u64,
                    }
                    .fail();
                }
                break;
            }

            buf.put_u32(entry.length() as u32);
            buf.put_i64(entry.entry_id);
            buf.put_slice(&entry.payload);
            entry_bytes_read += entry.length() as u64;
            end_entry_id = entry.entry_id;
            entry_count += 1;
            next_entry_id += 1;
        }

        // Patch the now-known entry count into the header, then pad out.
        buf[20..24].copy_from_slice(&entry_count.to_be_bytes());
        buf.resize(block_size, 0);

        Ok(Self {
            block: buf.freeze(),
            consumed: 0,
            end_entry_id,
            entry_bytes_read,
        })
    }

    /// The last entry ID packed into this block, or [`NO_ENTRY`] if the
    /// block holds no entries.
    pub fn end_entry_id(&self) -> i64 {
        self.end_entry_id
    }

    /// Payload bytes consumed from the ledger by this block, excluding
    /// framing.
    pub fn entry_bytes_read(&self) -> u64 {
        self.entry_bytes_read
    }

    /// Total size of the packed block.
    pub fn block_size(&self) -> u64 {
        self.block.len() as u64
    }

    /// Pulls the next chunk of the packed block, or `None` once exhausted.
    /// Chunks are cheap slices of the same frozen buffer.
    pub fn chunk(&mut self) -> Option<Bytes> {
        if self.consumed >= self.block.len() {
            return None;
        }
        let end = (self.consumed + CHUNK_LEN).min(self.block.len());
        let chunk = self.block.slice(self.consumed..end);
        self.consumed = end;
        Some(chunk)
    }

    /// The whole packed block as one buffer.
    pub fn to_bytes(&self) -> Bytes {
        self.block.clone()
    }
}

/// Size of the next block: the full `max_block_size` unless the remaining
/// ledger content (plus framing and header) no longer fills one, in which
/// case the final block is trimmed to fit exactly.
pub fn calculate_block_size(
    max_block_size: u64,
    ledger: &dyn LedgerReader,
    start_entry_id: i64,
    entry_bytes_written: u64,
) -> u64 {
    let remaining_bytes = ledger.length().saturating_sub(entry_bytes_written);
    let remaining_entries = (ledger.last_add_confirmed() - start_entry_id + 1).max(0) as u64;
    let framing = remaining_entries * ENTRY_HEADER_LEN as u64;
    max_block_size.min(DATA_BLOCK_HEADER_LEN as u64 + remaining_bytes + framing)
}

#[cfg(test)]
mod tests {
    use bytes::Buf;

    use super::*;
    use crate::test_util::MemoryLedger;

    #[tokio::test]
    async fn packs_header_frames_and_padding() {
        let ledger = MemoryLedger::closed(1, &[10, 20, 30]);
        let block_size = 4096;
        let mut stream = BlockStream::open(&ledger, 0, block_size).await.unwrap();

        assert_eq!(stream.end_entry_id(), 2);
        assert_eq!(stream.entry_bytes_read(), 60);
        assert_eq!(stream.block_size(), block_size);

        let mut block = stream.to_bytes();
        let header = DataBlockHeader::decode(&mut block).unwrap();
        assert_eq!(
            header,
            DataBlockHeader {
                block_len: block_size,
                first_entry_id: 0,
                entry_count: 3,
            }
        );

        for (entry_id, len) in [(0i64, 10usize), (1, 20), (2, 30)] {
            assert_eq!(block.get_u32() as usize, len);
            assert_eq!(block.get_i64(), entry_id);
            block.advance(len);
        }
        // Everything after the last frame is zero padding.
        assert!(block.iter().all(|byte| *byte == 0));

        // Chunked consumption walks the same bytes.
        let mut total = 0;
        while let Some(chunk) = stream.chunk() {
            total += chunk.len();
        }
        assert_eq!(total as u64, block_size);
    }

    #[tokio::test]
    async fn stops_at_the_first_entry_that_does_not_fit() {
        // Header + two frames of 12 + 100 bytes leave no room for a third.
        let block_size = (DATA_BLOCK_HEADER_LEN + 2 * (ENTRY_HEADER_LEN + 100) + 50) as u64;
        let ledger = MemoryLedger::closed(1, &[100, 100, 100]);
        let stream = BlockStream::open(&ledger, 0, block_size).await.unwrap();

        assert_eq!(stream.end_entry_id(), 1);
        assert_eq!(stream.entry_bytes_read(), 200);
    }

    #[tokio::test]
    async fn empty_tail_yields_no_entry() {
        let ledger = MemoryLedger::closed(1, &[10]);
        let stream = BlockStream::open(&ledger, 1, 1024).await.unwrap();

        assert_eq!(stream.end_entry_id(), NO_ENTRY);
        assert_eq!(stream.entry_bytes_read(), 0);
        assert_eq!(stream.block_size(), 1024);
    }

    #[tokio::test]
    async fn oversized_entry_is_rejected() {
        let ledger = MemoryLedger::closed(1, &[4096]);
        let result = BlockStream::open(&ledger, 0, 1024).await;
        assert!(matches!(result, Err(BlockError::EntryTooLarge { entry_id: 0, .. })));
    }

    #[tokio::test]
    async fn entry_filling_the_block_exactly_fits() {
        let payload = 1024 - DATA_BLOCK_HEADER_LEN - ENTRY_HEADER_LEN;
        let ledger = MemoryLedger::closed(1, &[payload]);
        let stream = BlockStream::open(&ledger, 0, 1024).await.unwrap();

        assert_eq!(stream.end_entry_id(), 0);
        assert_eq!(stream.entry_bytes_read(), payload as u64);
    }

    #[test]
    fn final_block_is_trimmed() {
        let ledger = MemoryLedger::closed(1, &[100, 200, 300]);
        let size = calculate_block_size(5 * 1024 * 1024, &ledger, 0, 0);
        assert_eq!(
            size,
            (DATA_BLOCK_HEADER_LEN + 3 * ENTRY_HEADER_LEN + 600) as u64
        );

        // Mid-ledger, only the remainder counts.
        let size = calculate_block_size(5 * 1024 * 1024, &ledger, 2, 300);
        assert_eq!(size, (DATA_BLOCK_HEADER_LEN + ENTRY_HEADER_LEN + 300) as u64);
    }
}
