//! Random-access reads over an offloaded ledger.
//!
//! A [`BackedReadHandle`] fetches the index object once at open, then serves
//! entry-range reads from the data object through a bounded range buffer:
//! at most `read_buffer_size` bytes are pulled per ranged get, extended only
//! when a single payload overruns the window. Transient store errors are
//! surfaced as-is and never retried here; retrying a whole read is the
//! caller's business.

use std::{collections::HashMap, ops::Range, sync::Arc};

use blobstore::{BlobStore, StoreError};
use bytes::{Buf, Bytes};
use snafu::Snafu;

use crate::{
    block::ENTRY_HEADER_LEN,
    index::{IndexError, OffloadIndex},
    ledger::{LedgerEntry, LedgerMetadata},
    CURRENT_FORMAT_VERSION, FORMAT_VERSION_KEY,
};

/// Error that occurred opening or reading a [`BackedReadHandle`].
#[derive(Debug, Snafu)]
pub enum ReadError {
    /// A transport-level failure talking to the object store.
    #[snafu(display("object store failure during {operation}: {source}"))]
    Io {
        operation: &'static str,
        source: StoreError,
    },

    /// The index object's bytes do not describe a valid index. Fatal for
    /// the handle; the ledger is unreadable until repaired out-of-band.
    #[snafu(display("index object is corrupt: {reason}"))]
    CorruptIndex { reason: String },

    /// The data object disagreed with the index about what lives where.
    /// The failed read is lost, but the handle stays usable.
    #[snafu(display("data object is corrupt at entry {entry_id}: {reason}"))]
    CorruptEntry { entry_id: i64, reason: String },

    /// The object was written by an incompatible format version.
    #[snafu(display(
        "offloaded object has format version {found:?}, this engine reads version {expected}"
    ))]
    IncompatibleVersion {
        found: Option<String>,
        expected: u32,
    },

    /// The requested entry is not covered by the offloaded ledger.
    #[snafu(display("entry {entry_id} is outside the offloaded ledger"))]
    EntryOutOfRange { entry_id: i64 },

    /// Engine shut down before the operation ran.
    #[snafu(display("offload engine is stopped"))]
    Stopped,
}

impl From<IndexError> for ReadError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::CorruptIndex { reason } => ReadError::CorruptIndex { reason },
            IndexError::EntryOutOfRange { entry_id } => ReadError::EntryOutOfRange { entry_id },
        }
    }
}

/// Verifies the format-version user-metadata header written at offload
/// time. Keys are written lowercased and drivers normalize them the same
/// way, so only the lowercased key is consulted.
fn check_format_version(user_metadata: &HashMap<String, String>) -> Result<(), ReadError> {
    let expected = CURRENT_FORMAT_VERSION.to_string();
    let found = user_metadata.get(FORMAT_VERSION_KEY).cloned();
    match found {
        Some(ref version) if *version == expected => Ok(()),
        found => Err(ReadError::IncompatibleVersion {
            found,
            expected: CURRENT_FORMAT_VERSION,
        }),
    }
}

/// A window of the data object held in memory.
struct RangeBuffer {
    start: u64,
    data: Bytes,
}

impl RangeBuffer {
    fn empty() -> Self {
        Self {
            start: 0,
            data: Bytes::new(),
        }
    }

    fn covers(&self, range: &Range<u64>) -> bool {
        range.start >= self.start && range.end <= self.start + self.data.len() as u64
    }

    fn slice(&self, range: Range<u64>) -> Bytes {
        let start = (range.start - self.start) as usize;
        let end = (range.end - self.start) as usize;
        self.data.slice(start..end)
    }
}

/// Random-access reader over one offloaded ledger.
pub struct BackedReadHandle {
    store: Arc<dyn BlobStore>,
    ledger_id: u64,
    data_key: String,
    index: OffloadIndex,
    read_buffer_size: u64,
    buffer: RangeBuffer,
}

impl BackedReadHandle {
    /// Fetches and verifies the index object, returning a usable handle.
    ///
    /// # Errors
    ///
    /// Fails with `IncompatibleVersion` if the format-version header is
    /// absent or differs from the current version, `CorruptIndex` if the
    /// index bytes do not parse, or `Io` on store failures.
    pub async fn open(
        store: Arc<dyn BlobStore>,
        data_key: String,
        index_key: String,
        ledger_id: u64,
        read_buffer_size: u64,
    ) -> Result<Self, ReadError> {
        let blob = store
            .get_blob(&index_key)
            .await
            .map_err(|source| ReadError::Io {
                operation: "get_index",
                source,
            })?;
        check_format_version(&blob.user_metadata)?;
        let index = OffloadIndex::decode(blob.body)?;

        debug!(
            ledger_id,
            data_key = %data_key,
            blocks = index.entries().len(),
            "Opened backed read handle."
        );

        Ok(Self {
            store,
            ledger_id,
            data_key,
            index,
            read_buffer_size,
            buffer: RangeBuffer::empty(),
        })
    }

    pub fn id(&self) -> u64 {
        self.ledger_id
    }

    /// Total payload bytes of the offloaded ledger.
    pub fn length(&self) -> u64 {
        self.index.ledger_metadata().length
    }

    pub fn last_add_confirmed(&self) -> i64 {
        self.index.ledger_metadata().last_entry_id
    }

    pub fn ledger_metadata(&self) -> &LedgerMetadata {
        self.index.ledger_metadata()
    }

    /// Drops the handle and its buffered window.
    pub fn close(self) {}

    /// Reads the entries `first_entry_id..=last_entry_id`, in order.
    ///
    /// # Errors
    ///
    /// Fails with `EntryOutOfRange` if the range is empty or reaches past
    /// the offloaded ledger, `CorruptEntry` if the data object contradicts
    /// the index, or `Io` on store failures. A failed read leaves the
    /// handle usable.
    pub async fn read(
        &mut self,
        first_entry_id: i64,
        last_entry_id: i64,
    ) -> Result<Vec<LedgerEntry>, ReadError> {
        if first_entry_id < 0 || first_entry_id > last_entry_id {
            return Err(ReadError::EntryOutOfRange {
                entry_id: first_entry_id,
            });
        }
        let mut position = self.index.lookup_position(first_entry_id)?;
        // Validate the far end up front instead of failing mid-read.
        self.index.lookup_position(last_entry_id)?;

        let header_len = u64::from(self.index.data_block_header_len());
        let mut block = self.index.entries()[position];
        let mut block_end = block.block_offset + self.index.block_len(position);
        let mut cursor = block.block_offset + header_len;
        let mut expected = first_entry_id;
        let mut entries = Vec::with_capacity((last_entry_id - first_entry_id + 1) as usize);

        while expected <= last_entry_id {
            // Hop to the next block once it owns the entry we want.
            if let Some(next) = self.index.entries().get(position + 1).copied() {
                if expected >= next.first_entry_id {
                    position += 1;
                    block = next;
                    block_end = block.block_offset + self.index.block_len(position);
                    cursor = block.block_offset + header_len;
                    continue;
                }
            }

            if cursor + ENTRY_HEADER_LEN as u64 > block_end {
                return Err(ReadError::CorruptEntry {
                    entry_id: expected,
                    reason: "block ended before the entry frame".to_string(),
                });
            }

            let mut frame = self.fetch(cursor..cursor + ENTRY_HEADER_LEN as u64).await?;
            let length = u64::from(frame.get_u32());
            let entry_id = frame.get_i64();
            let frame_end = cursor + ENTRY_HEADER_LEN as u64 + length;
            if frame_end > block_end {
                return Err(ReadError::CorruptEntry {
                    entry_id: expected,
                    reason: format!("frame length {length} overruns the block"),
                });
            }

            if entry_id < expected {
                // Still walking up to the first requested entry within its
                // block.
                cursor = frame_end;
                continue;
            }
            if entry_id != expected {
                return Err(ReadError::CorruptEntry {
                    entry_id: expected,
                    reason: format!("found entry {entry_id} instead"),
                });
            }

            let payload = self
                .fetch(cursor + ENTRY_HEADER_LEN as u64..frame_end)
                .await?;
            entries.push(LedgerEntry::new(entry_id, payload));
            cursor = frame_end;
            expected += 1;
        }

        Ok(entries)
    }

    /// Returns `range` of the data object, refilling the buffered window
    /// with a single ranged get when it does not already cover the range.
    /// A payload larger than the window extends the fetch to cover it.
    async fn fetch(&mut self, range: Range<u64>) -> Result<Bytes, ReadError> {
        if !self.buffer.covers(&range) {
            let end = (range.start + self.read_buffer_size)
                .max(range.end)
                .min(self.index.data_object_len());
            let data = self
                .store
                .get_blob_range(&self.data_key, range.start..end)
                .await
                .map_err(|source| ReadError::Io {
                    operation: "get_data_range",
                    source,
                })?;
            self.buffer = RangeBuffer {
                start: range.start,
                data,
            };
            if !self.buffer.covers(&range) {
                return Err(ReadError::Io {
                    operation: "get_data_range",
                    source: StoreError::Io {
                        operation: "get_data_range",
                        source: "ranged get returned fewer bytes than requested".into(),
                    },
                });
            }
        }
        Ok(self.buffer.slice(range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_version_must_match_exactly() {
        let mut metadata = HashMap::new();
        assert!(matches!(
            check_format_version(&metadata),
            Err(ReadError::IncompatibleVersion { found: None, .. })
        ));

        metadata.insert(FORMAT_VERSION_KEY.to_string(), "2".to_string());
        assert!(matches!(
            check_format_version(&metadata),
            Err(ReadError::IncompatibleVersion { found: Some(v), .. }) if v == "2"
        ));

        metadata.insert(FORMAT_VERSION_KEY.to_string(), "1".to_string());
        assert!(check_format_version(&metadata).is_ok());
    }

    #[test]
    fn range_buffer_coverage() {
        let buffer = RangeBuffer {
            start: 100,
            data: Bytes::from_static(&[0u8; 50]),
        };
        assert!(buffer.covers(&(100..150)));
        assert!(buffer.covers(&(120..130)));
        assert!(!buffer.covers(&(99..101)));
        assert!(!buffer.covers(&(120..151)));
        assert_eq!(buffer.slice(110..115).len(), 5);
    }
}
