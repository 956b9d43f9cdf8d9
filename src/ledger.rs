//! Source-ledger abstraction.
//!
//! The engine reads from a closed ledger through the narrow [`LedgerReader`]
//! trait; the bookkeeping client that actually owns the ledger lives
//! upstream. Ledger metadata is carried through the offload round trip
//! verbatim: it is serialized into the index object and handed back out of
//! the read handle.

use std::{collections::BTreeMap, io};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes};
use snafu::Snafu;

/// One ledger entry: its ID and its opaque payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerEntry {
    pub entry_id: i64,
    pub payload: Bytes,
}

impl LedgerEntry {
    pub fn new(entry_id: i64, payload: Bytes) -> Self {
        Self { entry_id, payload }
    }

    /// Payload length in bytes.
    pub fn length(&self) -> usize {
        self.payload.len()
    }
}

/// Capability to read a closed ledger out of the bookkeeping tier.
#[async_trait]
pub trait LedgerReader: Send + Sync {
    /// The ledger's ID.
    fn id(&self) -> u64;

    /// Total payload bytes stored in the ledger.
    fn length(&self) -> u64;

    /// Whether the ledger has been closed. Open ledgers must never be
    /// offloaded.
    fn is_closed(&self) -> bool;

    /// The last-add-confirmed entry ID, or a negative value if nothing was
    /// ever confirmed.
    fn last_add_confirmed(&self) -> i64;

    /// The ledger's metadata, round-trippable through the index object.
    fn metadata(&self) -> LedgerMetadata;

    /// Reads one entry by ID.
    async fn read_entry(&self, entry_id: i64) -> io::Result<LedgerEntry>;
}

/// Error decoding a serialized [`LedgerMetadata`] blob.
#[derive(Debug, Snafu)]
pub enum MetadataCodecError {
    /// The blob ended before the advertised content did.
    #[snafu(display("ledger metadata blob is truncated"))]
    Truncated,

    /// A property key or value was not valid UTF-8.
    #[snafu(display("ledger metadata property is not valid UTF-8"))]
    InvalidProperty,
}

/// Ledger metadata as recorded by the bookkeeping tier.
///
/// Serialized into the index object with a fixed big-endian layout so that
/// a read handle can reconstruct it without consulting the bookkeeping tier.
/// Properties are encoded in sorted key order, keeping the blob
/// deterministic for a given ledger.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LedgerMetadata {
    pub ledger_id: u64,
    pub length: u64,
    pub last_entry_id: i64,
    pub closed: bool,
    pub creation_time_ms: u64,
    pub ensemble_size: u32,
    pub write_quorum: u32,
    pub ack_quorum: u32,
    pub properties: BTreeMap<String, String>,
}

impl LedgerMetadata {
    /// Exact length of the encoded blob, in bytes.
    pub fn encoded_len(&self) -> usize {
        let fixed = 8 + 8 + 8 + 1 + 8 + 4 + 4 + 4 + 4;
        let properties = self
            .properties
            .iter()
            .map(|(key, value)| 4 + key.len() + 4 + value.len())
            .sum::<usize>();
        fixed + properties
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.ledger_id);
        buf.put_u64(self.length);
        buf.put_i64(self.last_entry_id);
        buf.put_u8(u8::from(self.closed));
        buf.put_u64(self.creation_time_ms);
        buf.put_u32(self.ensemble_size);
        buf.put_u32(self.write_quorum);
        buf.put_u32(self.ack_quorum);
        buf.put_u32(self.properties.len() as u32);
        for (key, value) in &self.properties {
            buf.put_u32(key.len() as u32);
            buf.put_slice(key.as_bytes());
            buf.put_u32(value.len() as u32);
            buf.put_slice(value.as_bytes());
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, MetadataCodecError> {
        if buf.remaining() < 8 + 8 + 8 + 1 + 8 + 4 + 4 + 4 + 4 {
            return Err(MetadataCodecError::Truncated);
        }
        let ledger_id = buf.get_u64();
        let length = buf.get_u64();
        let last_entry_id = buf.get_i64();
        let closed = buf.get_u8() != 0;
        let creation_time_ms = buf.get_u64();
        let ensemble_size = buf.get_u32();
        let write_quorum = buf.get_u32();
        let ack_quorum = buf.get_u32();
        let property_count = buf.get_u32();

        let mut properties = BTreeMap::new();
        for _ in 0..property_count {
            let key = decode_string(buf)?;
            let value = decode_string(buf)?;
            properties.insert(key, value);
        }

        Ok(Self {
            ledger_id,
            length,
            last_entry_id,
            closed,
            creation_time_ms,
            ensemble_size,
            write_quorum,
            ack_quorum,
            properties,
        })
    }
}

fn decode_string(buf: &mut impl Buf) -> Result<String, MetadataCodecError> {
    if buf.remaining() < 4 {
        return Err(MetadataCodecError::Truncated);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(MetadataCodecError::Truncated);
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| MetadataCodecError::InvalidProperty)
}
