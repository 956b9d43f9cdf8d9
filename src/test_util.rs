//! Helpers for exercising the offload engine without a bookkeeping tier.
//!
//! [`MemoryLedger`] is a deterministic in-memory [`LedgerReader`]: entry
//! payloads are derived from the ledger ID, entry ID, and length alone, so
//! tests can regenerate the expected bytes without holding onto the ledger.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;

use crate::ledger::{LedgerEntry, LedgerMetadata, LedgerReader};

/// An in-memory closed (or deliberately open) ledger.
#[derive(Clone, Debug)]
pub struct MemoryLedger {
    id: u64,
    entries: Vec<Bytes>,
    closed: bool,
}

impl MemoryLedger {
    /// A closed ledger whose entries have the given payload lengths.
    pub fn closed(id: u64, entry_lengths: &[usize]) -> Self {
        Self {
            id,
            entries: Self::generate(id, entry_lengths),
            closed: true,
        }
    }

    /// An open ledger; offloading it must fail.
    pub fn open(id: u64, entry_lengths: &[usize]) -> Self {
        Self {
            closed: false,
            ..Self::closed(id, entry_lengths)
        }
    }

    /// The deterministic payload of one entry.
    pub fn entry_payload(ledger_id: u64, entry_id: i64, length: usize) -> Bytes {
        (0..length)
            .map(|i| {
                ((ledger_id as usize).wrapping_add(entry_id as usize * 31 + i * 7) % 251) as u8
            })
            .collect::<Vec<_>>()
            .into()
    }

    /// All payloads, in entry-ID order.
    pub fn payloads(&self) -> &[Bytes] {
        &self.entries
    }

    fn generate(id: u64, entry_lengths: &[usize]) -> Vec<Bytes> {
        entry_lengths
            .iter()
            .enumerate()
            .map(|(entry_id, length)| Self::entry_payload(id, entry_id as i64, *length))
            .collect()
    }
}

#[async_trait]
impl LedgerReader for MemoryLedger {
    fn id(&self) -> u64 {
        self.id
    }

    fn length(&self) -> u64 {
        self.entries.iter().map(|payload| payload.len() as u64).sum()
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn last_add_confirmed(&self) -> i64 {
        self.entries.len() as i64 - 1
    }

    fn metadata(&self) -> LedgerMetadata {
        LedgerMetadata {
            ledger_id: self.id,
            length: self.length(),
            last_entry_id: self.last_add_confirmed(),
            closed: self.closed,
            creation_time_ms: 1_700_000_000_000,
            ensemble_size: 3,
            write_quorum: 2,
            ack_quorum: 2,
            properties: [("component".to_string(), "managed-ledger".to_string())]
                .into_iter()
                .collect(),
        }
    }

    async fn read_entry(&self, entry_id: i64) -> io::Result<LedgerEntry> {
        usize::try_from(entry_id)
            .ok()
            .and_then(|index| self.entries.get(index))
            .map(|payload| LedgerEntry::new(entry_id, payload.clone()))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("ledger {} has no entry {entry_id}", self.id),
                )
            })
    }
}
