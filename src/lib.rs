//! Ledger offload engine.
//!
//! Moves closed, immutable ledgers out of the primary bookkeeping tier into
//! object storage, and serves random-access reads back out of the object
//! tier as if the ledger were still online.
//!
//! An offloaded ledger is laid out as two objects: a *data object*, the
//! concatenation of fixed-size blocks each holding a header plus whole
//! framed entries plus zero padding, and an *index object* mapping entry IDs
//! to block locations. The index object is the commit point: a ledger counts
//! as offloaded if and only if its index object exists.
//!
//! Operations for a given ledger are serialized on a per-ledger execution
//! lane; different ledgers proceed concurrently.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

#[macro_use]
extern crate tracing;

pub mod block;
pub mod config;
pub mod index;
mod lanes;
pub mod ledger;
pub mod offloader;
pub mod read;
pub mod test_util;

pub use config::{ConfigError, Driver, OffloadConfig};
pub use ledger::{LedgerEntry, LedgerMetadata, LedgerReader};
pub use offloader::{BlobStoreOffloader, OffloadError};
pub use read::{BackedReadHandle, ReadError};

/// On-object format version stamped into per-object user metadata.
pub const CURRENT_FORMAT_VERSION: u32 = 1;

/// User-metadata key carrying the on-object format version.
pub const FORMAT_VERSION_KEY: &str = "offload-format-version";

/// User-metadata key carrying the software version that wrote the object.
pub const SOFTWARE_VERSION_KEY: &str = "offload-software-version";

/// User-metadata key carrying the build identifier that wrote the object.
pub const SOFTWARE_BUILD_KEY: &str = "offload-software-build";

/// Software version stamped onto every written object.
pub const SOFTWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build identifier stamped onto every written object.
pub const SOFTWARE_BUILD: &str = match option_env!("LEDGER_OFFLOAD_BUILD") {
    Some(build) => build,
    None => "dev",
};

/// Key of the data object for one offload attempt of one ledger.
pub fn data_object_key(uid: &uuid::Uuid, ledger_id: u64) -> String {
    format!("{uid}-ledger-{ledger_id}")
}

/// Key of the index object for one offload attempt of one ledger.
pub fn index_object_key(uid: &uuid::Uuid, ledger_id: u64) -> String {
    format!("{uid}-ledger-{ledger_id}-index")
}
