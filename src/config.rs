//! Offload engine configuration.

use std::{path::PathBuf, time::Duration};

use serde::Deserialize;
use snafu::Snafu;

/// Smallest permitted block size. Blocks are uploaded 1:1 as multipart
/// parts, and S3 rejects non-final parts below 5 MiB.
pub const MIN_BLOCK_SIZE: u64 = 5 * 1024 * 1024;

const DEFAULT_READ_BUFFER_SIZE: u64 = 1024 * 1024;

// Object-store socket timeout and driver-internal retry budget.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 25;
const DEFAULT_MAX_RETRIES: u32 = 100;

const DEFAULT_LANES: usize = 2;

/// Error raised while validating an [`OffloadConfig`].
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// The driver name matches no supported object-store driver.
    #[snafu(display("unknown object store driver '{name}'"))]
    UnknownDriver { name: String },

    /// No bucket was configured.
    #[snafu(display("a bucket must be configured"))]
    EmptyBucket,

    /// S3 needs at least one of a region or an explicit endpoint.
    #[snafu(display("the S3 driver needs a region or an endpoint"))]
    MissingRegionOrEndpoint,

    /// GCS authenticates via a service-account file, which was not given.
    #[snafu(display("the google-cloud-storage driver needs a service account file"))]
    MissingServiceAccount,

    /// The configured block size cannot satisfy multipart minimums.
    #[snafu(display("block size {configured} is below the minimum of {minimum} bytes"))]
    BlockSizeTooSmall { configured: u64, minimum: u64 },

    /// The selected driver failed to initialize, e.g. an unreadable GCS
    /// service-account file.
    #[snafu(display("object store driver failed to initialize: {source}"))]
    DriverInit { source: blobstore::StoreError },
}

/// Supported object-store drivers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Driver {
    AwsS3,
    GoogleCloudStorage,
}

impl Driver {
    /// Resolves a case-insensitive driver name. `s3` and `aws-s3` both map
    /// to the S3 driver.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "s3" | "aws-s3" => Some(Driver::AwsS3),
            "google-cloud-storage" => Some(Driver::GoogleCloudStorage),
            _ => None,
        }
    }
}

/// Configuration consumed by [`BlobStoreOffloader`](crate::BlobStoreOffloader).
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OffloadConfig {
    /// Object-store driver name; see [`Driver::from_name`].
    pub driver: String,

    /// Bucket (or GCS bucket name) holding all offloaded objects.
    pub bucket: String,

    /// Region for S3-compatible stores.
    #[serde(default)]
    pub region: Option<String>,

    /// Explicit endpoint for S3-compatible stores; switches the client to
    /// path-style addressing. Mock back-ends want this.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Size of every data-object block, and therefore of every multipart
    /// part. Minimum (and default) 5 MiB.
    #[serde(default = "default_max_block_size")]
    pub max_block_size: u64,

    /// Upper bound on the ranged-read buffer a read handle keeps in memory.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: u64,

    /// Static S3 credential identity. When absent the driver's default
    /// provider chain applies (some mock back-ends require none at all).
    #[serde(default)]
    pub access_identity: Option<String>,

    /// Static S3 credential secret.
    #[serde(default)]
    pub access_secret: Option<String>,

    /// Service-account JSON file for GCS; read eagerly at startup.
    #[serde(default)]
    pub service_account_file: Option<PathBuf>,

    /// Object-store socket timeout, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Driver-internal retry budget per operation.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Number of execution lanes. Ledgers are hashed onto lanes; operations
    /// for one ledger always share a lane.
    #[serde(default = "default_lanes")]
    pub lanes: usize,
}

const fn default_max_block_size() -> u64 {
    MIN_BLOCK_SIZE
}

const fn default_read_buffer_size() -> u64 {
    DEFAULT_READ_BUFFER_SIZE
}

const fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

const fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

const fn default_lanes() -> usize {
    DEFAULT_LANES
}

impl OffloadConfig {
    /// A config with the given driver and bucket, everything else defaulted.
    pub fn new(driver: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            bucket: bucket.into(),
            region: None,
            endpoint: None,
            max_block_size: default_max_block_size(),
            read_buffer_size: default_read_buffer_size(),
            access_identity: None,
            access_secret: None,
            service_account_file: None,
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            lanes: default_lanes(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Validates the config, resolving the driver.
    ///
    /// # Errors
    ///
    /// Fails on an unknown driver, an empty bucket, a block size below the
    /// multipart minimum, or missing driver-specific settings.
    pub fn validate(&self) -> Result<Driver, ConfigError> {
        let driver = Driver::from_name(&self.driver).ok_or_else(|| ConfigError::UnknownDriver {
            name: self.driver.clone(),
        })?;

        if self.bucket.is_empty() {
            return Err(ConfigError::EmptyBucket);
        }
        if self.max_block_size < MIN_BLOCK_SIZE {
            return Err(ConfigError::BlockSizeTooSmall {
                configured: self.max_block_size,
                minimum: MIN_BLOCK_SIZE,
            });
        }

        match driver {
            Driver::AwsS3 => {
                if self.region.is_none() && self.endpoint.is_none() {
                    return Err(ConfigError::MissingRegionOrEndpoint);
                }
            }
            Driver::GoogleCloudStorage => {
                if self.service_account_file.is_none() {
                    return Err(ConfigError::MissingServiceAccount);
                }
            }
        }

        Ok(driver)
    }
}
