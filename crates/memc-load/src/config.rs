//! Loader configuration
//!
//! Built from the command line (see [`crate::Cli`]) and validated once before
//! the run starts. The same value is shared read-only by every worker.

use crate::error::{LoadError, Result};
use crate::retry::RetryPolicy;
use std::collections::BTreeMap;
use std::time::Duration;

// ============================================================================
// Loader Configuration Constants
// ============================================================================

/// Default glob pattern for input files.
pub const DEFAULT_PATTERN: &str = "/data/appsinstalled/*.tsv.gz";

/// Default memcached address for the `idfa` key space.
pub const DEFAULT_IDFA_ADDR: &str = "127.0.0.1:33013";

/// Default memcached address for the `gaid` key space.
pub const DEFAULT_GAID_ADDR: &str = "127.0.0.1:33014";

/// Default memcached address for the `adid` key space.
pub const DEFAULT_ADID_ADDR: &str = "127.0.0.1:33015";

/// Default memcached address for the `dvid` key space.
pub const DEFAULT_DVID_ADDR: &str = "127.0.0.1:33016";

/// Default number of write attempts per record.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Default fixed delay between write attempts in milliseconds.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;

/// Default capacity of every bounded queue.
pub const DEFAULT_BUFFER: usize = 100;

/// Default error rate at or above which a file is rejected.
pub const DEFAULT_ERROR_THRESHOLD: f64 = 0.01;

/// Default connect/read/write timeout for store operations in milliseconds.
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 1000;

/// Default number of file workers: one more than the available CPUs.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        + 1
}

/// What happens when a file hits a failure that the reference loader treated
/// as fatal (unknown device type, exhausted writes, high error rate)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ErrorPolicy {
    /// Count the failure against the file and keep loading other files
    #[default]
    Continue,
    /// Stop the whole run with an error
    Abort,
}

impl std::fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorPolicy::Continue => write!(f, "continue"),
            ErrorPolicy::Abort => write!(f, "abort"),
        }
    }
}

/// Validated loader settings
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Glob pattern selecting the input files
    pub pattern: String,

    /// Device type -> memcached address
    pub destinations: BTreeMap<String, String>,

    /// Log records instead of writing them
    pub dry_run: bool,

    /// Number of files loaded concurrently
    pub workers: usize,

    /// Capacity of the file, destination and report queues
    pub buffer: usize,

    /// Attempts and delay for store writes
    pub retry: RetryPolicy,

    /// Timeout applied to each store connect and write
    pub store_timeout: Duration,

    /// Error rate at or above which a file is rejected
    pub error_threshold: f64,

    pub error_policy: ErrorPolicy,
}

impl LoaderConfig {
    /// The four device types and their default addresses
    pub fn default_destinations() -> BTreeMap<String, String> {
        [
            ("idfa", DEFAULT_IDFA_ADDR),
            ("gaid", DEFAULT_GAID_ADDR),
            ("adid", DEFAULT_ADID_ADDR),
            ("dvid", DEFAULT_DVID_ADDR),
        ]
        .into_iter()
        .map(|(device_type, addr)| (device_type.to_string(), addr.to_string()))
        .collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.pattern.trim().is_empty() {
            return Err(LoadError::config("pattern cannot be empty"));
        }

        if self.destinations.is_empty() {
            return Err(LoadError::config("at least one device type destination is required"));
        }

        if let Some((device_type, _)) = self
            .destinations
            .iter()
            .find(|(device_type, addr)| device_type.is_empty() || addr.trim().is_empty())
        {
            return Err(LoadError::config(format!(
                "destination for device type '{}' has an empty name or address",
                device_type
            )));
        }

        if self.workers == 0 {
            return Err(LoadError::config("workers must be greater than 0"));
        }

        if self.buffer == 0 {
            return Err(LoadError::config("buffer must be greater than 0"));
        }

        if self.retry.max_attempts == 0 {
            return Err(LoadError::config("attempts must be greater than 0"));
        }

        if self.store_timeout.is_zero() {
            return Err(LoadError::config("store timeout must be greater than 0"));
        }

        if !(self.error_threshold > 0.0 && self.error_threshold <= 1.0) {
            return Err(LoadError::config(format!(
                "error threshold must be in (0, 1], got {}",
                self.error_threshold
            )));
        }

        Ok(())
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_PATTERN.to_string(),
            destinations: Self::default_destinations(),
            dry_run: false,
            workers: default_workers(),
            buffer: DEFAULT_BUFFER,
            retry: RetryPolicy::new(
                DEFAULT_ATTEMPTS,
                Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            ),
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            error_policy: ErrorPolicy::Continue,
        }
    }
}
