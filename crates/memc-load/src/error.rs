//! Error types for the loader
//!
//! The taxonomy follows how far a failure propagates:
//!
//! - [`ParseError`]: row-level. Counted against the file, the line is skipped.
//! - [`StoreError`]: write-level. Retried by the destination writer; once the
//!   attempts are exhausted the record is counted as an error in its tally.
//! - [`LoadError`]: file- and run-level. Returned to the coordinator. Which of
//!   these stop the whole run depends on the configured
//!   [`ErrorPolicy`](crate::config::ErrorPolicy).

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for loader operations
pub type Result<T> = std::result::Result<T, LoadError>;

/// Reasons a single input line is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Malformed row: expected 5 tab-separated fields, got {fields}")]
    MalformedRow { fields: usize },

    #[error("Missing device type or device id")]
    MissingIdentity,

    #[error("Not all user apps are digits: '{0}'")]
    InvalidAppId(String),

    #[error("Invalid geo coordinate: '{0}'")]
    InvalidGeo(String),
}

/// Failures talking to a key-value store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error talking to {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {timeout_ms}ms talking to {addr}")]
    Timeout { addr: String, timeout_ms: u128 },

    #[error("{addr} closed the connection")]
    ConnectionClosed { addr: String },

    #[error("{addr} rejected the write: {reply}")]
    Rejected { addr: String, reply: String },

    #[error("Invalid key '{0}': keys must be 1-250 bytes without whitespace or control characters")]
    InvalidKey(String),
}

/// File- and run-level failures
#[derive(Error, Debug)]
pub enum LoadError {
    /// Configuration is missing or invalid
    #[error("Configuration error: {0}. Check the command-line flags or MEMC_* environment variables.")]
    Config(String),

    /// The input glob pattern could not be compiled
    #[error("Invalid file pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    /// A file system operation on an input file failed
    #[error("File operation failed for '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record named a device type with no configured destination
    #[error("Unknown device type '{device_type}' in '{}'", .path.display())]
    UnknownDeviceType { path: PathBuf, device_type: String },

    /// Store writes were still failing after every retry
    #[error("{failures} write(s) failed after retries while loading '{}'", .path.display())]
    WriteExhausted { path: PathBuf, failures: u64 },

    /// A file's error rate reached the acceptance threshold
    #[error("High error rate in '{}' ({rate:.4} >= {threshold}). Failed load", .path.display())]
    HighErrorRate {
        path: PathBuf,
        rate: f64,
        threshold: f64,
    },

    /// A pipeline channel closed while work was still in flight
    #[error("Pipeline channel closed: {0}")]
    ChannelClosed(&'static str),

    /// A worker task panicked or was aborted
    #[error("Worker task failed: {0}")]
    Worker(String),

    /// The run was cancelled before it finished
    #[error("Load cancelled")]
    Cancelled,

    /// A sample line failed to parse during the self-test
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// The protobuf codec failed during the self-test
    #[error(transparent)]
    Codec(#[from] memc_common::CodecError),
}

impl LoadError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a file I/O error
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
