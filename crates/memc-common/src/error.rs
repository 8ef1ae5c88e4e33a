//! Error types shared by memc-load crates

use thiserror::Error;

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors raised while converting records to and from their stored form
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Round trip mismatch in field '{field}': expected {expected}, got {actual}")]
    Mismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },
}

impl CodecError {
    /// Create a field mismatch error
    pub fn mismatch(
        field: &'static str,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        Self::Mismatch {
            field,
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        }
    }
}
