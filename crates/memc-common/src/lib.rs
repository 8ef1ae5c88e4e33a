//! memc-load Common Library
//!
//! Shared types, utilities, and error handling for the memc-load workspace.
//!
//! # Overview
//!
//! - **Codec**: the `UserApps` protobuf value written to memcached
//! - **Logging**: tracing subscriber setup for console and file output
//! - **Error Handling**: codec error and result types
//!
//! # Example
//!
//! ```no_run
//! use memc_common::codec::{decode, encode, UserApps};
//!
//! fn round_trip() -> memc_common::Result<()> {
//!     let value = UserApps::new(vec![1423, 43], 55.55, 42.42);
//!     let unpacked = decode(&encode(&value))?;
//!     assert_eq!(value, unpacked);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod codec;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use codec::UserApps;
pub use error::{CodecError, Result};
