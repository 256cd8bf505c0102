//! Error Types for Meridian wire handling
//!
//! This module defines the errors that can occur while encoding, decoding,
//! compressing or decompressing batch frames.
//!
//! ## Error Categories
//!
//! ### Framing Errors
//! - `Truncated`: An entry ended before all declared bytes were present
//! - `VarintOverflow`: A varint used more than 10 bytes
//! - `InvalidUtf8`: A key or property was not valid UTF-8
//!
//! ### Compression Errors
//! - `Compression`: Failed to compress a batch payload
//! - `Decompression`: Failed to decompress a batch payload (likely corruption)
//! - `InvalidCompression`: Unknown compression tag on the wire
//!
//! ### Encryption Errors
//! - `Sealed`: Entries were requested from a frame whose payload is still encrypted
//!
//! ## Usage
//! All fallible functions in this crate return `Result<T>`, aliased to
//! `Result<T, Error>`, so callers can propagate with `?`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Truncated entry: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Varint too long")]
    VarintOverflow,

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("Invalid compression type: {0}")]
    InvalidCompression(u8),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Frame payload is encrypted")]
    Sealed,
}

pub type Result<T> = std::result::Result<T, Error>;
