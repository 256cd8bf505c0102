//! Meridian Core - wire types shared by producers and brokers
//!
//! - [`entry`]: one message inside a batch and the batch payload codec
//! - [`compression`]: per-batch payload codecs
//! - [`frame`]: the batch frame handed to a partition connection
//! - [`message_id`]: broker-assigned message position

pub mod compression;
pub mod entry;
pub mod error;
pub mod frame;
pub mod message_id;
pub mod varint;

pub use compression::CompressionType;
pub use entry::{decode_entries, encode_entries, MessageEntry};
pub use error::{Error, Result};
pub use frame::{BatchFrame, Encryption, EncryptionMetadata, WrappedDataKey};
pub use message_id::MessageId;
