//! Wire batch representation.
//!
//! A `BatchFrame` is what a producer hands to a partition connection: the
//! metadata a broker needs to order and de-duplicate the batch, plus the
//! payload (encoded entries, compressed, then optionally encrypted).
//!
//! ```text
//! entries ──encode──▶ raw ──compress──▶ compressed ──seal (optional)──▶ payload
//! ```

use crate::compression::CompressionType;
use crate::entry::{decode_entries, MessageEntry};
use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

/// One data key wrapped for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedDataKey {
    /// Name of the recipient key, as configured on the producer
    pub key_name: String,

    /// Data key sealed under the recipient's wrapping key
    pub wrapped_key: Bytes,

    /// Metadata returned by the key reader for this recipient
    pub metadata: BTreeMap<String, String>,
}

/// Parameters a receiver needs to open a sealed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionMetadata {
    /// AEAD algorithm name, e.g. "AES-256-GCM"
    pub algorithm: String,

    /// Nonce used to seal the payload with the data key
    pub nonce: Bytes,

    /// The batch data key wrapped once per recipient
    pub keys: Vec<WrappedDataKey>,
}

/// Encryption state of a frame payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Encryption {
    /// Producer has no encryption configured
    #[default]
    None,

    /// Payload is sealed; receivers must unwrap a data key to read it
    Sealed(EncryptionMetadata),

    /// Encryption was configured but failed and the producer sent plaintext.
    /// Receivers must not attempt decryption.
    Bypassed,
}

/// A batch of messages destined for one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFrame {
    pub producer_name: String,
    pub topic: String,
    pub partition: u32,

    /// Sequence id of the first message in the batch
    pub sequence_id: u64,

    /// Sequence id of the last message in the batch
    pub highest_sequence_id: u64,

    pub num_messages: u32,

    /// Time the batch was flushed, ms since epoch
    pub publish_time: u64,

    pub compression: CompressionType,

    /// Size of the encoded entries before compression
    pub uncompressed_size: u32,

    pub encryption: Encryption,

    pub payload: Bytes,
}

impl BatchFrame {
    pub fn sequence_range(&self) -> RangeInclusive<u64> {
        self.sequence_id..=self.highest_sequence_id
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self.encryption, Encryption::Sealed(_))
    }

    /// Decompress and decode the entries of a frame whose payload is not
    /// sealed.
    pub fn entries(&self) -> Result<Vec<MessageEntry>> {
        if self.is_sealed() {
            return Err(Error::Sealed);
        }
        decode_compressed_entries(self.compression, &self.payload)
    }
}

/// Undo compression on a plaintext payload and split it into entries.
pub fn decode_compressed_entries(
    compression: CompressionType,
    payload: &[u8],
) -> Result<Vec<MessageEntry>> {
    let raw = compression.decompress(payload)?;
    decode_entries(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::encode_entries;

    fn frame(compression: CompressionType, encryption: Encryption) -> BatchFrame {
        let entries = vec![
            MessageEntry::new(7, Bytes::from("a")),
            MessageEntry::new(8, Bytes::from("b")),
        ];
        let raw = encode_entries(&entries);
        BatchFrame {
            producer_name: "producer-1".to_string(),
            topic: "orders".to_string(),
            partition: 0,
            sequence_id: 7,
            highest_sequence_id: 8,
            num_messages: 2,
            publish_time: 0,
            compression,
            uncompressed_size: raw.len() as u32,
            encryption,
            payload: compression.compress(&raw).unwrap(),
        }
    }

    #[test]
    fn test_entries_from_compressed_frame() {
        let frame = frame(CompressionType::Lz4, Encryption::None);
        let entries = frame.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].payload, Bytes::from("b"));
        assert_eq!(frame.sequence_range(), 7..=8);
    }

    #[test]
    fn test_bypassed_frame_is_readable() {
        let frame = frame(CompressionType::None, Encryption::Bypassed);
        assert!(!frame.is_sealed());
        assert_eq!(frame.entries().unwrap().len(), 2);
    }

    #[test]
    fn test_sealed_frame_refuses_plain_decode() {
        let meta = EncryptionMetadata {
            algorithm: "AES-256-GCM".to_string(),
            nonce: Bytes::from_static(&[0u8; 12]),
            keys: vec![],
        };
        let frame = frame(CompressionType::None, Encryption::Sealed(meta));
        assert!(matches!(frame.entries(), Err(Error::Sealed)));
    }
}
