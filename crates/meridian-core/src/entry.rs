//! Message Entry Encoding
//!
//! This module defines `MessageEntry` - one application message as it travels
//! inside a batch frame - and the codec that concatenates entries into a batch
//! payload.
//!
//! ## Structure
//! Each entry contains:
//! - **sequence_id**: Producer-assigned id used for ordering and de-duplication
//! - **key**: Optional partition key (also carried so consumers can read it)
//! - **event_time**: Optional application event timestamp (ms since epoch)
//! - **properties**: String key/value metadata
//! - **payload**: The message body (arbitrary bytes)
//!
//! ## Wire Layout
//! ```text
//! ┌──────────────┬───────┬─────────────┬──────────────┬────────────┬─────────────┐
//! │ sequence_id  │ flags │ key?        │ event_time?  │ properties │ payload     │
//! │ varint       │ u8    │ len+utf8    │ varint       │ n × (k,v)  │ len+bytes   │
//! └──────────────┴───────┴─────────────┴──────────────┴────────────┴─────────────┘
//! ```
//! Entries are written back to back; a batch of one is encoded the same way
//! as a batch of many, so receivers have a single decode path.

use crate::error::{Error, Result};
use crate::varint::{
    decode_varint_u64, encode_varint_u64, get_length_prefixed, get_string, put_length_prefixed,
    varint_len,
};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const FLAG_KEY: u8 = 0b01;
const FLAG_EVENT_TIME: u8 = 0b10;

/// A single message inside a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEntry {
    /// Producer sequence id of this message
    pub sequence_id: u64,

    /// Optional partition key
    pub key: Option<String>,

    /// Optional event time in milliseconds since epoch
    pub event_time: Option<u64>,

    /// Application properties
    pub properties: BTreeMap<String, String>,

    /// Payload
    pub payload: Bytes,
}

impl MessageEntry {
    pub fn new(sequence_id: u64, payload: Bytes) -> Self {
        Self {
            sequence_id,
            key: None,
            event_time: None,
            properties: BTreeMap::new(),
            payload,
        }
    }

    /// Exact number of bytes this entry occupies once encoded.
    pub fn encoded_len(&self) -> usize {
        let mut len = varint_len(self.sequence_id) + 1;
        if let Some(key) = &self.key {
            len += varint_len(key.len() as u64) + key.len();
        }
        if let Some(ts) = self.event_time {
            len += varint_len(ts);
        }
        len += varint_len(self.properties.len() as u64);
        for (k, v) in &self.properties {
            len += varint_len(k.len() as u64) + k.len();
            len += varint_len(v.len() as u64) + v.len();
        }
        len + varint_len(self.payload.len() as u64) + self.payload.len()
    }

    /// Append this entry to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        encode_varint_u64(buf, self.sequence_id);

        let mut flags = 0u8;
        if self.key.is_some() {
            flags |= FLAG_KEY;
        }
        if self.event_time.is_some() {
            flags |= FLAG_EVENT_TIME;
        }
        buf.put_u8(flags);

        if let Some(key) = &self.key {
            put_length_prefixed(buf, key.as_bytes());
        }
        if let Some(ts) = self.event_time {
            encode_varint_u64(buf, ts);
        }

        encode_varint_u64(buf, self.properties.len() as u64);
        for (k, v) in &self.properties {
            put_length_prefixed(buf, k.as_bytes());
            put_length_prefixed(buf, v.as_bytes());
        }

        put_length_prefixed(buf, &self.payload);
    }

    /// Decode one entry from the front of `buf`, advancing it.
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let sequence_id = decode_varint_u64(buf)?;

        if buf.is_empty() {
            return Err(Error::Truncated {
                needed: 1,
                remaining: 0,
            });
        }
        let flags = buf.split_to(1)[0];

        let key = if flags & FLAG_KEY != 0 {
            Some(get_string(buf, "key")?)
        } else {
            None
        };
        let event_time = if flags & FLAG_EVENT_TIME != 0 {
            Some(decode_varint_u64(buf)?)
        } else {
            None
        };

        let count = decode_varint_u64(buf)?;
        let mut properties = BTreeMap::new();
        for _ in 0..count {
            let k = get_string(buf, "property name")?;
            let v = get_string(buf, "property value")?;
            properties.insert(k, v);
        }

        let payload = get_length_prefixed(buf)?;

        Ok(Self {
            sequence_id,
            key,
            event_time,
            properties,
            payload,
        })
    }
}

/// Concatenate entries into one uncompressed batch payload.
pub fn encode_entries(entries: &[MessageEntry]) -> Bytes {
    let total: usize = entries.iter().map(MessageEntry::encoded_len).sum();
    let mut buf = BytesMut::with_capacity(total);
    for entry in entries {
        entry.encode(&mut buf);
    }
    buf.freeze()
}

/// Split an uncompressed batch payload back into its entries.
pub fn decode_entries(mut payload: Bytes) -> Result<Vec<MessageEntry>> {
    let mut entries = Vec::new();
    while !payload.is_empty() {
        entries.push(MessageEntry::decode(&mut payload)?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with_everything() -> MessageEntry {
        let mut entry = MessageEntry::new(42, Bytes::from("order data"));
        entry.key = Some("user123".to_string());
        entry.event_time = Some(1_700_000_000_000);
        entry
            .properties
            .insert("source".to_string(), "checkout".to_string());
        entry
    }

    #[test]
    fn test_encoded_len_is_exact() {
        let entries = [
            MessageEntry::new(0, Bytes::new()),
            MessageEntry::new(u64::MAX, Bytes::from(vec![7u8; 300])),
            entry_with_everything(),
        ];
        for entry in &entries {
            let mut buf = BytesMut::new();
            entry.encode(&mut buf);
            assert_eq!(buf.len(), entry.encoded_len());
        }
    }

    #[test]
    fn test_batch_preserves_entry_order() {
        let entries: Vec<_> = (10..15)
            .map(|seq| MessageEntry::new(seq, Bytes::from(format!("msg-{}", seq))))
            .collect();

        let decoded = decode_entries(encode_entries(&entries)).unwrap();
        let sequence_ids: Vec<u64> = decoded.iter().map(|e| e.sequence_id).collect();
        assert_eq!(sequence_ids, vec![10, 11, 12, 13, 14]);
        assert_eq!(decoded[3].payload, Bytes::from("msg-13"));
    }

    #[test]
    fn test_optional_fields_survive() {
        let decoded = decode_entries(encode_entries(&[entry_with_everything()])).unwrap();
        assert_eq!(decoded, vec![entry_with_everything()]);
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let payload = encode_entries(&[entry_with_everything()]);
        let cut = payload.slice(..payload.len() - 3);
        assert!(matches!(
            decode_entries(cut),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn test_empty_payload_has_no_entries() {
        assert!(decode_entries(Bytes::new()).unwrap().is_empty());
    }
}
