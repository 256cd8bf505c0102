//! Variable-length Integer Encoding (Varint)
//!
//! Batch entries carry many small integers (sequence ids, lengths, property
//! counts). Varints store them in as few bytes as their magnitude needs:
//! - Small numbers (0-127) use just 1 byte
//! - Larger numbers use 2-10 bytes depending on magnitude
//! - Each byte uses 7 bits for data and 1 bit as a "continuation" flag
//!
//! Decoding never panics: truncated or overlong input surfaces as an
//! [`Error`](crate::Error) so a corrupt frame cannot take the process down.
//!
//! ## Usage
//! ```ignore
//! let mut buf = BytesMut::new();
//! encode_varint_u64(&mut buf, 300);
//! let value = decode_varint_u64(&mut buf.as_ref())?;
//! ```

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes};

/// Encode an unsigned integer as a varint
pub fn encode_varint_u64(buf: &mut impl BufMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;

        if value != 0 {
            byte |= 0x80; // Set continuation bit
        }

        buf.put_u8(byte);

        if value == 0 {
            break;
        }
    }
}

/// Decode a varint to an unsigned integer
pub fn decode_varint_u64(buf: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0;

    loop {
        if !buf.has_remaining() {
            return Err(Error::Truncated {
                needed: 1,
                remaining: 0,
            });
        }
        let byte = buf.get_u8();
        // The 10th byte may only carry the top bit of a u64
        if shift == 63 && byte > 1 {
            return Err(Error::VarintOverflow);
        }
        value |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            break;
        }

        shift += 7;

        if shift >= 64 {
            return Err(Error::VarintOverflow);
        }
    }

    Ok(value)
}

/// Number of bytes `value` occupies once varint encoded.
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Write a varint length prefix followed by the raw bytes.
pub fn put_length_prefixed(buf: &mut impl BufMut, data: &[u8]) {
    encode_varint_u64(buf, data.len() as u64);
    buf.put_slice(data);
}

/// Read a varint length prefix and split that many bytes off `buf`.
pub fn get_length_prefixed(buf: &mut Bytes) -> Result<Bytes> {
    let len = decode_varint_u64(buf)? as usize;
    if buf.remaining() < len {
        return Err(Error::Truncated {
            needed: len,
            remaining: buf.remaining(),
        });
    }
    Ok(buf.split_to(len))
}

/// Read a length-prefixed UTF-8 string; `field` names the value in errors.
pub fn get_string(buf: &mut Bytes, field: &'static str) -> Result<String> {
    let raw = get_length_prefixed(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Error::InvalidUtf8(field))
}
