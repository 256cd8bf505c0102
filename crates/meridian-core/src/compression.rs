//! Batch payload compression.
//!
//! Compression is applied to the encoded entries of a whole batch, before any
//! encryption. The codec tag travels on the frame so receivers know how to
//! undo it.

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Compression codec applied to a batch payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    None,
    Lz4,
    Zlib,
    Zstd,
    Snappy,
}

/// zstd level used for batches; favours speed on the publish path
const ZSTD_LEVEL: i32 = 3;

impl CompressionType {
    /// Tag written on the wire.
    pub fn as_u8(self) -> u8 {
        match self {
            CompressionType::None => 0,
            CompressionType::Lz4 => 1,
            CompressionType::Zlib => 2,
            CompressionType::Zstd => 3,
            CompressionType::Snappy => 4,
        }
    }

    pub fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Lz4),
            2 => Ok(CompressionType::Zlib),
            3 => Ok(CompressionType::Zstd),
            4 => Ok(CompressionType::Snappy),
            other => Err(Error::InvalidCompression(other)),
        }
    }

    pub fn compress(self, data: &[u8]) -> Result<Bytes> {
        match self {
            CompressionType::None => Ok(Bytes::copy_from_slice(data)),
            CompressionType::Lz4 => Ok(Bytes::from(lz4_flex::compress_prepend_size(data))),
            CompressionType::Zlib => {
                let mut encoder =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder
                    .write_all(data)
                    .map_err(|e| Error::Compression(e.to_string()))?;
                let compressed = encoder
                    .finish()
                    .map_err(|e| Error::Compression(e.to_string()))?;
                Ok(Bytes::from(compressed))
            }
            CompressionType::Zstd => zstd::encode_all(data, ZSTD_LEVEL)
                .map(Bytes::from)
                .map_err(|e| Error::Compression(e.to_string())),
            CompressionType::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map(Bytes::from)
                .map_err(|e| Error::Compression(e.to_string())),
        }
    }

    pub fn decompress(self, data: &[u8]) -> Result<Bytes> {
        match self {
            CompressionType::None => Ok(Bytes::copy_from_slice(data)),
            CompressionType::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map(Bytes::from)
                .map_err(|e| Error::Decompression(e.to_string())),
            CompressionType::Zlib => {
                let mut decoder = flate2::read::ZlibDecoder::new(data);
                let mut decompressed = Vec::new();
                decoder
                    .read_to_end(&mut decompressed)
                    .map_err(|e| Error::Decompression(e.to_string()))?;
                Ok(Bytes::from(decompressed))
            }
            CompressionType::Zstd => zstd::decode_all(data)
                .map(Bytes::from)
                .map_err(|e| Error::Decompression(e.to_string())),
            CompressionType::Snappy => snap::raw::Decoder::new()
                .decompress_vec(data)
                .map(Bytes::from)
                .map_err(|e| Error::Decompression(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [CompressionType; 5] = [
        CompressionType::None,
        CompressionType::Lz4,
        CompressionType::Zlib,
        CompressionType::Zstd,
        CompressionType::Snappy,
    ];

    #[test]
    fn test_every_codec_restores_input() {
        let data = "the quick brown fox ".repeat(200);
        for codec in ALL {
            let compressed = codec.compress(data.as_bytes()).unwrap();
            let restored = codec.decompress(&compressed).unwrap();
            assert_eq!(restored, data.as_bytes(), "codec {:?}", codec);
        }
    }

    #[test]
    fn test_repetitive_data_shrinks() {
        let data = vec![b'a'; 64 * 1024];
        for codec in ALL.into_iter().skip(1) {
            let compressed = codec.compress(&data).unwrap();
            assert!(compressed.len() < data.len() / 4, "codec {:?}", codec);
        }
    }

    #[test]
    fn test_tags_are_stable() {
        for codec in ALL {
            assert_eq!(CompressionType::from_u8(codec.as_u8()).unwrap(), codec);
        }
        assert!(matches!(
            CompressionType::from_u8(9),
            Err(Error::InvalidCompression(9))
        ));
    }

    #[test]
    fn test_corrupt_input_is_an_error() {
        let garbage = [0xFFu8; 16];
        assert!(CompressionType::Zlib.decompress(&garbage).is_err());
        assert!(CompressionType::Snappy.decompress(&garbage).is_err());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&CompressionType::Zstd).unwrap();
        assert_eq!(json, "\"zstd\"");
    }
}
