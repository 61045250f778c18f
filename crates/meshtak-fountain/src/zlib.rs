//! Zlib compression for mesh payloads.
//!
//! The peer decompresses with a stock zlib, so output must be a standard
//! zlib stream (`78 9C` header), never raw deflate.

use flate2::write::ZlibEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};
use std::io::Write;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ZlibError {
    #[error("compression failed: {0}")]
    CompressionFailed(String),

    #[error("decode failed: {0}")]
    DecodeFailed(String),
}

/// Compress to a standard zlib stream at the default level.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, ZlibError> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| ZlibError::CompressionFailed(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| ZlibError::CompressionFailed(e.to_string()))
}

/// Inflate a zlib stream, growing the output buffer by doubling across up to
/// three attempts.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, ZlibError> {
    if data.first() != Some(&0x78) {
        return Err(ZlibError::DecodeFailed("missing zlib header".into()));
    }

    let mut capacity = (data.len() * 4).max(8192);
    for _ in 0..3 {
        let mut inflater = Decompress::new(true);
        let mut out = Vec::with_capacity(capacity);
        match inflater.decompress_vec(data, &mut out, FlushDecompress::Finish) {
            Ok(Status::StreamEnd) => return Ok(out),
            Ok(Status::Ok) | Ok(Status::BufError) => capacity *= 2,
            Err(e) => return Err(ZlibError::DecodeFailed(e.to_string())),
        }
    }
    Err(ZlibError::DecodeFailed("output buffer limit reached".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let data = b"<event uid=\"U1\"/>".repeat(50);
        let compressed = compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_standard_header() {
        let compressed = compress(b"hello").unwrap();
        assert_eq!(compressed[0], 0x78);
        assert_eq!(compressed[1], 0x9C);
    }

    #[test]
    fn test_empty_roundtrip() {
        let compressed = compress(b"").unwrap();
        assert_eq!(decompress(&compressed).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(decompress(b"not zlib at all").is_err());
        // Right header, corrupt body.
        assert!(decompress(&[0x78, 0x9C, 0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_expansive_payload_grows_buffer() {
        // Compresses to a few dozen bytes but inflates past the initial
        // buffer, forcing the doubling retries.
        let data = vec![0u8; 20_000];
        let compressed = compress(&data).unwrap();
        assert!(compressed.len() < 100);
        assert_eq!(decompress(&compressed).unwrap(), data);
    }
}
