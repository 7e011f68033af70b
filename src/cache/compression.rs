//! Payload Compression
//!
//! Serialized cache values larger than a configurable threshold are LZ4
//! compressed before they reach the store. The compressed form is only kept
//! when it is actually smaller, so the envelope flag always reflects what is
//! stored.
//!
//! # Example
//!
//! ```
//! use marketcache::cache::compression::{CompressionAlgorithm, PayloadCompressor};
//!
//! let compressor = PayloadCompressor::with_threshold(16);
//!
//! let data = b"listing listing listing listing listing listing listing";
//! let (stored, algorithm) = compressor.compress(data);
//! assert_eq!(algorithm, CompressionAlgorithm::Lz4);
//!
//! let restored = compressor.decompress(&stored, algorithm).unwrap();
//! assert_eq!(restored.as_ref(), data);
//! ```

use bytes::Bytes;
use tracing::warn;

use crate::error::{Error, Result};

/// Largest decompressed size a stored payload may claim
pub const MAX_DECOMPRESSED_SIZE: usize = 64 * 1024 * 1024;

// =============================================================================
// Compression Algorithm
// =============================================================================

/// How a stored payload is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    /// Stored as-is
    None,
    /// LZ4 block with prepended original size
    Lz4,
}

impl CompressionAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// A single compression codec.
pub trait Compressor: Send + Sync {
    fn algorithm(&self) -> CompressionAlgorithm;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// LZ4 block codec.
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    pub fn new() -> Self {
        Self { level: 4 }
    }

    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let failed = |reason: String| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason,
        };

        // The block carries its original size as a little-endian i32 and
        // the codec allocates that much up front.
        let prefix: [u8; 4] = data
            .get(..4)
            .and_then(|p| p.try_into().ok())
            .ok_or_else(|| failed("missing size prefix".into()))?;
        let claimed = i32::from_le_bytes(prefix);
        if claimed < 0 || claimed as usize > MAX_DECOMPRESSED_SIZE {
            return Err(failed(format!("declared size {} out of range", claimed)));
        }

        lz4::block::decompress(data, None).map_err(|e| failed(e.to_string()))
    }
}

// =============================================================================
// Payload Compressor
// =============================================================================

/// Threshold-driven compression for cache payloads.
pub struct PayloadCompressor {
    /// Payloads strictly larger than this are compressed
    threshold: usize,
    lz4: Lz4Compressor,
}

impl PayloadCompressor {
    pub fn new(threshold: usize, level: i32) -> Self {
        Self {
            threshold,
            lz4: Lz4Compressor::with_level(level),
        }
    }

    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            threshold,
            lz4: Lz4Compressor::new(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Compress when above the threshold and worthwhile.
    ///
    /// Compression failures fall back to the raw payload; a cache write never
    /// fails because of the codec.
    pub fn compress(&self, data: &[u8]) -> (Bytes, CompressionAlgorithm) {
        if data.len() <= self.threshold {
            return (Bytes::copy_from_slice(data), CompressionAlgorithm::None);
        }

        match self.lz4.compress(data) {
            Ok(compressed) if compressed.len() < data.len() => {
                (Bytes::from(compressed), CompressionAlgorithm::Lz4)
            }
            Ok(_) => (Bytes::copy_from_slice(data), CompressionAlgorithm::None),
            Err(e) => {
                warn!("Compression failed, storing uncompressed: {}", e);
                (Bytes::copy_from_slice(data), CompressionAlgorithm::None)
            }
        }
    }

    /// Reverse [`compress`](Self::compress)
    pub fn decompress(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Bytes> {
        match algorithm {
            CompressionAlgorithm::None => Ok(Bytes::copy_from_slice(data)),
            CompressionAlgorithm::Lz4 => self.lz4.decompress(data).map(Bytes::from),
        }
    }
}

impl Default for PayloadCompressor {
    fn default() -> Self {
        Self::with_threshold(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_DATA: &[u8] = b"Hello, this is test data that should compress well. \
        It has some repetition: Hello, this is test data that should compress well.";

    #[test]
    fn test_lz4_roundtrip() {
        let compressor = Lz4Compressor::new();

        let compressed = compressor.compress(TEST_DATA).unwrap();
        assert!(compressed.len() < TEST_DATA.len());

        let decompressed = compressor.decompress(&compressed).unwrap();
        assert_eq!(decompressed, TEST_DATA);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let compressor = PayloadCompressor::with_threshold(TEST_DATA.len());
        let (_, algorithm) = compressor.compress(TEST_DATA);
        assert_eq!(algorithm, CompressionAlgorithm::None);

        let compressor = PayloadCompressor::with_threshold(TEST_DATA.len() - 1);
        let (_, algorithm) = compressor.compress(TEST_DATA);
        assert_eq!(algorithm, CompressionAlgorithm::Lz4);
    }

    #[test]
    fn test_incompressible_data_stays_raw() {
        let compressor = PayloadCompressor::with_threshold(16);

        // Short and high-entropy: LZ4 framing makes it larger
        let data: Vec<u8> = (0..64u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let (stored, algorithm) = compressor.compress(&data);

        if algorithm == CompressionAlgorithm::None {
            assert_eq!(stored.as_ref(), data.as_slice());
        } else {
            assert!(stored.len() < data.len());
        }
        let restored = compressor.decompress(&stored, algorithm).unwrap();
        assert_eq!(restored.as_ref(), data.as_slice());
    }

    #[test]
    fn test_corrupt_lz4_is_an_error() {
        let compressor = PayloadCompressor::default();
        let err = compressor
            .decompress(&[0xff, 0xff, 0xff, 0xff, 1, 2, 3], CompressionAlgorithm::Lz4)
            .unwrap_err();
        assert!(matches!(err, Error::DecompressionFailed { .. }));
    }

    #[test]
    fn test_oversized_size_prefix_is_rejected() {
        let compressor = Lz4Compressor::new();

        // Valid block, then claim a 1 GiB original size
        let mut block = compressor.compress(TEST_DATA).unwrap();
        block[..4].copy_from_slice(&(1i32 << 30).to_le_bytes());
        let err = compressor.decompress(&block).unwrap_err();
        assert!(matches!(
            err,
            Error::DecompressionFailed { ref reason, .. } if reason.contains("out of range")
        ));

        let over_cap = (MAX_DECOMPRESSED_SIZE as i32 + 1).to_le_bytes();
        block[..4].copy_from_slice(&over_cap);
        assert!(compressor.decompress(&block).is_err());

        assert!(compressor.decompress(&[1, 0]).is_err());
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(CompressionAlgorithm::None.name(), "none");
        assert_eq!(CompressionAlgorithm::Lz4.to_string(), "lz4");
    }
}
