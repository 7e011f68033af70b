//! Property-Based Tests for Cache Compression
//!
//! # Test Properties
//!
//! 1. **Codec Roundtrip**: decompress(compress(data)) = data for any input
//! 2. **Store Roundtrip**: values at, just below and well above the
//!    compression threshold read back identical through the store
//! 3. **Threshold**: payloads at or below the threshold are never compressed

#![cfg(test)]

use std::sync::Arc;

use proptest::prelude::*;

use super::compression::{CompressionAlgorithm, PayloadCompressor};
use super::cache_core::CacheCore;
use super::CacheConfig;
use crate::adapters::InMemoryKeyValueStore;
use crate::clock::SystemClock;

const THRESHOLD: usize = 256;

// =============================================================================
// Property Strategies
// =============================================================================

/// Byte payloads spread around the threshold
fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..THRESHOLD),
        prop::collection::vec(any::<u8>(), THRESHOLD..=THRESHOLD + 1),
        prop::collection::vec(any::<u8>(), THRESHOLD * 4..THRESHOLD * 16),
        // repetitive text compresses for real
        "[a-c]{1,8}".prop_map(|unit| unit.repeat(THRESHOLD).into_bytes()),
    ]
}

/// JSON string values whose encoded length lands exactly on, one below and
/// far above the threshold. JSON adds two quote bytes.
fn sized_string_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(THRESHOLD - 2),
        Just(THRESHOLD - 3),
        Just(THRESHOLD - 1),
        (THRESHOLD * 2..THRESHOLD * 20),
    ]
    .prop_flat_map(|len| prop::collection::vec(prop::char::range('a', 'f'), len))
    .prop_map(|chars| chars.into_iter().collect::<String>())
}

fn cache() -> CacheCore {
    let clock = SystemClock::shared();
    CacheCore::new(
        Arc::new(InMemoryKeyValueStore::new(clock.clone())),
        clock,
        "prop",
        CacheConfig {
            compression_threshold: THRESHOLD,
            ..Default::default()
        },
    )
}

// =============================================================================
// Roundtrip Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: the codec is lossless
    #[test]
    fn prop_codec_roundtrip(data in payload_strategy()) {
        let compressor = PayloadCompressor::with_threshold(THRESHOLD);
        let (stored, algorithm) = compressor.compress(&data);

        if data.len() <= THRESHOLD {
            prop_assert_eq!(algorithm, CompressionAlgorithm::None);
        }
        if algorithm == CompressionAlgorithm::Lz4 {
            prop_assert!(stored.len() < data.len());
        }

        let restored = compressor.decompress(&stored, algorithm)?;
        prop_assert_eq!(restored.as_ref(), data.as_slice());
    }

    /// Property: values survive a store-and-read cycle byte for byte
    #[test]
    fn prop_store_roundtrip(value in sized_string_strategy()) {
        let cache = cache();

        let hit = tokio_test::block_on(async {
            cache.set("value", &value, None).await.unwrap();
            cache.get_entry::<String>("value").await
        });

        let hit = hit.expect("value should be cached");
        if value.len() + 2 <= THRESHOLD {
            prop_assert!(!hit.compressed);
        }
        prop_assert_eq!(hit.value, value);
    }
}
