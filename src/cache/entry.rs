//! Cache Entry Envelope
//!
//! Every cached value is stored as one blob, written with a single `set`:
//!
//! ```text
//! ┌─────────┬────────┬──────────────────────┬─────────────────────┐
//! │ version │ flags  │ cached_at (i64 BE ms) │ payload             │
//! │ 1 byte  │ 1 byte │ 8 bytes              │ json, maybe lz4     │
//! └─────────┴────────┴──────────────────────┴─────────────────────┘
//! ```
//!
//! `flags` bit 0 marks an LZ4-compressed payload. `cached_at` lets the
//! stale-while-revalidate wrapper compute freshness without a second key.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};

use super::compression::CompressionAlgorithm;
use crate::error::{Error, Result};

/// Current envelope layout version
pub const ENVELOPE_VERSION: u8 = 1;

/// Header size in bytes
pub const HEADER_LEN: usize = 10;

const FLAG_LZ4: u8 = 0b0000_0001;

/// Stored representation of one cached value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEnvelope {
    /// When the value was computed (epoch millis, scheduling clock)
    pub cached_at_ms: i64,
    /// Encoding of `payload`
    pub algorithm: CompressionAlgorithm,
    /// Serialized (and possibly compressed) value
    pub payload: Bytes,
}

impl CacheEnvelope {
    pub fn new(cached_at_ms: i64, algorithm: CompressionAlgorithm, payload: Bytes) -> Self {
        Self {
            cached_at_ms,
            algorithm,
            payload,
        }
    }

    /// Serialize header + payload into one buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(ENVELOPE_VERSION);
        buf.put_u8(match self.algorithm {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => FLAG_LZ4,
        });
        buf.put_i64(self.cached_at_ms);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a stored blob. Anything malformed is a serialization error.
    pub fn decode(key: &str, raw: &Bytes) -> Result<Self> {
        let malformed = |reason: String| Error::Serialization {
            key: key.to_string(),
            reason,
        };

        if raw.len() < HEADER_LEN {
            return Err(malformed(format!(
                "envelope too short: {} bytes",
                raw.len()
            )));
        }
        if raw[0] != ENVELOPE_VERSION {
            return Err(malformed(format!("unknown envelope version {}", raw[0])));
        }

        let algorithm = match raw[1] {
            0 => CompressionAlgorithm::None,
            FLAG_LZ4 => CompressionAlgorithm::Lz4,
            other => return Err(malformed(format!("unknown envelope flags {:#04x}", other))),
        };

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&raw[2..HEADER_LEN]);

        Ok(Self {
            cached_at_ms: i64::from_be_bytes(ts),
            algorithm,
            payload: raw.slice(HEADER_LEN..),
        })
    }

    pub fn is_compressed(&self) -> bool {
        self.algorithm != CompressionAlgorithm::None
    }

    /// Age relative to `now_ms`, clamped at zero
    pub fn age(&self, now_ms: i64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.cached_at_ms).max(0) as u64)
    }
}

/// A decoded cache hit with its freshness metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue<T> {
    pub value: T,
    pub cached_at: DateTime<Utc>,
    pub age: Duration,
    pub compressed: bool,
}

impl<T> CachedValue<T> {
    pub(crate) fn from_envelope(value: T, envelope: &CacheEnvelope, now_ms: i64) -> Self {
        Self {
            value,
            cached_at: Utc
                .timestamp_millis_opt(envelope.cached_at_ms)
                .single()
                .unwrap_or_else(Utc::now),
            age: envelope.age(now_ms),
            compressed: envelope.is_compressed(),
        }
    }

    /// True once the value is at least `soft_ttl` old
    pub fn is_stale(&self, soft_ttl: Duration) -> bool {
        self.age >= soft_ttl
    }
}
