//! Configuration
//!
//! [`CoordinationConfig`] aggregates the per-component settings. It can be
//! built from defaults or loaded from YAML, where durations are written as
//! short strings such as `"250ms"`, `"30s"`, `"5m"` or `"1h30m"`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::counters::CounterConfig;
use crate::ephemeral::EphemeralConfig;
use crate::error::{Error, Result};
use crate::expiration::ExpirationConfig;

// =============================================================================
// Store Configuration
// =============================================================================

/// Settings shared by everything that talks to the key-value store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Upper bound on any single store operation
    #[serde(with = "duration_str")]
    pub op_timeout: Duration,

    /// Namespace prepended to every key
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_millis(250),
            key_prefix: "mc".to_string(),
        }
    }
}

// =============================================================================
// Top-level Configuration
// =============================================================================

/// Full configuration for the coordination layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub counters: CounterConfig,
    pub expiration: ExpirationConfig,
    pub ephemeral: EphemeralConfig,
}

impl CoordinationConfig {
    /// Parse from a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Reject settings that would break component invariants
    pub fn validate(&self) -> Result<()> {
        if self.store.op_timeout.is_zero() {
            return Err(Error::Config("store.op_timeout must be non-zero".into()));
        }
        if self.store.key_prefix.is_empty() {
            return Err(Error::Config("store.key_prefix must not be empty".into()));
        }
        if self.cache.soft_ttl >= self.cache.hard_ttl {
            return Err(Error::Config(format!(
                "cache.soft_ttl ({:?}) must be below cache.hard_ttl ({:?})",
                self.cache.soft_ttl, self.cache.hard_ttl
            )));
        }
        if self.cache.page_size == 0 {
            return Err(Error::Config("cache.page_size must be at least 1".into()));
        }
        for (name, interval) in [
            ("counters.flush_interval", self.counters.flush_interval),
            ("expiration.reap_interval", self.expiration.reap_interval),
            (
                "ephemeral.viewer_reap_interval",
                self.ephemeral.viewer_reap_interval,
            ),
        ] {
            if interval.is_zero() {
                return Err(Error::Config(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a duration string like "250ms", "30s", "5m", "1h30m" or "7d".
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let multiplier = match c {
            'm' | 'M' if matches!(chars.peek(), Some('s') | Some('S')) => {
                chars.next();
                1
            }
            'd' | 'D' => 86_400_000,
            'h' | 'H' => 3_600_000,
            'm' | 'M' => 60_000,
            's' | 'S' => 1_000,
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };

        total_ms = accumulate(total_ms, num, multiplier, s)?;
    }

    // Trailing number without a unit
    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_ms = accumulate(total_ms, num, 1_000, s)?;
    }

    Ok(Duration::from_millis(total_ms))
}

fn accumulate(total_ms: u64, num: u64, multiplier: u64, s: &str) -> Result<u64> {
    num.checked_mul(multiplier)
        .and_then(|ms| total_ms.checked_add(ms))
        .ok_or_else(|| Error::DurationParse(format!("duration out of range: {}", s)))
}

/// Render a duration in the shortest form [`parse_duration`] accepts.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis() as u64;
    if ms % 1_000 != 0 {
        return format!("{}ms", ms);
    }
    let secs = ms / 1_000;
    match secs {
        s if s != 0 && s % 86_400 == 0 => format!("{}d", s / 86_400),
        s if s != 0 && s % 3_600 == 0 => format!("{}h", s / 3_600),
        s if s != 0 && s % 60 == 0 => format!("{}m", s / 60),
        s => format!("{}s", s),
    }
}

/// Serde adapter for duration strings
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
