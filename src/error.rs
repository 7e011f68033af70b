//! Error types for the coordination layer

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the coordination layer
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Key-Value Store Errors
    // =========================================================================
    /// The shared store is unreachable or timed out. Transient: foreground
    /// callers degrade (cache bypass, inactive read) instead of failing.
    #[error("Key-value store unavailable during {operation}: {reason}")]
    StoreUnavailable { operation: String, reason: String },

    /// Stored value had an unexpected type for the requested operation
    #[error("Wrong value type at key {key}: {reason}")]
    WrongType { key: String, reason: String },

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// Malformed cached payload
    #[error("Serialization error for key {key}: {reason}")]
    Serialization { key: String, reason: String },

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    // =========================================================================
    // Durable Store / Background Job Errors
    // =========================================================================
    /// A durable write for one entity failed during flush; retried next cycle
    #[error("Flush failed for {counter} entity {entity_id}: {reason}")]
    FlushPartialFailure {
        counter: String,
        entity_id: String,
        reason: String,
    },

    /// Durable store rejected a write
    #[error("Durable store error for {id}: {reason}")]
    Durable { id: String, reason: String },

    /// Event publishing failed
    #[error("Failed to publish {event_type}: {reason}")]
    Publish { event_type: String, reason: String },

    // =========================================================================
    // Scheduler Errors
    // =========================================================================
    /// Job id already registered
    #[error("Job already registered: {0}")]
    JobAlreadyRegistered(String),

    /// Job id unknown
    #[error("Job not found: {0}")]
    JobNotFound(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a store outage on `operation`.
    pub fn unavailable(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::StoreUnavailable {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// True for transient store outages that should trigger degraded mode.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Error::StoreUnavailable { .. })
    }
}
