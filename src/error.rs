//! Error types for trustlayer.
//!
//! Every variant is a distinct failure mode of the trust layer. Messages are
//! intentionally minimal. They signal *what* failed without revealing *why*
//! in ways that could leak cryptographic state.

use thiserror::Error;

/// The single error type for all trustlayer operations.
#[derive(Debug, Error)]
pub enum TrustError {
    /// Master key material is missing, malformed, or not exactly 32 bytes,
    /// or a configuration value could not be parsed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Decryption failed. Covers a tampered or corrupted ciphertext, tag or
    /// wrapped key alike. Deliberately carries no detail.
    #[error("decryption failed")]
    Decryption,

    /// The AEAD seal operation failed.
    #[error("encryption failed")]
    Encryption,

    /// The system's random number generator failed to produce bytes.
    #[error("randomness source failed")]
    Randomness,

    /// An audit entry could not be durably written or read back.
    #[error("audit storage error: {0}")]
    Storage(String),

    /// Chain verification found a broken link. Produced only from a
    /// verification result, never by append or query.
    #[error("audit chain integrity violation at index {index} (sequence {sequence})")]
    ChainIntegrityViolation { index: u64, sequence: u64 },

    /// An audit entry input failed validation.
    #[error("invalid audit entry: {0}")]
    InvalidEntry(String),
}

impl From<std::io::Error> for TrustError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for TrustError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
