//! # trustlayer
//!
//! Envelope encryption for sensitive fields and a tamper-evident,
//! hash-chained audit log.
//!
//! Sensitive values are sealed under a fresh data encryption key (DEK) per
//! call, and the DEK is wrapped under a versioned master key. Every
//! security-relevant action is appended to an audit chain in which each
//! entry commits to the hash of its predecessor, so retroactive edits or
//! deletions are detected by replaying the chain.
//!
//! ## Public API
//!
//! The public surface of this crate is intentionally narrow. Only the types
//! and functions re-exported here are intended for use by callers.
//!
//! ```no_run
//! use std::sync::Arc;
//! use trustlayer::{
//!     AuditAction, AuditChain, AuditEntryInput, EnvelopeCipher, MasterKeyStore, TrustConfig,
//! };
//!
//! # fn main() -> Result<(), trustlayer::TrustError> {
//! let config = TrustConfig::from_env()?;
//! let chain = AuditChain::open(config.open_store()?)?;
//! let keys = Arc::new(MasterKeyStore::from_config(config.keys)?);
//! let cipher = EnvelopeCipher::new(keys);
//!
//! let blob = cipher.encrypt("Patellar Luxation Grade 3")?;
//! chain.append(AuditEntryInput::new("vet-7", AuditAction::Write, "diagnosis", "dx-1"))?;
//!
//! assert_eq!(cipher.decrypt(&blob)?, "Patellar Luxation Grade 3");
//! assert!(chain.verify(None)?.valid);
//! # Ok(())
//! # }
//! ```

pub(crate) mod crypto;
pub mod anomaly;
pub mod audit;
pub mod chain;
pub mod config;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod store;

pub use anomaly::{scan, Alert, AlertType, AnomalyConfig, AnomalyScanner, Severity};
pub use audit::{AuditAction, AuditEntry, AuditEntryInput, MetadataValue, GENESIS_HASH};
pub use chain::{
    AppendPolicy, AuditChain, AuditFilters, ChainBreak, ChainState, Clock, RetryPolicy,
    SystemClock, VerificationResult,
};
pub use config::{KeyConfig, TrustConfig};
pub use envelope::{EncryptedData, EnvelopeCipher};
pub use error::TrustError;
pub use keys::{KeyVersion, MasterKey, MasterKeyStore};
pub use store::{AuditStore, FileAuditStore, MemoryAuditStore};

/// Generate a cryptographically secure master key.
///
/// Intended for tests and local development. In production, master keys
/// come from a KMS via [`TrustConfig`].
pub fn generate_master_key() -> Result<MasterKey, TrustError> {
    let bytes = crypto::random_array::<{ crypto::KEY_LEN }>()?;
    Ok(MasterKey::from_bytes(bytes))
}
