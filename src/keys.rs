//! Key ownership and DEK wrapping.
//!
//! This module owns two responsibilities:
//! 1. Holding key material (master keys and DEKs) in types that are opaque,
//!    non-cloneable, and zeroised on drop.
//! 2. Wrapping and unwrapping DEKs under a versioned set of master keys.
//!
//! ## Wrapped key layout
//!
//! ```text
//! [ iv (16 bytes) ][ GCM tag (16 bytes) ][ encrypted DEK (32 bytes) ]
//! ```
//!
//! The wrap is authenticated against `"trustlayer.dek.v1" || version (u32 BE)`
//! so a wrapped key cannot be replayed under a different key version.
//!
//! ## Rotation
//!
//! New wraps always use the current version. Older versions are kept so
//! existing blobs keep unwrapping; rotation never removes a version.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{self, IV_LEN, KEY_LEN, TAG_LEN};
use crate::error::TrustError;

/// Length of a wrapped DEK: IV + tag + 32-byte ciphertext.
pub const WRAPPED_KEY_LEN: usize = IV_LEN + TAG_LEN + KEY_LEN;

/// Identifies which master key wrapped a DEK.
pub type KeyVersion = u32;

const WRAP_AAD_PREFIX: &[u8] = b"trustlayer.dek.v1";

// ---------------------------------------------------------------------------
// Master key
// ---------------------------------------------------------------------------

/// A 256-bit master key.
///
/// - Not `Clone`. Cannot be duplicated without explicit conversion.
/// - Zeroised on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_LEN],
}

impl MasterKey {
    /// Construct a `MasterKey` from raw bytes.
    ///
    /// In production, the caller should source these bytes from a KMS.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Construct a `MasterKey` from a slice that must be exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TrustError> {
        let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            TrustError::Configuration(format!(
                "master key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self::from_bytes(array))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

// ---------------------------------------------------------------------------
// Data encryption key
// ---------------------------------------------------------------------------

/// A single-use data encryption key.
///
/// Lives only for the duration of one encrypt or decrypt call and is
/// zeroised when dropped. Raw bytes never leave the crate.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct Dek {
    bytes: [u8; KEY_LEN],
}

impl Dek {
    /// Draw a fresh random DEK.
    pub(crate) fn generate() -> Result<Self, TrustError> {
        let mut dek = Self {
            bytes: [0u8; KEY_LEN],
        };
        crypto::fill_random(&mut dek.bytes)?;
        Ok(dek)
    }

    /// Copy unwrapped key bytes straight into their zeroised home.
    fn from_plain(plain: &[u8]) -> Result<Self, TrustError> {
        if plain.len() != KEY_LEN {
            return Err(TrustError::Decryption);
        }
        let mut dek = Self {
            bytes: [0u8; KEY_LEN],
        };
        dek.bytes.copy_from_slice(plain);
        Ok(dek)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

// ---------------------------------------------------------------------------
// Master key store
// ---------------------------------------------------------------------------

/// Holds the current master key and every historical version still needed
/// to unwrap existing DEKs.
///
/// Constructed explicitly and shared by reference (usually an `Arc`) with
/// every `EnvelopeCipher`. Read-only after construction except for
/// [`MasterKeyStore::rotate`].
#[derive(Debug, Default)]
pub struct MasterKeyStore {
    inner: RwLock<KeyRing>,
}

#[derive(Debug, Default)]
struct KeyRing {
    current: Option<KeyVersion>,
    keys: BTreeMap<KeyVersion, MasterKey>,
}

impl MasterKeyStore {
    /// A store with no key loaded. Every wrap or unwrap fails with
    /// [`TrustError::Configuration`] until a key is added.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A store whose current key is `key` at `version`.
    pub fn new(version: KeyVersion, key: MasterKey) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(version, key);
        Self {
            inner: RwLock::new(KeyRing {
                current: Some(version),
                keys,
            }),
        }
    }

    /// Register a historical key used only for unwrapping.
    ///
    /// Fails if the version is already present.
    pub fn add_historical(&self, version: KeyVersion, key: MasterKey) -> Result<(), TrustError> {
        let mut ring = self.inner.write();
        if ring.keys.contains_key(&version) {
            return Err(TrustError::Configuration(format!(
                "master key version {version} already loaded"
            )));
        }
        ring.keys.insert(version, key);
        Ok(())
    }

    /// Make `key` the current master key under a new `version`.
    ///
    /// The version must be strictly greater than every loaded version.
    /// Previous versions stay available for unwrapping.
    pub fn rotate(&self, version: KeyVersion, key: MasterKey) -> Result<(), TrustError> {
        let mut ring = self.inner.write();
        if let Some(latest) = ring.keys.keys().next_back() {
            if version <= *latest {
                return Err(TrustError::Configuration(format!(
                    "rotation version {version} must exceed {latest}"
                )));
            }
        }
        ring.keys.insert(version, key);
        ring.current = Some(version);
        tracing::info!(key_version = version, "master key rotated");
        Ok(())
    }

    /// The version new wraps are produced under.
    pub fn current_version(&self) -> Result<KeyVersion, TrustError> {
        self.inner
            .read()
            .current
            .ok_or_else(|| TrustError::Configuration("no master key loaded".into()))
    }

    /// Every loaded version, ascending.
    pub fn versions(&self) -> Vec<KeyVersion> {
        self.inner.read().keys.keys().copied().collect()
    }

    /// Wrap a DEK under the current master key.
    ///
    /// Returns the version used and the 64-byte wrapped key.
    pub(crate) fn wrap(&self, dek: &Dek) -> Result<(KeyVersion, Vec<u8>), TrustError> {
        let ring = self.inner.read();
        let version = ring
            .current
            .ok_or_else(|| TrustError::Configuration("no master key loaded".into()))?;
        let master = ring.keys.get(&version).ok_or_else(|| {
            TrustError::Configuration(format!("current master key {version} missing"))
        })?;

        let sealed = crypto::seal(master.as_bytes(), dek.as_bytes(), &wrap_aad(version))?;

        let mut wrapped = Vec::with_capacity(WRAPPED_KEY_LEN);
        wrapped.extend_from_slice(&sealed.iv);
        wrapped.extend_from_slice(&sealed.tag);
        wrapped.extend_from_slice(&sealed.ciphertext);
        Ok((version, wrapped))
    }

    /// Recover a DEK wrapped under `version`.
    ///
    /// An unknown version is a configuration problem. Everything else that
    /// goes wrong, including a wrong length, fails with
    /// [`TrustError::Decryption`].
    pub(crate) fn unwrap(&self, version: KeyVersion, wrapped: &[u8]) -> Result<Dek, TrustError> {
        let ring = self.inner.read();
        if ring.keys.is_empty() {
            return Err(TrustError::Configuration("no master key loaded".into()));
        }
        let master = ring.keys.get(&version).ok_or_else(|| {
            TrustError::Configuration(format!("unknown master key version {version}"))
        })?;

        if wrapped.len() != WRAPPED_KEY_LEN {
            return Err(TrustError::Decryption);
        }
        let (iv, rest) = wrapped.split_at(IV_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let plain = crypto::open(master.as_bytes(), iv, tag, ciphertext, &wrap_aad(version))?;
        Dek::from_plain(&plain)
    }
}

fn wrap_aad(version: KeyVersion) -> Vec<u8> {
    let mut aad = Vec::with_capacity(WRAP_AAD_PREFIX.len() + 4);
    aad.extend_from_slice(WRAP_AAD_PREFIX);
    aad.extend_from_slice(&version.to_be_bytes());
    aad
}
