//! Envelope encryption of sensitive fields.
//!
//! Each call to [`EnvelopeCipher::encrypt`] draws a fresh DEK, seals the
//! plaintext under it, wraps the DEK under the current master key, and
//! returns both halves in one [`EncryptedData`]. The DEK is zeroised before
//! the call returns.
//!
//! Because content is sealed under the DEK and only the DEK is sealed under
//! the master key, rotating the master key requires re-wrapping the 64-byte
//! wrapped keys ([`EnvelopeCipher::rewrap`]), never re-encrypting content.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crypto::{self, IV_LEN, TAG_LEN};
use crate::error::TrustError;
use crate::keys::{Dek, KeyVersion, MasterKeyStore};

/// A sealed value. Immutable once created.
///
/// Persisted as a structured object with base64 byte fields:
///
/// ```json
/// {"iv":"..","authTag":"..","ciphertext":"..","wrappedKey":"..","keyVersion":1}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedData {
    #[serde(with = "base64_bytes")]
    iv: Vec<u8>,
    #[serde(with = "base64_bytes")]
    auth_tag: Vec<u8>,
    #[serde(with = "base64_bytes")]
    ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    wrapped_key: Vec<u8>,
    key_version: KeyVersion,
}

impl EncryptedData {
    /// Reassemble a blob from independently stored columns.
    ///
    /// No validation happens here; malformed parts fail at decrypt time.
    pub fn from_parts(
        iv: Vec<u8>,
        auth_tag: Vec<u8>,
        ciphertext: Vec<u8>,
        wrapped_key: Vec<u8>,
        key_version: KeyVersion,
    ) -> Self {
        Self {
            iv,
            auth_tag,
            ciphertext,
            wrapped_key,
            key_version,
        }
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn auth_tag(&self) -> &[u8] {
        &self.auth_tag
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn wrapped_key(&self) -> &[u8] {
        &self.wrapped_key
    }

    pub fn key_version(&self) -> KeyVersion {
        self.key_version
    }
}

/// Encrypts and decrypts field values using per-call DEKs.
///
/// Stateless between calls and safe to share across threads; the only
/// shared state is the injected [`MasterKeyStore`].
#[derive(Debug, Clone)]
pub struct EnvelopeCipher {
    keys: Arc<MasterKeyStore>,
}

impl EnvelopeCipher {
    pub fn new(keys: Arc<MasterKeyStore>) -> Self {
        Self { keys }
    }

    /// The key store this cipher wraps DEKs with.
    pub fn key_store(&self) -> &Arc<MasterKeyStore> {
        &self.keys
    }

    /// Seal a UTF-8 string.
    ///
    /// Fails with [`TrustError::Configuration`] when no master key is loaded;
    /// this is checked before any key material is generated.
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedData, TrustError> {
        self.keys.current_version()?;

        let dek = Dek::generate()?;
        let sealed = crypto::seal(dek.as_bytes(), plaintext.as_bytes(), &[])?;
        let (key_version, wrapped_key) = self.keys.wrap(&dek)?;
        drop(dek);

        Ok(EncryptedData {
            iv: sealed.iv.to_vec(),
            auth_tag: sealed.tag.to_vec(),
            ciphertext: sealed.ciphertext,
            wrapped_key,
            key_version,
        })
    }

    /// Open a blob produced by [`EnvelopeCipher::encrypt`].
    ///
    /// Tampering with any byte of the IV, tag, ciphertext or wrapped key
    /// fails with [`TrustError::Decryption`], never with altered plaintext.
    pub fn decrypt(&self, blob: &EncryptedData) -> Result<String, TrustError> {
        if blob.iv.len() != IV_LEN || blob.auth_tag.len() != TAG_LEN {
            return Err(TrustError::Decryption);
        }

        let dek = self.keys.unwrap(blob.key_version, &blob.wrapped_key)?;
        let plain = crypto::open(dek.as_bytes(), &blob.iv, &blob.auth_tag, &blob.ciphertext, &[])?;
        drop(dek);

        // `plain` is zeroised when dropped; copy out only once it is known
        // to be valid UTF-8.
        std::str::from_utf8(&plain)
            .map(str::to_owned)
            .map_err(|_| TrustError::Decryption)
    }

    /// Copy a sensitive value into a new record.
    ///
    /// Decrypts and re-encrypts under a fresh DEK and IV so the copy shares
    /// no key lineage with the source. Ciphertext is never copied verbatim.
    pub fn reencrypt(&self, blob: &EncryptedData) -> Result<EncryptedData, TrustError> {
        let plaintext = zeroize::Zeroizing::new(self.decrypt(blob)?);
        self.encrypt(&plaintext)
    }

    /// Re-wrap a blob's DEK under the current master key version.
    ///
    /// Content IV, tag and ciphertext are carried over unchanged. A blob
    /// already on the current version is returned as-is.
    pub fn rewrap(&self, blob: &EncryptedData) -> Result<EncryptedData, TrustError> {
        let current = self.keys.current_version()?;
        if blob.key_version == current {
            return Ok(blob.clone());
        }

        let dek = self.keys.unwrap(blob.key_version, &blob.wrapped_key)?;
        let (key_version, wrapped_key) = self.keys.wrap(&dek)?;
        drop(dek);

        tracing::debug!(
            from_version = blob.key_version,
            to_version = key_version,
            "re-wrapped data encryption key"
        );

        Ok(EncryptedData {
            iv: blob.iv.clone(),
            auth_tag: blob.auth_tag.clone(),
            ciphertext: blob.ciphertext.clone(),
            wrapped_key,
            key_version,
        })
    }
}

/// Serde adapter storing byte fields as standard base64 strings.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
