//! Low-level cryptographic operations.
//!
//! This module is the only place in the crate that touches the AEAD cipher,
//! the system random number generator, or the hash function directly. All
//! other modules seal, open, and digest exclusively through the functions
//! exposed here.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM (authenticated encryption)
//! - **IV**: 128-bit (16 bytes), generated fresh per operation via `SystemRandom`
//! - **Tag**: 128-bit (16 bytes), kept detached from the ciphertext
//! - **Key size**: 256 bits (32 bytes)
//! - **Digest**: SHA-256

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Key, Nonce, Tag};
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

use crate::error::TrustError;

/// AES-256-GCM parameterised for a 16-byte IV. Non-96-bit IVs are run
/// through GHASH to derive the initial counter block.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// Size of the IV in bytes (128 bits).
pub const IV_LEN: usize = 16;

/// Size of the GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

/// Size of a master key or DEK in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Output of a single seal operation, with the tag detached.
pub(crate) struct Sealed {
    pub iv: [u8; IV_LEN],
    pub tag: [u8; TAG_LEN],
    pub ciphertext: Vec<u8>,
}

/// Fill a fixed-size buffer from the system CSPRNG.
///
/// `SystemRandom` is the only source of randomness in the crate. There is no
/// IV caching or counter-based generation.
pub(crate) fn random_array<const N: usize>() -> Result<[u8; N], TrustError> {
    let mut buf = [0u8; N];
    fill_random(&mut buf)?;
    Ok(buf)
}

/// Fill `buf` in place, for secrets that must not be copied through the stack.
pub(crate) fn fill_random(buf: &mut [u8]) -> Result<(), TrustError> {
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| TrustError::Randomness)
}

/// Encrypt `plaintext` under `key` with a fresh random IV.
///
/// `aad` is authenticated but not encrypted. Pass an empty slice when there
/// is nothing to bind.
pub(crate) fn seal(
    key: &[u8; KEY_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Sealed, TrustError> {
    let cipher = Aes256Gcm16::new(Key::<Aes256Gcm16>::from_slice(key));
    let iv = random_array::<IV_LEN>()?;

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::<U16>::from_slice(&iv), aad, &mut buffer)
        .map_err(|_| TrustError::Encryption)?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(Sealed {
        iv,
        tag: tag_bytes,
        ciphertext: buffer,
    })
}

/// Decrypt and authenticate a ciphertext produced by [`seal`].
///
/// Any length mismatch, wrong key, or tampered IV, tag, ciphertext or AAD
/// yields the same [`TrustError::Decryption`]. The caller receives no
/// partial plaintext.
pub(crate) fn open(
    key: &[u8; KEY_LEN],
    iv: &[u8],
    tag: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, TrustError> {
    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return Err(TrustError::Decryption);
    }

    let cipher = Aes256Gcm16::new(Key::<Aes256Gcm16>::from_slice(key));
    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(
            Nonce::<U16>::from_slice(iv),
            aad,
            buffer.as_mut_slice(),
            Tag::from_slice(tag),
        )
        .map_err(|_| TrustError::Decryption)?;

    Ok(buffer)
}

/// SHA-256 over `bytes`.
pub(crate) fn sha256(bytes: &[u8]) -> [u8; 32] {
    let hash = digest::digest(&digest::SHA256, bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(hash.as_ref());
    out
}
