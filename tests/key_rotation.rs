use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use trustlayer::config::{MASTER_KEY_VAR, MASTER_KEY_VERSION_VAR, PREVIOUS_MASTER_KEYS_VAR};
use trustlayer::{EnvelopeCipher, MasterKey, MasterKeyStore, TrustConfig, TrustError};

#[test]
fn test_old_blobs_decrypt_after_rotation() {
    let keys = Arc::new(MasterKeyStore::new(1, MasterKey::from_bytes([1u8; 32])));
    let cipher = EnvelopeCipher::new(Arc::clone(&keys));

    let before = cipher.encrypt("Patellar Luxation Grade 3").unwrap();
    assert_eq!(before.key_version(), 1);

    keys.rotate(2, MasterKey::from_bytes([2u8; 32])).unwrap();

    let after = cipher.encrypt("경미한 위염").unwrap();
    assert_eq!(after.key_version(), 2);

    assert_eq!(cipher.decrypt(&before).unwrap(), "Patellar Luxation Grade 3");
    assert_eq!(cipher.decrypt(&after).unwrap(), "경미한 위염");
}

#[test]
fn test_rewrap_moves_only_the_dek() {
    let keys = Arc::new(MasterKeyStore::new(1, MasterKey::from_bytes([1u8; 32])));
    let cipher = EnvelopeCipher::new(Arc::clone(&keys));
    let old = cipher.encrypt("bank account 0042").unwrap();

    keys.rotate(2, MasterKey::from_bytes([2u8; 32])).unwrap();
    let rewrapped = cipher.rewrap(&old).unwrap();

    assert_eq!(rewrapped.key_version(), 2);
    assert_eq!(rewrapped.iv(), old.iv());
    assert_eq!(rewrapped.auth_tag(), old.auth_tag());
    assert_eq!(rewrapped.ciphertext(), old.ciphertext());
    assert_ne!(rewrapped.wrapped_key(), old.wrapped_key());
    assert_eq!(cipher.decrypt(&rewrapped).unwrap(), "bank account 0042");

    // Already current: nothing to do.
    assert_eq!(cipher.rewrap(&rewrapped).unwrap(), rewrapped);
}

#[test]
fn test_relabelled_key_version_is_rejected() {
    let keys = Arc::new(MasterKeyStore::new(1, MasterKey::from_bytes([1u8; 32])));
    let cipher = EnvelopeCipher::new(Arc::clone(&keys));
    let blob = cipher.encrypt("x").unwrap();
    keys.rotate(2, MasterKey::from_bytes([1u8; 32])).unwrap();

    let relabelled = trustlayer::EncryptedData::from_parts(
        blob.iv().to_vec(),
        blob.auth_tag().to_vec(),
        blob.ciphertext().to_vec(),
        blob.wrapped_key().to_vec(),
        2,
    );
    assert!(matches!(cipher.decrypt(&relabelled), Err(TrustError::Decryption)));
}

#[test]
fn test_unknown_key_version() {
    let keys = Arc::new(MasterKeyStore::new(1, MasterKey::from_bytes([1u8; 32])));
    let cipher = EnvelopeCipher::new(keys);
    let blob = cipher.encrypt("x").unwrap();

    let future = trustlayer::EncryptedData::from_parts(
        blob.iv().to_vec(),
        blob.auth_tag().to_vec(),
        blob.ciphertext().to_vec(),
        blob.wrapped_key().to_vec(),
        9,
    );
    assert!(matches!(
        cipher.decrypt(&future),
        Err(TrustError::Configuration(_))
    ));
}

#[test]
fn test_restart_with_rotated_configuration() {
    let old_key = [1u8; 32];
    let new_key = [2u8; 32];

    // Process one: only version 1 exists.
    let first = TrustConfig::from_lookup(|name| match name {
        MASTER_KEY_VAR => Some(STANDARD.encode(old_key)),
        _ => None,
    })
    .unwrap();
    let cipher = EnvelopeCipher::new(Arc::new(MasterKeyStore::from_config(first.keys).unwrap()));
    let blob = cipher.encrypt("claim detail").unwrap();

    // Process two: operator rotated to version 2 and kept version 1 as history.
    let second = TrustConfig::from_lookup(|name| match name {
        MASTER_KEY_VAR => Some(STANDARD.encode(new_key)),
        MASTER_KEY_VERSION_VAR => Some("2".to_string()),
        PREVIOUS_MASTER_KEYS_VAR => Some(format!("1:{}", STANDARD.encode(old_key))),
        _ => None,
    })
    .unwrap();
    let cipher = EnvelopeCipher::new(Arc::new(MasterKeyStore::from_config(second.keys).unwrap()));

    assert_eq!(cipher.decrypt(&blob).unwrap(), "claim detail");
    assert_eq!(cipher.encrypt("new").unwrap().key_version(), 2);
}
