//! Environment-driven configuration.
//!
//! | Variable | Default |
//! |---|---|
//! | `TRUSTLAYER_MASTER_KEY` | required, base64 of 32 bytes |
//! | `TRUSTLAYER_MASTER_KEY_VERSION` | `1` |
//! | `TRUSTLAYER_PREVIOUS_MASTER_KEYS` | none; `version:base64` pairs, comma separated |
//! | `TRUSTLAYER_AUDIT_LOG_PATH` | none (in-memory store) |
//! | `TRUSTLAYER_EXCESSIVE_ACCESS_THRESHOLD` | `100` |
//! | `TRUSTLAYER_OFF_HOURS_START` | `2` |
//! | `TRUSTLAYER_OFF_HOURS_END` | `5` |
//! | `TRUSTLAYER_UTC_OFFSET_MINUTES` | `0` |
//! | `TRUSTLAYER_FAILED_AUTH_THRESHOLD` | `5` |
//! | `TRUSTLAYER_FAILED_AUTH_WINDOW_MINUTES` | `10` |

use std::path::PathBuf;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use zeroize::Zeroizing;

use crate::anomaly::AnomalyConfig;
use crate::error::TrustError;
use crate::keys::{KeyVersion, MasterKey, MasterKeyStore};
use crate::store::{AuditStore, FileAuditStore, MemoryAuditStore};

pub const MASTER_KEY_VAR: &str = "TRUSTLAYER_MASTER_KEY";
pub const MASTER_KEY_VERSION_VAR: &str = "TRUSTLAYER_MASTER_KEY_VERSION";
pub const PREVIOUS_MASTER_KEYS_VAR: &str = "TRUSTLAYER_PREVIOUS_MASTER_KEYS";
pub const AUDIT_LOG_PATH_VAR: &str = "TRUSTLAYER_AUDIT_LOG_PATH";
pub const EXCESSIVE_ACCESS_THRESHOLD_VAR: &str = "TRUSTLAYER_EXCESSIVE_ACCESS_THRESHOLD";
pub const OFF_HOURS_START_VAR: &str = "TRUSTLAYER_OFF_HOURS_START";
pub const OFF_HOURS_END_VAR: &str = "TRUSTLAYER_OFF_HOURS_END";
pub const UTC_OFFSET_MINUTES_VAR: &str = "TRUSTLAYER_UTC_OFFSET_MINUTES";
pub const FAILED_AUTH_THRESHOLD_VAR: &str = "TRUSTLAYER_FAILED_AUTH_THRESHOLD";
pub const FAILED_AUTH_WINDOW_MINUTES_VAR: &str = "TRUSTLAYER_FAILED_AUTH_WINDOW_MINUTES";

const DEFAULT_KEY_VERSION: KeyVersion = 1;

/// Master key material read from the environment.
pub struct KeyConfig {
    pub master_key: MasterKey,
    pub key_version: KeyVersion,
    /// Older master keys, kept only to unwrap existing blobs.
    pub previous_keys: Vec<(KeyVersion, MasterKey)>,
}

impl std::fmt::Debug for KeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyConfig")
            .field("key_version", &self.key_version)
            .field(
                "previous_versions",
                &self.previous_keys.iter().map(|(v, _)| *v).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Everything the trust layer reads from its environment.
#[derive(Debug)]
pub struct TrustConfig {
    pub keys: KeyConfig,
    pub audit_log_path: Option<PathBuf>,
    pub anomaly: AnomalyConfig,
}

impl TrustConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self, TrustError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through `lookup`, which maps a variable name to its
    /// value. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, TrustError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let encoded = Zeroizing::new(get(MASTER_KEY_VAR).ok_or_else(|| {
            TrustError::Configuration(format!("{MASTER_KEY_VAR} is not set"))
        })?);
        let master_key = decode_key(MASTER_KEY_VAR, &encoded)?;
        let key_version = parse_or(&get, MASTER_KEY_VERSION_VAR, DEFAULT_KEY_VERSION)?;

        let mut previous_keys = Vec::new();
        if let Some(list) = get(PREVIOUS_MASTER_KEYS_VAR).map(Zeroizing::new) {
            for pair in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let (version, key) = pair.split_once(':').ok_or_else(|| {
                    TrustError::Configuration(format!(
                        "{PREVIOUS_MASTER_KEYS_VAR} entries must be version:base64"
                    ))
                })?;
                let version: KeyVersion = version.trim().parse().map_err(|_| {
                    TrustError::Configuration(format!(
                        "{PREVIOUS_MASTER_KEYS_VAR} has a non-numeric version"
                    ))
                })?;
                if version == key_version {
                    return Err(TrustError::Configuration(format!(
                        "{PREVIOUS_MASTER_KEYS_VAR} repeats the current version {version}"
                    )));
                }
                previous_keys.push((version, decode_key(PREVIOUS_MASTER_KEYS_VAR, key.trim())?));
            }
        }

        let mut anomaly = AnomalyConfig::default();
        anomaly.excessive_access.threshold = parse_or(
            &get,
            EXCESSIVE_ACCESS_THRESHOLD_VAR,
            anomaly.excessive_access.threshold,
        )?;
        anomaly.off_hours.start_hour =
            parse_or(&get, OFF_HOURS_START_VAR, anomaly.off_hours.start_hour)?;
        anomaly.off_hours.end_hour = parse_or(&get, OFF_HOURS_END_VAR, anomaly.off_hours.end_hour)?;
        anomaly.off_hours.utc_offset_minutes = parse_or(
            &get,
            UTC_OFFSET_MINUTES_VAR,
            anomaly.off_hours.utc_offset_minutes,
        )?;
        anomaly.failed_auth.threshold =
            parse_or(&get, FAILED_AUTH_THRESHOLD_VAR, anomaly.failed_auth.threshold)?;
        anomaly.failed_auth.window_minutes = parse_or(
            &get,
            FAILED_AUTH_WINDOW_MINUTES_VAR,
            anomaly.failed_auth.window_minutes,
        )?;
        anomaly.validate()?;

        Ok(Self {
            keys: KeyConfig {
                master_key,
                key_version,
                previous_keys,
            },
            audit_log_path: get(AUDIT_LOG_PATH_VAR).map(PathBuf::from),
            anomaly,
        })
    }

    /// Open the audit store this configuration names: the JSON-lines file at
    /// `audit_log_path`, or a process-local memory store when none is set.
    pub fn open_store(&self) -> Result<Box<dyn AuditStore>, TrustError> {
        match &self.audit_log_path {
            Some(path) => {
                let store = FileAuditStore::open(path)?;
                tracing::info!(path = %path.display(), "audit log opened");
                Ok(Box::new(store))
            }
            None => {
                tracing::warn!("no audit log path configured; audit entries will not persist");
                Ok(Box::new(MemoryAuditStore::new()))
            }
        }
    }
}

impl MasterKeyStore {
    /// Build a key store from configuration, consuming its key material.
    pub fn from_config(keys: KeyConfig) -> Result<Self, TrustError> {
        let KeyConfig {
            master_key,
            key_version,
            previous_keys,
        } = keys;

        let store = MasterKeyStore::new(key_version, master_key);
        for (version, key) in previous_keys {
            if version > key_version {
                return Err(TrustError::Configuration(format!(
                    "previous key version {version} is newer than current {key_version}"
                )));
            }
            store.add_historical(version, key)?;
        }
        tracing::info!(
            key_version,
            loaded_versions = ?store.versions(),
            "master key store initialised"
        );
        Ok(store)
    }
}

fn decode_key(var: &str, encoded: &str) -> Result<MasterKey, TrustError> {
    let bytes = Zeroizing::new(
        STANDARD
            .decode(encoded.trim().as_bytes())
            .map_err(|_| TrustError::Configuration(format!("{var} is not valid base64")))?,
    );
    MasterKey::from_slice(&bytes)
}

fn parse_or<T, G>(get: &G, name: &str, default: T) -> Result<T, TrustError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| TrustError::Configuration(format!("{name} has invalid value {raw:?}"))),
    }
}
