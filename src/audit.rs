//! Audit entry types and canonical hashing.
//!
//! An [`AuditEntry`] is immutable once created. Its `entry_hash` is the
//! SHA-256 of a fixed binary encoding of every other field plus the
//! predecessor's hash, so any retroactive edit is detectable.
//!
//! ## Canonical encoding
//!
//! ```text
//! "trustlayer.audit.v1\0"
//! sequence            u64 BE
//! timestamp           i64 BE, microseconds since the Unix epoch
//! actor_id            str
//! action              str (wire name, e.g. "failed-auth")
//! resource_type       str
//! resource_id         str
//! regulated           u8 (0 | 1)
//! purpose             opt<str>
//! legal_basis         opt<str>
//! ip_address          opt<str> (canonical textual form)
//! user_agent          opt<str>
//! metadata            u32 BE count, then (str key, value) in key order
//! previous_hash       str (64 lowercase hex chars)
//!
//! str      = u32 BE byte length || UTF-8 bytes
//! opt<str> = 0x00 | 0x01 || str
//! value    = 0x00 (null) | 0x01 u8 (bool) | 0x02 i64 BE (int) | 0x03 str (text)
//! ```

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::error::TrustError;

/// `previous_hash` of the first entry in every chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const DOMAIN_TAG: &[u8] = b"trustlayer.audit.v1\0";

/// Largest accepted text field, in bytes.
pub const MAX_FIELD_BYTES: usize = 64 * 1024;

/// Largest accepted number of metadata entries.
pub const MAX_METADATA_ENTRIES: usize = 256;

/// The kind of security-relevant action being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditAction {
    Read,
    Write,
    Export,
    FailedAuth,
    System,
}

impl AuditAction {
    /// The name used on the wire and in the canonical encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Export => "export",
            Self::FailedAuth => "failed-auth",
            Self::System => "system",
        }
    }
}

/// A scalar metadata value. Floats and nested objects are excluded so the
/// encoding stays deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Metadata bag. `BTreeMap` pins iteration to key order.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Caller-supplied fields of an audit entry. Sequence, timestamp and hashes
/// are assigned by the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntryInput {
    pub actor_id: String,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: String,
    /// Set when the resource holds regulated data; makes `purpose` and
    /// `legal_basis` mandatory.
    #[serde(default)]
    pub regulated: bool,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub legal_basis: Option<String>,
    #[serde(default)]
    pub ip_address: Option<IpAddr>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl AuditEntryInput {
    pub fn new(
        actor_id: impl Into<String>,
        action: AuditAction,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            action,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            regulated: false,
            purpose: None,
            legal_basis: None,
            ip_address: None,
            user_agent: None,
            metadata: Metadata::new(),
        }
    }

    /// Mark the entry as touching regulated data, with its justification.
    pub fn regulated(mut self, purpose: impl Into<String>, legal_basis: impl Into<String>) -> Self {
        self.regulated = true;
        self.purpose = Some(purpose.into());
        self.legal_basis = Some(legal_basis.into());
        self
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip_address = Some(ip);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check the input before it is committed to the chain.
    pub fn validate(&self) -> Result<(), TrustError> {
        if self.actor_id.trim().is_empty() {
            return Err(TrustError::InvalidEntry("actor id is empty".into()));
        }
        if self.resource_type.trim().is_empty() {
            return Err(TrustError::InvalidEntry("resource type is empty".into()));
        }
        if self.resource_id.trim().is_empty() {
            return Err(TrustError::InvalidEntry("resource id is empty".into()));
        }
        self.check_sizes()?;
        if self.regulated {
            if is_blank(&self.purpose) {
                return Err(TrustError::InvalidEntry(
                    "purpose is required for regulated data".into(),
                ));
            }
            if is_blank(&self.legal_basis) {
                return Err(TrustError::InvalidEntry(
                    "legal basis is required for regulated data".into(),
                ));
            }
        }
        Ok(())
    }
}

impl AuditEntryInput {
    fn check_sizes(&self) -> Result<(), TrustError> {
        if self.metadata.len() > MAX_METADATA_ENTRIES {
            return Err(TrustError::InvalidEntry(format!(
                "metadata has {} entries, limit is {MAX_METADATA_ENTRIES}",
                self.metadata.len()
            )));
        }
        let fields = [
            ("actor id", Some(self.actor_id.as_str())),
            ("resource type", Some(self.resource_type.as_str())),
            ("resource id", Some(self.resource_id.as_str())),
            ("purpose", self.purpose.as_deref()),
            ("legal basis", self.legal_basis.as_deref()),
            ("user agent", self.user_agent.as_deref()),
        ];
        let metadata = self.metadata.iter().flat_map(|(key, value)| {
            let text = match value {
                MetadataValue::Text(t) => Some(t.as_str()),
                _ => None,
            };
            [("metadata key", Some(key.as_str())), ("metadata value", text)]
        });
        for (name, value) in fields.into_iter().chain(metadata) {
            if value.is_some_and(|v| v.len() > MAX_FIELD_BYTES) {
                return Err(TrustError::InvalidEntry(format!(
                    "{name} exceeds {MAX_FIELD_BYTES} bytes"
                )));
            }
        }
        Ok(())
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |s| s.trim().is_empty())
}

/// A committed, hash-linked audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub actor_id: String,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: String,
    pub regulated: bool,
    pub purpose: Option<String>,
    pub legal_basis: Option<String>,
    pub ip_address: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub metadata: Metadata,
    pub previous_hash: String,
    pub entry_hash: String,
}

impl AuditEntry {
    /// Build and hash an entry. Only the chain calls this.
    pub(crate) fn seal(
        input: AuditEntryInput,
        sequence: u64,
        timestamp: DateTime<Utc>,
        previous_hash: String,
    ) -> Result<Self, TrustError> {
        let mut entry = Self {
            sequence,
            timestamp,
            actor_id: input.actor_id,
            action: input.action,
            resource_type: input.resource_type,
            resource_id: input.resource_id,
            regulated: input.regulated,
            purpose: input.purpose,
            legal_basis: input.legal_basis,
            ip_address: input.ip_address,
            user_agent: input.user_agent,
            metadata: input.metadata,
            previous_hash,
            entry_hash: String::new(),
        };
        entry.entry_hash = entry.compute_hash()?;
        Ok(entry)
    }

    /// Recompute the hash from the stored fields.
    ///
    /// Fails with [`TrustError::InvalidEntry`] when a field or the metadata
    /// map is too large for its `u32` length prefix.
    pub fn compute_hash(&self) -> Result<String, TrustError> {
        Ok(hex::encode(crypto::sha256(&self.canonical_bytes()?)))
    }

    /// Whether the stored `entry_hash` matches the fields.
    pub fn hash_is_valid(&self) -> bool {
        self.compute_hash().is_ok_and(|hash| hash == self.entry_hash)
    }

    fn canonical_bytes(&self) -> Result<Vec<u8>, TrustError> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(DOMAIN_TAG);
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timestamp.timestamp_micros().to_be_bytes());
        put_str(&mut out, &self.actor_id)?;
        put_str(&mut out, self.action.as_str())?;
        put_str(&mut out, &self.resource_type)?;
        put_str(&mut out, &self.resource_id)?;
        out.push(u8::from(self.regulated));
        put_opt(&mut out, self.purpose.as_deref())?;
        put_opt(&mut out, self.legal_basis.as_deref())?;
        put_opt(&mut out, self.ip_address.map(|ip| ip.to_string()).as_deref())?;
        put_opt(&mut out, self.user_agent.as_deref())?;

        out.extend_from_slice(&prefix(self.metadata.len())?);
        for (key, value) in &self.metadata {
            put_str(&mut out, key)?;
            match value {
                MetadataValue::Null => out.push(0x00),
                MetadataValue::Bool(b) => {
                    out.push(0x01);
                    out.push(u8::from(*b));
                }
                MetadataValue::Int(i) => {
                    out.push(0x02);
                    out.extend_from_slice(&i.to_be_bytes());
                }
                MetadataValue::Text(s) => {
                    out.push(0x03);
                    put_str(&mut out, s)?;
                }
            }
        }

        put_str(&mut out, &self.previous_hash)?;
        Ok(out)
    }
}

/// `u32` big-endian length prefix. Refuses lengths that do not fit rather
/// than truncating them into a colliding encoding.
fn prefix(len: usize) -> Result<[u8; 4], TrustError> {
    u32::try_from(len)
        .map(u32::to_be_bytes)
        .map_err(|_| TrustError::InvalidEntry(format!("field of {len} bytes cannot be encoded")))
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<(), TrustError> {
    out.extend_from_slice(&prefix(s.len())?);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_opt(out: &mut Vec<u8>, s: Option<&str>) -> Result<(), TrustError> {
    match s {
        None => out.push(0x00),
        Some(s) => {
            out.push(0x01);
            put_str(out, s)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> AuditEntry {
        let input = AuditEntryInput::new("user-1", AuditAction::Read, "diagnosis", "rec-9")
            .regulated("treatment", "consent")
            .with_metadata("clinic", "north")
            .with_metadata("attempt", 2i64);
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        AuditEntry::seal(input, 0, ts, GENESIS_HASH.to_string()).unwrap()
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = sample();
        let b = sample();
        assert_eq!(a.entry_hash, b.entry_hash);
        assert_eq!(a.entry_hash.len(), 64);
        assert!(a.hash_is_valid());
    }

    #[test]
    fn test_hash_covers_every_field() {
        let base = sample();

        let mut m = base.clone();
        m.actor_id = "user-2".into();
        assert!(!m.hash_is_valid());

        let mut m = base.clone();
        m.action = AuditAction::Export;
        assert!(!m.hash_is_valid());

        let mut m = base.clone();
        m.timestamp = m.timestamp + chrono::Duration::microseconds(1);
        assert!(!m.hash_is_valid());

        let mut m = base.clone();
        m.metadata.insert("clinic".into(), "south".into());
        assert!(!m.hash_is_valid());

        let mut m = base.clone();
        m.purpose = None;
        assert!(!m.hash_is_valid());

        let mut m = base;
        m.previous_hash = "f".repeat(64);
        assert!(!m.hash_is_valid());
    }

    #[test]
    fn test_length_prefix_prevents_field_shifting() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        let a = AuditEntry::seal(
            AuditEntryInput::new("ab", AuditAction::Read, "c", "d"),
            0,
            ts,
            GENESIS_HASH.into(),
        )
        .unwrap();
        let b = AuditEntry::seal(
            AuditEntryInput::new("a", AuditAction::Read, "bc", "d"),
            0,
            ts,
            GENESIS_HASH.into(),
        )
        .unwrap();
        assert_ne!(a.entry_hash, b.entry_hash);
    }

    #[test]
    fn test_validate_regulated_requires_justification() {
        let mut input = AuditEntryInput::new("user-1", AuditAction::Read, "account", "acc-1");
        input.regulated = true;
        assert!(matches!(input.validate(), Err(TrustError::InvalidEntry(_))));

        input.purpose = Some("billing".into());
        input.legal_basis = Some("   ".into());
        assert!(input.validate().is_err());

        input.legal_basis = Some("contract".into());
        assert!(input.validate().is_ok());
    }

    #[test]
    fn test_validate_caps_field_sizes() {
        let at_limit = "r".repeat(MAX_FIELD_BYTES);
        let input = AuditEntryInput::new("user-1", AuditAction::Read, "claim", at_limit.clone());
        assert!(input.validate().is_ok());

        let over = AuditEntryInput::new("user-1", AuditAction::Read, "claim", at_limit + "r");
        assert!(matches!(over.validate(), Err(TrustError::InvalidEntry(_))));

        let long_meta = AuditEntryInput::new("user-1", AuditAction::Read, "claim", "c-1")
            .with_metadata("note", "n".repeat(MAX_FIELD_BYTES + 1));
        assert!(long_meta.validate().is_err());

        let mut many = AuditEntryInput::new("user-1", AuditAction::Read, "claim", "c-1");
        for i in 0..=MAX_METADATA_ENTRIES {
            many = many.with_metadata(format!("k{i}"), i as i64);
        }
        assert!(many.validate().is_err());
    }

    #[test]
    fn test_length_prefix_refuses_oversized_lengths() {
        assert_eq!(prefix(5).unwrap(), [0, 0, 0, 5]);
        assert!(prefix(u32::MAX as usize).is_ok());
        #[cfg(target_pointer_width = "64")]
        assert!(matches!(
            prefix(u32::MAX as usize + 1),
            Err(TrustError::InvalidEntry(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_actor() {
        let input = AuditEntryInput::new(" ", AuditAction::Write, "claim", "c-1");
        assert!(input.validate().is_err());
    }

    #[test]
    fn test_action_wire_names() {
        assert_eq!(
            serde_json::to_string(&AuditAction::FailedAuth).unwrap(),
            "\"failed-auth\""
        );
        assert_eq!(AuditAction::FailedAuth.as_str(), "failed-auth");
    }

    #[test]
    fn test_entry_json_roundtrip_keeps_hash_valid() {
        let entry = sample();
        let line = serde_json::to_string(&entry).unwrap();
        let back: AuditEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(back, entry);
        assert!(back.hash_is_valid());
    }
}
