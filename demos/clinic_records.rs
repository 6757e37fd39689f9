//! Minimal example: protecting clinic records with trustlayer.
//!
//! Encrypts a diagnosis, records who touched it in a file-backed audit
//! chain, verifies the chain, and scans it for anomalies.
//! Run with: `RUST_LOG=trustlayer=debug cargo run --example clinic_records`

use std::sync::Arc;

use chrono::Duration;
use tracing_subscriber::EnvFilter;
use trustlayer::{
    generate_master_key, AnomalyConfig, AnomalyScanner, AuditAction, AuditChain, AuditEntryInput,
    EnvelopeCipher, FileAuditStore, MasterKeyStore,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // 1. Keys and cipher
    let keys = Arc::new(MasterKeyStore::new(1, generate_master_key()?));
    let cipher = EnvelopeCipher::new(Arc::clone(&keys));

    // 2. Audit chain persisted to a file
    let audit_path = std::env::temp_dir().join("trustlayer_clinic_audit.jsonl");
    let _ = std::fs::remove_file(&audit_path);
    let chain = AuditChain::open(FileAuditStore::open(&audit_path)?)?;

    // 3. A vet writes a diagnosis; the write is audited before it is stored
    let stored = cipher.encrypt("Patellar Luxation Grade 3")?;
    chain.append(
        AuditEntryInput::new("vet-kim", AuditAction::Write, "diagnosis", "dx-1001")
            .regulated("treatment", "owner consent")
            .with_ip("192.168.10.4".parse()?)
            .with_metadata("clinic", "seoul-gangnam"),
    )?;
    println!("Stored: {}", serde_json::to_string(&stored)?);

    // 4. Reads go through the audit trail too
    for _ in 0..4 {
        chain.append(AuditEntryInput::new(
            "intern-lee",
            AuditAction::Read,
            "diagnosis",
            "dx-1001",
        ))?;
        let plaintext = cipher.decrypt(&stored)?;
        assert_eq!(plaintext, "Patellar Luxation Grade 3");
    }

    // 5. Key rotation: old records still open, and can be rewrapped lazily
    keys.rotate(2, generate_master_key()?)?;
    let rewrapped = cipher.rewrap(&stored)?;
    println!(
        "Rewrapped from key v{} to v{}",
        stored.key_version(),
        rewrapped.key_version()
    );

    // 6. Verify the chain
    let result = chain.verify(None)?;
    println!(
        "Chain: {} entr(y/ies) checked, valid = {}",
        result.total_checked, result.valid
    );

    // 7. Anomaly scan with a low threshold so the demo trips it
    let mut config = AnomalyConfig::default();
    config.excessive_access.threshold = 3;
    let scanner = AnomalyScanner::new(config)?;
    for alert in scanner.scan_recent(&chain, Duration::hours(1))? {
        println!(
            "  {:?} ({:?}) actor={} evidence={:?}",
            alert.alert_type, alert.severity, alert.actor_id, alert.evidence_entries
        );
    }
    println!("Full audit written to: {}", audit_path.display());

    Ok(())
}
