//! Batch anomaly detection over audit entries.
//!
//! [`scan`] is a pure function of an entry window and a rule set. It keeps
//! no state between calls and its alerts are advisory: nothing here blocks
//! or rolls back an audited action.
//!
//! Rules:
//! - **Excessive access**: more than `threshold` entries from one actor in
//!   one clock hour (UTC buckets).
//! - **Off-hours access**: entries whose local hour falls in
//!   `[start_hour, end_hour)`. The window may wrap past midnight.
//! - **Repeated failed auth**: more than `threshold` `failed-auth` entries
//!   from one actor within a rolling `window_minutes`.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration, FixedOffset, Offset, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditAction, AuditEntry};
use crate::chain::{AuditChain, AuditFilters};
use crate::error::TrustError;
use crate::store::AuditStore;

const SECONDS_PER_HOUR: i64 = 3600;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExcessiveAccessRule {
    pub enabled: bool,
    pub threshold: usize,
}

impl Default for ExcessiveAccessRule {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OffHoursRule {
    pub enabled: bool,
    /// First local hour inside the window (0-23).
    pub start_hour: u32,
    /// First local hour after the window (0-23).
    pub end_hour: u32,
    /// Offset of local time from UTC.
    pub utc_offset_minutes: i32,
}

impl Default for OffHoursRule {
    fn default() -> Self {
        Self {
            enabled: true,
            start_hour: 2,
            end_hour: 5,
            utc_offset_minutes: 0,
        }
    }
}

impl OffHoursRule {
    fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60))
            .unwrap_or_else(|| Utc.fix())
    }

    fn contains_hour(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailedAuthRule {
    pub enabled: bool,
    pub threshold: usize,
    pub window_minutes: i64,
}

impl FailedAuthRule {
    /// The rolling window, or `None` when it is not a positive span chrono
    /// can represent.
    fn window(&self) -> Option<Duration> {
        Duration::try_minutes(self.window_minutes).filter(|w| *w > Duration::zero())
    }
}

impl Default for FailedAuthRule {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 5,
            window_minutes: 10,
        }
    }
}

/// Thresholds and toggles for every detection rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    pub excessive_access: ExcessiveAccessRule,
    pub off_hours: OffHoursRule,
    pub failed_auth: FailedAuthRule,
}

impl AnomalyConfig {
    pub fn validate(&self) -> Result<(), TrustError> {
        let oh = &self.off_hours;
        if oh.start_hour > 23 || oh.end_hour > 23 {
            return Err(TrustError::Configuration(format!(
                "off-hours window {}..{} is not within 0-23",
                oh.start_hour, oh.end_hour
            )));
        }
        if FixedOffset::east_opt(oh.utc_offset_minutes.saturating_mul(60)).is_none() {
            return Err(TrustError::Configuration(format!(
                "utc offset of {} minutes is out of range",
                oh.utc_offset_minutes
            )));
        }
        if self.failed_auth.window().is_none() {
            return Err(TrustError::Configuration(format!(
                "failed-auth window of {} minutes is not a positive representable span",
                self.failed_auth.window_minutes
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    ExcessiveAccess,
    OffHoursAccess,
    RepeatedFailedAuth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A detected pattern and the entries that triggered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub alert_type: AlertType,
    pub severity: Severity,
    pub actor_id: String,
    /// Sequence numbers of the evidence entries, oldest first.
    pub evidence_entries: Vec<u64>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub description: String,
}

impl Alert {
    fn from_evidence(
        alert_type: AlertType,
        severity: Severity,
        actor_id: &str,
        evidence: &[&AuditEntry],
        description: String,
    ) -> Option<Self> {
        let first = evidence.first()?;
        let last = evidence.last()?;
        Some(Self {
            alert_type,
            severity,
            actor_id: actor_id.to_string(),
            evidence_entries: evidence.iter().map(|e| e.sequence).collect(),
            first_seen: first.timestamp,
            last_seen: last.timestamp,
            description,
        })
    }
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

/// Run every enabled rule over `window`.
///
/// Alerts come out grouped by rule (excessive access, off-hours, failed
/// auth) and ordered by actor within each rule.
pub fn scan<I>(window: I, rules: &AnomalyConfig) -> Vec<Alert>
where
    I: IntoIterator<Item = AuditEntry>,
{
    let mut entries: Vec<AuditEntry> = window.into_iter().collect();
    entries.sort_by_key(|e| (e.timestamp, e.sequence));

    let mut by_actor: BTreeMap<&str, Vec<&AuditEntry>> = BTreeMap::new();
    for entry in &entries {
        by_actor.entry(entry.actor_id.as_str()).or_default().push(entry);
    }

    let mut alerts = Vec::new();
    if rules.excessive_access.enabled {
        for (actor, list) in &by_actor {
            excessive_access(actor, list, &rules.excessive_access, &mut alerts);
        }
    }
    if rules.off_hours.enabled {
        for (actor, list) in &by_actor {
            off_hours(actor, list, &rules.off_hours, &mut alerts);
        }
    }
    if rules.failed_auth.enabled {
        for (actor, list) in &by_actor {
            failed_auth(actor, list, &rules.failed_auth, &mut alerts);
        }
    }
    alerts
}

fn excessive_access(
    actor: &str,
    entries: &[&AuditEntry],
    rule: &ExcessiveAccessRule,
    alerts: &mut Vec<Alert>,
) {
    let mut buckets: BTreeMap<i64, Vec<&AuditEntry>> = BTreeMap::new();
    for &entry in entries {
        let bucket = entry.timestamp.timestamp().div_euclid(SECONDS_PER_HOUR);
        buckets.entry(bucket).or_default().push(entry);
    }

    for bucket in buckets.values() {
        if bucket.len() <= rule.threshold {
            continue;
        }
        let severity = if bucket.len() >= rule.threshold.saturating_mul(2).max(1) {
            Severity::High
        } else {
            Severity::Medium
        };
        let description = format!(
            "{} accesses within one hour (threshold {})",
            bucket.len(),
            rule.threshold
        );
        alerts.extend(Alert::from_evidence(
            AlertType::ExcessiveAccess,
            severity,
            actor,
            bucket,
            description,
        ));
    }
}

fn off_hours(actor: &str, entries: &[&AuditEntry], rule: &OffHoursRule, alerts: &mut Vec<Alert>) {
    if rule.start_hour == rule.end_hour {
        return;
    }
    let offset = rule.offset();
    let hits: Vec<&AuditEntry> = entries
        .iter()
        .copied()
        .filter(|e| rule.contains_hour(e.timestamp.with_timezone(&offset).hour()))
        .collect();
    if hits.is_empty() {
        return;
    }

    let sensitive = hits
        .iter()
        .any(|e| e.regulated || e.action == AuditAction::Export);
    let severity = if sensitive {
        Severity::Medium
    } else {
        Severity::Low
    };
    let description = format!(
        "{} entries between {:02}:00 and {:02}:00 local time",
        hits.len(),
        rule.start_hour,
        rule.end_hour
    );
    alerts.extend(Alert::from_evidence(
        AlertType::OffHoursAccess,
        severity,
        actor,
        &hits,
        description,
    ));
}

fn failed_auth(actor: &str, entries: &[&AuditEntry], rule: &FailedAuthRule, alerts: &mut Vec<Alert>) {
    let Some(window) = rule.window() else {
        return;
    };
    let mut current: VecDeque<&AuditEntry> = VecDeque::new();

    for entry in entries
        .iter()
        .copied()
        .filter(|e| e.action == AuditAction::FailedAuth)
    {
        while current
            .front()
            .is_some_and(|front| entry.timestamp - front.timestamp >= window)
        {
            current.pop_front();
        }
        current.push_back(entry);

        if current.len() > rule.threshold {
            let evidence: Vec<&AuditEntry> = current.drain(..).collect();
            let description = format!(
                "{} failed authorizations within {} minutes (threshold {})",
                evidence.len(),
                rule.window_minutes,
                rule.threshold
            );
            alerts.extend(Alert::from_evidence(
                AlertType::RepeatedFailedAuth,
                Severity::High,
                actor,
                &evidence,
                description,
            ));
        }
    }
}

/// Applies a fixed [`AnomalyConfig`] and logs what it finds.
#[derive(Debug, Clone, Default)]
pub struct AnomalyScanner {
    config: AnomalyConfig,
}

impl AnomalyScanner {
    pub fn new(config: AnomalyConfig) -> Result<Self, TrustError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    /// Scan an arbitrary window of entries.
    pub fn scan<I>(&self, window: I) -> Vec<Alert>
    where
        I: IntoIterator<Item = AuditEntry>,
    {
        let alerts = scan(window, &self.config);
        for alert in &alerts {
            tracing::warn!(
                alert_type = ?alert.alert_type,
                severity = ?alert.severity,
                actor = %alert.actor_id,
                evidence = alert.evidence_entries.len(),
                "{}",
                alert.description
            );
        }
        alerts
    }

    /// Scan the entries a chain recorded during the last `lookback`.
    pub fn scan_recent<S: AuditStore>(
        &self,
        chain: &AuditChain<S>,
        lookback: Duration,
    ) -> Result<Vec<Alert>, TrustError> {
        let now = chain.now();
        let from = now
            .checked_sub_signed(lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        // Upper bound is exclusive; include anything stamped at `now`.
        let to = now
            .checked_add_signed(Duration::seconds(1))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let filters = AuditFilters::default().between(from, to);
        let window = chain.query(filters).collect::<Result<Vec<_>, _>>()?;
        Ok(self.scan(window))
    }
}
