//! The hash-chained audit log.
//!
//! A chain is a single linear sequence of [`AuditEntry`] values. Every entry
//! embeds the hash of its predecessor; the first embeds [`GENESIS_HASH`].
//!
//! `append` is the only mutator. It holds the head lock across reading the
//! last hash, persisting the new entry, and advancing the head, so two
//! appends can never observe the same predecessor. The committed length is
//! also published in an atomic once an entry is durable; `verify` and
//! `query` snapshot that and never take the head lock, so they proceed while
//! an append (including its retries) is in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::audit::{AuditAction, AuditEntry, AuditEntryInput, GENESIS_HASH};
use crate::error::TrustError;
use crate::store::AuditStore;

/// Entries read from the store per page during verify and query.
const PAGE_SIZE: u64 = 512;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of entry timestamps. Timestamps are never client-supplied.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// What a caller does when an audit receipt cannot be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendPolicy {
    /// Propagate the storage error; the audited action must not proceed.
    /// Use for regulated writes.
    FailClosed,
    /// Swallow the storage error after logging an escalated alert.
    /// Acceptable for reads.
    FailOpen,
}

/// Backoff schedule for [`AuditChain::append_with_retry`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: StdDuration,
    pub max_backoff: StdDuration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: StdDuration::from_millis(50),
            max_backoff: StdDuration::from_secs(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Why a link in the chain failed to verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChainBreak {
    /// The stored `entry_hash` does not match the entry's fields.
    HashMismatch,
    /// `previous_hash` does not match the predecessor's recomputed hash.
    PreviousHashMismatch,
    /// The entry's sequence is not the one expected at its position.
    SequenceGap,
    /// The store returned fewer entries than the chain has committed.
    MissingEntries,
}

/// Outcome of [`AuditChain::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub valid: bool,
    pub total_checked: u64,
    /// Position of the first broken entry within the verified window.
    pub first_invalid_index: Option<u64>,
    /// Sequence number the first broken entry was expected to carry.
    pub first_invalid_sequence: Option<u64>,
    pub first_break: Option<ChainBreak>,
    /// Number of entries in the window that failed at least one check.
    pub broken_links: u64,
}

impl VerificationResult {
    fn empty() -> Self {
        Self {
            valid: true,
            total_checked: 0,
            first_invalid_index: None,
            first_invalid_sequence: None,
            first_break: None,
            broken_links: 0,
        }
    }

    fn record_break(&mut self, index: u64, sequence: u64, kind: ChainBreak) {
        self.valid = false;
        self.broken_links += 1;
        if self.first_invalid_index.is_none() {
            self.first_invalid_index = Some(index);
            self.first_invalid_sequence = Some(sequence);
            self.first_break = Some(kind);
        }
    }

    /// Turn an invalid result into [`TrustError::ChainIntegrityViolation`].
    pub fn into_result(self) -> Result<Self, TrustError> {
        match (self.valid, self.first_invalid_index, self.first_invalid_sequence) {
            (false, Some(index), Some(sequence)) => {
                Err(TrustError::ChainIntegrityViolation { index, sequence })
            }
            _ => Ok(self),
        }
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// Half-open time interval `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl DateRange {
    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        *ts >= self.from && *ts < self.to
    }
}

/// Filters for [`AuditChain::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFilters {
    pub actor_id: Option<String>,
    pub resource_type: Option<String>,
    pub action: Option<AuditAction>,
    pub date_range: Option<DateRange>,
}

impl AuditFilters {
    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.date_range = Some(DateRange { from, to });
        self
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.actor_id.as_ref().map_or(true, |a| *a == entry.actor_id)
            && self
                .resource_type
                .as_ref()
                .map_or(true, |r| *r == entry.resource_type)
            && self.action.map_or(true, |a| a == entry.action)
            && self
                .date_range
                .map_or(true, |range| range.contains(&entry.timestamp))
    }
}

/// Lazy, finite iterator over the entries matching a filter.
///
/// Covers the entries committed when the query was created and pages them
/// in from the store on demand. A storage error is yielded once and ends
/// the iteration.
pub struct AuditQuery<'a, S: AuditStore> {
    store: &'a S,
    filters: AuditFilters,
    next: u64,
    end: u64,
    page: std::vec::IntoIter<AuditEntry>,
    done: bool,
}

impl<S: AuditStore> Iterator for AuditQuery<'_, S> {
    type Item = Result<AuditEntry, TrustError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            for entry in self.page.by_ref() {
                if self.filters.matches(&entry) {
                    return Some(Ok(entry));
                }
            }
            if self.done || self.next >= self.end {
                return None;
            }

            let page_end = (self.next + PAGE_SIZE).min(self.end);
            match self.store.read_range(self.next, page_end) {
                Ok(entries) if entries.is_empty() => {
                    self.done = true;
                    return None;
                }
                Ok(entries) => {
                    self.next += entries.len() as u64;
                    self.page = entries.into_iter();
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// Lifecycle of a chain. There is no terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Empty,
    Active,
}

#[derive(Debug)]
struct ChainHead {
    next_sequence: u64,
    last_hash: String,
}

/// Append-only, hash-linked audit log over a pluggable store.
pub struct AuditChain<S: AuditStore> {
    store: S,
    head: Mutex<ChainHead>,
    /// Entries durably committed; equals `head.next_sequence` outside append.
    committed: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl<S: AuditStore + std::fmt::Debug> std::fmt::Debug for AuditChain<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditChain")
            .field("store", &self.store)
            .field("committed", &self.len())
            .finish()
    }
}

impl<S: AuditStore> AuditChain<S> {
    /// Open a chain over `store`, resuming after its last committed entry.
    pub fn open(store: S) -> Result<Self, TrustError> {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Open a chain that stamps entries using `clock`.
    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Result<Self, TrustError> {
        let head = match store.tail()? {
            Some(tail) => ChainHead {
                next_sequence: tail.sequence + 1,
                last_hash: tail.entry_hash,
            },
            None => ChainHead {
                next_sequence: 0,
                last_hash: GENESIS_HASH.to_string(),
            },
        };
        tracing::info!(entries = head.next_sequence, "audit chain opened");

        Ok(Self {
            store,
            committed: AtomicU64::new(head.next_sequence),
            head: Mutex::new(head),
            clock,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// The current time according to the chain's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Number of committed entries. Never waits on an in-flight append.
    pub fn len(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> ChainState {
        if self.is_empty() {
            ChainState::Empty
        } else {
            ChainState::Active
        }
    }

    /// Hash the next entry will link to.
    pub fn head_hash(&self) -> String {
        self.head.lock().last_hash.clone()
    }

    /// Validate, hash, and durably commit a new entry.
    ///
    /// On [`TrustError::Storage`] nothing is committed and the head does not
    /// move, so a retry links to the same predecessor.
    pub fn append(&self, input: AuditEntryInput) -> Result<AuditEntry, TrustError> {
        self.append_with_retry(
            input,
            &RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            },
        )
    }

    /// Append, retrying only the durable write on storage failure.
    ///
    /// The entry (sequence, timestamp and previous hash) is built once and
    /// the head lock is held across every attempt, so retries never skip or
    /// re-order the entry.
    pub fn append_with_retry(
        &self,
        input: AuditEntryInput,
        retry: &RetryPolicy,
    ) -> Result<AuditEntry, TrustError> {
        input.validate()?;

        let mut head = self.head.lock();
        let timestamp = self.clock.now().trunc_subsecs(6);
        let entry =
            AuditEntry::seal(input, head.next_sequence, timestamp, head.last_hash.clone())?;

        let attempts = retry.max_attempts.max(1);
        let mut backoff = retry.initial_backoff;
        let mut attempt = 1;
        loop {
            match self.store.append(&entry) {
                Ok(()) => break,
                Err(err) if attempt < attempts => {
                    tracing::warn!(
                        sequence = entry.sequence,
                        attempt,
                        error = %err,
                        "audit append failed, retrying"
                    );
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(retry.max_backoff);
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(
                        sequence = entry.sequence,
                        action = entry.action.as_str(),
                        attempts = attempt,
                        error = %err,
                        "audit append failed"
                    );
                    return Err(err);
                }
            }
        }

        head.next_sequence += 1;
        head.last_hash = entry.entry_hash.clone();
        self.committed.store(head.next_sequence, Ordering::Release);
        drop(head);

        tracing::debug!(
            sequence = entry.sequence,
            action = entry.action.as_str(),
            actor = %entry.actor_id,
            "audit entry appended"
        );
        Ok(entry)
    }

    /// Append under an explicit failure policy.
    ///
    /// With [`AppendPolicy::FailOpen`] a storage failure returns `Ok(None)`
    /// after an escalated error log. Validation errors always propagate.
    pub fn append_with_policy(
        &self,
        input: AuditEntryInput,
        policy: AppendPolicy,
    ) -> Result<Option<AuditEntry>, TrustError> {
        let actor = input.actor_id.clone();
        let action = input.action;
        match self.append(input) {
            Ok(entry) => Ok(Some(entry)),
            Err(TrustError::Storage(reason)) if policy == AppendPolicy::FailOpen => {
                tracing::error!(
                    escalate = true,
                    actor = %actor,
                    action = action.as_str(),
                    reason = %reason,
                    "proceeding without audit receipt"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Replay the chain and report the first broken link.
    ///
    /// With `limit`, only the most recent `limit` entries are checked, and
    /// the first of them is linked against its predecessor's stored hash.
    /// Checking continues past the first failure so `broken_links` bounds
    /// the damaged window.
    pub fn verify(&self, limit: Option<u64>) -> Result<VerificationResult, TrustError> {
        let end = self.len();
        let start = limit.map_or(0, |n| end.saturating_sub(n));

        let mut expected_prev = if start == 0 {
            GENESIS_HASH.to_string()
        } else {
            self.store
                .read_range(start - 1, start)?
                .pop()
                .map(|anchor| anchor.entry_hash)
                .ok_or_else(|| {
                    TrustError::Storage(format!("anchor entry {} unreadable", start - 1))
                })?
        };

        let mut result = VerificationResult::empty();
        let mut cursor = start;
        while cursor < end {
            let page_end = (cursor + PAGE_SIZE).min(end);
            let page = self.store.read_range(cursor, page_end)?;
            if page.is_empty() {
                break;
            }

            for entry in page {
                let index = cursor - start;
                // An entry too large to encode cannot match any stored hash.
                let recomputed = entry.compute_hash().unwrap_or_default();

                let kind = if entry.sequence != cursor {
                    Some(ChainBreak::SequenceGap)
                } else if entry.previous_hash != expected_prev {
                    Some(ChainBreak::PreviousHashMismatch)
                } else if recomputed.is_empty() || recomputed != entry.entry_hash {
                    Some(ChainBreak::HashMismatch)
                } else {
                    None
                };
                if let Some(kind) = kind {
                    result.record_break(index, cursor, kind);
                }

                expected_prev = recomputed;
                result.total_checked += 1;
                cursor += 1;
            }
        }

        if cursor < end {
            result.record_break(cursor - start, cursor, ChainBreak::MissingEntries);
        }

        if result.valid {
            tracing::debug!(checked = result.total_checked, "audit chain verified");
        } else {
            tracing::error!(
                checked = result.total_checked,
                first_invalid_index = ?result.first_invalid_index,
                first_invalid_sequence = ?result.first_invalid_sequence,
                kind = ?result.first_break,
                broken_links = result.broken_links,
                "audit chain integrity violation"
            );
        }
        Ok(result)
    }

    /// Iterate lazily over committed entries matching `filters`.
    pub fn query(&self, filters: AuditFilters) -> AuditQuery<'_, S> {
        AuditQuery {
            store: &self.store,
            filters,
            next: 0,
            end: self.len(),
            page: Vec::new().into_iter(),
            done: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryAuditStore;
    use chrono::TimeZone;
    use parking_lot::RwLock;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// A store whose contents tests can rewrite behind the chain's back.
    #[derive(Default)]
    struct TamperableStore {
        entries: RwLock<Vec<AuditEntry>>,
    }

    impl TamperableStore {
        fn edit(&self, sequence: usize, f: impl FnOnce(&mut AuditEntry)) {
            f(&mut self.entries.write()[sequence]);
        }
    }

    impl AuditStore for TamperableStore {
        fn append(&self, entry: &AuditEntry) -> Result<(), TrustError> {
            self.entries.write().push(entry.clone());
            Ok(())
        }

        fn read_range(&self, start: u64, end: u64) -> Result<Vec<AuditEntry>, TrustError> {
            let entries = self.entries.read();
            let end = (end as usize).min(entries.len());
            let start = (start as usize).min(end);
            Ok(entries[start..end].to_vec())
        }

        fn tail(&self) -> Result<Option<AuditEntry>, TrustError> {
            Ok(self.entries.read().last().cloned())
        }
    }

    /// Fails the first `failures` appends.
    struct FlakyStore {
        inner: MemoryAuditStore,
        failures: AtomicU32,
    }

    impl AuditStore for FlakyStore {
        fn append(&self, entry: &AuditEntry) -> Result<(), TrustError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(TrustError::Storage("disk unavailable".into()));
            }
            self.inner.append(entry)
        }

        fn read_range(&self, start: u64, end: u64) -> Result<Vec<AuditEntry>, TrustError> {
            self.inner.read_range(start, end)
        }

        fn tail(&self) -> Result<Option<AuditEntry>, TrustError> {
            self.inner.tail()
        }
    }

    /// Parks each armed append between two barrier waits: one when the
    /// write starts, one to let it finish.
    struct GatedStore {
        inner: MemoryAuditStore,
        armed: std::sync::atomic::AtomicBool,
        gate: std::sync::Barrier,
    }

    impl AuditStore for GatedStore {
        fn append(&self, entry: &AuditEntry) -> Result<(), TrustError> {
            if self.armed.load(Ordering::SeqCst) {
                self.gate.wait();
                self.gate.wait();
            }
            self.inner.append(entry)
        }

        fn read_range(&self, start: u64, end: u64) -> Result<Vec<AuditEntry>, TrustError> {
            self.inner.read_range(start, end)
        }

        fn tail(&self) -> Result<Option<AuditEntry>, TrustError> {
            self.inner.tail()
        }
    }

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn input(n: u64) -> AuditEntryInput {
        AuditEntryInput::new("user-1", AuditAction::Read, "diagnosis", format!("rec-{n}"))
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: StdDuration::from_millis(1),
            max_backoff: StdDuration::from_millis(2),
        }
    }

    #[test]
    fn test_state_transitions() {
        let chain = AuditChain::open(MemoryAuditStore::new()).unwrap();
        assert_eq!(chain.state(), ChainState::Empty);
        assert_eq!(chain.head_hash(), GENESIS_HASH);

        let first = chain.append(input(0)).unwrap();
        assert_eq!(chain.state(), ChainState::Active);
        assert_eq!(first.sequence, 0);
        assert_eq!(first.previous_hash, GENESIS_HASH);
        assert_eq!(chain.head_hash(), first.entry_hash);
    }

    #[test]
    fn test_entries_link() {
        let chain = AuditChain::open(MemoryAuditStore::new()).unwrap();
        let a = chain.append(input(0)).unwrap();
        let b = chain.append(input(1)).unwrap();
        assert_eq!(b.sequence, 1);
        assert_eq!(b.previous_hash, a.entry_hash);
    }

    #[test]
    fn test_invalid_input_not_committed() {
        let chain = AuditChain::open(MemoryAuditStore::new()).unwrap();
        let mut bad = input(0);
        bad.regulated = true;
        assert!(matches!(chain.append(bad), Err(TrustError::InvalidEntry(_))));
        assert!(chain.is_empty());
    }

    #[test]
    fn test_timestamp_from_clock_truncated_to_micros() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 5, 12, 0, 0).unwrap()
            + chrono::Duration::nanoseconds(1_234_567);
        let chain =
            AuditChain::with_clock(MemoryAuditStore::new(), Arc::new(FixedClock(ts))).unwrap();
        let entry = chain.append(input(0)).unwrap();
        assert_eq!(entry.timestamp.timestamp_subsec_nanos(), 1_234_000);
    }

    #[test]
    fn test_verify_detects_field_edit() {
        let chain = AuditChain::open(TamperableStore::default()).unwrap();
        for n in 0..6 {
            chain.append(input(n)).unwrap();
        }
        chain.store().edit(3, |e| e.resource_id = "rec-forged".into());

        let result = chain.verify(None).unwrap();
        assert!(!result.valid);
        assert_eq!(result.total_checked, 6);
        assert_eq!(result.first_invalid_index, Some(3));
        assert_eq!(result.first_break, Some(ChainBreak::HashMismatch));
        // Entry 4 no longer links to the recomputed hash of entry 3.
        assert_eq!(result.broken_links, 2);
    }

    #[test]
    fn test_verify_detects_recomputed_forgery() {
        let chain = AuditChain::open(TamperableStore::default()).unwrap();
        for n in 0..4 {
            chain.append(input(n)).unwrap();
        }
        // Forger rewrites entry 1 and fixes its own hash, but cannot fix 2.
        chain.store().edit(1, |e| {
            e.actor_id = "someone-else".into();
            e.entry_hash = e.compute_hash().unwrap();
        });

        let result = chain.verify(None).unwrap();
        assert_eq!(result.first_invalid_index, Some(2));
        assert_eq!(result.first_break, Some(ChainBreak::PreviousHashMismatch));
    }

    #[test]
    fn test_verify_window() {
        let chain = AuditChain::open(TamperableStore::default()).unwrap();
        for n in 0..10 {
            chain.append(input(n)).unwrap();
        }
        chain.store().edit(2, |e| e.actor_id = "x".into());

        let recent = chain.verify(Some(5)).unwrap();
        assert!(recent.valid);
        assert_eq!(recent.total_checked, 5);

        let wider = chain.verify(Some(9)).unwrap();
        assert!(!wider.valid);
        assert_eq!(wider.first_invalid_index, Some(1));
        assert_eq!(wider.first_invalid_sequence, Some(2));

        assert_eq!(chain.verify(Some(100)).unwrap().total_checked, 10);
    }

    #[test]
    fn test_verify_detects_truncation() {
        let chain = AuditChain::open(TamperableStore::default()).unwrap();
        for n in 0..4 {
            chain.append(input(n)).unwrap();
        }
        chain.store().entries.write().truncate(2);

        let result = chain.verify(None).unwrap();
        assert!(!result.valid);
        assert_eq!(result.total_checked, 2);
        assert_eq!(result.first_break, Some(ChainBreak::MissingEntries));
        assert_eq!(result.first_invalid_index, Some(2));
    }

    #[test]
    fn test_into_result() {
        let chain = AuditChain::open(TamperableStore::default()).unwrap();
        chain.append(input(0)).unwrap();
        assert!(chain.verify(None).unwrap().into_result().is_ok());

        chain.store().edit(0, |e| e.previous_hash = "1".repeat(64));
        let err = chain.verify(None).unwrap().into_result().unwrap_err();
        assert!(matches!(
            err,
            TrustError::ChainIntegrityViolation { index: 0, sequence: 0 }
        ));
    }

    #[test]
    fn test_failed_append_keeps_head() {
        let store = FlakyStore {
            inner: MemoryAuditStore::new(),
            failures: AtomicU32::new(1),
        };
        let chain = AuditChain::open(store).unwrap();

        assert!(matches!(chain.append(input(0)), Err(TrustError::Storage(_))));
        assert!(chain.is_empty());
        assert_eq!(chain.head_hash(), GENESIS_HASH);

        let entry = chain.append(input(0)).unwrap();
        assert_eq!(entry.sequence, 0);
        assert_eq!(entry.previous_hash, GENESIS_HASH);
        assert!(chain.verify(None).unwrap().valid);
    }

    #[test]
    fn test_append_with_retry_recovers() {
        let store = FlakyStore {
            inner: MemoryAuditStore::new(),
            failures: AtomicU32::new(2),
        };
        let chain = AuditChain::open(store).unwrap();
        let entry = chain.append_with_retry(input(0), &fast_retry(3)).unwrap();
        assert_eq!(entry.sequence, 0);
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_append_with_retry_gives_up() {
        let store = FlakyStore {
            inner: MemoryAuditStore::new(),
            failures: AtomicU32::new(5),
        };
        let chain = AuditChain::open(store).unwrap();
        assert!(chain.append_with_retry(input(0), &fast_retry(2)).is_err());
        assert!(chain.is_empty());
    }

    #[test]
    fn test_append_policy() {
        let store = FlakyStore {
            inner: MemoryAuditStore::new(),
            failures: AtomicU32::new(2),
        };
        let chain = AuditChain::open(store).unwrap();

        let open = chain
            .append_with_policy(input(0), AppendPolicy::FailOpen)
            .unwrap();
        assert!(open.is_none());

        let closed = chain.append_with_policy(input(1), AppendPolicy::FailClosed);
        assert!(matches!(closed, Err(TrustError::Storage(_))));

        let ok = chain
            .append_with_policy(input(2), AppendPolicy::FailClosed)
            .unwrap();
        assert_eq!(ok.map(|e| e.sequence), Some(0));
    }

    #[test]
    fn test_query_filters() {
        let chain = AuditChain::open(MemoryAuditStore::new()).unwrap();
        chain.append(input(0)).unwrap();
        chain
            .append(AuditEntryInput::new("user-2", AuditAction::Export, "account", "acc-1"))
            .unwrap();
        chain
            .append(AuditEntryInput::new("user-1", AuditAction::Write, "account", "acc-2"))
            .unwrap();

        let by_actor: Vec<_> = chain
            .query(AuditFilters::default().actor("user-1"))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(by_actor.len(), 2);

        let accounts_written: Vec<_> = chain
            .query(
                AuditFilters::default()
                    .resource_type("account")
                    .action(AuditAction::Write),
            )
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(accounts_written.len(), 1);
        assert_eq!(accounts_written[0].resource_id, "acc-2");

        let future = chain.now() + chrono::Duration::hours(1);
        let none = chain
            .query(AuditFilters::default().between(future, future + chrono::Duration::hours(1)))
            .count();
        assert_eq!(none, 0);
    }

    #[test]
    fn test_query_snapshot_and_restart() {
        let chain = AuditChain::open(MemoryAuditStore::new()).unwrap();
        for n in 0..3 {
            chain.append(input(n)).unwrap();
        }
        let query = chain.query(AuditFilters::default());
        chain.append(input(3)).unwrap();
        assert_eq!(query.count(), 3);
        assert_eq!(chain.query(AuditFilters::default()).count(), 4);
    }

    #[test]
    fn test_query_pages_through_large_chain() {
        let chain = AuditChain::open(MemoryAuditStore::new()).unwrap();
        for n in 0..(PAGE_SIZE * 2 + 7) {
            chain.append(input(n)).unwrap();
        }
        let sequences: Vec<u64> = chain
            .query(AuditFilters::default())
            .map(|e| e.unwrap().sequence)
            .collect();
        assert_eq!(sequences.len() as u64, PAGE_SIZE * 2 + 7);
        assert!(sequences.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn test_readers_do_not_wait_for_inflight_append() {
        let store = GatedStore {
            inner: MemoryAuditStore::new(),
            armed: std::sync::atomic::AtomicBool::new(false),
            gate: std::sync::Barrier::new(2),
        };
        let chain = AuditChain::open(store).unwrap();
        chain.append(input(0)).unwrap();
        chain.store().armed.store(true, Ordering::SeqCst);

        std::thread::scope(|s| {
            let writer = s.spawn(|| chain.append(input(1)));

            // The writer now holds the head lock inside the store write.
            chain.store().gate.wait();
            assert_eq!(chain.len(), 1);
            let result = chain.verify(None).unwrap();
            assert!(result.valid);
            assert_eq!(result.total_checked, 1);
            assert_eq!(chain.query(AuditFilters::default()).count(), 1);
            assert_eq!(chain.state(), ChainState::Active);
            chain.store().gate.wait();

            assert_eq!(writer.join().unwrap().unwrap().sequence, 1);
        });
        assert_eq!(chain.len(), 2);
        assert!(chain.verify(None).unwrap().valid);
    }

    #[test]
    fn test_reopen_resumes_chain() {
        let chain = AuditChain::open(MemoryAuditStore::new()).unwrap();
        chain.append(input(0)).unwrap();
        let last = chain.append(input(1)).unwrap();

        let reopened = AuditChain::open(chain.store).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.head_hash(), last.entry_hash);
        let next = reopened.append(input(2)).unwrap();
        assert_eq!(next.previous_hash, last.entry_hash);
    }
}
