//! Audit ledger: append-only, hash-chained record of every gate decision
//! and sensitive write, with lazy time-ordered queries and compliance
//! summaries.
//!
//! Query order is by the event's own `created_at`, newest first, with the
//! store-assigned `sequence` as tie-breaker. Under concurrent writers that
//! order can differ slightly from commit order; callers needing strict
//! causal order must not rely on ledger order alone.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use clinic_core::error::ClinicResult;
use clinic_core::types::{AuditEvent, NewAuditEvent, TenantId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error};
use uuid::Uuid;

use crate::store::{bounded, AuditCursor, AuditFilter, AuditStore};

/// `previous_hash` of the first event in a ledger.
pub const GENESIS_HASH: &str = "genesis";

/// Page size used by `verify_chain`.
const CHAIN_PAGE: usize = 500;

/// Fixed-precision timestamp text used in digests and by the SQLite backend.
pub fn timestamp_text(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Seal a submitted event at the given chain position.
///
/// Timestamps are truncated to microseconds so a sealed event re-hashes
/// identically after a round trip through any backend.
pub fn seal(event: NewAuditEvent, sequence: u64, previous_hash: &str) -> AuditEvent {
    let mut sealed = AuditEvent {
        id: Uuid::new_v4(),
        sequence,
        tenant_id: event.tenant_id,
        action: event.action,
        entity_type: event.entity_type,
        entity_id: event.entity_id,
        actor_id: event.actor_id,
        actor_label: event.actor_label,
        outcome: event.outcome,
        description: event.description,
        source: event.source,
        ip_address: event.ip_address,
        user_agent: event.user_agent,
        created_at: event.created_at.trunc_subsecs(6),
        event_hash: String::new(),
        previous_hash: previous_hash.to_string(),
    };
    sealed.event_hash = event_digest(&sealed);
    sealed
}

/// SHA-256 over the event content and its `previous_hash`.
pub fn event_digest(event: &AuditEvent) -> String {
    let content = format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
        event.sequence,
        event.id,
        event.tenant_id.as_ref().map(TenantId::as_str).unwrap_or(""),
        event.action.as_str(),
        event.entity_type,
        event.entity_id.as_deref().unwrap_or(""),
        event.actor_id.as_ref().map(|a| a.as_str()).unwrap_or(""),
        event.actor_label.as_deref().unwrap_or(""),
        event.outcome.as_str(),
        event.description,
        event.source.as_deref().unwrap_or(""),
        event.ip_address.as_deref().unwrap_or(""),
        event.user_agent.as_deref().unwrap_or(""),
        timestamp_text(&event.created_at),
        event.previous_hash,
    );
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Result of verifying the audit chain integrity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub total_events: usize,
    pub valid_events: usize,
    pub tampered_sequences: Vec<u64>,
    pub chain_intact: bool,
}

/// Compliance summary over a tenant and time range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceSummary {
    pub tenant_id: TenantId,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub total_events: u64,
    pub failure_events: u64,
    pub events_by_action: HashMap<String, u64>,
    pub events_by_outcome: HashMap<String, u64>,
    pub chain: ChainVerification,
}

/// Append-only audit ledger. There is deliberately no update or delete.
pub struct AuditLedger {
    store: Arc<dyn AuditStore>,
    timeout: Duration,
    page_size: usize,
    alert_threshold: u64,
    consecutive_failures: AtomicU64,
}

impl AuditLedger {
    pub fn new(
        store: Arc<dyn AuditStore>,
        timeout: Duration,
        page_size: usize,
        alert_threshold: u64,
    ) -> Self {
        Self {
            store,
            timeout,
            page_size: page_size.max(1),
            alert_threshold: alert_threshold.max(1),
            consecutive_failures: AtomicU64::new(0),
        }
    }

    /// Append one event. The only failure is an unreachable or slow store.
    pub async fn record(&self, event: NewAuditEvent) -> ClinicResult<Uuid> {
        match bounded(self.timeout, self.store.append(event)).await {
            Ok(sealed) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                debug!(
                    event_id = %sealed.id,
                    sequence = sealed.sequence,
                    action = sealed.action.as_str(),
                    entity = %sealed.entity_type,
                    outcome = sealed.outcome.as_str(),
                    "Audit event recorded"
                );
                Ok(sealed.id)
            }
            Err(e) => {
                self.escalate(&e.to_string());
                Err(e)
            }
        }
    }

    /// Record without failing the caller's primary operation.
    ///
    /// A failed write has already been escalated by `record`; this only
    /// swallows the error so the caller can continue.
    pub async fn record_or_escalate(&self, event: NewAuditEvent) -> Option<Uuid> {
        self.record(event).await.ok()
    }

    fn escalate(&self, reason: &str) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::counter!("audit.write_failures").increment(1);
        error!(error = %reason, consecutive_failures = failures, "Audit write failed");
        if failures >= self.alert_threshold {
            error!(
                alert = "audit_ledger_unavailable",
                consecutive_failures = failures,
                "Audit ledger is dropping writes; operator action required"
            );
        }
    }

    /// Consecutive failed writes since the last success.
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Start a lazy query. No store call happens until the pager is polled.
    pub fn query(&self, filter: AuditFilter) -> AuditPager {
        AuditPager {
            store: self.store.clone(),
            timeout: self.timeout,
            page_size: self.page_size,
            remaining: filter.limit,
            filter,
            buffer: VecDeque::new(),
            cursor: None,
            exhausted: false,
        }
    }

    /// Walk the ledger in commit order and re-check every hash link.
    pub async fn verify_chain(&self) -> ClinicResult<ChainVerification> {
        let mut total = 0;
        let mut valid = 0;
        let mut tampered = Vec::new();
        let mut expected_prev = GENESIS_HASH.to_string();
        let mut after = 0;

        loop {
            let page = bounded(self.timeout, self.store.chain(after, CHAIN_PAGE)).await?;
            if page.is_empty() {
                break;
            }
            for event in &page {
                total += 1;
                if event.previous_hash == expected_prev && event_digest(event) == event.event_hash
                {
                    valid += 1;
                } else {
                    tampered.push(event.sequence);
                }
                expected_prev = event.event_hash.clone();
                after = event.sequence;
            }
            if page.len() < CHAIN_PAGE {
                break;
            }
        }

        Ok(ChainVerification {
            total_events: total,
            valid_events: valid,
            tampered_sequences: tampered,
            chain_intact: valid == total,
        })
    }

    /// Summarise a tenant's events in `[from, to]` for compliance reporting.
    pub async fn summarize(
        &self,
        tenant_id: &TenantId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ClinicResult<ComplianceSummary> {
        let mut pager = self.query(AuditFilter {
            tenant_id: Some(tenant_id.clone()),
            from: Some(from),
            to: Some(to),
            ..AuditFilter::default()
        });

        let mut total = 0;
        let mut failures = 0;
        let mut by_action: HashMap<String, u64> = HashMap::new();
        let mut by_outcome: HashMap<String, u64> = HashMap::new();
        while let Some(event) = pager.next().await? {
            total += 1;
            if event.outcome.is_failure() {
                failures += 1;
            }
            *by_action.entry(event.action.as_str().to_string()).or_default() += 1;
            *by_outcome.entry(event.outcome.as_str().to_string()).or_default() += 1;
        }

        Ok(ComplianceSummary {
            tenant_id: tenant_id.clone(),
            from,
            to,
            total_events: total,
            failure_events: failures,
            events_by_action: by_action,
            events_by_outcome: by_outcome,
            chain: self.verify_chain().await?,
        })
    }
}

/// Lazy, finite, single-pass cursor over an audit query, newest first.
///
/// Pages are fetched on demand with keyset pagination, so events appended
/// while the pager is live may or may not be observed. Start a new query to
/// see a fresh view.
pub struct AuditPager {
    store: Arc<dyn AuditStore>,
    timeout: Duration,
    page_size: usize,
    filter: AuditFilter,
    remaining: Option<usize>,
    buffer: VecDeque<AuditEvent>,
    cursor: Option<AuditCursor>,
    exhausted: bool,
}

impl AuditPager {
    pub async fn next(&mut self) -> ClinicResult<Option<AuditEvent>> {
        if self.remaining == Some(0) {
            return Ok(None);
        }
        if self.buffer.is_empty() && !self.exhausted {
            self.fill().await?;
        }
        let Some(event) = self.buffer.pop_front() else {
            return Ok(None);
        };
        if let Some(ref mut remaining) = self.remaining {
            *remaining -= 1;
        }
        Ok(Some(event))
    }

    /// Drain the remaining events.
    pub async fn collect(mut self) -> ClinicResult<Vec<AuditEvent>> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await? {
            events.push(event);
        }
        Ok(events)
    }

    async fn fill(&mut self) -> ClinicResult<()> {
        let want = match self.remaining {
            Some(remaining) => remaining.min(self.page_size),
            None => self.page_size,
        };
        let page = bounded(
            self.timeout,
            self.store.page(&self.filter, self.cursor, want),
        )
        .await?;
        if page.len() < want {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.cursor = Some(AuditCursor::of(last));
        }
        self.buffer.extend(page);
        Ok(())
    }
}
