//! Storage abstraction: one repository trait per persisted collection.
//!
//! The core never sees a generic query builder. Each trait exposes exactly
//! the reads and writes the components need, and `AuditStore` has no update
//! or delete method at all.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clinic_core::error::ClinicError;
use clinic_core::types::{
    ActorId, AuditAction, AuditEvent, AuditOutcome, ConsentRecord, Membership, NewAuditEvent,
    PatientId, Role, Tenant, TenantId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A conditional write lost against a concurrent writer.
    #[error("conflicting write on {0}")]
    Conflict(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<StoreError> for ClinicError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => ClinicError::StorageUnavailable(msg),
            StoreError::Conflict(what) => ClinicError::ConcurrentModification(what),
            StoreError::Corrupt(msg) => ClinicError::Internal(anyhow::anyhow!("corrupt row: {msg}")),
        }
    }
}

tokio::task_local! {
    static CALL_BUDGET: Arc<CallBudget>;
}

const BUDGET_OPEN: u8 = 0;
const BUDGET_ABANDONED: u8 = 1;
const BUDGET_CLAIMED: u8 = 2;

/// Deadline shared between a `bounded` call and the store work it started.
///
/// Backends that finish work off the calling task must `claim` the budget
/// before making a write durable. A claimed budget no longer times out, and
/// an abandoned one can no longer be claimed, so a caller that saw
/// `StorageUnavailable` never has its write land afterwards.
#[derive(Debug)]
pub struct CallBudget {
    deadline: Instant,
    state: AtomicU8,
}

impl CallBudget {
    fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            state: AtomicU8::new(BUDGET_OPEN),
        }
    }

    /// Budget of the `bounded` call running on this task, if any.
    pub fn current() -> Option<Arc<CallBudget>> {
        CALL_BUDGET.try_with(Arc::clone).ok()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_abandoned(&self) -> bool {
        self.state.load(Ordering::SeqCst) == BUDGET_ABANDONED
    }

    /// Take the right to commit. Fails once the deadline passed or the caller gave up.
    pub fn claim(&self) -> bool {
        if Instant::now() >= self.deadline {
            return false;
        }
        self.state
            .compare_exchange(BUDGET_OPEN, BUDGET_CLAIMED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn abandon(&self) -> bool {
        self.state
            .compare_exchange(BUDGET_OPEN, BUDGET_ABANDONED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

fn timed_out(timeout: Duration) -> ClinicError {
    ClinicError::StorageUnavailable(format!(
        "store call timed out after {}ms",
        timeout.as_millis()
    ))
}

/// Run a store call under a deadline. Elapsed deadlines surface as `StorageUnavailable`.
///
/// A store that already claimed the budget is waited for, so its result is
/// the one reported.
pub async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T, ClinicError>
where
    F: Future<Output = StoreResult<T>>,
{
    let budget = Arc::new(CallBudget::new(timeout));
    let call = CALL_BUDGET.scope(budget.clone(), fut);
    tokio::pin!(call);

    let finished = tokio::select! {
        biased;
        result = &mut call => Some(result),
        _ = tokio::time::sleep(timeout) => None,
    };
    let result = match finished {
        Some(result) => result,
        None if budget.abandon() => return Err(timed_out(timeout)),
        None => call.await,
    };
    result.map_err(ClinicError::from)
}

/// Result of an upsert on (actor, tenant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChange {
    pub membership: Membership,
    /// Role before the write; `None` when the row was new or had been revoked.
    pub previous_role: Option<Role>,
}

/// Filter for audit queries. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFilter {
    pub tenant_id: Option<TenantId>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub actor_id: Option<ActorId>,
    pub action: Option<AuditAction>,
    pub outcome: Option<AuditOutcome>,
    /// Inclusive lower bound on `created_at`.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`.
    pub to: Option<DateTime<Utc>>,
    /// Cap on the total number of events a query yields.
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(ref tenant) = self.tenant_id {
            if event.tenant_id.as_ref() != Some(tenant) {
                return false;
            }
        }
        if let Some(ref entity_type) = self.entity_type {
            if &event.entity_type != entity_type {
                return false;
            }
        }
        if let Some(ref entity_id) = self.entity_id {
            if event.entity_id.as_ref() != Some(entity_id) {
                return false;
            }
        }
        if let Some(ref actor) = self.actor_id {
            if event.actor_id.as_ref() != Some(actor) {
                return false;
            }
        }
        if let Some(action) = self.action {
            if event.action != action {
                return false;
            }
        }
        if let Some(outcome) = self.outcome {
            if event.outcome != outcome {
                return false;
            }
        }
        if let Some(from) = self.from {
            if event.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if event.created_at > to {
                return false;
            }
        }
        true
    }
}

/// Keyset position in the `(created_at, sequence)` descending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditCursor {
    pub created_at: DateTime<Utc>,
    pub sequence: u64,
}

impl AuditCursor {
    pub fn of(event: &AuditEvent) -> Self {
        Self {
            created_at: event.created_at,
            sequence: event.sequence,
        }
    }

    /// True when `event` sorts strictly after this cursor in descending order.
    pub fn precedes(&self, event: &AuditEvent) -> bool {
        (event.created_at, event.sequence) < (self.created_at, self.sequence)
    }
}

#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn get_tenant(&self, id: &TenantId) -> StoreResult<Option<Tenant>>;

    async fn put_tenant(&self, tenant: Tenant) -> StoreResult<()>;
}

#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// The non-revoked membership for (actor, tenant), if any.
    async fn find_membership(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
    ) -> StoreResult<Option<Membership>>;

    /// Non-revoked memberships of an actor in insertion order.
    async fn memberships_for_actor(&self, actor: &ActorId) -> StoreResult<Vec<Membership>>;

    /// Whether the actor holds a non-revoked `super_admin` membership in any tenant.
    async fn holds_super_admin(&self, actor: &ActorId) -> StoreResult<bool>;

    /// Atomic upsert on (actor, tenant). Reactivates a revoked row in place.
    async fn upsert_membership(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
        role: Role,
    ) -> StoreResult<MembershipChange>;

    /// Soft-delete. Returns the revoked row, or `None` if nothing was active.
    async fn revoke_membership(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
    ) -> StoreResult<Option<Membership>>;
}

/// Append-only audit storage. Appends are sealed into the hash chain by the store.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, event: NewAuditEvent) -> StoreResult<AuditEvent>;

    /// Up to `limit` matching events after `after`, newest first.
    async fn page(
        &self,
        filter: &AuditFilter,
        after: Option<AuditCursor>,
        limit: usize,
    ) -> StoreResult<Vec<AuditEvent>>;

    /// Up to `limit` events with `sequence > after_sequence`, in commit order.
    async fn chain(&self, after_sequence: u64, limit: usize) -> StoreResult<Vec<AuditEvent>>;
}

#[async_trait]
pub trait ConsentStore: Send + Sync {
    async fn active_consent(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
    ) -> StoreResult<Option<ConsentRecord>>;

    /// Every record for the patient, newest first.
    async fn consent_history(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
    ) -> StoreResult<Vec<ConsentRecord>>;

    /// Atomically revoke `expected_active` (if any) and insert `record` as active.
    /// Fails with `Conflict` if the current active record is not `expected_active`.
    /// Returns the record that was superseded.
    async fn supersede_consent(
        &self,
        record: ConsentRecord,
        expected_active: Option<Uuid>,
    ) -> StoreResult<Option<ConsentRecord>>;

    /// Mark `expected_active` revoked. Fails with `Conflict` if it is no longer active.
    async fn revoke_consent(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
        expected_active: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<ConsentRecord>;
}

/// Everything the core needs from a durable store.
pub trait AccessStore: TenantStore + MembershipStore + AuditStore + ConsentStore {}

impl<T> AccessStore for T where T: TenantStore + MembershipStore + AuditStore + ConsentStore {}
