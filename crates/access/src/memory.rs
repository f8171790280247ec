//! In-memory store backed by DashMap.
//!
//! Per-key entry locks give the atomic upsert and supersede the core relies
//! on, and the write half of an `RwLock` serializes the audit hash chain.
//! Memberships are also indexed per actor, so role resolution touches only
//! that actor's rows. Used in development and tests, and as the default
//! backend.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clinic_core::types::{
    ActorId, AuditEvent, ConsentRecord, ConsentStatus, Membership, NewAuditEvent, PatientId, Role,
    Tenant, TenantId,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::info;
use uuid::Uuid;

use crate::audit::{seal, GENESIS_HASH};
use crate::store::{
    AuditCursor, AuditFilter, AuditStore, ConsentStore, MembershipChange, MembershipStore,
    StoreError, StoreResult, TenantStore,
};

/// Thread-safe in-memory store for tenants, memberships, audit events and consent records.
pub struct MemoryStore {
    tenants: DashMap<TenantId, Tenant>,
    memberships: DashMap<(ActorId, TenantId), Membership>,
    /// Tenants of every membership row an actor has ever held, revoked ones included.
    actor_tenants: DashMap<ActorId, Vec<TenantId>>,
    next_position: AtomicU64,
    /// Audit events in commit order; index `i` holds sequence `i + 1`.
    audit: RwLock<Vec<AuditEvent>>,
    consents: DashMap<(TenantId, PatientId), Vec<ConsentRecord>>,
    unavailable: AtomicBool,
    tenant_writes_unavailable: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("Access store initialized (in-memory)");
        Self {
            tenants: DashMap::new(),
            memberships: DashMap::new(),
            actor_tenants: DashMap::new(),
            next_position: AtomicU64::new(1),
            audit: RwLock::new(Vec::new()),
            consents: DashMap::new(),
            unavailable: AtomicBool::new(false),
            tenant_writes_unavailable: AtomicBool::new(false),
            latency: Mutex::new(None),
        }
    }

    /// Simulate an unreachable store: every call fails with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail only `put_tenant`, leaving reads and the audit ledger reachable.
    pub fn set_tenant_writes_unavailable(&self, unavailable: bool) {
        self.tenant_writes_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every call, to exercise caller timeouts.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    async fn reachable(&self) -> StoreResult<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }

    /// Active memberships of `actor`, in insertion order.
    fn active_memberships(&self, actor: &ActorId) -> Vec<Membership> {
        let tenants = self
            .actor_tenants
            .get(actor)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut rows: Vec<Membership> = tenants
            .into_iter()
            .filter_map(|tenant| {
                self.memberships
                    .get(&(actor.clone(), tenant))
                    .map(|e| e.value().clone())
            })
            .filter(Membership::is_active)
            .collect();
        rows.sort_by_key(|m| m.position);
        rows
    }

    fn active_of(records: &[ConsentRecord]) -> Option<&ConsentRecord> {
        records.iter().rev().find(|r| r.status == ConsentStatus::Active)
    }
}

#[async_trait]
impl TenantStore for MemoryStore {
    async fn get_tenant(&self, id: &TenantId) -> StoreResult<Option<Tenant>> {
        self.reachable().await?;
        Ok(self.tenants.get(id).map(|e| e.value().clone()))
    }

    async fn put_tenant(&self, tenant: Tenant) -> StoreResult<()> {
        self.reachable().await?;
        if self.tenant_writes_unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("tenant writes offline".into()));
        }
        self.tenants.insert(tenant.id.clone(), tenant);
        Ok(())
    }
}

#[async_trait]
impl MembershipStore for MemoryStore {
    async fn find_membership(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
    ) -> StoreResult<Option<Membership>> {
        self.reachable().await?;
        Ok(self
            .memberships
            .get(&(actor.clone(), tenant.clone()))
            .map(|e| e.value().clone())
            .filter(Membership::is_active))
    }

    async fn memberships_for_actor(&self, actor: &ActorId) -> StoreResult<Vec<Membership>> {
        self.reachable().await?;
        Ok(self.active_memberships(actor))
    }

    async fn holds_super_admin(&self, actor: &ActorId) -> StoreResult<bool> {
        self.reachable().await?;
        Ok(self
            .active_memberships(actor)
            .iter()
            .any(|m| m.role == Role::SuperAdmin))
    }

    async fn upsert_membership(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
        role: Role,
    ) -> StoreResult<MembershipChange> {
        self.reachable().await?;
        let now = Utc::now();
        let change = match self.memberships.entry((actor.clone(), tenant.clone())) {
            Entry::Occupied(mut entry) => {
                let row = entry.get_mut();
                let previous_role = row.is_active().then_some(row.role);
                row.role = role;
                row.revoked_at = None;
                row.updated_at = now;
                MembershipChange {
                    membership: row.clone(),
                    previous_role,
                }
            }
            Entry::Vacant(entry) => {
                let row = Membership {
                    id: Uuid::new_v4(),
                    actor_id: actor.clone(),
                    tenant_id: tenant.clone(),
                    role,
                    position: self.next_position.fetch_add(1, Ordering::SeqCst),
                    created_at: now,
                    updated_at: now,
                    revoked_at: None,
                };
                entry.insert(row.clone());
                self.actor_tenants
                    .entry(actor.clone())
                    .or_default()
                    .push(tenant.clone());
                MembershipChange {
                    membership: row,
                    previous_role: None,
                }
            }
        };
        Ok(change)
    }

    async fn revoke_membership(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
    ) -> StoreResult<Option<Membership>> {
        self.reachable().await?;
        let key = (actor.clone(), tenant.clone());
        let Some(mut row) = self.memberships.get_mut(&key) else {
            return Ok(None);
        };
        if !row.is_active() {
            return Ok(None);
        }
        let now = Utc::now();
        row.revoked_at = Some(now);
        row.updated_at = now;
        Ok(Some(row.clone()))
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append(&self, event: NewAuditEvent) -> StoreResult<AuditEvent> {
        self.reachable().await?;
        let mut events = self.audit.write();
        let previous_hash = events
            .last()
            .map(|e| e.event_hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let sealed = seal(event, events.len() as u64 + 1, &previous_hash);
        events.push(sealed.clone());
        Ok(sealed)
    }

    async fn page(
        &self,
        filter: &AuditFilter,
        after: Option<AuditCursor>,
        limit: usize,
    ) -> StoreResult<Vec<AuditEvent>> {
        self.reachable().await?;
        let mut matched: Vec<AuditEvent> = self
            .audit
            .read()
            .iter()
            .filter(|e| filter.matches(e))
            .filter(|e| after.map_or(true, |cursor| cursor.precedes(e)))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            (b.created_at, b.sequence).cmp(&(a.created_at, a.sequence))
        });
        matched.truncate(limit);
        Ok(matched)
    }

    async fn chain(&self, after_sequence: u64, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        self.reachable().await?;
        Ok(self
            .audit
            .read()
            .iter()
            .skip(after_sequence as usize)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ConsentStore for MemoryStore {
    async fn active_consent(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
    ) -> StoreResult<Option<ConsentRecord>> {
        self.reachable().await?;
        Ok(self
            .consents
            .get(&(tenant.clone(), patient.clone()))
            .and_then(|records| Self::active_of(&records).cloned()))
    }

    async fn consent_history(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
    ) -> StoreResult<Vec<ConsentRecord>> {
        self.reachable().await?;
        Ok(self
            .consents
            .get(&(tenant.clone(), patient.clone()))
            .map(|records| records.iter().rev().cloned().collect())
            .unwrap_or_default())
    }

    async fn supersede_consent(
        &self,
        record: ConsentRecord,
        expected_active: Option<Uuid>,
    ) -> StoreResult<Option<ConsentRecord>> {
        self.reachable().await?;
        let key = (record.tenant_id.clone(), record.patient_id.clone());
        // The shard stays write-locked for the whole swap, so readers see
        // either the old active record or the new one, never neither.
        let mut records = self.consents.entry(key).or_default();
        let current = records
            .iter()
            .position(|r| r.status == ConsentStatus::Active);
        if current.map(|i| records[i].id) != expected_active {
            return Err(StoreError::Conflict(format!(
                "consent {}/{}",
                record.tenant_id, record.patient_id
            )));
        }
        let superseded = current.map(|i| {
            let prior = &mut records[i];
            prior.status = ConsentStatus::Revoked;
            prior.revoked_at = Some(record.created_at);
            prior.superseded_by = Some(record.id);
            prior.clone()
        });
        records.push(record);
        Ok(superseded)
    }

    async fn revoke_consent(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
        expected_active: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<ConsentRecord> {
        self.reachable().await?;
        let conflict = || StoreError::Conflict(format!("consent {tenant}/{patient}"));
        let mut records = self
            .consents
            .get_mut(&(tenant.clone(), patient.clone()))
            .ok_or_else(conflict)?;
        let record = records
            .iter_mut()
            .find(|r| r.id == expected_active && r.status == ConsentStatus::Active)
            .ok_or_else(conflict)?;
        record.status = ConsentStatus::Revoked;
        record.revoked_at = Some(at);
        Ok(record.clone())
    }
}
