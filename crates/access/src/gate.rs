//! `AccessCore`: the inbound surface request handlers call.
//!
//! Every entry point takes the tenant explicitly. Mutations of tenants and
//! memberships are audited here; permission checks and consent writes audit
//! themselves.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clinic_core::config::AccessConfig;
use clinic_core::error::{ClinicError, ClinicResult};
use clinic_core::types::{
    entity, ActorId, AuditAction, AuditOutcome, CaptureContext, Capability, ConsentClauses,
    ConsentRecord, Decision, DenyReason, Membership, NewAuditEvent, PatientId, Role, Tenant,
    TenantId,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditLedger, AuditPager, ChainVerification, ComplianceSummary};
use crate::consent::ConsentLedger;
use crate::membership::{MembershipDirectory, TenantRole};
use crate::permission::{AccessContext, PermissionEvaluator};
use crate::store::{bounded, AccessStore, AuditFilter, MembershipChange, TenantStore};

pub struct AccessCore {
    tenants: Arc<dyn TenantStore>,
    directory: Arc<MembershipDirectory>,
    evaluator: PermissionEvaluator,
    ledger: Arc<AuditLedger>,
    consent: ConsentLedger,
    timeout: Duration,
}

impl AccessCore {
    /// Wire the four components over one store. `timeout` bounds every store call.
    pub fn new<S: AccessStore + 'static>(
        store: Arc<S>,
        config: &AccessConfig,
        timeout: Duration,
    ) -> Self {
        let ledger = Arc::new(AuditLedger::new(
            store.clone(),
            timeout,
            config.audit_page_size,
            config.audit_failure_alert_threshold,
        ));
        let directory = Arc::new(MembershipDirectory::new(store.clone(), timeout));
        let evaluator = PermissionEvaluator::new(
            store.clone(),
            directory.clone(),
            ledger.clone(),
            config.audit_permission_checks,
            timeout,
        );
        let consent = ConsentLedger::new(
            store.clone(),
            ledger.clone(),
            timeout,
            config.consent_validity_days,
        );
        info!(
            audit_permission_checks = config.audit_permission_checks,
            consent_validity_days = ?config.consent_validity_days,
            "Access core initialized"
        );
        Self {
            tenants: store,
            directory,
            evaluator,
            ledger,
            consent,
            timeout,
        }
    }

    // ─── Permissions ────────────────────────────────────────────────────

    pub async fn check_permission(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
        capability: Capability,
        ctx: &AccessContext,
    ) -> ClinicResult<Decision> {
        self.evaluator.check(actor, tenant, capability, ctx).await
    }

    pub async fn require_permission(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
        capability: Capability,
        ctx: &AccessContext,
    ) -> ClinicResult<()> {
        self.evaluator.require(actor, tenant, capability, ctx).await
    }

    pub async fn capabilities(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
    ) -> ClinicResult<Vec<Capability>> {
        self.evaluator.capabilities(actor, tenant).await
    }

    // ─── Memberships ────────────────────────────────────────────────────

    pub async fn resolve_role(&self, actor: &ActorId, tenant: &TenantId) -> ClinicResult<Option<Role>> {
        self.directory.resolve_role(actor, tenant).await
    }

    pub async fn list_tenants(&self, actor: &ActorId) -> ClinicResult<Vec<TenantRole>> {
        self.directory.list_tenants(actor).await
    }

    pub async fn has_any_access(&self, actor: &ActorId, tenant: &TenantId) -> ClinicResult<bool> {
        self.directory.has_any_access(actor, tenant).await
    }

    pub async fn membership(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
    ) -> ClinicResult<Option<Membership>> {
        self.directory.membership(actor, tenant).await
    }

    /// Grant `role` to `actor` in `tenant`. `by` is the identity performing the change.
    pub async fn grant_membership(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
        role: Role,
        by: Option<&ActorId>,
        ctx: &AccessContext,
    ) -> ClinicResult<MembershipChange> {
        let result = self.directory.grant(actor, tenant, role).await;
        let event = match &result {
            Ok(change) => {
                let action = if change.previous_role.is_some() {
                    AuditAction::Update
                } else {
                    AuditAction::Create
                };
                NewAuditEvent::new(action, entity::MEMBERSHIP, AuditOutcome::Success)
                    .entity_id(change.membership.id.to_string())
                    .description(format!("granted {role} to {actor}"))
            }
            Err(e) => NewAuditEvent::new(AuditAction::Update, entity::MEMBERSHIP, AuditOutcome::MajorFailure)
                .description(format!("grant of {role} to {actor} failed: {e}")),
        };
        self.audit_admin(event, tenant, by, ctx).await;
        result
    }

    /// Revoke `actor`'s membership in `tenant`. Returns `false` if none was active.
    pub async fn revoke_membership(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
        by: Option<&ActorId>,
        ctx: &AccessContext,
    ) -> ClinicResult<bool> {
        let result = self.directory.revoke(actor, tenant).await;
        let event = match &result {
            Ok(Some(revoked)) => {
                NewAuditEvent::new(AuditAction::Delete, entity::MEMBERSHIP, AuditOutcome::Success)
                    .entity_id(revoked.id.to_string())
                    .description(format!("revoked {} from {actor}", revoked.role))
            }
            Ok(None) => {
                NewAuditEvent::new(AuditAction::Delete, entity::MEMBERSHIP, AuditOutcome::MinorFailure)
                    .description(format!("no active membership for {actor}"))
            }
            Err(e) => {
                NewAuditEvent::new(AuditAction::Delete, entity::MEMBERSHIP, AuditOutcome::MajorFailure)
                    .description(format!("revoke for {actor} failed: {e}"))
            }
        };
        self.audit_admin(event, tenant, by, ctx).await;
        Ok(result?.is_some())
    }

    /// Gate a membership change requested by `by`.
    ///
    /// The caller needs `manage_users` in the tenant. Granting `super_admin`,
    /// or changing a membership that holds it, also needs the caller to be a
    /// super_admin. `role` is the role being granted, `None` for a revoke.
    pub async fn authorize_membership_change(
        &self,
        by: Option<&ActorId>,
        actor: &ActorId,
        tenant: &TenantId,
        role: Option<Role>,
        ctx: &AccessContext,
    ) -> ClinicResult<()> {
        let Some(by) = by else {
            let event = NewAuditEvent::new(AuditAction::Execute, entity::MEMBERSHIP, AuditOutcome::MinorFailure)
                .description(format!("membership change for {actor} without an acting identity"));
            self.audit_admin(event, tenant, None, ctx).await;
            return Err(ClinicError::AccessDenied(DenyReason::NoMembership));
        };
        self.evaluator
            .require(by, tenant, Capability::ManageUsers, ctx)
            .await?;

        let current = self.directory.membership(actor, tenant).await?.map(|m| m.role);
        let touches_super_admin =
            role == Some(Role::SuperAdmin) || current == Some(Role::SuperAdmin);
        if touches_super_admin
            && self.directory.resolve_role(by, tenant).await? != Some(Role::SuperAdmin)
        {
            warn!(actor = %actor, by = %by, tenant = %tenant, "super_admin change refused");
            let event = NewAuditEvent::new(AuditAction::Execute, entity::MEMBERSHIP, AuditOutcome::MinorFailure)
                .description(format!("super_admin change for {actor} refused"));
            self.audit_admin(event, tenant, Some(by), ctx).await;
            return Err(ClinicError::AccessDenied(DenyReason::NotGranted));
        }
        Ok(())
    }

    /// Seed `actor` as super_admin in `tenant`, mirroring the tenant if it is
    /// unknown. Returns `false` when the membership already exists.
    pub async fn bootstrap_super_admin(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
    ) -> ClinicResult<bool> {
        let ctx = AccessContext {
            source: Some("bootstrap".to_string()),
            ..AccessContext::default()
        };
        if self.tenant(tenant).await?.is_none() {
            self.upsert_tenant(Tenant::new(tenant.clone(), tenant.as_str()), None, &ctx)
                .await?;
        }
        let current = self.directory.membership(actor, tenant).await?.map(|m| m.role);
        if current == Some(Role::SuperAdmin) {
            return Ok(false);
        }
        self.grant_membership(actor, tenant, Role::SuperAdmin, None, &ctx)
            .await?;
        Ok(true)
    }

    // ─── Tenants ────────────────────────────────────────────────────────

    pub async fn tenant(&self, tenant: &TenantId) -> ClinicResult<Option<Tenant>> {
        bounded(self.timeout, self.tenants.get_tenant(tenant)).await
    }

    /// Mirror a tenant from its owning system.
    pub async fn upsert_tenant(
        &self,
        tenant: Tenant,
        by: Option<&ActorId>,
        ctx: &AccessContext,
    ) -> ClinicResult<()> {
        let id = tenant.id.clone();
        let active = tenant.active;
        let result = self.store_tenant(tenant).await;
        let event = match &result {
            Ok(action) => {
                info!(tenant = %id, "Tenant upserted");
                NewAuditEvent::new(*action, entity::TENANT, AuditOutcome::Success)
                    .description(format!("tenant {id} mirrored (active: {active})"))
            }
            Err(e) => NewAuditEvent::new(AuditAction::Update, entity::TENANT, AuditOutcome::MajorFailure)
                .description(format!("mirroring tenant {id} failed: {e}")),
        };
        self.audit_admin(event.entity_id(id.as_str()), &id, by, ctx).await;
        result.map(|_| ())
    }

    /// Flip the tenant's active flag. Returns `false` for an unknown tenant.
    pub async fn set_tenant_active(
        &self,
        tenant: &TenantId,
        active: bool,
        by: Option<&ActorId>,
        ctx: &AccessContext,
    ) -> ClinicResult<bool> {
        let change = if active { "activation" } else { "deactivation" };
        let result = self.store_tenant_active(tenant, active).await;
        let event = match &result {
            Ok(true) => {
                info!(tenant = %tenant, active, "Tenant active flag changed");
                NewAuditEvent::new(AuditAction::Update, entity::TENANT, AuditOutcome::Success)
                    .description(if active { "tenant activated" } else { "tenant deactivated" })
            }
            Ok(false) => NewAuditEvent::new(AuditAction::Update, entity::TENANT, AuditOutcome::MinorFailure)
                .description(format!("{change} of unknown tenant")),
            Err(e) => NewAuditEvent::new(AuditAction::Update, entity::TENANT, AuditOutcome::MajorFailure)
                .description(format!("{change} failed: {e}")),
        };
        self.audit_admin(event.entity_id(tenant.as_str()), tenant, by, ctx).await;
        result
    }

    async fn store_tenant(&self, tenant: Tenant) -> ClinicResult<AuditAction> {
        let action = match self.tenant(&tenant.id).await? {
            Some(_) => AuditAction::Update,
            None => AuditAction::Create,
        };
        bounded(self.timeout, self.tenants.put_tenant(tenant)).await?;
        Ok(action)
    }

    async fn store_tenant_active(&self, tenant: &TenantId, active: bool) -> ClinicResult<bool> {
        let Some(mut current) = self.tenant(tenant).await? else {
            return Ok(false);
        };
        current.active = active;
        current.updated_at = Utc::now();
        bounded(self.timeout, self.tenants.put_tenant(current)).await?;
        Ok(true)
    }

    // ─── Consent ────────────────────────────────────────────────────────

    pub async fn is_consent_valid(&self, tenant: &TenantId, patient: &PatientId) -> ClinicResult<bool> {
        self.consent.is_valid(tenant, patient).await
    }

    pub async fn submit_consent(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
        clauses: ConsentClauses,
        signature_ref: &str,
        ctx: &CaptureContext,
    ) -> ClinicResult<ConsentRecord> {
        self.consent
            .submit(tenant, patient, clauses, signature_ref, ctx)
            .await
    }

    pub async fn revoke_consent(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
        ctx: &CaptureContext,
    ) -> ClinicResult<bool> {
        self.consent.revoke(tenant, patient, ctx).await
    }

    pub async fn current_consent(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
    ) -> ClinicResult<Option<ConsentRecord>> {
        self.consent.current(tenant, patient).await
    }

    pub async fn consent_history(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
    ) -> ClinicResult<Vec<ConsentRecord>> {
        self.consent.history(tenant, patient).await
    }

    pub async fn marketing_allowed(&self, tenant: &TenantId, patient: &PatientId) -> ClinicResult<bool> {
        self.consent.marketing_allowed(tenant, patient).await
    }

    // ─── Audit ──────────────────────────────────────────────────────────

    /// Append an event on behalf of a collaborator.
    pub async fn record_audit(&self, event: NewAuditEvent) -> ClinicResult<Uuid> {
        self.ledger.record(event).await
    }

    pub fn query_audit(&self, filter: AuditFilter) -> AuditPager {
        self.ledger.query(filter)
    }

    pub async fn verify_audit_chain(&self) -> ClinicResult<ChainVerification> {
        self.ledger.verify_chain().await
    }

    pub async fn compliance_summary(
        &self,
        tenant: &TenantId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ClinicResult<ComplianceSummary> {
        self.ledger.summarize(tenant, from, to).await
    }

    pub fn ledger(&self) -> &Arc<AuditLedger> {
        &self.ledger
    }

    async fn audit_admin(
        &self,
        event: NewAuditEvent,
        tenant: &TenantId,
        by: Option<&ActorId>,
        ctx: &AccessContext,
    ) {
        let event = event
            .tenant(tenant)
            .actor(by, ctx.actor_label.as_deref())
            .source(ctx.source.as_deref())
            .client(ctx.ip_address.as_deref(), ctx.user_agent.as_deref());
        self.ledger.record_or_escalate(event).await;
    }
}
