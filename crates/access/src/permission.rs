//! Permission evaluator over the static role/capability matrix.

use std::sync::Arc;
use std::time::Duration;

use clinic_core::error::{ClinicError, ClinicResult};
use clinic_core::types::{
    entity, ActorId, AuditAction, AuditOutcome, Capability, Decision, DenyReason, NewAuditEvent,
    Role, TenantId,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::audit::AuditLedger;
use crate::membership::MembershipDirectory;
use crate::store::{bounded, TenantStore};

/// Role rows are cumulative: each role holds every grant of the roles below it.
const MATRIX: [(Role, &[Capability]); 4] = [
    (Role::Receptionist, &[Capability::ManageAppointments]),
    (
        Role::ClinicAgent,
        &[
            Capability::ViewReports,
            Capability::ManageAppointments,
            Capability::ManagePatients,
        ],
    ),
    (
        Role::ClinicAdmin,
        &[
            Capability::ManageClinic,
            Capability::ViewReports,
            Capability::ManageAppointments,
            Capability::ManagePatients,
            Capability::ManageUsers,
        ],
    ),
    (
        Role::SuperAdmin,
        &[
            Capability::ManageClinic,
            Capability::ViewReports,
            Capability::ManageAppointments,
            Capability::ManagePatients,
            Capability::ManageUsers,
        ],
    ),
];

/// The single place role-implies-capability is decided.
pub fn is_granted(role: Role, capability: Capability) -> bool {
    MATRIX
        .iter()
        .find(|(r, _)| *r == role)
        .is_some_and(|(_, caps)| caps.contains(&capability))
}

/// Request metadata carried into the audit entry of a check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessContext {
    pub actor_label: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// Originating endpoint or query.
    pub source: Option<String>,
}

/// Evaluates `(actor, tenant, capability)` against current tenant and membership state.
///
/// Nothing is cached between calls, so a membership mutation is visible to
/// the very next check.
pub struct PermissionEvaluator {
    tenants: Arc<dyn TenantStore>,
    directory: Arc<MembershipDirectory>,
    ledger: Arc<AuditLedger>,
    audit_checks: bool,
    timeout: Duration,
}

impl PermissionEvaluator {
    pub fn new(
        tenants: Arc<dyn TenantStore>,
        directory: Arc<MembershipDirectory>,
        ledger: Arc<AuditLedger>,
        audit_checks: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            tenants,
            directory,
            ledger,
            audit_checks,
            timeout,
        }
    }

    /// Decide, count and (when enabled) audit one check.
    pub async fn check(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
        capability: Capability,
        ctx: &AccessContext,
    ) -> ClinicResult<Decision> {
        let decision = match self.effective_role(actor, tenant).await {
            Ok(Ok(role)) if role == Role::SuperAdmin || is_granted(role, capability) => {
                Decision::Allow
            }
            Ok(Ok(_)) => Decision::Deny(DenyReason::NotGranted),
            Ok(Err(reason)) => Decision::Deny(reason),
            Err(e) => {
                self.audit(actor, tenant, capability, ctx, AuditOutcome::MajorFailure, &e.to_string())
                    .await;
                return Err(e);
            }
        };

        match decision {
            Decision::Allow => {
                metrics::counter!("access.check.allow").increment(1);
                debug!(actor = %actor, tenant = %tenant, capability = capability.as_str(), "Access allowed");
                self.audit(actor, tenant, capability, ctx, AuditOutcome::Success, "allowed")
                    .await;
            }
            Decision::Deny(reason) => {
                metrics::counter!("access.check.deny").increment(1);
                warn!(
                    actor = %actor,
                    tenant = %tenant,
                    capability = capability.as_str(),
                    reason = reason.as_str(),
                    "Access denied"
                );
                self.audit(
                    actor,
                    tenant,
                    capability,
                    ctx,
                    AuditOutcome::MinorFailure,
                    &format!("denied: {reason}"),
                )
                .await;
            }
        }
        Ok(decision)
    }

    /// Fail-fast form of `check`.
    pub async fn require(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
        capability: Capability,
        ctx: &AccessContext,
    ) -> ClinicResult<()> {
        match self.check(actor, tenant, capability, ctx).await? {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => Err(ClinicError::AccessDenied(reason)),
        }
    }

    /// Every capability the actor currently holds in `tenant`. Not audited.
    pub async fn capabilities(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
    ) -> ClinicResult<Vec<Capability>> {
        Ok(match self.effective_role(actor, tenant).await? {
            Ok(role) => Capability::all()
                .into_iter()
                .filter(|c| role == Role::SuperAdmin || is_granted(role, *c))
                .collect(),
            Err(_) => Vec::new(),
        })
    }

    /// Tenant gate, then role resolution. The tenant gate stops every role.
    async fn effective_role(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
    ) -> ClinicResult<Result<Role, DenyReason>> {
        match bounded(self.timeout, self.tenants.get_tenant(tenant)).await? {
            None => return Ok(Err(DenyReason::UnknownTenant)),
            Some(t) if !t.active => return Ok(Err(DenyReason::TenantInactive)),
            Some(_) => {}
        }
        Ok(self
            .directory
            .resolve_role(actor, tenant)
            .await?
            .ok_or(DenyReason::NoMembership))
    }

    async fn audit(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
        capability: Capability,
        ctx: &AccessContext,
        outcome: AuditOutcome,
        description: &str,
    ) {
        if !self.audit_checks {
            return;
        }
        let event = NewAuditEvent::new(AuditAction::Execute, entity::PERMISSION, outcome)
            .tenant(tenant)
            .entity_id(capability.as_str())
            .actor(Some(actor), ctx.actor_label.as_deref())
            .description(format!("permission {capability} {description}"))
            .source(ctx.source.as_deref())
            .client(ctx.ip_address.as_deref(), ctx.user_agent.as_deref());
        self.ledger.record_or_escalate(event).await;
    }
}
