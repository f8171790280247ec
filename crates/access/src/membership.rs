//! Membership directory: which tenants an actor belongs to, and with which role.

use std::sync::Arc;
use std::time::Duration;

use clinic_core::error::ClinicResult;
use clinic_core::types::{ActorId, Membership, Role, TenantId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::store::{bounded, MembershipChange, MembershipStore};

/// One entry of an actor's tenant switcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRole {
    pub tenant_id: TenantId,
    pub role: Role,
}

/// Read side of the membership model plus its two mutations.
///
/// A non-revoked `super_admin` row in any tenant makes the actor
/// `super_admin` in every tenant.
pub struct MembershipDirectory {
    store: Arc<dyn MembershipStore>,
    timeout: Duration,
}

impl MembershipDirectory {
    pub fn new(store: Arc<dyn MembershipStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// The actor's effective role in `tenant`, or `None` for no access.
    pub async fn resolve_role(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
    ) -> ClinicResult<Option<Role>> {
        if bounded(self.timeout, self.store.holds_super_admin(actor)).await? {
            return Ok(Some(Role::SuperAdmin));
        }
        let role = bounded(self.timeout, self.store.find_membership(actor, tenant))
            .await?
            .map(|m| m.role);
        debug!(actor = %actor, tenant = %tenant, role = ?role, "Role resolved");
        Ok(role)
    }

    /// Tenants the actor belongs to, in membership insertion order.
    pub async fn list_tenants(&self, actor: &ActorId) -> ClinicResult<Vec<TenantRole>> {
        let rows = bounded(self.timeout, self.store.memberships_for_actor(actor)).await?;
        Ok(rows
            .into_iter()
            .map(|m| TenantRole {
                tenant_id: m.tenant_id,
                role: m.role,
            })
            .collect())
    }

    /// True iff a non-revoked membership exists for exactly this pair.
    pub async fn has_any_access(&self, actor: &ActorId, tenant: &TenantId) -> ClinicResult<bool> {
        Ok(bounded(self.timeout, self.store.find_membership(actor, tenant))
            .await?
            .is_some())
    }

    /// The membership row itself, if active.
    pub async fn membership(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
    ) -> ClinicResult<Option<Membership>> {
        bounded(self.timeout, self.store.find_membership(actor, tenant)).await
    }

    /// Grant `role`, updating the existing row if there is one.
    pub async fn grant(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
        role: Role,
    ) -> ClinicResult<MembershipChange> {
        let change = bounded(self.timeout, self.store.upsert_membership(actor, tenant, role)).await?;
        info!(
            actor = %actor,
            tenant = %tenant,
            role = role.as_str(),
            previous_role = ?change.previous_role,
            "Membership granted"
        );
        Ok(change)
    }

    /// Soft-delete the membership. Returns `None` if nothing was active.
    pub async fn revoke(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
    ) -> ClinicResult<Option<Membership>> {
        let revoked = bounded(self.timeout, self.store.revoke_membership(actor, tenant)).await?;
        if revoked.is_some() {
            info!(actor = %actor, tenant = %tenant, "Membership revoked");
        }
        Ok(revoked)
    }
}
