//! End-to-end behaviour of the access core over the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clinic_access::{AccessContext, AccessCore, AuditFilter, MemoryStore};
use clinic_core::config::AccessConfig;
use clinic_core::error::ClinicError;
use clinic_core::types::{
    entity, ActorId, AuditAction, AuditOutcome, CaptureContext, Capability, ConsentClauses,
    Decision, DenyReason, NewAuditEvent, PatientId, Role, Tenant, TenantId,
};

fn actor(id: &str) -> ActorId {
    ActorId::parse(id).unwrap()
}

fn tenant(id: &str) -> TenantId {
    TenantId::parse(id).unwrap()
}

async fn setup(tenants: &[&str]) -> (Arc<MemoryStore>, AccessCore) {
    let store = Arc::new(MemoryStore::new());
    let core = AccessCore::new(store.clone(), &AccessConfig::default(), Duration::from_secs(2));
    for id in tenants {
        core.upsert_tenant(Tenant::new(tenant(id), *id), None, &AccessContext::default())
            .await
            .unwrap();
    }
    (store, core)
}

async fn permission_events(core: &AccessCore) -> usize {
    core.query_audit(AuditFilter {
        entity_type: Some(entity::PERMISSION.to_string()),
        ..AuditFilter::default()
    })
    .collect()
    .await
    .unwrap()
    .len()
}

#[tokio::test]
async fn receptionist_scenario_then_tenant_deactivated() {
    let (_, core) = setup(&["clinic-1"]).await;
    let ctx = AccessContext::default();
    let a = actor("A");
    let c1 = tenant("clinic-1");
    core.grant_membership(&a, &c1, Role::Receptionist, None, &ctx)
        .await
        .unwrap();

    assert_eq!(
        core.check_permission(&a, &c1, Capability::ManagePatients, &ctx).await.unwrap(),
        Decision::Deny(DenyReason::NotGranted)
    );
    assert_eq!(
        core.check_permission(&a, &c1, Capability::ManageAppointments, &ctx).await.unwrap(),
        Decision::Allow
    );

    core.set_tenant_active(&c1, false, None, &ctx).await.unwrap();
    for cap in [Capability::ManagePatients, Capability::ManageAppointments] {
        assert_eq!(
            core.check_permission(&a, &c1, cap, &ctx).await.unwrap(),
            Decision::Deny(DenyReason::TenantInactive)
        );
    }
}

#[tokio::test]
async fn no_membership_denies_every_capability() {
    let (_, core) = setup(&["clinic-1", "clinic-2"]).await;
    let ctx = AccessContext::default();
    let a = actor("A");
    core.grant_membership(&a, &tenant("clinic-2"), Role::ClinicAdmin, None, &ctx)
        .await
        .unwrap();

    for cap in Capability::all() {
        assert_eq!(
            core.check_permission(&a, &tenant("clinic-1"), cap, &ctx).await.unwrap(),
            Decision::Deny(DenyReason::NoMembership)
        );
    }
}

#[tokio::test]
async fn role_rows_match_the_matrix() {
    let (_, core) = setup(&["clinic-1"]).await;
    let ctx = AccessContext::default();
    let c1 = tenant("clinic-1");
    let admin = actor("admin");
    let desk = actor("desk");
    core.grant_membership(&admin, &c1, Role::ClinicAdmin, None, &ctx).await.unwrap();
    core.grant_membership(&desk, &c1, Role::Receptionist, None, &ctx).await.unwrap();

    for cap in Capability::all() {
        assert!(core.check_permission(&admin, &c1, cap, &ctx).await.unwrap().is_allowed());
        let desk_allowed = core.check_permission(&desk, &c1, cap, &ctx).await.unwrap().is_allowed();
        assert_eq!(desk_allowed, cap == Capability::ManageAppointments);
    }
}

#[tokio::test]
async fn super_admin_everywhere_except_inactive_tenants() {
    let (_, core) = setup(&["clinic-1", "clinic-2", "clinic-3"]).await;
    let ctx = AccessContext::default();
    let root = actor("root");
    core.grant_membership(&root, &tenant("clinic-1"), Role::SuperAdmin, None, &ctx)
        .await
        .unwrap();
    core.set_tenant_active(&tenant("clinic-3"), false, None, &ctx)
        .await
        .unwrap();

    for cap in Capability::all() {
        assert!(core
            .check_permission(&root, &tenant("clinic-2"), cap, &ctx)
            .await
            .unwrap()
            .is_allowed());
        assert_eq!(
            core.check_permission(&root, &tenant("clinic-3"), cap, &ctx).await.unwrap(),
            Decision::Deny(DenyReason::TenantInactive)
        );
    }
    assert_eq!(
        core.check_permission(&root, &tenant("clinic-404"), Capability::ViewReports, &ctx)
            .await
            .unwrap(),
        Decision::Deny(DenyReason::UnknownTenant)
    );
}

#[tokio::test]
async fn require_carries_the_deny_reason() {
    let (_, core) = setup(&["clinic-1"]).await;
    let ctx = AccessContext::default();
    let err = core
        .require_permission(&actor("A"), &tenant("clinic-1"), Capability::ManageUsers, &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, ClinicError::AccessDenied(DenyReason::NoMembership)));
}

#[tokio::test]
async fn revoked_membership_takes_effect_immediately() {
    let (_, core) = setup(&["clinic-1"]).await;
    let ctx = AccessContext::default();
    let a = actor("A");
    let c1 = tenant("clinic-1");
    core.grant_membership(&a, &c1, Role::ClinicAgent, None, &ctx).await.unwrap();
    assert!(core
        .check_permission(&a, &c1, Capability::ViewReports, &ctx)
        .await
        .unwrap()
        .is_allowed());

    core.revoke_membership(&a, &c1, None, &ctx).await.unwrap();
    assert_eq!(
        core.check_permission(&a, &c1, Capability::ViewReports, &ctx).await.unwrap(),
        Decision::Deny(DenyReason::NoMembership)
    );
}

#[tokio::test]
async fn every_check_is_audited_once() {
    let (_, core) = setup(&["clinic-1"]).await;
    let ctx = AccessContext {
        actor_label: Some("Ana".into()),
        ip_address: Some("10.0.0.7".into()),
        user_agent: Some("clinic-web".into()),
        source: Some("/appointments".into()),
    };
    let a = actor("A");
    let c1 = tenant("clinic-1");
    core.grant_membership(&a, &c1, Role::Receptionist, None, &ctx).await.unwrap();

    let before = permission_events(&core).await;
    core.check_permission(&a, &c1, Capability::ManageAppointments, &ctx).await.unwrap();
    core.check_permission(&a, &c1, Capability::ManageClinic, &ctx).await.unwrap();
    let _ = core.require_permission(&a, &c1, Capability::ManageUsers, &ctx).await;
    assert_eq!(permission_events(&core).await, before + 3);

    let events = core
        .query_audit(AuditFilter {
            entity_type: Some(entity::PERMISSION.to_string()),
            limit: Some(3),
            ..AuditFilter::default()
        })
        .collect()
        .await
        .unwrap();
    let allowed = events.iter().filter(|e| e.outcome == AuditOutcome::Success).count();
    assert_eq!(allowed, 1);
    assert!(events.iter().all(|e| e.action == AuditAction::Execute));
    assert!(events.iter().all(|e| e.ip_address.as_deref() == Some("10.0.0.7")));
    assert!(events.iter().all(|e| e.actor_label.as_deref() == Some("Ana")));
}

#[tokio::test]
async fn unavailable_store_fails_check_and_escalates() {
    let store = Arc::new(MemoryStore::new());
    let core = AccessCore::new(store.clone(), &AccessConfig::default(), Duration::from_secs(2));
    let ctx = AccessContext::default();
    let c1 = tenant("clinic-1");
    core.upsert_tenant(Tenant::new(c1.clone(), "Clinic One"), None, &ctx)
        .await
        .unwrap();

    store.set_unavailable(true);
    let err = core
        .check_permission(&actor("A"), &c1, Capability::ViewReports, &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, ClinicError::StorageUnavailable(_)));
    assert!(core.ledger().consecutive_failures() >= 1);
}

#[tokio::test]
async fn consent_scenario() {
    let (_, core) = setup(&["C"]).await;
    let c = tenant("C");
    let p = PatientId::parse("P").unwrap();
    assert!(!core.is_consent_valid(&c, &p).await.unwrap());

    let clauses = ConsentClauses {
        law_21668: true,
        law_19628: true,
        law_20584: true,
        ..ConsentClauses::default()
    };
    core.submit_consent(&c, &p, clauses, "sig-bytes", &CaptureContext::default())
        .await
        .unwrap();
    assert!(core.is_consent_valid(&c, &p).await.unwrap());

    let creates = core
        .query_audit(AuditFilter {
            entity_type: Some(entity::CONSENT.to_string()),
            entity_id: Some("P".into()),
            action: Some(AuditAction::Create),
            ..AuditFilter::default()
        })
        .collect()
        .await
        .unwrap();
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].outcome, AuditOutcome::Success);
}

#[tokio::test]
async fn collaborator_events_and_summary() {
    let (_, core) = setup(&["clinic-1"]).await;
    let c1 = tenant("clinic-1");
    let start = Utc::now() - chrono::Duration::seconds(1);
    core.record_audit(
        NewAuditEvent::new(AuditAction::Read, "Patient", AuditOutcome::Success)
            .tenant(&c1)
            .entity_id("patient-9")
            .description("export"),
    )
    .await
    .unwrap();

    let summary = core
        .compliance_summary(&c1, start, Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert!(summary.total_events >= 1);
    assert_eq!(summary.events_by_action.get("read"), Some(&1));
    assert!(core.verify_audit_chain().await.unwrap().chain_intact);
}
