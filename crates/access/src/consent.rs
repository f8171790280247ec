//! Consent ledger: multi-law consent bundles per (tenant, patient).
//!
//! A new bundle supersedes the active one through a single conditional write,
//! so readers always see exactly one active record once a patient has
//! consented. Every `submit` and `revoke` call leaves one audit event,
//! whatever its outcome.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clinic_core::error::{ClinicError, ClinicResult};
use clinic_core::types::{
    entity, AuditAction, AuditOutcome, CaptureContext, ConsentClauses, ConsentRecord,
    ConsentStatus, NewAuditEvent, PatientId, TenantId,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::AuditLedger;
use crate::store::{bounded, ConsentStore};

/// A conflicting supersede is retried this many times before surfacing.
const CONFLICT_RETRIES: u32 = 1;

pub struct ConsentLedger {
    store: Arc<dyn ConsentStore>,
    ledger: Arc<AuditLedger>,
    timeout: Duration,
    validity: Option<chrono::Duration>,
}

impl ConsentLedger {
    pub fn new(
        store: Arc<dyn ConsentStore>,
        ledger: Arc<AuditLedger>,
        timeout: Duration,
        validity_days: Option<u32>,
    ) -> Self {
        Self {
            store,
            ledger,
            timeout,
            validity: validity_days.map(|d| chrono::Duration::days(i64::from(d))),
        }
    }

    /// Capture a consent bundle, superseding the patient's active one.
    pub async fn submit(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
        clauses: ConsentClauses,
        signature_ref: &str,
        ctx: &CaptureContext,
    ) -> ClinicResult<ConsentRecord> {
        let missing = clauses.missing_mandatory();
        let missing_signature = signature_ref.trim().is_empty();
        if !missing.is_empty() || missing_signature {
            warn!(
                tenant = %tenant,
                patient = %patient,
                missing_clauses = ?missing,
                missing_signature,
                "Incomplete consent rejected"
            );
            self.audit(
                AuditAction::Create,
                tenant,
                patient,
                ctx,
                AuditOutcome::MinorFailure,
                format!("consent rejected: missing clauses {missing:?}, missing signature {missing_signature}"),
            )
            .await;
            return Err(ClinicError::IncompleteConsent {
                missing_clauses: missing.into_iter().map(String::from).collect(),
                missing_signature,
            });
        }

        let mut attempt = 0;
        loop {
            match self.try_supersede(tenant, patient, clauses, signature_ref, ctx).await {
                Ok((record, superseded)) => {
                    info!(
                        tenant = %tenant,
                        patient = %patient,
                        consent_id = %record.id,
                        superseded = ?superseded,
                        "Consent captured"
                    );
                    let description = match superseded {
                        Some(prior) => format!("consent {} captured, superseding {prior}", record.id),
                        None => format!("consent {} captured", record.id),
                    };
                    self.audit(
                        AuditAction::Create,
                        tenant,
                        patient,
                        ctx,
                        AuditOutcome::Success,
                        description,
                    )
                    .await;
                    return Ok(record);
                }
                Err(ClinicError::ConcurrentModification(_)) if attempt < CONFLICT_RETRIES => {
                    attempt += 1;
                    debug!(tenant = %tenant, patient = %patient, attempt, "Consent supersede conflicted, retrying");
                }
                Err(e) => {
                    let outcome = match e {
                        ClinicError::ConcurrentModification(_) => AuditOutcome::SeriousFailure,
                        _ => AuditOutcome::MajorFailure,
                    };
                    self.audit(
                        AuditAction::Create,
                        tenant,
                        patient,
                        ctx,
                        outcome,
                        format!("consent capture failed: {e}"),
                    )
                    .await;
                    return Err(e);
                }
            }
        }
    }

    async fn try_supersede(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
        clauses: ConsentClauses,
        signature_ref: &str,
        ctx: &CaptureContext,
    ) -> ClinicResult<(ConsentRecord, Option<Uuid>)> {
        let current = bounded(self.timeout, self.store.active_consent(tenant, patient)).await?;
        let now = Utc::now();
        let record = ConsentRecord {
            id: Uuid::new_v4(),
            tenant_id: tenant.clone(),
            patient_id: patient.clone(),
            status: ConsentStatus::Active,
            clauses,
            signature_ref: signature_ref.to_string(),
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
            created_at: now,
            expires_at: self.validity.map(|v| now + v),
            revoked_at: None,
            superseded_by: None,
        };
        let superseded = bounded(
            self.timeout,
            self.store
                .supersede_consent(record.clone(), current.map(|r| r.id)),
        )
        .await?;
        Ok((record, superseded.map(|r| r.id)))
    }

    /// The processing gate: an active, complete, signed, unexpired record exists.
    pub async fn is_valid(&self, tenant: &TenantId, patient: &PatientId) -> ClinicResult<bool> {
        let valid = self
            .current(tenant, patient)
            .await?
            .is_some_and(|r| r.is_valid_at(Utc::now()));
        debug!(tenant = %tenant, patient = %patient, valid, "Consent checked");
        Ok(valid)
    }

    /// Whether the patient may receive marketing communication.
    pub async fn marketing_allowed(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
    ) -> ClinicResult<bool> {
        Ok(self
            .current(tenant, patient)
            .await?
            .is_some_and(|r| r.is_valid_at(Utc::now()) && r.clauses.marketing))
    }

    /// Revoke the active record. Returns `false` when there was nothing to revoke.
    pub async fn revoke(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
        ctx: &CaptureContext,
    ) -> ClinicResult<bool> {
        let mut attempt = 0;
        loop {
            let result = async {
                let Some(current) = self.current(tenant, patient).await? else {
                    return Ok(None);
                };
                let revoked = bounded(
                    self.timeout,
                    self.store.revoke_consent(tenant, patient, current.id, Utc::now()),
                )
                .await?;
                Ok::<_, ClinicError>(Some(revoked))
            }
            .await;

            match result {
                Ok(Some(record)) => {
                    info!(tenant = %tenant, patient = %patient, consent_id = %record.id, "Consent revoked");
                    self.audit(
                        AuditAction::Update,
                        tenant,
                        patient,
                        ctx,
                        AuditOutcome::Success,
                        format!("consent {} revoked", record.id),
                    )
                    .await;
                    return Ok(true);
                }
                Ok(None) => {
                    self.audit(
                        AuditAction::Update,
                        tenant,
                        patient,
                        ctx,
                        AuditOutcome::MinorFailure,
                        "no active consent to revoke".to_string(),
                    )
                    .await;
                    return Ok(false);
                }
                Err(ClinicError::ConcurrentModification(_)) if attempt < CONFLICT_RETRIES => {
                    attempt += 1;
                }
                Err(e) => {
                    self.audit(
                        AuditAction::Update,
                        tenant,
                        patient,
                        ctx,
                        AuditOutcome::MajorFailure,
                        format!("consent revoke failed: {e}"),
                    )
                    .await;
                    return Err(e);
                }
            }
        }
    }

    pub async fn current(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
    ) -> ClinicResult<Option<ConsentRecord>> {
        bounded(self.timeout, self.store.active_consent(tenant, patient)).await
    }

    /// All records for the patient, newest first.
    pub async fn history(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
    ) -> ClinicResult<Vec<ConsentRecord>> {
        bounded(self.timeout, self.store.consent_history(tenant, patient)).await
    }

    async fn audit(
        &self,
        action: AuditAction,
        tenant: &TenantId,
        patient: &PatientId,
        ctx: &CaptureContext,
        outcome: AuditOutcome,
        description: String,
    ) {
        let event = NewAuditEvent::new(action, entity::CONSENT, outcome)
            .tenant(tenant)
            .entity_id(patient.as_str())
            .actor(ctx.actor_id.as_ref(), ctx.actor_label.as_deref())
            .description(description)
            .client(ctx.ip_address.as_deref(), ctx.user_agent.as_deref());
        self.ledger.record_or_escalate(event).await;
    }
}
