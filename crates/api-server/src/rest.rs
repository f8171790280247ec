//! REST handlers for the access core and operational endpoints.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use clinic_access::store::MembershipChange;
use clinic_access::{
    AccessContext, AccessCore, AuditFilter, ChainVerification, ComplianceSummary, TenantRole,
};
use clinic_core::error::ClinicError;
use clinic_core::types::{
    ActorId, AuditAction, AuditEvent, AuditOutcome, CaptureContext, Capability, ConsentClauses,
    NewAuditEvent, PatientId, Role, TenantId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};
use uuid::Uuid;

/// Hard cap on events returned by one audit query.
const MAX_AUDIT_RESULTS: usize = 1000;

/// Default number of events returned when the query gives no limit.
const DEFAULT_AUDIT_RESULTS: usize = 100;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<AccessCore>,
    pub node_id: String,
    pub start_time: Instant,
}

// ─── Errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// A core error on its way to the wire.
#[derive(Debug)]
pub struct ApiError(pub ClinicError);

impl From<ClinicError> for ApiError {
    fn from(err: ClinicError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self.0 {
            ClinicError::InvalidArgument(msg) => (StatusCode::BAD_REQUEST, "invalid_argument", msg.clone()),
            // Never say which capability or role was involved.
            ClinicError::AccessDenied(_) => (
                StatusCode::FORBIDDEN,
                "not_authorized",
                "Not authorized".to_string(),
            ),
            ClinicError::IncompleteConsent { .. } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "consent_incomplete",
                self.0.to_string(),
            ),
            ClinicError::ConcurrentModification(_) => (
                StatusCode::CONFLICT,
                "concurrent_modification",
                "The record was modified concurrently; retry".to_string(),
            ),
            ClinicError::StorageUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                "Storage temporarily unavailable".to_string(),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal processing error".to_string(),
            ),
        };
        if status.is_server_error() {
            error!(error = %self.0, status = status.as_u16(), "Request failed");
            metrics::counter!("api.errors").increment(1);
        } else {
            metrics::counter!("api.rejections", "code" => code).increment(1);
        }
        (
            status,
            Json(ErrorResponse {
                error: code.to_string(),
                message,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: "not_found".to_string(),
            message: message.to_string(),
        }),
    )
        .into_response()
}

// ─── Request context ────────────────────────────────────────────────────

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// First hop of `x-forwarded-for`.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    header(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string()))
        .filter(|ip| !ip.is_empty())
}

fn access_context(headers: &HeaderMap, source: &str) -> AccessContext {
    AccessContext {
        actor_label: header(headers, "x-actor-label"),
        ip_address: client_ip(headers),
        user_agent: header(headers, "user-agent"),
        source: Some(source.to_string()),
    }
}

/// The identity performing an administrative call, from `x-actor-id`.
fn acting_actor(headers: &HeaderMap) -> ApiResult<Option<ActorId>> {
    header(headers, "x-actor-id")
        .map(ActorId::parse)
        .transpose()
        .map_err(ApiError::from)
}

fn capture_context(headers: &HeaderMap) -> ApiResult<CaptureContext> {
    Ok(CaptureContext {
        ip_address: client_ip(headers),
        user_agent: header(headers, "user-agent"),
        actor_id: acting_actor(headers)?,
        actor_label: header(headers, "x-actor-label"),
    })
}

// ─── Permissions ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PermissionRequest {
    pub actor_id: String,
    pub tenant_id: String,
    pub capability: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub allowed: bool,
}

fn parse_permission(req: &PermissionRequest) -> ApiResult<(ActorId, TenantId, Capability)> {
    Ok((
        ActorId::parse(req.actor_id.as_str())?,
        TenantId::parse(req.tenant_id.as_str())?,
        req.capability.parse::<Capability>()?,
    ))
}

/// POST /v1/permissions/check
pub async fn check_permission(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PermissionRequest>,
) -> ApiResult<Json<PermissionResponse>> {
    let (actor, tenant, capability) = parse_permission(&request)?;
    let ctx = access_context(&headers, "/v1/permissions/check");
    let decision = state.core.check_permission(&actor, &tenant, capability, &ctx).await?;
    Ok(Json(PermissionResponse {
        allowed: decision.is_allowed(),
    }))
}

/// POST /v1/permissions/require: 204 when allowed, generic 403 otherwise.
pub async fn require_permission(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PermissionRequest>,
) -> ApiResult<StatusCode> {
    let (actor, tenant, capability) = parse_permission(&request)?;
    let ctx = access_context(&headers, "/v1/permissions/require");
    state
        .core
        .require_permission(&actor, &tenant, capability, &ctx)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ─── Memberships ────────────────────────────────────────────────────────

/// GET /v1/actors/:actor/tenants: tenant switcher.
pub async fn list_tenants(
    State(state): State<AppState>,
    Path(actor): Path<String>,
) -> ApiResult<Json<Vec<TenantRole>>> {
    let actor = ActorId::parse(actor)?;
    Ok(Json(state.core.list_tenants(&actor).await?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoleBody {
    pub role: Role,
}

/// GET /v1/tenants/:tenant/members/:actor
pub async fn get_member(
    State(state): State<AppState>,
    Path((tenant, actor)): Path<(String, String)>,
) -> ApiResult<Response> {
    let tenant = TenantId::parse(tenant)?;
    let actor = ActorId::parse(actor)?;
    Ok(match state.core.resolve_role(&actor, &tenant).await? {
        Some(role) => Json(RoleBody { role }).into_response(),
        None => not_found("no membership"),
    })
}

#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub role: String,
}

/// PUT /v1/tenants/:tenant/members/:actor: grant or change a role.
///
/// The `x-actor-id` caller needs `manage_users` in the tenant.
pub async fn put_member(
    State(state): State<AppState>,
    Path((tenant, actor)): Path<(String, String)>,
    headers: HeaderMap,
    Json(request): Json<GrantRequest>,
) -> ApiResult<Json<MembershipChange>> {
    let tenant = TenantId::parse(tenant)?;
    let actor = ActorId::parse(actor)?;
    let role = request.role.parse::<Role>()?;
    let by = acting_actor(&headers)?;
    let ctx = access_context(&headers, "/v1/tenants/members");
    state
        .core
        .authorize_membership_change(by.as_ref(), &actor, &tenant, Some(role), &ctx)
        .await?;
    let change = state
        .core
        .grant_membership(&actor, &tenant, role, by.as_ref(), &ctx)
        .await?;
    Ok(Json(change))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RevokedResponse {
    pub revoked: bool,
}

/// DELETE /v1/tenants/:tenant/members/:actor
pub async fn delete_member(
    State(state): State<AppState>,
    Path((tenant, actor)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<RevokedResponse>> {
    let tenant = TenantId::parse(tenant)?;
    let actor = ActorId::parse(actor)?;
    let by = acting_actor(&headers)?;
    let ctx = access_context(&headers, "/v1/tenants/members");
    state
        .core
        .authorize_membership_change(by.as_ref(), &actor, &tenant, None, &ctx)
        .await?;
    let revoked = state
        .core
        .revoke_membership(&actor, &tenant, by.as_ref(), &ctx)
        .await?;
    Ok(Json(RevokedResponse { revoked }))
}

// ─── Consent ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ConsentState {
    pub valid: bool,
    /// `"valid"` or `"consent_required"`, so a UI can route to capture.
    pub state: String,
    pub marketing_allowed: bool,
}

fn consent_ids(tenant: String, patient: String) -> ApiResult<(TenantId, PatientId)> {
    Ok((TenantId::parse(tenant)?, PatientId::parse(patient)?))
}

/// GET /v1/tenants/:tenant/patients/:patient/consent
pub async fn get_consent(
    State(state): State<AppState>,
    Path((tenant, patient)): Path<(String, String)>,
) -> ApiResult<Json<ConsentState>> {
    let (tenant, patient) = consent_ids(tenant, patient)?;
    let valid = state.core.is_consent_valid(&tenant, &patient).await?;
    let marketing_allowed = valid && state.core.marketing_allowed(&tenant, &patient).await?;
    Ok(Json(ConsentState {
        valid,
        state: if valid { "valid" } else { "consent_required" }.to_string(),
        marketing_allowed,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ConsentSubmission {
    #[serde(default)]
    pub clauses: ConsentClauses,
    #[serde(default)]
    pub signature_ref: String,
}

/// POST /v1/tenants/:tenant/patients/:patient/consent
pub async fn submit_consent(
    State(state): State<AppState>,
    Path((tenant, patient)): Path<(String, String)>,
    headers: HeaderMap,
    Json(submission): Json<ConsentSubmission>,
) -> ApiResult<Response> {
    let (tenant, patient) = consent_ids(tenant, patient)?;
    let ctx = capture_context(&headers)?;
    let record = state
        .core
        .submit_consent(&tenant, &patient, submission.clauses, &submission.signature_ref, &ctx)
        .await?;
    metrics::counter!("api.consent.captured").increment(1);
    Ok((StatusCode::CREATED, Json(record)).into_response())
}

/// DELETE /v1/tenants/:tenant/patients/:patient/consent
pub async fn revoke_consent(
    State(state): State<AppState>,
    Path((tenant, patient)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<RevokedResponse>> {
    let (tenant, patient) = consent_ids(tenant, patient)?;
    let ctx = capture_context(&headers)?;
    let revoked = state.core.revoke_consent(&tenant, &patient, &ctx).await?;
    Ok(Json(RevokedResponse { revoked }))
}

// ─── Audit ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AuditEventRequest {
    pub tenant_id: String,
    pub action: AuditAction,
    pub entity_type: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub actor_label: Option<String>,
    pub outcome: AuditOutcome,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordedResponse {
    pub id: Uuid,
}

/// POST /v1/audit: append an event on behalf of a collaborator.
pub async fn record_audit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AuditEventRequest>,
) -> ApiResult<Response> {
    let tenant = TenantId::parse(request.tenant_id)?;
    let actor = request.actor_id.map(ActorId::parse).transpose()?;
    if request.entity_type.trim().is_empty() {
        return Err(ClinicError::InvalidArgument("entity_type must not be empty".into()).into());
    }
    let mut event = NewAuditEvent::new(request.action, request.entity_type, request.outcome)
        .tenant(&tenant)
        .actor(actor.as_ref(), request.actor_label.as_deref())
        .description(request.description)
        .source(request.source.as_deref())
        .client(
            client_ip(&headers).as_deref(),
            header(&headers, "user-agent").as_deref(),
        );
    event.entity_id = request.entity_id;
    let id = state.core.record_audit(event).await?;
    Ok((StatusCode::CREATED, Json(RecordedResponse { id })).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    pub tenant_id: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub actor_id: Option<String>,
    pub action: Option<AuditAction>,
    pub outcome: Option<AuditOutcome>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// GET /v1/audit: newest first, scoped to one tenant.
pub async fn query_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Vec<AuditEvent>>> {
    let tenant = TenantId::parse(query.tenant_id)?;
    let actor = query.actor_id.map(ActorId::parse).transpose()?;
    if let (Some(from), Some(to)) = (query.from, query.to) {
        if from > to {
            warn!(%from, %to, "Audit query with inverted range");
            return Err(ClinicError::InvalidArgument("from must not be after to".into()).into());
        }
    }
    let filter = AuditFilter {
        tenant_id: Some(tenant),
        entity_type: query.entity_type,
        entity_id: query.entity_id,
        actor_id: actor,
        action: query.action,
        outcome: query.outcome,
        from: query.from,
        to: query.to,
        limit: Some(
            query
                .limit
                .unwrap_or(DEFAULT_AUDIT_RESULTS)
                .clamp(1, MAX_AUDIT_RESULTS),
        ),
    };
    let events = state.core.query_audit(filter).collect().await?;
    Ok(Json(events))
}

/// GET /v1/audit/verify: re-check the hash chain.
pub async fn verify_audit(State(state): State<AppState>) -> ApiResult<Json<ChainVerification>> {
    let verification = state.core.verify_audit_chain().await?;
    if !verification.chain_intact {
        error!(
            tampered = ?verification.tampered_sequences,
            "Audit chain verification failed"
        );
    }
    Ok(Json(verification))
}

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    pub tenant_id: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// GET /v1/audit/summary: compliance summary for one tenant.
pub async fn audit_summary(
    State(state): State<AppState>,
    Query(query): Query<SummaryQuery>,
) -> ApiResult<Json<ComplianceSummary>> {
    let tenant = TenantId::parse(query.tenant_id)?;
    let summary = state
        .core
        .compliance_summary(&tenant, query.from, query.to)
        .await?;
    Ok(Json(summary))
}

// ─── Operational ────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub audit_write_failures: u64,
}

/// GET /health: reports `degraded` while audit writes are failing.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let failures = state.core.ledger().consecutive_failures();
    Json(HealthResponse {
        status: if failures == 0 { "healthy" } else { "degraded" }.to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        audit_write_failures: failures,
    })
}

/// GET /live: Liveness probe for Kubernetes.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::HeaderValue;
    use clinic_access::MemoryStore;
    use clinic_core::config::AccessConfig;
    use clinic_core::types::Tenant;
    use std::time::Duration;

    async fn state() -> AppState {
        let store = Arc::new(MemoryStore::new());
        let core = AccessCore::new(store, &AccessConfig::default(), Duration::from_secs(1));
        core.upsert_tenant(
            Tenant::new(TenantId::parse("clinic-1").unwrap(), "Clinic One"),
            None,
            &AccessContext::default(),
        )
        .await
        .unwrap();
        core.bootstrap_super_admin(
            &ActorId::parse("root").unwrap(),
            &TenantId::parse("clinic-1").unwrap(),
        )
        .await
        .unwrap();
        AppState {
            core: Arc::new(core),
            node_id: "test-node".to_string(),
            start_time: Instant::now(),
        }
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn acting_as(actor: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-actor-id", HeaderValue::from_static(actor));
        headers
    }

    fn grant(role: &str) -> Json<GrantRequest> {
        Json(GrantRequest {
            role: role.to_string(),
        })
    }

    fn member(actor: &str) -> Path<(String, String)> {
        Path(("clinic-1".to_string(), actor.to_string()))
    }

    fn permission(actor: &str, capability: &str) -> Json<PermissionRequest> {
        Json(PermissionRequest {
            actor_id: actor.to_string(),
            tenant_id: "clinic-1".to_string(),
            capability: capability.to_string(),
        })
    }

    #[tokio::test]
    async fn test_denied_require_is_generic_403() {
        let state = state().await;
        let err = require_permission(State(state), HeaderMap::new(), permission("actor-a", "manage_users"))
            .await
            .unwrap_err();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body: ErrorResponse = body_json(response).await;
        assert_eq!(body.error, "not_authorized");
        assert!(!body.message.contains("manage_users"));
    }

    #[tokio::test]
    async fn test_malformed_id_is_400() {
        let state = state().await;
        let err = check_permission(State(state), HeaderMap::new(), permission("bad actor", "view_reports"))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_grant_then_check() {
        let state = state().await;
        put_member(
            State(state.clone()),
            member("actor-a"),
            acting_as("root"),
            grant("clinic_agent"),
        )
        .await
        .unwrap();

        let Json(allowed) = check_permission(
            State(state.clone()),
            HeaderMap::new(),
            permission("actor-a", "manage_patients"),
        )
        .await
        .unwrap();
        assert!(allowed.allowed);

        let Json(denied) = check_permission(State(state), HeaderMap::new(), permission("actor-a", "manage_clinic"))
            .await
            .unwrap();
        assert!(!denied.allowed);
    }

    #[tokio::test]
    async fn test_membership_routes_require_manage_users() {
        let state = state().await;
        put_member(State(state.clone()), member("clerk"), acting_as("root"), grant("receptionist"))
            .await
            .unwrap();
        put_member(State(state.clone()), member("admin"), acting_as("root"), grant("clinic_admin"))
            .await
            .unwrap();

        let anonymous = put_member(State(state.clone()), member("actor-a"), HeaderMap::new(), grant("clinic_agent"))
            .await
            .unwrap_err();
        assert_eq!(anonymous.into_response().status(), StatusCode::FORBIDDEN);

        let by_clerk = put_member(State(state.clone()), member("actor-a"), acting_as("clerk"), grant("clinic_agent"))
            .await
            .unwrap_err();
        assert_eq!(by_clerk.into_response().status(), StatusCode::FORBIDDEN);

        let escalation = put_member(State(state.clone()), member("actor-a"), acting_as("admin"), grant("super_admin"))
            .await
            .unwrap_err();
        let response = escalation.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body: ErrorResponse = body_json(response).await;
        assert_eq!(body.error, "not_authorized");

        let removal = delete_member(State(state.clone()), member("root"), acting_as("admin"))
            .await
            .unwrap_err();
        assert_eq!(removal.into_response().status(), StatusCode::FORBIDDEN);

        let actor = ActorId::parse("actor-a").unwrap();
        let tenant = TenantId::parse("clinic-1").unwrap();
        assert_eq!(state.core.resolve_role(&actor, &tenant).await.unwrap(), None);

        put_member(State(state.clone()), member("actor-a"), acting_as("admin"), grant("clinic_agent"))
            .await
            .unwrap();
        let Json(revoked) = delete_member(State(state.clone()), member("actor-a"), acting_as("admin"))
            .await
            .unwrap();
        assert!(revoked.revoked);
    }

    #[tokio::test]
    async fn test_consent_flow_over_http() {
        let state = state().await;
        let path = || Path(("clinic-1".to_string(), "patient-1".to_string()));

        let Json(before) = get_consent(State(state.clone()), path()).await.unwrap();
        assert!(!before.valid);
        assert_eq!(before.state, "consent_required");

        let incomplete = submit_consent(
            State(state.clone()),
            path(),
            HeaderMap::new(),
            Json(ConsentSubmission {
                clauses: ConsentClauses {
                    law_21668: true,
                    ..ConsentClauses::default()
                },
                signature_ref: "sig".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(
            incomplete.into_response().status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        headers.insert("user-agent", HeaderValue::from_static("kiosk/1.0"));
        let created = submit_consent(
            State(state.clone()),
            path(),
            headers,
            Json(ConsentSubmission {
                clauses: ConsentClauses::mandatory(),
                signature_ref: "sig-bytes".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let record: clinic_core::types::ConsentRecord = body_json(created).await;
        assert_eq!(record.ip_address.as_deref(), Some("203.0.113.9"));

        let Json(after) = get_consent(State(state.clone()), path()).await.unwrap();
        assert!(after.valid);
        assert!(!after.marketing_allowed);

        let Json(revoked) = revoke_consent(State(state), path(), HeaderMap::new()).await.unwrap();
        assert!(revoked.revoked);
    }

    #[tokio::test]
    async fn test_audit_query_is_tenant_scoped() {
        let state = state().await;
        for tenant in ["clinic-1", "clinic-2"] {
            record_audit(
                State(state.clone()),
                HeaderMap::new(),
                Json(AuditEventRequest {
                    tenant_id: tenant.to_string(),
                    action: AuditAction::Read,
                    entity_type: "Patient".to_string(),
                    entity_id: Some("patient-1".to_string()),
                    actor_id: Some("actor-a".to_string()),
                    actor_label: None,
                    outcome: AuditOutcome::Success,
                    description: "chart opened".to_string(),
                    source: Some("/patients/patient-1".to_string()),
                }),
            )
            .await
            .unwrap();
        }

        let Json(events) = query_audit(
            State(state.clone()),
            Query(AuditQuery {
                tenant_id: "clinic-2".to_string(),
                ..AuditQuery::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].entity_id.as_deref(), Some("patient-1"));

        let Json(verification) = verify_audit(State(state)).await.unwrap();
        assert!(verification.chain_intact);
    }

    #[tokio::test]
    async fn test_health_reports_degraded_audit() {
        let store = Arc::new(MemoryStore::new());
        let core = Arc::new(AccessCore::new(store.clone(), &AccessConfig::default(), Duration::from_secs(1)));
        let state = AppState {
            core,
            node_id: "n".to_string(),
            start_time: Instant::now(),
        };
        let Json(healthy) = health_check(State(state.clone())).await;
        assert_eq!(healthy.status, "healthy");

        store.set_unavailable(true);
        let _ = state
            .core
            .record_audit(NewAuditEvent::new(AuditAction::Read, "Patient", AuditOutcome::Success))
            .await;
        let Json(degraded) = health_check(State(state)).await;
        assert_eq!(degraded.status, "degraded");
    }
}
