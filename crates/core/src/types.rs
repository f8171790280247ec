use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{ClinicError, ClinicResult};

/// Longest accepted opaque identifier, in bytes.
pub const MAX_ID_LEN: usize = 128;

fn validate_id(kind: &str, raw: &str) -> ClinicResult<()> {
    if raw.is_empty() {
        return Err(ClinicError::InvalidArgument(format!("{kind} must not be empty")));
    }
    if raw.len() > MAX_ID_LEN {
        return Err(ClinicError::InvalidArgument(format!(
            "{kind} exceeds {MAX_ID_LEN} bytes"
        )));
    }
    let ok = raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '@' | '+' | '-'));
    if !ok {
        return Err(ClinicError::InvalidArgument(format!(
            "{kind} contains unsupported characters"
        )));
    }
    Ok(())
}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap a raw identifier.
            pub fn parse(raw: impl Into<String>) -> ClinicResult<Self> {
                let raw = raw.into();
                validate_id($label, &raw)?;
                Ok(Self(raw))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ClinicError;

            fn try_from(raw: String) -> Result<Self, Self::Error> {
                Self::parse(raw)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl FromStr for $name {
            type Err = ClinicError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

opaque_id!(
    /// Identity verified by the external identity provider.
    ActorId,
    "actor id"
);
opaque_id!(
    /// A clinic account.
    TenantId,
    "tenant id"
);
opaque_id!(PatientId, "patient id");

// ─── Roles & capabilities ──────────────────────────────────────────────

/// Role held by an actor within one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Receptionist,
    ClinicAgent,
    ClinicAdmin,
    SuperAdmin,
}

impl Role {
    pub fn all() -> [Role; 4] {
        [
            Role::Receptionist,
            Role::ClinicAgent,
            Role::ClinicAdmin,
            Role::SuperAdmin,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Receptionist => "receptionist",
            Role::ClinicAgent => "clinic_agent",
            Role::ClinicAdmin => "clinic_admin",
            Role::SuperAdmin => "super_admin",
        }
    }

    /// Position in the role ladder, lowest first.
    pub fn rank(&self) -> u8 {
        match self {
            Role::Receptionist => 0,
            Role::ClinicAgent => 1,
            Role::ClinicAdmin => 2,
            Role::SuperAdmin => 3,
        }
    }

    pub fn at_least(&self, other: Role) -> bool {
        self.rank() >= other.rank()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ClinicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::all()
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| ClinicError::InvalidArgument(format!("unknown role: {s}")))
    }
}

/// Named permission unit. Closed at compile time so the matrix stays auditable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ManageClinic,
    ViewReports,
    ManageAppointments,
    ManagePatients,
    ManageUsers,
}

impl Capability {
    pub fn all() -> [Capability; 5] {
        [
            Capability::ManageClinic,
            Capability::ViewReports,
            Capability::ManageAppointments,
            Capability::ManagePatients,
            Capability::ManageUsers,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ManageClinic => "manage_clinic",
            Capability::ViewReports => "view_reports",
            Capability::ManageAppointments => "manage_appointments",
            Capability::ManagePatients => "manage_patients",
            Capability::ManageUsers => "manage_users",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = ClinicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::all()
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ClinicError::InvalidArgument(format!("unknown capability: {s}")))
    }
}

// ─── Tenants & memberships ─────────────────────────────────────────────

/// A clinic as mirrored from the tenant owner. Only `id` and `active` drive decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(id: TenantId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Ties one actor to one tenant with exactly one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub id: Uuid,
    pub actor_id: ActorId,
    pub tenant_id: TenantId,
    pub role: Role,
    /// Store-assigned insertion position; stable across role changes.
    pub position: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker. Revoked rows are kept for history.
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Membership {
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }
}

// ─── Permission decisions ──────────────────────────────────────────────

/// Why a permission check was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DenyReason {
    NoMembership,
    TenantInactive,
    UnknownTenant,
    /// The role exists but the matrix does not grant the capability.
    NotGranted,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::NoMembership => "no-membership",
            DenyReason::TenantInactive => "tenant-inactive",
            DenyReason::UnknownTenant => "unknown-tenant",
            DenyReason::NotGranted => "not-granted",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a permission check. A denial is data, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

// ─── Audit ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Read,
    Update,
    Delete,
    Execute,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Read => "read",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
            AuditAction::Execute => "execute",
        }
    }
}

impl FromStr for AuditAction {
    type Err = ClinicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(AuditAction::Create),
            "read" => Ok(AuditAction::Read),
            "update" => Ok(AuditAction::Update),
            "delete" => Ok(AuditAction::Delete),
            "execute" => Ok(AuditAction::Execute),
            other => Err(ClinicError::InvalidArgument(format!(
                "unknown audit action: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditOutcome {
    Success,
    MinorFailure,
    SeriousFailure,
    MajorFailure,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::MinorFailure => "minor-failure",
            AuditOutcome::SeriousFailure => "serious-failure",
            AuditOutcome::MajorFailure => "major-failure",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, AuditOutcome::Success)
    }
}

impl FromStr for AuditOutcome {
    type Err = ClinicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(AuditOutcome::Success),
            "minor-failure" => Ok(AuditOutcome::MinorFailure),
            "serious-failure" => Ok(AuditOutcome::SeriousFailure),
            "major-failure" => Ok(AuditOutcome::MajorFailure),
            other => Err(ClinicError::InvalidArgument(format!(
                "unknown audit outcome: {other}"
            ))),
        }
    }
}

/// Entity types the core itself audits. Collaborators may use any other label.
pub mod entity {
    pub const CONSENT: &str = "Consent";
    pub const MEMBERSHIP: &str = "Membership";
    pub const PERMISSION: &str = "Permission";
    pub const TENANT: &str = "Tenant";
}

/// Audit event as submitted by a caller, before the ledger seals it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAuditEvent {
    pub tenant_id: Option<TenantId>,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub actor_id: Option<ActorId>,
    pub actor_label: Option<String>,
    pub outcome: AuditOutcome,
    pub description: String,
    /// Originating query or endpoint.
    pub source: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewAuditEvent {
    /// Start an event stamped with the current time.
    pub fn new(action: AuditAction, entity_type: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            tenant_id: None,
            action,
            entity_type: entity_type.into(),
            entity_id: None,
            actor_id: None,
            actor_label: None,
            outcome,
            description: String::new(),
            source: None,
            ip_address: None,
            user_agent: None,
            created_at: Utc::now(),
        }
    }

    pub fn tenant(mut self, tenant_id: &TenantId) -> Self {
        self.tenant_id = Some(tenant_id.clone());
        self
    }

    pub fn entity_id(mut self, id: impl Into<String>) -> Self {
        self.entity_id = Some(id.into());
        self
    }

    pub fn actor(mut self, actor_id: Option<&ActorId>, label: Option<&str>) -> Self {
        self.actor_id = actor_id.cloned();
        self.actor_label = label.map(str::to_string);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn source(mut self, source: Option<&str>) -> Self {
        self.source = source.map(str::to_string);
        self
    }

    pub fn client(mut self, ip_address: Option<&str>, user_agent: Option<&str>) -> Self {
        self.ip_address = ip_address.map(str::to_string);
        self.user_agent = user_agent.map(str::to_string);
        self
    }
}

/// A sealed, immutable audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    /// Commit order assigned by the store.
    pub sequence: u64,
    pub tenant_id: Option<TenantId>,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub actor_id: Option<ActorId>,
    pub actor_label: Option<String>,
    pub outcome: AuditOutcome,
    pub description: String,
    pub source: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    /// SHA-256 over this event's content and `previous_hash`.
    pub event_hash: String,
    /// Hash of the previous event in commit order (`"genesis"` for the first).
    pub previous_hash: String,
}

// ─── Consent ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentStatus {
    Active,
    Revoked,
}

impl ConsentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentStatus::Active => "active",
            ConsentStatus::Revoked => "revoked",
        }
    }
}

/// Consent clauses. The three `law_*` clauses are mandatory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentClauses {
    #[serde(default)]
    pub law_21668: bool,
    #[serde(default)]
    pub law_19628: bool,
    #[serde(default)]
    pub law_20584: bool,
    #[serde(default)]
    pub marketing: bool,
    #[serde(default)]
    pub communications: bool,
}

impl ConsentClauses {
    /// All mandatory clauses granted, optional ones left off.
    pub fn mandatory() -> Self {
        Self {
            law_21668: true,
            law_19628: true,
            law_20584: true,
            ..Self::default()
        }
    }

    /// Names of mandatory clauses that are not granted.
    pub fn missing_mandatory(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.law_21668 {
            missing.push("law_21668");
        }
        if !self.law_19628 {
            missing.push("law_19628");
        }
        if !self.law_20584 {
            missing.push("law_20584");
        }
        missing
    }

    pub fn mandatory_granted(&self) -> bool {
        self.law_21668 && self.law_19628 && self.law_20584
    }
}

/// Where and by whom a consent bundle was captured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub actor_id: Option<ActorId>,
    pub actor_label: Option<String>,
}

/// One consent bundle for a patient within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub patient_id: PatientId,
    pub status: ConsentStatus,
    pub clauses: ConsentClauses,
    /// Reference to the stored signature artifact.
    pub signature_ref: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub superseded_by: Option<Uuid>,
}

impl ConsentRecord {
    /// Lawful basis for processing at `at`: active, complete, signed, unexpired.
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        if self.status != ConsentStatus::Active {
            return false;
        }
        if !self.clauses.mandatory_granted() || self.signature_ref.trim().is_empty() {
            return false;
        }
        match self.expires_at {
            Some(expires) => at < expires,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_validation() {
        assert!(TenantId::parse("clinic-1").is_ok());
        assert!(ActorId::parse("ana@clinic.cl").is_ok());
        assert!(matches!(
            TenantId::parse(""),
            Err(ClinicError::InvalidArgument(_))
        ));
        assert!(matches!(
            PatientId::parse("p 1"),
            Err(ClinicError::InvalidArgument(_))
        ));
        assert!(ActorId::parse("x".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_id_serde_rejects_malformed() {
        let ok: TenantId = serde_json::from_str("\"clinic-1\"").unwrap();
        assert_eq!(ok.as_str(), "clinic-1");
        assert!(serde_json::from_str::<TenantId>("\"bad id\"").is_err());
    }

    #[test]
    fn test_role_and_capability_names() {
        assert_eq!("clinic_agent".parse::<Role>().unwrap(), Role::ClinicAgent);
        assert!("owner".parse::<Role>().is_err());
        assert_eq!(
            "manage_patients".parse::<Capability>().unwrap(),
            Capability::ManagePatients
        );
        assert_eq!(
            serde_json::to_string(&Capability::ViewReports).unwrap(),
            "\"view_reports\""
        );
        assert!(Role::ClinicAdmin.at_least(Role::ClinicAgent));
        assert!(!Role::Receptionist.at_least(Role::ClinicAgent));
    }

    #[test]
    fn test_outcome_wire_names() {
        assert_eq!(
            serde_json::to_string(&AuditOutcome::MinorFailure).unwrap(),
            "\"minor-failure\""
        );
        assert_eq!(
            "serious-failure".parse::<AuditOutcome>().unwrap(),
            AuditOutcome::SeriousFailure
        );
    }

    #[test]
    fn test_consent_validity() {
        let now = Utc::now();
        let mut record = ConsentRecord {
            id: Uuid::new_v4(),
            tenant_id: TenantId::parse("c1").unwrap(),
            patient_id: PatientId::parse("p1").unwrap(),
            status: ConsentStatus::Active,
            clauses: ConsentClauses::mandatory(),
            signature_ref: "sig-bytes".into(),
            ip_address: None,
            user_agent: None,
            created_at: now,
            expires_at: None,
            revoked_at: None,
            superseded_by: None,
        };
        assert!(record.is_valid_at(now));

        record.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(!record.is_valid_at(now));

        record.expires_at = None;
        record.clauses.law_20584 = false;
        assert!(!record.is_valid_at(now));
        assert_eq!(record.clauses.missing_mandatory(), vec!["law_20584"]);
    }

    #[test]
    fn test_missing_clauses_default_to_false() {
        let clauses: ConsentClauses =
            serde_json::from_str(r#"{"law_21668": true, "law_20584": true}"#).unwrap();
        assert!(!clauses.law_19628);
        assert!(!clauses.mandatory_granted());
    }
}
