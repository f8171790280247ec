//! SQLite store: rusqlite over an r2d2 pool.
//!
//! Blocking calls run on the tokio blocking pool. The audit chain append and
//! the consent supersede each run inside one `BEGIN IMMEDIATE` transaction,
//! and the schema itself refuses updates and deletes on `audit_events` and
//! more than one active consent per patient.
//!
//! Every write commits through a [`CommitGate`]. Under a `bounded` call the
//! pool wait and the busy timeout shrink to the remaining budget, and a
//! transaction whose caller already timed out is rolled back instead of
//! committed.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clinic_core::config::StorageConfig;
use clinic_core::types::{
    ActorId, AuditEvent, ConsentClauses, ConsentRecord, ConsentStatus, Membership,
    NewAuditEvent, PatientId, Role, Tenant, TenantId,
};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row, Transaction,
    TransactionBehavior,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{seal, timestamp_text, GENESIS_HASH};
use crate::store::{
    AuditCursor, AuditFilter, AuditStore, CallBudget, ConsentStore, MembershipChange,
    MembershipStore, StoreError, StoreResult, TenantStore,
};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ref e, _) if e.code == ErrorCode::ConstraintViolation => {
                StoreError::Conflict(err.to_string())
            }
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..) => StoreError::Corrupt(err.to_string()),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(err: r2d2::Error) -> Self {
        StoreError::Unavailable(format!("connection pool: {err}"))
    }
}

/// SQLite-backed store for tenants, memberships, audit events and consent records.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    busy_timeout: Duration,
    is_memory: bool,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("busy_timeout", &self.busy_timeout)
            .field("is_memory", &self.is_memory)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) the database described by `config` and migrate it.
    pub fn open(config: &StorageConfig) -> StoreResult<Self> {
        Self::open_path(
            &config.sqlite_path,
            config.max_connections,
            Duration::from_millis(config.busy_timeout_ms),
        )
    }

    /// A private in-memory database. The pool holds one connection so every
    /// call sees the same data.
    pub fn in_memory() -> StoreResult<Self> {
        Self::open_path(":memory:", 1, Duration::from_millis(2000))
    }

    pub fn open_path<P: AsRef<Path>>(
        path: P,
        max_connections: u32,
        busy_timeout: Duration,
    ) -> StoreResult<Self> {
        let is_memory = path.as_ref().to_string_lossy() == ":memory:";
        let manager = if is_memory {
            SqliteConnectionManager::memory()
        } else {
            SqliteConnectionManager::file(path.as_ref())
        };
        let manager = manager.with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            if !is_memory {
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            }
            conn.pragma_update(None, "foreign_keys", "ON")
        });

        let pool = Pool::builder()
            .max_size(if is_memory { 1 } else { max_connections.max(1) })
            .connection_timeout(busy_timeout.max(Duration::from_millis(500)))
            .build(manager)?;

        let store = Self {
            pool,
            busy_timeout,
            is_memory,
        };
        let mut conn = store.pool.get()?;
        initialize_schema(&mut conn)?;
        info!(
            path = %path.as_ref().display(),
            schema_version = SCHEMA_VERSION,
            "Access store initialized (sqlite)"
        );
        Ok(store)
    }

    /// Flush the WAL and refresh planner statistics before shutdown.
    pub async fn close(&self) -> StoreResult<()> {
        let is_memory = self.is_memory;
        self.run(move |conn, _| {
            if !is_memory {
                conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
            }
            conn.execute_batch("PRAGMA optimize;")?;
            Ok(())
        })
        .await?;
        info!("Access store closed (sqlite)");
        Ok(())
    }

    async fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection, &CommitGate) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        let busy_timeout = self.busy_timeout;
        let gate = CommitGate {
            budget: CallBudget::current(),
        };
        tokio::task::spawn_blocking(move || {
            if gate.abandoned() {
                return Err(StoreError::Unavailable("caller gave up before the call ran".into()));
            }
            let wait = gate.wait_limit(busy_timeout);
            let mut conn = pool.get_timeout(wait)?;
            conn.busy_timeout(wait)?;
            let result = f(&mut conn, &gate);
            if let Err(e) = conn.busy_timeout(busy_timeout) {
                warn!(error = %e, "Failed to restore busy timeout on pooled connection");
            }
            result
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
    }
}

/// Decides whether a finished transaction may commit.
struct CommitGate {
    budget: Option<Arc<CallBudget>>,
}

impl CommitGate {
    fn abandoned(&self) -> bool {
        self.budget.as_ref().is_some_and(|b| b.is_abandoned())
    }

    fn wait_limit(&self, configured: Duration) -> Duration {
        self.budget
            .as_ref()
            .map_or(configured, |b| b.remaining().min(configured))
    }

    /// Commit `tx`, or roll it back if the caller's deadline has passed.
    fn commit(&self, tx: Transaction<'_>) -> StoreResult<()> {
        if let Some(budget) = &self.budget {
            if !budget.claim() {
                drop(tx);
                return Err(StoreError::Unavailable(
                    "deadline passed before commit; transaction rolled back".into(),
                ));
            }
        }
        tx.commit()?;
        Ok(())
    }
}

// ─── Schema ─────────────────────────────────────────────────────────────

fn initialize_schema(conn: &mut Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;
    let current: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;

    match current {
        None => {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute_batch(SCHEMA_V1)?;
            tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [SCHEMA_VERSION])?;
            tx.commit()?;
            Ok(())
        }
        Some(v) if v == SCHEMA_VERSION => Ok(()),
        Some(v) => Err(StoreError::Corrupt(format!(
            "unsupported schema version {v} (expected {SCHEMA_VERSION})"
        ))),
    }
}

const SCHEMA_V1: &str = "
CREATE TABLE tenants (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    active      INTEGER NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE memberships (
    position    INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,
    actor_id    TEXT NOT NULL,
    tenant_id   TEXT NOT NULL,
    role        TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    revoked_at  TEXT,
    UNIQUE (actor_id, tenant_id)
);
CREATE INDEX idx_memberships_actor_role ON memberships (actor_id, role);

CREATE TABLE audit_events (
    sequence       INTEGER PRIMARY KEY,
    id             TEXT NOT NULL UNIQUE,
    tenant_id      TEXT,
    action         TEXT NOT NULL,
    entity_type    TEXT NOT NULL,
    entity_id      TEXT,
    actor_id       TEXT,
    actor_label    TEXT,
    outcome        TEXT NOT NULL,
    description    TEXT NOT NULL,
    source         TEXT,
    ip_address     TEXT,
    user_agent     TEXT,
    created_at     TEXT NOT NULL,
    event_hash     TEXT NOT NULL,
    previous_hash  TEXT NOT NULL
);
CREATE INDEX idx_audit_entity ON audit_events (entity_type, entity_id, created_at);
CREATE INDEX idx_audit_created ON audit_events (created_at, sequence);
CREATE INDEX idx_audit_tenant ON audit_events (tenant_id, created_at);
CREATE TRIGGER audit_events_no_update BEFORE UPDATE ON audit_events
BEGIN
    SELECT RAISE(ABORT, 'audit_events is append-only');
END;
CREATE TRIGGER audit_events_no_delete BEFORE DELETE ON audit_events
BEGIN
    SELECT RAISE(ABORT, 'audit_events is append-only');
END;

CREATE TABLE consent_records (
    id              TEXT PRIMARY KEY,
    tenant_id       TEXT NOT NULL,
    patient_id      TEXT NOT NULL,
    status          TEXT NOT NULL,
    law_21668       INTEGER NOT NULL,
    law_19628       INTEGER NOT NULL,
    law_20584       INTEGER NOT NULL,
    marketing       INTEGER NOT NULL,
    communications  INTEGER NOT NULL,
    signature_ref   TEXT NOT NULL,
    ip_address      TEXT,
    user_agent      TEXT,
    created_at      TEXT NOT NULL,
    expires_at      TEXT,
    revoked_at      TEXT,
    superseded_by   TEXT,
    inserted        INTEGER NOT NULL
);
CREATE UNIQUE INDEX idx_consent_one_active
    ON consent_records (tenant_id, patient_id) WHERE status = 'active';
CREATE INDEX idx_consent_lookup ON consent_records (tenant_id, patient_id, status);
";

// ─── Row mapping ────────────────────────────────────────────────────────

fn corrupt<E: std::fmt::Display>(idx: usize) -> impl FnOnce(E) -> rusqlite::Error {
    move |e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
        )
    }
}

fn ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(corrupt(idx))
}

fn opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        DateTime::parse_from_rfc3339(&r)
            .map(|t| t.with_timezone(&Utc))
            .map_err(corrupt(idx))
    })
    .transpose()
}

fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(corrupt(idx))
}

fn opt_parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| r.parse::<T>().map_err(corrupt(idx))).transpose()
}

const TENANT_COLS: &str = "id, name, active, created_at, updated_at";

fn tenant_row(row: &Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: parsed(row, 0)?,
        name: row.get(1)?,
        active: row.get(2)?,
        created_at: ts(row, 3)?,
        updated_at: ts(row, 4)?,
    })
}

const MEMBERSHIP_COLS: &str =
    "id, actor_id, tenant_id, role, position, created_at, updated_at, revoked_at";

fn membership_row(row: &Row<'_>) -> rusqlite::Result<Membership> {
    Ok(Membership {
        id: parsed(row, 0)?,
        actor_id: parsed(row, 1)?,
        tenant_id: parsed(row, 2)?,
        role: parsed(row, 3)?,
        position: row.get::<_, i64>(4)? as u64,
        created_at: ts(row, 5)?,
        updated_at: ts(row, 6)?,
        revoked_at: opt_ts(row, 7)?,
    })
}

const AUDIT_COLS: &str = "sequence, id, tenant_id, action, entity_type, entity_id, actor_id, \
     actor_label, outcome, description, source, ip_address, user_agent, created_at, \
     event_hash, previous_hash";

fn audit_row(row: &Row<'_>) -> rusqlite::Result<AuditEvent> {
    Ok(AuditEvent {
        sequence: row.get::<_, i64>(0)? as u64,
        id: parsed(row, 1)?,
        tenant_id: opt_parsed(row, 2)?,
        action: parsed(row, 3)?,
        entity_type: row.get(4)?,
        entity_id: row.get(5)?,
        actor_id: opt_parsed(row, 6)?,
        actor_label: row.get(7)?,
        outcome: parsed(row, 8)?,
        description: row.get(9)?,
        source: row.get(10)?,
        ip_address: row.get(11)?,
        user_agent: row.get(12)?,
        created_at: ts(row, 13)?,
        event_hash: row.get(14)?,
        previous_hash: row.get(15)?,
    })
}

const CONSENT_COLS: &str = "id, tenant_id, patient_id, status, law_21668, law_19628, law_20584, \
     marketing, communications, signature_ref, ip_address, user_agent, created_at, expires_at, \
     revoked_at, superseded_by";

fn consent_status(raw: &str) -> Option<ConsentStatus> {
    match raw {
        "active" => Some(ConsentStatus::Active),
        "revoked" => Some(ConsentStatus::Revoked),
        _ => None,
    }
}

fn consent_row(row: &Row<'_>) -> rusqlite::Result<ConsentRecord> {
    let status: String = row.get(3)?;
    Ok(ConsentRecord {
        id: parsed(row, 0)?,
        tenant_id: parsed(row, 1)?,
        patient_id: parsed(row, 2)?,
        status: consent_status(&status)
            .ok_or_else(|| corrupt(3)(format!("unknown consent status {status}")))?,
        clauses: ConsentClauses {
            law_21668: row.get(4)?,
            law_19628: row.get(5)?,
            law_20584: row.get(6)?,
            marketing: row.get(7)?,
            communications: row.get(8)?,
        },
        signature_ref: row.get(9)?,
        ip_address: row.get(10)?,
        user_agent: row.get(11)?,
        created_at: ts(row, 12)?,
        expires_at: opt_ts(row, 13)?,
        revoked_at: opt_ts(row, 14)?,
        superseded_by: opt_parsed(row, 15)?,
    })
}

fn select_membership(
    conn: &Connection,
    actor: &str,
    tenant: &str,
) -> rusqlite::Result<Option<Membership>> {
    conn.query_row(
        &format!("SELECT {MEMBERSHIP_COLS} FROM memberships WHERE actor_id = ?1 AND tenant_id = ?2"),
        params![actor, tenant],
        membership_row,
    )
    .optional()
}

fn select_active_consent(
    conn: &Connection,
    tenant: &str,
    patient: &str,
) -> rusqlite::Result<Option<ConsentRecord>> {
    conn.query_row(
        &format!(
            "SELECT {CONSENT_COLS} FROM consent_records \
             WHERE tenant_id = ?1 AND patient_id = ?2 AND status = 'active'"
        ),
        params![tenant, patient],
        consent_row,
    )
    .optional()
}

// ─── Trait implementations ──────────────────────────────────────────────

#[async_trait]
impl TenantStore for SqliteStore {
    async fn get_tenant(&self, id: &TenantId) -> StoreResult<Option<Tenant>> {
        let id = id.to_string();
        self.run(move |conn, _| {
            Ok(conn
                .query_row(
                    &format!("SELECT {TENANT_COLS} FROM tenants WHERE id = ?1"),
                    [id],
                    tenant_row,
                )
                .optional()?)
        })
        .await
    }

    async fn put_tenant(&self, tenant: Tenant) -> StoreResult<()> {
        self.run(move |conn, gate| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO tenants (id, name, active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (id) DO UPDATE SET
                     name = excluded.name,
                     active = excluded.active,
                     updated_at = excluded.updated_at",
                params![
                    tenant.id.as_str(),
                    tenant.name,
                    tenant.active,
                    timestamp_text(&tenant.created_at),
                    timestamp_text(&tenant.updated_at),
                ],
            )?;
            gate.commit(tx)
        })
        .await
    }
}

#[async_trait]
impl MembershipStore for SqliteStore {
    async fn find_membership(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
    ) -> StoreResult<Option<Membership>> {
        let (actor, tenant) = (actor.to_string(), tenant.to_string());
        self.run(move |conn, _| {
            Ok(select_membership(conn, &actor, &tenant)?.filter(Membership::is_active))
        })
        .await
    }

    async fn memberships_for_actor(&self, actor: &ActorId) -> StoreResult<Vec<Membership>> {
        let actor = actor.to_string();
        self.run(move |conn, _| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MEMBERSHIP_COLS} FROM memberships \
                 WHERE actor_id = ?1 AND revoked_at IS NULL ORDER BY position"
            ))?;
            let rows = stmt
                .query_map([actor], membership_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn holds_super_admin(&self, actor: &ActorId) -> StoreResult<bool> {
        let actor = actor.to_string();
        self.run(move |conn, _| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM memberships \
                     WHERE actor_id = ?1 AND role = ?2 AND revoked_at IS NULL LIMIT 1",
                    params![actor, Role::SuperAdmin.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn upsert_membership(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
        role: Role,
    ) -> StoreResult<MembershipChange> {
        let (actor, tenant) = (actor.to_string(), tenant.to_string());
        self.run(move |conn, gate| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let previous_role = select_membership(&tx, &actor, &tenant)?
                .filter(Membership::is_active)
                .map(|m| m.role);
            let now = timestamp_text(&Utc::now());
            tx.execute(
                "INSERT INTO memberships (id, actor_id, tenant_id, role, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT (actor_id, tenant_id) DO UPDATE SET
                     role = excluded.role,
                     updated_at = excluded.updated_at,
                     revoked_at = NULL",
                params![Uuid::new_v4().to_string(), actor, tenant, role.as_str(), now],
            )?;
            let membership = select_membership(&tx, &actor, &tenant)?.ok_or_else(|| {
                StoreError::Corrupt(format!("membership {actor}/{tenant} vanished after upsert"))
            })?;
            gate.commit(tx)?;
            Ok(MembershipChange {
                membership,
                previous_role,
            })
        })
        .await
    }

    async fn revoke_membership(
        &self,
        actor: &ActorId,
        tenant: &TenantId,
    ) -> StoreResult<Option<Membership>> {
        let (actor, tenant) = (actor.to_string(), tenant.to_string());
        self.run(move |conn, gate| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = timestamp_text(&Utc::now());
            let changed = tx.execute(
                "UPDATE memberships SET revoked_at = ?3, updated_at = ?3
                 WHERE actor_id = ?1 AND tenant_id = ?2 AND revoked_at IS NULL",
                params![actor, tenant, now],
            )?;
            let revoked = if changed == 1 {
                select_membership(&tx, &actor, &tenant)?
            } else {
                None
            };
            gate.commit(tx)?;
            Ok(revoked)
        })
        .await
    }
}

#[async_trait]
impl AuditStore for SqliteStore {
    async fn append(&self, event: NewAuditEvent) -> StoreResult<AuditEvent> {
        self.run(move |conn, gate| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let last: Option<(i64, String)> = tx
                .query_row(
                    "SELECT sequence, event_hash FROM audit_events ORDER BY sequence DESC LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (sequence, previous_hash) = match last {
                Some((seq, hash)) => (seq as u64 + 1, hash),
                None => (1, GENESIS_HASH.to_string()),
            };
            let sealed = seal(event, sequence, &previous_hash);
            tx.execute(
                &format!(
                    "INSERT INTO audit_events ({AUDIT_COLS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    sealed.sequence as i64,
                    sealed.id.to_string(),
                    sealed.tenant_id.as_ref().map(|t| t.as_str()),
                    sealed.action.as_str(),
                    sealed.entity_type,
                    sealed.entity_id,
                    sealed.actor_id.as_ref().map(|a| a.as_str()),
                    sealed.actor_label,
                    sealed.outcome.as_str(),
                    sealed.description,
                    sealed.source,
                    sealed.ip_address,
                    sealed.user_agent,
                    timestamp_text(&sealed.created_at),
                    sealed.event_hash,
                    sealed.previous_hash,
                ],
            )?;
            gate.commit(tx)?;
            Ok(sealed)
        })
        .await
    }

    async fn page(
        &self,
        filter: &AuditFilter,
        after: Option<AuditCursor>,
        limit: usize,
    ) -> StoreResult<Vec<AuditEvent>> {
        let filter = filter.clone();
        self.run(move |conn, _| {
            let mut clauses: Vec<&str> = Vec::new();
            let mut values: Vec<Value> = Vec::new();
            if let Some(tenant) = filter.tenant_id {
                clauses.push("tenant_id = ?");
                values.push(Value::Text(tenant.into()));
            }
            if let Some(entity_type) = filter.entity_type {
                clauses.push("entity_type = ?");
                values.push(Value::Text(entity_type));
            }
            if let Some(entity_id) = filter.entity_id {
                clauses.push("entity_id = ?");
                values.push(Value::Text(entity_id));
            }
            if let Some(actor) = filter.actor_id {
                clauses.push("actor_id = ?");
                values.push(Value::Text(actor.into()));
            }
            if let Some(action) = filter.action {
                clauses.push("action = ?");
                values.push(Value::Text(action.as_str().to_string()));
            }
            if let Some(outcome) = filter.outcome {
                clauses.push("outcome = ?");
                values.push(Value::Text(outcome.as_str().to_string()));
            }
            if let Some(from) = filter.from {
                clauses.push("created_at >= ?");
                values.push(Value::Text(timestamp_text(&from)));
            }
            if let Some(to) = filter.to {
                clauses.push("created_at <= ?");
                values.push(Value::Text(timestamp_text(&to)));
            }
            if let Some(cursor) = after {
                clauses.push("(created_at < ? OR (created_at = ? AND sequence < ?))");
                let at = timestamp_text(&cursor.created_at);
                values.push(Value::Text(at.clone()));
                values.push(Value::Text(at));
                values.push(Value::Integer(cursor.sequence as i64));
            }
            values.push(Value::Integer(limit as i64));

            let predicate = if clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", clauses.join(" AND "))
            };
            let sql = format!(
                "SELECT {AUDIT_COLS} FROM audit_events {predicate} \
                 ORDER BY created_at DESC, sequence DESC LIMIT ?"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), audit_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn chain(&self, after_sequence: u64, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        self.run(move |conn, _| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {AUDIT_COLS} FROM audit_events WHERE sequence > ?1 \
                 ORDER BY sequence ASC LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![after_sequence as i64, limit as i64], audit_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }
}

#[async_trait]
impl ConsentStore for SqliteStore {
    async fn active_consent(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
    ) -> StoreResult<Option<ConsentRecord>> {
        let (tenant, patient) = (tenant.to_string(), patient.to_string());
        self.run(move |conn, _| Ok(select_active_consent(conn, &tenant, &patient)?))
            .await
    }

    async fn consent_history(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
    ) -> StoreResult<Vec<ConsentRecord>> {
        let (tenant, patient) = (tenant.to_string(), patient.to_string());
        self.run(move |conn, _| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONSENT_COLS} FROM consent_records \
                 WHERE tenant_id = ?1 AND patient_id = ?2 ORDER BY inserted DESC"
            ))?;
            let rows = stmt
                .query_map(params![tenant, patient], consent_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn supersede_consent(
        &self,
        record: ConsentRecord,
        expected_active: Option<Uuid>,
    ) -> StoreResult<Option<ConsentRecord>> {
        self.run(move |conn, gate| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let tenant = record.tenant_id.as_str();
            let patient = record.patient_id.as_str();
            let current = select_active_consent(&tx, tenant, patient)?;
            if current.as_ref().map(|r| r.id) != expected_active {
                return Err(StoreError::Conflict(format!("consent {tenant}/{patient}")));
            }

            let superseded = match current {
                Some(mut prior) => {
                    tx.execute(
                        "UPDATE consent_records
                         SET status = 'revoked', revoked_at = ?2, superseded_by = ?3
                         WHERE id = ?1 AND status = 'active'",
                        params![
                            prior.id.to_string(),
                            timestamp_text(&record.created_at),
                            record.id.to_string(),
                        ],
                    )?;
                    prior.status = ConsentStatus::Revoked;
                    prior.revoked_at = Some(record.created_at);
                    prior.superseded_by = Some(record.id);
                    Some(prior)
                }
                None => None,
            };

            let inserted: i64 = tx.query_row(
                "SELECT COALESCE(MAX(inserted), 0) + 1 FROM consent_records",
                [],
                |row| row.get(0),
            )?;
            tx.execute(
                &format!(
                    "INSERT INTO consent_records ({CONSENT_COLS}, inserted) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
                ),
                params![
                    record.id.to_string(),
                    tenant,
                    patient,
                    record.status.as_str(),
                    record.clauses.law_21668,
                    record.clauses.law_19628,
                    record.clauses.law_20584,
                    record.clauses.marketing,
                    record.clauses.communications,
                    record.signature_ref,
                    record.ip_address,
                    record.user_agent,
                    timestamp_text(&record.created_at),
                    record.expires_at.as_ref().map(timestamp_text),
                    record.revoked_at.as_ref().map(timestamp_text),
                    record.superseded_by.map(|id| id.to_string()),
                    inserted,
                ],
            )?;
            gate.commit(tx)?;
            Ok(superseded)
        })
        .await
    }

    async fn revoke_consent(
        &self,
        tenant: &TenantId,
        patient: &PatientId,
        expected_active: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<ConsentRecord> {
        let (tenant, patient) = (tenant.to_string(), patient.to_string());
        self.run(move |conn, gate| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let changed = tx.execute(
                "UPDATE consent_records SET status = 'revoked', revoked_at = ?4
                 WHERE id = ?1 AND tenant_id = ?2 AND patient_id = ?3 AND status = 'active'",
                params![expected_active.to_string(), tenant, patient, timestamp_text(&at)],
            )?;
            if changed != 1 {
                return Err(StoreError::Conflict(format!("consent {tenant}/{patient}")));
            }
            let record = tx.query_row(
                &format!("SELECT {CONSENT_COLS} FROM consent_records WHERE id = ?1"),
                [expected_active.to_string()],
                consent_row,
            )?;
            gate.commit(tx)?;
            Ok(record)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLedger;
    use crate::store::bounded;
    use clinic_core::error::ClinicError;
    use clinic_core::types::{AuditAction, AuditOutcome};
    use std::thread::JoinHandle;
    use std::time::Instant;

    fn consent(tenant: &TenantId, patient: &PatientId) -> ConsentRecord {
        ConsentRecord {
            id: Uuid::new_v4(),
            tenant_id: tenant.clone(),
            patient_id: patient.clone(),
            status: ConsentStatus::Active,
            clauses: ConsentClauses::mandatory(),
            signature_ref: "sig".into(),
            ip_address: None,
            user_agent: None,
            created_at: Utc::now(),
            expires_at: None,
            revoked_at: None,
            superseded_by: None,
        }
    }

    /// Take the database write lock from a separate connection for `hold`.
    fn hold_write_lock(path: &Path, hold: Duration) -> JoinHandle<()> {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        std::thread::spawn(move || {
            std::thread::sleep(hold);
            conn.execute_batch("COMMIT").unwrap();
        })
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.db");
        SqliteStore::open_path(&path, 2, Duration::from_millis(500)).unwrap();
        let reopened = SqliteStore::open_path(&path, 2, Duration::from_millis(500)).unwrap();
        let tenant = TenantId::parse("clinic-1").unwrap();
        assert!(reopened.get_tenant(&tenant).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_audit_rows_cannot_be_rewritten() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .append(NewAuditEvent::new(AuditAction::Read, "Patient", AuditOutcome::Success))
            .await
            .unwrap();

        let update = store
            .run(|conn, _| {
                conn.execute("UPDATE audit_events SET description = 'forged'", [])?;
                Ok(())
            })
            .await;
        assert!(update.is_err());

        let delete = store
            .run(|conn, _| {
                conn.execute("DELETE FROM audit_events", [])?;
                Ok(())
            })
            .await;
        assert!(delete.is_err());
        assert_eq!(store.chain(0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_membership_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let actor = ActorId::parse("actor-a").unwrap();
        let t1 = TenantId::parse("clinic-1").unwrap();
        let t2 = TenantId::parse("clinic-2").unwrap();

        store.upsert_membership(&actor, &t2, Role::ClinicAgent).await.unwrap();
        store.upsert_membership(&actor, &t1, Role::Receptionist).await.unwrap();
        let change = store.upsert_membership(&actor, &t2, Role::ClinicAdmin).await.unwrap();
        assert_eq!(change.previous_role, Some(Role::ClinicAgent));

        let rows = store.memberships_for_actor(&actor).await.unwrap();
        let tenants: Vec<&str> = rows.iter().map(|m| m.tenant_id.as_str()).collect();
        assert_eq!(tenants, vec!["clinic-2", "clinic-1"]);
        assert_eq!(rows[0].role, Role::ClinicAdmin);
        assert!(!store.holds_super_admin(&actor).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_writes_never_commit_late() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.db");
        let store = SqliteStore::open_path(&path, 4, Duration::from_secs(2)).unwrap();
        let tenant = TenantId::parse("clinic-1").unwrap();
        let patient = PatientId::parse("patient-1").unwrap();

        let holder = hold_write_lock(&path, Duration::from_millis(400));
        let started = Instant::now();
        let submitted = bounded(
            Duration::from_millis(100),
            store.supersede_consent(consent(&tenant, &patient), None),
        )
        .await;
        assert!(matches!(submitted, Err(ClinicError::StorageUnavailable(_))));
        let appended = bounded(
            Duration::from_millis(100),
            store.append(NewAuditEvent::new(AuditAction::Create, "Consent", AuditOutcome::Success)),
        )
        .await;
        assert!(matches!(appended, Err(ClinicError::StorageUnavailable(_))));
        assert!(started.elapsed() < Duration::from_millis(400));

        tokio::task::spawn_blocking(move || holder.join().unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(store.active_consent(&tenant, &patient).await.unwrap().is_none());
        assert!(store.consent_history(&tenant, &patient).await.unwrap().is_empty());
        assert!(store.chain(0, 10).await.unwrap().is_empty());

        // Once the lock is released the same write goes through.
        bounded(
            Duration::from_secs(1),
            store.supersede_consent(consent(&tenant, &patient), None),
        )
        .await
        .unwrap();
        assert!(store.active_consent(&tenant, &patient).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_verify_chain_reports_forged_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.db");
        let store = Arc::new(SqliteStore::open_path(&path, 2, Duration::from_millis(500)).unwrap());
        let ledger = AuditLedger::new(store.clone(), Duration::from_secs(1), 100, 3);
        for description in ["chart opened", "chart updated", "chart printed"] {
            ledger
                .record(
                    NewAuditEvent::new(AuditAction::Read, "Patient", AuditOutcome::Success)
                        .description(description),
                )
                .await
                .unwrap();
        }
        assert!(ledger.verify_chain().await.unwrap().chain_intact);

        let raw = Connection::open(&path).unwrap();
        raw.execute_batch(
            "DROP TRIGGER audit_events_no_update;
             UPDATE audit_events SET description = 'chart untouched' WHERE sequence = 2;",
        )
        .unwrap();

        let verification = ledger.verify_chain().await.unwrap();
        assert_eq!(verification.total_events, 3);
        assert_eq!(verification.valid_events, 2);
        assert_eq!(verification.tampered_sequences, vec![2]);
        assert!(!verification.chain_intact);
    }
}
