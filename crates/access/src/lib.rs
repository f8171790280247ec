//! Access-control and compliance-audit core.
//!
//! Four components over one injected store:
//! - `MembershipDirectory` resolves an actor's role per tenant.
//! - `PermissionEvaluator` applies the static role/capability matrix.
//! - `AuditLedger` appends hash-chained, append-only audit events.
//! - `ConsentLedger` gates patient data processing behind consent bundles.
//!
//! `AccessCore` wires them together for request handlers.

pub mod audit;
pub mod consent;
pub mod gate;
pub mod membership;
pub mod memory;
pub mod permission;
pub mod sqlite;
pub mod store;

pub use audit::{AuditLedger, AuditPager, ChainVerification, ComplianceSummary};
pub use consent::ConsentLedger;
pub use gate::AccessCore;
pub use membership::{MembershipDirectory, TenantRole};
pub use memory::MemoryStore;
pub use permission::{is_granted, AccessContext, PermissionEvaluator};
pub use sqlite::SqliteStore;
pub use store::{AccessStore, AuditFilter, StoreError};
