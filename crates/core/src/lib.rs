//! Shared types for the clinic access-control and compliance-audit core:
//! identifiers, roles and capabilities, audit and consent records, errors,
//! and service configuration.

pub mod config;
pub mod error;
pub mod types;

pub use config::AppConfig;
pub use error::{ClinicError, ClinicResult};
