use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `CLINIC_GATE__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub access: AccessConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Which durable store backs the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Upper bound on every store call made by the core.
    #[serde(default = "default_storage_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    /// Whether the permission evaluator writes its own audit entries.
    #[serde(default = "default_audit_permission_checks")]
    pub audit_permission_checks: bool,
    #[serde(default = "default_audit_page_size")]
    pub audit_page_size: usize,
    /// Consecutive failed audit writes before an operator alert is raised.
    #[serde(default = "default_audit_failure_alert_threshold")]
    pub audit_failure_alert_threshold: u64,
    /// Lifetime of a consent bundle. `None` means bundles do not expire.
    #[serde(default)]
    pub consent_validity_days: Option<u32>,
    /// Administrator seeded at startup, so memberships can be managed over HTTP.
    #[serde(default)]
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

/// A super_admin membership created on startup if missing.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapAdmin {
    pub actor_id: String,
    pub tenant_id: String,
}

// Default functions
fn default_node_id() -> String {
    "gate-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_storage_backend() -> StorageBackend {
    StorageBackend::Memory
}
fn default_sqlite_path() -> String {
    "clinic-gate.db".to_string()
}
fn default_max_connections() -> u32 {
    8
}
fn default_busy_timeout_ms() -> u64 {
    2000
}
fn default_storage_timeout_ms() -> u64 {
    3000
}
fn default_audit_permission_checks() -> bool {
    true
}
fn default_audit_page_size() -> usize {
    200
}
fn default_audit_failure_alert_threshold() -> u64 {
    3
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            sqlite_path: default_sqlite_path(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
            timeout_ms: default_storage_timeout_ms(),
        }
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            audit_permission_checks: default_audit_permission_checks(),
            audit_page_size: default_audit_page_size(),
            audit_failure_alert_threshold: default_audit_failure_alert_threshold(),
            consent_validity_days: None,
            bootstrap_admin: None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            storage: StorageConfig::default(),
            access: AccessConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file, then environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("CLINIC_GATE")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
