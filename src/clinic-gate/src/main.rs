//! Clinic Gate: access-control and compliance-audit service for multi-tenant clinics.
//!
//! Main entry point: loads configuration, opens the store, and serves HTTP
//! until interrupted.

use clap::Parser;
use clinic_access::{AccessCore, MemoryStore, SqliteStore};
use clinic_api::ApiServer;
use clinic_core::config::{AppConfig, StorageBackend};
use clinic_core::types::{ActorId, TenantId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "clinic-gate")]
#[command(about = "Access-control and compliance-audit core for multi-tenant clinics")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, short)]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "CLINIC_GATE__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "CLINIC_GATE__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Storage backend: memory or sqlite (overrides config)
    #[arg(long, env = "CLINIC_GATE__STORAGE__BACKEND", value_parser = parse_backend)]
    backend: Option<StorageBackend>,

    /// SQLite database path (overrides config)
    #[arg(long, env = "CLINIC_GATE__STORAGE__SQLITE_PATH")]
    sqlite_path: Option<String>,
}

fn parse_backend(raw: &str) -> Result<StorageBackend, String> {
    match raw {
        "memory" => Ok(StorageBackend::Memory),
        "sqlite" => Ok(StorageBackend::Sqlite),
        other => Err(format!("unknown storage backend: {other}")),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "clinic_gate=info,clinic_access=info,clinic_api=info,tower_http=info".into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Clinic Gate starting up");

    // An explicit config file must load; otherwise fall back to defaults.
    let mut config = match cli.config.as_deref() {
        Some(path) => AppConfig::load(Some(path))?,
        None => AppConfig::load(None).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load config, using defaults");
            AppConfig::default()
        }),
    };

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(backend) = cli.backend {
        config.storage.backend = backend;
    }
    if let Some(path) = cli.sqlite_path {
        config.storage.sqlite_path = path;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        backend = ?config.storage.backend,
        audit_permission_checks = config.access.audit_permission_checks,
        "Configuration loaded"
    );

    let timeout = Duration::from_millis(config.storage.timeout_ms);

    // The store is opened here and closed after the server stops.
    let mut sqlite = None;
    let core = match config.storage.backend {
        StorageBackend::Memory => {
            warn!("In-memory storage: audit and consent history will not survive a restart");
            AccessCore::new(Arc::new(MemoryStore::new()), &config.access, timeout)
        }
        StorageBackend::Sqlite => {
            let store = Arc::new(SqliteStore::open(&config.storage)?);
            sqlite = Some(store.clone());
            AccessCore::new(store, &config.access, timeout)
        }
    };

    let core = Arc::new(core);
    if let Some(seed) = &config.access.bootstrap_admin {
        let actor = ActorId::parse(seed.actor_id.as_str())?;
        let tenant = TenantId::parse(seed.tenant_id.as_str())?;
        if core.bootstrap_super_admin(&actor, &tenant).await? {
            info!(actor = %actor, tenant = %tenant, "Bootstrap super_admin granted");
        }
    }

    let api_server = ApiServer::new(config.clone(), core);

    // Start metrics exporter
    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("Clinic Gate is ready to serve traffic");

    // Start HTTP server (blocks until shutdown)
    let served = api_server.start_http(shutdown_signal()).await;

    if let Some(store) = sqlite {
        if let Err(e) = store.close().await {
            error!(error = %e, "Failed to close store cleanly");
        }
    }

    served
}
