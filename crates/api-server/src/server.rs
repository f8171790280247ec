//! API server: HTTP routes over the access core, plus the metrics exporter.

use crate::rest::{self, AppState};
use axum::routing::{get, post};
use axum::Router;
use clinic_access::AccessCore;
use clinic_core::config::AppConfig;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct ApiServer {
    config: AppConfig,
    core: Arc<AccessCore>,
}

impl ApiServer {
    pub fn new(config: AppConfig, core: Arc<AccessCore>) -> Self {
        Self { config, core }
    }

    /// All routes with middleware attached.
    pub fn router(&self) -> Router {
        let state = AppState {
            core: self.core.clone(),
            node_id: self.config.node_id.clone(),
            start_time: Instant::now(),
        };

        Router::new()
            // Permission gate
            .route("/v1/permissions/check", post(rest::check_permission))
            .route("/v1/permissions/require", post(rest::require_permission))
            // Memberships
            .route("/v1/actors/:actor/tenants", get(rest::list_tenants))
            .route(
                "/v1/tenants/:tenant/members/:actor",
                get(rest::get_member)
                    .put(rest::put_member)
                    .delete(rest::delete_member),
            )
            // Consent
            .route(
                "/v1/tenants/:tenant/patients/:patient/consent",
                get(rest::get_consent)
                    .post(rest::submit_consent)
                    .delete(rest::revoke_consent),
            )
            // Audit
            .route("/v1/audit", post(rest::record_audit).get(rest::query_audit))
            .route("/v1/audit/verify", get(rest::verify_audit))
            .route("/v1/audit/summary", get(rest::audit_summary))
            // Operational endpoints
            .route("/health", get(rest::health_check))
            .route("/live", get(rest::liveness))
            // Middleware
            .layer(CompressionLayer::new())
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve HTTP until `shutdown` resolves.
    pub async fn start_http<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);
        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }

    /// Start the metrics server on a separate port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        let handle = builder
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install_recorder()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");

        // The recorder lives for the rest of the process.
        std::mem::forget(handle);
        Ok(())
    }
}
