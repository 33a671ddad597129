//! API server: HTTP REST surface plus the Prometheus exporter.

use crate::auth::{self, TenantAuth};
use crate::rest::{self, AppState};
use crate::swagger::ApiDoc;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use viewthrough_attribution::{ReportService, ViewThroughService};
use viewthrough_core::config::AppConfig;

pub struct ApiServer {
    config: AppConfig,
    service: Arc<ViewThroughService>,
    reports: Arc<ReportService>,
}

impl ApiServer {
    pub fn new(
        config: AppConfig,
        service: Arc<ViewThroughService>,
        reports: Arc<ReportService>,
    ) -> Self {
        Self {
            config,
            service,
            reports,
        }
    }

    /// Build the full router with middleware.
    pub fn router(&self) -> Router {
        let state = AppState {
            reports: self.reports.clone(),
            service: self.service.clone(),
            node_id: self.config.node_id.clone(),
            start_time: Instant::now(),
            window_days: self.config.scheduler.window_days,
        };
        let tenant_auth = TenantAuth::from_entries(&self.config.api.tokens);
        if tenant_auth.is_empty() {
            warn!("No API tokens configured; every /attribution request will be rejected");
        }
        build_router(state, tenant_auth)
    }

    /// Start the HTTP REST server.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let app = self.router();

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    /// Start the metrics server on a separate port.
    pub async fn start_metrics(&self) -> anyhow::Result<()> {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        builder
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}

/// Assemble routes, auth and middleware around `state`.
pub fn build_router(state: AppState, tenant_auth: TenantAuth) -> Router {
    Router::new()
        // Attribution
        .route("/attribution/view-through", get(rest::handle_view_through))
        .route("/attribution/view-through/compute", post(rest::handle_compute))
        .route("/attribution/combined", get(rest::handle_combined))
        .route("/attribution/impressions", get(rest::handle_impressions))
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        .layer(axum::middleware::from_fn_with_state(
            tenant_auth,
            auth::auth_middleware,
        ))
        .with_state(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
