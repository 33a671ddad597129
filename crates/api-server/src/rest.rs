//! REST API handlers for attribution reports, manual computation and
//! operational endpoints.

use crate::auth::AuthTenant;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use utoipa::{IntoParams, ToSchema};
use viewthrough_attribution::report::{CombinedReport, ViewThroughReport};
use viewthrough_attribution::{ReportService, ViewThroughService};
use viewthrough_core::types::{DateRange, ImpressionRollup};
use viewthrough_core::{AttributionError, ClickModel};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub reports: Arc<ReportService>,
    pub service: Arc<ViewThroughService>,
    pub node_id: String,
    pub start_time: Instant,
    /// Default trailing window for manual computation.
    pub window_days: i64,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

// ─── Request / response types ───────────────────────────────────────────────

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct RangeQuery {
    /// Inclusive start date, `YYYY-MM-DD`.
    pub start: Option<String>,
    /// Inclusive end date, `YYYY-MM-DD`.
    pub end: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CombinedQuery {
    pub start: Option<String>,
    pub end: Option<String>,
    /// Click model id; defaults to `linear`.
    pub model: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ImpressionQuery {
    pub start: Option<String>,
    pub end: Option<String>,
    /// Restrict to one platform (case-insensitive).
    pub platform: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ComputeRequest {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ComputeResponse {
    pub tenant_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub orders_seen: usize,
    pub orders_processed: usize,
    pub results_written: usize,
    pub summary_rows_updated: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
}

// ─── Validation ─────────────────────────────────────────────────────────────

fn bad_request(error: &str, message: impl Into<String>) -> ApiError {
    let message = message.into();
    warn!(error, message = %message, "Request validation failed");
    metrics::counter!("api.validation_errors").increment(1);
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: error.to_string(),
            message,
        }),
    )
}

fn store_failure(context: &str, e: AttributionError) -> ApiError {
    if e.is_client_error() {
        return bad_request("invalid_request", e.to_string());
    }
    error!(error = %e, context, "Attribution request failed");
    metrics::counter!("api.errors").increment(1);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: format!("{context}_failed"),
            message: "Internal processing error".to_string(),
        }),
    )
}

fn parse_date(name: &str, value: Option<&str>) -> Result<NaiveDate, ApiError> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            bad_request(
                "missing_date",
                format!("query parameter '{name}' is required (YYYY-MM-DD)"),
            )
        })?;
    NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|_| {
        bad_request(
            "invalid_date",
            format!("query parameter '{name}' must be a date in YYYY-MM-DD form, got '{value}'"),
        )
    })
}

/// Parse and validate a required `start`/`end` pair.
pub fn parse_range(start: Option<&str>, end: Option<&str>) -> Result<DateRange, ApiError> {
    let start = parse_date("start", start)?;
    let end = parse_date("end", end)?;
    DateRange::new(start, end).map_err(|e| bad_request("invalid_range", e.to_string()))
}

// ─── Attribution endpoints ──────────────────────────────────────────────────

/// GET /attribution/view-through: View-through report per platform.
#[utoipa::path(
    get,
    path = "/attribution/view-through",
    tag = "Attribution",
    params(RangeQuery),
    responses(
        (status = 200, description = "View-through report", body = ViewThroughReport),
        (status = 400, description = "Missing or invalid dates", body = ErrorResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ErrorResponse),
    ),
    security(("bearer" = []))
)]
pub async fn handle_view_through(
    State(state): State<AppState>,
    Extension(AuthTenant(tenant_id)): Extension<AuthTenant>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<ViewThroughReport>, ApiError> {
    let range = parse_range(query.start.as_deref(), query.end.as_deref())?;
    metrics::counter!("api.requests", "endpoint" => "view_through").increment(1);

    let report = state
        .reports
        .view_through_report(&tenant_id, range)
        .await
        .map_err(|e| store_failure("view_through_report", e))?;
    Ok(Json(report))
}

/// GET /attribution/combined: Click model and view-through numbers side by side.
#[utoipa::path(
    get,
    path = "/attribution/combined",
    tag = "Attribution",
    params(CombinedQuery),
    responses(
        (status = 200, description = "Combined click + view report", body = CombinedReport),
        (status = 400, description = "Invalid dates or unknown model", body = ErrorResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ErrorResponse),
    ),
    security(("bearer" = []))
)]
pub async fn handle_combined(
    State(state): State<AppState>,
    Extension(AuthTenant(tenant_id)): Extension<AuthTenant>,
    Query(query): Query<CombinedQuery>,
) -> Result<Json<CombinedReport>, ApiError> {
    let range = parse_range(query.start.as_deref(), query.end.as_deref())?;
    let model = match query.model.as_deref() {
        None => ClickModel::default(),
        Some(id) => id
            .parse::<ClickModel>()
            .map_err(|e| bad_request("unknown_model", e.to_string()))?,
    };
    metrics::counter!("api.requests", "endpoint" => "combined").increment(1);

    let report = state
        .reports
        .combined_report(&tenant_id, range, model)
        .await
        .map_err(|e| store_failure("combined_report", e))?;
    Ok(Json(report))
}

/// POST /attribution/view-through/compute: Run the computation for the
/// caller's tenant now. The body is optional; dates default to the trailing
/// window ending today.
#[utoipa::path(
    post,
    path = "/attribution/view-through/compute",
    tag = "Attribution",
    request_body(content = ComputeRequest, description = "Optional date overrides"),
    responses(
        (status = 200, description = "Computation finished", body = ComputeResponse),
        (status = 400, description = "Malformed body or invalid dates", body = ErrorResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ErrorResponse),
    ),
    security(("bearer" = []))
)]
pub async fn handle_compute(
    State(state): State<AppState>,
    Extension(AuthTenant(tenant_id)): Extension<AuthTenant>,
    body: Bytes,
) -> Result<Json<ComputeResponse>, ApiError> {
    let request: ComputeRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ComputeRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| bad_request("invalid_body", e.to_string()))?
    };

    let now = Utc::now();
    let default = DateRange::trailing(now, state.window_days);
    let range = DateRange::new(
        request.start_date.unwrap_or(default.start),
        request.end_date.unwrap_or(default.end),
    )
    .map_err(|e| bad_request("invalid_range", e.to_string()))?;

    info!(
        tenant_id = %tenant_id,
        start = %range.start,
        end = %range.end,
        "Manual view-through computation requested"
    );
    metrics::counter!("api.requests", "endpoint" => "compute").increment(1);

    let stats = state
        .service
        .compute_for_tenant(&tenant_id, range, now)
        .await
        .map_err(|e| store_failure("view_through_compute", e))?;

    Ok(Json(ComputeResponse {
        tenant_id,
        start_date: range.start,
        end_date: range.end,
        orders_seen: stats.orders_seen,
        orders_processed: stats.orders_processed,
        results_written: stats.results_written,
        summary_rows_updated: stats.summary_rows_updated,
    }))
}

/// GET /attribution/impressions: Raw impression rollup per (date, platform, campaign).
#[utoipa::path(
    get,
    path = "/attribution/impressions",
    tag = "Attribution",
    params(ImpressionQuery),
    responses(
        (status = 200, description = "Impression rollup", body = Vec<ImpressionRollup>),
        (status = 400, description = "Missing or invalid dates", body = ErrorResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ErrorResponse),
    ),
    security(("bearer" = []))
)]
pub async fn handle_impressions(
    State(state): State<AppState>,
    Extension(AuthTenant(tenant_id)): Extension<AuthTenant>,
    Query(query): Query<ImpressionQuery>,
) -> Result<Json<Vec<ImpressionRollup>>, ApiError> {
    let range = parse_range(query.start.as_deref(), query.end.as_deref())?;
    let platform = query.platform.as_deref().map(str::trim).filter(|p| !p.is_empty());
    metrics::counter!("api.requests", "endpoint" => "impressions").increment(1);

    let rows = state
        .reports
        .impression_rollup(&tenant_id, range, platform)
        .await
        .map_err(|e| store_failure("impression_rollup", e))?;
    Ok(Json(rows))
}

// ─── Operational endpoints ──────────────────────────────────────────────────

/// GET /health: Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Operations",
    responses((status = 200, description = "Service is healthy", body = HealthResponse))
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /ready: Readiness probe. Ready once tenants can be listed from the store.
#[utoipa::path(
    get,
    path = "/ready",
    tag = "Operations",
    responses(
        (status = 200, description = "Ready to serve traffic"),
        (status = 503, description = "Store unavailable"),
    )
)]
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    match state.service.stores().events.list_tenants().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// GET /live: Liveness probe.
#[utoipa::path(
    get,
    path = "/live",
    tag = "Operations",
    responses((status = 200, description = "Process is alive"))
)]
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
