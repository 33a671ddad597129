//! OpenAPI specification and Swagger UI configuration.

use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "View-Through Attribution API",
        version = "0.1.0",
        description = "Probabilistic view-through attribution for ad platforms.\n\nEstimates which platforms a buyer plausibly saw before purchasing, allocates capped revenue credit to them, and reports it next to click-based attribution.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Attribution", description = "View-through reports, combined reports and manual computation"),
        (name = "Operations", description = "Health, readiness, and liveness probes"),
    ),
    paths(
        // Attribution
        crate::rest::handle_view_through,
        crate::rest::handle_combined,
        crate::rest::handle_compute,
        crate::rest::handle_impressions,
        // Operations
        crate::rest::health_check,
        crate::rest::readiness,
        crate::rest::liveness,
    ),
    components(schemas(
        // Report types
        viewthrough_attribution::report::ViewThroughReport,
        viewthrough_attribution::report::ViewThroughPlatformRow,
        viewthrough_attribution::report::CombinedReport,
        viewthrough_attribution::report::CombinedPlatformRow,
        viewthrough_attribution::report::CombinedTotals,
        viewthrough_core::types::DateRange,
        viewthrough_core::types::ImpressionRollup,
        viewthrough_core::ClickModel,
        // Computation
        crate::rest::ComputeRequest,
        crate::rest::ComputeResponse,
        // REST error/health types
        crate::rest::ErrorResponse,
        crate::rest::HealthResponse,
    )),
    modifiers(&BearerAuth)
)]
pub struct ApiDoc;

/// Registers the `bearer` security scheme referenced by attribution routes.
struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
            );
        }
    }
}
