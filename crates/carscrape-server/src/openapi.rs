use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "carscrape API",
        version = "0.1.0",
        description = "Vehicle-listing scraper with a concurrent job orchestrator and webhook delivery."
    ),
    paths(
        crate::routes::scrape,
        crate::routes::test_selectors,
        crate::routes::list_jobs,
        crate::routes::get_job,
        crate::routes::cancel_job,
        crate::routes::metrics,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::ScrapeRequest,
        crate::dto::ScrapeResponse,
        crate::dto::TestSelectorsRequest,
        crate::dto::TestSelectorsResponse,
        crate::dto::JobResponse,
        crate::dto::ScrapeStatsResponse,
        crate::dto::JobErrorResponse,
        crate::dto::DeliveryResponse,
        crate::dto::JobListResponse,
        crate::dto::MetricsResponse,
        crate::dto::HealthResponse,
        crate::dto::ErrorResponse,
    )),
    tags(
        (name = "scrape", description = "Job submission and selector testing"),
        (name = "jobs", description = "Scrape job inspection and cancellation"),
        (name = "system", description = "Health and metrics"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Adds Bearer token security scheme to the OpenAPI spec.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("token")
                        .description(Some(
                            "Enforced when API_KEY_REQUIRED=true. Set the key via API_KEY.",
                        ))
                        .build(),
                ),
            );
        }
    }
}
