use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use chrono::Utc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use carscrape_core::job::{CreateJobRequest, JobStatus, ScrapeTarget};
use carscrape_core::store::JobFilter;

use crate::auth::require_api_key;
use crate::dto::{
    HealthResponse, JobListResponse, JobResponse, ListJobsQuery, MetricsResponse, ScrapeRequest,
    ScrapeResponse, TestSelectorsRequest, TestSelectorsResponse,
};
use crate::error::ApiError;
use crate::openapi::ApiDoc;
use crate::state::AppState;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

/// Build the full router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/scrape", post(scrape))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(get_job).delete(cancel_job))
        .route("/metrics", get(metrics))
        .route("/test-selectors", post(test_selectors))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    public.merge(api).with_state(state)
}

// ---------------------------------------------------------------------------
// Scrape
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/scrape",
    request_body = ScrapeRequest,
    responses(
        (status = 202, description = "Job accepted", body = ScrapeResponse),
        (status = 400, description = "Unparsable target or webhook URL", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "scrape"
)]
pub async fn scrape(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<ScrapeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut target = ScrapeTarget::from_url(&body.target)?;
    if let Some(filters) = body.filters {
        target = target.with_filters(filters);
    }
    if let Some(max_pages) = body.max_pages {
        target = target.with_max_pages(max_pages);
    }
    if let Some(client_name) = body.client_name {
        target = target.with_client_name(client_name);
    }
    if let Some(selectors) = body.custom_selectors {
        target = target.with_custom_selectors(selectors);
    }

    let mut request = CreateJobRequest::new(target);
    if let Some(url) = body.webhook_url {
        request = request.with_webhook(url);
    }
    if let Some(max) = body.max_retries {
        request = request.with_max_retries(max);
    }

    let job = state.orchestrator.submit(request)?;

    let response = ScrapeResponse {
        job_id: job.id,
        status: job.status.to_string(),
        idempotency_key: job.idempotency_key,
        created_at: job.created_at,
    };

    Ok((StatusCode::ACCEPTED, axum::Json(response)))
}

#[utoipa::path(
    post,
    path = "/test-selectors",
    request_body = TestSelectorsRequest,
    responses(
        (status = 200, description = "Vehicle extracted from the page", body = TestSelectorsResponse),
        (status = 400, description = "Invalid URL", body = crate::dto::ErrorResponse),
        (status = 502, description = "Page could not be loaded", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "scrape"
)]
pub async fn test_selectors(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<TestSelectorsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .runner
        .test_page(&body.url, body.selectors.as_ref(), state.extract_options)
        .await?;

    let response = TestSelectorsResponse {
        url: body.url,
        vehicle: serde_json::to_value(record).map_err(carscrape_core::AppError::from)?,
    };

    Ok(axum::Json(response))
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/jobs",
    params(ListJobsQuery),
    responses(
        (status = 200, description = "Jobs, newest first", body = JobListResponse),
        (status = 400, description = "Unknown status filter", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let mut filter = JobFilter::default()
        .with_limit(query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT));
    if let Some(status) = query.status {
        let status: JobStatus = status.parse().map_err(ApiError::BadRequest)?;
        filter = filter.with_status(status);
    }
    if let Some(source) = query.source {
        let source = source.to_lowercase();
        filter = filter.with_source(source.strip_prefix("www.").unwrap_or(&source));
    }

    let jobs = state.orchestrator.list(&filter);
    let total = jobs.len();

    let response = JobListResponse {
        jobs: jobs.into_iter().map(JobResponse::from).collect(),
        total,
    };

    Ok(axum::Json(response))
}

#[utoipa::path(
    get,
    path = "/jobs/{id}",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job details", body = JobResponse),
        (status = 404, description = "Job not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.orchestrator.get(id)?;
    Ok(axum::Json(JobResponse::from(job)))
}

#[utoipa::path(
    delete,
    path = "/jobs/{id}",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job cancelled", body = JobResponse),
        (status = 404, description = "Job not found", body = crate::dto::ErrorResponse),
        (status = 409, description = "Job already finished", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.orchestrator.cancel(id)?;
    tracing::info!(job_id = %id, "Job cancelled via API");
    Ok(axum::Json(JobResponse::from(job)))
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/metrics",
    responses(
        (status = 200, description = "Job counts and records scraped", body = MetricsResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "system"
)]
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let orchestrator = &state.orchestrator;
    axum::Json(MetricsResponse::new(
        orchestrator.stats(),
        orchestrator.config().max_concurrent_jobs,
    ))
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health() -> impl IntoResponse {
    axum::Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    })
}
