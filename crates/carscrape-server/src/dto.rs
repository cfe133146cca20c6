use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use carscrape_core::job::{DeliveryStatus, Job, JobError, ScrapeStats};
use carscrape_core::store::JobStats;

// ---------------------------------------------------------------------------
// Scrape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct ScrapeRequest {
    /// Listing page URL.
    pub target: String,
    #[schema(value_type = Option<Object>)]
    pub filters: Option<serde_json::Map<String, serde_json::Value>>,
    pub webhook_url: Option<String>,
    pub max_pages: Option<u32>,
    pub client_name: Option<String>,
    /// Extra CSS selectors per field, tried after the built-in ones.
    pub custom_selectors: Option<HashMap<String, Vec<String>>>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ScrapeResponse {
    pub job_id: Uuid,
    pub status: String,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct TestSelectorsRequest {
    /// Vehicle detail page URL.
    pub url: String,
    pub selectors: Option<HashMap<String, Vec<String>>>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct TestSelectorsResponse {
    pub url: String,
    #[schema(value_type = Object)]
    pub vehicle: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobErrorResponse {
    pub kind: String,
    pub message: String,
}

impl From<JobError> for JobErrorResponse {
    fn from(e: JobError) -> Self {
        Self {
            kind: e.kind.to_string(),
            message: e.message,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct DeliveryResponse {
    pub attempts: u32,
    pub delivered_at: Option<DateTime<Utc>>,
    pub last_status: Option<u16>,
    pub last_error: Option<String>,
}

impl From<DeliveryStatus> for DeliveryResponse {
    fn from(d: DeliveryStatus) -> Self {
        Self {
            attempts: d.attempts,
            delivered_at: d.delivered_at,
            last_status: d.last_status,
            last_error: d.last_error,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ScrapeStatsResponse {
    /// Detail pages found on the listing (after `max_pages`).
    pub total_found: usize,
    pub successfully_scraped: usize,
    pub errors: usize,
    /// Percentage, two decimals.
    pub success_rate: f64,
    pub duration_ms: u64,
}

impl From<ScrapeStats> for ScrapeStatsResponse {
    fn from(s: ScrapeStats) -> Self {
        Self {
            total_found: s.total_found,
            successfully_scraped: s.successfully_scraped,
            errors: s.errors,
            success_rate: s.success_rate,
            duration_ms: s.duration_ms,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobResponse {
    pub id: Uuid,
    pub status: String,
    pub source: String,
    pub url: String,
    pub client_name: String,
    pub max_pages: Option<u32>,
    pub attempts: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub total_records: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Vec<Object>>)]
    pub result: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<ScrapeStatsResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobErrorResponse>,
    pub webhook_url: Option<String>,
    pub idempotency_key: String,
    pub delivery: Option<DeliveryResponse>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            status: job.status.to_string(),
            total_records: job.record_count(),
            source: job.target.source,
            url: job.target.url,
            client_name: job.target.client_name,
            max_pages: job.target.max_pages,
            attempts: job.attempts,
            max_retries: job.max_retries,
            created_at: job.created_at,
            updated_at: job.updated_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            next_attempt_at: job.next_attempt_at,
            result: job.result,
            stats: job.stats.map(ScrapeStatsResponse::from),
            error: job.error.map(JobErrorResponse::from),
            webhook_url: job.webhook_url,
            idempotency_key: job.idempotency_key,
            delivery: job.delivery.map(DeliveryResponse::from),
        }
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListJobsQuery {
    /// One of pending, running, retrying, succeeded, failed, cancelled.
    pub status: Option<String>,
    /// Source host, e.g. `example.com` (a leading `www.` is ignored).
    pub source: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct MetricsResponse {
    pub total_jobs: usize,
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_records: usize,
    /// Mean success rate of succeeded jobs that found detail pages.
    pub average_success_rate: f64,
    pub max_concurrent_jobs: usize,
    pub timestamp: DateTime<Utc>,
}

impl MetricsResponse {
    pub fn new(stats: JobStats, max_concurrent_jobs: usize) -> Self {
        Self {
            total_jobs: stats.total,
            pending: stats.pending,
            running: stats.running,
            retrying: stats.retrying,
            succeeded: stats.succeeded,
            failed: stats.failed,
            cancelled: stats.cancelled,
            total_records: stats.total_records,
            average_success_rate: stats.average_success_rate,
            max_concurrent_jobs,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
