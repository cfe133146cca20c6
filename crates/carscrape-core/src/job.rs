use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

use crate::error::{AppError, ErrorKind};

/// One extracted listing. Opaque to the orchestrator.
pub type Record = serde_json::Value;

/// Status of a scrape job.
///
/// ```text
/// pending --dequeue--> running --success--> succeeded
///                      running --give up--> failed
///                      running --retry(d)--> retrying --after d--> pending
/// any non-terminal --cancel--> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Retrying => "retrying",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "retrying" => Ok(JobStatus::Retrying),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// What to scrape. `source` is the unit of rate limiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeTarget {
    pub source: String,
    pub url: String,
    #[serde(default)]
    pub filters: serde_json::Map<String, serde_json::Value>,
    pub max_pages: Option<u32>,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Extra CSS selectors merged into the extractor's defaults, keyed by field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_selectors: Option<HashMap<String, Vec<String>>>,
}

fn default_client_name() -> String {
    "default".to_string()
}

impl ScrapeTarget {
    /// Build a target from a listing URL, deriving `source` from its host.
    pub fn from_url(url: &str) -> Result<Self, AppError> {
        Ok(Self {
            source: source_key(url)?,
            url: url.to_string(),
            filters: serde_json::Map::new(),
            max_pages: None,
            client_name: default_client_name(),
            custom_selectors: None,
        })
    }

    pub fn with_filters(mut self, filters: serde_json::Map<String, serde_json::Value>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn with_custom_selectors(mut self, selectors: HashMap<String, Vec<String>>) -> Self {
        self.custom_selectors = Some(selectors);
        self
    }
}

/// Rate-limit key for a URL: lowercase host without a leading `www.`.
pub fn source_key(url: &str) -> Result<String, AppError> {
    let parsed =
        Url::parse(url).map_err(|e| AppError::InvalidTarget(format!("Invalid URL {url}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::InvalidTarget(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::InvalidTarget(format!("URL has no host: {url}")))?
        .to_lowercase();
    Ok(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

/// Stable webhook deduplication key for a job id (64-char hex).
pub fn idempotency_key(id: Uuid) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"job:");
    hasher.update(id.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Last failure recorded on a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Cancelled by request")
    }
}

impl From<&AppError> for JobError {
    fn from(err: &AppError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

/// Webhook bookkeeping kept on the job for inspection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryStatus {
    pub attempts: u32,
    pub delivered_at: Option<DateTime<Utc>>,
    pub last_status: Option<u16>,
    pub last_error: Option<String>,
}

/// Page counts of the successful attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeStats {
    pub total_found: usize,
    pub successfully_scraped: usize,
    pub errors: usize,
    /// Percentage of found pages that produced a record, two decimals.
    pub success_rate: f64,
    pub duration_ms: u64,
}

impl ScrapeStats {
    pub fn new(
        total_found: usize,
        successfully_scraped: usize,
        errors: usize,
        duration: std::time::Duration,
    ) -> Self {
        let success_rate = if total_found == 0 {
            0.0
        } else {
            (successfully_scraped as f64 * 10_000.0 / total_found as f64).round() / 100.0
        };
        Self {
            total_found,
            successfully_scraped,
            errors,
            success_rate,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// A scrape job and its lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub target: ScrapeTarget,
    pub status: JobStatus,
    /// Finished scrape attempts. Capacity rejections are not counted.
    pub attempts: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub result: Option<Vec<Record>>,
    /// Set together with `result`.
    #[serde(default)]
    pub stats: Option<ScrapeStats>,
    pub error: Option<JobError>,
    pub webhook_url: Option<String>,
    pub idempotency_key: String,
    pub delivery: Option<DeliveryStatus>,
}

impl Job {
    pub fn new(request: CreateJobRequest, default_max_retries: u32) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        Self {
            id,
            target: request.target,
            status: JobStatus::Pending,
            attempts: 0,
            max_retries: request.max_retries.unwrap_or(default_max_retries),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            next_attempt_at: None,
            result: None,
            stats: None,
            error: None,
            webhook_url: request.webhook_url,
            idempotency_key: idempotency_key(id),
            delivery: None,
        }
    }

    pub fn record_count(&self) -> usize {
        self.result.as_ref().map_or(0, Vec::len)
    }
}

/// Request to create a new scrape job.
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub target: ScrapeTarget,
    pub webhook_url: Option<String>,
    pub max_retries: Option<u32>,
}

impl CreateJobRequest {
    pub fn new(target: ScrapeTarget) -> Self {
        Self {
            target,
            webhook_url: None,
            max_retries: None,
        }
    }

    pub fn with_webhook(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Retrying,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            let parsed: JobStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("completed".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_source_key_normalizes_host() {
        assert_eq!(
            source_key("https://www.AutoCarro.com.br/carros?page=2").unwrap(),
            "autocarro.com.br"
        );
        assert_eq!(source_key("http://cars.example:8080/x").unwrap(), "cars.example");
        assert!(matches!(
            source_key("not a url"),
            Err(AppError::InvalidTarget(_))
        ));
        assert!(matches!(
            source_key("ftp://example.com"),
            Err(AppError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_idempotency_key_is_stable_per_id() {
        let id = Uuid::new_v4();
        assert_eq!(idempotency_key(id), idempotency_key(id));
        assert_eq!(idempotency_key(id).len(), 64);
        assert_ne!(idempotency_key(id), idempotency_key(Uuid::new_v4()));
    }

    #[test]
    fn test_new_job_defaults() {
        let target = ScrapeTarget::from_url("https://example.com/carros")
            .unwrap()
            .with_max_pages(5);
        let job = Job::new(
            CreateJobRequest::new(target).with_webhook("https://hooks.example/cb"),
            3,
        );

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.target.source, "example.com");
        assert_eq!(job.target.max_pages, Some(5));
        assert_eq!(job.idempotency_key, idempotency_key(job.id));
        assert!(job.result.is_none() && job.error.is_none());
    }

    #[test]
    fn test_scrape_stats_success_rate() {
        let stats = ScrapeStats::new(3, 2, 1, std::time::Duration::from_millis(1500));
        assert_eq!(stats.success_rate, 66.67);
        assert_eq!(stats.duration_ms, 1500);
        assert_eq!(ScrapeStats::new(0, 0, 0, Default::default()).success_rate, 0.0);
    }

    #[test]
    fn test_create_job_request_builder() {
        let target = ScrapeTarget::from_url("https://example.com").unwrap();
        let req = CreateJobRequest::new(target).with_max_retries(5);
        assert_eq!(req.max_retries, Some(5));
        assert!(req.webhook_url.is_none());
        assert_eq!(Job::new(req, 3).max_retries, 5);
    }
}
