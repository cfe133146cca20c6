use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::job::JobStatus;

/// Failure classes that drive retry and scheduling decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeouts, network blips, upstream 429s. Retried per the retry policy.
    Transient,
    /// Malformed target, site-structure change, authorization wall. Never retried.
    Permanent,
    /// No capacity right now (browser pool, worker slots). Not counted as an attempt.
    ResourceExhausted,
    /// Webhook unreachable. Confined to webhook delivery.
    DeliveryFailure,
    /// The job was cancelled on request.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::DeliveryFailure => "delivery_failure",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::DeliveryFailure)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application-wide error types for carscrape.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed (fetching a page).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// The source answered with a rate-limit response.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// The target URL or parameters cannot be scraped at all.
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// The page did not have the structure the extractor expects.
    #[error("Extraction error: {0}")]
    ExtractionError(String),

    /// The source refused access (login wall, 401/403, bot block).
    #[error("Blocked by source: {0}")]
    Blocked(String),

    /// The browser could not be launched or has no free sessions.
    #[error("Browser unavailable: {0}")]
    BrowserUnavailable(String),

    /// All execution slots are in use.
    #[error("Worker pool saturated")]
    PoolSaturated,

    /// Webhook delivery failed.
    #[error("Webhook error: {0}")]
    WebhookError(String),

    /// The attempt observed a cancellation signal.
    #[error("Cancelled")]
    Cancelled,

    #[error("Job not found: {0}")]
    NotFound(Uuid),

    /// Compare-and-set transition lost against a concurrent writer.
    #[error("Conflict on job {id}: expected {expected}, found {actual}")]
    Conflict {
        id: Uuid,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("Job {id} is already in terminal state: {status}")]
    AlreadyTerminal { id: Uuid, status: JobStatus },

    /// Configuration is missing or invalid.
    #[error("Config error: {0}")]
    ConfigError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Classify this error into the scheduling taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => {
                ErrorKind::Transient
            }
            AppError::HttpError(msg) => {
                if msg.contains("timeout")
                    || msg.contains("connect")
                    || msg.contains("reset")
                    || msg.contains("HTTP 5")
                {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                }
            }
            AppError::BrowserUnavailable(_) | AppError::PoolSaturated => {
                ErrorKind::ResourceExhausted
            }
            AppError::WebhookError(_) => ErrorKind::DeliveryFailure,
            AppError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Permanent,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}
