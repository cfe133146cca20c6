//! Asynchronous webhook delivery for finished jobs.
//!
//! Delivery is at-least-once: every attempt for a job carries the same
//! `idempotency_key`, and receivers are expected to deduplicate on it.
//! Attempts are counted separately from the job's scrape attempts and a
//! failed delivery never touches the job's scrape status; the outcome is
//! only recorded in [`Job::delivery`](crate::job::Job::delivery).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::error::{AppError, ErrorKind};
use crate::job::{DeliveryStatus, Job, JobError, JobStatus, Record, ScrapeStats};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::JobStore;
use crate::traits::WebhookSender;

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// `max_retries` is the total number of delivery attempts.
    pub retry_policy: RetryPolicy,
    pub timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::new(5, Duration::from_secs(2), Duration::from_secs(300)),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadStats {
    pub attempts: u32,
    pub total_records: usize,
    pub source: String,
    pub url: String,
    pub client_name: String,
    /// Page counts, present for succeeded jobs.
    #[serde(flatten, default, skip_serializing_if = "Option::is_none")]
    pub scrape: Option<ScrapeStats>,
}

/// Body POSTed to a job's `webhook_url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub job_id: Uuid,
    pub idempotency_key: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<Record>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stats: PayloadStats,
}

impl WebhookPayload {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            idempotency_key: job.idempotency_key.clone(),
            status: job.status,
            result: job.result.clone(),
            error: job.error.clone(),
            completed_at: job.completed_at,
            stats: PayloadStats {
                attempts: job.attempts,
                total_records: job.record_count(),
                source: job.target.source.clone(),
                url: job.target.url.clone(),
                client_name: job.target.client_name.clone(),
                scrape: job.stats.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Status(u16),
    Error(String),
}

/// One delivery attempt, kept only while the delivery loop runs.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    pub job_id: Uuid,
    pub attempt_no: u32,
    pub sent_at: DateTime<Utc>,
    pub outcome: DeliveryOutcome,
}

impl WebhookDelivery {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, DeliveryOutcome::Status(code) if (200..300).contains(&code))
    }

    fn error_message(&self) -> Option<String> {
        match &self.outcome {
            DeliveryOutcome::Status(code) if (200..300).contains(code) => None,
            DeliveryOutcome::Status(code) => Some(format!("Webhook responded with HTTP {code}")),
            DeliveryOutcome::Error(msg) => Some(msg.clone()),
        }
    }
}

/// Fires webhook deliveries in the background with bounded retries.
#[derive(Clone)]
pub struct WebhookDispatcher<S: WebhookSender> {
    sender: S,
    store: JobStore,
    config: WebhookConfig,
    tasks: TaskTracker,
}

impl<S: WebhookSender> WebhookDispatcher<S> {
    pub fn new(sender: S, store: JobStore, config: WebhookConfig) -> Self {
        Self {
            sender,
            store,
            config,
            tasks: TaskTracker::new(),
        }
    }

    /// Start delivering `job`'s terminal payload. Returns immediately.
    ///
    /// Returns `None` if the job has no webhook URL. The handle resolves to
    /// `true` once a 2xx response was received.
    pub fn notify(&self, job: &Job) -> Option<JoinHandle<bool>> {
        let url = job.webhook_url.clone()?;
        let payload = WebhookPayload::from_job(job);
        let this = self.clone();
        Some(
            self.tasks
                .spawn(async move { this.deliver(&url, payload).await }),
        )
    }

    /// Number of deliveries still in flight.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Stop accepting new work and wait for in-flight deliveries.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn deliver(&self, url: &str, payload: WebhookPayload) -> bool {
        let policy = self.config.retry_policy;
        let mut attempt_no = 0u32;

        loop {
            attempt_no += 1;
            let sent_at = Utc::now();
            let outcome =
                match tokio::time::timeout(self.config.timeout, self.sender.send(url, &payload))
                    .await
                {
                    Ok(Ok(response)) => DeliveryOutcome::Status(response.status),
                    Ok(Err(e)) => DeliveryOutcome::Error(e.to_string()),
                    Err(_) => DeliveryOutcome::Error(
                        AppError::Timeout(self.config.timeout.as_secs()).to_string(),
                    ),
                };

            let delivery = WebhookDelivery {
                job_id: payload.job_id,
                attempt_no,
                sent_at,
                outcome,
            };
            self.record(payload.status, &delivery);

            if delivery.is_success() {
                tracing::info!(
                    job_id = %payload.job_id,
                    attempt = attempt_no,
                    "Webhook delivered"
                );
                return true;
            }

            let error = delivery.error_message().unwrap_or_default();
            match policy.decide(attempt_no, ErrorKind::DeliveryFailure) {
                RetryDecision::GiveUp => {
                    tracing::warn!(
                        job_id = %payload.job_id,
                        attempts = attempt_no,
                        %error,
                        "Webhook delivery abandoned"
                    );
                    return false;
                }
                RetryDecision::RetryAfter(delay) => {
                    tracing::debug!(
                        job_id = %payload.job_id,
                        attempt = attempt_no,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "Webhook delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Summarise the attempt on the job without changing its status.
    fn record(&self, status: JobStatus, delivery: &WebhookDelivery) {
        let result = self
            .store
            .transition(delivery.job_id, status, status, |job| {
                let summary = job.delivery.get_or_insert_with(DeliveryStatus::default);
                summary.attempts = delivery.attempt_no;
                match &delivery.outcome {
                    DeliveryOutcome::Status(code) => summary.last_status = Some(*code),
                    DeliveryOutcome::Error(_) => summary.last_status = None,
                }
                if delivery.is_success() {
                    summary.delivered_at = Some(delivery.sent_at);
                    summary.last_error = None;
                } else {
                    summary.last_error = delivery.error_message();
                }
            });

        if let Err(e) = result {
            tracing::debug!(job_id = %delivery.job_id, error = %e, "Could not record webhook delivery");
        }
    }
}
