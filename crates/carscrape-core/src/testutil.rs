//! Test utilities: mock implementations of the core capability traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::job::{CreateJobRequest, Job, Record, ScrapeTarget};
use crate::scheduler::{SchedulerEvent, SchedulerReporter};
use crate::traits::{BrowserRunner, DeliveryResponse, RunOptions, RunOutput, WebhookSender};
use crate::webhook::WebhookPayload;

// ---------------------------------------------------------------------------
// MockRunner
// ---------------------------------------------------------------------------

/// Mock browser runner with scripted outcomes.
///
/// Each attempt pops the next queued outcome; once the queue is empty every
/// attempt succeeds with a single record echoing the target URL.
#[derive(Clone, Default)]
pub struct MockRunner {
    responses: Arc<Mutex<VecDeque<Result<RunOutput, AppError>>>>,
    delay: Duration,
    honour_cancel: bool,
    calls: Arc<Mutex<Vec<Instant>>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    cancellations: Arc<AtomicUsize>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self {
            honour_cancel: true,
            ..Self::default()
        }
    }

    pub fn with_responses(responses: Vec<Result<Vec<Record>, AppError>>) -> Self {
        Self::with_outputs(
            responses
                .into_iter()
                .map(|r| r.map(RunOutput::from))
                .collect(),
        )
    }

    /// Script full attempt outputs, page counts included.
    pub fn with_outputs(outputs: Vec<Result<RunOutput, AppError>>) -> Self {
        let runner = Self::new();
        *runner.responses.lock().unwrap() = outputs.into();
        runner
    }

    /// Make each attempt take `delay` before reporting its outcome.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Keep running through cancellation, like a runner that checks too late.
    pub fn ignoring_cancel(mut self) -> Self {
        self.honour_cancel = false;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Start time of every attempt, in call order.
    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of attempts observed running at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Attempts that stopped early because their token fired.
    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }
}

impl BrowserRunner for MockRunner {
    async fn attempt(
        &self,
        target: &ScrapeTarget,
        _options: &RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunOutput, AppError> {
        self.calls.lock().unwrap().push(Instant::now());
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        let cancelled = if self.honour_cancel {
            tokio::select! {
                () = tokio::time::sleep(self.delay) => false,
                () = cancel.cancelled() => true,
            }
        } else {
            tokio::time::sleep(self.delay).await;
            false
        };
        self.active.fetch_sub(1, Ordering::SeqCst);

        if cancelled {
            self.cancellations.fetch_add(1, Ordering::SeqCst);
            return Err(AppError::Cancelled);
        }

        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(vec![serde_json::json!({ "url": target.url })].into()))
    }
}

// ---------------------------------------------------------------------------
// MockWebhookSender
// ---------------------------------------------------------------------------

/// Mock webhook sender that records payloads and replays scripted responses.
///
/// Responds 200 once the script is exhausted.
#[derive(Clone, Default)]
pub struct MockWebhookSender {
    responses: Arc<Mutex<VecDeque<Result<u16, AppError>>>>,
    sent: Arc<Mutex<Vec<(String, WebhookPayload)>>>,
}

impl MockWebhookSender {
    pub fn with_statuses(statuses: Vec<u16>) -> Self {
        Self::with_responses(statuses.into_iter().map(Ok).collect())
    }

    pub fn with_responses(responses: Vec<Result<u16, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            sent: Arc::default(),
        }
    }

    /// Every `(url, payload)` sent so far.
    pub fn sent(&self) -> Vec<(String, WebhookPayload)> {
        self.sent.lock().unwrap().clone()
    }
}

impl WebhookSender for MockWebhookSender {
    async fn send(
        &self,
        url: &str,
        payload: &WebhookPayload,
    ) -> Result<DeliveryResponse, AppError> {
        self.sent
            .lock()
            .unwrap()
            .push((url.to_string(), payload.clone()));
        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or(Ok(200))
            .map(|status| DeliveryResponse { status })
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// Scheduler reporter that records event names.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn has(&self, name: &str) -> bool {
        self.events.lock().unwrap().iter().any(|e| e == name)
    }
}

impl SchedulerReporter for RecordingReporter {
    fn report(&self, event: SchedulerEvent<'_>) {
        let label = match &event {
            SchedulerEvent::Started { .. } => "Started",
            SchedulerEvent::JobSubmitted { .. } => "JobSubmitted",
            SchedulerEvent::JobDispatched { .. } => "JobDispatched",
            SchedulerEvent::JobSucceeded { .. } => "JobSucceeded",
            SchedulerEvent::JobRetrying { .. } => "JobRetrying",
            SchedulerEvent::JobFailed { .. } => "JobFailed",
            SchedulerEvent::JobCancelled { .. } => "JobCancelled",
            SchedulerEvent::JobRequeued { .. } => "JobRequeued",
            SchedulerEvent::JobHeld { .. } => "JobHeld",
            SchedulerEvent::OutcomeDiscarded { .. } => "OutcomeDiscarded",
            SchedulerEvent::ShuttingDown { .. } => "ShuttingDown",
            SchedulerEvent::Stopped => "Stopped",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// Create a pending job whose target host is `source`.
pub fn make_test_job(source: &str) -> Job {
    let target = ScrapeTarget::from_url(&format!("https://{source}/carros"))
        .expect("test source must form a valid URL");
    Job::new(CreateJobRequest::new(target), 3)
}
