use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::job::{Record, ScrapeTarget};
use crate::webhook::WebhookPayload;

/// Per-attempt knobs handed to a [`BrowserRunner`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub timeout: Duration,
    pub headless: bool,
    pub extract_images: bool,
    pub extract_optionals: bool,
    /// Upper bound on detail pages visited when the target sets none.
    pub max_pages: u32,
    /// Pause between consecutive detail pages of one attempt.
    pub page_delay: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            headless: true,
            extract_images: true,
            extract_optionals: true,
            max_pages: 50,
            page_delay: Duration::from_secs(2),
        }
    }
}

impl RunOptions {
    pub fn page_limit(&self, target: &ScrapeTarget) -> usize {
        target.max_pages.unwrap_or(self.max_pages) as usize
    }
}

/// What one successful attempt produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutput {
    pub records: Vec<Record>,
    /// Detail pages selected from the listing, after the page limit.
    pub links_found: usize,
    /// Detail pages that could not be loaded and were skipped.
    pub pages_failed: usize,
}

impl From<Vec<Record>> for RunOutput {
    fn from(records: Vec<Record>) -> Self {
        Self {
            links_found: records.len(),
            pages_failed: 0,
            records,
        }
    }
}

/// Executes one scrape attempt: one target in, records or a typed failure out.
///
/// Implementations must honour `options.timeout` and return promptly once
/// `cancel` fires. Session pooling is the implementation's own business.
pub trait BrowserRunner: Send + Sync + Clone + 'static {
    fn attempt(
        &self,
        target: &ScrapeTarget,
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<RunOutput, AppError>> + Send;
}

/// Fetches the HTML of a single page.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Response of one webhook POST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryResponse {
    pub status: u16,
}

impl DeliveryResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Performs a single webhook delivery attempt.
pub trait WebhookSender: Send + Sync + Clone + 'static {
    /// Errors are network-level failures; HTTP statuses come back as `Ok`.
    fn send(
        &self,
        url: &str,
        payload: &WebhookPayload,
    ) -> impl Future<Output = Result<DeliveryResponse, AppError>> + Send;
}
