use std::time::Duration;

use carscrape_core::config::Settings;
use carscrape_core::error::AppError;
use carscrape_core::traits::Fetcher;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};

/// Upper bound for loading a single page.
pub const PAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Desktop browser identity; several listing sites serve bots a stripped page.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                              (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Static-HTML fetcher using reqwest.
///
/// Downloads raw HTML with a browser-like User-Agent and `pt-BR` language
/// preference. URLs that resolve to internal addresses are refused as
/// invalid targets unless [`allow_private_urls`](Self::allow_private_urls)
/// was called.
///
/// Response statuses are mapped onto the job error taxonomy: 401/403 become
/// [`AppError::Blocked`], 429 becomes [`AppError::RateLimitExceeded`], and
/// everything else non-2xx is an [`AppError::HttpError`] carrying the code.
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: Client,
    timeout_secs: u64,
    ssrf_protection: bool,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(PAGE_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("pt-BR,pt;q=0.9,en;q=0.5"));

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            timeout_secs: timeout.as_secs(),
            ssrf_protection: true,
        })
    }

    /// Permit loopback and private-network targets (local fixtures, intranets).
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }
}

/// Map a non-success status to the error the scheduler should see.
pub(crate) fn status_error(status: StatusCode, url: &str) -> AppError {
    match status.as_u16() {
        401 | 403 => AppError::Blocked(format!("HTTP {} for {url}", status.as_u16())),
        429 => AppError::RateLimitExceeded,
        code => AppError::HttpError(format!("HTTP {code} for {url}")),
    }
}

impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        if self.ssrf_protection {
            crate::ssrf::check_target(url).await?;
        }

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout_secs)
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection failed: {e}"))
            } else {
                AppError::HttpError(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, url));
        }

        response
            .text()
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to read response body: {e}")))
    }
}

/// Fetcher chosen at startup: static HTTP, or Chromium when built with the
/// `browser` feature.
#[derive(Clone)]
pub enum PageFetcher {
    Static(ReqwestFetcher),
    #[cfg(feature = "browser")]
    Browser(crate::browser_fetcher::BrowserFetcher),
}

impl PageFetcher {
    /// Chromium when built with `browser`, static HTTP otherwise.
    ///
    /// Each page load gets at most [`PAGE_TIMEOUT`], and never more than
    /// the whole attempt's `REQUEST_TIMEOUT`.
    pub fn from_settings(settings: &Settings) -> Result<Self, AppError> {
        let timeout = settings.request_timeout.min(PAGE_TIMEOUT);
        #[cfg(feature = "browser")]
        let fetcher = PageFetcher::Browser(crate::browser_fetcher::BrowserFetcher::with_timeout(
            settings.headless,
            timeout,
        ));
        #[cfg(not(feature = "browser"))]
        let fetcher = PageFetcher::Static(ReqwestFetcher::with_timeout(timeout)?);
        Ok(fetcher)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PageFetcher::Static(_) => "static",
            #[cfg(feature = "browser")]
            PageFetcher::Browser(_) => "browser",
        }
    }
}

impl Fetcher for PageFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        match self {
            PageFetcher::Static(fetcher) => fetcher.fetch(url).await,
            #[cfg(feature = "browser")]
            PageFetcher::Browser(fetcher) => fetcher.fetch(url).await,
        }
    }
}
