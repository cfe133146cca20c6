use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use carscrape_core::error::AppError;
use carscrape_core::traits::Fetcher;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::sync::OnceCell;

/// Headless-browser fetcher using Chromium via the Chrome DevTools Protocol.
///
/// Unlike [`super::ReqwestFetcher`], this renders JavaScript before returning
/// the HTML, which most dealer sites need before their listing cards exist.
///
/// The Chromium process is launched lazily on the first fetch and shared by
/// every clone. A failed launch surfaces as [`AppError::BrowserUnavailable`]
/// and is retried on the next fetch, so a job that hits it is deferred
/// rather than failed. Internal addresses are refused before Chromium is
/// involved, as with the static fetcher.
///
/// # Example
///
/// ```rust,no_run
/// use carscrape_client::BrowserFetcher;
/// use carscrape_core::traits::Fetcher;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let fetcher = BrowserFetcher::new(true);
/// let html = fetcher.fetch("https://example.com").await?;
/// println!("{}", &html[..200]);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BrowserFetcher {
    browser: Arc<OnceCell<Browser>>,
    headless: bool,
    timeout: Duration,
    ssrf_protection: bool,
}

/// Upper bound for closing a tab once a page is done.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

impl BrowserFetcher {
    /// Fetcher with a **30 s** navigation timeout.
    pub fn new(headless: bool) -> Self {
        Self::with_timeout(headless, Duration::from_secs(30))
    }

    pub fn with_timeout(headless: bool, timeout: Duration) -> Self {
        Self {
            browser: Arc::new(OnceCell::new()),
            headless,
            timeout,
            ssrf_protection: true,
        }
    }

    /// Permit loopback and private-network targets.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    async fn browser(&self) -> Result<&Browser, AppError> {
        self.browser.get_or_try_init(|| self.launch()).await
    }

    async fn launch(&self) -> Result<Browser, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

        // Snap-packaged Chromium exposes a wrapper that rejects standard
        // Chrome CLI flags, so prefer the real binary when we can find it.
        if let Some(bin) = Self::find_chrome_binary() {
            tracing::info!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }

        builder = if self.headless {
            builder.arg("--headless=new")
        } else {
            builder.with_head()
        };

        let config = builder
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--no-first-run")
            .arg("--lang=pt-BR")
            .arg(format!("--user-agent={}", crate::fetcher::USER_AGENT))
            .build()
            .map_err(|e| AppError::BrowserUnavailable(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::BrowserUnavailable(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        tracing::info!(headless = self.headless, "Browser session started");
        Ok(browser)
    }

    /// Locate the real Chrome/Chromium binary, honouring `CHROME_BIN` first.
    ///
    /// Returns `None` to let `chromiumoxide` do its own lookup.
    fn find_chrome_binary() -> Option<PathBuf> {
        let candidates: &[&str] = &[
            "/snap/chromium/current/usr/lib/chromium-browser/chrome",
            "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
        ];

        if let Ok(p) = std::env::var("CHROME_BIN") {
            let path = PathBuf::from(&p);
            if path.exists() {
                return Some(path);
            }
        }

        candidates.iter().map(PathBuf::from).find(|p| p.exists())
    }
}

/// Navigate an open tab and return the rendered HTML.
async fn render(page: &Page, url: &str) -> Result<String, AppError> {
    page.goto(url)
        .await
        .map_err(|e| AppError::NetworkError(format!("Failed to navigate to {url}: {e}")))?;

    // <body> present is the minimal signal that the page rendered.
    page.find_element("body")
        .await
        .map_err(|e| AppError::NetworkError(format!("Page did not render body: {e}")))?;

    page.content()
        .await
        .map_err(|e| AppError::NetworkError(format!("Failed to read page content: {e}")))
}

impl Fetcher for BrowserFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        if self.ssrf_protection {
            crate::ssrf::check_target(url).await?;
        }

        let browser = self.browser().await?;
        let timeout = self.timeout;

        let page = tokio::time::timeout(timeout, browser.new_page("about:blank"))
            .await
            .map_err(|_| AppError::Timeout(timeout.as_secs()))?
            .map_err(|e| AppError::BrowserUnavailable(format!("Failed to open tab: {e}")))?;

        // The tab is closed on every path, including errors and timeouts.
        let html = tokio::time::timeout(timeout, render(&page, url))
            .await
            .unwrap_or(Err(AppError::Timeout(timeout.as_secs())));

        match tokio::time::timeout(CLOSE_TIMEOUT, page.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(url, error = %e, "Failed to close browser tab"),
            Err(_) => tracing::debug!(url, "Timed out closing browser tab"),
        }
        html
    }
}
