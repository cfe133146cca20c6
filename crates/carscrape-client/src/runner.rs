use std::collections::HashMap;

use carscrape_core::error::AppError;
use carscrape_core::job::ScrapeTarget;
use carscrape_core::traits::{BrowserRunner, Fetcher, RunOptions, RunOutput};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::extract::{ExtractOptions, VehicleRecord, discover_links, extract_vehicle};
use crate::selectors::SelectorSet;

/// Scrapes one listing page and every vehicle detail page it links to.
///
/// Generic over the [`Fetcher`] so the same flow runs on plain HTTP, a
/// headless browser, or a scripted fetcher in tests.
#[derive(Clone)]
pub struct ListingRunner<F: Fetcher> {
    fetcher: F,
}

impl<F: Fetcher> ListingRunner<F> {
    pub fn new(fetcher: F) -> Self {
        Self { fetcher }
    }

    /// Fetch a single detail page and extract it, without any scheduling.
    ///
    /// Used to check a selector set against a live page.
    pub async fn test_page(
        &self,
        url: &str,
        custom_selectors: Option<&HashMap<String, Vec<String>>>,
        options: ExtractOptions,
    ) -> Result<VehicleRecord, AppError> {
        let page_url = parse_url(url)?;
        let selectors = selector_set(custom_selectors);
        let html = self.fetcher.fetch(url).await?;
        Ok(extract_vehicle(&html, &page_url, &selectors, options))
    }

    async fn fetch_or_cancel(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<String, AppError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AppError::Cancelled),
            html = self.fetcher.fetch(url) => html,
        }
    }

    async fn scrape(
        &self,
        target: &ScrapeTarget,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunOutput, AppError> {
        let base_url = listing_url(target)?;
        let selectors = selector_set(target.custom_selectors.as_ref());
        let extract_options = ExtractOptions {
            extract_images: options.extract_images,
            extract_optionals: options.extract_optionals,
        };

        let listing = self.fetch_or_cancel(base_url.as_str(), cancel).await?;
        let links = discover_links(&listing, &base_url, &selectors, options.page_limit(target));
        if links.is_empty() {
            return Err(AppError::ExtractionError(format!(
                "No vehicle links found on {}",
                target.url
            )));
        }
        tracing::info!(url = %target.url, links = links.len(), "Discovered vehicle links");

        let mut records = Vec::with_capacity(links.len());
        let mut pages_failed = 0;
        let mut last_error = None;
        for (i, link) in links.iter().enumerate() {
            if i > 0 && !options.page_delay.is_zero() {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(AppError::Cancelled),
                    () = tokio::time::sleep(options.page_delay) => {}
                }
            }

            let page = match self.fetch_or_cancel(link, cancel).await {
                Ok(html) => html,
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => {
                    tracing::warn!(url = %link, error = %e, "Skipping vehicle page");
                    pages_failed += 1;
                    last_error = Some(e);
                    continue;
                }
            };

            let page_url = parse_url(link)?;
            let vehicle = extract_vehicle(&page, &page_url, &selectors, extract_options);
            tracing::debug!(url = %link, title = ?vehicle.title, "Extracted vehicle");
            records.push(serde_json::to_value(vehicle)?);
        }

        // Every detail page failed: report why so the scheduler can retry.
        match last_error {
            Some(e) if records.is_empty() => Err(e),
            _ => {
                tracing::info!(
                    url = %target.url,
                    scraped = records.len(),
                    failed = pages_failed,
                    "Listing scraped"
                );
                Ok(RunOutput {
                    records,
                    links_found: links.len(),
                    pages_failed,
                })
            }
        }
    }
}

impl<F: Fetcher + 'static> BrowserRunner for ListingRunner<F> {
    async fn attempt(
        &self,
        target: &ScrapeTarget,
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunOutput, AppError> {
        match tokio::time::timeout(options.timeout, self.scrape(target, options, &cancel)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AppError::Timeout(options.timeout.as_secs())),
        }
    }
}

fn parse_url(url: &str) -> Result<Url, AppError> {
    Url::parse(url).map_err(|e| AppError::InvalidTarget(format!("Invalid URL '{url}': {e}")))
}

/// The listing URL with the target's filters appended as query parameters.
///
/// Keys are added in sorted order. Arrays become repeated parameters; `null`
/// and nested objects are ignored.
fn listing_url(target: &ScrapeTarget) -> Result<Url, AppError> {
    let mut url = parse_url(&target.url)?;
    if target.filters.is_empty() {
        return Ok(url);
    }

    let mut filters: Vec<_> = target.filters.iter().collect();
    filters.sort_by(|a, b| a.0.cmp(b.0));

    let mut pairs: Vec<(&str, String)> = Vec::new();
    for (key, value) in filters {
        let key = key.as_str();
        let values: Vec<&serde_json::Value> = match value {
            serde_json::Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        for value in values {
            match value {
                serde_json::Value::String(s) => pairs.push((key, s.clone())),
                serde_json::Value::Number(n) => pairs.push((key, n.to_string())),
                serde_json::Value::Bool(b) => pairs.push((key, b.to_string())),
                _ => tracing::debug!(filter = %key, "Ignoring non-scalar filter value"),
            }
        }
    }
    if !pairs.is_empty() {
        url.query_pairs_mut().extend_pairs(pairs);
    }
    Ok(url)
}

fn selector_set(custom: Option<&HashMap<String, Vec<String>>>) -> SelectorSet {
    match custom {
        Some(custom) => SelectorSet::default().merged_with(custom),
        None => SelectorSet::default(),
    }
}
