/// Smoke-test for `BrowserFetcher` driving a `ListingRunner`.
///
/// Launches Chromium, scrapes up to three vehicles from the given listing
/// page, and prints them as JSON.
///
/// Run with:
///   cargo run --example browser_smoke --features browser -- <listing-url>
use carscrape_client::{BrowserFetcher, ListingRunner};
use carscrape_core::job::ScrapeTarget;
use carscrape_core::traits::{BrowserRunner, RunOptions};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let url = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: browser_smoke <listing-url>"))?;

    let runner = ListingRunner::new(BrowserFetcher::new(true));
    let target = ScrapeTarget::from_url(&url)?.with_max_pages(3);
    let output = runner
        .attempt(&target, &RunOptions::default(), CancellationToken::new())
        .await?;

    anyhow::ensure!(!output.records.is_empty(), "no vehicles extracted from {url}");
    eprintln!(
        "{} of {} detail pages scraped",
        output.records.len(),
        output.links_found
    );
    println!("{}", serde_json::to_string_pretty(&output.records)?);
    Ok(())
}
