use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use carscrape_client::{ExtractOptions, HttpWebhookSender, ListingRunner, PageFetcher};
use carscrape_core::config::Settings;
use carscrape_core::job::{CreateJobRequest, JobStatus, ScrapeTarget};
use carscrape_core::retention::RetentionSweeper;
use carscrape_core::store::JobStore;
use carscrape_core::{Orchestrator, WebhookDispatcher};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const WEBHOOK_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "carscrape", version, about = "Vehicle listing scraper")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape a listing page through the job orchestrator and print the vehicles
    Scrape {
        /// Listing page URL
        #[arg(short, long)]
        url: String,

        /// Maximum number of vehicle pages to visit
        #[arg(short, long, env = "DEFAULT_MAX_PAGES")]
        max_pages: Option<u32>,

        /// JSON file mapping field names to extra CSS selectors
        #[arg(short, long)]
        selectors: Option<PathBuf>,

        /// POST the finished job here as well
        #[arg(long)]
        webhook_url: Option<String>,

        /// Retry budget for this job (defaults to MAX_RETRIES)
        #[arg(long)]
        max_retries: Option<u32>,

        /// Write records to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Extract one vehicle page with the given selectors, without creating a job
    TestSelectors {
        /// Vehicle detail page URL
        #[arg(short, long)]
        url: String,

        /// JSON file mapping field names to extra CSS selectors
        #[arg(short, long)]
        selectors: Option<PathBuf>,
    },

    /// Run one retention sweep over the job snapshot and log directory
    Sweep {
        /// Job snapshot to prune
        #[arg(long, env = "SNAPSHOT_PATH")]
        snapshot: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("carscrape=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env().context("Invalid configuration")?;

    match cli.command {
        Commands::Scrape {
            url,
            max_pages,
            selectors,
            webhook_url,
            max_retries,
            output,
        } => {
            let mut target = ScrapeTarget::from_url(&url)?;
            if let Some(max_pages) = max_pages {
                target = target.with_max_pages(max_pages);
            }
            if let Some(path) = selectors {
                target = target.with_custom_selectors(load_selectors(&path)?);
            }
            let mut request = CreateJobRequest::new(target);
            if let Some(hook) = webhook_url {
                request = request.with_webhook(hook);
            }
            if let Some(max) = max_retries {
                request = request.with_max_retries(max);
            }
            cmd_scrape(&settings, request, output.as_deref()).await?;
        }
        Commands::TestSelectors { url, selectors } => {
            let selectors = selectors.as_deref().map(load_selectors).transpose()?;
            cmd_test_selectors(&settings, &url, selectors.as_ref()).await?;
        }
        Commands::Sweep { snapshot } => {
            cmd_sweep(&settings, snapshot)?;
        }
    }

    Ok(())
}

/// Read a `{ "field": ["selector", ...] }` JSON file.
fn load_selectors(path: &Path) -> Result<HashMap<String, Vec<String>>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read selectors file: {}", path.display()))?;
    serde_json::from_str(&raw).context("Selectors file must map field names to arrays of CSS selectors")
}

async fn cmd_scrape(
    settings: &Settings,
    request: CreateJobRequest,
    output: Option<&Path>,
) -> Result<()> {
    let store = JobStore::new();
    let runner = ListingRunner::new(PageFetcher::from_settings(settings)?);
    let sender = HttpWebhookSender::new(settings.webhook_timeout)?;
    let webhooks = WebhookDispatcher::new(sender, store.clone(), settings.webhook());
    let orchestrator = Orchestrator::new(store, runner, webhooks, settings.scheduler());

    let shutdown = CancellationToken::new();
    let scheduler = {
        let orchestrator = orchestrator.clone();
        let token = shutdown.child_token();
        tokio::spawn(async move { orchestrator.run(token).await })
    };

    let job = orchestrator.submit(request)?;
    tracing::info!(job_id = %job.id, url = %job.target.url, "Scrape submitted");

    let job = loop {
        let current = orchestrator.get(job.id)?;
        if current.status.is_terminal() {
            break current;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };

    shutdown.cancel();
    scheduler.await??;
    if tokio::time::timeout(WEBHOOK_FLUSH_TIMEOUT, orchestrator.flush_webhooks())
        .await
        .is_err()
    {
        tracing::warn!("Gave up waiting for webhook delivery");
    }

    if job.status != JobStatus::Succeeded {
        let reason = job
            .error
            .map(|e| format!("{} ({})", e.message, e.kind))
            .unwrap_or_else(|| job.status.to_string());
        anyhow::bail!("Scrape failed after {} attempt(s): {reason}", job.attempts);
    }

    let records = job.result.unwrap_or_default();
    tracing::info!(records = records.len(), attempts = job.attempts, "Scrape complete");

    let body = serde_json::to_string_pretty(&records)?;
    match output {
        Some(path) => {
            std::fs::write(path, body)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), "Records written");
        }
        None => println!("{body}"),
    }

    Ok(())
}

async fn cmd_test_selectors(
    settings: &Settings,
    url: &str,
    selectors: Option<&HashMap<String, Vec<String>>>,
) -> Result<()> {
    let runner = ListingRunner::new(PageFetcher::from_settings(settings)?);
    let options = ExtractOptions {
        extract_images: settings.extract_images,
        extract_optionals: settings.extract_optionals,
    };

    let vehicle = runner.test_page(url, selectors, options).await?;
    println!("{}", serde_json::to_string_pretty(&vehicle)?);
    Ok(())
}

fn cmd_sweep(settings: &Settings, snapshot: Option<PathBuf>) -> Result<()> {
    let store = match snapshot {
        Some(path) => JobStore::open(&path)
            .with_context(|| format!("Failed to load snapshot {}", path.display()))?,
        None => {
            tracing::warn!("No snapshot configured; only log files will be swept");
            JobStore::new()
        }
    };

    let report = RetentionSweeper::new(store, settings.retention()).sweep_once()?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
