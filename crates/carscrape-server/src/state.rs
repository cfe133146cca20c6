use carscrape_client::{ExtractOptions, HttpWebhookSender, ListingRunner, PageFetcher};
use carscrape_core::config::Settings;
use carscrape_core::error::AppError;
use carscrape_core::store::JobStore;
use carscrape_core::{Orchestrator, WebhookDispatcher};

pub type AppRunner = ListingRunner<PageFetcher>;
pub type AppOrchestrator = Orchestrator<AppRunner, HttpWebhookSender>;

/// Shared application state, available to all route handlers via `State<Arc<AppState>>`.
pub struct AppState {
    pub orchestrator: AppOrchestrator,
    /// Same runner the orchestrator uses, for one-off selector checks.
    pub runner: AppRunner,
    pub extract_options: ExtractOptions,
    /// Bearer token required on API routes (None = auth disabled).
    pub api_key: Option<String>,
}

impl AppState {
    /// Wire the orchestrator and its collaborators from settings.
    ///
    /// The orchestrator is built but not started; the caller spawns
    /// [`Orchestrator::run`].
    pub fn new(settings: &Settings, store: JobStore, fetcher: PageFetcher) -> Result<Self, AppError> {
        let runner = ListingRunner::new(fetcher);
        let sender = HttpWebhookSender::new(settings.webhook_timeout)?;
        let webhooks = WebhookDispatcher::new(sender, store.clone(), settings.webhook());
        let orchestrator =
            Orchestrator::new(store, runner.clone(), webhooks, settings.scheduler());

        let api_key = if settings.api_key_required {
            settings.api_key.clone()
        } else {
            None
        };

        Ok(Self {
            orchestrator,
            runner,
            extract_options: ExtractOptions {
                extract_images: settings.extract_images,
                extract_optionals: settings.extract_optionals,
            },
            api_key,
        })
    }
}
