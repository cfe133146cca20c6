#[cfg(feature = "browser")]
pub mod browser_fetcher;
pub mod extract;
pub mod fetcher;
pub mod runner;
pub mod selectors;
mod ssrf;
pub mod webhook;

#[cfg(feature = "browser")]
pub use browser_fetcher::BrowserFetcher;
pub use extract::{ExtractOptions, VehicleRecord, discover_links, extract_vehicle};
pub use fetcher::{PageFetcher, ReqwestFetcher};
pub use runner::ListingRunner;
pub use selectors::SelectorSet;
pub use webhook::HttpWebhookSender;
