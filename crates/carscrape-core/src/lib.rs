pub mod config;
pub mod error;
pub mod job;
pub mod rate_limit;
pub mod retention;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod traits;
pub mod webhook;

#[cfg(test)]
pub mod testutil;

pub use config::Settings;
pub use error::{AppError, ErrorKind};
pub use job::{CreateJobRequest, Job, JobError, JobStatus, Record, ScrapeTarget};
pub use retention::{RetentionSweeper, SweepReport};
pub use scheduler::{Orchestrator, SchedulerConfig, SchedulerReporter, TracingReporter};
pub use store::{JobFilter, JobStats, JobStore};
pub use traits::{BrowserRunner, DeliveryResponse, Fetcher, RunOptions, WebhookSender};
pub use webhook::{WebhookDispatcher, WebhookPayload};
