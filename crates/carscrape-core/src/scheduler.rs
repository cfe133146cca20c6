//! Job orchestration: admission, dispatch, retries, and cancellation.
//!
//! The [`Orchestrator`] owns no job state of its own. Every decision it
//! makes is written back through [`JobStore::transition`], so a cancel
//! request racing a finishing attempt resolves to exactly one winner.
//!
//! ```text
//!              submit                 slot free + rate token
//!   client ───────────► pending ─────────────────────────────► running
//!                       ▲  ▲                                      │
//!   delay elapsed (timer)  │  └──────── runner out of capacity ───────┤
//!                          │            (held until delay elapses)    │ outcome
//!                          │                                          ▼
//!                      retrying ◄──────── transient ─────────── decide ──► succeeded | failed
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use futures::StreamExt;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tokio_util::time::DelayQueue;
use uuid::Uuid;

use crate::error::{AppError, ErrorKind};
use crate::job::{CreateJobRequest, Job, JobError, JobStatus, ScrapeStats, source_key};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::{JobFilter, JobStats, JobStore};
use crate::traits::{BrowserRunner, RunOptions, RunOutput, WebhookSender};
use crate::webhook::WebhookDispatcher;

/// Orchestrator settings, usually built by [`Settings::scheduler`](crate::config::Settings::scheduler).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_jobs: usize,
    /// Hard ceiling on a single attempt, enforced around the runner.
    pub request_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub rate_limit: RateLimitConfig,
    pub run_options: RunOptions,
    pub enable_webhook_callbacks: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            request_timeout: Duration::from_secs(300),
            retry_policy: RetryPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            run_options: RunOptions::default(),
            enable_webhook_callbacks: true,
        }
    }
}

/// Events emitted by the orchestrator for monitoring/logging.
#[derive(Debug, Clone)]
pub enum SchedulerEvent<'a> {
    Started {
        max_concurrent_jobs: usize,
    },
    JobSubmitted {
        job: &'a Job,
    },
    JobDispatched {
        job_id: Uuid,
        source: &'a str,
        attempt: u32,
    },
    JobSucceeded {
        job_id: Uuid,
        attempts: u32,
        records: usize,
    },
    JobRetrying {
        job_id: Uuid,
        attempts: u32,
        delay: Duration,
        error: &'a str,
    },
    JobFailed {
        job_id: Uuid,
        attempts: u32,
        error: &'a JobError,
    },
    JobCancelled {
        job_id: Uuid,
        previous: JobStatus,
    },
    JobRequeued {
        job_id: Uuid,
    },
    /// Runner had no capacity; the job stays `pending` without spending an attempt.
    JobHeld {
        job_id: Uuid,
        delay: Duration,
        error: &'a str,
    },
    /// An attempt finished after its job left `running`; the outcome was dropped.
    OutcomeDiscarded {
        job_id: Uuid,
        status: JobStatus,
    },
    ShuttingDown {
        in_flight: usize,
    },
    Stopped,
}

/// Trait for receiving orchestrator events (decoupled logging).
pub trait SchedulerReporter: Send + Sync + 'static {
    fn report(&self, event: SchedulerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl SchedulerReporter for TracingReporter {
    fn report(&self, event: SchedulerEvent<'_>) {
        match event {
            SchedulerEvent::Started {
                max_concurrent_jobs,
            } => {
                tracing::info!(%max_concurrent_jobs, "Scheduler started");
            }
            SchedulerEvent::JobSubmitted { job } => {
                tracing::info!(
                    job_id = %job.id,
                    source = %job.target.source,
                    url = %job.target.url,
                    "Job submitted"
                );
            }
            SchedulerEvent::JobDispatched {
                job_id,
                source,
                attempt,
            } => {
                tracing::info!(%job_id, %source, %attempt, "Job dispatched");
            }
            SchedulerEvent::JobSucceeded {
                job_id,
                attempts,
                records,
            } => {
                tracing::info!(%job_id, %attempts, %records, "Job succeeded");
            }
            SchedulerEvent::JobRetrying {
                job_id,
                attempts,
                delay,
                error,
            } => {
                tracing::warn!(
                    %job_id,
                    %attempts,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "Job attempt failed, retrying"
                );
            }
            SchedulerEvent::JobFailed {
                job_id,
                attempts,
                error,
            } => {
                tracing::error!(
                    %job_id,
                    %attempts,
                    kind = %error.kind,
                    error = %error.message,
                    "Job failed"
                );
            }
            SchedulerEvent::JobCancelled { job_id, previous } => {
                tracing::info!(%job_id, %previous, "Job cancelled");
            }
            SchedulerEvent::JobRequeued { job_id } => {
                tracing::debug!(%job_id, "Job requeued");
            }
            SchedulerEvent::JobHeld {
                job_id,
                delay,
                error,
            } => {
                tracing::info!(
                    %job_id,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "Runner out of capacity, job held"
                );
            }
            SchedulerEvent::OutcomeDiscarded { job_id, status } => {
                tracing::info!(%job_id, %status, "Discarded late attempt outcome");
            }
            SchedulerEvent::ShuttingDown { in_flight } => {
                tracing::info!(%in_flight, "Scheduler shutting down");
            }
            SchedulerEvent::Stopped => {
                tracing::info!("Scheduler stopped");
            }
        }
    }
}

/// Result of scanning the pending queue for work.
enum Claim {
    Job(Job),
    /// Nothing dispatchable. `reopen_at` is the earliest rate-window reset
    /// among the sources that were turned away.
    Idle { reopen_at: Option<Instant> },
}

struct Inner<R: BrowserRunner, S: WebhookSender> {
    store: JobStore,
    runner: R,
    limiter: RateLimiter,
    webhooks: WebhookDispatcher<S>,
    config: SchedulerConfig,
    slots: Arc<Semaphore>,
    wake: Notify,
    running: Mutex<HashMap<Uuid, CancellationToken>>,
    /// Pending jobs skipped by dispatch until their timer entry fires.
    held: Mutex<HashSet<Uuid>>,
    requeue_tx: mpsc::UnboundedSender<(Uuid, Duration)>,
    requeue_rx: Mutex<Option<mpsc::UnboundedReceiver<(Uuid, Duration)>>>,
    reporter: Arc<dyn SchedulerReporter>,
}

/// Concurrent scrape-job orchestrator.
///
/// Cheap to clone; clones share the same store, pool and limiter. Call
/// [`run`](Self::run) once to start dispatching; submissions made before
/// that stay `pending` until it starts.
pub struct Orchestrator<R: BrowserRunner, S: WebhookSender> {
    inner: Arc<Inner<R, S>>,
}

impl<R: BrowserRunner, S: WebhookSender> Clone for Orchestrator<R, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: BrowserRunner, S: WebhookSender> Orchestrator<R, S> {
    pub fn new(
        store: JobStore,
        runner: R,
        webhooks: WebhookDispatcher<S>,
        config: SchedulerConfig,
    ) -> Self {
        let (requeue_tx, requeue_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                store,
                runner,
                limiter: RateLimiter::new(config.rate_limit),
                webhooks,
                slots: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
                config,
                wake: Notify::new(),
                running: Mutex::new(HashMap::new()),
                held: Mutex::new(HashSet::new()),
                requeue_tx,
                requeue_rx: Mutex::new(Some(requeue_rx)),
                reporter: Arc::new(TracingReporter),
            }),
        }
    }

    /// Replace the default [`TracingReporter`]. Must be called before the
    /// orchestrator is cloned.
    pub fn with_reporter(self, reporter: impl SchedulerReporter) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.reporter = Arc::new(reporter);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                tracing::warn!("Orchestrator already shared; reporter not replaced");
                Self { inner }
            }
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Validate and enqueue a new job. Never blocks on capacity.
    pub fn submit(&self, request: CreateJobRequest) -> Result<Job, AppError> {
        source_key(&request.target.url)?;
        if let Some(hook) = &request.webhook_url {
            source_key(hook).map_err(|e| match e {
                AppError::InvalidTarget(msg) => {
                    AppError::InvalidTarget(format!("Invalid webhook_url: {msg}"))
                }
                other => other,
            })?;
        }

        let job = Job::new(request, self.inner.config.retry_policy.max_retries);
        self.inner.store.create(job.clone())?;
        self.inner
            .reporter
            .report(SchedulerEvent::JobSubmitted { job: &job });
        self.inner.wake.notify_one();
        Ok(job)
    }

    pub fn get(&self, id: Uuid) -> Result<Job, AppError> {
        self.inner.store.get(id)
    }

    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        self.inner.store.list(filter)
    }

    pub fn stats(&self) -> JobStats {
        self.inner.store.stats()
    }

    /// Cancel a non-terminal job, signalling its attempt if one is running.
    pub fn cancel(&self, id: Uuid) -> Result<Job, AppError> {
        loop {
            let current = self.inner.store.get(id)?;
            if current.status.is_terminal() {
                return Err(AppError::AlreadyTerminal {
                    id,
                    status: current.status,
                });
            }

            let outcome =
                self.inner
                    .store
                    .transition(id, current.status, JobStatus::Cancelled, |job| {
                        job.result = None;
                        job.error = Some(JobError::cancelled());
                    });

            match outcome {
                Ok(job) => {
                    if let Some(token) = self.inner.lock_running().get(&id) {
                        token.cancel();
                    }
                    self.inner.reporter.report(SchedulerEvent::JobCancelled {
                        job_id: id,
                        previous: current.status,
                    });
                    return Ok(job);
                }
                // Status moved under us; re-read and try again.
                Err(AppError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait for in-flight webhook deliveries to finish.
    pub async fn flush_webhooks(&self) {
        self.inner.webhooks.shutdown().await;
    }

    /// Run the dispatch loop until `cancel_token` fires.
    ///
    /// On shutdown in-flight attempts are signalled and awaited; their jobs
    /// are left as they are for snapshot recovery.
    pub async fn run(&self, cancel_token: CancellationToken) -> Result<(), AppError> {
        let requeues = self
            .inner
            .take_requeue_rx()
            .ok_or_else(|| AppError::Generic("Orchestrator is already running".into()))?;

        let inner = &self.inner;
        inner.reporter.report(SchedulerEvent::Started {
            max_concurrent_jobs: inner.config.max_concurrent_jobs,
        });

        let timer = tokio::spawn(requeue_timer(
            Arc::clone(inner),
            requeues,
            cancel_token.child_token(),
        ));
        let attempts = TaskTracker::new();

        'dispatch: loop {
            let permit = tokio::select! {
                biased;
                () = cancel_token.cancelled() => break,
                permit = Arc::clone(&inner.slots).acquire_owned() => permit
                    .map_err(|_| AppError::Generic("Worker pool closed".into()))?,
            };

            let job = loop {
                match inner.claim_next() {
                    Claim::Job(job) => break job,
                    Claim::Idle { reopen_at } => {
                        if reopen_at.is_none() {
                            let pruned = inner.limiter.prune_idle();
                            if pruned > 0 {
                                tracing::debug!(pruned, "Dropped idle rate-limit windows");
                            }
                        }
                        let reopen = async {
                            match reopen_at {
                                Some(at) => tokio::time::sleep_until(at).await,
                                None => std::future::pending().await,
                            }
                        };
                        tokio::select! {
                            biased;
                            () = cancel_token.cancelled() => break 'dispatch,
                            () = inner.wake.notified() => {}
                            () = reopen => {}
                        }
                    }
                }
            };

            let attempt_token = cancel_token.child_token();
            attempts.spawn(Arc::clone(inner).execute(job, attempt_token, permit));
        }

        attempts.close();
        inner.reporter.report(SchedulerEvent::ShuttingDown {
            in_flight: attempts.len(),
        });
        attempts.wait().await;
        if let Err(e) = timer.await {
            tracing::error!(error = %e, "Requeue timer task failed");
        }
        inner.reporter.report(SchedulerEvent::Stopped);

        Ok(())
    }
}

impl<R: BrowserRunner, S: WebhookSender> Inner<R, S> {
    fn lock_running(&self) -> MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.running.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned running-jobs mutex");
            poisoned.into_inner()
        })
    }

    fn lock_held(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_requeue_rx(&self) -> Option<mpsc::UnboundedReceiver<(Uuid, Duration)>> {
        self.requeue_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Oldest pending job whose source has a rate token, moved to `running`.
    fn claim_next(&self) -> Claim {
        let mut reopen_at: Option<Instant> = None;
        let mut throttled: HashSet<String> = HashSet::new();

        for (id, source) in self.store.pending_oldest_first() {
            if throttled.contains(&source) || self.lock_held().contains(&id) {
                continue;
            }
            if !self.limiter.try_acquire(&source) {
                if let Some(at) = self.limiter.next_reset(&source) {
                    reopen_at = Some(reopen_at.map_or(at, |current| current.min(at)));
                }
                throttled.insert(source);
                continue;
            }

            let claimed = self
                .store
                .transition(id, JobStatus::Pending, JobStatus::Running, |job| {
                    job.started_at = Some(Utc::now());
                    job.next_attempt_at = None;
                });
            match claimed {
                Ok(job) => return Claim::Job(job),
                Err(e) => {
                    // Lost to a cancel; the spent token is not refunded.
                    tracing::debug!(job_id = %id, error = %e, "Pending job changed before dispatch");
                }
            }
        }

        Claim::Idle { reopen_at }
    }

    async fn execute(
        self: Arc<Self>,
        job: Job,
        cancel: CancellationToken,
        permit: OwnedSemaphorePermit,
    ) {
        self.lock_running().insert(job.id, cancel.clone());
        // A cancel that landed between claim and registration found no token.
        if self
            .store
            .get(job.id)
            .is_ok_and(|current| current.status != JobStatus::Running)
        {
            cancel.cancel();
        }

        self.reporter.report(SchedulerEvent::JobDispatched {
            job_id: job.id,
            source: &job.target.source,
            attempt: job.attempts + 1,
        });

        let timeout = self.config.request_timeout;
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            timeout,
            self.runner
                .attempt(&job.target, &self.config.run_options, cancel.clone()),
        )
        .await
        .unwrap_or(Err(AppError::Timeout(timeout.as_secs())));

        self.lock_running().remove(&job.id);

        match outcome {
            // Aborted by a user cancel or by shutdown; nothing to record.
            Err(_) if cancel.is_cancelled() => {
                if let Ok(current) = self.store.get(job.id) {
                    self.reporter.report(SchedulerEvent::OutcomeDiscarded {
                        job_id: job.id,
                        status: current.status,
                    });
                }
            }
            outcome => self.record_outcome(&job, outcome, started.elapsed()),
        }

        drop(permit);
        self.wake.notify_one();
    }

    fn record_outcome(
        &self,
        job: &Job,
        outcome: Result<RunOutput, AppError>,
        elapsed: Duration,
    ) {
        match outcome {
            Ok(output) => self.succeed(job, output, elapsed),
            Err(e) if e.kind() == ErrorKind::ResourceExhausted => {
                self.hold(job, self.config.retry_policy.base_delay, &e);
            }
            Err(e) => {
                let attempts = job.attempts + 1;
                let policy = self.config.retry_policy.with_max_retries(job.max_retries);
                match policy.decide(attempts, e.kind()) {
                    RetryDecision::RetryAfter(delay) => self.defer(job, attempts, delay, &e),
                    RetryDecision::GiveUp => self.fail(job, attempts, &e),
                }
            }
        }
    }

    fn succeed(&self, job: &Job, output: RunOutput, elapsed: Duration) {
        let attempts = job.attempts + 1;
        let count = output.records.len();
        let stats = ScrapeStats::new(output.links_found, count, output.pages_failed, elapsed);
        let updated = self
            .store
            .transition(job.id, JobStatus::Running, JobStatus::Succeeded, |j| {
                j.attempts = attempts;
                j.result = Some(output.records);
                j.stats = Some(stats);
                j.error = None;
            });

        match updated {
            Ok(done) => {
                self.reporter.report(SchedulerEvent::JobSucceeded {
                    job_id: job.id,
                    attempts,
                    records: count,
                });
                self.notify_webhook(&done);
            }
            Err(e) => self.discarded(job.id, e),
        }
    }

    fn fail(&self, job: &Job, attempts: u32, err: &AppError) {
        let error = JobError::from(err);
        let updated = self
            .store
            .transition(job.id, JobStatus::Running, JobStatus::Failed, |j| {
                j.attempts = attempts;
                j.result = None;
                j.stats = None;
                j.error = Some(error.clone());
            });

        match updated {
            Ok(done) => {
                self.reporter.report(SchedulerEvent::JobFailed {
                    job_id: job.id,
                    attempts,
                    error: &error,
                });
                self.notify_webhook(&done);
            }
            Err(e) => self.discarded(job.id, e),
        }
    }

    /// Move to `retrying` and hand the job to the requeue timer.
    fn defer(&self, job: &Job, attempts: u32, delay: Duration, err: &AppError) {
        let next_at = TimeDelta::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        let updated = self
            .store
            .transition(job.id, JobStatus::Running, JobStatus::Retrying, |j| {
                j.attempts = attempts;
                j.next_attempt_at = next_at;
            });

        match updated {
            Ok(_) => {
                let error = err.to_string();
                self.reporter.report(SchedulerEvent::JobRetrying {
                    job_id: job.id,
                    attempts,
                    delay,
                    error: &error,
                });
                if self.requeue_tx.send((job.id, delay)).is_err() {
                    tracing::error!(job_id = %job.id, "Requeue timer is gone; job stays retrying");
                }
            }
            Err(e) => self.discarded(job.id, e),
        }
    }

    /// Back to `pending` with the attempt count untouched. Dispatch skips
    /// the job until the requeue timer releases it.
    fn hold(&self, job: &Job, delay: Duration, err: &AppError) {
        let next_at = TimeDelta::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        self.lock_held().insert(job.id);
        let updated = self
            .store
            .transition(job.id, JobStatus::Running, JobStatus::Pending, |j| {
                j.started_at = None;
                j.next_attempt_at = next_at;
            });

        match updated {
            Ok(_) => {
                let error = err.to_string();
                self.reporter.report(SchedulerEvent::JobHeld {
                    job_id: job.id,
                    delay,
                    error: &error,
                });
                if self.requeue_tx.send((job.id, delay)).is_err() {
                    tracing::error!(job_id = %job.id, "Requeue timer is gone; releasing held job");
                    self.lock_held().remove(&job.id);
                }
            }
            Err(e) => {
                self.lock_held().remove(&job.id);
                self.discarded(job.id, e);
            }
        }
    }

    /// Timer expiry: release a held job or requeue a retrying one.
    fn release(&self, job_id: Uuid) {
        if self.lock_held().remove(&job_id) {
            let cleared = self
                .store
                .transition(job_id, JobStatus::Pending, JobStatus::Pending, |j| {
                    j.next_attempt_at = None;
                });
            if let Err(e) = cleared {
                tracing::debug!(%job_id, error = %e, "Held job left pending");
            }
            self.wake.notify_one();
        } else {
            self.requeue(job_id);
        }
    }

    fn discarded(&self, job_id: Uuid, err: AppError) {
        match err {
            AppError::Conflict { actual, .. } => {
                self.reporter.report(SchedulerEvent::OutcomeDiscarded {
                    job_id,
                    status: actual,
                });
            }
            other => {
                tracing::warn!(%job_id, error = %other, "Could not record attempt outcome");
            }
        }
    }

    fn notify_webhook(&self, job: &Job) {
        if self.config.enable_webhook_callbacks {
            let _ = self.webhooks.notify(job);
        }
    }

    fn requeue(&self, job_id: Uuid) {
        let requeued = self
            .store
            .transition(job_id, JobStatus::Retrying, JobStatus::Pending, |j| {
                j.next_attempt_at = None;
            });
        match requeued {
            Ok(_) => {
                self.reporter
                    .report(SchedulerEvent::JobRequeued { job_id });
                self.wake.notify_one();
            }
            Err(e) => tracing::debug!(%job_id, error = %e, "Skipped requeue"),
        }
    }
}

/// Single timer driving every deferred `retrying -> pending` move and
/// capacity hold release.
async fn requeue_timer<R: BrowserRunner, S: WebhookSender>(
    inner: Arc<Inner<R, S>>,
    mut requests: mpsc::UnboundedReceiver<(Uuid, Duration)>,
    cancel: CancellationToken,
) {
    let mut queue: DelayQueue<Uuid> = DelayQueue::new();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            Some((job_id, delay)) = requests.recv() => {
                queue.insert(job_id, delay);
            }
            Some(expired) = queue.next(), if !queue.is_empty() => {
                inner.release(expired.into_inner());
            }
        }
    }

    if !queue.is_empty() {
        tracing::debug!(pending = queue.len(), "Requeue timer stopped with deferred jobs");
    }
}
