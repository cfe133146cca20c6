use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::store::JobStore;

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// When false, [`RetentionSweeper::run`] returns immediately.
    pub enabled: bool,
    pub interval: Duration,
    pub data_retention: Duration,
    pub log_retention: Duration,
    pub log_dir: Option<PathBuf>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(3600),
            data_retention: Duration::from_secs(30 * 86_400),
            log_retention: Duration::from_secs(7 * 86_400),
            log_dir: None,
        }
    }
}

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub jobs_deleted: usize,
    pub logs_deleted: usize,
}

/// Periodically drops expired job records and old log files.
#[derive(Clone)]
pub struct RetentionSweeper {
    store: JobStore,
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(store: JobStore, config: RetentionConfig) -> Self {
        Self { store, config }
    }

    /// One sweep. Running it again with nothing expired is a no-op.
    ///
    /// Unreadable log entries are skipped. Only a failed snapshot write is
    /// returned as an error, after everything else has been removed.
    pub fn sweep_once(&self) -> Result<SweepReport, AppError> {
        let jobs_deleted = self.store.delete_older_than(self.config.data_retention);

        let logs_deleted = match &self.config.log_dir {
            Some(dir) => purge_logs(dir, self.config.log_retention),
            None => 0,
        };

        self.store.save_snapshot()?;

        Ok(SweepReport {
            jobs_deleted,
            logs_deleted,
        })
    }

    /// Sweep every `interval` until cancelled.
    pub async fn run(&self, cancel_token: CancellationToken) {
        if !self.config.enabled {
            tracing::info!("Automatic cleanup disabled");
            return;
        }

        if self.config.interval.is_zero() {
            tracing::error!("Retention interval is zero, sweeper not started");
            return;
        }

        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            data_retention_days = self.config.data_retention.as_secs() / 86_400,
            log_retention_days = self.config.log_retention.as_secs() / 86_400,
            "Retention sweeper started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let sweeper = self.clone();
            let outcome = tokio::task::spawn_blocking(move || sweeper.sweep_once())
                .await
                .map_err(|e| AppError::Generic(format!("Retention sweep panicked: {e}")))
                .and_then(|result| result);

            match outcome {
                Ok(report) if report == SweepReport::default() => {
                    tracing::debug!("Retention sweep found nothing to remove");
                }
                Ok(report) => {
                    tracing::info!(
                        jobs_deleted = report.jobs_deleted,
                        logs_deleted = report.logs_deleted,
                        "Retention sweep completed"
                    );
                }
                Err(e) => tracing::error!(error = %e, "Retention sweep failed"),
            }
        }

        tracing::info!("Retention sweeper stopped");
    }
}

/// Delete regular files in `dir` last modified more than `max_age` ago.
fn purge_logs(dir: &Path, max_age: Duration) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Cannot read log directory");
            return 0;
        }
    };
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut deleted = 0;
    for entry in entries {
        let path = match entry {
            Ok(entry) => entry.path(),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Skipping unreadable log entry");
                continue;
            }
        };
        if !is_expired_file(&path, cutoff) {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => deleted += 1,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to delete old log file");
            }
        }
    }
    deleted
}

/// Symlinks are not followed; a broken one is simply not a log file.
fn is_expired_file(path: &Path, cutoff: SystemTime) -> bool {
    match std::fs::symlink_metadata(path).and_then(|m| {
        let modified = m.modified()?;
        Ok(m.is_file() && modified < cutoff)
    }) {
        Ok(expired) => expired,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Skipping log entry without metadata");
            false
        }
    }
}
