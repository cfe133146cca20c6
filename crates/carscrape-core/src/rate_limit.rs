//! Per-source fixed-window rate limiting.
//!
//! Each source (a listing site's host) gets a counter that admits at most
//! `requests` scrape attempts per `window`. Windows are aligned to the first
//! admission for that source and advance in whole multiples of `window`, so a
//! reset never leaves a partially counted window behind.
//!
//! ```rust
//! use std::time::Duration;
//! use carscrape_core::rate_limit::{RateLimitConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::new(1, Duration::from_secs(60)));
//! assert!(limiter.try_acquire("example.com"));
//! assert!(!limiter.try_acquire("example.com"));
//! assert!(limiter.try_acquire("other.com"));
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Admissions allowed per window.
    pub requests: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn new(requests: u32, window: Duration) -> Self {
        Self { requests, window }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(60))
    }
}

/// Counter for one source.
#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    window_start: Instant,
}

impl RateWindow {
    /// Move to the window containing `now`, resetting the count.
    fn roll(&mut self, now: Instant, window: Duration) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= window {
            let skipped = (elapsed.as_nanos() / window.as_nanos()) as u32;
            self.window_start += window * skipped;
            self.count = 0;
        }
    }
}

/// Thread-safe fixed-window limiter shared by all workers.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Arc<Mutex<HashMap<String, RateWindow>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    fn lock_windows(&self) -> MutexGuard<'_, HashMap<String, RateWindow>> {
        self.windows.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned rate limiter mutex");
            poisoned.into_inner()
        })
    }

    /// Admit one request for `source` if its current window has room.
    pub fn try_acquire(&self, source: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.lock_windows();
        let entry = windows.entry(source.to_string()).or_insert(RateWindow {
            count: 0,
            window_start: now,
        });
        entry.roll(now, self.config.window);

        if entry.count < self.config.requests {
            entry.count += 1;
            true
        } else {
            tracing::debug!(%source, count = entry.count, "Rate limit window full");
            false
        }
    }

    /// When the current window for `source` ends, if it is currently full.
    ///
    /// Returns `None` when `source` can be admitted right now.
    pub fn next_reset(&self, source: &str) -> Option<Instant> {
        let now = Instant::now();
        let mut windows = self.lock_windows();
        let entry = windows.get_mut(source)?;
        entry.roll(now, self.config.window);
        (entry.count >= self.config.requests).then(|| entry.window_start + self.config.window)
    }

    /// Drop windows that ended long ago so idle sources don't accumulate.
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let horizon = self.config.window * 2;
        let mut windows = self.lock_windows();
        let before = windows.len();
        windows.retain(|_, w| now.saturating_duration_since(w.window_start) < horizon);
        before - windows.len()
    }
}
