//! Runtime settings read from the environment.
//!
//! Everything has a default; invalid values are reported with the variable
//! name. Components never read the environment themselves: the binaries call
//! [`Settings::from_env`] once and hand each component its slice.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;
use crate::rate_limit::RateLimitConfig;
use crate::retention::RetentionConfig;
use crate::retry::RetryPolicy;
use crate::scheduler::SchedulerConfig;
use crate::traits::RunOptions;
use crate::webhook::WebhookConfig;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub max_concurrent_jobs: usize,
    /// Base backoff delay and pause between detail pages.
    pub default_delay: Duration,
    pub default_max_pages: u32,
    pub headless: bool,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub max_retry_delay: Duration,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,
    pub enable_webhook_callbacks: bool,
    pub webhook_max_attempts: u32,
    pub webhook_retry_delay: Duration,
    pub webhook_timeout: Duration,
    pub extract_images: bool,
    pub extract_optionals: bool,
    pub data_retention_days: u32,
    pub log_retention_days: u32,
    pub auto_cleanup: bool,
    pub cleanup_interval: Duration,
    pub log_dir: PathBuf,
    pub snapshot_path: Option<PathBuf>,
    pub api_key_required: bool,
    pub api_key: Option<String>,
    pub port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            default_delay: Duration::from_secs(2),
            default_max_pages: 50,
            headless: true,
            request_timeout: Duration::from_secs(300),
            max_retries: 3,
            max_retry_delay: Duration::from_secs(300),
            rate_limit_requests: 10,
            rate_limit_window: Duration::from_secs(60),
            enable_webhook_callbacks: true,
            webhook_max_attempts: 5,
            webhook_retry_delay: Duration::from_secs(2),
            webhook_timeout: Duration::from_secs(10),
            extract_images: true,
            extract_optionals: true,
            data_retention_days: 30,
            log_retention_days: 7,
            auto_cleanup: true,
            cleanup_interval: Duration::from_secs(3600),
            log_dir: PathBuf::from("logs"),
            snapshot_path: None,
            api_key_required: false,
            api_key: None,
            port: 8000,
        }
    }
}

impl Settings {
    /// Read settings from process environment variables.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let env = Env(&lookup);

        let settings = Self {
            max_concurrent_jobs: env.positive("MAX_CONCURRENT_JOBS", d.max_concurrent_jobs)?,
            default_delay: env.secs("DEFAULT_DELAY", d.default_delay)?,
            default_max_pages: env.positive("DEFAULT_MAX_PAGES", d.default_max_pages)?,
            headless: env.flag("HEADLESS", d.headless)?,
            request_timeout: env.secs("REQUEST_TIMEOUT", d.request_timeout)?,
            max_retries: env.parse("MAX_RETRIES", d.max_retries)?,
            max_retry_delay: env.secs("MAX_RETRY_DELAY", d.max_retry_delay)?,
            rate_limit_requests: env.positive("RATE_LIMIT_REQUESTS", d.rate_limit_requests)?,
            rate_limit_window: env.secs("RATE_LIMIT_WINDOW", d.rate_limit_window)?,
            enable_webhook_callbacks: env
                .flag("ENABLE_WEBHOOK_CALLBACKS", d.enable_webhook_callbacks)?,
            webhook_max_attempts: env.positive("WEBHOOK_MAX_ATTEMPTS", d.webhook_max_attempts)?,
            webhook_retry_delay: env.secs("WEBHOOK_RETRY_DELAY", d.webhook_retry_delay)?,
            webhook_timeout: env.secs("WEBHOOK_TIMEOUT", d.webhook_timeout)?,
            extract_images: env.flag("EXTRACT_IMAGES", d.extract_images)?,
            extract_optionals: env.flag("EXTRACT_OPTIONALS", d.extract_optionals)?,
            data_retention_days: env.parse("DATA_RETENTION_DAYS", d.data_retention_days)?,
            log_retention_days: env.parse("LOG_RETENTION_DAYS", d.log_retention_days)?,
            auto_cleanup: env.flag("AUTO_CLEANUP", d.auto_cleanup)?,
            cleanup_interval: env.secs("CLEANUP_INTERVAL", d.cleanup_interval)?,
            log_dir: lookup("LOG_DIR").map(PathBuf::from).unwrap_or(d.log_dir),
            snapshot_path: lookup("SNAPSHOT_PATH")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            api_key_required: env.flag("API_KEY_REQUIRED", d.api_key_required)?,
            api_key: lookup("API_KEY").filter(|k| !k.is_empty()),
            port: env.parse("PORT", d.port)?,
        };

        if settings.request_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "REQUEST_TIMEOUT must be at least 1 second".into(),
            ));
        }
        if settings.rate_limit_window.is_zero() {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_WINDOW must be at least 1 second".into(),
            ));
        }
        if settings.cleanup_interval.is_zero() {
            return Err(AppError::ConfigError(
                "CLEANUP_INTERVAL must be at least 1 second".into(),
            ));
        }
        if settings.api_key_required && settings.api_key.is_none() {
            return Err(AppError::ConfigError(
                "API_KEY_REQUIRED is set but API_KEY is empty".into(),
            ));
        }

        Ok(settings)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.default_delay, self.max_retry_delay)
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig::new(self.rate_limit_requests, self.rate_limit_window)
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            timeout: self.request_timeout,
            headless: self.headless,
            extract_images: self.extract_images,
            extract_optionals: self.extract_optionals,
            max_pages: self.default_max_pages,
            page_delay: self.default_delay,
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_jobs: self.max_concurrent_jobs,
            request_timeout: self.request_timeout,
            retry_policy: self.retry_policy(),
            rate_limit: self.rate_limit(),
            run_options: self.run_options(),
            enable_webhook_callbacks: self.enable_webhook_callbacks,
        }
    }

    pub fn webhook(&self) -> WebhookConfig {
        WebhookConfig {
            retry_policy: RetryPolicy::new(
                self.webhook_max_attempts,
                self.webhook_retry_delay,
                self.max_retry_delay,
            ),
            timeout: self.webhook_timeout,
        }
    }

    pub fn retention(&self) -> RetentionConfig {
        RetentionConfig {
            enabled: self.auto_cleanup,
            interval: self.cleanup_interval,
            data_retention: Duration::from_secs(u64::from(self.data_retention_days) * SECS_PER_DAY),
            log_retention: Duration::from_secs(u64::from(self.log_retention_days) * SECS_PER_DAY),
            log_dir: Some(self.log_dir.clone()),
        }
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, AppError> {
        match (self.0)(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| {
                AppError::ConfigError(format!("Invalid {key} '{raw}': expected a number"))
            }),
        }
    }

    fn positive<T: FromStr + PartialEq + Default>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, AppError> {
        let value = self.parse(key, default)?;
        if value == T::default() {
            return Err(AppError::ConfigError(format!("{key} must be at least 1")));
        }
        Ok(value)
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, AppError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, AppError> {
        match (self.0)(key) {
            None => Ok(default),
            Some(raw) => match raw.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(AppError::ConfigError(format!(
                    "Invalid {key} '{raw}': expected true/false"
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn settings_from(pairs: &[(&str, &str)]) -> Result<Settings, AppError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        assert_eq!(settings_from(&[]).unwrap(), Settings::default());
    }

    #[test]
    fn overrides_are_parsed() {
        let s = settings_from(&[
            ("MAX_CONCURRENT_JOBS", "8"),
            ("DEFAULT_DELAY", "1"),
            ("HEADLESS", "false"),
            ("RATE_LIMIT_REQUESTS", "1"),
            ("RATE_LIMIT_WINDOW", "60"),
            ("ENABLE_WEBHOOK_CALLBACKS", "no"),
            ("SNAPSHOT_PATH", "/tmp/jobs.json"),
            ("API_KEY_REQUIRED", "true"),
            ("API_KEY", "secret"),
        ])
        .unwrap();

        assert_eq!(s.max_concurrent_jobs, 8);
        assert_eq!(s.default_delay, Duration::from_secs(1));
        assert!(!s.headless);
        assert_eq!(s.rate_limit_requests, 1);
        assert!(!s.enable_webhook_callbacks);
        assert_eq!(s.snapshot_path, Some(PathBuf::from("/tmp/jobs.json")));
        assert_eq!(s.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn invalid_number_names_the_variable() {
        let err = settings_from(&[("MAX_RETRIES", "many")]).unwrap_err();
        assert!(err.to_string().contains("MAX_RETRIES"));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(matches!(
            settings_from(&[("MAX_CONCURRENT_JOBS", "0")]),
            Err(AppError::ConfigError(_))
        ));
    }

    #[test]
    fn zero_durations_are_rejected() {
        for var in ["REQUEST_TIMEOUT", "RATE_LIMIT_WINDOW", "CLEANUP_INTERVAL"] {
            let err = settings_from(&[(var, "0")]).unwrap_err();
            assert!(matches!(err, AppError::ConfigError(_)));
            assert!(err.to_string().contains(var), "{err}");
        }
    }

    #[test]
    fn api_key_required_without_key_is_rejected() {
        let err = settings_from(&[("API_KEY_REQUIRED", "1")]).unwrap_err();
        assert!(err.to_string().contains("API_KEY"));
    }

    #[test]
    fn retention_converts_days() {
        let s = settings_from(&[("DATA_RETENTION_DAYS", "2"), ("AUTO_CLEANUP", "off")]).unwrap();
        let r = s.retention();
        assert!(!r.enabled);
        assert_eq!(r.data_retention, Duration::from_secs(2 * 86_400));
        assert_eq!(r.log_retention, Duration::from_secs(7 * 86_400));
    }
}
