use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Application configuration loaded from environment variables.
///
/// Constructed once at startup and passed by reference; nothing mutates it
/// after load.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub serper_api_key: String,
    pub use_mock_api: bool,

    // Budget guard
    pub daily_budget_usd: f64,
    pub cost_per_credit: f64,
    pub budget_soft_pct: f64,
    pub budget_hard_pct: f64,

    // Coordinator & executor defaults
    pub processor_max_workers: usize,
    pub default_batch_size: i64,
    pub default_concurrency: i64,
    pub default_pages: i64,

    // Queue & persistence
    pub early_exit_threshold: i64,
    pub merge_chunk_size: usize,
    pub reclaim_after_seconds: u64,

    // Search client policy
    pub serper_timeout_seconds: u64,
    pub max_retries_per_query: u32,
    pub retry_delay_seconds: u64,

    // Coordinator pacing
    pub processor_loop_delay_seconds: u64,
    pub idle_poll_interval: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            serper_api_key: String::new(),
            use_mock_api: true,
            daily_budget_usd: 50.0,
            cost_per_credit: 0.001,
            budget_soft_pct: 80.0,
            budget_hard_pct: 100.0,
            processor_max_workers: 1,
            default_batch_size: 100,
            default_concurrency: 20,
            default_pages: 3,
            early_exit_threshold: 10,
            merge_chunk_size: 500,
            reclaim_after_seconds: 3600,
            serper_timeout_seconds: 30,
            max_retries_per_query: 3,
            retry_delay_seconds: 5,
            processor_loop_delay_seconds: 3,
            idle_poll_interval: 10,
        }
    }
}

impl Settings {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();
        let settings = Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            serper_api_key: env::var("SERPER_API_KEY").unwrap_or_default(),
            use_mock_api: parse_or("USE_MOCK_API", defaults.use_mock_api),
            daily_budget_usd: parse_or("DAILY_BUDGET_USD", defaults.daily_budget_usd),
            cost_per_credit: parse_or("COST_PER_CREDIT", defaults.cost_per_credit),
            budget_soft_pct: parse_or("BUDGET_SOFT_PCT", defaults.budget_soft_pct),
            budget_hard_pct: parse_or("BUDGET_HARD_PCT", defaults.budget_hard_pct),
            processor_max_workers: parse_or("PROCESSOR_MAX_WORKERS", defaults.processor_max_workers),
            default_batch_size: parse_or("DEFAULT_BATCH_SIZE", defaults.default_batch_size),
            default_concurrency: parse_or("DEFAULT_CONCURRENCY", defaults.default_concurrency),
            default_pages: parse_or("DEFAULT_PAGES", defaults.default_pages),
            early_exit_threshold: parse_or("EARLY_EXIT_THRESHOLD", defaults.early_exit_threshold),
            merge_chunk_size: parse_or("MERGE_CHUNK_SIZE", defaults.merge_chunk_size),
            reclaim_after_seconds: parse_or("RECLAIM_AFTER_SECONDS", defaults.reclaim_after_seconds),
            serper_timeout_seconds: parse_or(
                "SERPER_TIMEOUT_SECONDS",
                defaults.serper_timeout_seconds,
            ),
            max_retries_per_query: parse_or("MAX_RETRIES_PER_QUERY", defaults.max_retries_per_query),
            retry_delay_seconds: parse_or("RETRY_DELAY_SECONDS", defaults.retry_delay_seconds),
            processor_loop_delay_seconds: parse_or(
                "PROCESSOR_LOOP_DELAY_SECONDS",
                defaults.processor_loop_delay_seconds,
            ),
            idle_poll_interval: parse_or("IDLE_POLL_INTERVAL", defaults.idle_poll_interval),
        };

        if !settings.use_mock_api && settings.serper_api_key.is_empty() {
            tracing::warn!("SERPER_API_KEY not set while USE_MOCK_API=false; live searches will fail");
        }

        Ok(settings)
    }

    /// Missing configuration that would break a live (non-mock) run.
    pub fn configuration_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.database_url.is_empty() {
            issues.push("DATABASE_URL not set".to_string());
        }
        if !self.use_mock_api && self.serper_api_key.is_empty() {
            issues.push("SERPER_API_KEY not set (required when USE_MOCK_API=false)".to_string());
        }
        issues
    }

    pub fn serper_timeout(&self) -> Duration {
        Duration::from_secs(self.serper_timeout_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    pub fn loop_delay(&self) -> Duration {
        Duration::from_secs(self.processor_loop_delay_seconds)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_secs(self.idle_poll_interval)
    }

    pub fn reclaim_after(&self) -> Duration {
        Duration::from_secs(self.reclaim_after_seconds)
    }
}

/// Parse an env var, falling back to the default on absence or bad input.
fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("{key}='{raw}' is not valid; using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.default_batch_size, 100);
        assert_eq!(s.default_concurrency, 20);
        assert_eq!(s.default_pages, 3);
        assert_eq!(s.early_exit_threshold, 10);
        assert_eq!(s.merge_chunk_size, 500);
        assert_eq!(s.reclaim_after_seconds, 3600);
        assert_eq!(s.max_retries_per_query, 3);
        assert!(s.use_mock_api);
    }

    #[test]
    fn mock_mode_needs_no_api_key() {
        let s = Settings {
            database_url: "postgres://localhost/pipeline".into(),
            ..Settings::default()
        };
        assert!(s.configuration_issues().is_empty());
    }

    #[test]
    fn live_mode_without_key_is_flagged() {
        let s = Settings {
            database_url: "postgres://localhost/pipeline".into(),
            use_mock_api: false,
            ..Settings::default()
        };
        let issues = s.configuration_issues();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("SERPER_API_KEY"));
    }
}
