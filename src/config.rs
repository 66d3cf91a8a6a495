//! Sync configuration
//!
//! Centralized configuration with environment variable support and
//! sensible defaults.

use crate::error::SyncError;
use std::env;
use std::time::Duration;

/// Chat synchronization configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Chat API configuration
    pub api: ApiConfig,
    /// Merge and optimistic-send tuning
    pub merge: MergeConfig,
    /// Live channel reconnection policy
    pub reconnect: ReconnectConfig,
}

/// Chat API configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL of the marketplace chat API
    pub base_url: String,
    /// Per-request timeout (in seconds)
    pub request_timeout_secs: u64,
    /// Messages requested per history page
    pub history_page_limit: usize,
    /// Upper bound on history pages fetched per selection
    pub history_max_pages: usize,
}

/// Merge engine tuning
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Tolerance used to match an optimistic send to its server echo (in ms)
    pub coalescing_window_ms: i64,
    /// Capacity of the live event channel per session
    pub event_buffer: usize,
}

/// Bounded exponential backoff for the live channel
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt (in ms)
    pub initial_backoff_ms: u64,
    /// Cap on the delay between attempts (in ms)
    pub max_backoff_ms: u64,
    /// Attempts before the transport gives up
    pub max_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                base_url: "http://localhost:3000/api".to_string(),
                request_timeout_secs: 15,
                history_page_limit: 50,
                history_max_pages: 20,
            },
            merge: MergeConfig {
                coalescing_window_ms: 10_000,
                event_buffer: 256,
            },
            reconnect: ReconnectConfig {
                initial_backoff_ms: 500,
                max_backoff_ms: 30_000,
                max_attempts: 8,
            },
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api: ApiConfig {
                base_url: env::var("CHAT_API_BASE_URL")
                    .map(|url| url.trim_end_matches('/').to_string())
                    .unwrap_or(defaults.api.base_url),
                request_timeout_secs: env_or(
                    "CHAT_REQUEST_TIMEOUT_SECS",
                    defaults.api.request_timeout_secs,
                ),
                history_page_limit: env_or(
                    "CHAT_HISTORY_PAGE_LIMIT",
                    defaults.api.history_page_limit,
                ),
                history_max_pages: env_or(
                    "CHAT_HISTORY_MAX_PAGES",
                    defaults.api.history_max_pages,
                ),
            },
            merge: MergeConfig {
                coalescing_window_ms: env_or(
                    "CHAT_COALESCING_WINDOW_MS",
                    defaults.merge.coalescing_window_ms,
                ),
                event_buffer: env_or("CHAT_EVENT_BUFFER", defaults.merge.event_buffer),
            },
            reconnect: ReconnectConfig {
                initial_backoff_ms: env_or(
                    "CHAT_RECONNECT_INITIAL_BACKOFF_MS",
                    defaults.reconnect.initial_backoff_ms,
                ),
                max_backoff_ms: env_or(
                    "CHAT_RECONNECT_MAX_BACKOFF_MS",
                    defaults.reconnect.max_backoff_ms,
                ),
                max_attempts: env_or(
                    "CHAT_RECONNECT_MAX_ATTEMPTS",
                    defaults.reconnect.max_attempts,
                ),
            },
        }
    }

    /// Reject values that would stall or disable synchronization
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.api.base_url.is_empty() {
            return Err(SyncError::Config("CHAT_API_BASE_URL cannot be empty".into()));
        }
        if self.api.request_timeout_secs == 0 {
            return Err(SyncError::Config("request timeout must be > 0".into()));
        }
        if self.api.history_page_limit == 0 || self.api.history_max_pages == 0 {
            return Err(SyncError::Config("history paging values must be > 0".into()));
        }
        if self.merge.coalescing_window_ms <= 0 {
            return Err(SyncError::Config("coalescing window must be > 0".into()));
        }
        if self.merge.event_buffer == 0 {
            return Err(SyncError::Config("event buffer must be > 0".into()));
        }
        if self.reconnect.initial_backoff_ms == 0
            || self.reconnect.max_backoff_ms < self.reconnect.initial_backoff_ms
        {
            return Err(SyncError::Config(
                "backoff must be > 0 and max >= initial".into(),
            ));
        }
        Ok(())
    }

    /// Per-request timeout as a `Duration`
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.request_timeout_secs)
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt `attempt` (1-based), doubling up to the cap
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }
}
