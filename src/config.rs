use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::SyncError;
use crate::logging::LogFormat;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the message API (e.g., "http://localhost:5000")
    pub api_base_url: String,
    /// Bearer token for the message API
    pub api_token: Option<String>,
    /// SQLite URL for the local outbox
    pub outbox_database_url: String,
    /// Messages per page for initial load, refresh and backfill
    pub page_size: u32,
    /// Interval of the background refresh
    pub poll_interval: Duration,
    /// The viewport counts as "at bottom" when the last visible item is within
    /// this many items of the end
    pub bottom_threshold: usize,
    /// Older history is prefetched once the first visible item index is at or
    /// below this value
    pub prefetch_threshold: usize,
    /// Unseen message count at which the renderer is offered a summary
    pub summary_unread_threshold: usize,
    /// Capacity of the engine command queue
    pub command_buffer: usize,
    pub http_timeout: Duration,
    pub log_format: LogFormat,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5000".to_string(),
            api_token: None,
            outbox_database_url: "sqlite://outbox.db?mode=rwc".to_string(),
            page_size: 20,
            poll_interval: Duration::from_millis(3000),
            bottom_threshold: 7,
            prefetch_threshold: 3,
            summary_unread_threshold: 13,
            command_buffer: 256,
            http_timeout: Duration::from_millis(15000),
            log_format: LogFormat::Pretty,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        dotenv().ok();
        let defaults = Self::default();

        let api_base_url = env::var("SYNC_API_BASE_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_base_url);
        let api_token = env::var("SYNC_API_TOKEN").ok().filter(|t| !t.is_empty());
        let outbox_database_url =
            env::var("SYNC_OUTBOX_DATABASE_URL").unwrap_or(defaults.outbox_database_url);

        let page_size: u32 = parse_var("SYNC_PAGE_SIZE", defaults.page_size)?;
        if page_size == 0 {
            return Err(SyncError::Config("SYNC_PAGE_SIZE must be positive".into()));
        }
        let poll_interval_ms: u64 = parse_var(
            "SYNC_POLL_INTERVAL_MS",
            defaults.poll_interval.as_millis() as u64,
        )?;
        if poll_interval_ms == 0 {
            return Err(SyncError::Config(
                "SYNC_POLL_INTERVAL_MS must be positive".into(),
            ));
        }
        let command_buffer: usize = parse_var("SYNC_COMMAND_BUFFER", defaults.command_buffer)?;
        if command_buffer == 0 {
            return Err(SyncError::Config(
                "SYNC_COMMAND_BUFFER must be positive".into(),
            ));
        }

        Ok(Self {
            api_base_url,
            api_token,
            outbox_database_url,
            page_size,
            poll_interval: Duration::from_millis(poll_interval_ms),
            bottom_threshold: parse_var("SYNC_BOTTOM_THRESHOLD", defaults.bottom_threshold)?,
            prefetch_threshold: parse_var("SYNC_PREFETCH_THRESHOLD", defaults.prefetch_threshold)?,
            summary_unread_threshold: parse_var(
                "SYNC_SUMMARY_UNREAD_THRESHOLD",
                defaults.summary_unread_threshold,
            )?,
            command_buffer,
            http_timeout: Duration::from_millis(parse_var(
                "SYNC_HTTP_TIMEOUT_MS",
                defaults.http_timeout.as_millis() as u64,
            )?),
            log_format: parse_var("SYNC_LOG_FORMAT", defaults.log_format)?,
        })
    }
}

/// Unset falls back to `default`; set but unparsable is an error.
fn parse_var<T>(key: &str, default: T) -> Result<T, SyncError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| SyncError::Config(format!("{key}={raw:?}: {e}"))),
        Err(_) => Ok(default),
    }
}
