//! Configuration for KAIKU

use crate::error::{KaikuError, Result};
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration for KAIKU
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis connection URL
    pub redis_url: String,

    /// Key/stream namespace prefix
    pub stream_prefix: String,

    /// Admin (metrics + health) server address
    pub metrics_addr: SocketAddr,

    /// Notification feed URL
    pub source_url: String,

    /// Bearer token for the notification feed, if required
    pub source_token: Option<String>,

    /// Poller identity (owns one durable offset)
    pub poller_id: String,

    /// Delay between poll cycles
    pub poll_interval: Duration,

    /// Max notifications fetched per cycle
    pub batch_size: usize,

    /// Concurrent per-mention processing within a cycle
    pub fan_out: usize,

    /// Requests allowed per principal per window
    pub rate_limit: u64,

    /// Rate-limit window length
    pub rate_window: Duration,

    /// Log level
    pub log_level: String,

    /// Log format (json or pretty)
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            stream_prefix: "kaiku".to_string(),
            metrics_addr: "0.0.0.0:9090".parse().expect("static addr"),
            source_url: "http://localhost:8080/notifications".to_string(),
            source_token: None,
            poller_id: "poller-1".to_string(),
            poll_interval: Duration::from_secs(30),
            batch_size: 50,
            fan_out: 5,
            rate_limit: 10,
            rate_window: Duration::from_secs(60),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(url) = env::var("KAIKU_REDIS_URL") {
            config.redis_url = url;
        }

        if let Ok(prefix) = env::var("KAIKU_STREAM_PREFIX") {
            config.stream_prefix = prefix;
        }

        if let Ok(addr) = env::var("KAIKU_METRICS_ADDR") {
            config.metrics_addr = addr
                .parse()
                .map_err(|e| KaikuError::Config(format!("invalid KAIKU_METRICS_ADDR: {e}")))?;
        }

        if let Ok(url) = env::var("KAIKU_SOURCE_URL") {
            config.source_url = url;
        }

        if let Ok(token) = env::var("KAIKU_SOURCE_TOKEN") {
            config.source_token = Some(token);
        }

        if let Ok(id) = env::var("KAIKU_POLLER_ID") {
            config.poller_id = id;
        }

        if let Ok(interval) = env::var("KAIKU_POLL_INTERVAL_MS") {
            let ms: u64 = interval
                .parse()
                .map_err(|e| KaikuError::Config(format!("invalid KAIKU_POLL_INTERVAL_MS: {e}")))?;
            config.poll_interval = Duration::from_millis(ms);
        }

        if let Ok(size) = env::var("KAIKU_BATCH_SIZE") {
            config.batch_size = size
                .parse()
                .map_err(|e| KaikuError::Config(format!("invalid KAIKU_BATCH_SIZE: {e}")))?;
        }

        if let Ok(fan_out) = env::var("KAIKU_FAN_OUT") {
            config.fan_out = fan_out
                .parse()
                .map_err(|e| KaikuError::Config(format!("invalid KAIKU_FAN_OUT: {e}")))?;
        }

        if let Ok(limit) = env::var("KAIKU_RATE_LIMIT") {
            config.rate_limit = limit
                .parse()
                .map_err(|e| KaikuError::Config(format!("invalid KAIKU_RATE_LIMIT: {e}")))?;
        }

        if let Ok(secs) = env::var("KAIKU_RATE_WINDOW_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|e| KaikuError::Config(format!("invalid KAIKU_RATE_WINDOW_SECS: {e}")))?;
            config.rate_window = Duration::from_secs(secs);
        }

        if let Ok(level) = env::var("KAIKU_LOG_LEVEL") {
            config.log_level = level;
        }

        if let Ok(format) = env::var("KAIKU_LOG_FORMAT") {
            config.log_format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => {
                    return Err(KaikuError::Config(format!(
                        "invalid KAIKU_LOG_FORMAT: {other} (expected 'json' or 'pretty')"
                    )));
                }
            };
        }

        Ok(config)
    }
}
