//! HTTP notification source
//!
//! Queries the source's paginated feed with `{limit, offset}` and returns
//! the raw items. The response body is accepted either as a bare JSON
//! array or as an object with a `notifications` array — the feed's shape
//! has drifted before and may drift again.

use crate::error::KaikuError;
use crate::ingest::{NotificationSource, RawNotification};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Default request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Default connection timeout in seconds
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Paginated HTTP notification feed
pub struct HttpNotificationSource {
    client: Client,
    url: String,
    bearer_token: Option<String>,
}

impl HttpNotificationSource {
    /// Create a source for the given feed URL
    ///
    /// Uses default timeouts: 30s request timeout, 10s connection timeout
    ///
    /// # Errors
    /// Returns `KaikuError::Source` if the HTTP client cannot be created
    pub fn new(url: impl Into<String>) -> Result<Self, KaikuError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| KaikuError::Source(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
            bearer_token: None,
        })
    }

    /// Authenticate requests with a bearer token
    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Pull the notification array out of a response body
    fn parse_body(body: Value) -> Vec<RawNotification> {
        let items = match body {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("notifications") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        items.into_iter().map(RawNotification).collect()
    }
}

#[async_trait]
impl NotificationSource for HttpNotificationSource {
    async fn fetch(&self, limit: usize, offset: u64) -> Result<Vec<RawNotification>, KaikuError> {
        let mut request = self
            .client
            .get(&self.url)
            .query(&[("limit", limit.to_string()), ("offset", offset.to_string())]);

        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| KaikuError::Source(format!("fetch failed: {e}")))?
            .error_for_status()
            .map_err(|e| KaikuError::Source(format!("source returned error: {e}")))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| KaikuError::Source(format!("invalid response body: {e}")))?;

        let notifications = Self::parse_body(body);
        debug!(limit, offset, count = notifications.len(), "fetched notifications");
        Ok(notifications)
    }
}
