//! Sliding-window rate limiter
//!
//! Per-principal admission control over a rolling window, backed by the
//! shared store's ordered timestamp sets so every process instance counts
//! against the same quota.
//!
//! Fail-open by design: when the backend is unavailable the request is
//! allowed and a warning logged — pipeline availability outranks strict
//! quota enforcement here.

use crate::store::WindowStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of a rate-limit check
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    /// Requests counted in the window, including this one when allowed
    pub current: u64,
    pub limit: u64,
    /// How long until the oldest counted request leaves the window
    pub retry_after: Option<Duration>,
}

/// Current window status for a principal
#[derive(Debug, Clone)]
pub struct RateStatus {
    pub current: u64,
    pub limit: u64,
}

/// Sliding-window limiter over a shared [`WindowStore`]
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    windows: Arc<dyn WindowStore>,
    limit: u64,
    window: Duration,
}

/// Keys expire a little after the window so an idle principal's set
/// disappears on its own.
const EXPIRY_BUFFER: Duration = Duration::from_secs(60);

impl SlidingWindowLimiter {
    pub fn new(windows: Arc<dyn WindowStore>, limit: u64, window: Duration) -> Self {
        Self {
            windows,
            limit,
            window,
        }
    }

    fn window_key(principal: &str) -> String {
        format!("rate:{principal}")
    }

    /// Check whether `principal` may make another request
    ///
    /// `request_id` makes the inserted member unique so two requests in the
    /// same millisecond both count.
    pub async fn check(&self, principal: &str, request_id: &str) -> RateDecision {
        match self.try_check(principal, request_id).await {
            Ok(decision) => decision,
            Err(err) => {
                warn!(principal, error = %err, "rate limiter backend unavailable, failing open");
                RateDecision {
                    allowed: true,
                    current: 0,
                    limit: self.limit,
                    retry_after: None,
                }
            }
        }
    }

    async fn try_check(
        &self,
        principal: &str,
        request_id: &str,
    ) -> Result<RateDecision, crate::error::StoreError> {
        let key = Self::window_key(principal);
        let now_ms = Utc::now().timestamp_millis();
        let cutoff_ms = now_ms - self.window.as_millis() as i64;

        let current = self.windows.trim_and_count(&key, cutoff_ms).await?;

        if current >= self.limit {
            let retry_after = match self.windows.oldest_score(&key).await? {
                Some(oldest_ms) => {
                    let remaining_ms =
                        (oldest_ms + self.window.as_millis() as i64 - now_ms).max(1);
                    Some(Duration::from_millis(remaining_ms as u64))
                }
                None => None,
            };
            debug!(principal, current, limit = self.limit, "rate limited");
            return Ok(RateDecision {
                allowed: false,
                current,
                limit: self.limit,
                retry_after,
            });
        }

        self.windows
            .insert(&key, request_id, now_ms, self.window + EXPIRY_BUFFER)
            .await?;

        Ok(RateDecision {
            allowed: true,
            current: current + 1,
            limit: self.limit,
            retry_after: None,
        })
    }

    /// Current count for a principal without admitting a request
    pub async fn status(&self, principal: &str) -> Result<RateStatus, crate::error::StoreError> {
        let key = Self::window_key(principal);
        let cutoff_ms = Utc::now().timestamp_millis() - self.window.as_millis() as i64;
        let current = self.windows.trim_and_count(&key, cutoff_ms).await?;
        Ok(RateStatus {
            current,
            limit: self.limit,
        })
    }

    /// Forget a principal's window entirely
    pub async fn clear(&self, principal: &str) -> Result<(), crate::error::StoreError> {
        self.windows.clear(&Self::window_key(principal)).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    fn limiter(limit: u64, window: Duration) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(Arc::new(MemoryStore::new()), limit, window)
    }

    #[tokio::test]
    async fn test_allows_under_limit() {
        let limiter = limiter(3, Duration::from_secs(60));

        for i in 0..3 {
            let decision = limiter.check("alice", &format!("r{i}")).await;
            assert!(decision.allowed, "request {i} should pass");
            assert_eq!(decision.current, i + 1);
        }
    }

    #[tokio::test]
    async fn test_fourth_request_rejected_with_retry_after() {
        let window = Duration::from_secs(60);
        let limiter = limiter(3, window);

        for i in 0..3 {
            limiter.check("alice", &format!("r{i}")).await;
        }

        let decision = limiter.check("alice", "r3").await;
        assert!(!decision.allowed);
        assert_eq!(decision.current, 3);
        let retry_after = decision.retry_after.expect("retry_after must be set");
        assert!(retry_after > Duration::ZERO && retry_after <= window);
    }

    #[tokio::test]
    async fn test_window_elapse_resets_count() {
        let limiter = limiter(1, Duration::from_millis(50));

        assert!(limiter.check("alice", "r0").await.allowed);
        assert!(!limiter.check("alice", "r1").await.allowed);

        tokio::time::sleep(Duration::from_millis(60)).await;

        let decision = limiter.check("alice", "r2").await;
        assert!(decision.allowed);
        assert_eq!(decision.current, 1);
    }

    #[tokio::test]
    async fn test_principals_are_independent() {
        let limiter = limiter(1, Duration::from_secs(60));
        assert!(limiter.check("alice", "r0").await.allowed);
        assert!(limiter.check("bob", "r0").await.allowed);
        assert!(!limiter.check("alice", "r1").await.allowed);
    }

    #[tokio::test]
    async fn test_status_and_clear() {
        let limiter = limiter(5, Duration::from_secs(60));
        limiter.check("alice", "r0").await;
        limiter.check("alice", "r1").await;

        let status = limiter.status("alice").await.unwrap();
        assert_eq!(status.current, 2);
        assert_eq!(status.limit, 5);

        limiter.clear("alice").await.unwrap();
        assert_eq!(limiter.status("alice").await.unwrap().current, 0);
    }

    /// Window store that always errors, to exercise fail-open
    struct BrokenWindows;

    #[async_trait]
    impl WindowStore for BrokenWindows {
        async fn trim_and_count(&self, _: &str, _: i64) -> Result<u64, StoreError> {
            Err(StoreError::Backend("down".to_string()))
        }
        async fn oldest_score(&self, _: &str) -> Result<Option<i64>, StoreError> {
            Err(StoreError::Backend("down".to_string()))
        }
        async fn insert(&self, _: &str, _: &str, _: i64, _: Duration) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".to_string()))
        }
        async fn clear(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_fail_open_on_backend_error() {
        let limiter = SlidingWindowLimiter::new(Arc::new(BrokenWindows), 1, Duration::from_secs(60));
        let decision = limiter.check("alice", "r0").await;
        assert!(decision.allowed, "backend outage must not block the pipeline");
    }
}
