//! Circuit breaker for the ingestion source
//!
//! The ingestion API is an uncontrolled remote dependency; without backoff
//! a failing dependency turns the poll loop into a retry storm. The breaker
//! is the recovery mechanism for sustained failure — no separate retry
//! layer sits on top of it.
//!
//! ```text
//!            5 consecutive failures
//!   CLOSED ──────────────────────────► OPEN
//!     ▲                                  │ cool-down elapsed
//!     │ 2 consecutive successes          ▼
//!     └───────────────────────────── HALF_OPEN
//!                                        │ any failure
//!                                        └───────► OPEN
//! ```
//!
//! Counters are process-local on purpose: only one poll loop per process
//! mutates them. The lock exists solely so the health endpoint can read a
//! consistent snapshot.

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Backoff schedule applied while the breaker is not CLOSED
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First delay after a failure
    pub base: Duration,
    /// Growth factor per consecutive failure
    pub multiplier: f64,
    /// Ceiling for the computed delay
    pub max: Duration,
    /// Jitter fraction, e.g. 0.25 for ±25 %
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(300),
            jitter: 0.25,
        }
    }
}

/// Breaker thresholds
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before CLOSED → OPEN
    pub failure_threshold: u32,
    /// Time since the last failure before OPEN → HALF_OPEN
    pub cool_down: Duration,
    /// Consecutive HALF_OPEN successes before → CLOSED
    pub success_threshold: u32,
    pub backoff: BackoffConfig,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(60),
            success_threshold: 2,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Point-in-time view of the breaker, for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub consecutive_successes: u32,
    /// Seconds since the last failure, if any
    pub last_failure_secs: Option<u64>,
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
}

/// The breaker itself
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                consecutive_successes: 0,
                last_failure: None,
            }),
        }
    }

    /// Current state, promoting OPEN → HALF_OPEN once the cool-down elapsed
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            let cooled = inner
                .last_failure
                .map(|at| at.elapsed() >= self.config.cool_down)
                .unwrap_or(true);
            if cooled {
                inner.state = CircuitState::HalfOpen;
                inner.consecutive_successes = 0;
                info!("circuit breaker half-open, probing source");
            }
        }
        inner.state
    }

    /// Whether an attempt may be made right now
    pub fn allow_request(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Record a successful attempt
    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.consecutive_successes = 0;
                    info!("circuit breaker closed, source recovered");
                }
            }
            // Success cannot be observed while OPEN: attempts are gated.
            CircuitState::Open => {}
        }
    }

    /// Record a failed attempt
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.consecutive_successes = 0;
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    warn!(
                        failures = inner.failure_count,
                        "circuit breaker opened after consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                warn!("circuit breaker re-opened, probe failed");
            }
            CircuitState::Open => {}
        }
    }

    /// Delay until the next attempt
    ///
    /// Fixed poll interval while CLOSED; exponential backoff with jitter
    /// otherwise: `min(max, base × multiplier^failures) ± jitter`.
    pub fn next_delay(&self, poll_interval: Duration) -> Duration {
        let (state, failures) = {
            let inner = self.inner.lock();
            (inner.state, inner.failure_count)
        };

        if state == CircuitState::Closed {
            return poll_interval;
        }

        let backoff = &self.config.backoff;
        let exp = backoff.multiplier.powi(failures.min(32) as i32);
        let raw_ms = (backoff.base.as_millis() as f64 * exp).min(backoff.max.as_millis() as f64);

        let jitter_span = raw_ms * backoff.jitter;
        let jittered = if jitter_span > 0.0 {
            let offset = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
            (raw_ms + offset).max(0.0)
        } else {
            raw_ms
        };

        Duration::from_millis(jittered as u64)
    }

    /// Snapshot for the health surface
    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            consecutive_successes: inner.consecutive_successes,
            last_failure_secs: inner.last_failure.map(|at| at.elapsed().as_secs()),
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker_with_cooldown(cool_down: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            cool_down,
            ..CircuitBreakerConfig::default()
        })
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::default();

        for _ in 0..4 {
            breaker.on_failure();
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_success_resets_failure_count_while_closed() {
        let breaker = CircuitBreaker::default();
        for _ in 0..4 {
            breaker.on_failure();
        }
        breaker.on_success();
        assert_eq!(breaker.snapshot().failure_count, 0);

        // Needs a full run of failures again to open.
        for _ in 0..4 {
            breaker.on_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_cool_down_then_closes() {
        let breaker = breaker_with_cooldown(Duration::from_millis(10));
        for _ in 0..5 {
            breaker.on_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.on_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.on_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = breaker_with_cooldown(Duration::from_millis(10));
        for _ in 0..5 {
            breaker.on_failure();
        }
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_closed_delay_is_poll_interval() {
        let breaker = CircuitBreaker::default();
        let interval = Duration::from_secs(30);
        assert_eq!(breaker.next_delay(interval), interval);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            backoff: BackoffConfig {
                base: Duration::from_millis(100),
                multiplier: 2.0,
                max: Duration::from_secs(5),
                jitter: 0.0,
            },
            ..CircuitBreakerConfig::default()
        });

        for _ in 0..5 {
            breaker.on_failure();
        }
        // 100ms * 2^5 = 3200ms, under the cap.
        assert_eq!(
            breaker.next_delay(Duration::from_secs(1)),
            Duration::from_millis(3200)
        );

        for _ in 0..5 {
            breaker.on_failure();
        }
        // 2^10 would be 102s; capped at 5s.
        assert_eq!(
            breaker.next_delay(Duration::from_secs(1)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            backoff: BackoffConfig {
                base: Duration::from_millis(1000),
                multiplier: 1.0,
                max: Duration::from_secs(10),
                jitter: 0.25,
            },
            ..CircuitBreakerConfig::default()
        });
        // Open the breaker so the backoff path (with jitter) applies.
        for _ in 0..5 {
            breaker.on_failure();
        }

        for _ in 0..100 {
            let delay = breaker.next_delay(Duration::from_secs(1)).as_millis();
            assert!((750..=1250).contains(&delay), "jittered delay {delay}ms");
        }
    }
}
