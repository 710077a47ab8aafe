//! KAIKU - Mention-Driven Bot Backend
//!
//! An event-driven backend that ingests @mentions from a social protocol,
//! classifies intent, and dispatches work to action handlers that publish
//! replies. The interesting part is not the AI calls (thin trait seams) but
//! the substrate that makes an at-least-once pipeline behave correctly.
//!
//! # Architecture
//!
//! ```text
//! Source API ──► Poller ──► mention events ──► Router ──► action events ──► Workers
//!    (poll +      (offset,    (durable bus,     (guard,                      (guard,
//!     breaker)     dedupe)     groups, DLQ)      limits)                      replies)
//! ```
//!
//! Reliability rests on four pieces: a durable event bus with consumer
//! groups and dead-lettering, a distributed idempotency guard, a
//! circuit-breaker-protected poller with transactional offset advancement,
//! and a sliding-window rate limiter.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod breaker;
pub mod bus;
pub mod classify;
pub mod config;
pub mod error;
pub mod event;
pub mod idempotency;
pub mod ingest;
pub mod limiter;
pub mod mention;
pub mod metrics;
pub mod metrics_server;
pub mod poller;
pub mod router;
pub mod store;
pub mod worker;

pub use breaker::{BackoffConfig, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use bus::{EventBus, EventHandler, MemoryEventBus, RedisEventBus};
pub use classify::{Classification, Classifier, Intent, KeywordClassifier};
pub use config::Config;
pub use error::{BusError, HandlerError, KaikuError, Result, StoreError};
pub use event::{ActionRequest, Envelope, EventKind, EventPayload};
pub use idempotency::{GuardOutcome, IdempotencyGuard};
pub use ingest::{HttpNotificationSource, NotificationSource, RawNotification};
pub use limiter::{RateDecision, SlidingWindowLimiter};
pub use mention::{Mention, MentionStatus};
pub use poller::{Poller, PollerConfig};
pub use router::{Router, RouterConfig, RoutingDecision, RoutingOutcome};
pub use store::{MemoryStore, RedisStore};
pub use worker::{ActionHandler, ActionWorker, StdoutActionHandler};
