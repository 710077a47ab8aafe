//! Circuit-breaker-protected ingestion poller
//!
//! The source has no push delivery, so a timer loop fetches notifications
//! at a persisted offset, normalizes them into mentions, and emits one
//! event per accepted mention. Three rules make this safe under retries
//! and crashes:
//!
//! 1. the durable offset advances only after a batch is fully processed
//!    without error, and always by the **raw** notification count — the
//!    source indexes notifications, not unique mentions;
//! 2. mention ingestion is idempotent (insert-if-absent plus the
//!    downstream idempotency guard), so re-fetching a partially failed
//!    batch re-processes successes as a no-op;
//! 3. the circuit breaker backs the loop off when the source is down,
//!    instead of letting the timer become a retry storm.

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};
use crate::bus::EventBus;
use crate::error::KaikuError;
use crate::event::{Envelope, EventPayload};
use crate::ingest::NotificationSource;
use crate::mention::Mention;
use crate::metrics;
use crate::store::MentionStore;
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Poller tuning
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Offset identity; one durable offset is kept per id
    pub poller_id: String,
    /// Delay between cycles while the breaker is closed
    pub poll_interval: Duration,
    /// Max notifications fetched per cycle
    pub batch_size: usize,
    /// Concurrent per-mention processing within a cycle
    pub fan_out: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poller_id: "poller-1".to_string(),
            poll_interval: Duration::from_secs(30),
            batch_size: 50,
            fan_out: 5,
        }
    }
}

/// What one poll cycle did
#[derive(Debug, Default, Clone, Copy)]
pub struct PollOutcome {
    /// Raw notifications returned by the source
    pub raw_count: usize,
    /// Mentions created by this cycle
    pub new_mentions: usize,
    /// Mentions already known (batch- or store-level)
    pub duplicates: usize,
    /// Non-mention or malformed notifications
    pub skipped: usize,
}

/// Shared health surface for the admin endpoint
pub struct PollerHealth {
    running: AtomicBool,
    offset: AtomicU64,
    breaker: Arc<CircuitBreaker>,
}

/// JSON body served by `/healthz`
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub running: bool,
    pub offset: u64,
    pub breaker: CircuitSnapshot,
}

impl PollerHealth {
    pub fn report(&self) -> HealthReport {
        HealthReport {
            running: self.running.load(Ordering::Relaxed),
            offset: self.offset.load(Ordering::Relaxed),
            breaker: self.breaker.snapshot(),
        }
    }
}

/// The ingestion poller
pub struct Poller {
    source: Arc<dyn NotificationSource>,
    store: Arc<dyn MentionStore>,
    bus: Arc<dyn EventBus>,
    breaker: Arc<CircuitBreaker>,
    health: Arc<PollerHealth>,
    config: PollerConfig,
}

impl Poller {
    pub fn new(
        source: Arc<dyn NotificationSource>,
        store: Arc<dyn MentionStore>,
        bus: Arc<dyn EventBus>,
        breaker_config: CircuitBreakerConfig,
        config: PollerConfig,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(breaker_config));
        let health = Arc::new(PollerHealth {
            running: AtomicBool::new(false),
            offset: AtomicU64::new(0),
            breaker: Arc::clone(&breaker),
        });
        Self {
            source,
            store,
            bus,
            breaker,
            health,
            config,
        }
    }

    /// Health surface, shared with the metrics server
    pub fn health(&self) -> Arc<PollerHealth> {
        Arc::clone(&self.health)
    }

    /// Breaker handle, mainly for tests and diagnostics
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run the timer loop until cancelled
    ///
    /// Cooperative: cancellation is honored between cycles, in-flight
    /// per-mention work completes first.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            poller_id = %self.config.poller_id,
            interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "poller started"
        );
        self.health.running.store(true, Ordering::Relaxed);

        loop {
            if self.breaker.allow_request() {
                let started = Instant::now();
                match self.poll_once().await {
                    Ok(outcome) => {
                        self.breaker.on_success();
                        metrics::try_observe_poll_cycle(started.elapsed().as_secs_f64());
                        debug!(
                            raw = outcome.raw_count,
                            new = outcome.new_mentions,
                            duplicates = outcome.duplicates,
                            skipped = outcome.skipped,
                            "poll cycle complete"
                        );
                    }
                    Err(err) => {
                        self.breaker.on_failure();
                        warn!(error = %err, "poll cycle failed");
                    }
                }
            } else {
                debug!("circuit open, skipping poll cycle");
            }

            metrics::try_set_breaker_state(self.breaker.state().as_str());

            let delay = self.breaker.next_delay(self.config.poll_interval);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.health.running.store(false, Ordering::Relaxed);
        info!(poller_id = %self.config.poller_id, "poller stopped");
    }

    /// One poll cycle; see the module docs for the offset rules
    pub async fn poll_once(&self) -> Result<PollOutcome, KaikuError> {
        let offset = self.store.load_offset(&self.config.poller_id).await?;
        self.health.offset.store(offset, Ordering::Relaxed);

        let raw = self.source.fetch(self.config.batch_size, offset).await?;
        let raw_count = raw.len();
        metrics::try_record_fetched(raw_count as u64);

        if raw_count == 0 {
            return Ok(PollOutcome::default());
        }

        // Normalize, dropping non-mentions and collapsing duplicates
        // within the batch while preserving source order.
        let received_at = Utc::now();
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        let mut skipped = 0usize;
        let mut duplicates = 0usize;
        for notification in &raw {
            match notification.to_mention(received_at) {
                Some(mention) => {
                    if seen.insert(mention.mention_id.clone()) {
                        candidates.push(mention);
                    } else {
                        duplicates += 1;
                    }
                }
                None => skipped += 1,
            }
        }

        if candidates.is_empty() {
            // Nothing actionable, but the source still counted these
            // items: advance past them or the next fetch returns the
            // same window forever.
            self.advance_offset(offset, raw_count).await?;
            return Ok(PollOutcome {
                raw_count,
                new_mentions: 0,
                duplicates,
                skipped,
            });
        }

        let candidate_count = candidates.len();
        let results: Vec<Result<bool, KaikuError>> = futures::stream::iter(candidates)
            .map(|mention| self.ingest_mention(mention))
            .buffer_unordered(self.config.fan_out.max(1))
            .collect()
            .await;

        let mut new_mentions = 0usize;
        let mut failed = 0usize;
        for result in results {
            match result {
                Ok(true) => new_mentions += 1,
                Ok(false) => duplicates += 1,
                Err(err) => {
                    failed += 1;
                    error!(error = %err, "mention ingestion failed");
                }
            }
        }

        if failed > 0 {
            // Offset untouched: the whole window is re-fetched next cycle
            // and the already-ingested mentions collapse to no-ops.
            return Err(KaikuError::BatchFailed {
                failed,
                total: candidate_count,
            });
        }

        self.advance_offset(offset, raw_count).await?;
        Ok(PollOutcome {
            raw_count,
            new_mentions,
            duplicates,
            skipped,
        })
    }

    /// Store the mention and emit its event
    ///
    /// Emits even when the mention already exists: a crash between insert
    /// and emit would otherwise swallow the event forever. Downstream
    /// consumers are guarded, so the duplicate collapses there.
    async fn ingest_mention(&self, mention: Mention) -> Result<bool, KaikuError> {
        let inserted = self.store.insert_if_absent(&mention).await?;
        metrics::try_record_ingested(if inserted { "new" } else { "duplicate" });

        let envelope = Envelope::new(EventPayload::MentionReceived {
            mention: mention.clone(),
        })
        .with_correlation_id(mention.mention_id.clone())
        .with_key(mention.mention_id.clone());
        self.bus.emit(envelope).await?;

        Ok(inserted)
    }

    async fn advance_offset(&self, from: u64, raw_count: usize) -> Result<(), KaikuError> {
        let next = from + raw_count as u64;
        self.store
            .persist_offset(&self.config.poller_id, next)
            .await?;
        self.health.offset.store(next, Ordering::Relaxed);
        metrics::try_set_offset(next);
        debug!(from, next, "offset advanced");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::breaker::{BackoffConfig, CircuitState};
    use crate::bus::MemoryEventBus;
    use crate::error::BusError;
    use crate::event::EventKind;
    use crate::ingest::RawNotification;
    use crate::store::{MemoryStore, MentionStore};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;

    fn notification(post: &str, author: &str) -> RawNotification {
        RawNotification(json!({
            "kind": "mention",
            "post_id": post,
            "author_id": author,
            "text": "hey @kaiku summarize this"
        }))
    }

    fn reply_notification() -> RawNotification {
        RawNotification(json!({"kind": "reply", "post_id": "p", "author_id": "a"}))
    }

    /// Source that replays scripted batches in order
    struct ScriptedSource {
        batches: Mutex<VecDeque<Result<Vec<RawNotification>, String>>>,
    }

    impl ScriptedSource {
        fn new(batches: Vec<Result<Vec<RawNotification>, String>>) -> Self {
            Self {
                batches: Mutex::new(batches.into()),
            }
        }
    }

    #[async_trait]
    impl NotificationSource for ScriptedSource {
        async fn fetch(
            &self,
            _limit: usize,
            _offset: u64,
        ) -> Result<Vec<RawNotification>, KaikuError> {
            match self.batches.lock().pop_front() {
                Some(Ok(batch)) => Ok(batch),
                Some(Err(msg)) => Err(KaikuError::Source(msg)),
                None => Ok(Vec::new()),
            }
        }
    }

    /// Bus wrapper that fails emits whose idempotency key matches
    struct EmitFailingBus {
        inner: Arc<MemoryEventBus>,
        fail_key: String,
    }

    #[async_trait]
    impl EventBus for EmitFailingBus {
        async fn emit(&self, envelope: Envelope) -> Result<String, BusError> {
            if envelope.key.as_deref() == Some(self.fail_key.as_str()) {
                return Err(BusError::Backend("injected emit failure".to_string()));
            }
            self.inner.emit(envelope).await
        }

        async fn subscribe(
            &self,
            kind: EventKind,
            group: &str,
            consumer: &str,
            handler: Arc<dyn crate::bus::EventHandler>,
            shutdown: CancellationToken,
        ) -> Result<tokio::task::JoinHandle<()>, BusError> {
            self.inner
                .subscribe(kind, group, consumer, handler, shutdown)
                .await
        }

        async fn initialize_streams(&self) -> Result<(), BusError> {
            self.inner.initialize_streams().await
        }
    }

    fn poller(
        source: Arc<dyn NotificationSource>,
        store: Arc<MemoryStore>,
        bus: Arc<dyn EventBus>,
    ) -> Poller {
        Poller::new(
            source,
            store,
            bus,
            CircuitBreakerConfig::default(),
            PollerConfig {
                poller_id: "test-poller".to_string(),
                poll_interval: Duration::from_millis(10),
                batch_size: 50,
                fan_out: 5,
            },
        )
    }

    #[tokio::test]
    async fn test_duplicates_collapse_but_offset_counts_raw() {
        // [A, A, B]: two events, offset advances by three.
        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![
            notification("post-a", "alice"),
            notification("post-a", "alice"),
            notification("post-b", "bob"),
        ])]));
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryEventBus::new());
        let poller = poller(source, store.clone(), bus.clone());

        let outcome = poller.poll_once().await.unwrap();
        assert_eq!(outcome.raw_count, 3);
        assert_eq!(outcome.new_mentions, 2);
        assert_eq!(outcome.duplicates, 1);

        assert_eq!(bus.len(EventKind::MentionReceived), 2);
        assert_eq!(store.load_offset("test-poller").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_partial_failure_leaves_offset_unchanged() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![
            notification("post-a", "alice"),
            notification("post-b", "bob"),
        ])]));
        let store = Arc::new(MemoryStore::new());
        let inner_bus = Arc::new(MemoryEventBus::new());
        let bus = Arc::new(EmitFailingBus {
            inner: inner_bus.clone(),
            fail_key: "post-b:bob".to_string(),
        });
        let poller = poller(source, store.clone(), bus);

        let result = poller.poll_once().await;
        assert!(matches!(
            result,
            Err(KaikuError::BatchFailed { failed: 1, .. })
        ));

        // Offset untouched; the successful mention is stored and its
        // event emitted.
        assert_eq!(store.load_offset("test-poller").await.unwrap(), 0);
        assert!(store.mention("post-a:alice").is_some());
        assert_eq!(inner_bus.len(EventKind::MentionReceived), 1);
    }

    #[tokio::test]
    async fn test_refetch_after_failure_is_idempotent() {
        let batch = vec![notification("post-a", "alice"), notification("post-b", "bob")];
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(batch.clone()),
            Ok(batch),
        ]));
        let store = Arc::new(MemoryStore::new());
        let inner_bus = Arc::new(MemoryEventBus::new());

        // First cycle fails on B.
        {
            let bus = Arc::new(EmitFailingBus {
                inner: inner_bus.clone(),
                fail_key: "post-b:bob".to_string(),
            });
            let poller = poller(source.clone(), store.clone(), bus);
            assert!(poller.poll_once().await.is_err());
        }

        // Both mentions were inserted before B's emit failed, so the retry
        // sees only duplicates — and still re-emits their events, completes
        // the batch and moves the offset.
        let poller = poller(source, store.clone(), inner_bus.clone());
        let outcome = poller.poll_once().await.unwrap();
        assert_eq!(outcome.new_mentions, 0);
        assert_eq!(outcome.duplicates, 2);
        assert_eq!(store.load_offset("test-poller").await.unwrap(), 2);
        assert_eq!(store.mention_count(), 2);
    }

    #[tokio::test]
    async fn test_non_mentions_advance_offset_without_events() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![
            reply_notification(),
            reply_notification(),
        ])]));
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryEventBus::new());
        let poller = poller(source, store.clone(), bus.clone());

        let outcome = poller.poll_once().await.unwrap();
        assert_eq!(outcome.skipped, 2);
        assert_eq!(bus.len(EventKind::MentionReceived), 0);
        assert_eq!(store.load_offset("test-poller").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_fetch_is_a_quiet_noop() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(Vec::new())]));
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryEventBus::new());
        let poller = poller(source, store.clone(), bus.clone());

        let outcome = poller.poll_once().await.unwrap();
        assert_eq!(outcome.raw_count, 0);
        assert_eq!(store.load_offset("test-poller").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_source_failure_propagates() {
        let source = Arc::new(ScriptedSource::new(vec![Err("api down".to_string())]));
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryEventBus::new());
        let poller = poller(source, store, bus);

        assert!(matches!(
            poller.poll_once().await,
            Err(KaikuError::Source(_))
        ));
    }

    /// Source that always fails, for breaker exercise
    struct DeadSource;

    #[async_trait]
    impl NotificationSource for DeadSource {
        async fn fetch(&self, _: usize, _: u64) -> Result<Vec<RawNotification>, KaikuError> {
            Err(KaikuError::Source("unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_run_loop_opens_breaker_on_sustained_failure() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryEventBus::new());
        let poller = Poller::new(
            Arc::new(DeadSource),
            store,
            bus,
            CircuitBreakerConfig {
                backoff: BackoffConfig {
                    base: Duration::from_millis(1),
                    multiplier: 1.0,
                    max: Duration::from_millis(2),
                    jitter: 0.0,
                },
                ..CircuitBreakerConfig::default()
            },
            PollerConfig {
                poll_interval: Duration::from_millis(1),
                ..PollerConfig::default()
            },
        );

        let shutdown = CancellationToken::new();
        let health = poller.health();

        tokio::select! {
            _ = poller.run(shutdown.clone()) => {}
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }
        shutdown.cancel();

        let report = health.report();
        assert_eq!(report.breaker.state, CircuitState::Open);
        assert!(report.breaker.failure_count >= 5);
    }

    #[tokio::test]
    async fn test_health_report_tracks_offset_and_running() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![notification(
            "post-a", "alice",
        )])]));
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryEventBus::new());
        let poller = poller(source, store, bus);
        let health = poller.health();

        assert!(!health.report().running);
        poller.poll_once().await.unwrap();
        assert_eq!(health.report().offset, 1);
    }
}
