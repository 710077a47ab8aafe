//! Routing state machine
//!
//! Consumes `source.mention.received.v1` in a consumer group and decides,
//! once per mention, what the pipeline does with it:
//!
//! ```text
//! mention ──► blacklist ──► rate limit ──► classification ──► action event
//!              (fail-open)   (fail-open)    heuristic first,
//!                                           classifier fallback
//! ```
//!
//! The whole decision runs inside the idempotency guard keyed by the
//! mention id, so redelivered mention events never emit a second action
//! request. Every decision is persisted for audit even when no event is
//! emitted; audit persistence failures are logged, never fatal.

use crate::bus::{EventBus, EventHandler};
use crate::classify::{Classification, ClassificationSource, Classifier, Intent, KeywordClassifier};
use crate::error::{HandlerError, KaikuError};
use crate::event::{ActionRequest, Envelope, EventPayload};
use crate::idempotency::IdempotencyGuard;
use crate::limiter::SlidingWindowLimiter;
use crate::mention::Mention;
use crate::metrics;
use crate::store::{Blacklist, MentionStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Consumer group this router joins
pub const ROUTER_GROUP: &str = "router";

/// What the router decided for one mention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingOutcome {
    /// Author is blacklisted; no action
    Blocked,
    /// Author exceeded the rate limit; no action
    RateLimited,
    /// An action request was emitted
    Action,
    /// Intent could not be resolved confidently; no action
    Ignored,
}

/// Audit record, one per routed mention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub mention_id: String,
    pub outcome: RoutingOutcome,
    pub intent: Option<Intent>,
    pub confidence: f32,
    pub source: Option<ClassificationSource>,
    pub decided_at: DateTime<Utc>,
}

/// Router thresholds
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Heuristic results below this confidence fall through to the
    /// external classifier
    pub heuristic_floor: f32,
    /// Strict low threshold for the conservative Summary default; applies
    /// only to classifier-path results
    pub summary_default_floor: f32,
    /// TTL on routing idempotency markers
    pub idempotency_ttl: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            heuristic_floor: 0.6,
            summary_default_floor: 0.2,
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// The routing state machine
pub struct Router {
    store: Arc<dyn MentionStore>,
    bus: Arc<dyn EventBus>,
    limiter: SlidingWindowLimiter,
    blacklist: Arc<dyn Blacklist>,
    classifier: Arc<dyn Classifier>,
    guard: IdempotencyGuard,
    config: RouterConfig,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn MentionStore>,
        bus: Arc<dyn EventBus>,
        limiter: SlidingWindowLimiter,
        blacklist: Arc<dyn Blacklist>,
        classifier: Arc<dyn Classifier>,
        guard: IdempotencyGuard,
        config: RouterConfig,
    ) -> Self {
        Self {
            store,
            bus,
            limiter,
            blacklist,
            classifier,
            guard,
            config,
        }
    }

    /// Route one mention; the caller wraps this in the idempotency guard
    async fn route(&self, mention: &Mention) -> Result<RoutingDecision, KaikuError> {
        // 1. Blacklist, failing open on backend trouble.
        let allowed = match self.blacklist.check(&mention.author_id).await {
            Ok(allowed) => allowed,
            Err(err) => {
                warn!(author = %mention.author_id, error = %err, "blacklist check failed, failing open");
                true
            }
        };
        if !allowed {
            info!(mention = %mention.mention_id, author = %mention.author_id, "author blacklisted");
            return Ok(self
                .finish(mention, RoutingOutcome::Blocked, None, 0.0, None)
                .await);
        }

        // 2. Rate limit; the limiter fails open internally.
        let rate = self
            .limiter
            .check(&mention.author_id, &mention.mention_id)
            .await;
        if !rate.allowed {
            info!(
                mention = %mention.mention_id,
                author = %mention.author_id,
                current = rate.current,
                limit = rate.limit,
                "rate limited"
            );
            metrics::try_record_rate_limited();
            return Ok(self
                .finish(mention, RoutingOutcome::RateLimited, None, 0.0, None)
                .await);
        }

        // 3. Classification: cheap heuristic first, external fallback only
        //    below the confidence floor.
        let classification = self.classify(&mention.content).await;

        // 4./5. Emit for resolved intents; conservative default otherwise.
        match classification.intent {
            Intent::FactCheck | Intent::Summary => {
                let decision = self
                    .finish(
                        mention,
                        RoutingOutcome::Action,
                        Some(classification.intent),
                        classification.confidence,
                        Some(classification.source),
                    )
                    .await;
                self.emit_action(mention, classification.intent).await?;
                Ok(decision)
            }
            Intent::Unknown => {
                // Only a *successful* classifier response with very low
                // confidence defaults to Summary — never heuristics, never
                // classifier errors.
                let defaulted = classification.source == ClassificationSource::Classifier
                    && classification.confidence < self.config.summary_default_floor;

                if defaulted {
                    debug!(
                        mention = %mention.mention_id,
                        confidence = classification.confidence,
                        "low-confidence unknown, defaulting to summary"
                    );
                    let decision = self
                        .finish(
                            mention,
                            RoutingOutcome::Action,
                            Some(Intent::Summary),
                            classification.confidence,
                            Some(classification.source),
                        )
                        .await;
                    self.emit_action(mention, Intent::Summary).await?;
                    Ok(decision)
                } else {
                    Ok(self
                        .finish(
                            mention,
                            RoutingOutcome::Ignored,
                            Some(Intent::Unknown),
                            classification.confidence,
                            Some(classification.source),
                        )
                        .await)
                }
            }
        }
    }

    async fn classify(&self, content: &str) -> Classification {
        let heuristic = KeywordClassifier::classify(content);
        if heuristic.intent != Intent::Unknown
            && heuristic.confidence >= self.config.heuristic_floor
        {
            return heuristic;
        }

        match self.classifier.classify(content).await {
            Ok(classification) => classification,
            Err(err) => {
                warn!(error = %err, "classifier call failed");
                Classification {
                    intent: Intent::Unknown,
                    confidence: 0.0,
                    reason: format!("classifier error: {err}"),
                    source: ClassificationSource::ClassifierError,
                }
            }
        }
    }

    /// Build and persist the audit record; persistence failure is non-fatal
    async fn finish(
        &self,
        mention: &Mention,
        outcome: RoutingOutcome,
        intent: Option<Intent>,
        confidence: f32,
        source: Option<ClassificationSource>,
    ) -> RoutingDecision {
        let decision = RoutingDecision {
            mention_id: mention.mention_id.clone(),
            outcome,
            intent,
            confidence,
            source,
            decided_at: Utc::now(),
        };
        metrics::try_record_decision(outcome_label(outcome));
        if let Err(err) = self.store.record_decision(&decision).await {
            warn!(mention = %mention.mention_id, error = %err, "failed to persist routing decision");
        }
        decision
    }

    async fn emit_action(&self, mention: &Mention, intent: Intent) -> Result<(), KaikuError> {
        let envelope = Envelope::new(EventPayload::ActionRequested {
            request: ActionRequest {
                mention_id: mention.mention_id.clone(),
                post_id: mention.post_id.clone(),
                author_id: mention.author_id.clone(),
                intent,
                content: mention.content.clone(),
                url: mention.url.clone(),
            },
        })
        .with_correlation_id(mention.mention_id.clone())
        .with_key(format!("action:{}", mention.mention_id));

        self.bus.emit(envelope).await?;
        info!(mention = %mention.mention_id, intent = %intent, "action requested");
        Ok(())
    }
}

fn outcome_label(outcome: RoutingOutcome) -> &'static str {
    match outcome {
        RoutingOutcome::Blocked => "blocked",
        RoutingOutcome::RateLimited => "rate_limited",
        RoutingOutcome::Action => "action",
        RoutingOutcome::Ignored => "ignored",
    }
}

#[async_trait]
impl EventHandler for Router {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let EventPayload::MentionReceived { mention } = &envelope.payload else {
            // Wrong-topic payloads are skipped, not dead-lettered.
            warn!(id = %envelope.id, kind = %envelope.kind, "unexpected payload on mention topic");
            return Ok(());
        };

        let key = format!("route:{}", mention.mention_id);
        let outcome = self
            .guard
            .guard::<RoutingDecision, _, _>(&key, self.config.idempotency_ttl, || {
                self.route(mention)
            })
            .await
            .map_err(HandlerError::from)?;

        if !outcome.executed {
            debug!(mention = %mention.mention_id, "routing already handled elsewhere");
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::bus::MemoryEventBus;
    use crate::event::EventKind;
    use crate::mention::MentionStatus;
    use crate::store::MemoryStore;

    struct FixedClassifier(Classification);

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify(&self, _: &str) -> Result<Classification, KaikuError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenClassifier;

    #[async_trait]
    impl Classifier for BrokenClassifier {
        async fn classify(&self, _: &str) -> Result<Classification, KaikuError> {
            Err(KaikuError::Classifier("api down".to_string()))
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        bus: Arc<MemoryEventBus>,
        router: Router,
    }

    fn harness(classifier: Arc<dyn Classifier>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryEventBus::new());
        let limiter =
            SlidingWindowLimiter::new(store.clone(), 10, Duration::from_secs(60));
        let router = Router::new(
            store.clone(),
            bus.clone(),
            limiter,
            store.clone(),
            classifier,
            IdempotencyGuard::new(store.clone()),
            RouterConfig::default(),
        );
        Harness { store, bus, router }
    }

    fn classifier_result(intent: Intent, confidence: f32) -> Arc<dyn Classifier> {
        Arc::new(FixedClassifier(Classification {
            intent,
            confidence,
            reason: "stub".to_string(),
            source: ClassificationSource::Classifier,
        }))
    }

    fn mention(id: &str, content: &str) -> Mention {
        Mention {
            mention_id: id.to_string(),
            post_id: "post".to_string(),
            author_id: "alice".to_string(),
            content: content.to_string(),
            url: None,
            received_at: Utc::now(),
            status: MentionStatus::Received,
            last_error: None,
        }
    }

    fn mention_event(id: &str, content: &str) -> Envelope {
        Envelope::new(EventPayload::MentionReceived {
            mention: mention(id, content),
        })
    }

    fn requested_intents(bus: &MemoryEventBus) -> Vec<Intent> {
        bus.entries(EventKind::ActionRequested)
            .into_iter()
            .map(|e| match e.payload {
                EventPayload::ActionRequested { request } => request.intent,
                other => panic!("unexpected payload: {other:?}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_heuristic_fact_check_emits_action() {
        let h = harness(classifier_result(Intent::Unknown, 0.0));
        h.router
            .handle(&mention_event("m1", "please fact check this claim"))
            .await
            .unwrap();

        assert_eq!(requested_intents(&h.bus), vec![Intent::FactCheck]);
        let decisions = h.store.decisions();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].outcome, RoutingOutcome::Action);
    }

    #[tokio::test]
    async fn test_tie_break_routes_to_fact_check() {
        let h = harness(classifier_result(Intent::Unknown, 0.0));
        h.router
            .handle(&mention_event("m1", "fact check this and summarize it too"))
            .await
            .unwrap();

        assert_eq!(requested_intents(&h.bus), vec![Intent::FactCheck]);
    }

    #[tokio::test]
    async fn test_blacklisted_author_no_event() {
        let h = harness(classifier_result(Intent::Summary, 0.9));
        h.store.block_principal("alice");

        h.router
            .handle(&mention_event("m1", "summarize this"))
            .await
            .unwrap();

        assert_eq!(h.bus.len(EventKind::ActionRequested), 0);
        let decisions = h.store.decisions();
        assert_eq!(decisions[0].outcome, RoutingOutcome::Blocked);
    }

    #[tokio::test]
    async fn test_rate_limited_no_event() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryEventBus::new());
        let limiter = SlidingWindowLimiter::new(store.clone(), 1, Duration::from_secs(60));
        let router = Router::new(
            store.clone(),
            bus.clone(),
            limiter,
            store.clone(),
            classifier_result(Intent::Summary, 0.9),
            IdempotencyGuard::new(store.clone()),
            RouterConfig::default(),
        );

        router
            .handle(&mention_event("m1", "summarize this"))
            .await
            .unwrap();
        router
            .handle(&mention_event("m2", "summarize this"))
            .await
            .unwrap();

        assert_eq!(bus.len(EventKind::ActionRequested), 1);
        let outcomes: Vec<_> = store.decisions().iter().map(|d| d.outcome).collect();
        assert_eq!(
            outcomes,
            vec![RoutingOutcome::Action, RoutingOutcome::RateLimited]
        );
    }

    #[tokio::test]
    async fn test_classifier_fallback_resolves_intent() {
        // No keywords, so the heuristic punts to the classifier.
        let h = harness(classifier_result(Intent::FactCheck, 0.8));
        h.router
            .handle(&mention_event("m1", "hmm, what do you make of this?"))
            .await
            .unwrap();

        assert_eq!(requested_intents(&h.bus), vec![Intent::FactCheck]);
    }

    #[tokio::test]
    async fn test_unknown_at_half_confidence_never_defaults() {
        let h = harness(classifier_result(Intent::Unknown, 0.5));
        h.router
            .handle(&mention_event("m1", "hello there bot"))
            .await
            .unwrap();

        assert_eq!(h.bus.len(EventKind::ActionRequested), 0);
        assert_eq!(h.store.decisions()[0].outcome, RoutingOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_very_low_confidence_classifier_defaults_to_summary() {
        let h = harness(classifier_result(Intent::Unknown, 0.1));
        h.router
            .handle(&mention_event("m1", "hello there bot"))
            .await
            .unwrap();

        assert_eq!(requested_intents(&h.bus), vec![Intent::Summary]);
    }

    #[tokio::test]
    async fn test_classifier_error_never_defaults() {
        let h = harness(Arc::new(BrokenClassifier));
        h.router
            .handle(&mention_event("m1", "hello there bot"))
            .await
            .unwrap();

        assert_eq!(h.bus.len(EventKind::ActionRequested), 0);
        let decision = &h.store.decisions()[0];
        assert_eq!(decision.outcome, RoutingOutcome::Ignored);
        assert_eq!(decision.source, Some(ClassificationSource::ClassifierError));
    }

    #[tokio::test]
    async fn test_redelivery_emits_exactly_one_action() {
        let h = harness(classifier_result(Intent::Unknown, 0.0));
        let event = mention_event("m1", "summarize this thread");

        h.router.handle(&event).await.unwrap();
        h.router.handle(&event).await.unwrap();

        assert_eq!(h.bus.len(EventKind::ActionRequested), 1);
    }
}
