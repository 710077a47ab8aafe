//! Action worker dispatch
//!
//! Consumes `mention.action.requested.v1` in a competing consumer group
//! and hands each request to the registered [`ActionHandler`] for its
//! intent. The handlers themselves (summarizer, fact-checker) are external
//! collaborators that build prompts and publish replies; this module owns
//! the dispatch loop, the idempotency guard around execution, mention
//! status transitions, and the completion/failure events.

use crate::bus::{EventBus, EventHandler};
use crate::classify::Intent;
use crate::error::{HandlerError, KaikuError};
use crate::event::{ActionRequest, Envelope, EventPayload};
use crate::idempotency::IdempotencyGuard;
use crate::mention::MentionStatus;
use crate::store::MentionStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Consumer group the workers join
pub const WORKER_GROUP: &str = "action-workers";

/// One action implementation (summarize, fact-check, ...)
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Handler name for logging
    fn name(&self) -> &'static str;

    /// Perform the action; returns an opaque receipt (e.g. the reply id)
    async fn execute(&self, request: &ActionRequest) -> Result<String, HandlerError>;
}

/// Dispatches action requests to intent-specific handlers
pub struct ActionWorker {
    handlers: HashMap<Intent, Arc<dyn ActionHandler>>,
    store: Arc<dyn MentionStore>,
    bus: Arc<dyn EventBus>,
    guard: IdempotencyGuard,
    idempotency_ttl: Duration,
}

impl ActionWorker {
    pub fn new(
        store: Arc<dyn MentionStore>,
        bus: Arc<dyn EventBus>,
        guard: IdempotencyGuard,
        idempotency_ttl: Duration,
    ) -> Self {
        Self {
            handlers: HashMap::new(),
            store,
            bus,
            guard,
            idempotency_ttl,
        }
    }

    /// Register a handler for an intent
    pub fn handler(mut self, intent: Intent, handler: Arc<dyn ActionHandler>) -> Self {
        self.handlers.insert(intent, handler);
        self
    }

    /// Execute one request and emit the terminal event
    async fn execute(
        &self,
        handler: &Arc<dyn ActionHandler>,
        request: &ActionRequest,
    ) -> Result<String, KaikuError> {
        self.set_status(&request.mention_id, MentionStatus::Processing, None)
            .await;

        match handler.execute(request).await {
            Ok(receipt) => {
                self.set_status(&request.mention_id, MentionStatus::Completed, None)
                    .await;
                let envelope = Envelope::new(EventPayload::ActionCompleted {
                    mention_id: request.mention_id.clone(),
                    intent: request.intent,
                })
                .with_correlation_id(request.mention_id.clone());
                self.bus.emit(envelope).await?;
                info!(
                    mention = %request.mention_id,
                    intent = %request.intent,
                    handler = handler.name(),
                    "action completed"
                );
                Ok(receipt)
            }
            Err(err) => {
                self.set_status(
                    &request.mention_id,
                    MentionStatus::Failed,
                    Some(&err.to_string()),
                )
                .await;
                let envelope = Envelope::new(EventPayload::ActionFailed {
                    mention_id: request.mention_id.clone(),
                    intent: Some(request.intent),
                    reason: err.to_string(),
                })
                .with_correlation_id(request.mention_id.clone());
                if let Err(emit_err) = self.bus.emit(envelope).await {
                    warn!(mention = %request.mention_id, error = %emit_err, "failed to emit failure event");
                }
                Err(KaikuError::Source(format!(
                    "action handler '{}' failed: {err}",
                    handler.name()
                )))
            }
        }
    }

    /// Status updates are best-effort; events are the source of truth
    async fn set_status(&self, mention_id: &str, status: MentionStatus, error: Option<&str>) {
        if let Err(err) = self.store.update_status(mention_id, status, error).await {
            warn!(mention = %mention_id, status = status.as_str(), error = %err, "status update failed");
        }
    }
}

#[async_trait]
impl EventHandler for ActionWorker {
    fn name(&self) -> &'static str {
        "action-worker"
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let EventPayload::ActionRequested { request } = &envelope.payload else {
            warn!(id = %envelope.id, kind = %envelope.kind, "unexpected payload on action topic");
            return Ok(());
        };

        let handler = self.handlers.get(&request.intent).ok_or_else(|| {
            HandlerError::new(format!("no handler registered for intent {}", request.intent))
        })?;

        let key = envelope
            .key
            .clone()
            .unwrap_or_else(|| format!("action:{}", request.mention_id));

        let outcome = self
            .guard
            .guard::<String, _, _>(&key, self.idempotency_ttl, || {
                self.execute(handler, request)
            })
            .await
            .map_err(HandlerError::from)?;

        if !outcome.executed {
            debug!(mention = %request.mention_id, "action already handled elsewhere");
        }
        Ok(())
    }
}

/// Debug handler that prints actions instead of publishing replies
pub struct StdoutActionHandler;

#[async_trait]
impl ActionHandler for StdoutActionHandler {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn execute(&self, request: &ActionRequest) -> Result<String, HandlerError> {
        println!(
            "[kaiku] {} requested for {} by {}: {}",
            request.intent, request.post_id, request.author_id, request.content
        );
        Ok(format!("stdout:{}", request.mention_id))
    }
}
