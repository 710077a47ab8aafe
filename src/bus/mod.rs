//! Durable event bus
//!
//! Per-topic append-only logs with consumer-group checkpointing and a
//! dead-letter topic. Two backends behind one trait: Redis Streams in
//! production ([`redis_bus`]), an in-process log for tests and
//! single-process runs ([`memory`]).
//!
//! # Delivery contract
//!
//! - at-least-once per (topic, group); consumers within a group compete
//! - handler success acknowledges the entry
//! - handler failure moves the entry to the dead-letter topic immediately,
//!   tagged with group, original topic and failure reason — there is no
//!   bounded in-place retry before dead-lettering
//! - ordering holds only within one producer's sequential emits to one
//!   topic; there is no global ordering
//!
//! Malformed entries are logged, counted and acknowledged — they never
//! crash a delivery loop.

pub mod memory;
pub mod redis_bus;

use crate::error::{BusError, HandlerError};
use crate::event::{Envelope, EventKind, EventPayload};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use memory::MemoryEventBus;
pub use redis_bus::RedisEventBus;

/// Consumer group that owns the dead-letter topic for inspection/replay
pub const DEAD_LETTER_GROUP: &str = "operators";

/// Entries pulled per delivery-loop iteration
pub(crate) const READ_BATCH: usize = 16;

/// Blocking-poll cap, keeps shutdown responsive
pub(crate) const BLOCK_TIMEOUT_MS: u64 = 2_000;

/// Sleep after a transient read error before retrying
pub(crate) const READ_RETRY_DELAY_MS: u64 = 1_000;

/// Consumer callback for one subscription
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handler name for logging and dead-letter tags
    fn name(&self) -> &'static str;

    /// Process one envelope; an error dead-letters it
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

/// The bus seam
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Durably append an envelope; returns its event id without waiting on
    /// consumers
    async fn emit(&self, envelope: Envelope) -> Result<String, BusError>;

    /// Join (or create) a consumer group on a topic and spawn its delivery
    /// loop; the loop runs until `shutdown` is cancelled
    async fn subscribe(
        &self,
        kind: EventKind,
        group: &str,
        consumer: &str,
        handler: Arc<dyn EventHandler>,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>, BusError>;

    /// Idempotently ensure the dead-letter topic's consumer group exists;
    /// safe to call on every process start
    async fn initialize_streams(&self) -> Result<(), BusError>;
}

/// Wrap a failed envelope for the dead-letter topic
pub(crate) fn dead_letter_envelope(original: &Envelope, group: &str, reason: &str) -> Envelope {
    let mut dlq = Envelope::new(EventPayload::DeadLetter {
        original_topic: original.kind.to_string(),
        group: group.to_string(),
        reason: reason.to_string(),
        envelope: Box::new(original.clone()),
    });
    dlq.correlation_id = original.correlation_id.clone();
    dlq
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::event::EventPayload;
    use crate::mention::{Mention, MentionStatus};
    use chrono::Utc;

    #[test]
    fn test_dead_letter_envelope_tags() {
        let original = Envelope::new(EventPayload::MentionReceived {
            mention: Mention {
                mention_id: "p:a".to_string(),
                post_id: "p".to_string(),
                author_id: "a".to_string(),
                content: "hi".to_string(),
                url: None,
                received_at: Utc::now(),
                status: MentionStatus::Received,
                last_error: None,
            },
        })
        .with_correlation_id("p:a");

        let dlq = dead_letter_envelope(&original, "routers", "handler exploded");
        assert_eq!(dlq.kind, EventKind::DeadLetter);
        assert_eq!(dlq.correlation_id.as_deref(), Some("p:a"));
        match dlq.payload {
            EventPayload::DeadLetter {
                original_topic,
                group,
                reason,
                envelope,
            } => {
                assert_eq!(original_topic, "source.mention.received.v1");
                assert_eq!(group, "routers");
                assert_eq!(reason, "handler exploded");
                assert_eq!(envelope.id, original.id);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
