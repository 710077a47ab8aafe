//! In-process event bus backend
//!
//! Per-topic `Vec` logs with one cursor per consumer group, protected by a
//! `parking_lot` mutex and a `Notify` for wakeups. Delivery claims a batch
//! by advancing the group cursor, then runs the handler outside the lock;
//! failures append to the dead-letter log exactly like the Redis backend.
//!
//! Single-process only — cross-instance delivery semantics come from
//! [`super::RedisEventBus`]. Tests use the extra inspection helpers here.

use crate::bus::{EventBus, EventHandler, dead_letter_envelope};
use crate::error::BusError;
use crate::event::{Envelope, EventKind};
use crate::metrics;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Default)]
struct TopicLog {
    entries: Vec<Envelope>,
    cursors: HashMap<String, usize>,
}

#[derive(Default)]
struct State {
    topics: Mutex<HashMap<EventKind, TopicLog>>,
    notify: Notify,
}

impl State {
    /// Claim the next batch for a (topic, group), advancing the cursor
    fn claim(&self, kind: EventKind, group: &str, max: usize) -> Vec<Envelope> {
        let mut topics = self.topics.lock();
        let log = topics.entry(kind).or_default();
        let cursor = log.cursors.entry(group.to_string()).or_insert(0);
        let end = (*cursor + max).min(log.entries.len());
        let batch = log.entries[*cursor..end].to_vec();
        *cursor = end;
        batch
    }

    fn push(&self, envelope: Envelope) {
        let kind = envelope.kind;
        self.topics
            .lock()
            .entry(kind)
            .or_default()
            .entries
            .push(envelope);
        self.notify.notify_waiters();
    }
}

/// In-memory bus for tests and single-process runs
#[derive(Default)]
pub struct MemoryEventBus {
    state: Arc<State>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// All envelopes ever emitted on a topic (inspection helper)
    pub fn entries(&self, kind: EventKind) -> Vec<Envelope> {
        self.state
            .topics
            .lock()
            .get(&kind)
            .map(|log| log.entries.clone())
            .unwrap_or_default()
    }

    /// Number of envelopes on a topic
    pub fn len(&self, kind: EventKind) -> usize {
        self.state
            .topics
            .lock()
            .get(&kind)
            .map(|log| log.entries.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn emit(&self, envelope: Envelope) -> Result<String, BusError> {
        let id = envelope.id.clone();
        metrics::try_record_emitted(envelope.kind.as_str());
        self.state.push(envelope);
        Ok(id)
    }

    async fn subscribe(
        &self,
        kind: EventKind,
        group: &str,
        consumer: &str,
        handler: Arc<dyn EventHandler>,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>, BusError> {
        let state = Arc::clone(&self.state);
        let group = group.to_string();
        let consumer = consumer.to_string();

        let handle = tokio::spawn(async move {
            debug!(topic = %kind, group, consumer, handler = handler.name(), "subscription started");
            loop {
                if shutdown.is_cancelled() {
                    break;
                }

                let batch = state.claim(kind, &group, super::READ_BATCH);
                if batch.is_empty() {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = state.notify.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(super::BLOCK_TIMEOUT_MS)) => {}
                    }
                    continue;
                }

                for envelope in batch {
                    match handler.handle(&envelope).await {
                        Ok(()) => {
                            debug!(id = %envelope.id, topic = %kind, group, "handled");
                        }
                        Err(err) => {
                            warn!(
                                id = %envelope.id,
                                topic = %kind,
                                group,
                                error = %err,
                                "handler failed, dead-lettering"
                            );
                            metrics::try_record_dead_lettered(kind.as_str(), &group);
                            if kind != EventKind::DeadLetter {
                                state.push(dead_letter_envelope(
                                    &envelope,
                                    &group,
                                    &err.to_string(),
                                ));
                            }
                        }
                    }
                }
            }
            debug!(topic = %kind, group, "subscription stopped");
        });

        Ok(handle)
    }

    async fn initialize_streams(&self) -> Result<(), BusError> {
        // Cursors are created lazily; the dead-letter group just needs its
        // checkpoint to exist so operators start from the log head.
        self.state
            .topics
            .lock()
            .entry(EventKind::DeadLetter)
            .or_default()
            .cursors
            .entry(super::DEAD_LETTER_GROUP.to_string())
            .or_insert(0);
        Ok(())
    }
}
