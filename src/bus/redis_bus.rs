//! Redis Streams event bus backend
//!
//! One stream per topic (`XADD`), one consumer group per subscriber group
//! (`XGROUP CREATE ... MKSTREAM`), competing consumers via `XREADGROUP`.
//!
//! # Checkpointing and redelivery
//!
//! A delivery loop's first reads use id `0`, draining entries that were
//! delivered to this consumer but never acknowledged (crash recovery);
//! once the backlog is empty it switches to `>` for new entries. Handler
//! success `XACK`s the entry. Handler failure appends a dead-letter
//! envelope to the dead-letter stream and then acks the original — if the
//! dead-letter append itself fails the original stays pending and is
//! redelivered on restart.

use crate::bus::{EventBus, EventHandler, dead_letter_envelope};
use crate::error::BusError;
use crate::event::{Envelope, EventKind};
use crate::metrics;
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Field under which the JSON envelope is stored in each stream entry
const ENVELOPE_FIELD: &str = "envelope";

/// Redis Streams bus
#[derive(Clone)]
pub struct RedisEventBus {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisEventBus {
    /// Wrap an existing connection manager
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    /// Connect to Redis and build a bus
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(BusError::from)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self::new(conn, prefix))
    }

    fn stream_key(&self, kind: EventKind) -> String {
        kind.stream_key(&self.prefix)
    }

    /// Create a consumer group, tolerating one that already exists
    async fn ensure_group(&self, key: &str, group: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let created: Result<(), redis::RedisError> =
            conn.xgroup_create_mkstream(key, group, "$").await;
        match created {
            Ok(()) => Ok(()),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn emit(&self, envelope: Envelope) -> Result<String, BusError> {
        let key = self.stream_key(envelope.kind);
        let json = envelope.to_json()?;
        let mut conn = self.conn.clone();
        let _stream_id: String = conn.xadd(&key, "*", &[(ENVELOPE_FIELD, &json)]).await?;
        metrics::try_record_emitted(envelope.kind.as_str());
        debug!(id = %envelope.id, topic = %envelope.kind, "emitted");
        Ok(envelope.id)
    }

    async fn subscribe(
        &self,
        kind: EventKind,
        group: &str,
        consumer: &str,
        handler: Arc<dyn EventHandler>,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>, BusError> {
        let key = self.stream_key(kind);
        self.ensure_group(&key, group).await?;

        let bus = self.clone();
        let group = group.to_string();
        let consumer = consumer.to_string();

        let handle = tokio::spawn(async move {
            debug!(topic = %kind, group, consumer, handler = handler.name(), "subscription started");
            // Drain our own unacked backlog before reading new entries.
            let mut from_backlog = true;

            while !shutdown.is_cancelled() {
                let read_id = if from_backlog { "0" } else { ">" };
                let options = StreamReadOptions::default()
                    .group(&group, &consumer)
                    .count(super::READ_BATCH)
                    .block(super::BLOCK_TIMEOUT_MS as usize);

                let mut conn = bus.conn.clone();
                let reply: StreamReadReply =
                    match conn.xread_options(&[&key], &[read_id], &options).await {
                        Ok(reply) => reply,
                        Err(err) => {
                            warn!(topic = %kind, group, error = %err, "stream read failed, retrying");
                            tokio::time::sleep(Duration::from_millis(super::READ_RETRY_DELAY_MS))
                                .await;
                            continue;
                        }
                    };

                let entries: Vec<_> = reply
                    .keys
                    .into_iter()
                    .flat_map(|stream| stream.ids)
                    .collect();

                if entries.is_empty() {
                    if from_backlog {
                        from_backlog = false;
                    }
                    continue;
                }

                let mut left_pending = false;
                for entry in entries {
                    let raw: Option<String> = entry.get(ENVELOPE_FIELD);
                    let envelope = raw.as_deref().and_then(|json| {
                        Envelope::from_json(json)
                            .map_err(|err| {
                                warn!(
                                    stream_id = %entry.id,
                                    topic = %kind,
                                    error = %err,
                                    "malformed envelope, skipping"
                                );
                            })
                            .ok()
                    });

                    let Some(envelope) = envelope else {
                        metrics::try_record_malformed(kind.as_str());
                        bus.ack(&key, &group, &entry.id).await;
                        continue;
                    };

                    match handler.handle(&envelope).await {
                        Ok(()) => {
                            bus.ack(&key, &group, &entry.id).await;
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
                            if kind == EventKind::DeadLetter {
                                // Never dead-letter the dead-letter topic.
                                bus.ack(&key, &group, &entry.id).await;
                                continue;
                            }
                            let dlq = dead_letter_envelope(&envelope, &group, &err.to_string());
                            match bus.emit(dlq).await {
                                Ok(_) => bus.ack(&key, &group, &entry.id).await,
                                Err(dlq_err) => {
                                    // Leave the entry pending: it will be
                                    // redelivered from the backlog.
                                    left_pending = true;
                                    error!(
                                        id = %envelope.id,
                                        error = %dlq_err,
                                        "dead-letter append failed, leaving entry pending"
                                    );
                                }
                            }
                        }
                    }
                }

                // A backlog read re-returns pending entries immediately;
                // don't spin on one that refuses to move.
                if from_backlog && left_pending {
                    tokio::time::sleep(Duration::from_millis(super::READ_RETRY_DELAY_MS)).await;
                }
            }
            debug!(topic = %kind, group, "subscription stopped");
        });

        Ok(handle)
    }

    async fn initialize_streams(&self) -> Result<(), BusError> {
        let dlq_key = self.stream_key(EventKind::DeadLetter);
        self.ensure_group(&dlq_key, super::DEAD_LETTER_GROUP).await
    }
}

impl RedisEventBus {
    async fn ack(&self, key: &str, group: &str, stream_id: &str) {
        let mut conn = self.conn.clone();
        let acked: Result<u64, redis::RedisError> = conn.xack(key, group, &[stream_id]).await;
        if let Err(err) = acked {
            warn!(stream_id, group, error = %err, "ack failed");
        }
    }
}

// Exercising this backend needs a live Redis server; the delivery contract
// is covered against the in-memory backend and the integration tests.
