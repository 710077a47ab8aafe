//! Event envelope and topic catalog for KAIKU
//!
//! Every event on the bus is wrapped in an [`Envelope`]: a globally unique
//! id, a versioned topic name, a timestamp, optional correlation/idempotency
//! keys, and a typed payload. Payloads are a tagged union with one variant
//! per topic — consumers never poke at loose JSON maps.
//!
//! # Topic naming
//!
//! Topic names are fixed and versioned. Stream keys derive from them
//! deterministically: the version segment is dropped, dots become
//! underscores, and the configured namespace is prefixed:
//!
//! ```text
//! source.mention.received.v1  ──►  kaiku:source_mention_received
//! ```

use crate::classify::Intent;
use crate::mention::Mention;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The fixed set of topics this pipeline uses
///
/// This is deliberately not extensible: the bus serves this pipeline only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A new mention was accepted by the poller
    #[serde(rename = "source.mention.received.v1")]
    MentionReceived,

    /// The router resolved an intent and requests an action
    #[serde(rename = "mention.action.requested.v1")]
    ActionRequested,

    /// An action handler finished successfully
    #[serde(rename = "mention.action.completed.v1")]
    ActionCompleted,

    /// An action handler failed terminally
    #[serde(rename = "mention.action.failed.v1")]
    ActionFailed,

    /// Side topic for envelopes whose processing failed
    #[serde(rename = "pipeline.dead.letter.v1")]
    DeadLetter,
}

impl EventKind {
    /// Versioned wire name of this topic
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MentionReceived => "source.mention.received.v1",
            EventKind::ActionRequested => "mention.action.requested.v1",
            EventKind::ActionCompleted => "mention.action.completed.v1",
            EventKind::ActionFailed => "mention.action.failed.v1",
            EventKind::DeadLetter => "pipeline.dead.letter.v1",
        }
    }

    /// Derive the stream key for this topic under the given namespace
    ///
    /// Drops the trailing version segment and replaces dots with
    /// underscores, so key shapes stay stable across payload versions.
    pub fn stream_key(&self, prefix: &str) -> String {
        let name = self.as_str();
        let unversioned = name.rsplit_once('.').map(|(base, _)| base).unwrap_or(name);
        format!("{}:{}", prefix, unversioned.replace('.', "_"))
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload carried by a [`mention.action.requested.v1`] event
///
/// Everything an action handler needs to produce a reply, denormalized so
/// workers never have to re-read the mention store on the hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub mention_id: String,
    pub post_id: String,
    pub author_id: String,
    pub intent: Intent,
    pub content: String,
    pub url: Option<String>,
}

/// Tagged payload union, one variant per topic
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    MentionReceived {
        mention: Mention,
    },
    ActionRequested {
        request: ActionRequest,
    },
    ActionCompleted {
        mention_id: String,
        intent: Intent,
    },
    ActionFailed {
        mention_id: String,
        intent: Option<Intent>,
        reason: String,
    },
    DeadLetter {
        original_topic: String,
        group: String,
        reason: String,
        envelope: Box<Envelope>,
    },
}

impl EventPayload {
    /// The topic this payload belongs on
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::MentionReceived { .. } => EventKind::MentionReceived,
            EventPayload::ActionRequested { .. } => EventKind::ActionRequested,
            EventPayload::ActionCompleted { .. } => EventKind::ActionCompleted,
            EventPayload::ActionFailed { .. } => EventKind::ActionFailed,
            EventPayload::DeadLetter { .. } => EventKind::DeadLetter,
        }
    }
}

/// The durable, versioned wrapper around an event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Globally unique event id (ULID)
    pub id: String,

    /// Versioned topic name
    pub kind: EventKind,

    /// When the event was created
    pub timestamp: DateTime<Utc>,

    /// Threads all events stemming from one mention
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Idempotency hint for downstream consumers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Typed payload
    pub payload: EventPayload,
}

impl Envelope {
    /// Create an envelope with a fresh ULID and the current timestamp
    ///
    /// The topic is derived from the payload variant, so the two can
    /// never disagree.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            kind: payload.kind(),
            timestamp: Utc::now(),
            correlation_id: None,
            key: None,
            payload,
        }
    }

    /// Set the correlation id
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the idempotency key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Encode to the JSON wire form
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode from the JSON wire form
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
