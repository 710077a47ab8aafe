//! Mention: the normalized, deduplicated unit of work
//!
//! The ingestion API hands back raw notifications; one or more of them
//! collapse into a single [`Mention`]. The mention id is the idempotency
//! anchor for everything downstream, so it must be derived deterministically
//! from the source notification — never from wall-clock time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a mention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MentionStatus {
    /// Created by the poller on first sighting
    Received,
    /// An action worker picked it up
    Processing,
    /// A reply was published
    Completed,
    /// The action failed terminally
    Failed,
}

impl MentionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MentionStatus::Received => "received",
            MentionStatus::Processing => "processing",
            MentionStatus::Completed => "completed",
            MentionStatus::Failed => "failed",
        }
    }
}

/// A deduplicated @mention of the bot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mention {
    /// Stable id, see [`Mention::derive_id`]
    pub mention_id: String,
    /// The post containing the mention
    pub post_id: String,
    /// Author of that post
    pub author_id: String,
    /// Post text
    pub content: String,
    /// Permalink, when the source provides one
    pub url: Option<String>,
    /// First time the poller saw it
    pub received_at: DateTime<Utc>,
    pub status: MentionStatus,
    /// Last processing error, set when status moves to `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Mention {
    /// Derive the stable mention id from source identifiers
    ///
    /// Composite `"{post_id}:{author_id}"`. Stable across retries and
    /// across notification duplicates for the same post. Changing this
    /// scheme mid-deployment invalidates all stored idempotency history,
    /// so it is fixed here and nowhere else.
    pub fn derive_id(post_id: &str, author_id: &str) -> String {
        format!("{post_id}:{author_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_id_is_deterministic() {
        let a = Mention::derive_id("at://post/3kabc", "did:plc:alice");
        let b = Mention::derive_id("at://post/3kabc", "did:plc:alice");
        assert_eq!(a, b);
        assert_eq!(a, "at://post/3kabc:did:plc:alice");
    }

    #[test]
    fn test_derive_id_distinguishes_authors() {
        let a = Mention::derive_id("post-1", "alice");
        let b = Mention::derive_id("post-1", "bob");
        assert_ne!(a, b);
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&MentionStatus::Processing).expect("encode");
        assert_eq!(json, "\"processing\"");
    }
}
