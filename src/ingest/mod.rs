//! Ingestion of raw notifications
//!
//! The source API returns opaque JSON items whose shape varies by subtype
//! (mention vs. reply) and by API revision. Parsing is defensive: fields
//! are looked up along several known paths, missing fields yield `None`,
//! and nothing here ever panics on malformed input — a bad notification is
//! skipped, not fatal.

pub mod http;

use crate::error::KaikuError;
use crate::mention::{Mention, MentionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

pub use http::HttpNotificationSource;

/// Paginated notification feed collaborator
#[async_trait]
pub trait NotificationSource: Send + Sync {
    /// Fetch up to `limit` notifications starting at `offset`
    ///
    /// The offset indexes raw notifications on the source side, not
    /// deduplicated mentions — offset arithmetic must track it verbatim.
    async fn fetch(&self, limit: usize, offset: u64) -> Result<Vec<RawNotification>, KaikuError>;
}

/// One raw item from the source, kept as loose JSON
#[derive(Debug, Clone)]
pub struct RawNotification(pub Value);

impl RawNotification {
    /// Notification subtype, when present
    pub fn kind(&self) -> Option<&str> {
        self.0
            .get("kind")
            .or_else(|| self.0.get("type"))
            .or_else(|| self.0.get("reason"))
            .and_then(Value::as_str)
    }

    /// Walk a dotted path into the JSON, returning a string leaf
    fn str_at(&self, path: &[&str]) -> Option<String> {
        let mut node = &self.0;
        for segment in path {
            node = node.get(segment)?;
        }
        node.as_str().map(str::to_string)
    }

    fn first_str(&self, paths: &[&[&str]]) -> Option<String> {
        paths.iter().find_map(|path| self.str_at(path))
    }

    fn post_id(&self) -> Option<String> {
        self.first_str(&[&["post", "id"], &["post_id"], &["uri"]])
    }

    fn author_id(&self) -> Option<String> {
        self.first_str(&[&["author", "id"], &["author_id"], &["did"]])
    }

    fn content(&self) -> Option<String> {
        self.first_str(&[&["post", "text"], &["text"], &["content"]])
    }

    fn url(&self) -> Option<String> {
        self.first_str(&[&["post", "url"], &["url"]])
    }

    /// Convert to a mention, if this notification is one
    ///
    /// Returns `None` for non-mention subtypes and for items missing the
    /// identifiers the pipeline cannot work without.
    pub fn to_mention(&self, received_at: DateTime<Utc>) -> Option<Mention> {
        if self.kind() != Some("mention") {
            return None;
        }

        let post_id = self.post_id()?;
        let author_id = self.author_id()?;

        Some(Mention {
            mention_id: Mention::derive_id(&post_id, &author_id),
            post_id,
            author_id,
            // A mention with no readable text still routes; classification
            // will land on Unknown.
            content: self.content().unwrap_or_default(),
            url: self.url(),
            received_at,
            status: MentionStatus::Received,
            last_error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_shape_parses() {
        let raw = RawNotification(json!({
            "kind": "mention",
            "post": {
                "id": "at://post/3k",
                "text": "hey @kaiku tl;dr",
                "url": "https://social.example/3k"
            },
            "author": { "id": "did:plc:alice" }
        }));

        let mention = raw.to_mention(Utc::now()).expect("should parse");
        assert_eq!(mention.mention_id, "at://post/3k:did:plc:alice");
        assert_eq!(mention.content, "hey @kaiku tl;dr");
        assert_eq!(mention.url.as_deref(), Some("https://social.example/3k"));
        assert_eq!(mention.status, MentionStatus::Received);
    }

    #[test]
    fn test_flat_shape_parses() {
        let raw = RawNotification(json!({
            "type": "mention",
            "post_id": "p1",
            "author_id": "alice",
            "text": "fact check this"
        }));

        let mention = raw.to_mention(Utc::now()).expect("should parse");
        assert_eq!(mention.mention_id, "p1:alice");
        assert!(mention.url.is_none());
    }

    #[test]
    fn test_reply_subtype_is_not_a_mention() {
        let raw = RawNotification(json!({
            "kind": "reply",
            "post_id": "p1",
            "author_id": "alice"
        }));
        assert!(raw.to_mention(Utc::now()).is_none());
    }

    #[test]
    fn test_missing_identifiers_tolerated() {
        let no_author = RawNotification(json!({
            "kind": "mention",
            "post_id": "p1"
        }));
        assert!(no_author.to_mention(Utc::now()).is_none());

        let garbage = RawNotification(json!("not even an object"));
        assert!(garbage.to_mention(Utc::now()).is_none());
    }

    #[test]
    fn test_missing_text_yields_empty_content() {
        let raw = RawNotification(json!({
            "kind": "mention",
            "post_id": "p1",
            "author_id": "alice"
        }));
        let mention = raw.to_mention(Utc::now()).expect("should parse");
        assert_eq!(mention.content, "");
    }
}
