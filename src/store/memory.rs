//! In-memory store backend
//!
//! Implements every store trait over `parking_lot` maps. Used by tests and
//! single-process runs; the semantics mirror the Redis backend, including
//! marker TTLs and window trimming.

use crate::error::StoreError;
use crate::mention::{Mention, MentionStatus};
use crate::router::RoutingDecision;
use crate::store::{Blacklist, MarkerStore, MentionStore, WindowStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Inner {
    mentions: HashMap<String, Mention>,
    offsets: HashMap<String, u64>,
    decisions: Vec<RoutingDecision>,
    markers: HashMap<String, (String, Option<Instant>)>,
    windows: HashMap<String, Vec<(String, i64)>>,
    blocked: HashSet<String>,
}

/// Shared in-memory store
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block a principal (test/dev helper)
    pub fn block_principal(&self, principal: &str) {
        self.inner.lock().blocked.insert(principal.to_string());
    }

    /// Snapshot of the decision audit log
    pub fn decisions(&self) -> Vec<RoutingDecision> {
        self.inner.lock().decisions.clone()
    }

    /// Look up a stored mention by id
    pub fn mention(&self, mention_id: &str) -> Option<Mention> {
        self.inner.lock().mentions.get(mention_id).cloned()
    }

    /// Number of stored mentions
    pub fn mention_count(&self) -> usize {
        self.inner.lock().mentions.len()
    }

    fn marker_live(entry: &(String, Option<Instant>)) -> bool {
        entry.1.is_none_or(|expires| Instant::now() < expires)
    }
}

#[async_trait]
impl MentionStore for MemoryStore {
    async fn insert_if_absent(&self, mention: &Mention) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        if inner.mentions.contains_key(&mention.mention_id) {
            return Ok(false);
        }
        inner
            .mentions
            .insert(mention.mention_id.clone(), mention.clone());
        Ok(true)
    }

    async fn update_status(
        &self,
        mention_id: &str,
        status: MentionStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let mention = inner
            .mentions
            .get_mut(mention_id)
            .ok_or_else(|| StoreError::Decode(format!("unknown mention: {mention_id}")))?;
        mention.status = status;
        mention.last_error = error.map(str::to_string);
        Ok(())
    }

    async fn load_offset(&self, poller_id: &str) -> Result<u64, StoreError> {
        Ok(self.inner.lock().offsets.get(poller_id).copied().unwrap_or(0))
    }

    async fn persist_offset(&self, poller_id: &str, offset: u64) -> Result<(), StoreError> {
        self.inner
            .lock()
            .offsets
            .insert(poller_id.to_string(), offset);
        Ok(())
    }

    async fn record_decision(&self, decision: &RoutingDecision) -> Result<(), StoreError> {
        self.inner.lock().decisions.push(decision.clone());
        Ok(())
    }
}

#[async_trait]
impl MarkerStore for MemoryStore {
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.markers.get(key) {
            if Self::marker_live(entry) {
                return Ok(false);
            }
        }
        inner.markers.insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(true)
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.inner.lock().markers.insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .markers
            .get(key)
            .filter(|entry| Self::marker_live(entry))
            .map(|(value, _)| value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.lock().markers.remove(key);
        Ok(())
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn trim_and_count(&self, key: &str, cutoff_ms: i64) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let Some(window) = inner.windows.get_mut(key) else {
            return Ok(0);
        };
        window.retain(|(_, score)| *score >= cutoff_ms);
        Ok(window.len() as u64)
    }

    async fn oldest_score(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .windows
            .get(key)
            .and_then(|window| window.iter().map(|(_, score)| *score).min()))
    }

    async fn insert(
        &self,
        key: &str,
        member: &str,
        score_ms: i64,
        _expiry: Duration,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let window = inner.windows.entry(key.to_string()).or_default();
        window.push((member.to_string(), score_ms));
        window.sort_by_key(|(_, score)| *score);
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.inner.lock().windows.remove(key);
        Ok(())
    }
}

#[async_trait]
impl Blacklist for MemoryStore {
    async fn check(&self, principal: &str) -> Result<bool, StoreError> {
        Ok(!self.inner.lock().blocked.contains(principal))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn mention(id: &str) -> Mention {
        Mention {
            mention_id: id.to_string(),
            post_id: "p".to_string(),
            author_id: "a".to_string(),
            content: "hi".to_string(),
            url: None,
            received_at: Utc::now(),
            status: MentionStatus::Received,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn test_insert_if_absent_once() {
        let store = MemoryStore::new();
        assert!(store.insert_if_absent(&mention("m1")).await.unwrap());
        assert!(!store.insert_if_absent(&mention("m1")).await.unwrap());
        assert_eq!(store.mention_count(), 1);
    }

    #[tokio::test]
    async fn test_update_status_records_error() {
        let store = MemoryStore::new();
        store.insert_if_absent(&mention("m1")).await.unwrap();
        store
            .update_status("m1", MentionStatus::Failed, Some("boom"))
            .await
            .unwrap();

        let stored = store.mention("m1").unwrap();
        assert_eq!(stored.status, MentionStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_update_status_unknown_mention_errors() {
        let store = MemoryStore::new();
        let result = store
            .update_status("missing", MentionStatus::Completed, None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_offset_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.load_offset("poller-1").await.unwrap(), 0);
        store.persist_offset("poller-1", 42).await.unwrap();
        assert_eq!(store.load_offset("poller-1").await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_marker_ttl_expiry() {
        let store = MemoryStore::new();
        let ttl = Duration::from_millis(10);
        assert!(store.create_if_absent("k", "v1", ttl).await.unwrap());
        assert!(!store.create_if_absent("k", "v2", ttl).await.unwrap());

        tokio::time::sleep(Duration::from_millis(20)).await;

        // Expired marker behaves as absent.
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.create_if_absent("k", "v3", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_window_trim_and_oldest() {
        let store = MemoryStore::new();
        let exp = Duration::from_secs(120);
        store.insert("w", "r1", 100, exp).await.unwrap();
        store.insert("w", "r2", 200, exp).await.unwrap();
        store.insert("w", "r3", 300, exp).await.unwrap();

        assert_eq!(store.trim_and_count("w", 150).await.unwrap(), 2);
        assert_eq!(store.oldest_score("w").await.unwrap(), Some(200));

        store.clear("w").await.unwrap();
        assert_eq!(store.trim_and_count("w", 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blacklist() {
        let store = MemoryStore::new();
        assert!(store.check("alice").await.unwrap());
        store.block_principal("alice");
        assert!(!store.check("alice").await.unwrap());
    }
}
