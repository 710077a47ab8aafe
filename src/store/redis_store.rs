//! Redis store backend
//!
//! Key shapes under the configured namespace (default `kaiku`):
//!
//! ```text
//! kaiku:mention:<mention_id>   JSON mention record (SET NX on insert)
//! kaiku:offset:<poller_id>     integer polling offset
//! kaiku:decisions              capped list of routing decisions (audit)
//! kaiku:idem:<key>             idempotency marker with TTL (SET NX PX)
//! kaiku:rate:<principal>       sorted set of request timestamps
//! kaiku:blacklist              set of blocked principals
//! ```
//!
//! All multi-instance correctness rests on `SET NX`, `ZREMRANGEBYSCORE`
//! and friends being atomic on the server.

use crate::error::StoreError;
use crate::mention::{Mention, MentionStatus};
use crate::router::RoutingDecision;
use crate::store::{Blacklist, MarkerStore, MentionStore, WindowStore};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::time::Duration;

/// How many routing decisions the audit list retains
const DECISION_LOG_CAP: isize = 10_000;

/// Redis-backed shared store
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    /// Wrap an existing connection manager
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    /// Connect to Redis and build a store
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(StoreError::from)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self::new(conn, prefix))
    }

    fn mention_key(&self, mention_id: &str) -> String {
        format!("{}:mention:{}", self.prefix, mention_id)
    }

    fn offset_key(&self, poller_id: &str) -> String {
        format!("{}:offset:{}", self.prefix, poller_id)
    }

    fn decisions_key(&self) -> String {
        format!("{}:decisions", self.prefix)
    }

    fn marker_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    fn blacklist_key(&self) -> String {
        format!("{}:blacklist", self.prefix)
    }
}

#[async_trait]
impl MentionStore for RedisStore {
    async fn insert_if_absent(&self, mention: &Mention) -> Result<bool, StoreError> {
        let json =
            serde_json::to_string(mention).map_err(|e| StoreError::Decode(e.to_string()))?;
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.mention_key(&mention.mention_id))
            .arg(json)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn update_status(
        &self,
        mention_id: &str,
        status: MentionStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let key = self.mention_key(mention_id);
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(&key).await?;
        let raw = raw.ok_or_else(|| StoreError::Decode(format!("unknown mention: {mention_id}")))?;
        let mut mention: Mention =
            serde_json::from_str(&raw).map_err(|e| StoreError::Decode(e.to_string()))?;

        mention.status = status;
        mention.last_error = error.map(str::to_string);

        let json =
            serde_json::to_string(&mention).map_err(|e| StoreError::Decode(e.to_string()))?;
        let _: () = conn.set(&key, json).await?;
        Ok(())
    }

    async fn load_offset(&self, poller_id: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let offset: Option<u64> = conn.get(self.offset_key(poller_id)).await?;
        Ok(offset.unwrap_or(0))
    }

    async fn persist_offset(&self, poller_id: &str, offset: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(self.offset_key(poller_id), offset).await?;
        Ok(())
    }

    async fn record_decision(&self, decision: &RoutingDecision) -> Result<(), StoreError> {
        let json =
            serde_json::to_string(decision).map_err(|e| StoreError::Decode(e.to_string()))?;
        let key = self.decisions_key();
        let mut conn = self.conn.clone();
        let _: u64 = conn.rpush(&key, json).await?;
        let _: () = conn.ltrim(&key, -DECISION_LOG_CAP, -1).await?;
        Ok(())
    }
}

#[async_trait]
impl MarkerStore for RedisStore {
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.marker_key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.marker_key(key))
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(self.marker_key(key)).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: u64 = conn.del(self.marker_key(key)).await?;
        Ok(())
    }
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn trim_and_count(&self, key: &str, cutoff_ms: i64) -> Result<u64, StoreError> {
        let key = self.marker_key(key);
        let mut conn = self.conn.clone();
        // Exclusive upper bound: entries at exactly the cutoff survive.
        let _: u64 = conn
            .zrembyscore(&key, "-inf", format!("({cutoff_ms}"))
            .await?;
        let count: u64 = conn.zcard(&key).await?;
        Ok(count)
    }

    async fn oldest_score(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn.clone();
        let oldest: Vec<(String, i64)> = conn
            .zrange_withscores(self.marker_key(key), 0, 0)
            .await?;
        Ok(oldest.first().map(|(_, score)| *score))
    }

    async fn insert(
        &self,
        key: &str,
        member: &str,
        score_ms: i64,
        expiry: Duration,
    ) -> Result<(), StoreError> {
        let key = self.marker_key(key);
        let mut conn = self.conn.clone();
        let _: u64 = conn.zadd(&key, member, score_ms).await?;
        let _: bool = conn.expire(&key, expiry.as_secs() as i64).await?;
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: u64 = conn.del(self.marker_key(key)).await?;
        Ok(())
    }
}

#[async_trait]
impl Blacklist for RedisStore {
    async fn check(&self, principal: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let blocked: bool = conn.sismember(self.blacklist_key(), principal).await?;
        Ok(!blocked)
    }
}

// Behavior is covered by the memory backend tests, which mirror these
// semantics; exercising this file needs a live Redis server.
