//! Shared-store seams for KAIKU
//!
//! Every process instance talks to one shared store; correctness under
//! multiple instances relies on the store's atomic create-if-absent,
//! read-modify and trim primitives, never on process-local locks. The
//! traits here are the seams: Redis in production ([`redis_store`]),
//! in-memory for tests and single-process runs ([`memory`]).

pub mod memory;
pub mod redis_store;

use crate::error::StoreError;
use crate::mention::{Mention, MentionStatus};
use crate::router::RoutingDecision;
use async_trait::async_trait;
use std::time::Duration;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Persistence for mentions, polling offsets and routing decisions
#[async_trait]
pub trait MentionStore: Send + Sync {
    /// Insert a mention if no mention with its id exists yet
    ///
    /// Returns `true` when this call created the record. The atomicity of
    /// this operation is what makes re-polling a batch a no-op.
    async fn insert_if_absent(&self, mention: &Mention) -> Result<bool, StoreError>;

    /// Update a mention's lifecycle status
    async fn update_status(
        &self,
        mention_id: &str,
        status: MentionStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Load the durable polling offset for a poller identity (0 if unset)
    async fn load_offset(&self, poller_id: &str) -> Result<u64, StoreError>;

    /// Persist the polling offset for a poller identity
    async fn persist_offset(&self, poller_id: &str, offset: u64) -> Result<(), StoreError>;

    /// Append a routing decision to the audit log
    async fn record_decision(&self, decision: &RoutingDecision) -> Result<(), StoreError>;
}

/// Atomic key/value markers with TTL, for the idempotency guard
#[async_trait]
pub trait MarkerStore: Send + Sync {
    /// Atomically create `key -> value` only if the key is absent
    ///
    /// Returns `true` when the write happened. This is the primitive the
    /// at-most-one-IN_PROGRESS-writer invariant rests on.
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Unconditionally write `key -> value` with a TTL
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Read a marker, `None` when absent or expired
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Delete a marker
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Per-key ordered timestamp sets, for the sliding-window rate limiter
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Drop entries with score below `cutoff_ms`, return the surviving count
    async fn trim_and_count(&self, key: &str, cutoff_ms: i64) -> Result<u64, StoreError>;

    /// Score of the oldest surviving entry, `None` when the set is empty
    async fn oldest_score(&self, key: &str) -> Result<Option<i64>, StoreError>;

    /// Insert a member at the given score and refresh the key's expiry
    async fn insert(
        &self,
        key: &str,
        member: &str,
        score_ms: i64,
        expiry: Duration,
    ) -> Result<(), StoreError>;

    /// Remove the whole set
    async fn clear(&self, key: &str) -> Result<(), StoreError>;
}

/// Principal blacklist collaborator
#[async_trait]
pub trait Blacklist: Send + Sync {
    /// Returns `true` when the principal is allowed to use the bot
    async fn check(&self, principal: &str) -> Result<bool, StoreError>;
}
