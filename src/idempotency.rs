//! Distributed idempotency guard
//!
//! `guard(key, ttl, op)` runs `op` at most once per key across all process
//! instances, riding on the store's atomic create-if-absent primitive.
//!
//! ```text
//! caller A ──SET NX──► wins  ──► runs op ──► stores Done{result}
//! caller B ──SET NX──► loses ──► reads marker:
//!                                  InProgress ──► executed=false, no result
//!                                  Done       ──► executed=false, replayed result
//! ```
//!
//! On an `op` error the winner deletes its InProgress marker before the
//! error propagates, re-opening the key for retry — a failure is never
//! converted into a success.

use crate::error::{KaikuError, StoreError};
use crate::store::MarkerStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Stored marker value
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
enum IdempotencyRecord {
    InProgress,
    Done { result: serde_json::Value },
}

/// Outcome of a guarded call
#[derive(Debug)]
pub struct GuardOutcome<T> {
    /// Whether this call ran the operation
    pub executed: bool,
    /// The result — fresh if `executed`, replayed if a terminal result was
    /// already stored, `None` while another execution owns the key
    pub result: Option<T>,
}

/// Once-only executor keyed by a string
#[derive(Clone)]
pub struct IdempotencyGuard {
    markers: Arc<dyn MarkerStore>,
}

impl IdempotencyGuard {
    pub fn new(markers: Arc<dyn MarkerStore>) -> Self {
        Self { markers }
    }

    fn marker_key(key: &str) -> String {
        format!("idem:{key}")
    }

    /// Run `op` at most once for `key`
    ///
    /// Backend unavailability propagates as an error; the atomic
    /// create-if-absent write prevents double execution while the backend
    /// is healthy.
    pub async fn guard<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        op: F,
    ) -> Result<GuardOutcome<T>, KaikuError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, KaikuError>>,
    {
        let marker_key = Self::marker_key(key);
        let in_progress = serde_json::to_string(&IdempotencyRecord::InProgress)?;

        let won = self
            .markers
            .create_if_absent(&marker_key, &in_progress, ttl)
            .await?;

        if !won {
            return self.replay(&marker_key).await;
        }

        // Sole executor for this key.
        let result = match op().await {
            Ok(result) => result,
            Err(err) => {
                // Re-open the key before propagating. If the delete itself
                // fails the marker still expires via its TTL.
                if let Err(del_err) = self.markers.delete(&marker_key).await {
                    warn!(key, error = %del_err, "failed to release idempotency marker");
                }
                return Err(err);
            }
        };

        let record = IdempotencyRecord::Done {
            result: serde_json::to_value(&result)?,
        };
        self.markers
            .put(&marker_key, &serde_json::to_string(&record)?, ttl)
            .await?;

        Ok(GuardOutcome {
            executed: true,
            result: Some(result),
        })
    }

    /// Lost the create-if-absent race: report what the winner left behind
    async fn replay<T: DeserializeOwned>(
        &self,
        marker_key: &str,
    ) -> Result<GuardOutcome<T>, KaikuError> {
        let stored = self.markers.get(marker_key).await?;
        let record = match stored {
            // Marker expired between the failed create and this read.
            None => {
                return Ok(GuardOutcome {
                    executed: false,
                    result: None,
                });
            }
            Some(raw) => serde_json::from_str::<IdempotencyRecord>(&raw)
                .map_err(|e| StoreError::Decode(e.to_string()))?,
        };

        match record {
            IdempotencyRecord::InProgress => Ok(GuardOutcome {
                executed: false,
                result: None,
            }),
            IdempotencyRecord::Done { result } => Ok(GuardOutcome {
                executed: false,
                result: Some(
                    serde_json::from_value(result)
                        .map_err(|e| StoreError::Decode(e.to_string()))?,
                ),
            }),
        }
    }
}
