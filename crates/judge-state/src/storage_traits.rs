//! Storage trait definitions for the replay guard
//!
//! `ReplayStore` is the single seam between the judge and whichever backend
//! remembers `(key_id, nonce)` pairs. Window checks and the fail-closed policy
//! live one layer up (the guard in `judge-core`); a store only has to make
//! insert-if-absent atomic.
//!
//! In-memory implementations are provided via the `fakes` module.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A single remembered nonce.
///
/// Unique on `(key_id, nonce)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRecord {
    /// Key id the request was signed with
    pub key_id: String,
    /// Caller-supplied nonce
    pub nonce: String,
    /// Request timestamp (epoch seconds) as claimed by the signer
    pub ts_epoch: i64,
}

impl ReplayRecord {
    pub fn new(key_id: impl Into<String>, nonce: impl Into<String>, ts_epoch: i64) -> Self {
        Self {
            key_id: key_id.into(),
            nonce: nonce.into(),
            ts_epoch,
        }
    }
}

/// Result of an insert-if-absent attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// First sighting; the record is now stored.
    Inserted,
    /// A record with the same `(key_id, nonce)` already exists.
    AlreadySeen,
}

impl InsertOutcome {
    pub fn is_inserted(self) -> bool {
        matches!(self, Self::Inserted)
    }
}

/// Replay nonce store.
///
/// Guarantees:
/// - `insert_if_absent` is atomic: of any number of concurrent calls with the
///   same `(key_id, nonce)`, at most one returns `Inserted`.
/// - `purge_older_than(cutoff)` removes only records with `ts_epoch < cutoff`.
/// - Errors are reported, never swallowed; callers decide the fail mode.
#[async_trait]
pub trait ReplayStore: Send + Sync {
    /// Store the record unless `(key_id, nonce)` is already present.
    async fn insert_if_absent(&self, record: &ReplayRecord) -> StorageResult<InsertOutcome>;

    /// Delete every record whose `ts_epoch` is strictly below `cutoff_epoch`.
    /// Returns the number of records removed when the backend reports it.
    async fn purge_older_than(&self, cutoff_epoch: i64) -> StorageResult<u64>;

    /// Cheap health check used by readiness checks.
    async fn ping(&self) -> StorageResult<()>;

    /// Short backend label for logs and readiness output.
    fn backend_name(&self) -> &'static str;
}
