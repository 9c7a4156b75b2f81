//! In-process replay stores
//!
//! `MemoryReplayStore` is a real backend for single-process deployments and
//! the default in tests. `FailingReplayStore` always errors, which lets
//! callers exercise their fail-closed path.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryReplayStore
// ---------------------------------------------------------------------------

/// Replay store backed by a `HashMap<(key_id, nonce), ts_epoch>`.
///
/// The whole check-and-insert runs under one lock, so it is atomic for every
/// task in the process. Other processes do not see it.
#[derive(Debug, Default)]
pub struct MemoryReplayStore {
    seen: Mutex<HashMap<(String, String), i64>>,
}

impl MemoryReplayStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nonces currently remembered.
    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ReplayStore for MemoryReplayStore {
    async fn insert_if_absent(&self, record: &ReplayRecord) -> StorageResult<InsertOutcome> {
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        let key = (record.key_id.clone(), record.nonce.clone());
        if seen.contains_key(&key) {
            return Ok(InsertOutcome::AlreadySeen);
        }
        seen.insert(key, record.ts_epoch);
        Ok(InsertOutcome::Inserted)
    }

    async fn purge_older_than(&self, cutoff_epoch: i64) -> StorageResult<u64> {
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        let before = seen.len();
        seen.retain(|_, ts| *ts >= cutoff_epoch);
        Ok((before - seen.len()) as u64)
    }

    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// FailingReplayStore
// ---------------------------------------------------------------------------

/// Store whose every operation fails with a backend error.
#[derive(Debug, Clone)]
pub struct FailingReplayStore {
    message: String,
}

impl FailingReplayStore {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Default for FailingReplayStore {
    fn default() -> Self {
        Self::new("replay backend unreachable")
    }
}

#[async_trait]
impl ReplayStore for FailingReplayStore {
    async fn insert_if_absent(&self, _record: &ReplayRecord) -> StorageResult<InsertOutcome> {
        Err(StorageError::Backend(self.message.clone()))
    }

    async fn purge_older_than(&self, _cutoff_epoch: i64) -> StorageResult<u64> {
        Err(StorageError::Backend(self.message.clone()))
    }

    async fn ping(&self) -> StorageResult<()> {
        Err(StorageError::Connection(self.message.clone()))
    }

    fn backend_name(&self) -> &'static str {
        "failing"
    }
}
