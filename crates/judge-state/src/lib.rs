//! Judge-State: persistence layer for the SLO judge
//!
//! This crate owns the only state the judge persists: replay-guard nonce
//! records. Everything above it is stateless or in-process.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: atomic insert-if-absent on `(key_id, nonce)` and TTL-based pruning.
//!
//! ## Key Components
//!
//! - `ReplayStore`: backend-agnostic trait (insert-if-absent, purge, ping)
//! - `SurrealReplayStore`: SurrealDB backend (in-memory, embedded file, or shared server)
//! - `fakes::MemoryReplayStore`: in-process backend, also used in tests

mod error;
pub mod fakes;
mod handle;
mod migrations;
pub mod storage_traits;

pub use error::StorageError;
pub use handle::{ReplayBackendConfig, SharedStoreConfig, SurrealReplayStore};
pub use storage_traits::{InsertOutcome, ReplayRecord, ReplayStore, StorageResult};
