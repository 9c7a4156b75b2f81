//! SurrealDB replay store - connection and operations
//!
//! Three ways to back the replay guard, chosen by [`ReplayBackendConfig`]:
//! - `memory`: process-local map (see `fakes::MemoryReplayStore`)
//! - `embedded`: SurrealDB embedded on-disk engine (`surrealkv://<path>`)
//! - `shared`: a SurrealDB server reached over WebSocket, shared by replicas
//!
//! Both SurrealDB flavours use the record id `replay_nonce:[key_id, nonce]`,
//! so insert-if-absent is a single `CREATE` that the engine rejects when the
//! record already exists.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{debug, info, instrument, warn};

use crate::error::StorageError;
use crate::fakes::MemoryReplayStore;
use crate::migrations::{self, REPLAY_TABLE};
use crate::storage_traits::{InsertOutcome, ReplayRecord, ReplayStore, StorageResult};

const DEFAULT_NAMESPACE: &str = "judge";
const DEFAULT_DATABASE: &str = "replay";

/// Configuration for a shared SurrealDB server
#[derive(Debug, Clone)]
pub struct SharedStoreConfig {
    /// WebSocket endpoint URL (e.g., "wss://replay.internal:8000")
    pub endpoint: String,
    /// Database username
    pub username: String,
    /// Database password
    pub password: String,
    /// Namespace (default: "judge")
    pub namespace: String,
    /// Database name (default: "replay")
    pub database: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

impl SharedStoreConfig {
    /// Create a new shared-store configuration for a database user
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            is_root: false,
        }
    }

    /// Set custom namespace
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    /// Set custom database
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    /// Set whether this is a root user
    pub fn with_root(mut self, is_root: bool) -> Self {
        self.is_root = is_root;
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - JUDGE_REPLAY_URL (required)
    /// - JUDGE_REPLAY_USERNAME (required)
    /// - JUDGE_REPLAY_PASSWORD (required)
    /// - JUDGE_REPLAY_NAMESPACE (optional, default: "judge")
    /// - JUDGE_REPLAY_DATABASE (optional, default: "replay")
    /// - JUDGE_REPLAY_ROOT (optional, default: "false")
    pub fn from_env() -> std::result::Result<Self, String> {
        let endpoint =
            std::env::var("JUDGE_REPLAY_URL").map_err(|_| "JUDGE_REPLAY_URL not set")?;
        let username =
            std::env::var("JUDGE_REPLAY_USERNAME").map_err(|_| "JUDGE_REPLAY_USERNAME not set")?;
        let password =
            std::env::var("JUDGE_REPLAY_PASSWORD").map_err(|_| "JUDGE_REPLAY_PASSWORD not set")?;
        let namespace = std::env::var("JUDGE_REPLAY_NAMESPACE")
            .unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        let database = std::env::var("JUDGE_REPLAY_DATABASE")
            .unwrap_or_else(|_| DEFAULT_DATABASE.to_string());
        let is_root = std::env::var("JUDGE_REPLAY_ROOT")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            endpoint,
            username,
            password,
            namespace,
            database,
            is_root,
        })
    }
}

/// Which replay backend to open.
#[derive(Debug, Clone)]
pub enum ReplayBackendConfig {
    /// Process-local map; correct for a single judge process only.
    Memory,
    /// SurrealDB embedded on-disk store at `path`.
    Embedded { path: PathBuf },
    /// SurrealDB server shared by every judge replica.
    Shared(SharedStoreConfig),
}

impl ReplayBackendConfig {
    /// Parse a backend name as used by `JUDGE_REPLAY_BACKEND`.
    ///
    /// `embedded` needs `path`; `shared` reads its connection settings via
    /// [`SharedStoreConfig::from_env`].
    pub fn from_name(name: &str, path: PathBuf) -> StorageResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(Self::Memory),
            "embedded" | "surrealkv" => Ok(Self::Embedded { path }),
            "shared" | "remote" => SharedStoreConfig::from_env()
                .map(Self::Shared)
                .map_err(StorageError::InvalidConfig),
            other => Err(StorageError::InvalidConfig(format!(
                "unknown replay backend '{other}' (expected memory, embedded or shared)"
            ))),
        }
    }

    /// Open the configured backend behind the `ReplayStore` trait.
    pub async fn open(&self) -> StorageResult<Arc<dyn ReplayStore>> {
        match self {
            Self::Memory => Ok(Arc::new(MemoryReplayStore::new())),
            Self::Embedded { path } => Ok(Arc::new(SurrealReplayStore::embedded(path).await?)),
            Self::Shared(config) => Ok(Arc::new(SurrealReplayStore::shared(config.clone()).await?)),
        }
    }
}

/// Row shape as stored; the record id is not deserialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReplayRow {
    key_id: String,
    nonce: String,
    ts_epoch: i64,
}

/// SurrealDB-backed implementation of [`ReplayStore`].
#[derive(Clone)]
pub struct SurrealReplayStore {
    db: Surreal<Any>,
    backend: &'static str,
}

impl SurrealReplayStore {
    /// Connect to SurrealDB in-memory and set up schema (tests, single process).
    #[instrument(skip_all)]
    pub async fn in_memory() -> StorageResult<Self> {
        let db = connect_local("mem://").await?;
        Self::finish(db, "surreal-mem").await
    }

    /// Open (or create) an embedded on-disk store at `path`.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn embedded(path: &std::path::Path) -> StorageResult<Self> {
        std::fs::create_dir_all(path).map_err(|e| {
            StorageError::Connection(format!(
                "Failed to create replay store directory {}: {}",
                path.display(),
                e
            ))
        })?;
        let url = format!("surrealkv://{}", path.display());
        info!("Opening embedded replay store: {}", url);
        let db = connect_local(&url).await?;
        Self::finish(db, "surreal-embedded").await
    }

    /// Connect to a shared SurrealDB server.
    #[instrument(skip(config), fields(endpoint = %config.endpoint, namespace = %config.namespace, database = %config.database))]
    pub async fn shared(config: SharedStoreConfig) -> StorageResult<Self> {
        info!("Connecting to shared replay store (root={})", config.is_root);

        let db = surrealdb::engine::any::connect(&config.endpoint)
            .await
            .map_err(|e| {
                StorageError::Connection(format!("Failed to connect to {}: {}", config.endpoint, e))
            })?;

        if config.is_root {
            db.signin(Root {
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| StorageError::Connection(format!("Root authentication failed: {}", e)))?;
        } else {
            db.signin(Database {
                namespace: &config.namespace,
                database: &config.database,
                username: &config.username,
                password: &config.password,
            })
            .await
            .map_err(|e| {
                StorageError::Connection(format!("Database authentication failed: {}", e))
            })?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| {
                StorageError::Connection(format!("Failed to select namespace/database: {}", e))
            })?;

        Self::finish(db, "surreal-shared").await
    }

    async fn finish(db: Surreal<Any>, backend: &'static str) -> StorageResult<Self> {
        migrations::init_schema(&db).await?;
        info!(backend, "Replay store connected and schema initialized");
        Ok(Self { db, backend })
    }
}

async fn connect_local(url: &str) -> StorageResult<Surreal<Any>> {
    let db = surrealdb::engine::any::connect(url)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

    db.use_ns(DEFAULT_NAMESPACE)
        .use_db(DEFAULT_DATABASE)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;
    Ok(db)
}

/// SurrealDB reports an existing record id or a unique-index hit this way.
fn is_duplicate(err: &surrealdb::Error) -> bool {
    let msg = err.to_string();
    msg.contains("already exists") || msg.contains("already contains")
}

#[async_trait]
impl ReplayStore for SurrealReplayStore {
    #[instrument(skip(self, record), fields(key_id = %record.key_id))]
    async fn insert_if_absent(&self, record: &ReplayRecord) -> StorageResult<InsertOutcome> {
        let mut response = self
            .db
            .query(
                "CREATE type::thing($tb, [$key_id, $nonce]) \
                 CONTENT { key_id: $key_id, nonce: $nonce, ts_epoch: $ts_epoch }",
            )
            .bind(("tb", REPLAY_TABLE))
            .bind(("key_id", record.key_id.clone()))
            .bind(("nonce", record.nonce.clone()))
            .bind(("ts_epoch", record.ts_epoch))
            .await?;

        match response.take::<Vec<ReplayRow>>(0) {
            Ok(_) => {
                debug!("Nonce recorded");
                Ok(InsertOutcome::Inserted)
            }
            Err(e) if is_duplicate(&e) => {
                debug!("Nonce already present");
                Ok(InsertOutcome::AlreadySeen)
            }
            Err(e) => {
                warn!(error = %e, "Replay insert failed");
                Err(StorageError::Backend(e.to_string()))
            }
        }
    }

    #[instrument(skip(self))]
    async fn purge_older_than(&self, cutoff_epoch: i64) -> StorageResult<u64> {
        let mut response = self
            .db
            .query("DELETE type::table($tb) WHERE ts_epoch < $cutoff RETURN BEFORE")
            .bind(("tb", REPLAY_TABLE))
            .bind(("cutoff", cutoff_epoch))
            .await?;
        let removed: Vec<ReplayRow> = response.take(0)?;
        debug!(removed = removed.len(), "Purged expired nonces");
        Ok(removed.len() as u64)
    }

    async fn ping(&self) -> StorageResult<()> {
        self.db.health().await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        self.backend
    }
}
