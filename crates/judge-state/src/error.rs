//! Error types for judge-state

use thiserror::Error;

/// Errors that can occur in the replay persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),

    /// Query or transaction failure reported by the backend
    #[error("Backend error: {0}")]
    Backend(String),

    /// Backend configuration rejected before connecting
    #[error("Invalid backend configuration: {0}")]
    InvalidConfig(String),
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}
