//! Encrypted embedded storage for cache entries and background tasks.
//!
//! This module provides:
//! - SQLCipher-encrypted SQLite database creation
//! - Idempotent schema migration
//! - Bounded connection pooling with per-operation transactions
//!
//! All persisted state in the crate lives in this one store; the cache core
//! and the task queue share its connection pool.

pub mod migrations;
pub mod pool;

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::encryption::EncryptionKey;

pub use pool::ConnectionPool;

/// Storage error types
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database file or parent directory could not be created
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Underlying SQLite error
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema migration error
    #[error("migration error: {0}")]
    Migration(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the database file
    pub db_path: PathBuf,

    /// Page-level encryption key; `None` stores data in plaintext
    pub encryption_key: Option<EncryptionKey>,

    /// Maximum number of pooled connections
    pub max_connections: usize,
}

impl StoreConfig {
    /// Configuration for an encrypted store at the default location.
    pub fn new(encryption_key: EncryptionKey) -> Self {
        Self {
            db_path: default_db_path(),
            encryption_key: Some(encryption_key),
            max_connections: 5,
        }
    }

    /// Configuration for an encrypted store at an explicit path.
    pub fn at_path(db_path: impl AsRef<std::path::Path>, encryption_key: Option<EncryptionKey>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            encryption_key,
            max_connections: 5,
        }
    }
}

/// Default database location under the platform data directory.
pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("m365-mcp")
        .join("cache.db")
}

/// Current wall-clock time as fractional seconds since the Unix epoch.
pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
