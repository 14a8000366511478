//! Bounded connection pool with per-operation transaction discipline.
//!
//! Every connection is keyed (SQLCipher) before any other statement runs, so
//! a connection opened without the key cannot read any table. Each logical
//! operation executes inside a single transaction: commit on success,
//! rollback on error, then the connection returns to the pool if it is under
//! capacity and is closed otherwise.

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::storage::{migrations, StorageError, StorageResult, StoreConfig};

/// Pooled SQLite connections over one encrypted database file.
pub struct ConnectionPool {
    config: StoreConfig,
    connections: Mutex<Vec<Connection>>,
}

impl ConnectionPool {
    /// Open (creating if missing) the encrypted database and run migrations.
    ///
    /// Fails when the file cannot be created, the encryption key does not
    /// match an existing database, or the migration script errors. Fatal at
    /// startup per the error model.
    pub fn open(config: StoreConfig) -> StorageResult<Self> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        }

        let pool = Self {
            config,
            connections: Mutex::new(Vec::new()),
        };

        let conn = pool.create_connection()?;
        migrations::run(&conn).map_err(|e| StorageError::Migration(e.to_string()))?;
        pool.connections.lock().push(conn);

        log::info!("Cache store initialized at {}", pool.config.db_path.display());
        Ok(pool)
    }

    /// Run `f` inside a single transaction on a pooled connection.
    ///
    /// Commits when `f` returns `Ok`, rolls back when it returns `Err`.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> StorageResult<T> {
        let mut conn = match self.connections.lock().pop() {
            Some(conn) => conn,
            None => self.create_connection()?,
        };

        let result = {
            let tx = conn.transaction()?;
            match f(&tx) {
                Ok(value) => {
                    tx.commit()?;
                    Ok(value)
                }
                // Dropping the transaction rolls it back.
                Err(e) => Err(StorageError::Sqlite(e)),
            }
        };

        let mut pool = self.connections.lock();
        if pool.len() < self.config.max_connections {
            pool.push(conn);
        }

        result
    }

    /// Number of idle pooled connections.
    pub fn idle_connections(&self) -> usize {
        self.connections.lock().len()
    }

    fn create_connection(&self) -> StorageResult<Connection> {
        let conn = Connection::open(&self.config.db_path)?;

        // The key must be bound before any other statement touches a page.
        if let Some(key) = &self.config.encryption_key {
            conn.pragma_update(None, "key", key.expose())?;
            conn.pragma_update(None, "cipher_compatibility", 4)?;
        }

        // A wrong key surfaces here as SQLITE_NOTADB rather than on first use.
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |_| Ok(()))
            .map_err(|_| {
                StorageError::Unavailable(
                    "database exists but cannot be read with the configured key".to_string(),
                )
            })?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "cache_size", -64000)?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;

        Ok(conn)
    }
}
