//! Encrypted object cache with compression and three-state TTL semantics.
//!
//! This module provides:
//! - Canonical key derivation and TTL policy lookup
//! - `set`/`get` with fresh/stale/expired state detection
//! - gzip compression for large payloads
//! - Capacity-driven LRU eviction
//! - Pattern invalidation with an audit trail
//! - Aggregate statistics
//!
//! The cache is a best-effort accelerator: read failures downgrade to a
//! miss and write failures downgrade to a logged no-op. Only oversized
//! payloads surface an error to the caller.

pub mod config;

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::storage::{unix_now, ConnectionPool, StorageError};

pub use config::{
    canonical_json, generate_cache_key, parse_cache_key, ttl_policy, CacheLimits, CacheState,
    ParsedCacheKey, TtlPolicy, DEFAULT_TTL_POLICY, TTL_POLICIES,
};

/// Cache error types
#[derive(Error, Debug)]
pub enum CacheError {
    /// Stored payload exceeds the per-entry size limit
    #[error("cache entry too large: {size} bytes (max: {max})")]
    EntryTooLarge { size: usize, max: usize },

    /// Underlying storage error
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Per-account statistics breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct AccountStats {
    pub entry_count: u64,
    pub total_bytes: u64,
}

/// Per-resource-type statistics breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStats {
    pub entry_count: u64,
    pub total_bytes: u64,
    pub avg_hits: f64,
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entry_count: u64,
    pub total_bytes: u64,
    pub avg_bytes: f64,
    pub total_hits: u64,
    pub max_bytes: u64,
    pub usage_percent: f64,
    pub by_account: BTreeMap<String, AccountStats>,
    pub by_resource: BTreeMap<String, ResourceStats>,
}

impl CacheStats {
    /// Statistics report with derived human-readable fields, as returned by
    /// the stats operation on the tool surface.
    pub fn human_readable(&self) -> Value {
        let mut report = serde_json::to_value(self).unwrap_or_else(|_| Value::Null);
        if let Value::Object(map) = &mut report {
            map.insert(
                "total_size_mb".to_string(),
                Value::from(self.total_bytes as f64 / (1024.0 * 1024.0)),
            );
            map.insert("size_percentage".to_string(), Value::from(self.usage_percent));
            map.insert(
                "cleanup_triggered".to_string(),
                Value::from(self.usage_percent >= 80.0),
            );
        }
        report
    }
}

/// Receipt returned by the tool-facing invalidation operation.
#[derive(Debug, Clone, Serialize)]
pub struct InvalidationReceipt {
    pub entries_deleted: usize,
    pub pattern: String,
    pub account_id: Option<String>,
    pub reason: String,
    pub timestamp: String,
}

/// Encrypted cache manager with compression and TTL support.
pub struct CacheManager {
    pool: Arc<ConnectionPool>,
    limits: CacheLimits,
}

impl CacheManager {
    /// Create a cache manager over the shared store with default limits.
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self::with_limits(pool, CacheLimits::default())
    }

    /// Create a cache manager with explicit limits.
    pub fn with_limits(pool: Arc<ConnectionPool>, limits: CacheLimits) -> Self {
        Self { pool, limits }
    }

    /// Capacity limits in effect.
    pub fn limits(&self) -> &CacheLimits {
        &self.limits
    }

    /// Retrieve cached data with state detection.
    ///
    /// Returns `None` on a miss, after removing an expired row, or when the
    /// stored payload cannot be decoded. Hits bump `accessed_at` and
    /// `hit_count`.
    pub fn get_cached(
        &self,
        account_id: &str,
        resource_type: &str,
        params: Option<&Value>,
    ) -> Option<(Value, CacheState)> {
        let cache_key = generate_cache_key(account_id, resource_type, params);
        let policy = ttl_policy(resource_type);

        let result = self.pool.with_conn(|tx| {
            let row: Option<(Vec<u8>, bool, f64)> = tx
                .query_row(
                    "SELECT data_json, is_compressed, created_at FROM cache_entries WHERE cache_key = ?1",
                    params![cache_key],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let (data_bytes, compressed, created_at) = match row {
                Some(row) => row,
                None => return Ok(None),
            };

            let now = unix_now();
            let age = now - created_at;

            let state = if age <= policy.fresh_seconds as f64 {
                CacheState::Fresh
            } else if age <= policy.stale_seconds as f64 {
                CacheState::Stale
            } else {
                tx.execute(
                    "DELETE FROM cache_entries WHERE cache_key = ?1",
                    params![cache_key],
                )?;
                return Ok(None);
            };

            let data = match decode_payload(&data_bytes, compressed) {
                Some(data) => data,
                None => {
                    log::error!("Failed to parse cached data for key {}", cache_key);
                    return Ok(None);
                }
            };

            tx.execute(
                "UPDATE cache_entries SET accessed_at = ?1, hit_count = hit_count + 1 \
                 WHERE cache_key = ?2",
                params![now, cache_key],
            )?;

            Ok(Some((data, state)))
        });

        match result {
            Ok(hit) => hit,
            Err(e) => {
                log::error!("Cache read failed, treating as miss: {}", e);
                None
            }
        }
    }

    /// Store data in the cache, compressing large payloads.
    ///
    /// Fails fast with [`CacheError::EntryTooLarge`] when the stored payload
    /// would exceed the per-entry limit; storage failures are logged and
    /// dropped. A capacity check runs after every write.
    pub fn set_cached(
        &self,
        account_id: &str,
        resource_type: &str,
        params: Option<&Value>,
        data: &Value,
    ) -> CacheResult<()> {
        let cache_key = generate_cache_key(account_id, resource_type, params);

        let encoded = serde_json::to_vec(data).unwrap_or_default();

        let (data_bytes, compressed) = if encoded.len() >= self.limits.compression_threshold {
            match compress_payload(&encoded, self.limits.compression_level) {
                Some(compressed) => (compressed, true),
                None => (encoded, false),
            }
        } else {
            (encoded, false)
        };

        if data_bytes.len() > self.limits.max_entry_bytes {
            return Err(CacheError::EntryTooLarge {
                size: data_bytes.len(),
                max: self.limits.max_entry_bytes,
            });
        }

        let now = unix_now();
        let policy = ttl_policy(resource_type);
        let fresh_until = now + policy.fresh_seconds as f64;
        let expires_at = now + policy.stale_seconds as f64;
        let size = data_bytes.len() as i64;

        let written = self.pool.with_conn(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO cache_entries \
                 (cache_key, account_id, resource_type, data_json, is_compressed, \
                  data_size_bytes, created_at, accessed_at, fresh_until, expires_at, hit_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0)",
                params![
                    cache_key,
                    account_id,
                    resource_type,
                    data_bytes,
                    compressed,
                    size,
                    now,
                    now,
                    fresh_until,
                    expires_at
                ],
            )
            .map(|_| ())
        });

        if let Err(e) = written {
            log::error!("Cache write failed, dropping entry: {}", e);
            return Ok(());
        }

        self.check_cleanup();
        Ok(())
    }

    /// Invalidate entries whose key matches a `*`-wildcard pattern.
    ///
    /// Appends an audit row recording the matched count. Failures are logged
    /// and reported as zero invalidations; mutating callers never fail
    /// because of cache cleanup.
    pub fn invalidate_pattern(
        &self,
        pattern: &str,
        account_id: Option<&str>,
        reason: &str,
    ) -> usize {
        let sql_pattern = pattern.replace('*', "%");
        let log_account = account_id.unwrap_or("system").to_string();
        let pattern_owned = pattern.to_string();
        let reason_owned = reason.to_string();
        let account_owned = account_id.map(|s| s.to_string());

        let result = self.pool.with_conn(move |tx| {
            let count: usize = match &account_owned {
                Some(account) => tx.query_row(
                    "SELECT COUNT(*) FROM cache_entries WHERE cache_key LIKE ?1 AND account_id = ?2",
                    params![sql_pattern, account],
                    |row| row.get(0),
                )?,
                None => tx.query_row(
                    "SELECT COUNT(*) FROM cache_entries WHERE cache_key LIKE ?1",
                    params![sql_pattern],
                    |row| row.get(0),
                )?,
            };

            tx.execute(
                "INSERT INTO cache_invalidation \
                 (account_id, pattern, reason, invalidated_at, entries_invalidated) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![log_account, pattern_owned, reason_owned, unix_now(), count],
            )?;

            match &account_owned {
                Some(account) => tx.execute(
                    "DELETE FROM cache_entries WHERE cache_key LIKE ?1 AND account_id = ?2",
                    params![sql_pattern, account],
                )?,
                None => tx.execute(
                    "DELETE FROM cache_entries WHERE cache_key LIKE ?1",
                    params![sql_pattern],
                )?,
            };

            Ok(count)
        });

        match result {
            Ok(count) => {
                if count > 0 {
                    log::info!("Invalidated {} entries matching '{}'", count, pattern);
                }
                count
            }
            Err(e) => {
                log::error!("Cache invalidation failed for '{}': {}", pattern, e);
                0
            }
        }
    }

    /// Tool-facing invalidation: scopes the pattern to an account when one is
    /// given and returns a structured receipt.
    pub fn invalidate(
        &self,
        pattern: &str,
        account_id: Option<&str>,
        reason: &str,
    ) -> InvalidationReceipt {
        let pattern = match account_id {
            Some(account)
                if pattern.contains(":*") && !pattern.contains(&format!(":{}:", account)) =>
            {
                let parts: Vec<&str> = pattern.split(':').collect();
                if parts.len() >= 2 {
                    format!("{}:{}:{}", parts[0], account, parts[1..].join(":"))
                } else {
                    pattern.to_string()
                }
            }
            _ => pattern.to_string(),
        };

        let deleted = self.invalidate_pattern(&pattern, None, reason);

        InvalidationReceipt {
            entries_deleted: deleted,
            pattern,
            account_id: account_id.map(|s| s.to_string()),
            reason: reason.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Delete all entries past their stale horizon. Returns the count.
    pub fn cleanup_expired(&self) -> usize {
        let result = self.pool.with_conn(|tx| {
            tx.execute(
                "DELETE FROM cache_entries WHERE expires_at < ?1",
                params![unix_now()],
            )
        });

        match result {
            Ok(count) => {
                if count > 0 {
                    log::info!("Cleaned up {} expired entries", count);
                }
                count
            }
            Err(e) => {
                log::error!("Expired-entry cleanup failed: {}", e);
                0
            }
        }
    }

    /// Aggregate statistics over all cached entries.
    pub fn stats(&self) -> CacheResult<CacheStats> {
        let max_bytes = self.limits.max_total_bytes;

        let stats = self.pool.with_conn(|tx| {
            let (entry_count, total_bytes, avg_bytes, total_hits): (u64, u64, f64, u64) = tx
                .query_row(
                    "SELECT COUNT(*), COALESCE(SUM(data_size_bytes), 0), \
                            COALESCE(AVG(data_size_bytes), 0), COALESCE(SUM(hit_count), 0) \
                     FROM cache_entries",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )?;

            let mut by_account = BTreeMap::new();
            let mut stmt = tx.prepare(
                "SELECT account_id, COUNT(*), SUM(data_size_bytes) \
                 FROM cache_entries GROUP BY account_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    AccountStats {
                        entry_count: row.get(1)?,
                        total_bytes: row.get(2)?,
                    },
                ))
            })?;
            for row in rows {
                let (account, stats) = row?;
                by_account.insert(account, stats);
            }

            let mut by_resource = BTreeMap::new();
            let mut stmt = tx.prepare(
                "SELECT resource_type, COUNT(*), SUM(data_size_bytes), AVG(hit_count) \
                 FROM cache_entries GROUP BY resource_type",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    ResourceStats {
                        entry_count: row.get(1)?,
                        total_bytes: row.get(2)?,
                        avg_hits: row.get(3)?,
                    },
                ))
            })?;
            for row in rows {
                let (resource, stats) = row?;
                by_resource.insert(resource, stats);
            }

            Ok(CacheStats {
                entry_count,
                total_bytes,
                avg_bytes,
                total_hits,
                max_bytes,
                usage_percent: total_bytes as f64 / max_bytes as f64 * 100.0,
                by_account,
                by_resource,
            })
        })?;

        Ok(stats)
    }

    /// Check total size and run an eviction pass when over the trigger
    /// threshold.
    fn check_cleanup(&self) {
        let total = match self.total_bytes() {
            Ok(total) => total,
            Err(e) => {
                log::error!("Cache size check failed: {}", e);
                return;
            }
        };

        let threshold = self.limits.max_total_bytes as f64 * self.limits.cleanup_threshold;
        if (total as f64) >= threshold {
            log::info!("Cache size {} bytes, triggering cleanup", total);
            self.cleanup_to_target();
        }
    }

    /// One eviction pass in a single write transaction: drop expired rows,
    /// then least-recently-used rows until total size is at or under the
    /// cleanup target.
    fn cleanup_to_target(&self) {
        let target = (self.limits.max_total_bytes as f64 * self.limits.cleanup_target) as u64;

        let result = self.pool.with_conn(|tx| {
            tx.execute(
                "DELETE FROM cache_entries WHERE expires_at < ?1",
                params![unix_now()],
            )?;

            let current: u64 = tx.query_row(
                "SELECT COALESCE(SUM(data_size_bytes), 0) FROM cache_entries",
                [],
                |row| row.get(0),
            )?;

            if current <= target {
                return Ok(());
            }

            let to_free = current - target;
            let mut stmt = tx.prepare(
                "SELECT cache_key, data_size_bytes FROM cache_entries ORDER BY accessed_at ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?;

            let mut victims = Vec::new();
            let mut freed = 0u64;
            for row in rows {
                let (key, size) = row?;
                victims.push(key);
                freed += size;
                if freed >= to_free {
                    break;
                }
            }
            drop(stmt);

            if !victims.is_empty() {
                let placeholders = vec!["?"; victims.len()].join(", ");
                let sql =
                    format!("DELETE FROM cache_entries WHERE cache_key IN ({})", placeholders);
                tx.execute(&sql, rusqlite::params_from_iter(victims.iter()))?;
            }

            Ok(())
        });

        match result {
            Ok(()) => log::info!("Cleanup complete, target size: {} bytes", target),
            Err(e) => log::error!("Cache eviction pass failed: {}", e),
        }
    }

    fn total_bytes(&self) -> CacheResult<u64> {
        let total = self.pool.with_conn(|tx| {
            tx.query_row(
                "SELECT COALESCE(SUM(data_size_bytes), 0) FROM cache_entries",
                [],
                |row| row.get(0),
            )
        })?;
        Ok(total)
    }
}

fn compress_payload(encoded: &[u8], level: u32) -> Option<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(encoded).ok()?;
    encoder.finish().ok()
}

fn decode_payload(data_bytes: &[u8], compressed: bool) -> Option<Value> {
    if compressed {
        let mut decoder = GzDecoder::new(data_bytes);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).ok()?;
        serde_json::from_slice(&decompressed).ok()
    } else {
        serde_json::from_slice(data_bytes).ok()
    }
}
