//! # m365-cache
//!
//! Encrypted cache and background task subsystem for a Microsoft 365
//! integration server.
//!
//! ## Architecture
//!
//! - `encryption`: 256-bit key management (keyring / env / generate)
//! - `storage`: SQLCipher-encrypted SQLite store, migrations, pooling
//! - `cache`: compressed object cache with three-state TTL and LRU eviction
//! - `tasks`: durable priority task queue and its background worker
//! - `warming`: startup cache warming with progress telemetry
//! - `search`: routing between the two remote search API dialects
//! - `accounts`: account class detection and its persisted map
//! - `system`: composition root with explicit init and teardown
//!
//! The tool surface, authentication, and the Graph HTTP client live outside
//! this crate; they are consumed through the [`tasks::ToolExecutor`],
//! [`warming::WarmingExecutor`], [`graph::GraphClient`], and
//! [`accounts::AccountClassDetector`] interfaces, each registered once at
//! startup.

#![warn(clippy::all)]

// Key management
pub mod encryption;

// Encrypted embedded store
pub mod storage;

// Object cache
pub mod cache;

// Task queue and worker
pub mod tasks;

// Startup warming
pub mod warming;

// Search API routing
pub mod search;

// Account classes
pub mod accounts;

// Remote API interface
pub mod graph;

// Composition root
pub mod system;

// Re-export commonly used types
pub use accounts::{AccountClass, AccountClassCache, AccountClassDetector};
pub use cache::{CacheError, CacheManager, CacheState, CacheStats, InvalidationReceipt};
pub use encryption::{EncryptionKey, KeyManager};
pub use graph::GraphClient;
pub use search::{EntityType, SearchError, SearchRouter};
pub use storage::{ConnectionPool, StorageError, StoreConfig};
pub use system::{CacheSystem, SystemError};
pub use tasks::{BackgroundWorker, RetryPolicy, Task, TaskQueue, TaskStatus, ToolExecutor};
pub use warming::{CacheWarmer, WarmingExecutor, WarmingStatus};

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
