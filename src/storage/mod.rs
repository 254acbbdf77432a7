//! Persistence and cache collaborators

pub mod cache;
pub mod models;
pub mod persistence;
pub mod redis_cache;
pub mod sqlite;

// Re-exports for convenience
pub use cache::{keys, Cache, LockToken, MemoryCache};
pub use models::{AnalyticsEvent, Download, DownloadStatus, DownloadUpdate, NewDownload, User, UserStatus, UserUpdate};
pub use persistence::{MemoryStore, Persistence};
pub use redis_cache::RedisCache;
pub use sqlite::{create_pool, DbConnection, DbPool, SqliteStore};
