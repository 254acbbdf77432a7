//! Cache contract (key/value with TTL, hash fields, advisory locks) and an
//! in-memory implementation.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::error::AppResult;

/// Key naming shared by every cache user.
pub mod keys {
    pub fn user(user_id: i64) -> String {
        format!("user:{}", user_id)
    }

    pub fn download(download_id: i64) -> String {
        format!("download:{}", download_id)
    }

    pub fn subscription(user_id: i64, channel: &str) -> String {
        format!("sub:{}:{}", user_id, channel)
    }

    pub fn upload_session(session_id: &str) -> String {
        format!("upload_session:{}", session_id)
    }

    pub fn debit_lock(user_id: i64) -> String {
        format!("lock:credits:{}", user_id)
    }
}

/// Held advisory lock; pass back to [`Cache::release_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: String,
    pub token: String,
}

impl LockToken {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            token: Uuid::new_v4().to_string(),
        }
    }
}

/// Best-effort key/value cache.
///
/// Values are opaque strings (callers store JSON). Hash operations back
/// progress snapshots and upload session bookkeeping.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> AppResult<bool>;

    /// Returns whether the key existed.
    async fn expire(&self, key: &str, ttl: Duration) -> AppResult<bool>;

    async fn hget(&self, key: &str, field: &str) -> AppResult<Option<String>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> AppResult<()>;

    async fn hgetall(&self, key: &str) -> AppResult<HashMap<String, String>>;

    /// Tries to take `key` for `timeout`; `None` when someone else holds it.
    async fn acquire_lock(&self, key: &str, timeout: Duration) -> AppResult<Option<LockToken>>;

    /// Releases a lock only if `token` still owns it.
    async fn release_lock(&self, token: &LockToken) -> AppResult<bool>;
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-memory cache with lazy TTL expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self, key: &str) -> Option<Entry> {
        let now = Instant::now();
        let entry = self.entries.get(key)?.clone();
        if entry.is_expired(now) {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(entry)
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(match self.live(key).map(|e| e.value) {
            Some(Value::Str(s)) => Some(s),
            _ => None,
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<bool> {
        let existed = self.live(key).is_some();
        self.entries.remove(key);
        Ok(existed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> AppResult<bool> {
        if self.live(key).is_none() {
            return Ok(false);
        }
        Ok(match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        })
    }

    async fn hget(&self, key: &str, field: &str) -> AppResult<Option<String>> {
        Ok(match self.live(key).map(|e| e.value) {
            Some(Value::Hash(map)) => map.get(field).cloned(),
            _ => None,
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> AppResult<()> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        if entry.is_expired(now) || !matches!(entry.value, Value::Hash(_)) {
            *entry = Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            };
        }
        if let Value::Hash(map) = &mut entry.value {
            map.insert(field.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> AppResult<HashMap<String, String>> {
        Ok(match self.live(key).map(|e| e.value) {
            Some(Value::Hash(map)) => map,
            _ => HashMap::new(),
        })
    }

    async fn acquire_lock(&self, key: &str, timeout: Duration) -> AppResult<Option<LockToken>> {
        let now = Instant::now();
        let token = LockToken::new(key);
        let mut acquired = false;

        self.entries
            .entry(key.to_string())
            .and_modify(|entry| {
                if entry.is_expired(now) {
                    *entry = lock_entry(&token, now, timeout);
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                lock_entry(&token, now, timeout)
            });

        Ok(acquired.then_some(token))
    }

    async fn release_lock(&self, token: &LockToken) -> AppResult<bool> {
        let removed = self.entries.remove_if(&token.key, |_, entry| {
            matches!(&entry.value, Value::Str(held) if *held == token.token)
        });
        Ok(removed.is_some())
    }
}

fn lock_entry(token: &LockToken, now: Instant, timeout: Duration) -> Entry {
    Entry {
        value: Value::Str(token.token.clone()),
        expires_at: Some(now + timeout),
    }
}
