//! Redis-backed cache.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::time::Duration;

use crate::core::error::{AppError, AppResult};
use crate::storage::cache::{Cache, LockToken};

/// Deletes the lock key only when it still holds our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisCache {
    conn: MultiplexedConnection,
    release: Script,
}

impl RedisCache {
    /// Connects and verifies the server answers `PING`.
    pub async fn connect(url: &str) -> AppResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| AppError::Configuration(format!("invalid redis url: {}", e)))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::Configuration(format!("redis unreachable: {}", e)))?;
        let _pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::Configuration(format!("redis ping failed: {}", e)))?;

        log::info!("Connected to redis");
        Ok(Self {
            conn,
            release: Script::new(RELEASE_SCRIPT),
        })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => conn.pset_ex::<_, _, ()>(key, value, ttl_millis(ttl)).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.pexpire(key, ttl_millis(ttl) as i64).await?)
    }

    async fn hget(&self, key: &str, field: &str) -> AppResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> AppResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn acquire_lock(&self, key: &str, timeout: Duration) -> AppResult<Option<LockToken>> {
        let mut conn = self.conn.clone();
        let token = LockToken::new(key);
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token.token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(timeout))
            .query_async(&mut conn)
            .await?;
        Ok(acquired.map(|_| token))
    }

    async fn release_lock(&self, token: &LockToken) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .release
            .key(&token.key)
            .arg(&token.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }
}
