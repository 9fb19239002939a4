use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::kv::{KeyValueStore, StoreError};

/// Redis-backed [`KeyValueStore`].
///
/// Uses a [`ConnectionManager`] that multiplexes one connection and
/// reconnects on failure. Every multi-step operation runs as an atomic
/// `MULTI`/`EXEC` pipeline in a single round trip, so windows and locks stay
/// correct when many server instances share the same Redis.
///
/// Requires Redis 7+ (tag-set expiration uses `EXPIRE ... GT`).
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    /// Connect and verify the server is reachable.
    ///
    /// `prefix` namespaces every key so several environments can share one
    /// Redis; pass an empty string to disable.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Protocol(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
        })
    }

    fn key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{key}", self.prefix)
        }
    }

    async fn delete_raw(&self, keys: Vec<String>) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(keys).await?;
        Ok(removed)
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error()
            || e.is_timeout()
            || e.is_connection_refusal()
            || e.is_connection_dropped()
        {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Protocol(e.to_string())
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn window_record(
        &self,
        key: &str,
        cutoff_ms: i64,
        now_ms: i64,
        member: &str,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        let key = self.key(key);
        let mut conn = self.conn.clone();
        let (_, _, _, count): (i64, i64, i64, u64) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(format!("({cutoff_ms}"))
            .cmd("ZADD")
            .arg(&key)
            .arg(now_ms)
            .arg(member)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(ttl.as_secs().max(1))
            .cmd("ZCARD")
            .arg(&key)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn window_count(&self, key: &str, cutoff_ms: i64) -> Result<u64, StoreError> {
        let key = self.key(key);
        let mut conn = self.conn.clone();
        let (_, count): (i64, u64) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(format!("({cutoff_ms}"))
            .cmd("ZCARD")
            .arg(&key)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(self.key(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = self.key(key);
        match ttl {
            Some(ttl) => {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl.as_millis().max(1) as u64)
                    .query_async::<()>(&mut conn)
                    .await?;
            }
            None => conn.set::<_, _, ()>(&key, value).await?,
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        self.delete_raw(keys.iter().map(|k| self.key(k)).collect())
            .await
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, StoreError> {
        let pattern = self.key(pattern);
        let mut scan_conn = self.conn.clone();
        let mut matched = Vec::new();
        {
            let mut iter: redis::AsyncIter<'_, String> = scan_conn.scan_match(&pattern).await?;
            while let Some(key) = iter.next_item().await {
                matched.push(key);
            }
        }
        // SCAN already returned fully-prefixed keys.
        self.delete_raw(matched).await
    }

    async fn set_add(
        &self,
        key: &str,
        member: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let key = self.key(key);
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("SADD").arg(&key).arg(member);
        match ttl {
            // GT keeps the longest expiration seen so far; the set must
            // outlive its longest-lived member.
            Some(ttl) => {
                pipe.cmd("EXPIRE").arg(&key).arg(ttl.as_secs().max(1)).arg("GT");
            }
            None => {
                pipe.cmd("PERSIST").arg(&key);
            }
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(self.key(key)).await?;
        Ok(members)
    }

    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.key(key)).await?;
        Ok(())
    }
}
