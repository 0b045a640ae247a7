// Shared KV store client.
//
// The pipeline only ever needs this capability set: incr, expire, get,
// set, del, and a handful of sorted-set operations. Abstracting it as a
// trait -- rather than coupling every caller to a concrete `redis`
// client -- means the rate limiter, health tracker, distribution
// engine, queue, and retry scheduler can all be unit tested against an
// in-memory fake. Values always come back as `String`; callers parse
// them rather than relying on a silent byte-to-int coercion.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::GatewayResult;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Atomically increments `key` and returns the post-increment value.
    async fn incr(&self, key: &str) -> GatewayResult<i64>;

    /// Atomically decrements `key` and returns the post-decrement value.
    /// Used to roll back a speculative `incr` when the caller decides not
    /// to commit it (e.g. a rate-limiter admission that turned out to be
    /// over the cap).
    async fn decr(&self, key: &str) -> GatewayResult<i64>;

    /// Sets a TTL on `key` if it doesn't already have one. A no-op if
    /// the key is missing.
    async fn expire(&self, key: &str, ttl: Duration) -> GatewayResult<()>;

    async fn get(&self, key: &str) -> GatewayResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> GatewayResult<()>;

    async fn del(&self, key: &str) -> GatewayResult<()>;

    /// Adds `member` to the sorted set `key` with the given score,
    /// replacing any existing score for that member.
    async fn zadd(&self, key: &str, score: f64, member: &str) -> GatewayResult<()>;

    /// Returns up to `limit` members with score in `[min, max]`, ascending.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> GatewayResult<Vec<String>>;

    /// Removes `member` from the sorted set. Returns true if it was present
    /// -- the atomic primitive the retry promoter uses to pick exactly one
    /// winner per due entry.
    async fn zrem(&self, key: &str, member: &str) -> GatewayResult<bool>;
}

/// Production binding: a pooled connection to a networked Redis-compatible
/// store.
#[derive(Clone)]
pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> GatewayResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn incr(&self, key: &str) -> GatewayResult<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, 1).await?;
        Ok(value)
    }

    async fn decr(&self, key: &str) -> GatewayResult<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.decr(key, 1).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        // NX: only set the TTL if the key has none yet, so a concurrent
        // caller that already set it doesn't get its window truncated.
        let _: () = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> GatewayResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> GatewayResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .zrangebyscore_limit(key, min, max, 0, limit as isize)
            .await?;
        Ok(members)
    }

    async fn zrem(&self, key: &str, member: &str) -> GatewayResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }
}

/// Test binding: an in-process fake with the same semantics (TTLs
/// expire lazily on read, sorted sets are plain `BTreeMap<score, members>`).
/// Used by every other component's unit tests and by the in-memory
/// integration tests in `tests/`.
#[derive(Clone, Default)]
pub struct InMemoryKv {
    strings: Arc<DashMap<String, (String, Option<std::time::Instant>)>>,
    sorted_sets: Arc<DashMap<String, BTreeMap<String, f64>>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_live(entry: &(String, Option<std::time::Instant>)) -> bool {
        match entry.1 {
            Some(deadline) => std::time::Instant::now() < deadline,
            None => true,
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn incr(&self, key: &str) -> GatewayResult<i64> {
        let mut entry = self.strings.entry(key.to_string()).or_insert((
            "0".to_string(),
            None,
        ));
        if !Self::is_live(&entry) {
            *entry = ("0".to_string(), None);
        }
        let current: i64 = entry.0.parse().unwrap_or(0);
        let next = current + 1;
        entry.0 = next.to_string();
        Ok(next)
    }

    async fn decr(&self, key: &str) -> GatewayResult<i64> {
        let mut entry = self.strings.entry(key.to_string()).or_insert((
            "0".to_string(),
            None,
        ));
        if !Self::is_live(&entry) {
            *entry = ("0".to_string(), None);
        }
        let current: i64 = entry.0.parse().unwrap_or(0);
        let next = current - 1;
        entry.0 = next.to_string();
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> GatewayResult<()> {
        if let Some(mut entry) = self.strings.get_mut(key) {
            if entry.1.is_none() {
                entry.1 = Some(std::time::Instant::now() + ttl);
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> GatewayResult<Option<String>> {
        let expired = match self.strings.get(key) {
            Some(entry) if Self::is_live(&entry) => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.strings.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> GatewayResult<()> {
        self.strings.insert(
            key.to_string(),
            (value.to_string(), Some(std::time::Instant::now() + ttl)),
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> GatewayResult<()> {
        self.strings.remove(key);
        Ok(())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> GatewayResult<()> {
        let mut set = self.sorted_sets.entry(key.to_string()).or_default();
        set.insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> GatewayResult<Vec<String>> {
        let Some(set) = self.sorted_sets.get(key) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<(&String, &f64)> =
            set.iter().filter(|(_, score)| **score >= min && **score <= max).collect();
        members.sort_by(|a, b| a.1.partial_cmp(b.1).unwrap());
        Ok(members.into_iter().take(limit).map(|(m, _)| m.clone()).collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> GatewayResult<bool> {
        if let Some(mut set) = self.sorted_sets.get_mut(key) {
            return Ok(set.remove(member).is_some());
        }
        Ok(false)
    }
}

pub type SharedKv = Arc<dyn KvStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn incr_creates_counter_starting_at_one() {
        let kv = InMemoryKv::new();
        assert_eq!(kv.incr("k").await.unwrap(), 1);
        assert_eq!(kv.incr("k").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn expire_is_noop_if_ttl_already_set() {
        let kv = InMemoryKv::new();
        kv.incr("k").await.unwrap();
        kv.expire("k", Duration::from_secs(60)).await.unwrap();
        kv.expire("k", Duration::from_millis(1)).await.unwrap();
        // the second call must not shorten the TTL
        assert!(kv.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn zrange_by_score_respects_limit_and_order() {
        let kv = InMemoryKv::new();
        kv.zadd("z", 3.0, "c").await.unwrap();
        kv.zadd("z", 1.0, "a").await.unwrap();
        kv.zadd("z", 2.0, "b").await.unwrap();
        let members = kv.zrange_by_score("z", 0.0, 10.0, 2).await.unwrap();
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn zrem_is_exactly_once() {
        let kv = InMemoryKv::new();
        kv.zadd("z", 1.0, "a").await.unwrap();
        assert!(kv.zrem("z", "a").await.unwrap());
        assert!(!kv.zrem("z", "a").await.unwrap());
    }
}
