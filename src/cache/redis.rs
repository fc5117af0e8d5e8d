use std::time::Duration;

use async_trait::async_trait;
use ::redis::AsyncCommands;
use ::redis::aio::ConnectionManager;

use super::{Cache, RateLimitStore, blocked_key, counter_key, namespaced};
use crate::error::Result;

/// Cache and rate-limit storage backed by a Redis connection manager.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Time left in a window from a `TTL` reply. `None` when the counter has
/// no expiry and one must be set.
fn window_left(ttl: i64) -> Option<Duration> {
    (ttl >= 0).then(|| Duration::from_secs(ttl as u64))
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let value: Option<String> = self.conn.clone().get(namespaced(namespace, key)).await?;
        Ok(value)
    }

    async fn set(&self, namespace: &str, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let _: () = self
            .conn
            .clone()
            .set_ex(namespaced(namespace, key), value, ttl_secs(ttl))
            .await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let _: () = self.conn.clone().del(namespaced(namespace, key)).await?;
        Ok(())
    }
}

#[async_trait]
impl RateLimitStore for RedisCache {
    async fn blocked_for(&self, key: &str) -> Result<Option<Duration>> {
        let ttl: i64 = self.conn.clone().ttl(blocked_key(key)).await?;

        // -2: no such key, -1: key without expiry
        Ok(match ttl {
            -2 => None,
            -1 => Some(Duration::from_secs(1)),
            secs => Some(Duration::from_secs(secs.max(1) as u64)),
        })
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<(u64, Duration)> {
        let mut conn = self.conn.clone();
        let counter = counter_key(key);

        let (count, ttl): (u64, i64) = ::redis::pipe()
            .atomic()
            .incr(&counter, 1)
            .ttl(&counter)
            .query_async(&mut conn)
            .await?;

        // A counter without an expiry (first hit, or an earlier EXPIRE that
        // never landed) would never reset.
        match window_left(ttl) {
            Some(remaining) => Ok((count, remaining)),
            None => {
                let _: () = conn.expire(&counter, ttl_secs(window) as i64).await?;
                Ok((count, window))
            }
        }
    }

    async fn block(&self, key: &str, duration: Duration) -> Result<()> {
        let _: () = self
            .conn
            .clone()
            .set_ex(blocked_key(key), 1, ttl_secs(duration))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_without_expiry_get_one() {
        assert_eq!(window_left(-1), None);
        assert_eq!(window_left(-2), None);
        assert_eq!(window_left(0), Some(Duration::ZERO));
        assert_eq!(window_left(42), Some(Duration::from_secs(42)));
    }

    #[test]
    fn ttls_never_round_down_to_zero() {
        assert_eq!(ttl_secs(Duration::from_millis(200)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(600)), 600);
    }
}
