use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::{Cache, RateLimitStore, blocked_key, counter_key, namespaced};
use crate::error::Result;

#[derive(Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn remaining(&self, now: Instant) -> Option<Duration> {
        (self.expires_at > now).then(|| self.expires_at - now)
    }
}

/// In-process cache for tests and single-node runs.
///
/// Expiry follows `tokio::time`, so paused-clock tests can advance it.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    writes: Arc<AtomicU64>,
}

/// Expired entries are dropped once every this many writes.
const SWEEP_EVERY: u64 = 256;

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries.values().filter(|e| e.remaining(now).is_some()).count()
    }

    async fn read(&self, key: &str) -> Option<Entry> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| e.remaining(now).is_some())
            .cloned()
    }

    /// Drops expired entries every [`SWEEP_EVERY`] writes, so keys that
    /// are never read again do not pile up.
    fn maybe_sweep(&self, entries: &mut HashMap<String, Entry>, now: Instant) {
        if (self.writes.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            entries.retain(|_, e| e.expires_at > now);
        }
    }

    async fn write(&self, key: String, value: String, ttl: Duration) {
        let mut entries = self.entries.write().await;
        self.maybe_sweep(&mut entries, Instant::now());
        entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        Ok(self.read(&namespaced(namespace, key)).await.map(|e| e.value))
    }

    async fn set(&self, namespace: &str, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.write(namespaced(namespace, key), value.to_string(), ttl)
            .await;
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        self.entries.write().await.remove(&namespaced(namespace, key));
        Ok(())
    }
}

#[async_trait]
impl RateLimitStore for MemoryCache {
    async fn blocked_for(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        Ok(self
            .read(&blocked_key(key))
            .await
            .and_then(|e| e.remaining(now)))
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<(u64, Duration)> {
        let now = Instant::now();
        let counter = counter_key(key);
        let mut entries = self.entries.write().await;
        self.maybe_sweep(&mut entries, now);

        let (count, expires_at) = match entries.get(&counter).filter(|e| e.expires_at > now) {
            Some(entry) => (entry.value.parse::<u64>().unwrap_or(0) + 1, entry.expires_at),
            None => (1, now + window),
        };

        entries.insert(
            counter,
            Entry {
                value: count.to_string(),
                expires_at,
            },
        );

        Ok((count, expires_at - now))
    }

    async fn block(&self, key: &str, duration: Duration) -> Result<()> {
        self.write(blocked_key(key), "1".to_string(), duration).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_with_their_ttl() {
        let cache = MemoryCache::new();
        cache
            .set("sessions", "abc", "token", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(
            cache.get("sessions", "abc").await.unwrap().as_deref(),
            Some("token")
        );

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get("sessions", "abc").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_swept_on_write() {
        let cache = MemoryCache::new();
        for i in 0..10 {
            cache.increment(&format!("ip:{}", i), Duration::from_secs(1)).await.unwrap();
        }
        tokio::time::advance(Duration::from_secs(2)).await;

        for _ in 10..SWEEP_EVERY {
            cache
                .set("sessions", "live", "token", Duration::from_secs(60))
                .await
                .unwrap();
        }

        assert_eq!(cache.entries.read().await.len(), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn counter_restarts_after_window() {
        let cache = MemoryCache::new();
        let window = Duration::from_secs(60);

        assert_eq!(cache.increment("ip:1", window).await.unwrap().0, 1);
        assert_eq!(cache.increment("ip:1", window).await.unwrap().0, 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.increment("ip:1", window).await.unwrap().0, 1);
    }
}
