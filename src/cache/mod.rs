//! Namespaced, TTL-bound key/value cache.
//!
//! The cache is advisory: every reader falls back to the session store on a
//! miss, and every writer treats a failed write as a lost optimisation.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

/// `{user}:{device}` → token.
pub const SESSION_TOKENS: &str = "session_tokens";
/// `{session_id}` → token.
pub const SESSIONS: &str = "sessions";
/// `user:{id}:role` → role name.
pub const USER_ROLES: &str = "user_roles";
/// `user:{id}:info` → JSON summary of the last issuance.
pub const USER_INFO: &str = "user_info";
/// `user:{id}:devices` → JSON array of device ids.
pub const USER_DEVICES: &str = "user_devices";
/// `{session_id}` → the last token revoked for that session.
pub const REVOKED_TOKENS: &str = "revoked_tokens";

pub const ROLE_TTL: Duration = Duration::from_secs(3600);
pub const USER_INFO_TTL: Duration = Duration::from_secs(24 * 3600);
pub const USER_DEVICES_TTL: Duration = Duration::from_secs(24 * 3600);

pub fn session_token_key(user_id: &str, device_id: &str) -> String {
    format!("{}:{}", user_id, device_id)
}

pub fn role_key(user_id: &str) -> String {
    format!("user:{}:role", user_id)
}

pub fn user_info_key(user_id: &str) -> String {
    format!("user:{}:info", user_id)
}

pub fn user_devices_key(user_id: &str) -> String {
    format!("user:{}:devices", user_id)
}

#[async_trait]
pub trait Cache: Send + Sync {
    /// Returns `None` on a miss.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>>;

    async fn set(&self, namespace: &str, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn delete(&self, namespace: &str, key: &str) -> Result<()>;
}

/// Storage for the fixed-window rate limiter.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Remaining lockout for `key`, if it is currently blocked.
    async fn blocked_for(&self, key: &str) -> Result<Option<Duration>>;

    /// Increments the window counter for `key`, starting a window of
    /// length `window` on the first hit. Returns the post-increment count
    /// and the time left in the window.
    async fn increment(&self, key: &str, window: Duration) -> Result<(u64, Duration)>;

    /// Blocks `key` for `duration`.
    async fn block(&self, key: &str, duration: Duration) -> Result<()>;
}

pub(crate) fn namespaced(namespace: &str, key: &str) -> String {
    format!("{}:{}", namespace, key)
}

pub(crate) fn blocked_key(key: &str) -> String {
    format!("{}:blocked", key)
}

pub(crate) fn counter_key(key: &str) -> String {
    format!("{}:count", key)
}
