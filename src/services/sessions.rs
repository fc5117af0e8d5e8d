use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::{
    cache::{self, Cache},
    domain::Domain,
    error::{AppError, Result},
    models::session::Session,
    repositories::session::SessionRepository,
};

/// Outcome of a liveness check against the session store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidateSessionResponse {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub session_type: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub user_id: String,
}

impl ValidateSessionResponse {
    fn invalid(message: &str, session: &Session) -> Self {
        Self {
            valid: false,
            error: Some(message.to_string()),
            session_type: session.kind().as_str().to_string(),
            purpose: session.purpose.clone(),
            user_id: session.user_id.clone(),
        }
    }

    fn valid(session: &Session) -> Self {
        Self {
            valid: true,
            error: None,
            session_type: session.kind().as_str().to_string(),
            purpose: session.purpose.clone(),
            user_id: session.user_id.clone(),
        }
    }
}

/// What the gateway calls on a cache miss. One instance per domain; an RPC
/// client to a remote session store can stand in for the local service.
#[async_trait]
pub trait SessionValidator: Send + Sync {
    /// Fails with `SessionNotFound` or `SessionUsed`; other rejections are
    /// reported through `valid = false`.
    async fn validate_session(&self, token: &str) -> Result<ValidateSessionResponse>;
}

/// The session store of one domain.
pub struct SessionService {
    domain: Domain,
    repo: Arc<dyn SessionRepository>,
    cache: Arc<dyn Cache>,
    /// How long a revoked token stays marked. Must cover the token's
    /// lifetime.
    revocation_ttl: Duration,
}

impl SessionService {
    pub fn new(
        domain: Domain,
        repo: Arc<dyn SessionRepository>,
        cache: Arc<dyn Cache>,
        revocation_ttl: Duration,
    ) -> Self {
        Self {
            domain,
            repo,
            cache,
            revocation_ttl,
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub async fn list_sessions(&self, user_id: &str, include_temp: bool) -> Result<Vec<Session>> {
        self.repo.get_sessions_by_user_id(user_id, include_temp).await
    }

    /// Revokes the session holding `token`.
    pub async fn delete_session(&self, token: &str) -> Result<Session> {
        let session = self.repo.delete_by_token(token).await?;
        tracing::info!(domain = %self.domain, user_id = %session.user_id, session_id = %session.id, "👋 Session revoked");
        self.revoke(&session).await;
        Ok(session)
    }

    /// Revokes `token`, whether or not its session has been persisted yet.
    /// Returns the number of stored rows removed.
    ///
    /// A token whose row is still being written gets a revocation marker;
    /// the persisting task and every liveness check honour it.
    pub async fn revoke_token(
        &self,
        user_id: &str,
        device_id: &str,
        is_temp: bool,
        token: &str,
    ) -> Result<usize> {
        match self.delete_session(token).await {
            Ok(_) => Ok(1),
            Err(AppError::SessionNotFound) => {
                let session_id = Session::stable_id(self.domain, user_id, device_id, is_temp);
                mark_revoked(self.cache.as_ref(), session_id, token, self.revocation_ttl).await;
                forget_entries(self.cache.as_ref(), session_id, user_id, device_id, token).await;
                tracing::info!(domain = %self.domain, user_id, %session_id, "👋 Unpersisted session revoked");
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    /// Revokes every session of `user_id`.
    pub async fn delete_all_sessions(&self, user_id: &str) -> Result<usize> {
        let sessions = self.repo.delete_all_by_user(user_id).await?;
        tracing::info!(domain = %self.domain, user_id, count = sessions.len(), "👋 All sessions revoked");
        for session in &sessions {
            self.revoke(session).await;
        }
        Ok(sessions.len())
    }

    /// Revokes session `id`, provided it belongs to `user_id`.
    pub async fn delete_session_by_id(&self, user_id: &str, id: Uuid) -> Result<Session> {
        let session = self.repo.get_session_by_id(id).await.map_err(|e| match e {
            AppError::SessionNotFound => AppError::NotFound,
            other => other,
        })?;
        if session.user_id != user_id {
            return Err(AppError::NotFound);
        }

        let session = self.repo.delete_by_id(id).await?;
        tracing::info!(domain = %self.domain, user_id, session_id = %id, "👋 Session revoked by id");
        self.revoke(&session).await;
        Ok(session)
    }

    /// Marks a deleted session's token revoked and drops its cache entries.
    /// The marker outlives a cache write that may still be in flight.
    async fn revoke(&self, session: &Session) {
        mark_revoked(self.cache.as_ref(), session.id, &session.auth_token, self.revocation_ttl).await;
        forget(self.cache.as_ref(), session).await;
    }
}

#[async_trait]
impl SessionValidator for SessionService {
    async fn validate_session(&self, token: &str) -> Result<ValidateSessionResponse> {
        let session = self.repo.get_session_by_token(token).await?;
        let now = Utc::now();

        if is_revoked(self.cache.as_ref(), session.id, token).await {
            tracing::warn!(domain = %self.domain, session_id = %session.id, "❌ Revoked session presented");
            if let Err(e) = self.repo.delete_by_token(token).await {
                tracing::warn!(session_id = %session.id, "⚠️ Failed to delete revoked session: {}", e);
            }
            return Err(AppError::SessionNotFound);
        }

        if !session.is_active {
            return Ok(ValidateSessionResponse::invalid("session is inactive", &session));
        }
        if session.is_expired(now) {
            return Ok(ValidateSessionResponse::invalid("session expired", &session));
        }

        if session.is_single_use {
            if session.is_used || !self.repo.consume_single_use(session.id).await? {
                tracing::warn!(domain = %self.domain, session_id = %session.id, "❌ Single-use session replayed");
                return Err(AppError::SessionUsed);
            }
            tracing::info!(domain = %self.domain, session_id = %session.id, purpose = %session.purpose, "🔓 Single-use session consumed");
            forget(self.cache.as_ref(), &session).await;
        } else if let Err(e) = self.repo.touch_session(session.id, now).await {
            tracing::warn!(session_id = %session.id, "⚠️ Failed to refresh last_seen_at: {}", e);
        }

        Ok(ValidateSessionResponse::valid(&session))
    }
}

/// Drops the cache entries that would let `session` validate without the
/// store. Failures are logged; the entries expire with their TTL anyway.
pub(crate) async fn forget(cache: &dyn Cache, session: &Session) {
    forget_entries(cache, session.id, &session.user_id, &session.device_id, &session.auth_token).await;
}

async fn forget_entries(cache: &dyn Cache, session_id: Uuid, user_id: &str, device_id: &str, token: &str) {
    forget_device_token(cache, user_id, device_id, token).await;
    forget_entry(cache, cache::SESSIONS, &session_id.to_string(), token).await;
}

/// Clears the device entry, but only if it still points at `token`.
pub(crate) async fn forget_device_token(cache: &dyn Cache, user_id: &str, device_id: &str, token: &str) {
    forget_entry(cache, cache::SESSION_TOKENS, &cache::session_token_key(user_id, device_id), token).await;
}

/// Deletes `namespace:key` if it holds `token`. A newer session in the
/// same slot keeps its entry.
async fn forget_entry(cache: &dyn Cache, namespace: &str, key: &str, token: &str) {
    match cache.get(namespace, key).await {
        Ok(Some(cached)) if cached == token => {
            if let Err(e) = cache.delete(namespace, key).await {
                tracing::warn!(namespace, key, "⚠️ Failed to evict cache entry: {}", e);
            }
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(namespace, key, "⚠️ Failed to read cache entry: {}", e),
    }
}

async fn mark_revoked(cache: &dyn Cache, session_id: Uuid, token: &str, ttl: Duration) {
    if let Err(e) = cache
        .set(cache::REVOKED_TOKENS, &session_id.to_string(), token, ttl)
        .await
    {
        tracing::error!(%session_id, "❌ Failed to record revocation: {}", e);
    }
}

/// Whether `token` was revoked for `session_id`. A cache failure reads as
/// not revoked.
pub(crate) async fn is_revoked(cache: &dyn Cache, session_id: Uuid, token: &str) -> bool {
    match cache.get(cache::REVOKED_TOKENS, &session_id.to_string()).await {
        Ok(Some(revoked)) => bool::from(revoked.as_bytes().ct_eq(token.as_bytes())),
        Ok(None) => false,
        Err(e) => {
            tracing::warn!(%session_id, "⚠️ Revocation check failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::models::session::sample;
    use crate::repositories::memory::MemorySessionRepository;
    use crate::repositories::session::SessionLimits;

    const TTL: Duration = Duration::from_secs(900);

    fn service() -> (SessionService, Arc<MemorySessionRepository>, Arc<MemoryCache>) {
        let repo = Arc::new(MemorySessionRepository::new(SessionLimits::default()));
        let cache = Arc::new(MemoryCache::new());
        (
            SessionService::new(Domain::User, repo.clone(), cache.clone(), TTL),
            repo,
            cache,
        )
    }

    #[tokio::test]
    async fn single_use_session_validates_once() {
        let (service, repo, _) = service();
        let mut session = sample("42", "phone", true);
        session.is_single_use = true;
        session.purpose = "password_reset".to_string();
        let token = session.auth_token.clone();
        repo.create_or_update_session(session, TTL).await.unwrap();

        let first = service.validate_session(&token).await.unwrap();
        assert!(first.valid);
        assert_eq!(first.purpose, "password_reset");
        assert_eq!(first.session_type, "temp");
        assert_eq!(first.user_id, "42");

        assert!(matches!(
            service.validate_session(&token).await,
            Err(AppError::SessionUsed)
        ));
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let (service, _, _) = service();
        assert!(matches!(
            service.validate_session("missing").await,
            Err(AppError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn inactive_session_is_reported_invalid() {
        let (service, repo, _) = service();
        let mut session = sample("1", "d", false);
        session.is_active = false;
        let token = session.auth_token.clone();
        repo.create_or_update_session(session, TTL).await.unwrap();

        let response = service.validate_session(&token).await.unwrap();
        assert!(!response.valid);
        assert_eq!(response.error.as_deref(), Some("session is inactive"));
    }

    #[tokio::test]
    async fn revocation_clears_cached_token() {
        let (service, repo, cache) = service();
        let session = sample("1", "laptop", false);
        let token = session.auth_token.clone();
        let stored = repo.create_or_update_session(session, TTL).await.unwrap().session;

        let key = cache::session_token_key("1", "laptop");
        cache.set(cache::SESSION_TOKENS, &key, &token, TTL).await.unwrap();
        cache
            .set(cache::SESSIONS, &stored.id.to_string(), &token, TTL)
            .await
            .unwrap();

        service.delete_session(&token).await.unwrap();

        assert_eq!(cache.get(cache::SESSION_TOKENS, &key).await.unwrap(), None);
        assert_eq!(
            cache.get(cache::SESSIONS, &stored.id.to_string()).await.unwrap(),
            None
        );
        assert!(is_revoked(cache.as_ref(), stored.id, &token).await);
    }

    #[tokio::test]
    async fn revoking_before_the_row_exists_keeps_the_token_dead() {
        let (service, repo, _) = service();
        let mut session = sample("42", "phone", false);
        session.id = Session::stable_id(Domain::User, "42", "phone", false);
        let token = session.auth_token.clone();

        assert_eq!(service.revoke_token("42", "phone", false, &token).await.unwrap(), 0);

        // The background write lands after the logout.
        repo.create_or_update_session(session, TTL).await.unwrap();

        assert!(matches!(
            service.validate_session(&token).await,
            Err(AppError::SessionNotFound)
        ));
        assert!(repo.all().await.is_empty());
    }

    #[tokio::test]
    async fn revocation_leaves_a_newer_token_in_the_slot_alone() {
        let (service, repo, cache) = service();
        let session = sample("1", "laptop", false);
        let old_token = session.auth_token.clone();
        repo.create_or_update_session(session, TTL).await.unwrap();
        service.delete_session(&old_token).await.unwrap();

        let newer = sample("1", "laptop", false);
        let key = cache::session_token_key("1", "laptop");
        cache.set(cache::SESSION_TOKENS, &key, &newer.auth_token, TTL).await.unwrap();
        repo.create_or_update_session(newer.clone(), TTL).await.unwrap();

        service.revoke_token("1", "laptop", false, &old_token).await.unwrap();

        assert_eq!(
            cache.get(cache::SESSION_TOKENS, &key).await.unwrap().as_deref(),
            Some(newer.auth_token.as_str())
        );
        assert!(service.validate_session(&newer.auth_token).await.unwrap().valid);
    }

    #[tokio::test]
    async fn cannot_revoke_someone_elses_session() {
        let (service, repo, _) = service();
        let stored = repo
            .create_or_update_session(sample("owner", "d", false), TTL)
            .await
            .unwrap()
            .session;

        assert!(matches!(
            service.delete_session_by_id("intruder", stored.id).await,
            Err(AppError::NotFound)
        ));
        assert_eq!(service.list_sessions("owner", true).await.unwrap().len(), 1);
    }
}
