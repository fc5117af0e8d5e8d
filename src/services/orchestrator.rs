//! Session issuance.
//!
//! The caller gets its token as soon as it is signed. Persisting the
//! session and warming the cache happen afterwards on the background
//! executor; both may fail without making the issued token unusable.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;

use crate::{
    cache::{self, Cache},
    crypto::jwt::TokenIssuer,
    domain::Domain,
    error::{AppError, Result},
    models::session::{Session, SessionKind, UNKNOWN},
    repositories::session::SessionRepository,
    services::{
        roles::RoleService,
        sessions::{forget, forget_device_token, is_revoked},
    },
    tasks::{BackgroundTasks, RetryPolicy},
};

/// Input to [`SessionOrchestrator::create_session`].
#[derive(Debug, Clone, Default)]
pub struct CreateSessionParams {
    pub user_id: String,
    pub device_id: String,
    pub ip_address: String,
    pub user_agent: String,
    pub geo_location: String,
    pub device_meta: String,
    pub purpose: String,
    pub is_temp: bool,
    /// Only honoured for temp sessions.
    pub is_single_use: bool,
    pub extra_data: BTreeMap<String, String>,
}

/// A signed token and the session it belongs to.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub session: Session,
    pub token: String,
    pub expires_in: Duration,
    pub role: String,
}

pub struct SessionOrchestrator {
    domain: Domain,
    issuer: Arc<TokenIssuer>,
    repo: Arc<dyn SessionRepository>,
    cache: Arc<dyn Cache>,
    roles: Arc<RoleService>,
    tasks: BackgroundTasks,
    temp_ttl: Duration,
    cache_write_timeout: Duration,
    persist_retry: RetryPolicy,
}

impl SessionOrchestrator {
    pub fn new(
        issuer: Arc<TokenIssuer>,
        repo: Arc<dyn SessionRepository>,
        cache: Arc<dyn Cache>,
        roles: Arc<RoleService>,
        tasks: BackgroundTasks,
        temp_ttl: Duration,
        cache_write_timeout: Duration,
    ) -> Self {
        Self {
            domain: issuer.domain(),
            issuer,
            repo,
            cache,
            roles,
            tasks,
            temp_ttl,
            cache_write_timeout,
            persist_retry: RetryPolicy::PERSISTENCE,
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Issues a token for a new session and returns without waiting for
    /// persistence.
    pub async fn create_session(&self, params: CreateSessionParams) -> Result<CreatedSession> {
        if params.user_id.trim().is_empty() {
            return Err(AppError::Validation("user_id is required".to_string()));
        }

        let device_id = or_unknown(params.device_id);
        let ip_address = or_unknown(params.ip_address);
        let is_single_use = params.is_temp && params.is_single_use;

        let role = self.roles.resolve(&params.user_id).await;

        let issued = self.issuer.generate(
            &params.user_id,
            &role,
            &device_id,
            &params.purpose,
            params.is_temp,
            &params.extra_data,
        )?;

        let now = Utc::now();
        let session = Session {
            id: Session::stable_id(self.domain, &params.user_id, &device_id, params.is_temp),
            user_id: params.user_id,
            auth_token: issued.token.clone(),
            device_id,
            ip_address,
            user_agent: params.user_agent,
            geo_location: params.geo_location,
            device_meta: params.device_meta,
            is_active: true,
            is_single_use,
            is_temp: params.is_temp,
            is_used: false,
            purpose: params.purpose,
            last_seen_at: now,
            created_at: now,
            expires_at: params
                .is_temp
                .then(|| now + chrono::Duration::from_std(self.temp_ttl).unwrap_or(chrono::Duration::zero())),
        };

        tracing::info!(
            domain = %self.domain,
            user_id = %session.user_id,
            device_id = %session.device_id,
            kind = SessionKind::from_temp(session.is_temp).as_str(),
            role = %role,
            "🔑 Session token issued"
        );

        self.spawn_persist(session.clone());
        self.spawn_cache_population(session.clone(), role.clone(), issued.ttl);

        Ok(CreatedSession {
            session,
            token: issued.token,
            expires_in: issued.ttl,
            role,
        })
    }

    fn spawn_persist(&self, session: Session) {
        let repo = self.repo.clone();
        let cache = self.cache.clone();
        let policy = self.persist_retry;
        let temp_ttl = self.temp_ttl;
        let domain = self.domain;

        self.tasks.spawn("persist_session", async move {
            let outcome = policy
                .run("persist_session", |_| {
                    repo.create_or_update_session(session.clone(), temp_ttl)
                })
                .await;

            match outcome {
                Ok(outcome) => {
                    tracing::debug!(%domain, session_id = %outcome.session.id, "💾 Session persisted");

                    // Logged out while the write was in flight.
                    if is_revoked(cache.as_ref(), outcome.session.id, &session.auth_token).await {
                        match repo.delete_by_token(&session.auth_token).await {
                            Ok(removed) => forget(cache.as_ref(), &removed).await,
                            Err(AppError::SessionNotFound) => {}
                            Err(e) => tracing::error!(
                                %domain,
                                session_id = %outcome.session.id,
                                "❌ Failed to drop a session revoked during persistence: {}",
                                e
                            ),
                        }
                        tracing::info!(%domain, session_id = %outcome.session.id, "👋 Revoked session removed after persistence");
                    }

                    // The upsert replaced this token in place.
                    if let Some(replaced) = &outcome.replaced {
                        forget_device_token(
                            cache.as_ref(),
                            &replaced.user_id,
                            &replaced.device_id,
                            &replaced.auth_token,
                        )
                        .await;
                    }

                    for evicted in &outcome.evicted {
                        forget(cache.as_ref(), evicted).await;
                    }
                }
                // TODO: hand these to a dead-letter queue once one exists for the auth service.
                Err(e) => tracing::error!(
                    %domain,
                    user_id = %session.user_id,
                    device_id = %session.device_id,
                    "❌ Session persistence failed after {} attempts: {}",
                    policy.attempts,
                    e
                ),
            }
        });
    }

    fn spawn_cache_population(&self, session: Session, role: String, token_ttl: Duration) {
        let cache = self.cache.clone();
        let timeout = self.cache_write_timeout;

        self.tasks.spawn("populate_session_cache", async move {
            let user_id = session.user_id.clone();
            let errors = match tokio::time::timeout(timeout, write_cache_entries(cache.as_ref(), &session, &role, token_ttl)).await {
                Ok(errors) => errors,
                Err(_) => vec![format!("timed out after {:?}", timeout)],
            };

            if errors.is_empty() {
                tracing::debug!(user_id = %user_id, "⚡ Session cache populated");
            } else {
                tracing::warn!(user_id = %user_id, "⚠️ Session cache population incomplete: {}", errors.join("; "));
            }
        });
    }
}

fn or_unknown(value: String) -> String {
    if value.trim().is_empty() {
        UNKNOWN.to_string()
    } else {
        value
    }
}

/// Writes the issuance's cache entries concurrently and returns the
/// failures, one message per entry.
async fn write_cache_entries(
    cache: &dyn Cache,
    session: &Session,
    role: &str,
    token_ttl: Duration,
) -> Vec<String> {
    let session_id = session.id.to_string();
    let device_key = cache::session_token_key(&session.user_id, &session.device_id);
    let info_key = cache::user_info_key(&session.user_id);
    let info = user_info(session, role);
    let devices_key = cache::user_devices_key(&session.user_id);
    let devices = merged_devices(cache, &devices_key, &session.device_id).await;

    let mut writes = vec![
        (
            cache::SESSIONS,
            session_id.as_str(),
            session.auth_token.as_str(),
            token_ttl,
        ),
        (cache::USER_INFO, info_key.as_str(), info.as_str(), cache::USER_INFO_TTL),
        (
            cache::USER_DEVICES,
            devices_key.as_str(),
            devices.as_str(),
            cache::USER_DEVICES_TTL,
        ),
    ];

    // A single-use token must always reach the store so it gets consumed.
    if !session.is_single_use {
        writes.push((
            cache::SESSION_TOKENS,
            device_key.as_str(),
            session.auth_token.as_str(),
            token_ttl,
        ));
    }

    let results = join_all(writes.iter().map(|(namespace, key, value, ttl)| async move {
        cache
            .set(namespace, key, value, *ttl)
            .await
            .map_err(|e| format!("{}:{}: {}", namespace, key, e))
    }))
    .await;

    results.into_iter().filter_map(|r| r.err()).collect()
}

fn user_info(session: &Session, role: &str) -> String {
    sonic_rs::to_string(&sonic_rs::json!({
        "user_id": session.user_id,
        "role": role,
        "device_id": session.device_id,
        "ip_address": session.ip_address,
        "session_type": session.kind().as_str(),
        "updated_at": session.last_seen_at.to_rfc3339(),
    }))
    .unwrap_or_default()
}

/// The cached device list with `device_id` added.
async fn merged_devices(cache: &dyn Cache, key: &str, device_id: &str) -> String {
    let mut devices: Vec<String> = match cache.get(cache::USER_DEVICES, key).await {
        Ok(Some(raw)) => sonic_rs::from_str(&raw).unwrap_or_default(),
        _ => Vec::new(),
    };
    if !devices.iter().any(|d| d == device_id) {
        devices.push(device_id.to_string());
    }
    sonic_rs::to_string(&devices).unwrap_or_else(|_| "[]".to_string())
}
