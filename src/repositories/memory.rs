use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::session::{SessionLimits, SessionRepository, UpsertOutcome, excess, stamp_expiry};
use crate::error::{AppError, Result};
use crate::models::session::Session;

/// Session rows held in process memory.
///
/// A single lock covers every operation, which gives the same per-user
/// atomicity as the PostgreSQL transaction.
#[derive(Clone, Default)]
pub struct MemorySessionRepository {
    rows: Arc<Mutex<HashMap<Uuid, Session>>>,
    limits: SessionLimits,
}

impl MemorySessionRepository {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            rows: Arc::default(),
            limits,
        }
    }

    /// Every stored row, in no particular order.
    pub async fn all(&self) -> Vec<Session> {
        self.rows.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn create_or_update_session(
        &self,
        mut session: Session,
        temp_ttl: Duration,
    ) -> Result<UpsertOutcome> {
        let now = Utc::now();
        let limit = self.limits.for_kind(session.kind());
        let mut rows = self.rows.lock().await;

        if session.is_temp {
            rows.retain(|_, s| !(s.user_id == session.user_id && s.is_temp && s.is_expired(now)));
        }

        let mut candidates: Vec<(DateTime<Utc>, Uuid)> = rows
            .values()
            .filter(|s| {
                s.user_id == session.user_id
                    && s.is_temp == session.is_temp
                    && s.device_id != session.device_id
                    && s.is_live(now)
            })
            .map(|s| (s.last_seen_at, s.id))
            .collect();
        candidates.sort();

        let overflow = excess(candidates.len(), limit);
        let evicted: Vec<Session> = candidates
            .into_iter()
            .take(overflow)
            .filter_map(|(_, id)| rows.remove(&id))
            .collect();

        stamp_expiry(&mut session, now, temp_ttl);

        let existing = rows
            .values_mut()
            .find(|s| {
                s.user_id == session.user_id
                    && s.device_id == session.device_id
                    && s.is_temp == session.is_temp
            });

        let (stored, replaced) = match existing {
            Some(row) => {
                let previous = row.clone();
                row.merge_from(session);
                let replaced = (previous.auth_token != row.auth_token).then_some(previous);
                (row.clone(), replaced)
            }
            None => {
                rows.insert(session.id, session.clone());
                (session, None)
            }
        };

        Ok(UpsertOutcome {
            session: stored,
            evicted,
            replaced,
        })
    }

    async fn get_session_by_token(&self, token: &str) -> Result<Session> {
        let rows = self.rows.lock().await;
        rows.values()
            .find(|s| s.auth_token == token)
            .cloned()
            .ok_or(AppError::SessionNotFound)
    }

    async fn get_session_by_id(&self, id: Uuid) -> Result<Session> {
        let rows = self.rows.lock().await;
        rows.get(&id).cloned().ok_or(AppError::SessionNotFound)
    }

    async fn get_sessions_by_user_id(
        &self,
        user_id: &str,
        include_temp: bool,
    ) -> Result<Vec<Session>> {
        let rows = self.rows.lock().await;
        let mut sessions: Vec<Session> = rows
            .values()
            .filter(|s| s.user_id == user_id && (include_temp || !s.is_temp))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        Ok(sessions)
    }

    async fn delete_by_token(&self, token: &str) -> Result<Session> {
        let mut rows = self.rows.lock().await;
        let id = rows
            .values()
            .find(|s| s.auth_token == token)
            .map(|s| s.id)
            .ok_or(AppError::SessionNotFound)?;
        rows.remove(&id).ok_or(AppError::SessionNotFound)
    }

    async fn delete_all_by_user(&self, user_id: &str) -> Result<Vec<Session>> {
        let mut rows = self.rows.lock().await;
        let ids: Vec<Uuid> = rows
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.id)
            .collect();
        Ok(ids.iter().filter_map(|id| rows.remove(id)).collect())
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<Session> {
        let mut rows = self.rows.lock().await;
        rows.remove(&id).ok_or(AppError::SessionNotFound)
    }

    async fn update_session_used(&self, id: Uuid, used: bool) -> Result<()> {
        let mut rows = self.rows.lock().await;
        let row = rows.get_mut(&id).ok_or(AppError::SessionNotFound)?;
        row.is_used = used;
        Ok(())
    }

    async fn consume_single_use(&self, id: Uuid) -> Result<bool> {
        let mut rows = self.rows.lock().await;
        match rows.get_mut(&id) {
            Some(row) if !row.is_used => {
                row.is_used = true;
                row.last_seen_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch_session(&self, id: Uuid, seen_at: DateTime<Utc>) -> Result<()> {
        let mut rows = self.rows.lock().await;
        if let Some(row) = rows.get_mut(&id) {
            row.last_seen_at = seen_at;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::session::sample;

    const TTL: Duration = Duration::from_secs(900);

    fn seen(session: &mut Session, secs_ago: i64) {
        session.last_seen_at = Utc::now() - chrono::Duration::seconds(secs_ago);
    }

    #[tokio::test]
    async fn main_sessions_beyond_the_limit_evict_the_least_recently_seen() {
        let repo = MemorySessionRepository::new(SessionLimits::default());

        for (device, age) in [("a", 40), ("b", 30), ("c", 20), ("d", 10), ("e", 0)] {
            let mut session = sample("u1", device, false);
            seen(&mut session, age);
            repo.create_or_update_session(session, TTL).await.unwrap();
        }

        let remaining = repo.get_sessions_by_user_id("u1", false).await.unwrap();
        let devices: Vec<&str> = remaining.iter().map(|s| s.device_id.as_str()).collect();
        assert_eq!(devices, vec!["e", "d", "c"]);
        assert!(remaining.iter().all(|s| s.expires_at.is_none()));
    }

    #[tokio::test]
    async fn same_device_updates_in_place_without_evicting() {
        let repo = MemorySessionRepository::new(SessionLimits::default());
        for device in ["a", "b", "c"] {
            repo.create_or_update_session(sample("u1", device, false), TTL)
                .await
                .unwrap();
        }

        let mut again = sample("u1", "b", false);
        again.user_agent = String::new();
        let outcome = repo.create_or_update_session(again.clone(), TTL).await.unwrap();

        assert!(outcome.evicted.is_empty());
        assert_eq!(outcome.session.auth_token, again.auth_token);
        assert!(outcome.replaced.is_some_and(|r| r.auth_token != again.auth_token));
        assert_eq!(outcome.session.user_agent, "test-agent");
        assert_eq!(repo.all().await.len(), 3);
    }

    #[tokio::test]
    async fn concurrent_creations_never_exceed_the_main_limit() {
        let repo = Arc::new(MemorySessionRepository::new(SessionLimits::default()));
        let devices: Vec<String> = (0..8).map(|i| format!("device-{}", i)).collect();

        let results = futures::future::join_all(devices.iter().map(|device| {
            let repo = repo.clone();
            let session = sample("u1", device, false);
            async move { repo.create_or_update_session(session, TTL).await }
        }))
        .await;
        assert!(results.iter().all(|r| r.is_ok()));

        let remaining = repo.get_sessions_by_user_id("u1", false).await.unwrap();
        assert_eq!(remaining.len(), SessionLimits::default().main);

        let evicted: usize = results.iter().flatten().map(|o| o.evicted.len()).sum();
        assert_eq!(evicted, devices.len() - SessionLimits::default().main);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_tasks_never_exceed_the_main_limit() {
        let repo = Arc::new(MemorySessionRepository::new(SessionLimits::default()));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let repo = repo.clone();
                tokio::spawn(async move {
                    repo.create_or_update_session(sample("u1", &format!("d{}", i), false), TTL)
                        .await
                })
            })
            .collect();

        for handle in futures::future::join_all(handles).await {
            handle.unwrap().unwrap();
        }

        assert_eq!(
            repo.get_sessions_by_user_id("u1", false).await.unwrap().len(),
            SessionLimits::default().main
        );
    }

    #[tokio::test]
    async fn temp_and_main_limits_are_independent() {
        let repo = MemorySessionRepository::new(SessionLimits { main: 1, temp: 2 });

        repo.create_or_update_session(sample("u1", "a", false), TTL).await.unwrap();
        for device in ["a", "b", "c"] {
            repo.create_or_update_session(sample("u1", device, true), TTL)
                .await
                .unwrap();
        }

        let all = repo.get_sessions_by_user_id("u1", true).await.unwrap();
        assert_eq!(all.iter().filter(|s| !s.is_temp).count(), 1);
        assert_eq!(all.iter().filter(|s| s.is_temp).count(), 2);
        assert!(all.iter().filter(|s| s.is_temp).all(|s| s.expires_at.is_some()));
    }

    #[tokio::test]
    async fn consume_succeeds_exactly_once() {
        let repo = MemorySessionRepository::new(SessionLimits::default());
        let mut session = sample("42", "d", true);
        session.is_single_use = true;
        let stored = repo.create_or_update_session(session, TTL).await.unwrap().session;

        assert!(repo.consume_single_use(stored.id).await.unwrap());
        assert!(!repo.consume_single_use(stored.id).await.unwrap());
    }

    #[tokio::test]
    async fn missing_rows_report_not_found() {
        let repo = MemorySessionRepository::new(SessionLimits::default());
        assert!(matches!(
            repo.get_session_by_token("nope").await,
            Err(AppError::SessionNotFound)
        ));
        assert!(matches!(
            repo.update_session_used(Uuid::new_v4(), true).await,
            Err(AppError::SessionNotFound)
        ));
    }
}
