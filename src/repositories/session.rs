use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::{
    domain::Domain,
    error::{AppError, Result},
    models::session::{Session, SessionKind},
};

/// Per-user caps on concurrently active sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub main: usize,
    pub temp: usize,
}

impl SessionLimits {
    pub fn for_kind(&self, kind: SessionKind) -> usize {
        match kind {
            SessionKind::Main => self.main,
            SessionKind::Temp => self.temp,
        }
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self { main: 3, temp: 5 }
    }
}

/// The stored row after an upsert, plus any sessions evicted to make room.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub session: Session,
    pub evicted: Vec<Session>,
    /// The row as it was before an in-place update swapped its token.
    pub replaced: Option<Session>,
}

/// Durable session rows for one domain.
///
/// Implementations enforce the per-user limits and the
/// `(user_id, device_id, is_temp)` uniqueness inside a single atomic unit.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Creates the session or updates the row for the same
    /// `(user_id, device_id, is_temp)`, evicting the least recently seen
    /// session of the same class when the user is at the limit. An update
    /// that changes the token reports the previous row as `replaced`.
    ///
    /// Temp sessions get `expires_at = now + temp_ttl`; main sessions never
    /// expire. Empty strings in `session` never overwrite stored values.
    async fn create_or_update_session(
        &self,
        session: Session,
        temp_ttl: Duration,
    ) -> Result<UpsertOutcome>;

    async fn get_session_by_token(&self, token: &str) -> Result<Session>;

    async fn get_session_by_id(&self, id: Uuid) -> Result<Session>;

    /// Most recently seen first.
    async fn get_sessions_by_user_id(&self, user_id: &str, include_temp: bool)
    -> Result<Vec<Session>>;

    async fn delete_by_token(&self, token: &str) -> Result<Session>;

    async fn delete_all_by_user(&self, user_id: &str) -> Result<Vec<Session>>;

    async fn delete_by_id(&self, id: Uuid) -> Result<Session>;

    async fn update_session_used(&self, id: Uuid, used: bool) -> Result<()>;

    /// Flips `is_used` from false to true. Returns `false` if the session
    /// was already used, so at most one caller ever sees `true`.
    async fn consume_single_use(&self, id: Uuid) -> Result<bool>;

    async fn touch_session(&self, id: Uuid, seen_at: DateTime<Utc>) -> Result<()>;
}

/// Applies the class-specific expiry rule.
pub(crate) fn stamp_expiry(session: &mut Session, now: DateTime<Utc>, temp_ttl: Duration) {
    session.expires_at = if session.is_temp {
        let ttl = chrono::Duration::from_std(temp_ttl).unwrap_or(chrono::Duration::minutes(15));
        Some(now + ttl)
    } else {
        None
    };
}

/// How many sessions must go so that one more fits under `limit`.
pub(crate) fn excess(active: usize, limit: usize) -> usize {
    if active >= limit { active - limit + 1 } else { 0 }
}

const COLUMNS: &str = "id, user_id, auth_token, device_id, ip_address, user_agent, geo_location, \
    device_meta, is_active, is_single_use, is_temp, is_used, purpose, last_seen_at, created_at, expires_at";

/// SQL for one domain's table.
struct Queries {
    purge_expired: String,
    count_active: String,
    evict_oldest: String,
    upsert: String,
    by_slot: String,
    by_token: String,
    by_id: String,
    by_user: String,
    by_user_main: String,
    delete_by_token: String,
    delete_all: String,
    delete_by_id: String,
    update_used: String,
    consume: String,
    touch: String,
}

impl Queries {
    fn for_table(t: &str) -> Self {
        let active_in_class = "user_id = $1 AND is_temp = $2 AND is_active = TRUE \
            AND (expires_at IS NULL OR expires_at > $3) AND device_id <> $4";

        Self {
            purge_expired: format!(
                "DELETE FROM {t} WHERE user_id = $1 AND is_temp = TRUE \
                 AND expires_at IS NOT NULL AND expires_at <= $2"
            ),
            count_active: format!("SELECT COUNT(*) FROM {t} WHERE {active_in_class}"),
            evict_oldest: format!(
                "DELETE FROM {t} WHERE id IN ( \
                     SELECT id FROM {t} WHERE {active_in_class} \
                     ORDER BY last_seen_at ASC LIMIT $5 \
                 ) RETURNING {COLUMNS}"
            ),
            upsert: format!(
                "INSERT INTO {t} ({COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
                 ON CONFLICT (user_id, device_id, is_temp) DO UPDATE SET \
                     auth_token    = COALESCE(NULLIF(EXCLUDED.auth_token, ''), {t}.auth_token), \
                     ip_address    = COALESCE(NULLIF(EXCLUDED.ip_address, ''), {t}.ip_address), \
                     user_agent    = COALESCE(NULLIF(EXCLUDED.user_agent, ''), {t}.user_agent), \
                     geo_location  = COALESCE(NULLIF(EXCLUDED.geo_location, ''), {t}.geo_location), \
                     device_meta   = COALESCE(NULLIF(EXCLUDED.device_meta, ''), {t}.device_meta), \
                     purpose       = COALESCE(NULLIF(EXCLUDED.purpose, ''), {t}.purpose), \
                     is_active     = EXCLUDED.is_active, \
                     is_single_use = EXCLUDED.is_single_use, \
                     is_used       = EXCLUDED.is_used, \
                     last_seen_at  = EXCLUDED.last_seen_at, \
                     expires_at    = EXCLUDED.expires_at \
                 RETURNING {COLUMNS}"
            ),
            by_slot: format!(
                "SELECT {COLUMNS} FROM {t} WHERE user_id = $1 AND device_id = $2 AND is_temp = $3 \
                 FOR UPDATE"
            ),
            by_token: format!("SELECT {COLUMNS} FROM {t} WHERE auth_token = $1"),
            by_id: format!("SELECT {COLUMNS} FROM {t} WHERE id = $1"),
            by_user: format!(
                "SELECT {COLUMNS} FROM {t} WHERE user_id = $1 ORDER BY last_seen_at DESC"
            ),
            by_user_main: format!(
                "SELECT {COLUMNS} FROM {t} WHERE user_id = $1 AND is_temp = FALSE \
                 ORDER BY last_seen_at DESC"
            ),
            delete_by_token: format!("DELETE FROM {t} WHERE auth_token = $1 RETURNING {COLUMNS}"),
            delete_all: format!("DELETE FROM {t} WHERE user_id = $1 RETURNING {COLUMNS}"),
            delete_by_id: format!("DELETE FROM {t} WHERE id = $1 RETURNING {COLUMNS}"),
            update_used: format!("UPDATE {t} SET is_used = $2 WHERE id = $1"),
            consume: format!(
                "UPDATE {t} SET is_used = TRUE, last_seen_at = $2 \
                 WHERE id = $1 AND is_used = FALSE RETURNING id"
            ),
            touch: format!("UPDATE {t} SET last_seen_at = $2 WHERE id = $1"),
        }
    }
}

/// A helper function to map a `tokio_postgres::Row` to a `Session`.
fn row_to_session(row: &Row) -> Result<Session> {
    fn col<'a, T: tokio_postgres::types::FromSql<'a>>(row: &'a Row, name: &str) -> Result<T> {
        row.try_get(name)
            .map_err(|_| AppError::MissingData(name.to_string()))
    }

    Ok(Session {
        id: col(row, "id")?,
        user_id: col(row, "user_id")?,
        auth_token: col(row, "auth_token")?,
        device_id: col(row, "device_id")?,
        ip_address: col(row, "ip_address")?,
        user_agent: col(row, "user_agent")?,
        geo_location: col(row, "geo_location")?,
        device_meta: col(row, "device_meta")?,
        is_active: col(row, "is_active")?,
        is_single_use: col(row, "is_single_use")?,
        is_temp: col(row, "is_temp")?,
        is_used: col(row, "is_used")?,
        purpose: col(row, "purpose")?,
        last_seen_at: col(row, "last_seen_at")?,
        created_at: col(row, "created_at")?,
        expires_at: col(row, "expires_at")?,
    })
}

/// PostgreSQL-backed session rows for one domain.
pub struct PgSessionRepository {
    pool: Pool,
    domain: Domain,
    limits: SessionLimits,
    sql: Queries,
}

impl PgSessionRepository {
    pub fn new(pool: Pool, domain: Domain, limits: SessionLimits) -> Self {
        Self {
            pool,
            domain,
            limits,
            sql: Queries::for_table(domain.sessions_table()),
        }
    }

    async fn fetch_one(&self, query: &str, token_or_id: &(dyn tokio_postgres::types::ToSql + Sync)) -> Result<Session> {
        let client = self.pool.get().await?;
        let stmt = client.prepare_cached(query).await?;
        let row = client
            .query_opt(&stmt, &[token_or_id])
            .await?
            .ok_or(AppError::SessionNotFound)?;
        row_to_session(&row)
    }
}

#[async_trait]
impl SessionRepository for PgSessionRepository {
    async fn create_or_update_session(
        &self,
        mut session: Session,
        temp_ttl: Duration,
    ) -> Result<UpsertOutcome> {
        let now = Utc::now();
        let kind = session.kind();
        let limit = self.limits.for_kind(kind);

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        // Serializes concurrent creations for the same user so the limit
        // check and the upsert see the same rows.
        let lock_key = format!("{}:{}", self.domain.sessions_table(), session.user_id);
        tx.execute("SELECT pg_advisory_xact_lock(hashtext($1))", &[&lock_key])
            .await?;

        if session.is_temp {
            let stmt = tx.prepare_cached(&self.sql.purge_expired).await?;
            let purged = tx.execute(&stmt, &[&session.user_id, &now]).await?;
            if purged > 0 {
                tracing::debug!(user_id = %session.user_id, purged, "🧹 Purged expired temp sessions");
            }
        }

        let stmt = tx.prepare_cached(&self.sql.count_active).await?;
        let active: i64 = tx
            .query_one(&stmt, &[&session.user_id, &session.is_temp, &now, &session.device_id])
            .await?
            .try_get(0)
            .map_err(|_| AppError::MissingData("count".to_string()))?;

        let mut evicted = Vec::new();
        let overflow = excess(active.max(0) as usize, limit);
        if overflow > 0 {
            let stmt = tx.prepare_cached(&self.sql.evict_oldest).await?;
            let rows = tx
                .query(
                    &stmt,
                    &[
                        &session.user_id,
                        &session.is_temp,
                        &now,
                        &session.device_id,
                        &(overflow as i64),
                    ],
                )
                .await?;
            evicted = rows.iter().map(row_to_session).collect::<Result<Vec<_>>>()?;
            tracing::info!(
                domain = %self.domain,
                user_id = %session.user_id,
                kind = kind.as_str(),
                evicted = evicted.len(),
                "♻️ Session limit reached, evicted least recently seen"
            );
        }

        stamp_expiry(&mut session, now, temp_ttl);

        let stmt = tx.prepare_cached(&self.sql.by_slot).await?;
        let previous = tx
            .query_opt(&stmt, &[&session.user_id, &session.device_id, &session.is_temp])
            .await?
            .map(|row| row_to_session(&row))
            .transpose()?;

        let stmt = tx.prepare_cached(&self.sql.upsert).await?;
        let row = tx
            .query_one(
                &stmt,
                &[
                    &session.id,
                    &session.user_id,
                    &session.auth_token,
                    &session.device_id,
                    &session.ip_address,
                    &session.user_agent,
                    &session.geo_location,
                    &session.device_meta,
                    &session.is_active,
                    &session.is_single_use,
                    &session.is_temp,
                    &session.is_used,
                    &session.purpose,
                    &session.last_seen_at,
                    &session.created_at,
                    &session.expires_at,
                ],
            )
            .await?;
        let stored = row_to_session(&row)?;

        tx.commit().await?;

        let replaced = previous.filter(|p| p.auth_token != stored.auth_token);
        Ok(UpsertOutcome {
            session: stored,
            evicted,
            replaced,
        })
    }

    async fn get_session_by_token(&self, token: &str) -> Result<Session> {
        self.fetch_one(&self.sql.by_token, &token).await
    }

    async fn get_session_by_id(&self, id: Uuid) -> Result<Session> {
        self.fetch_one(&self.sql.by_id, &id).await
    }

    async fn get_sessions_by_user_id(
        &self,
        user_id: &str,
        include_temp: bool,
    ) -> Result<Vec<Session>> {
        let query = if include_temp {
            &self.sql.by_user
        } else {
            &self.sql.by_user_main
        };

        let client = self.pool.get().await?;
        let stmt = client.prepare_cached(query).await?;
        let rows = client.query(&stmt, &[&user_id]).await?;
        rows.iter().map(row_to_session).collect()
    }

    async fn delete_by_token(&self, token: &str) -> Result<Session> {
        self.fetch_one(&self.sql.delete_by_token, &token).await
    }

    async fn delete_all_by_user(&self, user_id: &str) -> Result<Vec<Session>> {
        let client = self.pool.get().await?;
        let stmt = client.prepare_cached(&self.sql.delete_all).await?;
        let rows = client.query(&stmt, &[&user_id]).await?;
        rows.iter().map(row_to_session).collect()
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<Session> {
        self.fetch_one(&self.sql.delete_by_id, &id).await
    }

    async fn update_session_used(&self, id: Uuid, used: bool) -> Result<()> {
        let client = self.pool.get().await?;
        let stmt = client.prepare_cached(&self.sql.update_used).await?;
        match client.execute(&stmt, &[&id, &used]).await? {
            0 => Err(AppError::SessionNotFound),
            _ => Ok(()),
        }
    }

    async fn consume_single_use(&self, id: Uuid) -> Result<bool> {
        let client = self.pool.get().await?;
        let stmt = client.prepare_cached(&self.sql.consume).await?;
        let row = client.query_opt(&stmt, &[&id, &Utc::now()]).await?;
        Ok(row.is_some())
    }

    async fn touch_session(&self, id: Uuid, seen_at: DateTime<Utc>) -> Result<()> {
        let client = self.pool.get().await?;
        let stmt = client.prepare_cached(&self.sql.touch).await?;
        client.execute(&stmt, &[&id, &seen_at]).await?;
        Ok(())
    }
}
