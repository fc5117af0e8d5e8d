//! Best-role lookup for token issuance.
//!
//! RBAC itself lives elsewhere; issuance only needs the single
//! highest-priority role of a user, and must keep working when the RBAC
//! store does not answer.

use std::sync::Arc;

use async_trait::async_trait;
use deadpool_postgres::Pool;

use crate::cache::{self, Cache};
use crate::error::Result;
use crate::tasks::BackgroundTasks;

/// Role given when the resolver fails or the user has no roles.
pub const DEGRADED_ROLE: &str = "temp";
/// Role given when none of the user's roles is ranked.
pub const DEFAULT_ROLE: &str = "any";

/// Ranked roles, lowest priority first.
const ROLE_PRIORITY: &[(&str, u8)] = &[("any", 1), ("kyc_unverified", 2), ("trader", 3)];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub name: String,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
pub trait RoleResolver: Send + Sync {
    async fn get_user_roles(&self, user_id: &str) -> Result<Vec<Role>>;
}

/// Reads role assignments from the RBAC tables.
pub struct PgRoleResolver {
    pool: Pool,
}

impl PgRoleResolver {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoleResolver for PgRoleResolver {
    async fn get_user_roles(&self, user_id: &str) -> Result<Vec<Role>> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                SELECT r.name
                FROM user_roles ur
                JOIN roles r ON r.id = ur.role_id
                WHERE ur.user_id = $1
                "#,
            )
            .await?;
        let rows = client.query(&stmt, &[&user_id]).await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.try_get::<_, String>("name").ok())
            .map(Role::new)
            .collect())
    }
}

fn priority(role: &str) -> Option<u8> {
    ROLE_PRIORITY
        .iter()
        .find(|(name, _)| *name == role)
        .map(|(_, rank)| *rank)
}

/// The highest-ranked role in `roles`, or [`DEFAULT_ROLE`] if none is ranked.
pub fn highest_priority(roles: &[Role]) -> &str {
    roles
        .iter()
        .filter_map(|r| priority(&r.name).map(|rank| (rank, r.name.as_str())))
        .max_by_key(|(rank, _)| *rank)
        .map(|(_, name)| name)
        .unwrap_or(DEFAULT_ROLE)
}

/// Resolves a user's role through the cache, then the resolver.
pub struct RoleService {
    resolver: Arc<dyn RoleResolver>,
    cache: Arc<dyn Cache>,
    tasks: BackgroundTasks,
}

impl RoleService {
    pub fn new(resolver: Arc<dyn RoleResolver>, cache: Arc<dyn Cache>, tasks: BackgroundTasks) -> Self {
        Self {
            resolver,
            cache,
            tasks,
        }
    }

    /// Never fails: resolver errors and empty role lists degrade to
    /// [`DEGRADED_ROLE`], which is not cached.
    pub async fn resolve(&self, user_id: &str) -> String {
        let key = cache::role_key(user_id);

        match self.cache.get(cache::USER_ROLES, &key).await {
            Ok(Some(role)) if !role.is_empty() => {
                tracing::debug!(user_id, role = %role, "🎯 Role cache hit");
                return role;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(user_id, "⚠️ Role cache read failed: {}", e),
        }

        let roles = match self.resolver.get_user_roles(user_id).await {
            Ok(roles) if !roles.is_empty() => roles,
            Ok(_) => {
                tracing::warn!(user_id, "⚠️ User has no roles, issuing degraded role");
                return DEGRADED_ROLE.to_string();
            }
            Err(e) => {
                tracing::warn!(user_id, "⚠️ Role lookup failed, issuing degraded role: {}", e);
                return DEGRADED_ROLE.to_string();
            }
        };

        let role = highest_priority(&roles).to_string();

        let cache = self.cache.clone();
        let cached_role = role.clone();
        let user = user_id.to_string();
        self.tasks.spawn("cache_user_role", async move {
            if let Err(e) = cache
                .set(cache::USER_ROLES, &cache::role_key(&user), &cached_role, cache::ROLE_TTL)
                .await
            {
                tracing::warn!(user_id = %user, "⚠️ Failed to cache role: {}", e);
            }
        });

        role
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fixed answers, counting calls.
    pub(crate) struct StaticRoles {
        pub roles: Option<Vec<Role>>,
        pub calls: AtomicUsize,
    }

    impl StaticRoles {
        pub(crate) fn new(roles: &[&str]) -> Self {
            Self {
                roles: Some(roles.iter().map(|r| Role::new(*r)).collect()),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                roles: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RoleResolver for StaticRoles {
        async fn get_user_roles(&self, _user_id: &str) -> Result<Vec<Role>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.roles
                .clone()
                .ok_or_else(|| AppError::Internal("rbac unavailable".into()))
        }
    }

    #[test]
    fn picks_the_highest_ranked_role() {
        let roles = [Role::new("any"), Role::new("trader"), Role::new("kyc_unverified")];
        assert_eq!(highest_priority(&roles), "trader");
    }

    #[test]
    fn unranked_roles_fall_back_to_any() {
        assert_eq!(highest_priority(&[Role::new("auditor")]), DEFAULT_ROLE);
    }

    #[tokio::test]
    async fn resolver_failure_degrades_and_is_not_cached() {
        let cache = Arc::new(MemoryCache::new());
        let tasks = BackgroundTasks::new();
        let service = RoleService::new(Arc::new(StaticRoles::failing()), cache.clone(), tasks.clone());

        assert_eq!(service.resolve("42").await, DEGRADED_ROLE);
        tasks.flush().await;
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn empty_role_list_degrades() {
        let service = RoleService::new(
            Arc::new(StaticRoles::new(&[])),
            Arc::new(MemoryCache::new()),
            BackgroundTasks::new(),
        );
        assert_eq!(service.resolve("42").await, DEGRADED_ROLE);
    }

    #[tokio::test]
    async fn resolved_role_is_cached_for_the_next_call() {
        let cache = Arc::new(MemoryCache::new());
        let tasks = BackgroundTasks::new();
        let resolver = Arc::new(StaticRoles::new(&["kyc_unverified", "any"]));
        let service = RoleService::new(resolver.clone(), cache.clone(), tasks.clone());

        assert_eq!(service.resolve("42").await, "kyc_unverified");
        tasks.flush().await;
        assert_eq!(service.resolve("42").await, "kyc_unverified");
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }
}
