use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use http::HeaderValue;
use redis::aio::ConnectionManager;
use zeroize::Zeroizing;

use crate::{
    cache::{Cache, RateLimitStore, RedisCache},
    config::Config,
    crypto::jwt::{TokenIssuer, TokenVerifier, VerifierSet},
    domain::Domain,
    error::{AppError, Result},
    middleware_layer::{auth::Gateway, rate_limit::RateLimiter},
    repositories::session::{PgSessionRepository, SessionLimits, SessionRepository},
    services::{
        orchestrator::SessionOrchestrator,
        roles::{PgRoleResolver, RoleResolver, RoleService},
        sessions::{SessionService, SessionValidator},
    },
    tasks::BackgroundTasks,
};

/// Storage the services run on.
pub struct Backends {
    pub cache: Arc<dyn Cache>,
    pub rate_limits: Arc<dyn RateLimitStore>,
    pub roles: Arc<dyn RoleResolver>,
    /// One session repository per domain.
    pub repositories: HashMap<Domain, Arc<dyn SessionRepository>>,
}

impl Backends {
    /// PostgreSQL for sessions and roles, Redis for the cache and counters.
    pub fn production(pool: deadpool_postgres::Pool, redis: ConnectionManager, limits: SessionLimits) -> Self {
        let cache = Arc::new(RedisCache::new(redis));
        let repositories = Domain::RESOLUTION_ORDER
            .iter()
            .map(|domain| {
                let repo: Arc<dyn SessionRepository> =
                    Arc::new(PgSessionRepository::new(pool.clone(), *domain, limits));
                (*domain, repo)
            })
            .collect();

        Self {
            cache: cache.clone(),
            rate_limits: cache,
            roles: Arc::new(PgRoleResolver::new(pool)),
            repositories,
        }
    }
}

/// The session services of one domain.
#[derive(Clone)]
pub struct DomainServices {
    pub sessions: Arc<SessionService>,
    pub orchestrator: Arc<SessionOrchestrator>,
}

/// The application's state.
#[derive(Clone)]
pub struct AppState {
    pub domains: Arc<HashMap<Domain, DomainServices>>,
    pub gateway: Arc<Gateway>,
    pub rate_limiter: RateLimiter,
    /// Shared secret of the internal endpoints.
    pub internal_api_key: Arc<Zeroizing<String>>,
    pub cors_origins: Arc<Vec<HeaderValue>>,
    pub tasks: BackgroundTasks,
}

impl AppState {
    /// Connects to PostgreSQL and Redis, applies the schema and wires the
    /// services.
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let db = crate::db::create_pool(&config.database_url)?;
        tracing::info!("✅ PostgreSQL Pool initialized with deadpool-postgres");

        crate::db::ensure_schema(&db).await?;
        tracing::info!("✅ Session tables ready");

        let redis_client = redis::Client::open(config.redis_url.as_str())?;
        let redis = ConnectionManager::new(redis_client).await?;
        tracing::info!("✅ Redis Connection Manager initialized");

        let limits = SessionLimits {
            main: config.sessions.main_limit,
            temp: config.sessions.temp_limit,
        };
        Self::with_backends(config, Backends::production(db, redis, limits))
    }

    /// Wires the services over the given storage.
    pub fn with_backends(config: &Config, backends: Backends) -> anyhow::Result<Self> {
        let tasks = BackgroundTasks::new();
        let roles = Arc::new(RoleService::new(
            backends.roles.clone(),
            backends.cache.clone(),
            tasks.clone(),
        ));

        let mut domains = HashMap::new();
        let mut verifiers = Vec::new();
        let mut validators: HashMap<Domain, Arc<dyn SessionValidator>> = HashMap::new();

        for domain in Domain::RESOLUTION_ORDER {
            let jwt = config.jwt_for(domain)?;
            let repo = backends
                .repositories
                .get(&domain)
                .cloned()
                .with_context(|| format!("No session repository for domain {}", domain))?;

            let issuer = TokenIssuer::new(
                domain,
                jwt,
                config.sessions.access_ttl,
                config.sessions.temp_ttl,
            )
            .with_context(|| format!("Invalid signing key for domain {}", domain))?;
            verifiers.push(
                TokenVerifier::new(domain, jwt)
                    .with_context(|| format!("Invalid verification key for domain {}", domain))?,
            );

            let sessions = Arc::new(SessionService::new(
                domain,
                repo.clone(),
                backends.cache.clone(),
                config.sessions.access_ttl.max(config.sessions.temp_ttl),
            ));
            let orchestrator = Arc::new(SessionOrchestrator::new(
                Arc::new(issuer),
                repo,
                backends.cache.clone(),
                roles.clone(),
                tasks.clone(),
                config.sessions.temp_ttl,
                config.sessions.cache_write_timeout,
            ));

            validators.insert(domain, sessions.clone());
            domains.insert(
                domain,
                DomainServices {
                    sessions,
                    orchestrator,
                },
            );
            tracing::info!(%domain, issuer = %jwt.issuer, "✅ Domain services initialized");
        }

        let gateway = Gateway::new(Arc::new(VerifierSet::new(verifiers)), backends.cache.clone(), validators);
        let rate_limiter = RateLimiter::new(backends.rate_limits, "rate_limit", &config.rate_limit);
        let cors_origins = config
            .cors_origins
            .iter()
            .map(|o| HeaderValue::from_str(o).with_context(|| format!("Invalid CORS origin {}", o)))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(AppState {
            domains: Arc::new(domains),
            gateway: Arc::new(gateway),
            rate_limiter,
            internal_api_key: Arc::new(config.internal_api_key.clone()),
            cors_origins: Arc::new(cors_origins),
            tasks,
        })
    }

    /// The services of `domain`.
    pub fn domain(&self, domain: Domain) -> Result<&DomainServices> {
        self.domains.get(&domain).ok_or(AppError::NotFound)
    }
}
