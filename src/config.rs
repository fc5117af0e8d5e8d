use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use zeroize::{Zeroize, Zeroizing};

use crate::domain::Domain;

/// Signing material for one domain.
#[derive(Clone)]
pub enum KeyMaterial {
    /// Shared HMAC secret (HS256).
    Hmac(Zeroizing<Vec<u8>>),
    /// Ed25519 key pair in PEM form (EdDSA).
    Ed25519 {
        private_pem: Zeroizing<Vec<u8>>,
        public_pem: Vec<u8>,
    },
}

/// Token settings for one domain.
#[derive(Clone)]
pub struct JwtConfig {
    pub keys: KeyMaterial,
    pub issuer: String,
    pub audience: String,
}

/// Session limits and lifetimes.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Maximum active main sessions per user.
    pub main_limit: usize,
    /// Maximum active temp sessions per user.
    pub temp_limit: usize,
    /// Lifetime of temp sessions and their tokens.
    pub temp_ttl: Duration,
    /// Lifetime of main-session tokens.
    pub access_ttl: Duration,
    /// Shared deadline for the background cache writes of one issuance.
    pub cache_write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            main_limit: 3,
            temp_limit: 5,
            temp_ttl: Duration::from_secs(900),
            access_ttl: Duration::from_secs(86400),
            cache_write_timeout: Duration::from_secs(3),
        }
    }
}

/// Fixed-window rate limit settings.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub limit: u64,
    pub window: Duration,
    pub block: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            window: Duration::from_secs(60),
            block: Duration::from_secs(600),
        }
    }
}

/// The application's configuration.
#[derive(Clone)]
pub struct Config {
    /// The URL of the PostgreSQL database.
    pub database_url: String,
    /// The URL of the Redis server.
    pub redis_url: String,
    /// The address the HTTP server binds to.
    pub bind_addr: SocketAddr,
    /// Shared secret required on the internal session endpoints.
    pub internal_api_key: Zeroizing<String>,
    pub sessions: SessionConfig,
    pub rate_limit: RateLimitConfig,
    /// Browser origins allowed to call the public routes.
    pub cors_origins: Vec<String>,
    /// Token settings, one entry per domain.
    pub jwt: HashMap<Domain, JwtConfig>,
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}

fn secs_or(name: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_secs(env_or(name, default)?))
}

impl JwtConfig {
    /// HS256 settings from a raw secret.
    pub fn hmac(secret: &[u8], issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            keys: KeyMaterial::Hmac(Zeroizing::new(secret.to_vec())),
            issuer: issuer.into(),
            audience: audience.into(),
        }
    }

    /// Loads `{PREFIX}_JWT_*` variables for `domain`.
    ///
    /// `{PREFIX}_JWT_SECRET` (hex) selects HS256; otherwise
    /// `{PREFIX}_JWT_PRIVATE_KEY_PATH` and `{PREFIX}_JWT_PUBLIC_KEY_PATH`
    /// must point at an Ed25519 key pair.
    pub fn from_env(domain: Domain) -> Result<Self> {
        let prefix = domain.env_prefix();

        let keys = match env::var(format!("{}_JWT_SECRET", prefix)) {
            Ok(mut secret_hex) => {
                let secret = hex::decode(&secret_hex)
                    .with_context(|| format!("{}_JWT_SECRET must be valid hexadecimal", prefix))?;
                secret_hex.zeroize();

                if secret.len() < 32 {
                    anyhow::bail!("{}_JWT_SECRET must be at least 32 bytes", prefix);
                }
                KeyMaterial::Hmac(Zeroizing::new(secret))
            }
            Err(_) => {
                let private_path = env::var(format!("{}_JWT_PRIVATE_KEY_PATH", prefix))
                    .with_context(|| {
                        format!("{0}_JWT_SECRET or {0}_JWT_PRIVATE_KEY_PATH must be set", prefix)
                    })?;
                let public_path = env::var(format!("{}_JWT_PUBLIC_KEY_PATH", prefix))
                    .with_context(|| format!("{}_JWT_PUBLIC_KEY_PATH must be set", prefix))?;

                KeyMaterial::Ed25519 {
                    private_pem: Zeroizing::new(
                        std::fs::read(&private_path)
                            .with_context(|| format!("Cannot read {}", private_path))?,
                    ),
                    public_pem: std::fs::read(&public_path)
                        .with_context(|| format!("Cannot read {}", public_path))?,
                }
            }
        };

        Ok(Self {
            keys,
            issuer: env::var(format!("{}_JWT_ISSUER", prefix))
                .unwrap_or_else(|_| format!("{}-auth", domain)),
            audience: env::var(format!("{}_JWT_AUDIENCE", prefix))
                .unwrap_or_else(|_| format!("{}-api", domain)),
        })
    }
}

impl Config {
    /// Creates a new `Config` from environment variables.
    pub fn from_env() -> Result<Self> {
        let mut jwt = HashMap::new();
        for domain in Domain::RESOLUTION_ORDER {
            jwt.insert(domain, JwtConfig::from_env(domain)?);
        }

        let internal_api_key = env::var("INTERNAL_API_KEY")
            .context("INTERNAL_API_KEY must be set")?;
        if internal_api_key.len() < 16 {
            anyhow::bail!("INTERNAL_API_KEY must be at least 16 characters");
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .context("DATABASE_URL must be set")?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            bind_addr: env_or("BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 3000)))?,
            internal_api_key: Zeroizing::new(internal_api_key),
            sessions: SessionConfig {
                main_limit: env_or("SESSION_MAIN_LIMIT", 3)?,
                temp_limit: env_or("SESSION_TEMP_LIMIT", 5)?,
                temp_ttl: secs_or("SESSION_TEMP_TTL_SECS", 900)?,
                access_ttl: secs_or("ACCESS_TOKEN_TTL_SECS", 86400)?,
                cache_write_timeout: Duration::from_millis(env_or("CACHE_WRITE_TIMEOUT_MS", 3000)?),
            },
            rate_limit: RateLimitConfig {
                limit: env_or("RATE_LIMIT_REQUESTS", 100)?,
                window: secs_or("RATE_LIMIT_WINDOW_SECS", 60)?,
                block: secs_or("RATE_LIMIT_BLOCK_SECS", 600)?,
            },
            cors_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000".to_string())
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect(),
            jwt,
        })
    }

    /// Token settings for `domain`.
    pub fn jwt_for(&self, domain: Domain) -> Result<&JwtConfig> {
        self.jwt
            .get(&domain)
            .with_context(|| format!("No token settings for domain {}", domain))
    }
}
