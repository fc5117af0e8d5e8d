use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{
    cache::RateLimitStore,
    config::RateLimitConfig,
    error::{AppError, Result},
    models::context::RequestContext,
};

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed {
        limit: u64,
        remaining: u64,
        /// Time until the current window closes.
        reset_after: Duration,
    },
    Blocked {
        retry_after: Duration,
    },
}

/// Fixed-window counter with a lockout once the window's budget is spent.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    prefix: String,
    limit: u64,
    window: Duration,
    block: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, prefix: impl Into<String>, config: &RateLimitConfig) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            limit: config.limit,
            window: config.window,
            block: config.block,
        }
    }

    /// Counts one request from `client`.
    pub async fn check(&self, client: &str) -> Result<Decision> {
        let key = format!("{}:{}", self.prefix, client);

        if let Some(remaining) = self.store.blocked_for(&key).await? {
            return Ok(Decision::Blocked {
                retry_after: remaining,
            });
        }

        let (count, reset_after) = self.store.increment(&key, self.window).await?;
        if count > self.limit {
            self.store.block(&key, self.block).await?;
            tracing::warn!(client, count, limit = self.limit, "🚫 Rate limit exceeded, blocking client");
            return Ok(Decision::Blocked {
                retry_after: self.block,
            });
        }

        Ok(Decision::Allowed {
            limit: self.limit,
            remaining: self.limit - count,
            reset_after,
        })
    }
}

/// Identifies the caller: the authenticated user when an earlier layer has
/// already attached a [`RequestContext`], otherwise the client address.
pub fn client_id(req: &Request<Body>) -> String {
    if let Some(ctx) = req.extensions().get::<RequestContext>() {
        return format!("uid:{}", ctx.user_id);
    }
    format!("ip:{}", extract_real_ip(req))
}

/// Extracts the real IP address from proxy headers or the peer address.
fn extract_real_ip(req: &Request<Body>) -> String {
    let headers = req.headers();
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
    };

    forwarded
        .or_else(real_ip)
        .map(str::to_string)
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: u64) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(name, value);
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A middleware that applies the limiter to every request it wraps.
/// Store failures let the request through.
pub async fn rate_limit(State(limiter): State<RateLimiter>, req: Request<Body>, next: Next) -> Response {
    let client = client_id(&req);

    match limiter.check(&client).await {
        Ok(Decision::Allowed {
            limit,
            remaining,
            reset_after,
        }) => {
            let mut response = next.run(req).await;
            let headers = response.headers_mut();
            set_header(headers, "x-ratelimit-limit", limit);
            set_header(headers, "x-ratelimit-remaining", remaining);
            set_header(headers, "x-ratelimit-reset", unix_now() + reset_after.as_secs());
            response
        }
        Ok(Decision::Blocked { retry_after }) => {
            let mut response = AppError::RateLimited { retry_after }.into_response();
            let headers = response.headers_mut();
            set_header(headers, "x-ratelimit-limit", limiter.limit);
            set_header(headers, "x-ratelimit-remaining", 0);
            response
        }
        Err(e) => {
            tracing::warn!(client = %client, "⚠️ Rate limit store unavailable, allowing request: {}", e);
            next.run(req).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::domain::Domain;
    use crate::models::session::SessionKind;
    use async_trait::async_trait;
    use axum::{Router, http::StatusCode, middleware::from_fn_with_state, routing::get};
    use std::collections::BTreeMap;
    use tower::ServiceExt;

    fn limiter(store: Arc<dyn RateLimitStore>) -> RateLimiter {
        RateLimiter::new(
            store,
            "api",
            &RateLimitConfig {
                limit: 5,
                window: Duration::from_secs(60),
                block: Duration::from_secs(600),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_request_is_blocked_for_the_full_lockout() {
        let limiter = limiter(Arc::new(MemoryCache::new()));

        for expected_remaining in (0..5).rev() {
            match limiter.check("ip:1.2.3.4").await.unwrap() {
                Decision::Allowed { remaining, .. } => assert_eq!(remaining, expected_remaining),
                other => panic!("unexpected {:?}", other),
            }
        }

        assert_eq!(
            limiter.check("ip:1.2.3.4").await.unwrap(),
            Decision::Blocked {
                retry_after: Duration::from_secs(600)
            }
        );

        // The window has long rolled over, the lockout has not.
        tokio::time::advance(Duration::from_secs(599)).await;
        assert!(matches!(
            limiter.check("ip:1.2.3.4").await.unwrap(),
            Decision::Blocked { .. }
        ));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(
            limiter.check("ip:1.2.3.4").await.unwrap(),
            Decision::Allowed { remaining: 4, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn clients_are_counted_separately() {
        let limiter = limiter(Arc::new(MemoryCache::new()));
        for _ in 0..6 {
            limiter.check("ip:a").await.unwrap();
        }
        assert!(matches!(
            limiter.check("ip:b").await.unwrap(),
            Decision::Allowed { remaining: 4, .. }
        ));
    }

    struct DownStore;

    #[async_trait]
    impl RateLimitStore for DownStore {
        async fn blocked_for(&self, _: &str) -> Result<Option<Duration>> {
            Err(AppError::Internal("redis down".into()))
        }
        async fn increment(&self, _: &str, _: Duration) -> Result<(u64, Duration)> {
            Err(AppError::Internal("redis down".into()))
        }
        async fn block(&self, _: &str, _: Duration) -> Result<()> {
            Err(AppError::Internal("redis down".into()))
        }
    }

    fn app(limiter: RateLimiter) -> Router {
        Router::new()
            .route("/ping", get(|| async { "pong" }))
            .route_layer(from_fn_with_state(limiter, rate_limit))
    }

    fn ping(ip: &str) -> Request<Body> {
        Request::builder()
            .uri("/ping")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let response = app(limiter(Arc::new(DownStore))).oneshot(ping("9.9.9.9")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_responses_carry_retry_after() {
        let app = app(limiter(Arc::new(MemoryCache::new())));

        let first = app.clone().oneshot(ping("5.5.5.5")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["x-ratelimit-limit"], "5");
        assert_eq!(first.headers()["x-ratelimit-remaining"], "4");
        assert!(first.headers().contains_key("x-ratelimit-reset"));

        for _ in 0..5 {
            app.clone().oneshot(ping("5.5.5.5")).await.unwrap();
        }
        let blocked = app.oneshot(ping("5.5.5.5")).await.unwrap();
        assert_eq!(blocked.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(blocked.headers()["retry-after"], "600");
    }

    fn context(user_id: &str) -> RequestContext {
        RequestContext {
            user_id: user_id.into(),
            token: String::new(),
            device_id: "d".into(),
            role: "any".into(),
            user_type: Domain::User,
            session_type: SessionKind::Main,
            session_purpose: String::new(),
            extra_data: BTreeMap::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn user_budget_follows_the_user_across_addresses() {
        async fn authenticated(mut req: Request<Body>, next: Next) -> Response {
            req.extensions_mut().insert(context("42"));
            next.run(req).await
        }

        let app = app(limiter(Arc::new(MemoryCache::new())))
            .layer(axum::middleware::from_fn(authenticated));

        let first = app.clone().oneshot(ping("1.1.1.1")).await.unwrap();
        let second = app.oneshot(ping("2.2.2.2")).await.unwrap();
        assert_eq!(first.headers()["x-ratelimit-remaining"], "4");
        assert_eq!(second.headers()["x-ratelimit-remaining"], "3");
    }

    #[test]
    fn authenticated_callers_are_keyed_by_user() {
        let mut req = Request::builder()
            .uri("/")
            .header("x-real-ip", "7.7.7.7")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_id(&req), "ip:7.7.7.7");

        req.extensions_mut().insert(context("42"));
        assert_eq!(client_id(&req), "uid:42");
    }

    #[test]
    fn forwarded_for_uses_the_first_hop() {
        let req = Request::builder()
            .uri("/")
            .header("x-forwarded-for", "1.1.1.1, 10.0.0.1")
            .header("x-real-ip", "2.2.2.2")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_id(&req), "ip:1.1.1.1");
    }
}
