use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, Request, Uri, header},
    middleware::Next,
    response::Response,
};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tower_cookies::Cookies;

use crate::{
    cache::{self, Cache},
    crypto::jwt::VerifierSet,
    domain::Domain,
    error::{AppError, Result},
    models::{
        claims::Claims,
        context::RequestContext,
        session::{Session, SessionKind},
    },
    services::sessions::{SessionValidator, is_revoked},
};

/// Cookie carrying the session token.
pub const TOKEN_COOKIE: &str = "token";

/// Which sessions may reach a route. An empty list allows everything.
#[derive(Debug, Clone, Default)]
pub struct AuthPolicy {
    pub session_types: Vec<SessionKind>,
    pub purposes: Vec<String>,
    pub roles: Vec<String>,
}

impl AuthPolicy {
    /// Any live session.
    pub fn any() -> Self {
        Self::default()
    }

    /// Long-lived sessions only.
    pub fn main_only() -> Self {
        Self::default().session_types([SessionKind::Main])
    }

    pub fn session_types(mut self, kinds: impl IntoIterator<Item = SessionKind>) -> Self {
        self.session_types = kinds.into_iter().collect();
        self
    }

    pub fn purposes<S: Into<String>>(mut self, purposes: impl IntoIterator<Item = S>) -> Self {
        self.purposes = purposes.into_iter().map(Into::into).collect();
        self
    }

    pub fn roles<S: Into<String>>(mut self, roles: impl IntoIterator<Item = S>) -> Self {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    fn check(&self, kind: SessionKind, purpose: &str, role: &str) -> Result<()> {
        if !self.session_types.is_empty() && !self.session_types.contains(&kind) {
            return Err(AppError::ScopeDenied(format!(
                "{} sessions are not allowed here",
                kind.as_str()
            )));
        }
        if !self.purposes.is_empty() && !self.purposes.iter().any(|p| p == purpose) {
            return Err(AppError::ScopeDenied(format!(
                "session purpose '{}' is not allowed here",
                purpose
            )));
        }
        if !self.roles.is_empty() && !self.roles.iter().any(|r| r == role) {
            return Err(AppError::ScopeDenied(format!("role '{}' is not allowed here", role)));
        }
        Ok(())
    }
}

/// Authenticates requests against every domain's keys and session store.
pub struct Gateway {
    verifiers: Arc<VerifierSet>,
    cache: Arc<dyn Cache>,
    validators: HashMap<Domain, Arc<dyn SessionValidator>>,
}

impl Gateway {
    pub fn new(
        verifiers: Arc<VerifierSet>,
        cache: Arc<dyn Cache>,
        validators: HashMap<Domain, Arc<dyn SessionValidator>>,
    ) -> Self {
        Self {
            verifiers,
            cache,
            validators,
        }
    }

    /// Runs the full check for a request to `path`. The first failing
    /// step ends the pass.
    pub async fn authenticate(
        &self,
        token: Option<&str>,
        path: &str,
        policy: &AuthPolicy,
        existing: Option<&RequestContext>,
    ) -> Result<RequestContext> {
        let token = token.filter(|t| !t.is_empty()).ok_or_else(|| {
            tracing::warn!(path, "❌ No credential presented");
            AppError::CredentialInvalid
        })?;

        let (domain, claims) = self.verifiers.resolve(token).ok_or_else(|| {
            tracing::warn!(path, "❌ Token did not verify for any domain");
            AppError::CredentialInvalid
        })?;

        let expected = Domain::from_path(path);
        if domain != expected {
            tracing::warn!(
                path,
                token_domain = %domain,
                expected = %expected,
                user_id = %claims.user_id,
                "❌ Token used outside its domain"
            );
            return Err(AppError::DomainMismatch);
        }

        let (session_type, purpose) = self.check_liveness(domain, token, &claims).await?;

        let role = existing
            .map(|ctx| ctx.role.as_str())
            .filter(|r| !r.is_empty())
            .unwrap_or(claims.role.as_str())
            .to_string();
        policy.check(session_type, &purpose, &role)?;

        tracing::debug!(domain = %domain, user_id = %claims.user_id, "✅ Request authenticated");

        Ok(RequestContext {
            user_id: claims.user_id,
            token: token.to_string(),
            device_id: claims.device,
            role,
            user_type: domain,
            session_type,
            session_purpose: purpose,
            extra_data: claims.extra_data,
        })
    }

    /// Confirms the session behind `token` is live, through the cache when
    /// possible.
    async fn check_liveness(
        &self,
        domain: Domain,
        token: &str,
        claims: &Claims,
    ) -> Result<(SessionKind, String)> {
        let key = cache::session_token_key(&claims.user_id, &claims.device);
        match self.cache.get(cache::SESSION_TOKENS, &key).await {
            Ok(Some(cached)) if bool::from(cached.as_bytes().ct_eq(token.as_bytes())) => {
                let session_id = Session::stable_id(domain, &claims.user_id, &claims.device, claims.is_temp);
                if is_revoked(self.cache.as_ref(), session_id, token).await {
                    tracing::warn!(user_id = %claims.user_id, %session_id, "❌ Cached token was revoked");
                    return Err(AppError::SessionNotFound);
                }
                tracing::debug!(user_id = %claims.user_id, "⚡ Session cache hit");
                return Ok((claims.session_kind(), claims.session_purpose.clone()));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(user_id = %claims.user_id, "⚠️ Session cache read failed: {}", e),
        }

        let validator = self.validators.get(&domain).ok_or_else(|| {
            AppError::SessionValidationFailed(format!("no session store for domain {}", domain))
        })?;

        let response = validator.validate_session(token).await.map_err(|e| match e {
            AppError::SessionNotFound => AppError::SessionNotFound,
            AppError::SessionUsed => AppError::SessionUsed,
            other => {
                tracing::error!(%domain, "❌ Session store unavailable: {}", other);
                AppError::SessionValidationFailed("session store unavailable".to_string())
            }
        })?;

        if !response.valid {
            return Err(AppError::SessionValidationFailed(
                response.error.unwrap_or_else(|| "session is not valid".to_string()),
            ));
        }

        let kind = SessionKind::parse(&response.session_type).unwrap_or(claims.session_kind());
        let purpose = if response.purpose.is_empty() {
            claims.session_purpose.clone()
        } else {
            response.purpose
        };
        Ok((kind, purpose))
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Bearer header first, then the `token` cookie, then the `token` query
/// parameter.
pub fn extract_token(headers: &HeaderMap, cookie: Option<String>, uri: &Uri) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    bearer
        .or_else(|| cookie.filter(|c| !c.is_empty()))
        .or_else(|| {
            Query::<TokenQuery>::try_from_uri(uri)
                .ok()?
                .0
                .token
                .filter(|t| !t.is_empty())
        })
}

/// Middleware state: the shared gateway plus the policy of the routes it
/// guards.
#[derive(Clone)]
pub struct AuthGate {
    pub gateway: Arc<Gateway>,
    pub policy: AuthPolicy,
}

impl AuthGate {
    pub fn new(gateway: Arc<Gateway>, policy: AuthPolicy) -> Self {
        Self { gateway, policy }
    }
}

/// A middleware that requires a live session from the path's domain.
pub async fn require_auth(
    State(gate): State<AuthGate>,
    cookies: Cookies,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response> {
    tracing::debug!("🔐 Checking authentication...");

    let token = extract_token(
        request.headers(),
        cookies.get(TOKEN_COOKIE).map(|c| c.value().to_string()),
        request.uri(),
    );
    let existing = request.extensions().get::<RequestContext>().cloned();

    let context = gate
        .gateway
        .authenticate(
            token.as_deref(),
            request.uri().path(),
            &gate.policy,
            existing.as_ref(),
        )
        .await?;

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}
