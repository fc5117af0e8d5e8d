use axum::{
    Extension, Json,
    body::Body,
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tower_cookies::{Cookie, Cookies};
use uuid::Uuid;

use crate::{
    domain::Domain,
    error::{AppError, Result},
    middleware_layer::auth::TOKEN_COOKIE,
    models::{
        context::RequestContext,
        session::{Session, SessionKind},
    },
    services::sessions::{SessionValidator, ValidateSessionResponse},
    state::AppState,
    validation::session::{CreateSessionRequest, ValidateSessionRequest, validate},
};

/// Header carrying the shared secret of the internal endpoints.
pub const INTERNAL_KEY_HEADER: &str = "x-internal-key";

/// The response payload for a newly issued session.
#[derive(Serialize, Debug)]
pub struct CreateSessionResponse {
    pub session_id: Uuid,
    pub token: String,
    /// Token lifetime in seconds.
    pub expires_in: u64,
    pub role: String,
    pub session_type: String,
    pub device_id: String,
}

/// A session as shown to its owner. The token never leaves the server.
#[derive(Serialize, Debug)]
pub struct SessionView {
    pub id: Uuid,
    pub device_id: String,
    pub ip_address: String,
    pub user_agent: String,
    pub geo_location: String,
    pub session_type: String,
    pub purpose: String,
    pub is_current: bool,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionView {
    fn new(session: Session, current_token: &str) -> Self {
        Self {
            id: session.id,
            is_current: session.auth_token == current_token,
            session_type: session.kind().as_str().to_string(),
            device_id: session.device_id,
            ip_address: session.ip_address,
            user_agent: session.user_agent,
            geo_location: session.geo_location,
            purpose: session.purpose,
            last_seen_at: session.last_seen_at,
            created_at: session.created_at,
            expires_at: session.expires_at,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct ListSessionsQuery {
    #[serde(default)]
    pub include_temp: bool,
}

#[derive(Serialize, Debug)]
pub struct RevokedResponse {
    pub revoked: usize,
}

/// A middleware that admits only callers presenting the internal API key.
pub async fn require_internal_key(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response> {
    let presented = req
        .headers()
        .get(INTERNAL_KEY_HEADER)
        .map(|v| v.as_bytes())
        .unwrap_or_default();

    if !bool::from(presented.ct_eq(state.internal_api_key.as_bytes())) {
        tracing::warn!(path = %req.uri().path(), "❌ Internal endpoint called without a valid key");
        return Err(AppError::Forbidden);
    }

    Ok(next.run(req).await)
}

/// Issues a session token for a user who has just been authenticated
/// upstream.
pub async fn create_session(
    State(state): State<AppState>,
    Path(domain): Path<Domain>,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse> {
    validate(&payload)?;

    let created = state
        .domain(domain)?
        .orchestrator
        .create_session(payload.into())
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: created.session.id,
            session_type: created.session.kind().as_str().to_string(),
            device_id: created.session.device_id,
            token: created.token,
            expires_in: created.expires_in.as_secs(),
            role: created.role,
        }),
    ))
}

/// Checks a token against the domain's session store.
pub async fn validate_session(
    State(state): State<AppState>,
    Path(domain): Path<Domain>,
    Json(payload): Json<ValidateSessionRequest>,
) -> Result<Json<ValidateSessionResponse>> {
    validate(&payload)?;
    let response = state
        .domain(domain)?
        .sessions
        .validate_session(&payload.token)
        .await?;
    Ok(Json(response))
}

/// Lists the caller's sessions, most recently seen first.
pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<Vec<SessionView>>> {
    let sessions = state
        .domain(ctx.user_type)?
        .sessions
        .list_sessions(&ctx.user_id, query.include_temp)
        .await?;

    Ok(Json(
        sessions
            .into_iter()
            .map(|s| SessionView::new(s, &ctx.token))
            .collect(),
    ))
}

/// Revokes every session of the caller, the current one included.
pub async fn revoke_all_sessions(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Json<RevokedResponse>> {
    let revoked = state
        .domain(ctx.user_type)?
        .sessions
        .delete_all_sessions(&ctx.user_id)
        .await?;
    Ok(Json(RevokedResponse { revoked }))
}

/// Revokes one of the caller's sessions.
pub async fn revoke_session(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode> {
    state
        .domain(ctx.user_type)?
        .sessions
        .delete_session_by_id(&ctx.user_id, session_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Revokes the session of the presented token.
pub async fn logout(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    cookies: Cookies,
) -> Result<Json<RevokedResponse>> {
    let revoked = state
        .domain(ctx.user_type)?
        .sessions
        .revoke_token(
            &ctx.user_id,
            &ctx.device_id,
            ctx.session_type == SessionKind::Temp,
            &ctx.token,
        )
        .await?;

    cookies.remove(Cookie::build(TOKEN_COOKIE).path("/").build());
    tracing::info!(user_id = %ctx.user_id, domain = %ctx.user_type, "👋 User logged out");

    Ok(Json(RevokedResponse { revoked }))
}

/// Echoes what the gateway resolved for the caller.
pub async fn me(Extension(ctx): Extension<RequestContext>) -> Json<RequestContext> {
    Json(ctx)
}
