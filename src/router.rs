use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{delete, get, post},
};
use http::{Method, header};
use std::time::Duration;
use tower_cookies::CookieManagerLayer;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::{
    domain::Domain,
    handlers::sessions,
    middleware_layer::{
        auth::{AuthGate, AuthPolicy, require_auth},
        rate_limit::rate_limit,
    },
    state::AppState,
};

/// Assembles every route of the service.
pub fn build(state: AppState) -> Router {
    let internal_routes = Router::new()
        .route("/internal/{domain}/sessions", post(sessions::create_session))
        .route(
            "/internal/{domain}/sessions/validate",
            post(sessions::validate_session),
        )
        .route_layer(from_fn_with_state(
            state.clone(),
            sessions::require_internal_key,
        ))
        .with_state(state.clone());

    let mut app = Router::new().merge(internal_routes);

    for domain in Domain::RESOLUTION_ORDER {
        app = app.merge(domain_routes(domain, &state));
    }

    let cors = CorsLayer::new()
        .allow_origin(state.cors_origins.as_ref().clone())
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT, header::COOKIE])
        .allow_credentials(true)
        .expose_headers([
            header::RETRY_AFTER,
            header::HeaderName::from_static("x-ratelimit-limit"),
            header::HeaderName::from_static("x-ratelimit-remaining"),
            header::HeaderName::from_static("x-ratelimit-reset"),
        ])
        .max_age(Duration::from_secs(86400));

    // The limiter runs ahead of the gateway, so requests reaching it carry
    // no `RequestContext` and are keyed by client address. A user key only
    // applies when an enclosing service authenticates first.
    app.layer(from_fn_with_state(state.rate_limiter.clone(), rate_limit))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false))
                .on_request(DefaultOnRequest::default().level(Level::DEBUG))
                .on_response(DefaultOnResponse::default().level(Level::DEBUG))
                .on_failure(DefaultOnFailure::default().level(Level::ERROR)),
        )
        .layer(CookieManagerLayer::new())
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(cors)
}

/// Session management routes of one domain, under `/{domain}/`.
fn domain_routes(domain: Domain, state: &AppState) -> Router {
    let prefix = format!("/{}", domain);

    let main_only = AuthGate::new(state.gateway.clone(), AuthPolicy::main_only());
    let any_session = AuthGate::new(state.gateway.clone(), AuthPolicy::any());

    let account_routes = Router::new()
        .route(
            &format!("{}/sessions", prefix),
            get(sessions::list_sessions).delete(sessions::revoke_all_sessions),
        )
        .route(
            &format!("{}/sessions/{{session_id}}", prefix),
            delete(sessions::revoke_session),
        )
        .route_layer(from_fn_with_state(main_only, require_auth))
        .with_state(state.clone());

    let session_routes = Router::new()
        .route(&format!("{}/logout", prefix), post(sessions::logout))
        .route(&format!("{}/me", prefix), get(sessions::me))
        .route_layer(from_fn_with_state(any_session, require_auth))
        .with_state(state.clone());

    account_routes.merge(session_routes)
}
