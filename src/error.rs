use std::time::Duration;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// The application's error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// A database error.
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// A connection pool error.
    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// A Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A token signing error.
    #[error("Token error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// A column was missing or had an unexpected type.
    #[error("Missing data: {0}")]
    MissingData(String),

    /// The presented credential is absent, malformed, expired or signed by an unknown key.
    #[error("Invalid or missing credential")]
    CredentialInvalid,

    /// The credential belongs to a different domain than the requested path.
    #[error("Credential domain does not match the requested resource")]
    DomainMismatch,

    /// No session row exists for the token.
    #[error("Session not found")]
    SessionNotFound,

    /// A single-use session was already consumed.
    #[error("Session has already been used")]
    SessionUsed,

    /// The session store rejected the session.
    #[error("Session validation failed: {0}")]
    SessionValidationFailed(String),

    /// The session type, purpose or role is not allowed on this route.
    #[error("Access denied: {0}")]
    ScopeDenied(String),

    /// The caller exceeded its request budget.
    #[error("Rate limit exceeded")]
    RateLimited {
        /// How long until the caller may retry.
        retry_after: Duration,
    },

    /// An authorization error.
    #[error("Authorization failed")]
    Forbidden,

    /// A resource not found error.
    #[error("Resource not found")]
    NotFound,

    /// A validation error.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An internal server error.
    #[error("Internal server error: {0}")]
    Internal(String),
}

/// A `Result` type that uses `AppError` as the error type.
pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// The HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::CredentialInvalid
            | AppError::SessionNotFound
            | AppError::SessionUsed
            | AppError::SessionValidationFailed(_) => StatusCode::UNAUTHORIZED,
            AppError::DomainMismatch | AppError::ScopeDenied(_) | AppError::Forbidden => {
                StatusCode::FORBIDDEN
            }
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Database(_)
            | AppError::Pool(_)
            | AppError::Redis(_)
            | AppError::Jwt(_)
            | AppError::MissingData(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            AppError::Database(ref e) => {
                tracing::error!("Database error: {}", e);
                "Database error".to_string()
            }

            AppError::Pool(ref e) => {
                tracing::error!("Pool error: {}", e);
                "Database error".to_string()
            }

            AppError::Redis(ref e) => {
                tracing::error!("Redis error: {}", e);
                "Cache error".to_string()
            }

            AppError::Jwt(ref e) => {
                tracing::error!("Token error: {}", e);
                "Token error".to_string()
            }

            AppError::MissingData(ref column) => {
                tracing::error!("Missing data in column: {}", column);
                "Internal server error".to_string()
            }

            AppError::CredentialInvalid
            | AppError::DomainMismatch
            | AppError::SessionNotFound
            | AppError::SessionUsed => {
                tracing::warn!("Authentication rejected: {}", self);
                self.to_string()
            }

            AppError::SessionValidationFailed(ref msg) => {
                tracing::warn!("Session validation failed: {}", msg);
                self.to_string()
            }

            AppError::ScopeDenied(ref msg) => {
                tracing::warn!("Scope denied: {}", msg);
                self.to_string()
            }

            AppError::RateLimited { retry_after } => {
                tracing::warn!("Rate limit exceeded, retry in {}s", retry_after.as_secs());
                self.to_string()
            }

            AppError::Forbidden => {
                tracing::warn!("Authorization failed");
                "Forbidden".to_string()
            }

            AppError::NotFound => {
                tracing::debug!("Resource not found");
                "Resource not found".to_string()
            }

            AppError::Validation(ref msg) => {
                tracing::debug!("Validation error: {}", msg);
                msg.clone()
            }

            AppError::Internal(ref msg) => {
                tracing::error!("Internal error: {}", msg);
                "Internal server error".to_string()
            }
        };

        let body = sonic_rs::to_string(&sonic_rs::json!({
            "error": message,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
        .unwrap_or_else(|_| r#"{"error":"Internal server error"}"#.to_string());

        let mut response = (status, [(header::CONTENT_TYPE, "application/json")], body).into_response();

        if let AppError::RateLimited { retry_after } = self {
            let secs = retry_after.as_secs().max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}
