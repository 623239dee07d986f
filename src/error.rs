use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Outcome of a failed authentication step.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Wrong email or password. Deliberately says nothing about which.
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("identity provider failure: {0}")]
    ProviderFailure(String),

    /// Advisory cache could not be reached. Never leaves the cache layer as
    /// a user-facing error.
    #[error("session cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("session expired or absent")]
    SessionExpiredOrAbsent,

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Error envelope returned by HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("{message}")]
    Validation { message: String, code: &'static str },

    #[error("Resource not found")]
    NotFound,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation(message: impl Into<String>, code: &'static str) -> Self {
        Self::Validation {
            message: message.into(),
            code,
        }
    }

    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Auth(auth) => match auth {
                AuthError::InvalidCredentials => (
                    StatusCode::UNAUTHORIZED,
                    "INVALID_CREDENTIALS",
                    "Invalid credentials".into(),
                ),
                AuthError::ProviderFailure(detail) => {
                    tracing::warn!(error = %detail, "provider sign-in failed");
                    (
                        StatusCode::UNAUTHORIZED,
                        "SIGN_IN_FAILED",
                        "Sign-in failed".into(),
                    )
                }
                AuthError::SessionExpiredOrAbsent => (
                    StatusCode::UNAUTHORIZED,
                    "AUTH_REQUIRED",
                    "Authentication required".into(),
                ),
                AuthError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                }
                AuthError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
                AuthError::CacheUnavailable(detail) => {
                    // Should have been swallowed by the cache layer already.
                    tracing::error!(error = %detail, "cache error reached the HTTP boundary");
                    internal()
                }
                AuthError::Internal(e) => {
                    tracing::error!(error = %e, "internal auth error");
                    internal()
                }
            },
            AppError::Validation { message, code } => {
                (StatusCode::BAD_REQUEST, *code, message.clone())
            }
            AppError::NotFound => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                "Resource not found".into(),
            ),
            AppError::Internal(e) => {
                tracing::error!(error = %e, "unhandled route error");
                internal()
            }
        }
    }
}

fn internal() -> (StatusCode, &'static str, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "Internal server error".into(),
    )
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_credentials_maps_to_401() {
        let (status, code, message) = AppError::from(AuthError::InvalidCredentials).parts();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(code, "INVALID_CREDENTIALS");
        assert_eq!(message, "Invalid credentials");
    }

    #[test]
    fn internal_errors_hide_details() {
        let err = AppError::from(anyhow::anyhow!("connection refused to 10.0.0.3"));
        let (status, _, message) = err.parts();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!message.contains("10.0.0.3"));
    }

    #[test]
    fn provider_failure_is_generic() {
        let err = AppError::from(AuthError::ProviderFailure("token exchange: 400".into()));
        let (_, code, message) = err.parts();
        assert_eq!(code, "SIGN_IN_FAILED");
        assert!(!message.contains("400"));
    }
}
