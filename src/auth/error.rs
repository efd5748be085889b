use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

/// Every way an auth operation can be refused.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Email is required")]
    MissingEmail,
    #[error("Invalid email")]
    InvalidEmail,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token expired")]
    TokenExpired,
    #[error("No token provided")]
    MissingAuthHeader,
    #[error("Invalid or expired token")]
    TokenInvalidOrExpired,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingEmail
            | AuthError::InvalidEmail
            | AuthError::InvalidToken
            | AuthError::TokenExpired => StatusCode::BAD_REQUEST,
            AuthError::MissingAuthHeader | AuthError::TokenInvalidOrExpired => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AuthError::Internal(e) => {
                error!(error = ?e, "internal auth error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
