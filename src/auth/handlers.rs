use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    routing::{get, post},
    Json, Router,
};
use tracing::{instrument, warn};

use crate::{
    auth::{
        dto::{MagicLinkRequest, MagicLinkResponse, TokenValidity, VerifyQuery, VerifyResponse},
        error::AuthError,
        extractors::BearerToken,
        repo_types::User,
    },
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/magic-link", post(request_magic_link))
        .route("/auth/verify", get(verify_magic_link))
        .route("/auth/verify-token", post(verify_token))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/auth/me", get(get_me))
}

#[instrument(skip(state, payload))]
pub async fn request_magic_link(
    State(state): State<AppState>,
    payload: Result<Json<MagicLinkRequest>, JsonRejection>,
) -> Result<Json<MagicLinkResponse>, AuthError> {
    // Unreadable bodies count as a missing email so the error stays JSON.
    let Json(payload) = payload.map_err(|e| {
        warn!(error = %e, "magic link body rejected");
        AuthError::MissingEmail
    })?;
    let email = payload.email.unwrap_or_default();
    let issued = state.auth.request_magic_link(&email).await?;

    let response = if state.config.magic_link.expose_dev_token {
        MagicLinkResponse {
            success: true,
            token: Some(issued.token),
            magic_link: Some(issued.url),
        }
    } else {
        MagicLinkResponse {
            success: true,
            token: None,
            magic_link: None,
        }
    };
    Ok(Json(response))
}

#[instrument(skip(state, query))]
pub async fn verify_magic_link(
    State(state): State<AppState>,
    query: Result<Query<VerifyQuery>, QueryRejection>,
) -> Result<Json<VerifyResponse>, AuthError> {
    let Query(query) = query.map_err(|e| {
        warn!(error = %e, "verify query rejected");
        AuthError::InvalidToken
    })?;
    let token = query
        .token
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::InvalidToken)?;
    let redeemed = state.auth.redeem_magic_link(&token).await?;
    Ok(Json(VerifyResponse {
        user: redeemed.user,
        token: redeemed.bearer_token,
    }))
}

#[instrument(skip(state, token))]
pub async fn verify_token(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
) -> Result<Json<TokenValidity>, AuthError> {
    if state.auth.validate_bearer_token(&token) {
        Ok(Json(TokenValidity { valid: true }))
    } else {
        Err(AuthError::TokenInvalidOrExpired)
    }
}

#[instrument(skip(state, token))]
pub async fn get_me(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
) -> Result<Json<User>, AuthError> {
    Ok(Json(state.auth.current_user(&token).await?))
}
