use serde::{Deserialize, Serialize};

use crate::auth::repo_types::User;

/// Body of `POST /api/auth/magic-link`.
#[derive(Debug, Deserialize)]
pub struct MagicLinkRequest {
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MagicLinkResponse {
    pub success: bool,
    // Only filled in when the dev token is exposed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub magic_link: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// User record merged with the freshly issued bearer token.
#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    #[serde(flatten)]
    pub user: User,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct TokenValidity {
    pub valid: bool,
}
