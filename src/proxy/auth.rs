use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use std::sync::Arc;

use super::AppState;
use super::error::ApiError;

/// Header carrying the caller's API key.
pub const API_KEY_HEADER: &str = "api-key";

/// A validated API key and the user it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKey {
    pub key: String,
    pub user: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for ApiKey {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::MissingApiKey)?;

        let user = state.api_keys.user(key).ok_or(ApiError::InvalidApiKey)?;

        Ok(ApiKey {
            key: key.to_string(),
            user: user.to_string(),
        })
    }
}
