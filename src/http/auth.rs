use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use super::state::AppState;
use crate::error::AppError;
use crate::models::User;

/// The verified caller. Seeing a user for the first time creates their row.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

impl AuthUser {
    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub async fn from_headers(headers: &HeaderMap, state: &AppState) -> Result<Self, AppError> {
        let header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
        let identity = state.verifier.verify_header(header)?;
        let user = state
            .db
            .upsert_user(&identity.user_id, identity.email.as_deref(), identity.name.as_deref())
            .await
            .map_err(AppError::Persistence)?;
        Ok(Self(user))
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        Self::from_headers(&parts.headers, state).await
    }
}
