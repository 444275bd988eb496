use anyhow::anyhow;
use axum::{async_trait, extract::FromRequestParts};
use http::request::Parts;
use tower_cookies::Cookies;

use crate::{error::AppError, ServerState};

use super::{session::Session, token_store::CookieTokenStore, token_store::TokenStore};

/// A session loaded from the request cookies and made valid, refreshing it
/// (and rewriting the cookies) when the access token has expired.
pub struct AuthedSession {
    pub session: Session,
    pub store: CookieTokenStore,
}

#[async_trait]
impl FromRequestParts<ServerState> for AuthedSession {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ServerState,
    ) -> Result<Self, Self::Rejection> {
        let cookies = Cookies::from_request_parts(parts, state)
            .await
            .map_err(|(_, msg)| AppError::Internal(anyhow!(msg)))?;
        let store = CookieTokenStore::new(
            cookies,
            state.cookie_key.clone(),
            state.cookie_policy.clone(),
        );

        let session = store
            .load()
            .ok_or_else(|| AppError::Unauthorized("Missing session".to_string()))?;
        let session = state.session_manager.ensure_valid(session, &store).await?;

        Ok(Self { session, store })
    }
}
