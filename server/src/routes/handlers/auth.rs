use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_cookies::Cookies;
use url::Url;

use crate::{
    auth::{
        session_store::OAuthState, AuthedSession, CookieTokenStore, Identity,
        TokenStore,
    },
    error::{AppJsonResult, AppResult},
    server_config::FrontendConfig,
    ServerState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthOptions {
    /// Frontend path to land on after sign-in
    pub return_to: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub error: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub identity: Identity,
    pub expires_at: DateTime<Utc>,
}

fn cookie_store(state: &ServerState, cookies: Cookies) -> CookieTokenStore {
    CookieTokenStore::new(
        cookies,
        state.cookie_key.clone(),
        state.cookie_policy.clone(),
    )
}

fn redirect_to_sign_in(frontend: &FrontendConfig, error: &str) -> Redirect {
    let mut url = frontend.get_signin_url();
    url.query_pairs_mut().append_pair("error", error);
    Redirect::to(url.as_str())
}

/// Only paths on the frontend are accepted, never another origin.
fn landing_url(frontend: &FrontendConfig, return_to: Option<&str>) -> Url {
    return_to
        .filter(|path| path.starts_with('/'))
        .and_then(|path| frontend.base_url.join(path).ok())
        .filter(|url| url.origin() == frontend.base_url.origin())
        .unwrap_or_else(|| frontend.get_home_url())
}

pub async fn handler_auth_google(
    State(state): State<ServerState>,
    Query(options): Query<AuthOptions>,
) -> AppResult<impl IntoResponse> {
    let session_id = state.pending_auth.begin(options.return_to);
    let oauth_state = OAuthState::new(session_id);
    let url = state
        .session_manager
        .authorization_url(&oauth_state.encode())?;

    Ok(Redirect::to(url.as_str()))
}

pub async fn handler_auth_callback(
    State(state): State<ServerState>,
    cookies: Cookies,
    Query(query): Query<CallbackQuery>,
) -> Redirect {
    let frontend = &state.config.frontend;

    if let Some(err) = query.error.as_deref() {
        tracing::error!("Error in oauth2 callback: {}", err);
        return redirect_to_sign_in(frontend, err);
    }

    let (Some(code), Some(encoded_state)) = (query.code.as_deref(), query.state.as_deref())
    else {
        return redirect_to_sign_in(frontend, "missing_code");
    };

    let Some(pending) = OAuthState::decode(encoded_state)
        .and_then(|oauth_state| state.pending_auth.take(oauth_state.session_id))
    else {
        tracing::warn!("OAuth callback with unknown or expired state");
        return redirect_to_sign_in(frontend, "invalid_state");
    };

    let store = cookie_store(&state, cookies);
    match state.session_manager.exchange_code(code, &store).await {
        Ok(_) => Redirect::to(landing_url(frontend, pending.return_to.as_deref()).as_str()),
        Err(e) => redirect_to_sign_in(frontend, e.as_ref()),
    }
}

pub async fn handler_refresh(authed: AuthedSession) -> AppJsonResult<SessionInfo> {
    Ok(Json(SessionInfo {
        identity: authed.session.identity,
        expires_at: authed.session.access_token_expiry,
    }))
}

pub async fn handler_me(authed: AuthedSession) -> AppJsonResult<Identity> {
    Ok(Json(authed.session.identity))
}

pub async fn handler_logout(State(state): State<ServerState>, cookies: Cookies) -> StatusCode {
    let store = cookie_store(&state, cookies);
    let mut session = store.load();
    state
        .session_manager
        .invalidate(session.as_mut(), &store)
        .await;

    StatusCode::NO_CONTENT
}
