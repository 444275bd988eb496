use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use url::Url;

use crate::{server_config::GoogleOAuthConfig, HttpClient};

use super::{
    session::{Identity, Session, SessionState},
    token_store::TokenStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum AuthError {
    ExchangeFailed,
    ReauthRequired,
}

impl std::error::Error for AuthError {}

#[derive(Debug, Serialize, Deserialize)]
pub struct GoogleTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    pub expires_in: u64,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GoogleUserInfo {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

impl From<GoogleUserInfo> for Identity {
    fn from(info: GoogleUserInfo) -> Self {
        Identity {
            email: info.email,
            display_name: info.name,
            avatar_url: info.picture,
        }
    }
}

#[derive(Debug, Clone)]
struct TokenGrant {
    access_token: String,
    /// Fixed when the provider answered, so a reused grant keeps the real expiry
    expires_at: DateTime<Utc>,
    refresh_token: Option<String>,
}

type SharedRefresh = Shared<BoxFuture<'static, Result<TokenGrant, AuthError>>>;

struct InFlightRefresh {
    started: Instant,
    grant: SharedRefresh,
}

struct Inner {
    http_client: HttpClient,
    oauth: Arc<GoogleOAuthConfig>,
    refresh_reuse: Duration,
    /// Keyed by refresh token so concurrent requests from one browser share a refresh
    refreshes: Mutex<HashMap<String, InFlightRefresh>>,
}

/// Owns the access/refresh token lifecycle of a user session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(http_client: HttpClient, oauth: GoogleOAuthConfig, refresh_reuse: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                http_client,
                oauth: Arc::new(oauth),
                refresh_reuse,
                refreshes: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn authorization_url(&self, state: &str) -> anyhow::Result<Url> {
        let GoogleOAuthConfig {
            auth_uri,
            client_id,
            redirect_uri,
            scopes,
            ..
        } = self.inner.oauth.as_ref();

        let mut url = Url::parse(auth_uri)?;
        url.query_pairs_mut().extend_pairs(&[
            ("client_id", client_id.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", scopes.join(" ").as_str()),
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("state", state),
        ]);

        Ok(url)
    }

    /// Trades an authorization code for a new session and persists it.
    pub async fn exchange_code(
        &self,
        code: &str,
        store: &impl TokenStore,
    ) -> Result<Session, AuthError> {
        let GoogleOAuthConfig {
            token_uri,
            client_id,
            client_secret,
            redirect_uri,
            ..
        } = self.inner.oauth.as_ref();

        let resp = self
            .inner
            .http_client
            .post(token_uri)
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("code", code),
                ("redirect_uri", redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Error exchanging code: {:?}", e);
                AuthError::ExchangeFailed
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            tracing::error!("Code exchange rejected ({}): {}", status, body);
            return Err(AuthError::ExchangeFailed);
        }

        let token = resp.json::<GoogleTokenResponse>().await.map_err(|e| {
            tracing::error!("Unexpected token response: {:?}", e);
            AuthError::ExchangeFailed
        })?;

        let identity = self.fetch_identity(&token.access_token).await?;

        // Google only issues a refresh token on first consent; keep the one we
        // already hold for the same account.
        let refresh_token = token.refresh_token.or_else(|| {
            store
                .load()
                .filter(|existing| existing.identity.email == identity.email)
                .and_then(|existing| existing.refresh_token)
        });

        let session = Session {
            access_token: token.access_token,
            access_token_expiry: Utc::now() + chrono::Duration::seconds(token.expires_in as i64),
            refresh_token,
            identity,
        };
        store.save(&session);
        tracing::info!(
            "Session created for {} (refreshable: {})",
            session.identity.email,
            session.refresh_token.is_some()
        );

        Ok(session)
    }

    async fn fetch_identity(&self, access_token: &str) -> Result<Identity, AuthError> {
        let resp = self
            .inner
            .http_client
            .get(&self.inner.oauth.userinfo_uri)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Error fetching user info: {:?}", e);
                AuthError::ExchangeFailed
            })?;

        if !resp.status().is_success() {
            tracing::error!("User info request failed: {}", resp.status());
            return Err(AuthError::ExchangeFailed);
        }

        resp.json::<GoogleUserInfo>()
            .await
            .map(Identity::from)
            .map_err(|e| {
                tracing::error!("Unexpected user info response: {:?}", e);
                AuthError::ExchangeFailed
            })
    }

    /// Returns a session whose access token is usable now, refreshing it at
    /// most once. A valid session is returned untouched without any I/O.
    pub async fn ensure_valid(
        &self,
        session: Session,
        store: &impl TokenStore,
    ) -> Result<Session, AuthError> {
        match session.state() {
            SessionState::Valid => Ok(session),
            SessionState::Terminal => {
                tracing::debug!("Session for {} is terminal", session.identity.email);
                Err(AuthError::ReauthRequired)
            }
            SessionState::ExpiredRefreshable => {
                let Some(refresh_token) = session.refresh_token.clone() else {
                    return Err(AuthError::ReauthRequired);
                };

                let grant = self.shared_refresh(&refresh_token).await?;
                let refreshed = Session {
                    access_token: grant.access_token,
                    access_token_expiry: grant.expires_at,
                    refresh_token: grant.refresh_token.or(Some(refresh_token)),
                    identity: session.identity,
                };
                store.save(&refreshed);

                Ok(refreshed)
            }
        }
    }

    /// Joins an in-flight (or just settled) refresh for the same token, or starts one.
    fn shared_refresh(&self, refresh_token: &str) -> SharedRefresh {
        let mut refreshes = self
            .inner
            .refreshes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = refreshes.get(refresh_token) {
            let pending = existing.grant.peek().is_none();
            if pending || existing.started.elapsed() < self.inner.refresh_reuse {
                return existing.grant.clone();
            }
        }

        let grant = request_refresh(
            self.inner.http_client.clone(),
            self.inner.oauth.clone(),
            refresh_token.to_string(),
        )
        .boxed()
        .shared();

        refreshes.insert(
            refresh_token.to_string(),
            InFlightRefresh {
                started: Instant::now(),
                grant: grant.clone(),
            },
        );

        grant
    }

    /// Drops settled refresh results older than the reuse window.
    pub fn purge_settled_refreshes(&self) {
        let reuse = self.inner.refresh_reuse;
        self.inner
            .refreshes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, r| r.grant.peek().is_none() || r.started.elapsed() < reuse);
    }

    /// Logs the session out. Safe to call with no session or an already cleared one.
    pub async fn invalidate(&self, session: Option<&mut Session>, store: &impl TokenStore) {
        let refresh_token = session
            .as_ref()
            .and_then(|s| s.refresh_token.clone())
            .or_else(|| store.load().and_then(|s| s.refresh_token));

        store.clear();
        if let Some(session) = session {
            tracing::info!("Invalidating session for {}", session.identity.email);
            session.clear();
        }

        if let Some(token) = refresh_token {
            self.inner
                .refreshes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&token);
            self.revoke(&token).await;
        }
    }

    async fn revoke(&self, token: &str) {
        let Some(revoke_uri) = &self.inner.oauth.revoke_uri else {
            return;
        };

        match self
            .inner
            .http_client
            .post(revoke_uri)
            .form(&[("token", token)])
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => tracing::debug!("Refresh token revoked"),
            Ok(resp) => tracing::warn!("Token revocation returned {}", resp.status()),
            Err(e) => tracing::warn!("Token revocation failed: {:?}", e),
        }
    }
}

async fn request_refresh(
    http_client: HttpClient,
    oauth: Arc<GoogleOAuthConfig>,
    refresh_token: String,
) -> Result<TokenGrant, AuthError> {
    tracing::info!("Refreshing access token");

    let resp = http_client
        .post(&oauth.token_uri)
        .form(&[
            ("client_id", oauth.client_id.as_str()),
            ("client_secret", oauth.client_secret.as_str()),
            ("refresh_token", refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ])
        .send()
        .await
        .map_err(|e| {
            tracing::error!("Error refreshing token: {:?}", e);
            AuthError::ReauthRequired
        })?;

    let resp = resp.json::<serde_json::Value>().await.map_err(|e| {
        tracing::error!("Unexpected serde error: {:?}", e);
        AuthError::ReauthRequired
    })?;

    if resp.get("error").is_some() {
        match resp.get("error_description").and_then(|d| d.as_str()) {
            Some("Token has been expired or revoked.") => {
                tracing::warn!("Refresh token expired or revoked");
            }
            Some(desc) => tracing::error!("Unexpected error refreshing token: {:?}", desc),
            None => tracing::error!("Unknown error refreshing token: {:?}", resp),
        };
        return Err(AuthError::ReauthRequired);
    }

    let token = serde_json::from_value::<GoogleTokenResponse>(resp.clone()).map_err(|_| {
        tracing::error!("Unexpected oauth2 refresh response: {:?}", resp);
        AuthError::ReauthRequired
    })?;

    Ok(TokenGrant {
        access_token: token.access_token,
        expires_at: Utc::now() + chrono::Duration::seconds(token.expires_in as i64),
        refresh_token: token.refresh_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::common::{test_config, test_session, MemoryTokenStore};
    use chrono::Duration as ChronoDuration;
    use wiremock::{
        matchers::{body_string_contains, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn manager(server: &MockServer) -> SessionManager {
        let cfg = test_config(&server.uri());
        SessionManager::new(
            reqwest::Client::new(),
            cfg.oauth,
            Duration::from_secs(cfg.session.refresh_reuse_secs),
        )
    }

    fn refresh_ok(access_token: &str, refresh_token: Option<&str>) -> ResponseTemplate {
        let mut body = serde_json::json!({
            "access_token": access_token,
            "token_type": "Bearer",
            "expires_in": 3599,
            "scope": "https://www.googleapis.com/auth/gmail.modify"
        });
        if let Some(refresh_token) = refresh_token {
            body["refresh_token"] = refresh_token.into();
        }
        ResponseTemplate::new(200).set_body_json(body)
    }

    #[test]
    fn test_authorization_url() {
        let cfg = test_config("http://127.0.0.1:1");
        let manager = SessionManager::new(reqwest::Client::new(), cfg.oauth, Duration::ZERO);
        let url = manager.authorization_url("abc").unwrap();
        let pairs: HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(pairs["access_type"], "offline");
        assert_eq!(pairs["state"], "abc");
        assert_eq!(pairs["response_type"], "code");
        assert!(pairs["scope"].contains("gmail.modify"));
    }

    #[tokio::test]
    async fn test_valid_session_returns_unchanged_without_io() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(refresh_ok("unused", None))
            .expect(0)
            .mount(&server)
            .await;

        let store = MemoryTokenStore::default();
        let session = test_session(Utc::now() + ChronoDuration::minutes(10), Some("1//refresh"));
        let result = manager(&server)
            .ensure_valid(session.clone(), &store)
            .await
            .unwrap();

        assert_eq!(result, session);
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_session_refreshes_once_and_persists() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=1%2F%2Frefresh"))
            .respond_with(refresh_ok("ya29.fresh", None))
            .expect(1)
            .mount(&server)
            .await;

        let store = MemoryTokenStore::default();
        let session = test_session(Utc::now() - ChronoDuration::minutes(1), Some("1//refresh"));
        let refreshed = manager(&server).ensure_valid(session, &store).await.unwrap();

        assert_eq!(refreshed.access_token, "ya29.fresh");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("1//refresh"));
        assert_eq!(refreshed.state(), SessionState::Valid);
        assert_eq!(store.load(), Some(refreshed));
    }

    #[tokio::test]
    async fn test_refresh_replaces_rotated_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(refresh_ok("ya29.fresh", Some("1//rotated")))
            .expect(1)
            .mount(&server)
            .await;

        let store = MemoryTokenStore::default();
        let session = test_session(Utc::now() - ChronoDuration::minutes(1), Some("1//refresh"));
        let refreshed = manager(&server).ensure_valid(session, &store).await.unwrap();

        assert_eq!(refreshed.refresh_token.as_deref(), Some("1//rotated"));
    }

    #[tokio::test]
    async fn test_refresh_failure_requires_reauth_and_persists_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Token has been expired or revoked."
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = MemoryTokenStore::default();
        let session = test_session(Utc::now() - ChronoDuration::minutes(1), Some("1//refresh"));
        let err = manager(&server)
            .ensure_valid(session, &store)
            .await
            .unwrap_err();

        assert_eq!(err, AuthError::ReauthRequired);
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_terminal_session_fails_without_io() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(refresh_ok("unused", None))
            .expect(0)
            .mount(&server)
            .await;

        let store = MemoryTokenStore::default();
        let session = test_session(Utc::now() - ChronoDuration::minutes(1), None);
        let err = manager(&server)
            .ensure_valid(session, &store)
            .await
            .unwrap_err();

        assert_eq!(err, AuthError::ReauthRequired);
    }

    #[tokio::test]
    async fn test_concurrent_checks_share_one_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                refresh_ok("ya29.fresh", None).set_delay(std::time::Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let manager = manager(&server);
        let store = MemoryTokenStore::default();
        let session = test_session(Utc::now() - ChronoDuration::minutes(1), Some("1//refresh"));

        let checks = (0..8).map(|_| manager.ensure_valid(session.clone(), &store));
        let results = futures::future::join_all(checks).await;

        assert!(results
            .iter()
            .all(|r| r.as_ref().is_ok_and(|s| s.access_token == "ya29.fresh")));

        // A late request still carrying the old cookies reuses the settled grant
        let late = manager.ensure_valid(session, &store).await.unwrap();
        assert_eq!(late.access_token, "ya29.fresh");
    }

    #[tokio::test]
    async fn test_reused_grant_keeps_provider_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ya29.short",
                "token_type": "Bearer",
                "expires_in": 10
            })))
            .expect(1)
            .mount(&server)
            .await;

        let manager = manager(&server);
        let store = MemoryTokenStore::default();
        let session = test_session(Utc::now() - ChronoDuration::minutes(1), Some("1//refresh"));

        let first = manager.ensure_valid(session.clone(), &store).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        let late = manager.ensure_valid(session, &store).await.unwrap();

        assert_eq!(late.access_token, "ya29.short");
        assert_eq!(late.access_token_expiry, first.access_token_expiry);
    }

    #[tokio::test]
    async fn test_exchange_code_creates_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=4%2Fcode"))
            .respond_with(refresh_ok("ya29.first", Some("1//first")))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .and(header("authorization", "Bearer ya29.first"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sub": "1234",
                "email": "someone@example.com",
                "name": "Some One",
                "picture": "https://lh3.googleusercontent.com/a/photo"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = MemoryTokenStore::default();
        let session = manager(&server)
            .exchange_code("4/code", &store)
            .await
            .unwrap();

        assert_eq!(session.access_token, "ya29.first");
        assert_eq!(session.refresh_token.as_deref(), Some("1//first"));
        assert_eq!(session.identity.display_name.as_deref(), Some("Some One"));
        assert_eq!(session.state(), SessionState::Valid);
        assert_eq!(store.load(), Some(session));
    }

    #[tokio::test]
    async fn test_exchange_failure_persists_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Malformed auth code."
            })))
            .mount(&server)
            .await;

        let store = MemoryTokenStore::default();
        let err = manager(&server)
            .exchange_code("bad", &store)
            .await
            .unwrap_err();

        assert_eq!(err, AuthError::ExchangeFailed);
        assert_eq!(err.as_ref(), "exchange_failed");
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_then_ensure_valid_requires_reauth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/revoke"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(refresh_ok("unused", None))
            .expect(0)
            .mount(&server)
            .await;

        let manager = manager(&server);
        let store = MemoryTokenStore::default();
        let mut session = test_session(Utc::now() + ChronoDuration::minutes(10), Some("1//refresh"));
        store.save(&session);

        manager.invalidate(Some(&mut session), &store).await;
        assert!(store.load().is_none());

        let err = manager.ensure_valid(session, &store).await.unwrap_err();
        assert_eq!(err, AuthError::ReauthRequired);

        // Idempotent on an absent session
        manager.invalidate(None, &store).await;
    }
}
