use std::net::IpAddr;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_cookies::{
    cookie::{time, SameSite},
    Cookie, Cookies, Key,
};

use crate::server_config::{ServerSettings, SessionConfig};

use super::session::{Identity, Session};

pub const ACCESS_COOKIE: &str = "access_token";
pub const REFRESH_COOKIE: &str = "refresh_token";
pub const USER_COOKIE: &str = "user";

/// Persistence boundary for session token material.
pub trait TokenStore {
    fn load(&self) -> Option<Session>;
    fn save(&self, session: &Session);
    fn clear(&self);
}

/// Cookie attributes for the current deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookiePolicy {
    pub secure: bool,
    pub same_site: SameSite,
    pub domain: Option<String>,
    pub refresh_lifetime_days: i64,
}

impl CookiePolicy {
    pub fn from_config(server: &ServerSettings, session: &SessionConfig) -> Self {
        let domain = if is_local_host(&session.public_host) {
            None
        } else {
            Some(host_without_port(&session.public_host).to_string())
        };

        if server.production {
            Self {
                secure: true,
                same_site: SameSite::None,
                domain,
                refresh_lifetime_days: session.refresh_cookie_days,
            }
        } else {
            Self {
                secure: false,
                same_site: SameSite::Lax,
                domain,
                refresh_lifetime_days: session.refresh_cookie_days,
            }
        }
    }

    fn build(&self, name: &'static str, value: String, http_only: bool) -> Cookie<'static> {
        let mut builder = Cookie::build((name, value))
            .path("/")
            .http_only(http_only)
            .secure(self.secure)
            .same_site(self.same_site);
        if let Some(domain) = &self.domain {
            builder = builder.domain(domain.clone());
        }
        builder.build()
    }
}

/// `api.example.com:443` → `api.example.com`, `[::1]:8080` → `::1`.
fn host_without_port(host: &str) -> &str {
    let host = host.trim().trim_start_matches('[');
    match host.split_once(']') {
        Some((inner, _)) => inner,
        None => host.rsplit_once(':').map_or(host, |(h, port)| {
            if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) && !h.contains(':') {
                h
            } else {
                host
            }
        }),
    }
}

fn is_local_host(host: &str) -> bool {
    let host = host_without_port(host);

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback();
    }
    host.eq_ignore_ascii_case("localhost") || host.ends_with(".localhost")
}

/// Load a key for the private jar, generating an ephemeral one when none is configured.
pub fn cookie_key(session: &SessionConfig) -> anyhow::Result<Key> {
    match &session.cookie_key {
        Some(encoded) if !encoded.is_empty() => {
            use base64::engine::general_purpose::STANDARD;
            let bytes = STANDARD.decode(encoded)?;
            Key::try_from(bytes.as_slice())
                .map_err(|e| anyhow::anyhow!("Invalid session.cookie_key: {:?}", e))
        }
        _ => {
            tracing::warn!("No session.cookie_key configured, sessions will not survive a restart");
            Ok(Key::generate())
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AccessCookie {
    token: String,
    expires_at: i64,
    identity: Identity,
}

#[derive(Debug, Serialize, Deserialize)]
struct RefreshCookie {
    token: String,
    identity: Identity,
}

/// Token cookies live in the private (encrypted) jar; the identity cookie is
/// readable by the frontend and never carries a token.
#[derive(Clone)]
pub struct CookieTokenStore {
    cookies: Cookies,
    key: Key,
    policy: CookiePolicy,
}

impl CookieTokenStore {
    pub fn new(cookies: Cookies, key: Key, policy: CookiePolicy) -> Self {
        Self {
            cookies,
            key,
            policy,
        }
    }

    fn read<T: for<'de> Deserialize<'de>>(&self, name: &str) -> Option<T> {
        let cookie = self.cookies.private(&self.key).get(name)?;
        serde_json::from_str(cookie.value())
            .inspect_err(|e| tracing::debug!("Discarding malformed {} cookie: {:?}", name, e))
            .ok()
    }
}

impl TokenStore for CookieTokenStore {
    fn load(&self) -> Option<Session> {
        let access = self.read::<AccessCookie>(ACCESS_COOKIE);
        let refresh = self.read::<RefreshCookie>(REFRESH_COOKIE);

        match (access, refresh) {
            (Some(access), refresh) => Some(Session {
                access_token: access.token,
                access_token_expiry: DateTime::from_timestamp(access.expires_at, 0)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC),
                refresh_token: refresh.map(|r| r.token),
                identity: access.identity,
            }),
            // The browser already dropped the access cookie, so the token is expired
            (None, Some(refresh)) => Some(Session {
                access_token: String::new(),
                access_token_expiry: DateTime::<Utc>::MIN_UTC,
                refresh_token: Some(refresh.token),
                identity: refresh.identity,
            }),
            (None, None) => None,
        }
    }

    fn save(&self, session: &Session) {
        let ttl = time::Duration::seconds(session.remaining_secs(Utc::now()));
        let private = self.cookies.private(&self.key);

        let access = AccessCookie {
            token: session.access_token.clone(),
            expires_at: session.access_token_expiry.timestamp(),
            identity: session.identity.clone(),
        };
        match serde_json::to_string(&access) {
            Ok(value) => {
                let mut cookie = self.policy.build(ACCESS_COOKIE, value, true);
                cookie.set_max_age(ttl);
                private.add(cookie);
            }
            Err(e) => tracing::error!("Could not serialize access cookie: {:?}", e),
        }

        match &session.refresh_token {
            Some(token) => {
                let refresh = RefreshCookie {
                    token: token.clone(),
                    identity: session.identity.clone(),
                };
                match serde_json::to_string(&refresh) {
                    Ok(value) => {
                        let mut cookie = self.policy.build(REFRESH_COOKIE, value, true);
                        cookie.set_max_age(time::Duration::days(self.policy.refresh_lifetime_days));
                        private.add(cookie);
                    }
                    Err(e) => tracing::error!("Could not serialize refresh cookie: {:?}", e),
                }
            }
            None => private.remove(self.policy.build(REFRESH_COOKIE, String::new(), true)),
        }

        match serde_json::to_vec(&session.identity) {
            Ok(json) => {
                let mut cookie = self
                    .policy
                    .build(USER_COOKIE, URL_SAFE_NO_PAD.encode(json), false);
                cookie.set_max_age(ttl);
                self.cookies.add(cookie);
            }
            Err(e) => tracing::error!("Could not serialize user cookie: {:?}", e),
        }
    }

    fn clear(&self) {
        let private = self.cookies.private(&self.key);
        private.remove(self.policy.build(ACCESS_COOKIE, String::new(), true));
        private.remove(self.policy.build(REFRESH_COOKIE, String::new(), true));
        self.cookies
            .remove(self.policy.build(USER_COOKIE, String::new(), false));
    }
}

#[cfg(test)]
pub(crate) fn session_cookie_header(key: &Key, session: &Session, include_access: bool) -> String {
    use tower_cookies::cookie::CookieJar;

    let mut jar = CookieJar::new();
    let mut names = vec![];
    if include_access {
        let access = AccessCookie {
            token: session.access_token.clone(),
            expires_at: session.access_token_expiry.timestamp(),
            identity: session.identity.clone(),
        };
        jar.private_mut(key).add(Cookie::new(
            ACCESS_COOKIE,
            serde_json::to_string(&access).unwrap(),
        ));
        jar.add(Cookie::new(
            USER_COOKIE,
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&session.identity).unwrap()),
        ));
        names.push(ACCESS_COOKIE);
        names.push(USER_COOKIE);
    }
    if let Some(token) = &session.refresh_token {
        let refresh = RefreshCookie {
            token: token.clone(),
            identity: session.identity.clone(),
        };
        jar.private_mut(key).add(Cookie::new(
            REFRESH_COOKIE,
            serde_json::to_string(&refresh).unwrap(),
        ));
        names.push(REFRESH_COOKIE);
    }

    names
        .iter()
        .filter_map(|name| jar.get(name))
        .map(|c| format!("{}={}", c.name(), c.value()))
        .collect::<Vec<_>>()
        .join("; ")
}
