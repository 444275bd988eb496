use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who the session belongs to. Safe to expose to client code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub email: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Valid,
    ExpiredRefreshable,
    /// Expired without a refresh token, only a new code exchange recovers it
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub access_token_expiry: DateTime<Utc>,
    pub refresh_token: Option<String>,
    pub identity: Identity,
}

impl Session {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.access_token_expiry
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> SessionState {
        if self.is_valid_at(now) {
            SessionState::Valid
        } else if self.refresh_token.is_some() {
            SessionState::ExpiredRefreshable
        } else {
            SessionState::Terminal
        }
    }

    pub fn state(&self) -> SessionState {
        self.state_at(Utc::now())
    }

    /// Seconds until the access token expires, zero once it has.
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.access_token_expiry - now).num_seconds().max(0)
    }

    /// Drops all token material, leaving the session terminal.
    pub(crate) fn clear(&mut self) {
        self.access_token.clear();
        self.access_token_expiry = DateTime::<Utc>::MIN_UTC;
        self.refresh_token = None;
    }
}
