use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const PENDING_AUTH_TTL: i64 = 30 * 60;

/// Consent round-trip started by `/auth/google`, awaiting its callback.
#[derive(Debug, Clone)]
pub struct PendingAuth {
    pub expires_at: i64,
    pub return_to: Option<String>,
}

impl PendingAuth {
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now().timestamp()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PendingAuthStore {
    inner: Arc<RwLock<HashMap<Uuid, PendingAuth>>>,
}

impl PendingAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, return_to: Option<String>) -> Uuid {
        let session_id = Uuid::new_v4();
        let pending = PendingAuth {
            expires_at: Utc::now().timestamp() + PENDING_AUTH_TTL,
            return_to,
        };
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id, pending);
        session_id
    }

    /// Removes and returns the pending entry; a state value is only good once.
    pub fn take(&self, session_id: Uuid) -> Option<PendingAuth> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id)
            .filter(|p| !p.is_expired())
    }

    pub fn clean_store(&self) {
        let now = Utc::now().timestamp();
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, pending| pending.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[cfg(test)]
    fn insert_raw(&self, session_id: Uuid, pending: PendingAuth) {
        self.inner.write().unwrap().insert(session_id, pending);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthState {
    pub session_id: Uuid,
}

impl OAuthState {
    pub fn new(session_id: Uuid) -> Self {
        Self { session_id }
    }

    pub fn encode(&self) -> String {
        // Serializing a lone Uuid cannot fail
        let json = serde_json::to_string(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json.as_bytes())
    }

    pub fn decode(encoded: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
        let json = String::from_utf8(bytes).ok()?;
        serde_json::from_str(&json).ok()
    }
}
