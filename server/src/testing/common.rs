use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tower_cookies::Key;
use url::Url;

use crate::{
    auth::{session_store::PendingAuthStore, CookiePolicy, Identity, Session, SessionManager, TokenStore},
    email::{MailApiError, MailSource, MessageBody, MessageDetail},
    pipeline::BatchOrchestrator,
    prompt::{Extraction, ExtractionError, Extractor},
    server_config::*,
    store::MemoryRecordStore,
    ServerState,
};

/// Config whose every external endpoint points at `base_uri`.
pub fn test_config(base_uri: &str) -> ServerConfig {
    ServerConfig {
        server: ServerSettings {
            port: 0,
            request_timeout_secs: 30,
            production: false,
        },
        oauth: GoogleOAuthConfig {
            client_id: "test-client-id.apps.googleusercontent.com".to_string(),
            client_secret: "test-client-secret".to_string(),
            auth_uri: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_uri: format!("{base_uri}/token"),
            userinfo_uri: format!("{base_uri}/userinfo"),
            revoke_uri: Some(format!("{base_uri}/revoke")),
            redirect_uri: "http://localhost:5006/auth/callback".to_string(),
            scopes: vec![
                "openid".to_string(),
                "email".to_string(),
                "https://www.googleapis.com/auth/gmail.modify".to_string(),
            ],
        },
        session: SessionConfig {
            cookie_key: None,
            refresh_cookie_days: 30,
            refresh_reuse_secs: 30,
            public_host: "localhost".to_string(),
        },
        gmail: GmailApiConfig {
            api_base: format!("{base_uri}/gmail/v1/users/me"),
            default_query: "in:inbox".to_string(),
            max_results_cap: 500,
        },
        extraction: ExtractionConfig {
            endpoint: format!("{base_uri}/v1/chat/completions"),
            api_key: "test-api-key".to_string(),
            model: "mistral-small-latest".to_string(),
            temperature: 0.2,
            timeout_ms: 5_000,
            max_body_chars: 12_000,
            prompt_limits: PromptLimits {
                rate_limit_per_sec: 1_000,
                refill_interval_ms: 1,
                refill_amount: 1_000,
                backoff_secs: 1,
            },
        },
        batch: BatchConfig {
            default_chunk_size: 10,
            max_chunk_size: 50,
            item_timeout_ms: 5_000,
            deadline_ms: 60_000,
            pacing: PacingConfig::None,
        },
        frontend: FrontendConfig {
            base_url: Url::parse("http://localhost:3000").unwrap(),
            home_path: "/inbox".to_string(),
            login_path: "/sign-in".to_string(),
        },
        database: DatabaseConfig::default(),
    }
}

pub fn test_identity() -> Identity {
    Identity {
        email: "someone@example.com".to_string(),
        display_name: Some("Some One".to_string()),
        avatar_url: None,
    }
}

pub fn test_session(expiry: DateTime<Utc>, refresh_token: Option<&str>) -> Session {
    Session {
        access_token: "ya29.token".to_string(),
        access_token_expiry: expiry,
        refresh_token: refresh_token.map(str::to_string),
        identity: test_identity(),
    }
}

/// Server state wired to `base_uri` with in-memory collaborators.
pub fn test_state(base_uri: &str, extractor: Arc<FakeExtractor>) -> ServerState {
    let config = test_config(base_uri);
    let http_client = reqwest::Client::new();
    let session_manager = SessionManager::new(
        http_client.clone(),
        config.oauth.clone(),
        Duration::from_secs(config.session.refresh_reuse_secs),
    );
    let orchestrator = BatchOrchestrator::from_config(extractor, &config.batch);
    let cookie_policy = CookiePolicy::from_config(&config.server, &config.session);

    ServerState {
        http_client,
        config: Arc::new(config),
        session_manager,
        pending_auth: PendingAuthStore::new(),
        cookie_key: Key::generate(),
        cookie_policy,
        orchestrator,
        records: Arc::new(MemoryRecordStore::new()),
    }
}

#[derive(Default)]
pub struct MemoryTokenStore {
    session: Mutex<Option<Session>>,
    saves: AtomicUsize,
}

impl MemoryTokenStore {
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Option<Session> {
        self.session.lock().unwrap().clone()
    }

    fn save(&self, session: &Session) {
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.session.lock().unwrap() = Some(session.clone());
    }

    fn clear(&self) {
        *self.session.lock().unwrap() = None;
    }
}

/// Mailbox with canned messages. Message `x` has subject `Subject x`.
#[derive(Default)]
pub struct FakeMailSource {
    messages: HashMap<String, MessageDetail>,
    failing: HashSet<String>,
    delays: HashMap<String, Duration>,
    fetches: Mutex<Vec<(String, Instant)>>,
}

impl FakeMailSource {
    pub fn with_messages(ids: &[&str]) -> Self {
        let messages = ids
            .iter()
            .map(|id| {
                let detail = MessageDetail {
                    id: id.to_string(),
                    thread_id: Some(id.to_string()),
                    subject: format!("Subject {id}"),
                    sender: format!("sender-{id}@example.com"),
                    date: None,
                    body: MessageBody::Text(format!("Body of {id}")),
                    snippet: format!("Snippet of {id}"),
                    label_ids: vec!["INBOX".to_string()],
                };
                (id.to_string(), detail)
            })
            .collect();

        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn failing(mut self, id: &str) -> Self {
        self.failing.insert(id.to_string());
        self
    }

    pub fn delayed(mut self, id: &str, delay: Duration) -> Self {
        self.delays.insert(id.to_string(), delay);
        self
    }

    pub fn undecodable(mut self, id: &str) -> Self {
        if let Some(detail) = self.messages.get_mut(id) {
            detail.body = MessageBody::Undecodable("Invalid symbol 64, offset 0.".to_string());
        }
        self
    }

    pub fn without_body(mut self, id: &str) -> Self {
        if let Some(detail) = self.messages.get_mut(id) {
            detail.body = MessageBody::Missing;
        }
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    pub fn fetched_at(&self, id: &str) -> Option<Instant> {
        self.fetches
            .lock()
            .unwrap()
            .iter()
            .find(|(fetched, _)| fetched == id)
            .map(|(_, at)| *at)
    }
}

#[async_trait]
impl MailSource for FakeMailSource {
    async fn list_message_ids(&self, _query: &str, max: u32) -> Result<Vec<String>, MailApiError> {
        let mut ids = self.messages.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids.truncate(max as usize);
        Ok(ids)
    }

    async fn get_message_detail(&self, message_id: &str) -> Result<MessageDetail, MailApiError> {
        self.fetches
            .lock()
            .unwrap()
            .push((message_id.to_string(), Instant::now()));

        if let Some(delay) = self.delays.get(message_id) {
            tokio::time::sleep(*delay).await;
        }

        if self.failing.contains(message_id) {
            return Err(MailApiError::Status {
                status: 500,
                message: "Backend Error".to_string(),
            });
        }

        self.messages
            .get(message_id)
            .cloned()
            .ok_or_else(|| MailApiError::Status {
                status: 404,
                message: "Requested entity was not found.".to_string(),
            })
    }

    async fn modify_labels(
        &self,
        _message_id: &str,
        _add: &[String],
        _remove: &[String],
    ) -> Result<(), MailApiError> {
        Ok(())
    }

    async fn delete_message(&self, _message_id: &str) -> Result<(), MailApiError> {
        Ok(())
    }
}

/// Extractor that summarizes by subject and records what it was given.
#[derive(Default)]
pub struct FakeExtractor {
    failing_subjects: HashSet<String>,
    contents: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl FakeExtractor {
    pub fn failing_for_subject(mut self, subject: &str) -> Self {
        self.failing_subjects.insert(subject.to_string());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn contents(&self) -> Vec<String> {
        self.contents.lock().unwrap().clone()
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn extract(
        &self,
        content: &str,
        subject: &str,
        _sender: &str,
    ) -> Result<Extraction, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contents.lock().unwrap().push(content.to_string());

        if self.failing_subjects.contains(subject) {
            return Err(ExtractionError::Api("model refused the request".to_string()));
        }

        Ok(Extraction {
            summary: format!("Summary of {subject}"),
            action_items: vec![],
            topics: vec!["testing".to_string()],
        })
    }
}
