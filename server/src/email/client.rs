extern crate google_gmail1 as gmail1;

use std::{sync::Arc, time::Duration};

use axum::async_trait;
use derive_more::Display;
use gmail1::api::{ListMessagesResponse, ModifyMessageRequest};
use leaky_bucket::RateLimiter;
use reqwest::Response;
use serde::de::DeserializeOwned;
use url::Url;

use crate::HttpClient;

use super::message::{GmailMessage, MessageDetail};

/// Gmail allows 250 quota units per user per second.
pub const GMAIL_QUOTA_PER_SECOND: usize = 250;

/// Quota units charged per method.
pub struct GmailApiQuota {
    pub messages_list: usize,
    pub messages_get: usize,
    pub messages_modify: usize,
    pub messages_delete: usize,
}

pub const GMAIL_API_QUOTA: GmailApiQuota = GmailApiQuota {
    messages_list: 5,
    messages_get: 5,
    messages_modify: 5,
    messages_delete: 10,
};

pub const MAX_MESSAGES_PER_PAGE: u32 = 500;

/// Gmail API error response structure
#[derive(Debug, Clone, serde::Deserialize)]
pub struct GmailApiError {
    pub error: GmailApiErrorDetail,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct GmailApiErrorDetail {
    pub code: u16,
    pub message: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum MailApiError {
    #[display("Gmail API returned {status}: {message}")]
    Status { status: u16, message: String },
    #[display("Gmail request failed: {_0}")]
    Transport(String),
    #[display("Unexpected Gmail response: {_0}")]
    Decode(String),
}

impl std::error::Error for MailApiError {}

impl From<reqwest::Error> for MailApiError {
    fn from(e: reqwest::Error) -> Self {
        MailApiError::Transport(e.to_string())
    }
}

/// Mailbox operations for one authenticated user. Implementations use the
/// access token they were built with and never refresh it.
#[async_trait]
pub trait MailSource: Send + Sync {
    async fn list_message_ids(&self, query: &str, max: u32) -> Result<Vec<String>, MailApiError>;

    async fn get_message_detail(&self, message_id: &str) -> Result<MessageDetail, MailApiError>;

    async fn modify_labels(
        &self,
        message_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<(), MailApiError>;

    async fn delete_message(&self, message_id: &str) -> Result<(), MailApiError>;
}

#[derive(Debug, Clone)]
pub struct GmailClient {
    http_client: HttpClient,
    api_base: String,
    access_token: String,
    rate_limiter: Arc<RateLimiter>,
}

impl GmailClient {
    pub fn new(
        http_client: HttpClient,
        api_base: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        let rate_limiter = Arc::new(
            RateLimiter::builder()
                .initial(GMAIL_QUOTA_PER_SECOND)
                .interval(Duration::from_secs(1))
                .refill(GMAIL_QUOTA_PER_SECOND)
                .max(GMAIL_QUOTA_PER_SECOND)
                .build(),
        );

        GmailClient {
            http_client,
            api_base: api_base.into(),
            access_token: access_token.into(),
            rate_limiter,
        }
    }

    /// `api_base` joined with percent-encoded path segments.
    fn gmail_url(&self, segments: &[&str]) -> Result<Url, MailApiError> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|e| MailApiError::Transport(format!("Invalid Gmail base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| MailApiError::Transport("Gmail base url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn list_page(
        &self,
        query: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<ListMessagesResponse, MailApiError> {
        self.rate_limiter
            .acquire(GMAIL_API_QUOTA.messages_list)
            .await;

        let mut params = vec![
            ("q", query.to_string()),
            ("maxResults", page_size.to_string()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }

        let resp = self
            .http_client
            .get(self.gmail_url(&["messages"])?)
            .query(&params)
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        decode_json(check_status(resp).await?).await
    }
}

#[async_trait]
impl MailSource for GmailClient {
    async fn list_message_ids(&self, query: &str, max: u32) -> Result<Vec<String>, MailApiError> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        while (ids.len() as u32) < max {
            let remaining = max - ids.len() as u32;
            let page = self
                .list_page(
                    query,
                    remaining.min(MAX_MESSAGES_PER_PAGE),
                    page_token.as_deref(),
                )
                .await?;

            ids.extend(
                page.messages
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|m| m.id),
            );

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        ids.truncate(max as usize);
        Ok(ids)
    }

    async fn get_message_detail(&self, message_id: &str) -> Result<MessageDetail, MailApiError> {
        self.rate_limiter
            .acquire(GMAIL_API_QUOTA.messages_get)
            .await;

        let resp = self
            .http_client
            .get(self.gmail_url(&["messages", message_id])?)
            .query(&[("format", "full")])
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        let message: GmailMessage = decode_json(check_status(resp).await?).await?;
        Ok(MessageDetail::from_gmail_message(message))
    }

    async fn modify_labels(
        &self,
        message_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<(), MailApiError> {
        self.rate_limiter
            .acquire(GMAIL_API_QUOTA.messages_modify)
            .await;

        let body = ModifyMessageRequest {
            add_label_ids: Some(add.to_vec()),
            remove_label_ids: Some(remove.to_vec()),
        };

        let resp = self
            .http_client
            .post(self.gmail_url(&["messages", message_id, "modify"])?)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;

        check_status(resp).await?;
        Ok(())
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), MailApiError> {
        self.rate_limiter
            .acquire(GMAIL_API_QUOTA.messages_delete)
            .await;

        let resp = self
            .http_client
            .delete(self.gmail_url(&["messages", message_id])?)
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        check_status(resp).await?;
        Ok(())
    }
}

async fn check_status(resp: Response) -> Result<Response, MailApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let text = resp.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<GmailApiError>(&text) {
        Ok(err) => err.error.message,
        Err(_) if !text.trim().is_empty() => text.chars().take(500).collect(),
        Err(_) => status
            .canonical_reason()
            .unwrap_or("Unknown error")
            .to_string(),
    };

    tracing::debug!("Gmail API error {}: {}", status, message);
    Err(MailApiError::Status {
        status: status.as_u16(),
        message,
    })
}

async fn decode_json<T: DeserializeOwned>(resp: Response) -> Result<T, MailApiError> {
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| MailApiError::Decode(e.to_string()))
}
