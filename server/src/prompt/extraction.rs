use std::sync::Arc;

use axum::async_trait;
use derive_more::Display;
use indoc::formatdoc;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::{rate_limiters::RateLimiters, server_config::ExtractionConfig, HttpClient};

use super::chat::{ChatApiError, ChatApiResponseOrError, ChatMessage, ChatRequest, ResponseFormat};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionItem {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, alias = "due_date", skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extraction {
    pub summary: String,
    #[serde(default, alias = "action_items")]
    pub action_items: Vec<ActionItem>,
    #[serde(default)]
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum ExtractionError {
    #[display("Extraction request failed: {_0}")]
    Transport(String),
    #[display("Extraction service returned {status}: {message}")]
    Status { status: u16, message: String },
    #[display("Extraction service rate limit exceeded")]
    RateLimited,
    #[display("Extraction timed out")]
    Timeout,
    #[display("Extraction service error: {_0}")]
    Api(String),
    #[display("Malformed extraction response: {_0}")]
    MalformedResponse(String),
}

impl std::error::Error for ExtractionError {}

impl From<reqwest::Error> for ExtractionError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ExtractionError::Timeout
        } else {
            ExtractionError::Transport(e.to_string())
        }
    }
}

/// Turns one email into a summary, action items and topics.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        content: &str,
        subject: &str,
        sender: &str,
    ) -> Result<Extraction, ExtractionError>;
}

pub fn system_prompt() -> String {
    formatdoc! {r#"
        You are a helpful assistant that reads emails and extracts what the recipient needs to know.
        Analyze the email and respond with a JSON object with exactly these fields:
        - summary: two or three sentences summarizing the email
        - action_items: an array of tasks the recipient should complete, each with
          - title: a brief, actionable title
          - description: additional context (optional)
          - due_date: any mentioned deadline in ISO 8601 format YYYY-MM-DD (optional)
          - priority: "high", "medium", or "low" based on urgency indicators (optional)
        - topics: an array of short topic keywords

        If there are no action items, return an empty array.
        Respond only with the JSON object. Do not provide explanations."#}
}

pub fn extraction_user_prompt(subject: &str, sender: &str, body: &str) -> String {
    formatdoc! {r#"
        Extract the summary, action items and topics from the following email.
        <subject>{subject}</subject>
        <sender>{sender}</sender>
        <body>{body}</body>"#}
}

/// Keeps at most `max_chars` characters, cutting on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Parses the model answer, tolerating a fenced code block around the JSON.
pub fn parse_extraction(content: &str) -> Result<Extraction, ExtractionError> {
    let trimmed = content.trim();
    let json = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str::<Extraction>(json)
        .map_err(|e| ExtractionError::MalformedResponse(format!("{e}: {}", truncate_chars(json, 200))))
}

fn is_rate_limit_message(error: &ChatApiError) -> bool {
    error.message.to_lowercase().contains("rate limit")
}

/// Extractor backed by a chat completions endpoint.
#[derive(Clone)]
pub struct ChatExtractor {
    http_client: HttpClient,
    config: Arc<ExtractionConfig>,
    rate_limiters: RateLimiters,
}

impl ChatExtractor {
    pub fn new(
        http_client: HttpClient,
        config: Arc<ExtractionConfig>,
        rate_limiters: RateLimiters,
    ) -> Self {
        Self {
            http_client,
            config,
            rate_limiters,
        }
    }

    async fn send_prompt(
        &self,
        content: &str,
        subject: &str,
        sender: &str,
    ) -> Result<Extraction, ExtractionError> {
        let body = truncate_chars(content, self.config.max_body_chars);
        let request = ChatRequest {
            model: &self.config.model,
            temperature: self.config.temperature,
            messages: vec![
                ChatMessage::system(system_prompt()),
                ChatMessage::user(extraction_user_prompt(subject, sender, body)),
            ],
            response_format: ResponseFormat::json_object(),
        };

        let resp = self
            .http_client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        let parsed = serde_json::from_str::<ChatApiResponseOrError>(&text);

        if status == StatusCode::TOO_MANY_REQUESTS {
            self.rate_limiters.trigger_backoff();
            return Err(ExtractionError::RateLimited);
        }

        if !status.is_success() {
            let message = match parsed {
                Ok(ChatApiResponseOrError::Error(error))
                | Ok(ChatApiResponseOrError::NestedError { error }) => error.message,
                _ => truncate_chars(&text, 500).to_string(),
            };
            return Err(ExtractionError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let parsed = parsed
            .map_err(|e| {
                ExtractionError::MalformedResponse(format!("Could not parse chat response: {e}"))
            })?
            .into_result()
            .map_err(|error| {
                if is_rate_limit_message(&error) {
                    self.rate_limiters.trigger_backoff();
                    ExtractionError::RateLimited
                } else {
                    ExtractionError::Api(error.message)
                }
            })?;

        tracing::debug!(
            "Extraction used {} tokens ({})",
            parsed.usage.total_tokens,
            self.rate_limiters.get_status()
        );

        let choice = parsed
            .choices
            .first()
            .ok_or_else(|| ExtractionError::MalformedResponse("No choices in response".to_string()))?;

        parse_extraction(&choice.message.content)
    }
}

#[async_trait]
impl Extractor for ChatExtractor {
    async fn extract(
        &self,
        content: &str,
        subject: &str,
        sender: &str,
    ) -> Result<Extraction, ExtractionError> {
        // The timeout covers the request only, not time spent waiting on limits
        self.rate_limiters.acquire_one().await;

        tokio::time::timeout(
            self.config.timeout(),
            self.send_prompt(content, subject, sender),
        )
        .await
        .map_err(|_| ExtractionError::Timeout)?
    }
}
