use base64::{
    alphabet,
    engine::{general_purpose::STANDARD_NO_PAD, DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use serde::{Deserialize, Serialize};

pub const NO_CONTENT: &str = "(no content)";
pub const FAILED_EXTRACTION: &str = "(failed to extract body)";

/// Gmail encodes part bodies as base64url, with or without padding.
const GMAIL_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub payload: Option<MessagePart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub headers: Vec<MessageHeader>,
    #[serde(default)]
    pub body: Option<PartBody>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartBody {
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub attachment_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageHeader {
    pub name: String,
    pub value: String,
}

/// Plain text body of a message. Failure and absence stay distinguishable
/// from real content that happens to look like a placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum MessageBody {
    Text(String),
    Missing,
    Undecodable(String),
}

impl MessageBody {
    /// Text handed to the extraction service.
    pub fn prompt_text(&self) -> &str {
        match self {
            MessageBody::Text(text) => text,
            MessageBody::Missing => NO_CONTENT,
            MessageBody::Undecodable(_) => FAILED_EXTRACTION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDetail {
    pub id: String,
    pub thread_id: Option<String>,
    pub subject: String,
    pub sender: String,
    pub date: Option<String>,
    pub body: MessageBody,
    pub snippet: String,
    pub label_ids: Vec<String>,
}

impl MessageDetail {
    pub fn from_gmail_message(msg: GmailMessage) -> Self {
        let header = |name: &str| {
            msg.payload
                .as_ref()
                .and_then(|p| {
                    p.headers
                        .iter()
                        .find(|h| h.name.eq_ignore_ascii_case(name))
                })
                .map(|h| h.value.clone())
        };

        let subject = header("Subject").unwrap_or_default();
        let sender = header("From").unwrap_or_default();
        let date = header("Date");
        let body = msg
            .payload
            .as_ref()
            .map_or(MessageBody::Missing, extract_body);

        MessageDetail {
            id: msg.id,
            thread_id: msg.thread_id,
            subject,
            sender,
            date,
            body,
            snippet: msg.snippet.unwrap_or_default(),
            label_ids: msg.label_ids,
        }
    }
}

/// Direct payload body first, then the first `text/plain` part in depth-first
/// order, otherwise `Missing`.
pub fn extract_body(payload: &MessagePart) -> MessageBody {
    if let Some(data) = body_data(payload) {
        return decode_body(data);
    }

    match find_plain_text(&payload.parts) {
        Some(data) => decode_body(data),
        None => MessageBody::Missing,
    }
}

fn body_data(part: &MessagePart) -> Option<&str> {
    part.body
        .as_ref()
        .and_then(|b| b.data.as_deref())
        .filter(|d| !d.is_empty())
}

fn find_plain_text(parts: &[MessagePart]) -> Option<&str> {
    for part in parts {
        let is_plain = part
            .mime_type
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case("text/plain"));
        if is_plain {
            if let Some(data) = body_data(part) {
                return Some(data);
            }
        }
        if let Some(data) = find_plain_text(&part.parts) {
            return Some(data);
        }
    }
    None
}

fn decode_body(data: &str) -> MessageBody {
    let bytes = GMAIL_BASE64
        .decode(data.trim())
        .or_else(|_| STANDARD_NO_PAD.decode(data.trim().trim_end_matches('=')));

    match bytes {
        // Non UTF-8 charsets still carry useful text for summarization
        Ok(bytes) => MessageBody::Text(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            tracing::debug!("Could not decode message body: {:?}", e);
            MessageBody::Undecodable(e.to_string())
        }
    }
}
