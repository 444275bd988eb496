use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{
    auth::AuthedSession,
    email::{GmailClient, MailSource, MessageDetail},
    error::{AppError, AppJsonResult, AppResult},
    store::ProcessedRecord,
    ServerState,
};

const DEFAULT_PAGE_SIZE: u32 = 50;
const DEFAULT_PROCESSED_LIMIT: u64 = 50;
const MAX_PROCESSED_LIMIT: u64 = 500;

pub(crate) fn gmail_client(state: &ServerState, authed: &AuthedSession) -> GmailClient {
    GmailClient::new(
        state.http_client.clone(),
        state.config.gmail.api_base.clone(),
        authed.session.access_token.clone(),
    )
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub query: Option<String>,
    pub max: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageIdList {
    pub message_ids: Vec<String>,
}

pub async fn list_messages(
    State(state): State<ServerState>,
    authed: AuthedSession,
    Query(params): Query<ListParams>,
) -> AppJsonResult<MessageIdList> {
    let gmail = &state.config.gmail;
    let query = params.query.unwrap_or_else(|| gmail.default_query.clone());
    let max = params
        .max
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .min(gmail.max_results_cap);

    let message_ids = gmail_client(&state, &authed)
        .list_message_ids(&query, max)
        .await?;

    Ok(Json(MessageIdList { message_ids }))
}

pub async fn get_message(
    State(state): State<ServerState>,
    authed: AuthedSession,
    Path(id): Path<String>,
) -> AppJsonResult<MessageDetail> {
    let detail = gmail_client(&state, &authed).get_message_detail(&id).await?;
    Ok(Json(detail))
}

#[derive(Debug, Deserialize)]
pub struct LabelChange {
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

pub async fn modify_labels(
    State(state): State<ServerState>,
    authed: AuthedSession,
    Path(id): Path<String>,
    body: Result<Json<LabelChange>, JsonRejection>,
) -> AppResult<StatusCode> {
    let Json(change) = body?;
    if change.add.is_empty() && change.remove.is_empty() {
        return Err(AppError::BadRequest(
            "At least one label to add or remove is required".to_string(),
        ));
    }

    gmail_client(&state, &authed)
        .modify_labels(&id, &change.add, &change.remove)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_message(
    State(state): State<ServerState>,
    authed: AuthedSession,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    gmail_client(&state, &authed).delete_message(&id).await?;
    tracing::info!("Deleted message {} for {}", id, authed.session.identity.email);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ProcessedParams {
    pub limit: Option<u64>,
}

pub async fn list_processed(
    State(state): State<ServerState>,
    authed: AuthedSession,
    Query(params): Query<ProcessedParams>,
) -> AppJsonResult<Vec<ProcessedRecord>> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_PROCESSED_LIMIT)
        .min(MAX_PROCESSED_LIMIT);

    let records = state
        .records
        .list_for_user(&authed.session.identity.email, limit)
        .await?;

    Ok(Json(records))
}
