use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::{
    auth::AuthedSession,
    error::AppJsonResult,
    pipeline::{BatchRequest, BatchResult, ValidationError},
    ServerState,
};

use super::email::gmail_client;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchBody {
    pub message_ids: Vec<String>,
    pub chunk_size: Option<i64>,
    #[serde(default)]
    pub persist: bool,
}

/// Runs a batch with the session made valid up front. The token is not
/// refreshed while the batch runs, so a mid-batch expiry fails the remaining
/// items individually.
pub async fn submit_batch(
    State(state): State<ServerState>,
    authed: AuthedSession,
    body: Result<Json<BatchBody>, JsonRejection>,
) -> AppJsonResult<BatchResult> {
    let Json(body) = body?;
    if body.message_ids.is_empty() {
        return Err(ValidationError("messageIds must not be empty".to_string()).into());
    }

    let request = BatchRequest::new(
        authed.session.identity.clone(),
        body.message_ids,
        body.chunk_size,
        &state.config.batch,
    )?;
    let mail = gmail_client(&state, &authed);

    let cancel = CancellationToken::new();
    let run = state.orchestrator.run(&mail, &request, &cancel);
    tokio::pin!(run);

    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::time::sleep(state.config.batch.deadline()) => {
            tracing::warn!(
                "Batch for {} hit its deadline, cancelling",
                request.owner.email
            );
            cancel.cancel();
            run.await
        }
    }?;

    if body.persist {
        state
            .orchestrator
            .persist(state.records.as_ref(), &request.owner, &result)
            .await;
    }

    Ok(Json(result))
}
