use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    auth::Identity,
    email::MailSource,
    prompt::{Extraction, Extractor},
    server_config::BatchConfig,
    store::{ProcessedRecord, RecordStore},
};

use super::{
    chunked::{pacer_from_config, run_chunked, Pacer},
    ValidationError,
};

pub const CANCELLED_MESSAGE: &str = "batch cancelled";

/// Message ids to process for one mailbox owner. Ids keep their order and
/// duplicates are processed independently.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub owner: Identity,
    pub message_ids: Vec<String>,
    pub chunk_size: usize,
}

impl BatchRequest {
    pub fn new(
        owner: Identity,
        message_ids: Vec<String>,
        chunk_size: Option<i64>,
        limits: &BatchConfig,
    ) -> Result<Self, ValidationError> {
        let chunk_size = match chunk_size {
            None => limits.default_chunk_size,
            Some(size) if size <= 0 => {
                return Err(ValidationError(format!(
                    "chunkSize must be a positive integer, got {size}"
                )))
            }
            Some(size) => size as usize,
        };

        if chunk_size > limits.max_chunk_size {
            return Err(ValidationError(format!(
                "chunkSize must be at most {}",
                limits.max_chunk_size
            )));
        }

        Ok(Self {
            owner,
            message_ids,
            chunk_size,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ItemOutcome {
    #[serde(rename_all = "camelCase")]
    Success {
        message_id: String,
        subject: String,
        sender: String,
        extraction: Extraction,
    },
    #[serde(rename_all = "camelCase")]
    Failure {
        message_id: String,
        error_message: String,
    },
}

impl ItemOutcome {
    pub fn message_id(&self) -> &str {
        match self {
            ItemOutcome::Success { message_id, .. } | ItemOutcome::Failure { message_id, .. } => {
                message_id
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Success { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub processed_count: usize,
    pub outcomes: Vec<ItemOutcome>,
    pub completed_at: DateTime<Utc>,
}

impl BatchResult {
    fn from_outcomes(outcomes: Vec<ItemOutcome>) -> Self {
        Self {
            processed_count: outcomes.len(),
            outcomes,
            completed_at: Utc::now(),
        }
    }

    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }
}

/// Fetches and extracts every message of a batch, one chunk at a time.
#[derive(Clone)]
pub struct BatchOrchestrator {
    extractor: Arc<dyn Extractor>,
    pacer: Arc<dyn Pacer>,
    item_timeout: Duration,
}

impl BatchOrchestrator {
    pub fn new(extractor: Arc<dyn Extractor>, pacer: Arc<dyn Pacer>, item_timeout: Duration) -> Self {
        Self {
            extractor,
            pacer,
            item_timeout,
        }
    }

    pub fn from_config(extractor: Arc<dyn Extractor>, config: &BatchConfig) -> Self {
        Self::new(
            extractor,
            pacer_from_config(&config.pacing),
            config.item_timeout(),
        )
    }

    /// One outcome per requested id. Items skipped by cancellation are
    /// reported as failures rather than dropped.
    pub async fn run(
        &self,
        mail: &dyn MailSource,
        request: &BatchRequest,
        cancel: &CancellationToken,
    ) -> Result<BatchResult, ValidationError> {
        let total = request.message_ids.len();
        tracing::info!(
            "Starting batch of {} messages for {} (chunk size {})",
            total,
            request.owner.email,
            request.chunk_size
        );

        let run = run_chunked(
            request.message_ids.clone(),
            request.chunk_size,
            self.pacer.as_ref(),
            cancel,
            |message_id| self.process_item(mail, message_id, cancel),
        )
        .await?;

        let mut outcomes = run.completed;
        if !run.remaining.is_empty() {
            tracing::warn!(
                "Batch for {} cancelled with {} messages not started",
                request.owner.email,
                run.remaining.len()
            );
        }
        outcomes.extend(
            run.remaining
                .into_iter()
                .map(|message_id| ItemOutcome::Failure {
                    message_id,
                    error_message: CANCELLED_MESSAGE.to_string(),
                }),
        );

        let result = BatchResult::from_outcomes(outcomes);
        tracing::info!(
            "Finished batch for {}: {}/{} succeeded",
            request.owner.email,
            result.success_count(),
            result.processed_count
        );
        Ok(result)
    }

    async fn process_item(
        &self,
        mail: &dyn MailSource,
        message_id: String,
        cancel: &CancellationToken,
    ) -> ItemOutcome {
        let work = async {
            let detail = mail
                .get_message_detail(&message_id)
                .await
                .map_err(|e| e.to_string())?;
            let extraction = self
                .extractor
                .extract(detail.body.prompt_text(), &detail.subject, &detail.sender)
                .await
                .map_err(|e| e.to_string())?;
            Ok::<_, String>((detail, extraction))
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CANCELLED_MESSAGE.to_string()),
            res = tokio::time::timeout(self.item_timeout, work) => res.unwrap_or_else(|_| {
                Err(format!("timed out after {} ms", self.item_timeout.as_millis()))
            }),
        };

        match result {
            Ok((detail, extraction)) => ItemOutcome::Success {
                message_id,
                subject: detail.subject,
                sender: detail.sender,
                extraction,
            },
            Err(error_message) => {
                tracing::warn!("Message {} failed: {}", message_id, error_message);
                ItemOutcome::Failure {
                    message_id,
                    error_message,
                }
            }
        }
    }

    /// Stores the successful outcomes. Failures to persist are logged only.
    pub async fn persist(&self, records: &dyn RecordStore, owner: &Identity, result: &BatchResult) {
        for outcome in &result.outcomes {
            let ItemOutcome::Success {
                message_id,
                subject,
                sender,
                extraction,
            } = outcome
            else {
                continue;
            };

            let record = ProcessedRecord {
                user_email: owner.email.clone(),
                message_id: message_id.clone(),
                subject: subject.clone(),
                sender: sender.clone(),
                extraction: extraction.clone(),
                processed_at: result.completed_at,
            };

            if let Err(e) = records.upsert(record).await {
                tracing::error!("Could not persist message {}: {:?}", message_id, e);
            }
        }
    }
}
