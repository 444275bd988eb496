pub mod memory;
pub mod sea;

use axum::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::prompt::Extraction;

pub use memory::MemoryRecordStore;
pub use sea::SeaOrmRecordStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedRecord {
    pub user_email: String,
    pub message_id: String,
    pub subject: String,
    pub sender: String,
    pub extraction: Extraction,
    pub processed_at: DateTime<Utc>,
}

/// Sink for processed messages, keyed by `(user_email, message_id)`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts the record or replaces the one with the same key.
    async fn upsert(&self, record: ProcessedRecord) -> anyhow::Result<()>;

    /// Most recently processed first.
    async fn list_for_user(
        &self,
        user_email: &str,
        limit: u64,
    ) -> anyhow::Result<Vec<ProcessedRecord>>;
}
