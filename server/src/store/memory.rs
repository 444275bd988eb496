use std::{collections::HashMap, sync::Arc};

use axum::async_trait;
use tokio::sync::RwLock;

use super::{ProcessedRecord, RecordStore};

#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    records: Arc<RwLock<HashMap<(String, String), ProcessedRecord>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert(&self, record: ProcessedRecord) -> anyhow::Result<()> {
        let key = (record.user_email.clone(), record.message_id.clone());
        self.records.write().await.insert(key, record);
        Ok(())
    }

    async fn list_for_user(
        &self,
        user_email: &str,
        limit: u64,
    ) -> anyhow::Result<Vec<ProcessedRecord>> {
        let records = self.records.read().await;
        let mut found = records
            .values()
            .filter(|r| r.user_email == user_email)
            .cloned()
            .collect::<Vec<_>>();
        found.sort_by(|a, b| b.processed_at.cmp(&a.processed_at));
        found.truncate(limit as usize);
        Ok(found)
    }
}
