use anyhow::Context;
use axum::async_trait;
use entity::{prelude::*, processed_message};
use sea_orm::{
    sea_query::OnConflict, ActiveValue::Set, ColumnTrait, ConnectOptions, ConnectionTrait,
    Database, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
    Schema,
};

use super::{ProcessedRecord, RecordStore};

/// Postgres backed record store.
#[derive(Debug, Clone)]
pub struct SeaOrmRecordStore {
    conn: DatabaseConnection,
}

impl SeaOrmRecordStore {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub async fn connect(db_url: &str) -> anyhow::Result<Self> {
        let mut db_options = ConnectOptions::new(db_url);
        db_options.sqlx_logging(false);

        let conn = Database::connect(db_options)
            .await
            .context("Database connection failed")?;
        let store = Self::new(conn);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Creates the `processed_message` table if it is missing.
    pub async fn ensure_schema(&self) -> Result<(), DbErr> {
        let backend = self.conn.get_database_backend();
        let schema = Schema::new(backend);
        let mut stmt = schema.create_table_from_entity(ProcessedMessage);
        stmt.if_not_exists();
        self.conn.execute(backend.build(&stmt)).await?;
        Ok(())
    }
}

fn into_record(model: processed_message::Model) -> anyhow::Result<ProcessedRecord> {
    let extraction = serde_json::from_value(model.extraction)
        .with_context(|| format!("Stored extraction for {} is unreadable", model.message_id))?;

    Ok(ProcessedRecord {
        user_email: model.user_email,
        message_id: model.message_id,
        subject: model.subject,
        sender: model.sender,
        extraction,
        processed_at: model.processed_at,
    })
}

#[async_trait]
impl RecordStore for SeaOrmRecordStore {
    async fn upsert(&self, record: ProcessedRecord) -> anyhow::Result<()> {
        let active = processed_message::ActiveModel {
            user_email: Set(record.user_email),
            message_id: Set(record.message_id),
            subject: Set(record.subject),
            sender: Set(record.sender),
            extraction: Set(serde_json::to_value(&record.extraction)?),
            processed_at: Set(record.processed_at),
        };

        ProcessedMessage::insert(active)
            .on_conflict(
                OnConflict::columns([
                    processed_message::Column::UserEmail,
                    processed_message::Column::MessageId,
                ])
                .update_columns([
                    processed_message::Column::Subject,
                    processed_message::Column::Sender,
                    processed_message::Column::Extraction,
                    processed_message::Column::ProcessedAt,
                ])
                .to_owned(),
            )
            .exec_without_returning(&self.conn)
            .await?;

        Ok(())
    }

    async fn list_for_user(
        &self,
        user_email: &str,
        limit: u64,
    ) -> anyhow::Result<Vec<ProcessedRecord>> {
        let models = ProcessedMessage::find()
            .filter(processed_message::Column::UserEmail.eq(user_email))
            .order_by_desc(processed_message::Column::ProcessedAt)
            .limit(limit)
            .all(&self.conn)
            .await?;

        models.into_iter().map(into_record).collect()
    }
}
