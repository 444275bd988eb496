use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One extracted message, keyed by the mailbox owner and the Gmail message id.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "processed_message")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub user_email: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub message_id: String,
    pub subject: String,
    pub sender: String,
    #[sea_orm(column_type = "JsonBinary")]
    pub extraction: Json,
    pub processed_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
