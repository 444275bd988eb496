pub use super::processed_message::Entity as ProcessedMessage;
