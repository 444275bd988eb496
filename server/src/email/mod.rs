pub mod client;
pub mod message;

pub use client::{GmailClient, MailApiError, MailSource};
pub use message::{MessageBody, MessageDetail};
