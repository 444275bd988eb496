pub mod chat;
pub mod extraction;

pub use extraction::{ActionItem, ChatExtractor, Extraction, ExtractionError, Extractor};
