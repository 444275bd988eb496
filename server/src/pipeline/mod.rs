pub mod chunked;
pub mod orchestrator;

use derive_more::Display;

pub use chunked::{run_chunked, ChunkedRun, FixedDelay, NoPacing, Pacer, TokenBucket};
pub use orchestrator::{BatchOrchestrator, BatchRequest, BatchResult, ItemOutcome};

/// A batch request that can never run, rejected before any work starts.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display("{_0}")]
pub struct ValidationError(pub String);

impl std::error::Error for ValidationError {}
