//! Batched, concurrency-limited, retrying, validating LLM dispatcher
//! (`spec.md` §4.4).

mod client;
mod dispatcher;
mod error;
mod repair;
mod replay;
mod retry;
mod types;
mod validator;

pub use client::{CompletionResponse, LlmClient, OpenAiClient};
pub use dispatcher::{BatchOutcome, Dispatcher, DispatcherConfig};
pub use error::{LlmError, Result};
pub use repair::parse_repaired;
pub use replay::{AttemptRecord, CallLogRecord, CallLogRequest, CallLogResponse, ReplayCache, TokenUsage};
pub use retry::RetryConfig;
pub use types::{AggregationResult, BatchMergeResult, ExistingEventAssignment, MergeSuggestion, NewEventProposal};
pub use validator::{validate_and_fix, DroppedUnknownEvent, ValidationOutcome};
