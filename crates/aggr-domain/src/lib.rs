//! # Aggregation Domain
//!
//! Entity shapes (`spec.md` §3) and the persistence contract (§6) that
//! the Aggregation Engine and Merge Engine consume and produce.
//!
//! This crate defines *what* is stored and the trait boundary for
//! *how* it is stored; concrete storage backends (Postgres, in-memory
//! fakes) live in their own crates and implement [`traits::AggregationStore`].

pub mod error;
pub mod run;
pub mod traits;
pub mod types;

pub use error::{DomainError, Result};
pub use run::{AggregationRunSummary, FailedMerge, MergeRunSummary, RunWarning};
pub use traits::{
    AcceptedMerge, AggregationStore, AggregationWriter, AssignmentDecision, EventReader,
    HistoryReader, MergeWriter, NewsReader, PersistOutcome, ProcessingLogWriter, RelationReader,
};
pub use types::{
    Event, EventHistoryRelation, EventStatus, HistoryRelationType, NewsEventRelation, NewsItem,
    ProcessingLog, RelationType, RunStatus, Sentiment, TaskType, TimeWindow,
};
