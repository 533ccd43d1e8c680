//! Aggregation Engine and Merge Engine orchestration (`spec.md` §4.5,
//! §4.6). Both engines are generic over an [`aggr_domain::AggregationStore`]
//! and an [`aggr_llm::LlmClient`] so tests can swap in
//! `aggr_store_postgres::InMemoryStore` and a scripted client without a
//! database or network access.

mod aggregation;
mod merge;

pub use aggregation::{AggregationEngine, AggregationEngineConfig};
pub use merge::{MergeEngine, MergeEngineConfig};
