//! Domain entities for the aggregation/merge pipeline.
//!
//! These are plain records, not an ORM's active-record objects — the
//! engines mutate copies and hand them back to a store implementation
//! rather than relying on implicit change tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single upstream news item. Input-only to the core: nothing in
/// this workspace ever mutates a `NewsItem`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItem {
    pub id: i64,
    pub source_type: String,
    pub title: String,
    pub body: String,
    /// Free-form, possibly comma-joined city names.
    pub city_name: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub url: Option<String>,
}

impl NewsItem {
    /// Split `city_name` into individual, trimmed tokens.
    pub fn city_tokens(&self) -> Vec<String> {
        self.city_name
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Sentiment assigned to an event by the LLM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

/// Lifecycle state of an `Event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i16)]
pub enum EventStatus {
    Active = 1,
    Merged = 2,
    Deleted = 3,
}

/// An aggregated cluster of news items believed to describe the same
/// underlying happening.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub event_type: String,
    pub sentiment: Sentiment,
    /// Opaque JSON blob; the core never interprets its shape.
    pub entities: String,
    /// Comma-joined, de-duplicated set — see `aggr_regions`.
    pub regions: String,
    /// Comma-joined, de-duplicated set.
    pub keywords: String,
    pub confidence: f32,
    pub news_count: i64,
    pub first_news_time: DateTime<Utc>,
    pub last_news_time: DateTime<Utc>,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// How a `NewsEventRelation` came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    AssignedToExisting,
    AssignedToNew,
    BatchMerge,
}

/// Association between a `NewsItem` and the `Event` it was assigned to.
/// Unique on `(news_id, event_id)` — the single source of truth for
/// assignment idempotency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsEventRelation {
    pub news_id: i64,
    pub event_id: i64,
    pub relation_type: RelationType,
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
}

/// How a child event relates to the parent it was merged into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRelationType {
    BatchMerge,
    Continuation,
    Evolution,
}

/// One row of the merge ledger: `child_event_id` was absorbed into
/// `parent_event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHistoryRelation {
    pub parent_event_id: i64,
    pub child_event_id: i64,
    pub relation_type: HistoryRelationType,
    pub confidence: f32,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Which engine/task produced a `ProcessingLog` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Aggregation,
    Merge,
    Labeling,
    IngestionValidation,
    Cleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialSuccess,
    Failed,
}

/// A run record persisted once per Aggregation/Merge invocation, making
/// a post-mortem possible without re-running the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLog {
    pub task_type: TaskType,
    pub task_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: RunStatus,
    pub total: i64,
    pub success: i64,
    pub failed: i64,
    pub error_message: Option<String>,
    /// Resolved runtime configuration at the time of the run (batch
    /// size, concurrency, model, thresholds) so a post-mortem does not
    /// need to guess what configuration produced a given outcome.
    pub config_snapshot: serde_json::Value,
}

/// A time window filter shared by Aggregation Engine queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn city_tokens_trims_and_drops_empty() {
        let item = NewsItem {
            id: 1,
            source_type: "baidu".into(),
            title: "t".into(),
            body: "b".into(),
            city_name: Some(" Beijing ,, Shanghai".into()),
            first_seen_at: Utc::now(),
            url: None,
        };
        assert_eq!(item.city_tokens(), vec!["Beijing", "Shanghai"]);
    }

    #[test]
    fn city_tokens_empty_when_absent() {
        let item = NewsItem {
            id: 1,
            source_type: "baidu".into(),
            title: "t".into(),
            body: "b".into(),
            city_name: None,
            first_seen_at: Utc::now(),
            url: None,
        };
        assert!(item.city_tokens().is_empty());
    }
}
