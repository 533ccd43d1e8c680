//! Persistence contract (`spec.md` §6 / §9 "global service singletons").
//!
//! Split into focused traits the way `extraction::traits::store` splits
//! `PageCache`/`SummaryCache`/`EmbeddingStore`, so a caller depends only
//! on the slice it needs and a test fake only has to implement that
//! slice. `AggregationStore` is the composite the engines actually take.
//!
//! Each mutating method here is the transactional unit described in
//! `spec.md` §4.5/§4.6 ("persist decisions inside a per-result
//! transaction" / "`executeBatchMerge` ... transactionally"): the
//! trait boundary *is* the transaction boundary. A `Postgres`
//! implementation opens one `sqlx` transaction per call; an in-memory
//! fake can just hold a lock for the duration. Callers never see a
//! partially applied batch or merge.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    Event, EventHistoryRelation, NewsEventRelation, NewsItem, ProcessingLog, TimeWindow,
};

/// Read access to the upstream news stream. The core never writes here.
#[async_trait]
pub trait NewsReader: Send + Sync {
    /// News items in `window` (if given) restricted to `source_types`
    /// (if non-empty) that have **no** `NewsEventRelation` row,
    /// ordered by `first_seen_at` descending. Items whose `source_type`
    /// is in `excluded_types` are never returned.
    async fn unprocessed_news(
        &self,
        window: Option<TimeWindow>,
        source_types: &[String],
        excluded_types: &[String],
    ) -> Result<Vec<NewsItem>>;

    /// Fetch specific news items by id (used for straggler re-dispatch).
    async fn news_by_ids(&self, ids: &[i64]) -> Result<Vec<NewsItem>>;
}

/// Read access to events used to build aggregation/merge context.
#[async_trait]
pub trait EventReader: Send + Sync {
    /// The `n` most recently created active events.
    async fn recent_active_events(&self, n: usize) -> Result<Vec<Event>>;

    /// Distinct active events already associated with news in `window`
    /// restricted to `source_types`, so already-processed in-window
    /// news contribute their events as context (`spec.md` §4.5 step 2).
    async fn events_for_news_in_window(
        &self,
        window: TimeWindow,
        source_types: &[String],
    ) -> Result<Vec<Event>>;

    async fn events_by_ids(&self, ids: &[i64]) -> Result<Vec<Event>>;
}

/// One assignment decision to persist: a news id attached to an
/// existing event, or a brand new event plus its first news ids.
#[derive(Debug, Clone)]
pub enum AssignmentDecision {
    ToExisting {
        event_id: i64,
        news_ids: Vec<i64>,
        confidence: f32,
        merged_regions: String,
    },
    ToNew {
        new_event: Event,
        news_ids: Vec<i64>,
        confidence: f32,
    },
}

/// Outcome of persisting one batch of assignment decisions.
#[derive(Debug, Clone, Default)]
pub struct PersistOutcome {
    /// news ids that ended up with a relation row after this call
    /// (whether newly inserted or already present — idempotent).
    pub persisted_news_ids: Vec<i64>,
    /// ids of events newly created by a `ToNew` decision, in order.
    pub created_event_ids: Vec<i64>,
}

/// Write access used by the Aggregation Engine.
#[async_trait]
pub trait AggregationWriter: Send + Sync {
    /// Apply one batch of assignment decisions transactionally.
    /// Re-applying the same decisions (e.g. after a crash-and-retry)
    /// must be a no-op on the relation rows — the unique constraint on
    /// `(news_id, event_id)` makes this idempotent by construction.
    async fn persist_assignments(&self, decisions: &[AssignmentDecision]) -> Result<PersistOutcome>;
}

/// One accepted batch-merge decision, ready to execute.
#[derive(Debug, Clone)]
pub struct AcceptedMerge {
    pub primary_event_id: i64,
    pub child_event_ids: Vec<i64>,
    pub confidence: f32,
    pub reason: String,
    pub merged_title: Option<String>,
    pub merged_description: Option<String>,
    pub merged_keywords: Option<Vec<String>>,
    pub merged_regions: Option<Vec<String>>,
}

/// Write access used by the Merge Engine.
#[async_trait]
pub trait MergeWriter: Send + Sync {
    /// Execute one accepted merge suggestion transactionally
    /// (`executeBatchMerge`, `spec.md` §4.6). On any error the whole
    /// suggestion is rolled back; other suggestions are unaffected.
    async fn execute_merge(&self, merge: &AcceptedMerge, now: DateTime<Utc>) -> Result<Event>;
}

/// Run-record persistence (`ProcessingLog`, `spec.md` §3/§7).
#[async_trait]
pub trait ProcessingLogWriter: Send + Sync {
    async fn write_log(&self, log: &ProcessingLog) -> Result<()>;
}

/// Read access to the merge ledger, for invariant checks / tooling.
#[async_trait]
pub trait HistoryReader: Send + Sync {
    async fn history_for_event(&self, event_id: i64) -> Result<Vec<EventHistoryRelation>>;
}

/// Read access to relations, for invariant checks / tooling.
#[async_trait]
pub trait RelationReader: Send + Sync {
    async fn relations_for_event(&self, event_id: i64) -> Result<Vec<NewsEventRelation>>;
    async fn relations_for_news(&self, news_id: i64) -> Result<Vec<NewsEventRelation>>;
}

/// Composite store the engines depend on. Any type implementing all
/// the focused traits gets this for free, mirroring
/// `extraction::traits::store::PageStore`'s blanket impl.
pub trait AggregationStore:
    NewsReader
    + EventReader
    + AggregationWriter
    + MergeWriter
    + ProcessingLogWriter
    + HistoryReader
    + RelationReader
{
}

impl<T> AggregationStore for T where
    T: NewsReader
        + EventReader
        + AggregationWriter
        + MergeWriter
        + ProcessingLogWriter
        + HistoryReader
        + RelationReader
{
}
