//! Run summaries returned by the Aggregation and Merge engines.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A non-fatal anomaly surfaced during a run but that did not abort it
/// — e.g. a duplicate `news_id` across LLM event entries. Modeled as a
/// first-class variant (not just a log line) so a caller can render it
/// structurally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunWarning {
    /// The same news id appeared in more than one LLM event entry;
    /// attribution went to the first in document order.
    DuplicateNewsAttribution { news_id: i64, kept_event_ref: String },
    /// The LLM named an event id that was not in the supplied context.
    UnknownEventReference { event_id: i64, news_ids: Vec<i64> },
    /// A batch's JSON could not be parsed even after the repair pass.
    UnparseableBatch { news_ids: Vec<i64> },
}

/// Outcome of a single Aggregation Engine run (`spec.md` §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationRunSummary {
    pub total_news: usize,
    pub processed_count: usize,
    pub failed_count: usize,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub failed_ids: Vec<i64>,
    pub warnings: Vec<RunWarning>,
}

/// Outcome of a single Merge Engine run (`spec.md` §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRunSummary {
    pub suggestions_count: usize,
    pub merged_count: usize,
    pub failed_count: usize,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub failed_merges: Vec<FailedMerge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedMerge {
    pub primary_event_id: i64,
    pub events_to_merge: Vec<i64>,
    pub reason: String,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u128(d.as_millis())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
