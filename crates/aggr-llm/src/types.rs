//! Named record types for parsed LLM results (`spec.md` §9: "Dynamic
//! dict-typed LLM results" → typed records; JSON parsing lives at the
//! boundary, the rest of the engine sees these).

use aggr_domain::Sentiment;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Top-level response to the aggregation prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregationResult {
    #[serde(default)]
    pub existing_events: Vec<ExistingEventAssignment>,
    #[serde(default)]
    pub new_events: Vec<NewEventProposal>,
}

impl AggregationResult {
    /// Union of every news id the LLM claims to have processed.
    pub fn processed_news_ids(&self) -> HashSet<i64> {
        let mut ids = HashSet::new();
        for e in &self.existing_events {
            ids.extend(e.news_ids.iter().copied());
        }
        for e in &self.new_events {
            ids.extend(e.news_ids.iter().copied());
        }
        ids
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistingEventAssignment {
    pub event_id: i64,
    pub news_ids: Vec<i64>,
    pub confidence: f32,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEventProposal {
    pub news_ids: Vec<i64>,
    pub title: String,
    pub summary: String,
    pub event_type: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub confidence: f32,
    #[serde(default)]
    pub priority: String,
    #[serde(default = "default_sentiment")]
    pub sentiment: Sentiment,
}

fn default_sentiment() -> Sentiment {
    Sentiment::Neutral
}

/// Top-level response to the batch-merge prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchMergeResult {
    #[serde(default)]
    pub merge_suggestions: Vec<MergeSuggestion>,
    #[serde(default)]
    pub analysis_summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeSuggestion {
    pub group_id: String,
    pub events_to_merge: Vec<i64>,
    pub primary_event_id: i64,
    pub confidence: f32,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub merged_title: Option<String>,
    #[serde(default)]
    pub merged_description: Option<String>,
    #[serde(default)]
    pub merged_keywords: Option<Vec<String>>,
    #[serde(default)]
    pub merged_regions: Option<Vec<String>>,
    #[serde(default)]
    pub analysis: serde_json::Value,
}
