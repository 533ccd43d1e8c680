//! Merge Engine (`spec.md` §4.6).
//!
//! Analyses the most recently created active events with a single LLM
//! call, filters and greedily de-conflicts the suggestions, and
//! executes each accepted one transactionally via
//! [`aggr_domain::MergeWriter::execute_merge`] — the merged-field
//! computation itself lives in the store implementation, not here.

use std::collections::HashSet;
use std::time::Instant;

use chrono::Utc;
use tracing::{instrument, warn};

use aggr_domain::{
    AcceptedMerge, AggregationStore, Event, FailedMerge, MergeRunSummary, ProcessingLog, Result,
    RunStatus, TaskType,
};
use aggr_llm::{BatchMergeResult, Dispatcher, LlmClient, MergeSuggestion};
use aggr_prompts::format_batch_merge_prompt;

#[derive(Debug, Clone)]
pub struct MergeEngineConfig {
    /// `M` in "the `M` most recently created active Events" (step 1).
    pub recent_event_limit: usize,
    /// Minimum `confidence` a suggestion must carry to be considered.
    pub confidence_threshold: f32,
}

impl Default for MergeEngineConfig {
    fn default() -> Self {
        Self {
            recent_event_limit: 30,
            confidence_threshold: 0.75,
        }
    }
}

pub struct MergeEngine<'a, S, C: LlmClient> {
    store: &'a S,
    dispatcher: &'a Dispatcher<C>,
    config: MergeEngineConfig,
}

impl<'a, S: AggregationStore, C: LlmClient + 'static> MergeEngine<'a, S, C> {
    pub fn new(store: &'a S, dispatcher: &'a Dispatcher<C>, config: MergeEngineConfig) -> Self {
        Self {
            store,
            dispatcher,
            config,
        }
    }

    /// Run one LLM-driven merge analysis over the most recent active
    /// events (`spec.md` §4.6 steps 1-6).
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<MergeRunSummary> {
        let run_started_at = Utc::now();
        let timer = Instant::now();

        let events = self
            .store
            .recent_active_events(self.config.recent_event_limit)
            .await?;

        if events.len() < 2 {
            self.write_log(run_started_at, 0, 0, 0, RunStatus::Success)
                .await?;
            return Ok(MergeRunSummary {
                suggestions_count: 0,
                merged_count: 0,
                failed_count: 0,
                duration: timer.elapsed(),
                failed_merges: Vec::new(),
            });
        }

        let prompt = format_batch_merge_prompt(&events);
        let template_hash = aggr_prompts::batch_merge_prompt_hash();
        let Some(raw) = self.dispatcher.call_single(&prompt, &template_hash).await else {
            self.write_log(run_started_at, 0, 0, 0, RunStatus::Failed)
                .await?;
            return Ok(MergeRunSummary {
                suggestions_count: 0,
                merged_count: 0,
                failed_count: 0,
                duration: timer.elapsed(),
                failed_merges: Vec::new(),
            });
        };

        let parsed: BatchMergeResult = match aggr_llm::parse_repaired(&raw) {
            Ok(v) => v,
            Err(reason) => {
                warn!(reason, "batch-merge response unparseable even after repair");
                self.write_log(run_started_at, 0, 0, 0, RunStatus::Failed)
                    .await?;
                return Ok(MergeRunSummary {
                    suggestions_count: 0,
                    merged_count: 0,
                    failed_count: 0,
                    duration: timer.elapsed(),
                    failed_merges: Vec::new(),
                });
            }
        };

        let known_ids: HashSet<i64> = events.iter().map(|e| e.id).collect();
        let accepted = self.select_suggestions(parsed.merge_suggestions, &known_ids);
        let suggestions_count = accepted.len();

        let (merged_count, failed_merges) = self.execute_all(accepted).await;
        let failed_count = failed_merges.len();

        let status = if failed_count == 0 {
            RunStatus::Success
        } else if merged_count > 0 {
            RunStatus::PartialSuccess
        } else {
            RunStatus::Failed
        };

        self.write_log(
            run_started_at,
            suggestions_count as i64,
            merged_count as i64,
            failed_count as i64,
            status,
        )
        .await?;

        Ok(MergeRunSummary {
            suggestions_count,
            merged_count,
            failed_count,
            duration: timer.elapsed(),
            failed_merges,
        })
    }

    /// Operator/test override: skip the LLM entirely, designate
    /// `event_ids[0]` as primary, and merge the rest at confidence 1.0.
    pub async fn manual_merge(&self, event_ids: Vec<i64>) -> Result<Event> {
        let now = Utc::now();
        let merge = AcceptedMerge {
            primary_event_id: event_ids[0],
            child_event_ids: event_ids[1..].to_vec(),
            confidence: 1.0,
            reason: "manual merge".to_string(),
            merged_title: None,
            merged_description: None,
            merged_keywords: None,
            merged_regions: None,
        };
        self.store.execute_merge(&merge, now).await
    }

    /// Steps 4-5: keep only well-formed, confident suggestions, then
    /// walk them confidence-descending, skipping any that names an
    /// event already consumed by a higher-confidence suggestion.
    fn select_suggestions(
        &self,
        suggestions: Vec<MergeSuggestion>,
        known_ids: &HashSet<i64>,
    ) -> Vec<AcceptedMerge> {
        let mut candidates: Vec<MergeSuggestion> = suggestions
            .into_iter()
            .filter(|s| s.confidence >= self.config.confidence_threshold)
            .filter(|s| s.events_to_merge.len() >= 2)
            .filter(|s| s.events_to_merge.iter().all(|id| known_ids.contains(id)))
            .filter(|s| known_ids.contains(&s.primary_event_id))
            .collect();

        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut consumed: HashSet<i64> = HashSet::new();
        let mut accepted = Vec::new();
        for suggestion in candidates {
            if suggestion
                .events_to_merge
                .iter()
                .any(|id| consumed.contains(id))
            {
                continue;
            }
            consumed.extend(suggestion.events_to_merge.iter().copied());

            let children: Vec<i64> = suggestion
                .events_to_merge
                .iter()
                .copied()
                .filter(|id| *id != suggestion.primary_event_id)
                .collect();
            if children.is_empty() {
                continue;
            }

            accepted.push(AcceptedMerge {
                primary_event_id: suggestion.primary_event_id,
                child_event_ids: children,
                confidence: suggestion.confidence,
                reason: suggestion.reason,
                merged_title: suggestion.merged_title,
                merged_description: suggestion.merged_description,
                merged_keywords: suggestion.merged_keywords,
                merged_regions: suggestion.merged_regions,
            });
        }
        accepted
    }

    /// Step 6: execute every accepted suggestion. Each is its own
    /// transaction; a failure in one does not affect the others.
    async fn execute_all(&self, accepted: Vec<AcceptedMerge>) -> (usize, Vec<FailedMerge>) {
        let now = Utc::now();
        let mut merged_count = 0;
        let mut failures = Vec::new();

        for merge in accepted {
            match self.store.execute_merge(&merge, now).await {
                Ok(_) => merged_count += 1,
                Err(e) => {
                    warn!(primary = merge.primary_event_id, error = %e, "merge execution failed");
                    failures.push(FailedMerge {
                        primary_event_id: merge.primary_event_id,
                        events_to_merge: merge.child_event_ids,
                        reason: e.to_string(),
                    });
                }
            }
        }

        (merged_count, failures)
    }

    async fn write_log(
        &self,
        start_time: chrono::DateTime<Utc>,
        total: i64,
        success: i64,
        failed: i64,
        status: RunStatus,
    ) -> Result<()> {
        let log = ProcessingLog {
            task_type: TaskType::Merge,
            task_id: uuid::Uuid::new_v4().to_string(),
            start_time,
            end_time: Utc::now(),
            status,
            total,
            success,
            failed,
            error_message: None,
            config_snapshot: serde_json::json!({
                "recent_event_limit": self.config.recent_event_limit,
                "confidence_threshold": self.config.confidence_threshold,
            }),
        };
        self.store.write_log(&log).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggr_domain::{EventStatus, Sentiment};
    use aggr_llm::{CompletionResponse, DispatcherConfig, LlmClient};
    use aggr_store_postgres::InMemoryStore;
    use async_trait::async_trait;

    struct ScriptedClient {
        response: String,
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn complete(
            &self,
            _prompt: &str,
            _model: &str,
            _temperature: f32,
            _max_tokens: u32,
        ) -> aggr_llm::Result<CompletionResponse> {
            Ok(CompletionResponse {
                text: self.response.clone(),
                prompt_tokens: Some(1),
                completion_tokens: Some(1),
            })
        }
    }

    fn event(id: i64, regions: &str) -> Event {
        Event {
            id,
            title: format!("event {id}"),
            description: "d".into(),
            event_type: "t".into(),
            sentiment: Sentiment::Neutral,
            entities: "{}".into(),
            regions: regions.into(),
            keywords: "k".into(),
            confidence: 0.8,
            news_count: 1,
            first_news_time: Utc::now(),
            last_news_time: Utc::now(),
            status: EventStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn dispatcher_config(dir: &std::path::Path) -> DispatcherConfig {
        DispatcherConfig {
            batch_size: 10,
            max_concurrent: 2,
            model: "test-model".into(),
            temperature: 0.0,
            max_tokens: 100,
            retry: aggr_llm::RetryConfig {
                attempts: 1,
                base_wait: std::time::Duration::from_millis(1),
                max_wait: std::time::Duration::from_millis(1),
            },
            debug_replay: false,
            llm_calls_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn fewer_than_two_events_short_circuits_without_llm_call() {
        let store = InMemoryStore::new();
        store.seed_events(vec![event(1, "Beijing")]);
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient {
            response: "{}".into(),
        };
        let dispatcher = Dispatcher::new(client, dispatcher_config(dir.path()));
        let engine = MergeEngine::new(&store, &dispatcher, MergeEngineConfig::default());

        let summary = engine.run().await.unwrap();
        assert_eq!(summary.suggestions_count, 0);
        assert_eq!(summary.merged_count, 0);
    }

    #[tokio::test]
    async fn accepted_suggestion_merges_child_into_primary() {
        let store = InMemoryStore::new();
        store.seed_events(vec![event(1, "Beijing"), event(2, "Shanghai")]);

        let response = r#"{"merge_suggestions":[{"group_id":"g1","events_to_merge":[1,2],"primary_event_id":1,"confidence":0.9,"reason":"same happening","merged_title":"Merged","merged_description":null,"merged_keywords":null,"merged_regions":null}],"analysis_summary":"s"}"#;
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient {
            response: response.into(),
        };
        let dispatcher = Dispatcher::new(client, dispatcher_config(dir.path()));
        let engine = MergeEngine::new(&store, &dispatcher, MergeEngineConfig::default());

        let summary = engine.run().await.unwrap();
        assert_eq!(summary.suggestions_count, 1);
        assert_eq!(summary.merged_count, 1);
        assert_eq!(summary.failed_count, 0);

        let primary = store.event(1).unwrap();
        assert_eq!(primary.title, "Merged");
        assert!(primary.regions.contains("Shanghai"));
        let child = store.event(2).unwrap();
        assert_eq!(child.status, EventStatus::Merged);
    }

    #[tokio::test]
    async fn low_confidence_suggestion_is_dropped() {
        let store = InMemoryStore::new();
        store.seed_events(vec![event(1, "Beijing"), event(2, "Shanghai")]);

        let response = r#"{"merge_suggestions":[{"group_id":"g1","events_to_merge":[1,2],"primary_event_id":1,"confidence":0.2,"reason":"weak"}],"analysis_summary":"s"}"#;
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient {
            response: response.into(),
        };
        let dispatcher = Dispatcher::new(client, dispatcher_config(dir.path()));
        let engine = MergeEngine::new(&store, &dispatcher, MergeEngineConfig::default());

        let summary = engine.run().await.unwrap();
        assert_eq!(summary.suggestions_count, 0);
        assert_eq!(summary.merged_count, 0);
    }

    #[tokio::test]
    async fn conflicting_suggestions_keep_only_the_higher_confidence_one() {
        let store = InMemoryStore::new();
        store.seed_events(vec![event(1, "A"), event(2, "B"), event(3, "C")]);

        let response = r#"{"merge_suggestions":[
            {"group_id":"g1","events_to_merge":[1,2],"primary_event_id":1,"confidence":0.8,"reason":"r1"},
            {"group_id":"g2","events_to_merge":[2,3],"primary_event_id":2,"confidence":0.95,"reason":"r2"}
        ],"analysis_summary":"s"}"#;
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient {
            response: response.into(),
        };
        let dispatcher = Dispatcher::new(client, dispatcher_config(dir.path()));
        let engine = MergeEngine::new(&store, &dispatcher, MergeEngineConfig::default());

        let summary = engine.run().await.unwrap();
        // g2 (confidence 0.95) wins and consumes event 2, so g1 conflicts and is skipped.
        assert_eq!(summary.suggestions_count, 1);
        assert_eq!(summary.merged_count, 1);
        assert_eq!(store.event(1).unwrap().status, EventStatus::Active);
        assert_eq!(store.event(2).unwrap().status, EventStatus::Active);
        assert_eq!(store.event(3).unwrap().status, EventStatus::Merged);
    }

    #[tokio::test]
    async fn manual_merge_skips_llm_and_merges_directly() {
        let store = InMemoryStore::new();
        store.seed_events(vec![event(1, "Beijing"), event(2, "Shanghai")]);
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient {
            response: "{}".into(),
        };
        let dispatcher = Dispatcher::new(client, dispatcher_config(dir.path()));
        let engine = MergeEngine::new(&store, &dispatcher, MergeEngineConfig::default());

        let primary = engine.manual_merge(vec![1, 2]).await.unwrap();
        assert_eq!(primary.id, 1);
        assert_eq!(store.event(2).unwrap().status, EventStatus::Merged);
    }
}
