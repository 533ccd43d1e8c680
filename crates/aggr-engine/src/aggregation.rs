//! Aggregation Engine (`spec.md` §4.5).
//!
//! Selects unprocessed news, builds context from recently-created and
//! already-in-window events, dispatches to the LLM Dispatcher, persists
//! decisions transactionally, and recovers stragglers once more before
//! giving up on them.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use aggr_domain::{
    AggregationRunSummary, AggregationStore, AssignmentDecision, Event, EventStatus, NewsItem,
    ProcessingLog, Result, RunStatus, RunWarning, TaskType, TimeWindow,
};
use aggr_llm::{AggregationResult, BatchOutcome, Dispatcher, LlmClient, NewEventProposal};

/// Tunables for one Aggregation Engine run. The LLM batching/concurrency
/// knobs live on [`aggr_llm::DispatcherConfig`]; these are the
/// engine-level ones used in steps 1-2.
#[derive(Debug, Clone)]
pub struct AggregationEngineConfig {
    /// `N` in "the `N` most recently created Events" (step 2a).
    pub context_event_limit: usize,
    /// Restrict both news selection and context-event lookup to these
    /// `source_type`s; empty means no restriction.
    pub source_types: Vec<String>,
    /// News whose `source_type` is in this set is never selected, even
    /// if unprocessed (`EXCLUDED_NEWS_TYPES`, applied before selection).
    pub excluded_news_types: Vec<String>,
}

impl Default for AggregationEngineConfig {
    fn default() -> Self {
        Self {
            context_event_limit: 50,
            source_types: Vec::new(),
            excluded_news_types: Vec::new(),
        }
    }
}

pub struct AggregationEngine<'a, S, C: LlmClient> {
    store: &'a S,
    dispatcher: &'a Dispatcher<C>,
    cache: &'a aggr_cache::Cache,
    config: AggregationEngineConfig,
}

impl<'a, S: AggregationStore, C: LlmClient + 'static> AggregationEngine<'a, S, C> {
    pub fn new(
        store: &'a S,
        dispatcher: &'a Dispatcher<C>,
        cache: &'a aggr_cache::Cache,
        config: AggregationEngineConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            cache,
            config,
        }
    }

    /// Run one aggregation pass over `window` (or over all unprocessed
    /// news, if `window` is `None`).
    #[instrument(skip(self))]
    pub async fn run(&self, window: Option<TimeWindow>) -> Result<AggregationRunSummary> {
        let run_started_at = Utc::now();
        let timer = Instant::now();

        let news = self
            .store
            .unprocessed_news(
                window,
                &self.config.source_types,
                &self.config.excluded_news_types,
            )
            .await?;
        let total_news = news.len();

        if news.is_empty() {
            self.write_log(run_started_at, 0, 0, 0, RunStatus::Success)
                .await?;
            return Ok(AggregationRunSummary {
                total_news: 0,
                processed_count: 0,
                failed_count: 0,
                duration: timer.elapsed(),
                failed_ids: Vec::new(),
                warnings: Vec::new(),
            });
        }

        let context_events = self.build_context(window).await?;
        let known_event_ids: HashSet<i64> = context_events.iter().map(|e| e.id).collect();
        let events_by_id: HashMap<i64, &Event> = context_events.iter().map(|e| (e.id, e)).collect();
        let news_by_id: HashMap<i64, NewsItem> = news.iter().map(|n| (n.id, n.clone())).collect();

        let mut warnings = Vec::new();
        let (outcomes, dispatcher_residual) = self
            .dispatcher
            .process_news_concurrent(
                news.clone(),
                &context_events,
                &known_event_ids,
                CancellationToken::new(),
            )
            .await;

        let mut processed: HashSet<i64> = HashSet::new();
        let mut still_missing: HashSet<i64> = dispatcher_residual.into_iter().collect();

        for outcome in &outcomes {
            self.collect_warnings(outcome, &mut warnings);
            still_missing.extend(outcome.validation.missing_news.iter().copied());

            let decisions =
                self.decisions_from(&outcome.validation.fixed_result, &news_by_id, &events_by_id);
            if decisions.is_empty() {
                continue;
            }
            match self.store.persist_assignments(&decisions).await {
                Ok(persisted) => processed.extend(persisted.persisted_news_ids),
                Err(e) => {
                    warn!(error = %e, "failed to persist assignment batch, treating as missing");
                    still_missing.extend(outcome.news_ids.iter().copied());
                }
            }
        }
        still_missing.retain(|id| !processed.contains(id));

        // Straggler recovery (step 5): re-dispatch the still-missing
        // news at half the dispatcher's configured batch size. A second
        // miss is reported but not retried again.
        if !still_missing.is_empty() {
            let stragglers: Vec<NewsItem> = still_missing
                .iter()
                .filter_map(|id| news_by_id.get(id).cloned())
                .collect();
            let half_batch = (self.dispatcher.batch_size() / 2).max(1);

            let mut residual: HashSet<i64> = still_missing.clone();
            for chunk in stragglers.chunks(half_batch) {
                let (outcome, _missing_items) = self
                    .dispatcher
                    .process_batch(chunk, &context_events, &known_event_ids)
                    .await;
                let Some(outcome) = outcome else {
                    continue;
                };
                self.collect_warnings(&outcome, &mut warnings);
                let decisions = self.decisions_from(
                    &outcome.validation.fixed_result,
                    &news_by_id,
                    &events_by_id,
                );
                if decisions.is_empty() {
                    continue;
                }
                match self.store.persist_assignments(&decisions).await {
                    Ok(persisted) => {
                        for id in persisted.persisted_news_ids {
                            residual.remove(&id);
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to persist straggler batch"),
                }
            }
            still_missing = residual;
        }

        let processed_count = total_news - still_missing.len();
        let failed_count = still_missing.len();
        let mut failed_ids: Vec<i64> = still_missing.into_iter().collect();
        failed_ids.sort_unstable();

        let status = if failed_ids.is_empty() {
            RunStatus::Success
        } else if processed_count > 0 {
            RunStatus::PartialSuccess
        } else {
            RunStatus::Failed
        };

        self.write_log(
            run_started_at,
            total_news as i64,
            processed_count as i64,
            failed_count as i64,
            status,
        )
        .await?;

        Ok(AggregationRunSummary {
            total_news,
            processed_count,
            failed_count,
            duration: timer.elapsed(),
            failed_ids,
            warnings,
        })
    }

    /// Step 2: union of the `N` most recently created active events and
    /// the distinct events already associated with in-window news,
    /// de-duplicated by id. The recent-events half is advisory-cached
    /// (`spec.md` §4.1) so back-to-back runs in the same cadence window
    /// don't all pay for the same store query.
    async fn build_context(&self, window: Option<TimeWindow>) -> Result<Vec<Event>> {
        let cache_key = aggr_cache::recent_events_key(self.config.context_event_limit as u32);
        let recent = match self.cache.get::<Vec<Event>>(&cache_key) {
            Some(cached) => cached,
            None => {
                let fetched = self
                    .store
                    .recent_active_events(self.config.context_event_limit)
                    .await?;
                self.cache
                    .set(&cache_key, &fetched, aggr_cache::RECENT_EVENTS_TTL);
                fetched
            }
        };

        let mut seen: HashSet<i64> = recent.iter().map(|e| e.id).collect();
        let mut context = recent;

        if let Some(window) = window {
            let in_window = self
                .store
                .events_for_news_in_window(window, &self.config.source_types)
                .await?;
            for event in in_window {
                if seen.insert(event.id) {
                    context.push(event);
                }
            }
        }

        Ok(context)
    }

    /// Edge cases (b)/(c): surface validator-reported unknown-event
    /// drops and cross-entry duplicate news ids as `RunWarning`s.
    fn collect_warnings(&self, outcome: &BatchOutcome, warnings: &mut Vec<RunWarning>) {
        if outcome.unparseable {
            warnings.push(RunWarning::UnparseableBatch {
                news_ids: outcome.news_ids.clone(),
            });
        }
        for dropped in &outcome.validation.dropped_unknown_events {
            warnings.push(RunWarning::UnknownEventReference {
                event_id: dropped.event_id,
                news_ids: dropped.news_ids.clone(),
            });
        }
        for news_id in &outcome.validation.duplicate_news_ids {
            warnings.push(RunWarning::DuplicateNewsAttribution {
                news_id: *news_id,
                kept_event_ref: "first entry in document order".to_string(),
            });
        }
    }

    /// Step 4: translate a validated LLM result into assignment
    /// decisions, computing `merged_regions = regionMerger(event
    /// .regions, cities_of(news_ids))` for each entry along the way.
    fn decisions_from(
        &self,
        result: &AggregationResult,
        news_by_id: &HashMap<i64, NewsItem>,
        events_by_id: &HashMap<i64, &Event>,
    ) -> Vec<AssignmentDecision> {
        let mut decisions =
            Vec::with_capacity(result.existing_events.len() + result.new_events.len());

        for entry in &result.existing_events {
            let existing_regions = events_by_id
                .get(&entry.event_id)
                .map(|e| e.regions.as_str())
                .unwrap_or("");
            let cities = city_tokens_for(&entry.news_ids, news_by_id);
            let merged_regions = aggr_regions::merge_with_city_names(existing_regions, &cities);

            decisions.push(AssignmentDecision::ToExisting {
                event_id: entry.event_id,
                news_ids: entry.news_ids.clone(),
                confidence: entry.confidence,
                merged_regions,
            });
        }

        for entry in &result.new_events {
            decisions.push(AssignmentDecision::ToNew {
                new_event: self.new_event_from_proposal(entry, news_by_id),
                news_ids: entry.news_ids.clone(),
                confidence: entry.confidence,
            });
        }

        decisions
    }

    fn new_event_from_proposal(
        &self,
        proposal: &NewEventProposal,
        news_by_id: &HashMap<i64, NewsItem>,
    ) -> Event {
        let cities = city_tokens_for(&proposal.news_ids, news_by_id);
        let mut additions: Vec<&str> = cities.iter().map(|s| s.as_str()).collect();
        if !proposal.region.trim().is_empty() {
            additions.push(proposal.region.as_str());
        }
        let regions = aggr_regions::merge("", &additions);

        let news_times: Vec<chrono::DateTime<Utc>> = proposal
            .news_ids
            .iter()
            .filter_map(|id| news_by_id.get(id))
            .map(|n| n.first_seen_at)
            .collect();
        let now = Utc::now();
        let first_news_time = news_times.iter().min().copied().unwrap_or(now);
        let last_news_time = news_times.iter().max().copied().unwrap_or(now);

        Event {
            id: 0, // assigned by the store on insert
            title: proposal.title.clone(),
            description: proposal.summary.clone(),
            event_type: proposal.event_type.clone(),
            sentiment: proposal.sentiment,
            entities: "{}".to_string(),
            regions,
            keywords: proposal.tags.join(","),
            confidence: proposal.confidence,
            news_count: 0, // recomputed by the store from persisted relations
            first_news_time,
            last_news_time,
            status: EventStatus::Active,
            created_at: now,
            updated_at: now,
        }
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
            task_type: TaskType::Aggregation,
            task_id: uuid::Uuid::new_v4().to_string(),
            start_time,
            end_time: Utc::now(),
            status,
            total,
            success,
            failed,
            error_message: None,
            config_snapshot: serde_json::json!({
                "context_event_limit": self.config.context_event_limit,
                "source_types": self.config.source_types,
                "excluded_news_types": self.config.excluded_news_types,
                "dispatcher_batch_size": self.dispatcher.batch_size(),
            }),
        };
        self.store.write_log(&log).await
    }
}

fn city_tokens_for(news_ids: &[i64], news_by_id: &HashMap<i64, NewsItem>) -> Vec<String> {
    news_ids
        .iter()
        .filter_map(|id| news_by_id.get(id))
        .flat_map(|n| n.city_tokens())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggr_domain::TimeWindow;
    use aggr_llm::{CompletionResponse, DispatcherConfig};
    use aggr_store_postgres::InMemoryStore;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

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

    fn news(id: i64) -> NewsItem {
        NewsItem {
            id,
            source_type: "baidu".into(),
            title: format!("headline {id}"),
            body: "body".into(),
            city_name: Some("Beijing".into()),
            first_seen_at: Utc::now(),
            url: None,
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
    async fn empty_news_list_returns_zero_success_without_calling_llm() {
        let store = InMemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient {
            response: "{}".into(),
        };
        let dispatcher = Dispatcher::new(client, dispatcher_config(dir.path()));
        let cache = aggr_cache::Cache::new();
        let engine =
            AggregationEngine::new(&store, &dispatcher, &cache, AggregationEngineConfig::default());

        let summary = engine.run(None).await.unwrap();
        assert_eq!(summary.total_news, 0);
        assert_eq!(summary.processed_count, 0);
        assert!(summary.warnings.is_empty());
    }

    #[tokio::test]
    async fn new_event_proposal_is_persisted_with_merged_regions() {
        let store = InMemoryStore::new();
        store.seed_news(vec![news(1)]);

        let response = r#"{"existing_events":[],"new_events":[{"news_ids":[1],"title":"Fire downtown","summary":"s","event_type":"disaster","region":"Chaoyang","tags":["fire"],"confidence":0.9,"priority":"high","sentiment":"negative"}]}"#;
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient {
            response: response.into(),
        };
        let dispatcher = Dispatcher::new(client, dispatcher_config(dir.path()));
        let cache = aggr_cache::Cache::new();
        let engine =
            AggregationEngine::new(&store, &dispatcher, &cache, AggregationEngineConfig::default());

        let summary = engine.run(None).await.unwrap();
        assert_eq!(summary.processed_count, 1);
        assert_eq!(summary.failed_count, 0);

        let created = store.event(1).expect("new event should be persisted with id 1");
        assert_eq!(created.title, "Fire downtown");
        assert!(created.regions.contains("Beijing"));
        assert!(created.regions.contains("Chaoyang"));
    }

    #[tokio::test]
    async fn unresolved_news_is_reported_as_failed() {
        let store = InMemoryStore::new();
        store.seed_news(vec![news(1), news(2)]);

        // LLM only ever answers for id=1, regardless of batch size.
        let response = r#"{"existing_events":[],"new_events":[{"news_ids":[1],"title":"t","summary":"s","event_type":"e","region":"","tags":[],"confidence":0.9,"priority":"","sentiment":"neutral"}]}"#;
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient {
            response: response.into(),
        };
        let dispatcher = Dispatcher::new(client, dispatcher_config(dir.path()));
        let cache = aggr_cache::Cache::new();
        let engine =
            AggregationEngine::new(&store, &dispatcher, &cache, AggregationEngineConfig::default());

        let summary = engine.run(None).await.unwrap();
        assert_eq!(summary.processed_count, 1);
        assert_eq!(summary.failed_count, 1);
        assert_eq!(summary.failed_ids, vec![2]);
    }

    #[tokio::test]
    async fn window_scoped_run_only_selects_news_in_window() {
        let store = InMemoryStore::new();
        let old_news = NewsItem {
            first_seen_at: Utc::now() - ChronoDuration::days(5),
            ..news(1)
        };
        store.seed_news(vec![old_news, news(2)]);

        let response = r#"{"existing_events":[],"new_events":[{"news_ids":[2],"title":"t","summary":"s","event_type":"e","region":"","tags":[],"confidence":0.9,"priority":"","sentiment":"neutral"}]}"#;
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient {
            response: response.into(),
        };
        let dispatcher = Dispatcher::new(client, dispatcher_config(dir.path()));
        let cache = aggr_cache::Cache::new();
        let engine =
            AggregationEngine::new(&store, &dispatcher, &cache, AggregationEngineConfig::default());

        let window = TimeWindow {
            start: Utc::now() - ChronoDuration::hours(1),
            end: Utc::now() + ChronoDuration::hours(1),
        };
        let summary = engine.run(Some(window)).await.unwrap();
        assert_eq!(summary.total_news, 1);
        assert_eq!(summary.processed_count, 1);
    }
}
