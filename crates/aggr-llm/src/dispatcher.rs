//! LLM Dispatcher (`spec.md` §4.4).
//!
//! Turns news batches into validated JSON responses, bounded in
//! concurrency, robust to transient errors, optionally replayable. The
//! worker pool is a bounded set of spawned tasks gated by a counting
//! `tokio::sync::Semaphore` — the redesign called for in §9 ("express
//! as a bounded worker pool ... fixed set of workers"), not an ad-hoc
//! semaphore sprinkled through caller code.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use aggr_domain::{Event, NewsItem};
use aggr_prompts::format_aggregation_prompt;

use crate::client::LlmClient;
use crate::repair::parse_repaired;
use crate::replay::{
    write_call_log, AttemptRecord, CallLogRecord, CallLogRequest, CallLogResponse, ReplayCache,
    TokenUsage,
};
use crate::retry::{backoff, RetryConfig};
use crate::types::AggregationResult;
use crate::validator::{validate_and_fix, ValidationOutcome};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// `LLM_BATCH_SIZE`
    pub batch_size: usize,
    /// `LLM_MAX_CONCURRENT`
    pub max_concurrent: usize,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub retry: RetryConfig,
    /// Debug-mode replay cache toggle.
    pub debug_replay: bool,
    /// Directory for per-call JSON artefacts and the replay cache.
    pub llm_calls_dir: PathBuf,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrent: 3,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            max_tokens: 4096,
            retry: RetryConfig::default(),
            debug_replay: false,
            llm_calls_dir: PathBuf::from("llm_calls"),
        }
    }
}

/// Outcome of validating one LLM-answered batch, carried all the way
/// back to the Aggregation Engine so it can persist the valid subset
/// even when the batch was only partially successful.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub news_ids: Vec<i64>,
    pub validation: ValidationOutcome,
    /// Set when the response could not be parsed as JSON even after the
    /// repair pass; `validation` is a synthetic all-missing outcome in
    /// that case, kept so callers can still report every news id as
    /// failed without special-casing this branch.
    pub unparseable: bool,
}

pub struct Dispatcher<C: LlmClient> {
    client: Arc<C>,
    config: DispatcherConfig,
    replay_cache: Option<ReplayCache>,
}

impl<C: LlmClient + 'static> Dispatcher<C> {
    pub fn new(client: C, config: DispatcherConfig) -> Self {
        let replay_cache = if config.debug_replay {
            Some(ReplayCache::new(config.llm_calls_dir.join("replay")))
        } else {
            None
        };
        Self {
            client: Arc::new(client),
            config,
            replay_cache,
        }
    }

    /// Configured batch size, exposed so a caller doing its own
    /// straggler recovery (e.g. the Aggregation Engine's post-persist
    /// pass) can halve it the same way the dispatcher halves its own.
    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// One completion with retry, observability logging, and optional
    /// replay-cache short-circuit (`spec.md` §4.4). Returns `None` only
    /// when the retry budget is exhausted or the provider returns
    /// nothing usable — callers treat that as "this unit needs
    /// re-dispatch", never as silent success.
    #[instrument(skip(self, prompt), fields(model = %self.config.model))]
    pub async fn call_single(&self, prompt: &str, template_hash: &str) -> Option<String> {
        let model = self.config.model.clone();
        let temperature = self.config.temperature;
        let max_tokens = self.config.max_tokens;

        if let Some(cache) = &self.replay_cache {
            if let Some(cached) = cache.lookup(prompt, &model, temperature, max_tokens).await {
                info!("replay cache hit, skipping LLM call");
                return Some(cached);
            }
        }

        let call_id = Uuid::new_v4();
        let mut attempts = Vec::new();
        let mut last_text: Option<String> = None;
        let mut last_usage = TokenUsage::default();
        let mut success = false;

        for attempt in 0..self.config.retry.attempts {
            let started_at = chrono::Utc::now();
            let started = Instant::now();
            let outcome = self
                .client
                .complete(prompt, &model, temperature, max_tokens)
                .await;
            let duration = started.elapsed();

            match outcome {
                Ok(response) => {
                    attempts.push(AttemptRecord {
                        attempt_no: attempt + 1,
                        started_at,
                        duration_ms: duration.as_millis() as u64,
                        outcome: "success".to_string(),
                    });
                    last_usage = TokenUsage {
                        prompt_tokens: response.prompt_tokens,
                        completion_tokens: response.completion_tokens,
                    };
                    last_text = Some(response.text);
                    success = true;
                    break;
                }
                Err(err) => {
                    attempts.push(AttemptRecord {
                        attempt_no: attempt + 1,
                        started_at,
                        duration_ms: duration.as_millis() as u64,
                        outcome: err.to_string(),
                    });
                    if !err.is_transient() {
                        warn!(error = %err, "non-retryable LLM error");
                        break;
                    }
                    if attempt + 1 < self.config.retry.attempts {
                        tokio::time::sleep(backoff(&self.config.retry, attempt)).await;
                    }
                }
            }
        }

        if !self.config.debug_replay {
            let record = CallLogRecord {
                call_id,
                request: CallLogRequest {
                    prompt: prompt.to_string(),
                    model: model.clone(),
                    temperature,
                    max_tokens,
                    template_hash: template_hash.to_string(),
                },
                response: CallLogResponse {
                    raw_text: last_text.clone(),
                    parsed_ok: last_text.is_some(),
                },
                attempts,
                token_usage: last_usage,
                success,
            };
            if let Err(e) = write_call_log(&self.config.llm_calls_dir, &record).await {
                warn!(error = %e, "failed to write LLM call log artefact");
            }
        }

        if let (Some(cache), Some(text)) = (&self.replay_cache, &last_text) {
            if let Err(e) = cache.save(prompt, &model, temperature, max_tokens, text).await {
                warn!(error = %e, "failed to write replay cache entry");
            }
        }

        last_text
    }

    /// Render the aggregation prompt, call the LLM, parse (with
    /// repair), validate, and return the outcome plus any news items
    /// the response omitted. Always returns `Some(outcome)` when the
    /// batch is non-empty and the provider answered at all, even if
    /// the answer was only partially valid, so the caller can persist
    /// the valid subset (`spec.md` §4.4/§4.5).
    pub async fn process_batch(
        &self,
        news_batch: &[NewsItem],
        context_events: &[Event],
        known_event_ids: &HashSet<i64>,
    ) -> (Option<BatchOutcome>, Vec<NewsItem>) {
        if news_batch.is_empty() {
            return (None, Vec::new());
        }

        let prompt = format_aggregation_prompt(news_batch, context_events);
        let template_hash = aggr_prompts::aggregation_prompt_hash();
        let Some(raw) = self.call_single(&prompt, &template_hash).await else {
            return (None, news_batch.to_vec());
        };

        let parsed: AggregationResult = match parse_repaired(&raw) {
            Ok(v) => v,
            Err(reason) => {
                warn!(reason, "LLM aggregation response unparseable even after repair");
                let mut news_ids: Vec<i64> = news_batch.iter().map(|n| n.id).collect();
                news_ids.sort_unstable();
                let validation = ValidationOutcome {
                    is_valid: false,
                    fixed_result: AggregationResult::default(),
                    missing_news: news_ids.clone(),
                    extra_ids: Vec::new(),
                    dropped_unknown_events: Vec::new(),
                    duplicate_news_ids: Vec::new(),
                    message: reason,
                };
                let outcome = BatchOutcome {
                    news_ids,
                    validation,
                    unparseable: true,
                };
                return (Some(outcome), news_batch.to_vec());
            }
        };

        let input_ids: HashSet<i64> = news_batch.iter().map(|n| n.id).collect();
        let validation = validate_and_fix(&input_ids, &parsed, Some(known_event_ids));

        let missing_items: Vec<NewsItem> = news_batch
            .iter()
            .filter(|n| validation.missing_news.contains(&n.id))
            .cloned()
            .collect();

        let outcome = BatchOutcome {
            news_ids: news_batch.iter().map(|n| n.id).collect(),
            validation,
            unparseable: false,
        };

        (Some(outcome), missing_items)
    }

    /// Split `news_list` into batches of `batch_size`, run up to
    /// `max_concurrent` in flight, and re-enqueue stragglers from any
    /// partial batch at half batch size. Straggler retry recurses at
    /// most once (`spec.md` §4.4, §8 "Straggler bound").
    pub async fn process_news_concurrent(
        &self,
        news_list: Vec<NewsItem>,
        context_events: &[Event],
        known_event_ids: &HashSet<i64>,
        cancel: CancellationToken,
    ) -> (Vec<BatchOutcome>, Vec<i64>) {
        if news_list.is_empty() {
            return (Vec::new(), Vec::new());
        }

        let batches = chunk(news_list, self.config.batch_size);
        let (mut successes, missing_first_pass) = self
            .run_batches(batches, context_events, known_event_ids, cancel.clone())
            .await;

        if missing_first_pass.is_empty() || cancel.is_cancelled() {
            return (
                successes,
                missing_first_pass.iter().map(|n| n.id).collect(),
            );
        }

        let half_batch = (self.config.batch_size / 2).max(1);
        info!(
            stragglers = missing_first_pass.len(),
            half_batch, "re-dispatching stragglers at half batch size"
        );
        let straggler_batches = chunk(missing_first_pass, half_batch);
        let (straggler_successes, residual) = self
            .run_batches(straggler_batches, context_events, known_event_ids, cancel)
            .await;

        successes.extend(straggler_successes);
        (successes, residual.into_iter().map(|n| n.id).collect())
    }

    async fn run_batches(
        &self,
        batches: Vec<Vec<NewsItem>>,
        context_events: &[Event],
        known_event_ids: &HashSet<i64>,
        cancel: CancellationToken,
    ) -> (Vec<BatchOutcome>, Vec<NewsItem>) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut handles = Vec::with_capacity(batches.len());

        for batch in batches {
            if cancel.is_cancelled() {
                break;
            }
            let semaphore = Arc::clone(&semaphore);
            let client = Arc::clone(&self.client);
            let config = self.config.clone();
            let context_events = context_events.to_vec();
            let known_event_ids = known_event_ids.clone();
            let cancel = cancel.clone();
            let replay_cache = self
                .config
                .debug_replay
                .then(|| ReplayCache::new(self.config.llm_calls_dir.join("replay")));

            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (None, batch),
                };
                if cancel.is_cancelled() {
                    return (None, batch);
                }
                let worker = Dispatcher {
                    client,
                    config,
                    replay_cache,
                };
                worker
                    .process_batch(&batch, &context_events, &known_event_ids)
                    .await
            }));
        }

        let mut successes = Vec::new();
        let mut missing = Vec::new();
        for handle in handles {
            match handle.await {
                Ok((outcome, batch_missing)) => {
                    if let Some(o) = outcome {
                        successes.push(o);
                    }
                    missing.extend(batch_missing);
                }
                Err(e) => warn!(error = %e, "batch worker task panicked"),
            }
        }

        (successes, missing)
    }
}

fn chunk<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut out = Vec::new();
    let mut current = Vec::with_capacity(size);
    for item in items {
        current.push(item);
        if current.len() == size {
            out.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::CompletionResponse;
    use crate::error::{LlmError, Result as LlmResult};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedClient {
        responses: Mutex<Vec<LlmResult<CompletionResponse>>>,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(responses: Vec<LlmResult<CompletionResponse>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }

        fn ok(text: &str) -> LlmResult<CompletionResponse> {
            Ok(CompletionResponse {
                text: text.to_string(),
                prompt_tokens: Some(10),
                completion_tokens: Some(5),
            })
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn complete(
            &self,
            _prompt: &str,
            _model: &str,
            _temperature: f32,
            _max_tokens: u32,
        ) -> LlmResult<CompletionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(LlmError::EmptyResponse);
            }
            responses.remove(0)
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

    fn test_config(dir: &std::path::Path) -> DispatcherConfig {
        DispatcherConfig {
            batch_size: 10,
            max_concurrent: 2,
            model: "test-model".into(),
            temperature: 0.0,
            max_tokens: 100,
            retry: RetryConfig {
                attempts: 2,
                base_wait: Duration::from_millis(1),
                max_wait: Duration::from_millis(2),
            },
            debug_replay: false,
            llm_calls_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn call_single_returns_text_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient::new(vec![ScriptedClient::ok(r#"{"a":1}"#)]);
        let dispatcher = Dispatcher::new(client, test_config(dir.path()));
        let result = dispatcher.call_single("prompt", "hash").await;
        assert_eq!(result.as_deref(), Some(r#"{"a":1}"#));
    }

    #[tokio::test]
    async fn call_single_returns_none_after_retry_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient::new(vec![Err(LlmError::Timeout), Err(LlmError::Timeout)]);
        let dispatcher = Dispatcher::new(client, test_config(dir.path()));
        let result = dispatcher.call_single("prompt", "hash").await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn process_batch_reports_missing_on_partial_response() {
        let dir = tempfile::tempdir().unwrap();
        let response = r#"{"existing_events":[],"new_events":[{"news_ids":[1],"title":"t","summary":"s","event_type":"e","region":"","tags":[],"confidence":0.9,"priority":"","sentiment":"neutral"}]}"#;
        let client = ScriptedClient::new(vec![ScriptedClient::ok(response)]);
        let dispatcher = Dispatcher::new(client, test_config(dir.path()));

        let (outcome, missing) = dispatcher
            .process_batch(&[news(1), news(2)], &[], &HashSet::new())
            .await;

        let outcome = outcome.unwrap();
        assert!(!outcome.validation.is_valid);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].id, 2);
    }

    #[tokio::test]
    async fn process_news_concurrent_resolves_stragglers() {
        let dir = tempfile::tempdir().unwrap();
        // First pass: batch of 2 returns only id=1. Straggler pass (half
        // batch = 1): batch of just id=2 returns id=2.
        let first = r#"{"existing_events":[],"new_events":[{"news_ids":[1],"title":"t","summary":"s","event_type":"e","region":"","tags":[],"confidence":0.9,"priority":"","sentiment":"neutral"}]}"#;
        let second = r#"{"existing_events":[],"new_events":[{"news_ids":[2],"title":"t2","summary":"s2","event_type":"e","region":"","tags":[],"confidence":0.9,"priority":"","sentiment":"neutral"}]}"#;
        let client = ScriptedClient::new(vec![
            ScriptedClient::ok(first),
            ScriptedClient::ok(second),
        ]);
        let mut config = test_config(dir.path());
        config.batch_size = 2;
        let dispatcher = Dispatcher::new(client, config);

        let (successes, residual) = dispatcher
            .process_news_concurrent(
                vec![news(1), news(2)],
                &[],
                &HashSet::new(),
                CancellationToken::new(),
            )
            .await;

        assert!(residual.is_empty());
        assert_eq!(successes.len(), 2);
    }

    #[test]
    fn chunk_splits_into_equal_sized_groups() {
        let chunks = chunk(vec![1, 2, 3, 4, 5], 2);
        assert_eq!(chunks, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }
}
