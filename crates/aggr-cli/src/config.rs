//! Configuration loaded from the environment (`spec.md` §6), the same
//! way `server::config::Config::from_env` loads the server's.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub openai_api_key: String,

    pub aggregation_model: String,
    pub aggregation_temperature: f32,
    pub aggregation_max_tokens: u32,

    pub llm_batch_size: usize,
    pub llm_max_concurrent: usize,
    pub llm_retry_times: u32,

    pub recent_events_count: usize,
    /// Recognised but not consumed by any engine in this build; carried
    /// through so operators can set it ahead of a future labeling job.
    pub event_summary_days: u32,
    /// News whose `source_type` is in this set is never selected for
    /// aggregation, even if unprocessed (`EXCLUDED_NEWS_TYPES`).
    pub excluded_news_types: Vec<String>,

    pub event_combine_count: usize,
    pub event_combine_confidence_threshold: f32,
    pub event_combine_model: String,

    pub llm_calls_dir: PathBuf,
    pub debug_replay: bool,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{key} must be a valid value: {e}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            openai_api_key: std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY must be set")?,

            aggregation_model: env_or("EVENT_AGGREGATION_MODEL", "gpt-4o-mini"),
            aggregation_temperature: parse_env("EVENT_AGGREGATION_TEMPERATURE", 0.2)?,
            aggregation_max_tokens: parse_env("EVENT_AGGREGATION_MAX_TOKENS", 4096)?,

            llm_batch_size: parse_env("LLM_BATCH_SIZE", 10)?,
            llm_max_concurrent: parse_env("LLM_MAX_CONCURRENT", 3)?,
            llm_retry_times: parse_env("LLM_RETRY_TIMES", 3)?,

            recent_events_count: parse_env("RECENT_EVENTS_COUNT", 50)?,
            event_summary_days: parse_env("EVENT_SUMMARY_DAYS", 7)?,
            excluded_news_types: env_list("EXCLUDED_NEWS_TYPES"),

            event_combine_count: parse_env("EVENT_COMBINE_COUNT", 30)?,
            event_combine_confidence_threshold: parse_env(
                "EVENT_COMBINE_CONFIDENCE_THRESHOLD",
                0.75,
            )?,
            event_combine_model: env_or("EVENT_COMBINE_MODEL", "gpt-4o-mini"),

            llm_calls_dir: PathBuf::from(env_or("LLM_CALLS_DIR", "llm_calls")),
            debug_replay: parse_env("LLM_DEBUG_REPLAY", false)?,
        })
    }

    pub fn retry_config(&self) -> aggr_llm::RetryConfig {
        aggr_llm::RetryConfig {
            attempts: self.llm_retry_times,
            base_wait: Duration::from_secs(2),
            max_wait: Duration::from_secs(30),
        }
    }

    pub fn dispatcher_config(&self) -> aggr_llm::DispatcherConfig {
        aggr_llm::DispatcherConfig {
            batch_size: self.llm_batch_size,
            max_concurrent: self.llm_max_concurrent,
            model: self.aggregation_model.clone(),
            temperature: self.aggregation_temperature,
            max_tokens: self.aggregation_max_tokens,
            retry: self.retry_config(),
            debug_replay: self.debug_replay,
            llm_calls_dir: self.llm_calls_dir.clone(),
        }
    }

    /// Same dispatch tuning as [`Config::dispatcher_config`], but with
    /// `EVENT_COMBINE_MODEL` in place of the aggregation model, for the
    /// Merge Engine's single batch-merge call.
    pub fn merge_dispatcher_config(&self) -> aggr_llm::DispatcherConfig {
        aggr_llm::DispatcherConfig {
            model: self.event_combine_model.clone(),
            ..self.dispatcher_config()
        }
    }
}
