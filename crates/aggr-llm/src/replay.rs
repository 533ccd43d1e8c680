//! Debug replay cache and per-call artefact logging (`spec.md` §4.4,
//! §6, §9).
//!
//! Two independent, optional layers wrapped *around* [`crate::client::LlmClient`]
//! rather than baked into it, per the redesign note in §9 ("retain the
//! behaviour but treat it as an optional layer/decorator"):
//!
//! - [`ReplayCache`]: when debug mode is on, hashes `(prompt, model,
//!   temperature, max_tokens)` and returns a saved response instead of
//!   contacting the LLM on a repeat request.
//! - [`write_call_log`]: when replay is off, every call writes a
//!   structured JSON artefact under `llm_calls/` for offline replay and
//!   post-mortem.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use uuid::Uuid;

fn request_hash(prompt: &str, model: &str, temperature: f32, max_tokens: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(model.as_bytes());
    hasher.update(temperature.to_bits().to_le_bytes());
    hasher.update(max_tokens.to_le_bytes());
    hex::encode(hasher.finalize())
}

/// On-disk request/response replay cache, active only in debug mode.
pub struct ReplayCache {
    dir: PathBuf,
}

impl ReplayCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}.json"))
    }

    /// Look up a previously saved response for this exact request.
    pub async fn lookup(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Option<String> {
        let hash = request_hash(prompt, model, temperature, max_tokens);
        let path = self.path_for(&hash);
        let bytes = tokio::fs::read(&path).await.ok()?;
        let saved: SavedResponse = serde_json::from_slice(&bytes).ok()?;
        Some(saved.response)
    }

    /// Save a response for future replay.
    pub async fn save(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
        max_tokens: u32,
        response: &str,
    ) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let hash = request_hash(prompt, model, temperature, max_tokens);
        let path = self.path_for(&hash);
        let saved = SavedResponse {
            response: response.to_string(),
        };
        let bytes = serde_json::to_vec_pretty(&saved).unwrap_or_default();
        tokio::fs::write(path, bytes).await
    }
}

#[derive(Serialize, Deserialize)]
struct SavedResponse {
    response: String,
}

/// One retry attempt's outcome, for the per-call artefact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_no: u32,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub duration_ms: u64,
    pub outcome: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLogRequest {
    pub prompt: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Hash of the prompt *template* this call rendered from
    /// (`aggr_prompts::aggregation_prompt_hash`/`batch_merge_prompt_hash`),
    /// so an artefact can be matched to the template version that
    /// produced it even after the template text changes.
    pub template_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLogResponse {
    pub raw_text: Option<String>,
    pub parsed_ok: bool,
}

/// The full structured artefact persisted per LLM call, one file under
/// `llm_calls/<yyyy-mm-dd>/<call_id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLogRecord {
    pub call_id: Uuid,
    pub request: CallLogRequest,
    pub response: CallLogResponse,
    pub attempts: Vec<AttemptRecord>,
    pub token_usage: TokenUsage,
    pub success: bool,
}

/// Write a call log record under `dir/<yyyy-mm-dd>/<call_id>.json`.
pub async fn write_call_log(dir: &Path, record: &CallLogRecord) -> std::io::Result<()> {
    let date_dir = dir.join(chrono::Utc::now().format("%Y-%m-%d").to_string());
    tokio::fs::create_dir_all(&date_dir).await?;
    let path = date_dir.join(format!("{}.json", record.call_id));
    let bytes = serde_json::to_vec_pretty(record).unwrap_or_default();
    tokio::fs::write(path, bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replay_cache_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ReplayCache::new(dir.path());

        assert!(cache.lookup("p", "m", 0.5, 100).await.is_none());

        cache.save("p", "m", 0.5, 100, "the response").await.unwrap();

        let hit = cache.lookup("p", "m", 0.5, 100).await;
        assert_eq!(hit.as_deref(), Some("the response"));
    }

    #[tokio::test]
    async fn replay_cache_distinguishes_requests() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ReplayCache::new(dir.path());
        cache.save("p", "m", 0.5, 100, "r1").await.unwrap();

        assert!(cache.lookup("p", "m", 0.7, 100).await.is_none());
    }

    #[tokio::test]
    async fn call_log_is_written_under_dated_directory() {
        let dir = tempfile::tempdir().unwrap();
        let record = CallLogRecord {
            call_id: Uuid::new_v4(),
            request: CallLogRequest {
                prompt: "p".into(),
                model: "m".into(),
                temperature: 0.0,
                max_tokens: 10,
                template_hash: "hash".into(),
            },
            response: CallLogResponse {
                raw_text: Some("{}".into()),
                parsed_ok: true,
            },
            attempts: vec![],
            token_usage: TokenUsage::default(),
            success: true,
        };
        write_call_log(dir.path(), &record).await.unwrap();

        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let expected = dir.path().join(today).join(format!("{}.json", record.call_id));
        assert!(expected.exists());
    }
}
