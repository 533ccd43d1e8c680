//! Cache (`spec.md` §4.1).
//!
//! A keyed, TTL'd, in-memory store for recent-event snapshots and LLM
//! results. Follows the same shape as
//! `extraction::stores::memory::MemoryStore`: a `std::sync::RwLock`
//! over a `HashMap`, safe to share behind an `Arc` across the worker
//! pool. The cache is advisory — every caller must tolerate a miss and
//! must not rely on it for correctness (`spec.md` §4.1, §5). A remote
//! keyed store (Redis, as the original Python service used) would
//! satisfy the same trait-free contract; this crate only ships the
//! in-memory implementation the spec calls for.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// TTL for `recent_events:<days>` entries.
pub const RECENT_EVENTS_TTL: Duration = Duration::from_secs(60 * 60);

/// TTL for `llm_result:<hash>` entries.
pub const LLM_RESULT_TTL: Duration = Duration::from_secs(2 * 60 * 60);

pub fn recent_events_key(days: u32) -> String {
    format!("recent_events:{days}")
}

pub fn llm_result_key(news_id_hash: &str) -> String {
    format!("llm_result:{news_id_hash}")
}

struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// In-memory key -> (value, expires_at) store with lazy eviction.
pub struct Cache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Store `value` under `key` with the given time-to-live.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let Ok(json) = serde_json::to_value(value) else {
            tracing::warn!(key, "cache value failed to serialize, skipping set");
            return;
        };
        self.entries.write().unwrap().insert(
            key.to_string(),
            Entry {
                value: json,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Fetch and deserialize the value at `key`. Expired entries are
    /// evicted on access and treated as absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        {
            let entries = self.entries.read().unwrap();
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => {
                    return serde_json::from_value(entry.value.clone()).ok();
                }
                Some(_) => { /* expired: fall through to evict below */ }
                None => return None,
            }
        }
        self.entries.write().unwrap().remove(key);
        None
    }

    pub fn delete(&self, key: &str) {
        self.entries.write().unwrap().remove(key);
    }

    /// Delete every key starting with `prefix`.
    pub fn clear_prefix(&self, prefix: &str) {
        self.entries
            .write()
            .unwrap()
            .retain(|k, _| !k.starts_with(prefix));
    }

    /// Number of live (possibly-expired-but-not-yet-evicted) entries.
    /// Test/diagnostic helper, not part of the cache contract.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let cache = Cache::new();
        cache.set("k", &42u32, Duration::from_secs(60));
        assert_eq!(cache.get::<u32>("k"), Some(42));
    }

    #[test]
    fn missing_key_is_none() {
        let cache = Cache::new();
        assert_eq!(cache.get::<u32>("absent"), None);
    }

    #[test]
    fn expired_entry_is_evicted_lazily() {
        let cache = Cache::new();
        cache.set("k", &"v".to_string(), Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get::<String>("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn delete_removes_key() {
        let cache = Cache::new();
        cache.set("k", &1u32, Duration::from_secs(60));
        cache.delete("k");
        assert_eq!(cache.get::<u32>("k"), None);
    }

    #[test]
    fn clear_prefix_removes_matching_keys_only() {
        let cache = Cache::new();
        cache.set(&recent_events_key(7), &"a".to_string(), RECENT_EVENTS_TTL);
        cache.set(&llm_result_key("abc"), &"b".to_string(), LLM_RESULT_TTL);
        cache.clear_prefix("recent_events:");
        assert_eq!(cache.get::<String>(&recent_events_key(7)), None);
        assert_eq!(
            cache.get::<String>(&llm_result_key("abc")),
            Some("b".to_string())
        );
    }
}
